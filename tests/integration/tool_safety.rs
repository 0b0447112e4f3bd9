//! Tool layer guarantees observed from outside the crate.

use std::time::Duration;

use devpilot::config::ToolsConfig;
use devpilot::tools::RiskClass;
use devpilot::Error;

use crate::fixtures::*;

/// Scenario: destructive SQL in production is refused before it reaches the
/// database, and the refusal is audited as a failure.
#[tokio::test]
async fn test_production_drop_is_blocked_and_audited() {
    let repo = TestRepo::new();
    let dev = tools(
        &repo.path,
        ToolsConfig {
            database_path: Some("app.db".into()),
            ..Default::default()
        },
    );
    dev.query_database("CREATE TABLE users (id INTEGER PRIMARY KEY, name TEXT)")
        .await
        .unwrap();
    dev.query_database("INSERT INTO users (name) VALUES ('ada')").await.unwrap();

    let prod = tools(
        &repo.path,
        ToolsConfig {
            database_path: Some("app.db".into()),
            production: true,
            ..Default::default()
        },
    );
    let err = prod.query_database("DROP TABLE users").await.unwrap_err();
    assert!(matches!(err, Error::DestructiveOperationBlocked { .. }));
    assert!(err.is_security());

    let entry = prod.audit().last().unwrap();
    assert_eq!(entry.operation, "query_database");
    assert_eq!(entry.risk, RiskClass::Database);
    assert!(!entry.success);
    assert!(entry.error.unwrap().contains("blocked"));

    let rows = prod.query_database("SELECT name FROM users").await.unwrap();
    assert_eq!(rows.rows.len(), 1, "table survived the blocked statement");
}

/// Scenario: `rm -rf /` never spawns a process.
#[tokio::test]
async fn test_root_delete_never_spawns() {
    let repo = TestRepo::new();
    let executor = tools(&repo.path, ToolsConfig::default());

    for command in ["rm -rf /", "echo ok && rm -rf /", "rm -rf ~", "sudo ls"] {
        let err = executor.execute_command(command, None).await.unwrap_err();
        assert!(
            matches!(err, Error::DestructiveOperationBlocked { .. }),
            "{} was not blocked: {:?}",
            command,
            err
        );
    }
    assert_eq!(executor.commands_spawned(), 0);
    assert_eq!(executor.audit().failures().len(), 4);

    let ok = executor.execute_command("echo ok", None).await.unwrap();
    assert!(ok.success());
    assert_eq!(executor.commands_spawned(), 1);
}

#[tokio::test]
async fn test_command_timeout_kills_process() {
    let repo = TestRepo::new();
    let executor = tools(&repo.path, ToolsConfig::default());
    let err = executor
        .execute_command("sleep 5", Some(Duration::from_millis(200)))
        .await
        .unwrap_err();
    assert!(matches!(err, Error::Timeout(_)));
}

/// Scenario: creating a branch twice names the branch in the error.
#[tokio::test]
async fn test_duplicate_branch_is_reported() {
    let repo = TestRepo::new();
    let executor = tools(&repo.path, ToolsConfig::default());

    executor.create_branch("devpilot/feature").await.unwrap();
    let err = executor.create_branch("devpilot/feature").await.unwrap_err();
    match err {
        Error::BranchExists(name) => assert_eq!(name, "devpilot/feature"),
        other => panic!("expected BranchExists, got {:?}", other),
    }
}

#[tokio::test]
async fn test_traversal_never_touches_filesystem() {
    let repo = TestRepo::new();
    let executor = tools(&repo.path, ToolsConfig::default());

    for path in ["../../etc/passwd", "/etc/passwd", "src/../../outside.txt", "%2e%2e/%2e%2e/etc/passwd"] {
        let err = executor.read_file(path).await.unwrap_err();
        assert!(matches!(err, Error::PathSecurity { .. }), "{} was not rejected", path);
    }
    let err = executor.write_file("../escape.txt", "x").await.unwrap_err();
    assert!(matches!(err, Error::PathSecurity { .. }));
    assert!(!repo.path.parent().unwrap().join("escape.txt").exists());
    assert_eq!(executor.audit().failures().len(), 5);
}

#[tokio::test]
async fn test_rate_limit_window() {
    let repo = TestRepo::new();
    let executor = tools(
        &repo.path,
        ToolsConfig {
            rate_limit: 3,
            rate_window_secs: 1,
            ..Default::default()
        },
    );

    for _ in 0..3 {
        executor.read_file("README.md").await.unwrap();
    }
    let err = executor.read_file("README.md").await.unwrap_err();
    match err {
        Error::RateLimitExceeded { limit, remaining, .. } => {
            assert_eq!(limit, 3);
            assert_eq!(remaining, 0);
        }
        other => panic!("expected RateLimitExceeded, got {:?}", other),
    }
    assert!(!executor.audit().last().unwrap().success);

    tokio::time::sleep(Duration::from_millis(1100)).await;
    assert_eq!(executor.read_file("README.md").await.unwrap(), "# Test Repository\n");
}
