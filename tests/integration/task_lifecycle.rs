//! End-to-end task lifecycle: plan, generate, validate, approve, roll back.

use std::sync::Arc;
use std::time::Duration;

use devpilot::ai::{AiClient, Purpose};
use devpilot::config::{AiConfig, Config, ValidatorConfig};
use devpilot::core::{FileAction, TaskStatus};
use devpilot::{Error, Orchestrator};

use crate::fixtures::*;

const SETTLE: Duration = Duration::from_secs(10);

fn health_check_ai() -> ScriptedAi {
    ScriptedAi::new()
        .reply(Purpose::Decompose, plan_for("server/health.ts"))
        .reply(Purpose::Generate, file_reply("server/health.ts", HEALTH_TS))
}

/// Scenario: "Add a health check endpoint" stops at the approval gate with
/// one clean created file and nothing written yet.
#[tokio::test]
async fn test_health_check_reaches_approval() {
    let repo = TestRepo::new();
    let harness = Harness::new(&repo, health_check_ai());
    let orch = &harness.orchestrator;

    let task = orch.submit("alice", "Add a health check endpoint", false).await.unwrap();
    assert_eq!(task.status, TaskStatus::Pending);

    let task = orch.wait_until_settled(task.id, SETTLE).await.unwrap();
    assert_eq!(task.status, TaskStatus::AwaitingApproval, "error: {:?}", task.error);

    let decomposition = task.decomposition.as_ref().unwrap();
    assert!(decomposition.subtasks.iter().any(|s| s.kind.produces_files()));
    assert_eq!(task.generated_files.len(), 1);
    assert_eq!(task.generated_files[0].action(), FileAction::Create);
    assert_eq!(task.generated_files[0].path, "server/health.ts");

    let report = task.validation_report.as_ref().unwrap();
    assert!(report.safe);
    assert_eq!(report.total_errors, 0);
    assert_eq!(report.heal_attempts, 0);

    assert!(repo.read("server/health.ts").is_none(), "nothing is written before approval");
    assert_eq!(harness.ai.calls(Purpose::Heal), 0);
}

#[tokio::test]
async fn test_approve_commits_and_rollback_reverts() {
    let repo = TestRepo::new();
    let original = b"def version():\r\n    return \"1.0\"  # caf\xc3\xa9\r\n".to_vec();
    let base = repo.commit_bytes("pkg/version.py", &original, "Add version");

    let ai = ScriptedAi::new()
        .reply(Purpose::Decompose, plan_for("pkg/version.py"))
        .reply(Purpose::Generate, file_reply("pkg/version.py", "def version():\n    return \"2.0\"\n"));
    let harness = Harness::new(&repo, ai);
    let orch = &harness.orchestrator;

    let task = orch.submit("alice", "Bump the version to 2.0", false).await.unwrap();
    let task = orch.wait_until_settled(task.id, SETTLE).await.unwrap();
    assert_eq!(task.status, TaskStatus::AwaitingApproval, "error: {:?}", task.error);
    assert_eq!(task.generated_files[0].action(), FileAction::Modify);

    let applied = orch.approve(task.id, "alice").await.unwrap();
    assert_eq!(applied.status, TaskStatus::Completed);
    assert!(applied.snapshot_id.is_some());
    let commit = applied.commit.clone().unwrap();
    assert_eq!(repo.head(), commit);
    assert_eq!(repo.read("pkg/version.py").unwrap(), b"def version():\n    return \"2.0\"\n");

    let rolled_back = orch.rollback(task.id, "alice").await.unwrap();
    assert_eq!(rolled_back.status, TaskStatus::Completed);
    assert!(rolled_back.rolled_back_at.is_some());
    assert!(rolled_back.snapshot_id.is_none());
    assert_eq!(repo.read("pkg/version.py").unwrap(), original);
    assert_eq!(repo.head(), base);

    let again = orch.rollback(task.id, "alice").await.unwrap_err();
    assert!(matches!(again, Error::RollbackUnavailable(_)));
}

#[tokio::test]
async fn test_rollback_removes_created_files() {
    let repo = TestRepo::new();
    let harness = Harness::new(&repo, health_check_ai());
    let orch = &harness.orchestrator;

    let task = orch.submit("alice", "Add a health check endpoint", false).await.unwrap();
    orch.wait_until_settled(task.id, SETTLE).await.unwrap();
    orch.approve(task.id, "alice").await.unwrap();
    assert_eq!(repo.read("server/health.ts").unwrap(), HEALTH_TS.as_bytes());

    orch.rollback(task.id, "alice").await.unwrap();
    assert!(repo.read("server/health.ts").is_none());
    assert!(!repo.path.join("server").exists());
    assert_eq!(repo.read("README.md").unwrap(), b"# Test Repository\n");
}

#[tokio::test]
async fn test_approve_pending_is_conflict_and_leaves_task_alone() {
    let repo = TestRepo::new();
    let harness = Harness::new(&repo, health_check_ai().holding_decompose());
    let orch = &harness.orchestrator;

    let task = orch.submit("alice", "Add a health check endpoint", false).await.unwrap();
    harness.ai.entered.notified().await;
    let before = orch.get(task.id, "alice").await.unwrap();
    assert_eq!(before.status, TaskStatus::Decomposing);

    let err = orch.approve(task.id, "alice").await.unwrap_err();
    assert!(matches!(err, Error::ApprovalState { .. }));
    let err = orch.rollback(task.id, "alice").await.unwrap_err();
    assert!(matches!(err, Error::ApprovalState { .. }));

    let after = orch.get(task.id, "alice").await.unwrap();
    assert_eq!(after.status, before.status);
    assert_eq!(after.version, before.version);

    harness.ai.release.notify_one();
    let settled = orch.wait_until_settled(task.id, SETTLE).await.unwrap();
    assert_eq!(settled.status, TaskStatus::AwaitingApproval);
}

#[tokio::test]
async fn test_cancel_stops_pipeline() {
    let repo = TestRepo::new();
    let harness = Harness::new(&repo, health_check_ai().holding_decompose());
    let orch = &harness.orchestrator;

    let task = orch.submit("alice", "Add a health check endpoint", false).await.unwrap();
    harness.ai.entered.notified().await;

    let cancelled = orch.cancel(task.id, "alice").await.unwrap();
    assert_eq!(cancelled.status, TaskStatus::Failed);
    assert_eq!(cancelled.error.as_deref(), Some("Task cancelled"));

    harness.ai.release.notify_one();
    tokio::time::sleep(Duration::from_millis(100)).await;
    let task = orch.get(task.id, "alice").await.unwrap();
    assert_eq!(task.status, TaskStatus::Failed);
    assert_eq!(harness.ai.calls(Purpose::Generate), 0);

    let err = orch.cancel(task.id, "alice").await.unwrap_err();
    assert!(matches!(err, Error::ApprovalState { .. }));
}

#[tokio::test]
async fn test_auto_approve_applies_without_caller() {
    let repo = TestRepo::new();
    let harness = Harness::new(&repo, health_check_ai());
    let orch = &harness.orchestrator;

    let task = orch.submit("alice", "Add a health check endpoint", true).await.unwrap();
    let task = orch.wait_until_settled(task.id, SETTLE).await.unwrap();
    assert_eq!(task.status, TaskStatus::Completed, "error: {:?}", task.error);
    assert!(task.commit.is_some());
    assert_eq!(repo.read("server/health.ts").unwrap(), HEALTH_TS.as_bytes());
}

#[tokio::test]
async fn test_heal_fixes_broken_generation() {
    let repo = TestRepo::new();
    let broken = "export function healthCheck() {\n  return { status: \"ok\" };\n";
    let ai = ScriptedAi::new()
        .reply(Purpose::Decompose, plan_for("server/health.ts"))
        .reply(Purpose::Generate, file_reply("server/health.ts", broken))
        .reply(
            Purpose::Heal,
            serde_json::json!({ "patches": [{ "path": "server/health.ts", "content": HEALTH_TS }] }).to_string(),
        );
    let harness = Harness::new(&repo, ai);
    let orch = &harness.orchestrator;

    let task = orch.submit("alice", "Add a health check endpoint", false).await.unwrap();
    let task = orch.wait_until_settled(task.id, SETTLE).await.unwrap();
    assert_eq!(task.status, TaskStatus::AwaitingApproval, "error: {:?}", task.error);
    assert_eq!(task.validation_report.as_ref().unwrap().heal_attempts, 1);
    assert_eq!(task.generated_files[0].content(), HEALTH_TS);
}

#[tokio::test]
async fn test_unhealable_generation_escalates() {
    let repo = TestRepo::new();
    let broken = "export function healthCheck() {\n";
    let ai = ScriptedAi::new()
        .reply(Purpose::Decompose, plan_for("server/health.ts"))
        .reply(Purpose::Generate, file_reply("server/health.ts", broken))
        .reply(
            Purpose::Heal,
            serde_json::json!({ "patches": [{ "path": "server/health.ts", "content": broken }] }).to_string(),
        );
    let harness = Harness::new(&repo, ai);
    let orch = &harness.orchestrator;

    let task = orch.submit("alice", "Add a health check endpoint", false).await.unwrap();
    let task = orch.wait_until_settled(task.id, SETTLE).await.unwrap();
    assert_eq!(task.status, TaskStatus::Failed);
    assert!(task.error.unwrap().contains("Static analysis failed"));
    assert_eq!(harness.ai.calls(Purpose::Heal), 3);
    assert!(repo.read("server/health.ts").is_none());
}

fn with_tests(command: &str, verify_after_apply: bool) -> Config {
    let mut config = test_config();
    config.validator = ValidatorConfig {
        test_command: Some(command.into()),
        verify_after_apply,
        ..Default::default()
    };
    config
}

#[tokio::test]
async fn test_suite_runs_against_generated_files() {
    let repo = TestRepo::new();
    let harness = Harness::with_config(&repo, health_check_ai(), with_tests("test -f server/health.ts", false));
    let orch = &harness.orchestrator;

    let task = orch.submit("alice", "Add a health check endpoint", false).await.unwrap();
    let task = orch.wait_until_settled(task.id, SETTLE).await.unwrap();
    assert_eq!(task.status, TaskStatus::AwaitingApproval, "error: {:?}", task.error);

    let report = task.validation_report.as_ref().unwrap();
    assert!(report.safe);
    assert!(report.tests.success);
    assert!(!report.tests.skipped);
    assert_eq!(report.heal_attempts, 0);
    assert!(repo.read("server/health.ts").is_none());
    assert!(!repo.path.join(".devpilot").exists());
}

#[tokio::test]
async fn test_failing_suite_drives_healing() {
    let repo = TestRepo::new();
    let incomplete = "export function healthCheck(): { status: string } {\n  return { status: \"starting\" };\n}\n";
    let ai = ScriptedAi::new()
        .reply(Purpose::Decompose, plan_for("server/health.ts"))
        .reply(Purpose::Generate, file_reply("server/health.ts", incomplete))
        .reply(
            Purpose::Heal,
            serde_json::json!({ "patches": [{ "path": "server/health.ts", "content": HEALTH_TS }] }).to_string(),
        );
    let config = with_tests(r#"grep -q 'status: "ok"' server/health.ts"#, false);
    let harness = Harness::with_config(&repo, ai, config);
    let orch = &harness.orchestrator;

    let task = orch.submit("alice", "Add a health check endpoint", false).await.unwrap();
    let task = orch.wait_until_settled(task.id, SETTLE).await.unwrap();
    assert_eq!(task.status, TaskStatus::AwaitingApproval, "error: {:?}", task.error);

    let report = task.validation_report.as_ref().unwrap();
    assert!(report.tests.success);
    assert_eq!(report.heal_attempts, 1);
    assert_eq!(harness.ai.calls(Purpose::Heal), 1);
    assert_eq!(task.generated_files[0].content(), HEALTH_TS);
    assert!(repo.read("server/health.ts").is_none());
}

#[tokio::test]
async fn test_persistently_failing_suite_escalates() {
    let repo = TestRepo::new();
    let harness = Harness::with_config(&repo, health_check_ai(), with_tests("grep -q never server/health.ts", false));
    let orch = &harness.orchestrator;

    let task = orch.submit("alice", "Add a health check endpoint", false).await.unwrap();
    let task = orch.wait_until_settled(task.id, SETTLE).await.unwrap();
    assert_eq!(task.status, TaskStatus::Failed);
    assert!(task.error.unwrap().contains("Tests failed"));
    assert_eq!(harness.ai.calls(Purpose::Heal), 3);
    assert!(repo.read("server/health.ts").is_none());
}

#[tokio::test]
async fn test_failed_verification_rolls_back_apply() {
    let repo = TestRepo::new();
    let head = repo.head();
    let harness = Harness::with_config(&repo, health_check_ai(), with_tests("test ! -f BLOCKED", true));
    let orch = &harness.orchestrator;

    let task = orch.submit("alice", "Add a health check endpoint", false).await.unwrap();
    let task = orch.wait_until_settled(task.id, SETTLE).await.unwrap();
    assert_eq!(task.status, TaskStatus::AwaitingApproval, "error: {:?}", task.error);

    // The tree changes between validation and approval.
    std::fs::write(repo.path.join("BLOCKED"), "").unwrap();
    let err = orch.approve(task.id, "alice").await.unwrap_err();
    assert!(matches!(err, Error::TestFailure(_)));

    let task = orch.get(task.id, "alice").await.unwrap();
    assert_eq!(task.status, TaskStatus::Failed);
    assert!(task.error.unwrap().contains("rolled back"));
    assert!(repo.read("server/health.ts").is_none());
    assert_eq!(repo.head(), head);
}

#[tokio::test]
async fn test_resume_picks_up_after_restart() {
    let repo = TestRepo::new();
    let harness = Harness::new(&repo, health_check_ai().holding_decompose());
    let task = harness
        .orchestrator
        .submit("alice", "Add a health check endpoint", false)
        .await
        .unwrap();
    harness.ai.entered.notified().await;

    // A second process over the same state directory sees the task mid-flight.
    let config = test_config();
    let executor = Arc::new(tools(&repo.path, config.tools.clone()));
    let client = AiClient::new(Arc::new(health_check_ai()), &AiConfig::default());
    let restarted = Orchestrator::new(executor, client, &config, harness.state_dir.path());
    assert_eq!(restarted.resume_interrupted().await.unwrap(), 1);

    let settled = restarted.wait_until_settled(task.id, SETTLE).await.unwrap();
    assert_eq!(settled.status, TaskStatus::AwaitingApproval);
}
