//! Decomposition properties through the public planner API.

use std::sync::Arc;
use std::time::Duration;

use devpilot::ai::{AiClient, Purpose};
use devpilot::config::{AiConfig, PlannerConfig};
use devpilot::core::TaskStatus;
use devpilot::planning::{PatternRegistry, TaskDecomposer};
use devpilot::Error;

use crate::fixtures::*;

fn decomposer(reply: &str) -> TaskDecomposer {
    let ai = ScriptedAi::new().reply(Purpose::Decompose, reply);
    let client = AiClient::new(Arc::new(ai), &AiConfig::default());
    TaskDecomposer::new(client, Arc::new(PatternRegistry::new(None)), PlannerConfig::default())
}

const LINEAR: &str = r#"{"subtasks":[
  {"id":"a","description":"Add the model","type":"code","estimatedMinutes":30,"files":["src/model.rs"]},
  {"id":"b","description":"Add the handler","type":"code","dependsOn":["a"],"estimatedMinutes":20,"files":["src/handler.rs"]},
  {"id":"c","description":"Test the handler","type":"test","dependsOn":["b"],"estimatedMinutes":10}
]}"#;

const DIAMOND: &str = r#"[
  {"id":"schema","description":"Define the schema","type":"code","estimatedMinutes":30},
  {"id":"api","description":"Expose the API","type":"code","dependsOn":["schema"],"estimatedMinutes":40},
  {"id":"ui","description":"Render the list","type":"code","dependsOn":["schema"],"estimatedMinutes":20},
  {"id":"e2e","description":"Test the flow","type":"test","dependsOn":["api","ui"],"estimatedMinutes":10}
]"#;

#[tokio::test]
async fn test_linear_chain_has_no_parallelism() {
    let d = decomposer(LINEAR).decompose_task("Add an orders endpoint").await.unwrap();
    assert_eq!(d.tracks.len(), 3);
    assert_eq!(d.plan.critical_path, vec!["a", "b", "c"]);
    assert_eq!(d.plan.critical_path_minutes, 60);
    assert_eq!(d.plan.parallelization_factor, 1.0);
}

#[tokio::test]
async fn test_dependencies_only_reference_earlier_subtasks() {
    for reply in [LINEAR, DIAMOND] {
        let d = decomposer(reply).decompose_task("Build the feature").await.unwrap();
        for (i, subtask) in d.subtasks.iter().enumerate() {
            for dep in &subtask.depends_on {
                assert!(
                    d.subtasks[..i].iter().any(|s| &s.id == dep),
                    "{} depends on later or unknown {}",
                    subtask.id,
                    dep
                );
            }
        }
    }
}

#[tokio::test]
async fn test_diamond_runs_middle_in_parallel() {
    let d = decomposer(DIAMOND).decompose_task("Add a product list").await.unwrap();
    assert_eq!(d.tracks.len(), 3);
    let middle: Vec<&str> = d.tracks[1].subtask_ids.iter().map(String::as_str).collect();
    assert_eq!(middle, vec!["api", "ui"]);
    assert_eq!(d.plan.critical_path, vec!["schema", "api", "e2e"]);
    assert_eq!(d.plan.critical_path_minutes, 80);
    assert!((d.plan.parallelization_factor - 100.0 / 80.0).abs() < 1e-9);
}

#[tokio::test]
async fn test_forward_dependency_is_rejected() {
    let reply = r#"[
      {"id":"a","description":"First","type":"code","dependsOn":["b"],"estimatedMinutes":5},
      {"id":"b","description":"Second","type":"code","estimatedMinutes":5}
    ]"#;
    let err = decomposer(reply).decompose_task("Do it").await.unwrap_err();
    assert!(matches!(err, Error::AiGeneration(_)));
}

#[tokio::test]
async fn test_plan_without_code_is_blocked_by_gates() {
    let repo = TestRepo::new();
    let ai = ScriptedAi::new().reply(
        Purpose::Decompose,
        r#"[{"id":"d1","description":"Write the changelog","type":"doc","estimatedMinutes":15}]"#,
    );
    let harness = Harness::new(&repo, ai);
    let orch = &harness.orchestrator;

    let task = orch.submit("alice", "Update the changelog", false).await.unwrap();
    let task = orch.wait_until_settled(task.id, Duration::from_secs(10)).await.unwrap();
    assert_eq!(task.status, TaskStatus::Failed);
    assert!(task.error.unwrap().starts_with("Quality gates blocked the plan"));
    assert!(!task.decomposition.unwrap().quality_gates.passed());
    assert_eq!(harness.ai.calls(Purpose::Generate), 0);
}
