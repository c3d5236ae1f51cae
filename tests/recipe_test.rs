//! Recipe 运行：重试上限、失败记录、深链接

mod common;

use apiary::core::ErrorKind;
use apiary::execution::{ExecutionMode, ExecutionRequest, ExecutionStatus, RecipeSource};
use apiary::recipe::deeplink;
use apiary::recipe::Recipe;
use apiary::session::new_session_id;

#[tokio::test]
async fn always_failing_check_runs_three_attempts() {
    let dir = tempfile::tempdir().unwrap();
    let marker = dir.path().join("cleanup.log");
    let yaml = format!(
        r#"
title: Flaky
prompt: "build it"
retry:
  max_retries: 2
  checks:
    - type: shell
      command: "exit 1"
  on_failure: "echo cleaned >> {}"
  timeout_seconds: 5
"#,
        marker.display()
    );
    common::write_recipe(dir.path(), "flaky", &yaml);
    let rt = common::runtime(dir.path());

    let session_id = new_session_id();
    let req = ExecutionRequest::new(&session_id, RecipeSource::file("flaky"), ExecutionMode::Interactive);
    let result = rt.execute(req).await.unwrap();

    assert_eq!(result.status, ExecutionStatus::Failed);
    assert_eq!(result.attempts, 3);
    assert!(result.error.as_deref().unwrap().contains("exited with 1"));
    assert_eq!(std::fs::read_to_string(&marker).unwrap().lines().count(), 3);

    // 失败原因留在会话里，用户可见
    let session = rt.get_session(&session_id).await.unwrap();
    assert!(session.failure.is_some());
    let last = session.messages.last().unwrap();
    assert!(last.text().starts_with("Run failed:"));
    assert!(last.metadata.user_visible);
    assert!(!last.metadata.agent_visible);
}

#[tokio::test]
async fn missing_recipe_is_a_resolution_error() {
    let dir = tempfile::tempdir().unwrap();
    let rt = common::runtime(dir.path());
    let req = ExecutionRequest::new("s", RecipeSource::file("nowhere"), ExecutionMode::Interactive);
    let err = rt.execute(req).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Resolution);
    assert!(rt.list_sessions().await.unwrap().is_empty());
}

#[test]
fn deeplink_round_trip_keeps_every_field() {
    let yaml = r#"
version: 1.2.0
title: Release notes
description: Draft release notes from git history
instructions: Read the log and group changes by area.
prompt: "Draft notes for {{ tag }}"
parameters:
  - key: tag
    input_type: string
    requirement: user_prompt
    description: release tag
extensions:
  - type: builtin
    name: developer
    timeout: 60
activities:
  - Summarize the last release
settings:
  model: gpt-4o
  temperature: 0.2
response:
  json_schema:
    type: object
    required: [notes]
retry:
  max_retries: 1
  checks:
    - type: shell
      command: test -f NOTES.md
"#;
    let recipe: Recipe = serde_yaml::from_str(yaml).unwrap();
    let link = deeplink::encode(&recipe).unwrap();
    assert!(link.starts_with("apiary://recipe?config="));
    assert_eq!(deeplink::decode(&link).unwrap(), recipe);

    let token = link.trim_start_matches("apiary://recipe?config=");
    assert_eq!(deeplink::decode(token).unwrap(), recipe);
}
