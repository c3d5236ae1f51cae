//! Agent 隔离与单实例

mod common;

use std::path::Path;
use std::sync::Arc;

use apiary::session::{SessionSeed, SessionType};
use futures_util::future::join_all;

#[tokio::test]
async fn disabling_extension_on_one_session_leaves_others_alone() {
    let dir = tempfile::tempdir().unwrap();
    let rt = common::runtime(dir.path());
    let a = rt.start_session(None).await.unwrap();
    let b = rt.start_session(None).await.unwrap();

    let before: Vec<String> = rt.list_tools(&b.id).await.unwrap().into_iter().map(|t| t.name).collect();
    assert!(before.contains(&"echo__echo".to_string()));

    rt.disable_extension(&a.id, "echo").await.unwrap();
    let a_tools = rt.list_tools(&a.id).await.unwrap();
    assert!(a_tools.iter().all(|t| t.name != "echo__echo"));

    let after: Vec<String> = rt.list_tools(&b.id).await.unwrap().into_iter().map(|t| t.name).collect();
    assert_eq!(before, after);
}

#[tokio::test]
async fn concurrent_get_or_create_yields_one_agent() {
    let dir = tempfile::tempdir().unwrap();
    let rt = common::runtime(dir.path());
    let sessions = rt.executor().sessions();
    sessions
        .get_or_create("shared", SessionSeed::new(Path::new(dir.path()), SessionType::User))
        .await
        .unwrap();

    let agents = rt.executor().agents();
    let results = join_all((0..16).map(|_| agents.get_or_create("shared"))).await;
    let agents_out: Vec<_> = results.into_iter().map(|r| r.unwrap()).collect();
    assert!(agents_out.iter().all(|a| Arc::ptr_eq(a, &agents_out[0])));

    let metrics = rt.agent_metrics().await;
    assert_eq!(metrics.agents_created, 1);
    assert_eq!(metrics.live_agents, 1);
}

#[tokio::test]
async fn interactive_turns_accumulate_in_one_session() {
    let dir = tempfile::tempdir().unwrap();
    let rt = common::runtime(dir.path());
    let session = rt.start_session(None).await.unwrap();

    let first = rt.reply(&session.id, "hello").await.unwrap();
    assert_eq!(first.output.as_deref(), Some("done: hello"));
    rt.reply(&session.id, "again").await.unwrap();

    let stored = rt.get_session(&session.id).await.unwrap();
    assert_eq!(stored.message_count(), 4);
    assert_eq!(stored.description, "hello");
}
