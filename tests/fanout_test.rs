//! 子任务扇出：提交顺序、串行阻塞、写回父会话

mod common;

use apiary::conversation::Role;
use apiary::tasks::{DispatchMode, Task, TaskStatus};

#[tokio::test]
async fn parallel_results_keep_submission_order() {
    let dir = tempfile::tempdir().unwrap();
    let rt = common::runtime(dir.path());
    let parent = rt.start_session(None).await.unwrap();

    // T2 最先完成，其次 T3，T1 最后
    let tasks = vec![
        Task::instructions("first 400", ["echo"]),
        Task::instructions("second 50", ["echo"]),
        Task::instructions("third 200", ["echo"]),
    ];
    let results = rt
        .dispatch_tasks(&parent.id, tasks, DispatchMode::Parallel)
        .await
        .unwrap();

    let outputs: Vec<&str> = results.iter().map(|r| r.output.as_deref().unwrap()).collect();
    assert_eq!(outputs, vec!["done: first 400", "done: second 50", "done: third 200"]);
    assert!(results.iter().all(|r| r.status == TaskStatus::Completed));
    for r in &results {
        assert!(r.session_id.starts_with(&format!("{}__task_", parent.id)));
    }

    let stored = rt.get_session(&parent.id).await.unwrap();
    assert_eq!(stored.message_count(), 1);
    let turn = &stored.messages[0];
    assert_eq!(turn.role, Role::Assistant);
    assert_eq!(turn.content.len(), 3);
}

#[tokio::test]
async fn sub_task_sessions_only_get_granted_extensions() {
    let dir = tempfile::tempdir().unwrap();
    let rt = common::runtime(dir.path());
    let parent = rt.start_session(None).await.unwrap();

    let results = rt
        .dispatch_tasks(
            &parent.id,
            vec![Task::instructions("look around", Vec::<String>::new())],
            DispatchMode::Sequential,
        )
        .await
        .unwrap();
    let child = &results[0].session_id;
    let tools = rt.list_tools(child).await.unwrap();
    assert!(tools.is_empty());
}

#[tokio::test]
async fn unknown_parent_is_not_found() {
    let dir = tempfile::tempdir().unwrap();
    let rt = common::runtime(dir.path());
    let err = rt
        .dispatch_tasks("missing", vec![Task::instructions("x", ["echo"])], DispatchMode::Parallel)
        .await
        .unwrap_err();
    assert_eq!(err.kind(), apiary::core::ErrorKind::NotFound);
}
