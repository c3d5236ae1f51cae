//! 扇出派发
//!
//! 每个任务变成一个 SubTask 模式的 ExecutionRequest，扩展只取任务自己的白名单。
//! 并行模式受工作池限制，结果按提交顺序返回；串行模式按顺序执行，blocking 任务失败后跳过其余任务。

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::conversation::{Message, MessageContent, Role};
use crate::core::WorkerPool;
use crate::execution::{ExecutionMode, ExecutionRequest, ExecutionStatus, UnifiedExecutor};
use crate::extensions::ExtensionScope;
use crate::session::{SessionStatus, SessionStoreError};
use crate::tasks::{DispatchMode, Task, TaskError, TaskResult, TaskRunner, TaskStatus};

const CANCEL_GRACE: Duration = Duration::from_secs(5);

pub struct TaskDispatcher {
    executor: Arc<UnifiedExecutor>,
    pool: WorkerPool,
    task_timeout: Duration,
}

/// 子任务会话 id：`<parent>__task_<n>_<8 hex>`
fn child_session_id(parent: &str, n: usize) -> String {
    let suffix = uuid::Uuid::new_v4().simple().to_string();
    format!("{parent}__task_{n}_{}", &suffix[..8])
}

fn skipped(task_id: String, session_id: String, reason: Option<&str>) -> TaskResult {
    TaskResult {
        task_id,
        session_id,
        status: TaskStatus::Skipped,
        output: None,
        error: reason.map(str::to_string),
    }
}

fn failed(task_id: String, session_id: String, error: String) -> TaskResult {
    TaskResult {
        task_id,
        session_id,
        status: TaskStatus::Failed,
        output: None,
        error: Some(error),
    }
}

#[allow(clippy::too_many_arguments)]
async fn run_task(
    executor: &UnifiedExecutor,
    parent: &str,
    working_dir: Option<PathBuf>,
    task_id: String,
    session_id: String,
    task: Task,
    limit: Duration,
    cancel: &CancellationToken,
) -> TaskResult {
    let mut req = ExecutionRequest::new(&session_id, task.source, ExecutionMode::SubTask)
        .with_scope(ExtensionScope::new(task.extensions))
        .with_parent(parent);
    if let Some(dir) = working_dir {
        req = req.with_working_dir(dir);
    }
    let token = cancel.child_token();
    tracing::info!(task_id = %task_id, session_id = %session_id, "sub-task started");

    let run = executor.execute_with_token(req, token.clone());
    tokio::pin!(run);
    let outcome = match tokio::time::timeout(limit, &mut run).await {
        Ok(outcome) => Ok(outcome),
        Err(_) => {
            // 先让运行观察到取消并收尾，再记下超时原因
            token.cancel();
            if tokio::time::timeout(CANCEL_GRACE, &mut run).await.is_err() {
                tracing::warn!(task_id = %task_id, session_id = %session_id, "sub-task ignored cancellation");
            }
            Err(format!("timed out after {limit:?}"))
        }
    };
    let result = match outcome {
        Err(reason) => {
            if let Err(e) = executor
                .sessions()
                .set_status(&session_id, SessionStatus::Failed, Some(reason.clone()))
                .await
            {
                tracing::warn!(session_id = %session_id, error = %e, "failed to record sub-task timeout");
            }
            failed(task_id, session_id, reason)
        }
        Ok(Err(e)) => failed(task_id, session_id, e.to_string()),
        Ok(Ok(r)) => match r.status {
            ExecutionStatus::Completed => TaskResult {
                task_id,
                session_id,
                status: TaskStatus::Completed,
                output: r.output,
                error: None,
            },
            ExecutionStatus::Failed => failed(
                task_id,
                session_id,
                r.error.unwrap_or_else(|| "run failed".to_string()),
            ),
            ExecutionStatus::Cancelled => skipped(task_id, session_id, Some("cancelled")),
        },
    };
    tracing::info!(task_id = %result.task_id, status = ?result.status, "sub-task finished");
    result
}

impl TaskDispatcher {
    pub fn new(executor: Arc<UnifiedExecutor>, pool: WorkerPool, task_timeout: Duration) -> Self {
        Self {
            executor,
            pool,
            task_timeout,
        }
    }

    pub fn pool(&self) -> &WorkerPool {
        &self.pool
    }

    /// 结果与 tasks 一一对应，顺序与提交顺序一致
    pub async fn dispatch(
        &self,
        parent_session_id: &str,
        tasks: Vec<Task>,
        mode: DispatchMode,
        cancel: &CancellationToken,
    ) -> Vec<TaskResult> {
        let working_dir = self
            .executor
            .sessions()
            .get(parent_session_id)
            .await
            .ok()
            .map(|s| s.working_dir);
        tracing::info!(
            session_id = %parent_session_id,
            count = tasks.len(),
            mode = ?mode,
            "dispatching tasks"
        );
        match mode {
            DispatchMode::Parallel => self.parallel(parent_session_id, working_dir, tasks, cancel).await,
            DispatchMode::Sequential => self.sequential(parent_session_id, working_dir, tasks, cancel).await,
        }
    }

    async fn parallel(
        &self,
        parent: &str,
        working_dir: Option<PathBuf>,
        tasks: Vec<Task>,
        cancel: &CancellationToken,
    ) -> Vec<TaskResult> {
        let mut handles = Vec::with_capacity(tasks.len());
        for (i, task) in tasks.into_iter().enumerate() {
            let task_id = format!("task_{}", i + 1);
            let session_id = child_session_id(parent, i + 1);
            let executor = Arc::clone(&self.executor);
            let pool = self.pool.clone();
            let cancel = cancel.clone();
            let parent = parent.to_string();
            let working_dir = working_dir.clone();
            let limit = self.task_timeout;
            let (tid, sid) = (task_id.clone(), session_id.clone());
            let handle = tokio::spawn(async move {
                let Some(_permit) = pool.acquire(&cancel).await else {
                    return skipped(tid, sid, Some("cancelled"));
                };
                run_task(&executor, &parent, working_dir, tid, sid, task, limit, &cancel).await
            });
            handles.push((task_id, session_id, handle));
        }

        let mut results = Vec::with_capacity(handles.len());
        for (task_id, session_id, handle) in handles {
            match handle.await {
                Ok(result) => results.push(result),
                Err(e) => results.push(failed(task_id, session_id, format!("task panicked: {e}"))),
            }
        }
        results
    }

    async fn sequential(
        &self,
        parent: &str,
        working_dir: Option<PathBuf>,
        tasks: Vec<Task>,
        cancel: &CancellationToken,
    ) -> Vec<TaskResult> {
        let mut results = Vec::with_capacity(tasks.len());
        let mut blocked = false;
        for (i, task) in tasks.into_iter().enumerate() {
            let task_id = format!("task_{}", i + 1);
            let session_id = child_session_id(parent, i + 1);
            if blocked {
                results.push(skipped(task_id, session_id, None));
                continue;
            }
            let Some(_permit) = self.pool.acquire(cancel).await else {
                results.push(skipped(task_id, session_id, Some("cancelled")));
                continue;
            };
            let blocking = task.blocking;
            let result = run_task(
                &self.executor,
                parent,
                working_dir.clone(),
                task_id,
                session_id,
                task,
                self.task_timeout,
                cancel,
            )
            .await;
            if blocking && !result.is_success() {
                tracing::warn!(task_id = %result.task_id, "blocking task failed, skipping the rest");
                blocked = true;
            }
            results.push(result);
        }
        results
    }

    /// 外部派发：结果作为一轮 assistant 消息写回父会话
    pub async fn dispatch_for_parent(
        &self,
        parent_session_id: &str,
        tasks: Vec<Task>,
        mode: DispatchMode,
    ) -> Result<Vec<TaskResult>, TaskError> {
        match self.executor.sessions().get(parent_session_id).await {
            Ok(_) => {}
            Err(SessionStoreError::NotFound(_)) => {
                return Err(TaskError::ParentNotFound(parent_session_id.to_string()))
            }
            Err(e) => return Err(TaskError::Execution(e.into())),
        }
        let cancel = self.executor.supervisor().root_token().child_token();
        let results = self.dispatch(parent_session_id, tasks, mode, &cancel).await;

        let turn = Message::new(
            Role::Assistant,
            results
                .iter()
                .map(|r| MessageContent::Text { text: r.summary_line() })
                .collect(),
        );
        self.executor.append_turn(parent_session_id, vec![turn]).await?;
        Ok(results)
    }
}

#[async_trait]
impl TaskRunner for TaskDispatcher {
    async fn run_tasks(
        &self,
        parent_session_id: &str,
        tasks: Vec<Task>,
        mode: DispatchMode,
        cancel: &CancellationToken,
    ) -> Vec<TaskResult> {
        self.dispatch(parent_session_id, tasks, mode, cancel).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::conversation::last_user_text;
    use crate::execution::executor::test_support::executor_with;
    use crate::llm::{MockLlmClient, MockReply};
    use crate::session::{SessionSeed, SessionStore, SessionType};

    /// 用户文本里的数字是毫秒延迟；"fail" 触发终止性错误
    fn timed_mock() -> MockLlmClient {
        MockLlmClient::with_handler(|_, messages| {
            let text = last_user_text(messages).unwrap_or_default();
            if text.contains("fail") {
                return MockReply::error(crate::llm::LlmError::ContentPolicy("refused".into()));
            }
            let ms: u64 = text
                .split_whitespace()
                .find_map(|w| w.parse().ok())
                .unwrap_or(0);
            MockReply::text(format!("done: {text}")).with_delay(Duration::from_millis(ms))
        })
    }

    async fn dispatcher() -> (TaskDispatcher, tempfile::TempDir) {
        let (exec, dir) = executor_with(timed_mock);
        exec.sessions()
            .get_or_create("parent", SessionSeed::new(dir.path(), SessionType::User))
            .await
            .unwrap();
        (
            TaskDispatcher::new(Arc::new(exec), WorkerPool::new(4), Duration::from_secs(5)),
            dir,
        )
    }

    #[tokio::test]
    async fn test_parallel_keeps_submission_order() {
        let (d, _dir) = dispatcher().await;
        let tasks = vec![
            Task::instructions("t1 150", Vec::<String>::new()),
            Task::instructions("t2 10", Vec::<String>::new()),
            Task::instructions("t3 60", Vec::<String>::new()),
        ];
        let results = d
            .dispatch("parent", tasks, DispatchMode::Parallel, &CancellationToken::new())
            .await;
        let outputs: Vec<_> = results.iter().map(|r| r.output.clone().unwrap()).collect();
        assert_eq!(outputs, vec!["done: t1 150", "done: t2 10", "done: t3 60"]);
        assert!(results[0].session_id.starts_with("parent__task_1_"));

        let child = d.executor.sessions().get(&results[1].session_id).await.unwrap();
        assert_eq!(child.session_type, SessionType::SubAgent);
        assert_eq!(child.parent_session_id.as_deref(), Some("parent"));
    }

    #[tokio::test]
    async fn test_sequential_collects_failures_and_blocks() {
        let (d, _dir) = dispatcher().await;
        let tasks = vec![
            Task::instructions("a", Vec::<String>::new()),
            Task::instructions("b fail", Vec::<String>::new()),
            Task::instructions("c", Vec::<String>::new()),
            Task::instructions("d fail", Vec::<String>::new()).blocking(),
            Task::instructions("e", Vec::<String>::new()),
        ];
        let results = d
            .dispatch("parent", tasks, DispatchMode::Sequential, &CancellationToken::new())
            .await;
        let statuses: Vec<_> = results.iter().map(|r| r.status).collect();
        assert_eq!(
            statuses,
            vec![
                TaskStatus::Completed,
                TaskStatus::Failed,
                TaskStatus::Completed,
                TaskStatus::Failed,
                TaskStatus::Skipped,
            ]
        );
    }

    #[tokio::test]
    async fn test_timeout_marks_failed() {
        let (exec, dir) = executor_with(timed_mock);
        exec.sessions()
            .get_or_create("parent", SessionSeed::new(dir.path(), SessionType::User))
            .await
            .unwrap();
        let d = TaskDispatcher::new(Arc::new(exec), WorkerPool::new(2), Duration::from_millis(50));
        let results = d
            .dispatch(
                "parent",
                vec![Task::instructions("slow 2000", Vec::<String>::new())],
                DispatchMode::Parallel,
                &CancellationToken::new(),
            )
            .await;
        assert_eq!(results[0].status, TaskStatus::Failed);
        assert_eq!(results[0].error.as_deref(), Some("timed out after 50ms"));

        let child = d.executor.sessions().get(&results[0].session_id).await.unwrap();
        assert_eq!(child.status, crate::session::SessionStatus::Failed);
        assert_eq!(child.failure.as_deref(), Some("timed out after 50ms"));
        assert_eq!(child.message_count(), 0);
    }

    #[tokio::test]
    async fn test_dispatch_for_parent_appends_one_turn() {
        let (d, _dir) = dispatcher().await;
        let results = d
            .dispatch_for_parent(
                "parent",
                vec![
                    Task::instructions("x", Vec::<String>::new()),
                    Task::instructions("y fail", Vec::<String>::new()),
                ],
                DispatchMode::Parallel,
            )
            .await
            .unwrap();
        assert_eq!(results.len(), 2);
        let parent = d.executor.sessions().get("parent").await.unwrap();
        assert_eq!(parent.message_count(), 1);
        assert_eq!(parent.messages[0].content.len(), 2);
        assert!(parent.messages[0].text().contains("[task_1] completed"));

        let err = d
            .dispatch_for_parent("ghost", vec![], DispatchMode::Parallel)
            .await
            .unwrap_err();
        assert!(matches!(err, TaskError::ParentNotFound(_)));
    }
}
