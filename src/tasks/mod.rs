//! 任务扇出
//!
//! 一批任务（指令或内联 Recipe + 扩展白名单）按并行或串行方式，
//! 各自作为 SubTask 模式的执行请求交给统一执行器；结果按提交顺序返回。

pub mod fanout;

use async_trait::async_trait;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio_util::sync::CancellationToken;

use crate::core::ErrorKind;
use crate::execution::{ExecutionError, RecipeSource};
use crate::recipe::Recipe;

pub use fanout::TaskDispatcher;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema, Default)]
#[serde(rename_all = "snake_case")]
pub enum DispatchMode {
    #[default]
    Parallel,
    Sequential,
}

/// 一个临时任务；只存在于本次扇出期间
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    pub source: RecipeSource,
    /// 扩展白名单（可为空：不给任何扩展）
    #[serde(default)]
    pub extensions: Vec<String>,
    /// 串行模式下失败时跳过后续任务
    #[serde(default)]
    pub blocking: bool,
}

impl Task {
    pub fn instructions<I, S>(text: impl Into<String>, extensions: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            source: RecipeSource::text(text),
            extensions: extensions.into_iter().map(Into::into).collect(),
            blocking: false,
        }
    }

    pub fn recipe<I, S>(recipe: Recipe, extensions: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            source: RecipeSource::inline(recipe),
            extensions: extensions.into_iter().map(Into::into).collect(),
            blocking: false,
        }
    }

    pub fn blocking(mut self) -> Self {
        self.blocking = true;
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Completed,
    Failed,
    Skipped,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskResult {
    pub task_id: String,
    pub session_id: String,
    pub status: TaskStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl TaskResult {
    pub fn is_success(&self) -> bool {
        self.status == TaskStatus::Completed
    }

    /// 写回父会话时的一行文本
    pub fn summary_line(&self) -> String {
        match self.status {
            TaskStatus::Completed => format!(
                "[{}] completed: {}",
                self.task_id,
                self.output.as_deref().unwrap_or_default()
            ),
            TaskStatus::Failed => format!(
                "[{}] failed: {}",
                self.task_id,
                self.error.as_deref().unwrap_or("unknown error")
            ),
            TaskStatus::Skipped => format!("[{}] skipped", self.task_id),
        }
    }
}

#[derive(Error, Debug)]
pub enum TaskError {
    #[error("Parent session not found: {0}")]
    ParentNotFound(String),

    #[error(transparent)]
    Execution(#[from] ExecutionError),
}

impl TaskError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            TaskError::ParentNotFound(_) => ErrorKind::NotFound,
            TaskError::Execution(e) => e.kind(),
        }
    }
}

/// Agent 的平台工具通过它把子任务交给扇出
#[async_trait]
pub trait TaskRunner: Send + Sync {
    async fn run_tasks(
        &self,
        parent_session_id: &str,
        tasks: Vec<Task>,
        mode: DispatchMode,
        cancel: &CancellationToken,
    ) -> Vec<TaskResult>;
}
