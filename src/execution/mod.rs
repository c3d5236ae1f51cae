//! 统一执行层
//!
//! 四种触发（交互、调度、扇出子任务、Recipe 调用）都先归一为 [`ExecutionRequest`]，
//! 由 [`UnifiedExecutor`] 走同一条管线：解析 Recipe → 取 Agent 并挂扩展 → 运行 → 校验重试 → 写回会话。

pub mod executor;
pub mod request;
pub mod result;
pub mod retry;

use thiserror::Error;

use crate::core::{AgentError, ErrorKind};
use crate::extensions::ExtensionError;
use crate::llm::LlmError;
use crate::recipe::RecipeError;
use crate::session::SessionStoreError;

pub use executor::UnifiedExecutor;
pub use request::{ExecutionMode, ExecutionRequest, RecipeSource};
pub use result::{ExecutionResult, ExecutionStatus};
pub use retry::{FinalOutcome, RetryEngine};

#[derive(Error, Debug)]
pub enum ExecutionError {
    #[error(transparent)]
    Recipe(#[from] RecipeError),

    #[error(transparent)]
    Store(#[from] SessionStoreError),

    #[error("Agent unavailable: {0}")]
    AgentUnavailable(AgentError),

    #[error("Extension unavailable: {0}")]
    Extension(ExtensionError),

    #[error("Provider unavailable: {0}")]
    Provider(LlmError),
}

impl ExecutionError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            ExecutionError::Recipe(e) => e.kind(),
            ExecutionError::Store(e) => e.kind(),
            ExecutionError::AgentUnavailable(e) => e.kind(),
            ExecutionError::Extension(e) => e.kind(),
            ExecutionError::Provider(e) => e.kind(),
        }
    }
}
