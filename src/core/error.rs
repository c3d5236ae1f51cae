//! 错误分类与 Agent 错误类型
//!
//! ErrorKind 是跨模块统一的错误类别（解析失败 / 前置条件 / 瞬时 / 校验 / 冲突 / 不存在 / 取消）；
//! 各层错误枚举通过 `kind()` 映射到这里，HTTP 层与调度层据此决定状态码与记录方式。
//! AgentError 与 RecoveryEngine 配合：根据错误决定 RetryWithPrompt / RetryAfter / Abort。

use std::time::Duration;

use serde::Serialize;
use thiserror::Error;

use crate::extensions::ExtensionError;
use crate::llm::LlmError;

/// 统一错误类别
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Recipe 缺失、格式错误、参数不全
    Resolution,
    /// 能力不可用、Agent 未初始化等前置条件不满足
    Precondition,
    /// 超时、限流、连接中断，可重试
    Transient,
    /// 成功检查未通过、输出不符合 schema
    Validation,
    /// 调度任务正在运行、ID 重复等状态冲突
    Conflict,
    NotFound,
    Cancelled,
    Internal,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::Resolution => "resolution",
            ErrorKind::Precondition => "precondition",
            ErrorKind::Transient => "transient",
            ErrorKind::Validation => "validation",
            ErrorKind::Conflict => "conflict",
            ErrorKind::NotFound => "not_found",
            ErrorKind::Cancelled => "cancelled",
            ErrorKind::Internal => "internal",
        }
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Agent 构造与运行过程中可能出现的错误
#[derive(Error, Debug)]
pub enum AgentError {
    #[error("Agent creation failed: {0}")]
    Creation(String),

    #[error("No live agent for session {0}")]
    NotInitialized(String),

    #[error(transparent)]
    Extension(#[from] ExtensionError),

    #[error("Provider error: {0}")]
    Provider(#[from] LlmError),

    #[error("JSON parse error: {0}")]
    JsonParseError(String),

    #[error("Tool execution failed: {0}")]
    ToolExecutionFailed(String),

    #[error("Tool timeout: {0}")]
    ToolTimeout(String),

    #[error("Hallucinated tool: {0}")]
    HallucinatedTool(String),

    #[error("Tool call denied: {0}")]
    ToolDenied(String),

    #[error("Path escape attempt: {0}")]
    PathEscape(String),

    #[error("Response does not match the required schema: {0}")]
    SchemaMismatch(String),

    #[error("Reached {0} steps without a final response")]
    MaxTurnsReached(usize),

    #[error("Cancelled")]
    Cancelled,
}

impl AgentError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            AgentError::Creation(_) | AgentError::NotInitialized(_) => ErrorKind::Precondition,
            AgentError::Extension(e) => e.kind(),
            AgentError::Provider(e) => e.kind(),
            AgentError::JsonParseError(_)
            | AgentError::SchemaMismatch(_)
            | AgentError::MaxTurnsReached(_) => ErrorKind::Validation,
            AgentError::ToolExecutionFailed(_)
            | AgentError::HallucinatedTool(_)
            | AgentError::ToolDenied(_)
            | AgentError::PathEscape(_) => ErrorKind::Internal,
            AgentError::ToolTimeout(_) => ErrorKind::Transient,
            AgentError::Cancelled => ErrorKind::Cancelled,
        }
    }
}

/// 恢复引擎根据错误类型给出的建议动作
#[derive(Debug, Clone)]
pub enum RecoveryAction {
    /// 将提示注入下一轮（仅 Agent 可见），让 LLM 重试
    RetryWithPrompt(String),
    /// 等待后重新调用 Provider（瞬时错误）
    RetryAfter(Duration),
    /// 终止当前回复
    Abort,
}
