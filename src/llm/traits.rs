//! LLM 客户端抽象
//!
//! 所有后端（OpenAI 兼容 / DeepSeek / Mock）实现 LlmClient：给定 system 与对话，返回一次完成及 token 用量。
//! LlmError 区分可重试的传输类错误与不可重试的终止类错误。

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::conversation::Message;
use crate::core::ErrorKind;

/// 单次调用的 token 用量
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Usage {
    pub input_tokens: u64,
    pub output_tokens: u64,
}

impl Usage {
    pub fn new(input_tokens: u64, output_tokens: u64) -> Self {
        Self {
            input_tokens,
            output_tokens,
        }
    }

    pub fn total(&self) -> u64 {
        self.input_tokens + self.output_tokens
    }

    pub fn add(&mut self, other: Usage) {
        self.input_tokens += other.input_tokens;
        self.output_tokens += other.output_tokens;
    }
}

/// 一次完成
#[derive(Debug, Clone)]
pub struct Completion {
    pub content: String,
    pub usage: Usage,
}

#[derive(Error, Debug, Clone, PartialEq)]
pub enum LlmError {
    #[error("Request timed out")]
    Timeout,

    #[error("Rate limited, retry after {retry_after_ms}ms")]
    RateLimited { retry_after_ms: u64 },

    #[error("Connection error: {0}")]
    Connection(String),

    #[error("Server error ({status}): {message}")]
    Server { status: u16, message: String },

    #[error("Content policy violation: {0}")]
    ContentPolicy(String),

    #[error("Authentication failed: {0}")]
    Auth(String),

    #[error("Context length exceeded: {0}")]
    ContextLengthExceeded(String),

    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Provider API error: {0}")]
    Api(String),

    #[error("Unknown provider: {0}")]
    UnknownProvider(String),
}

impl LlmError {
    /// 超时、限流、连接、5xx 可重试；其余为终止性错误
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            LlmError::Timeout
                | LlmError::RateLimited { .. }
                | LlmError::Connection(_)
                | LlmError::Server { .. }
        )
    }

    /// 服务端给出的等待时间
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            LlmError::RateLimited { retry_after_ms } => Some(Duration::from_millis(*retry_after_ms)),
            _ => None,
        }
    }

    pub fn kind(&self) -> ErrorKind {
        if self.is_retryable() {
            ErrorKind::Transient
        } else if matches!(self, LlmError::UnknownProvider(_)) {
            ErrorKind::Resolution
        } else {
            ErrorKind::Internal
        }
    }
}

/// LLM 客户端 trait
#[async_trait]
pub trait LlmClient: Send + Sync {
    /// 后端名（openai / deepseek / mock）
    fn provider(&self) -> &str;

    fn model(&self) -> &str;

    /// 非流式完成；messages 已过滤为 Agent 可见
    async fn complete(&self, system: &str, messages: &[Message]) -> Result<Completion, LlmError>;
}

/// 粗略的 token 估算（约 4 字符 1 token），用于不返回用量的后端
pub fn estimate_tokens(text: &str) -> u64 {
    (text.chars().count() as u64).div_ceil(4)
}
