use serde::{Deserialize, Serialize};

use crate::conversation::Message;
use crate::llm::Usage;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionStatus {
    Completed,
    Failed,
    Cancelled,
}

/// 一次执行的结果；messages 为本次写回会话的消息
#[derive(Debug, Clone, Serialize)]
pub struct ExecutionResult {
    pub session_id: String,
    pub status: ExecutionStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub attempts: u32,
    pub usage: Usage,
    pub messages: Vec<Message>,
}

impl ExecutionResult {
    /// 取消：不写回任何内容
    pub fn cancelled(session_id: impl Into<String>, attempts: u32) -> Self {
        Self {
            session_id: session_id.into(),
            status: ExecutionStatus::Cancelled,
            output: None,
            error: Some("cancelled".to_string()),
            attempts,
            usage: Usage::default(),
            messages: Vec::new(),
        }
    }

    pub fn is_success(&self) -> bool {
        self.status == ExecutionStatus::Completed
    }
}
