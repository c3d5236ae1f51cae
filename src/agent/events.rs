//! 运行过程事件：Interactive 模式下推给实时消费者（CLI / SSE）

use serde::Serialize;
use tokio::sync::mpsc;

use crate::conversation::Message;

/// 单步过程事件（可序列化为 JSON 供前端展示）
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AgentEvent {
    /// 当前第几步
    StepUpdate { step: usize, max_steps: usize },
    /// 正在调用 LLM
    Thinking,
    ToolCall {
        id: String,
        tool: String,
        args: serde_json::Value,
    },
    /// 工具返回（预览）
    ToolResult {
        id: String,
        tool: String,
        preview: String,
    },
    ToolFailure {
        id: String,
        tool: String,
        reason: String,
    },
    /// 需要人工确认的工具调用；用 request_id 回复 confirm / deny
    ConfirmationRequired {
        request_id: String,
        tool: String,
        args: serde_json::Value,
    },
    /// 恢复动作（RetryWithPrompt / RetryAfter / Abort）
    Recovery { action: String, detail: String },
    /// 最终回复消息
    Message { message: Message },
    TokenUsage {
        input_tokens: u64,
        output_tokens: u64,
        total_tokens: u64,
    },
    Error { text: String },
}

pub type EventSender = mpsc::UnboundedSender<AgentEvent>;

pub(crate) fn send_event(tx: Option<&EventSender>, ev: AgentEvent) {
    if let Some(tx) = tx {
        let _ = tx.send(ev);
    }
}

/// 截断为预览
pub(crate) fn preview(text: &str, max_chars: usize) -> String {
    if text.chars().count() > max_chars {
        format!("{}...", text.chars().take(max_chars).collect::<String>())
    } else {
        text.to_string()
    }
}
