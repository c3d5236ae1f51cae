//! 对话：消息模型与发送给 LLM 前的过滤

pub mod message;

pub use message::{Message, MessageContent, MessageMetadata, Role};

/// 只保留 Agent 可见的消息
pub fn agent_visible(messages: &[Message]) -> Vec<Message> {
    messages
        .iter()
        .filter(|m| m.is_agent_visible())
        .cloned()
        .collect()
}

/// 最近一条用户文本（跳过工具结果与仅 Agent 可见的提示）
pub fn last_user_text(messages: &[Message]) -> Option<String> {
    messages
        .iter()
        .rev()
        .filter(|m| m.role == Role::User && m.metadata.user_visible)
        .map(Message::text)
        .find(|t| !t.is_empty())
}
