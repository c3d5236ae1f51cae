//! 会话消息：角色、内容项与可见性
//!
//! 一条消息由若干内容项组成（文本 / 工具请求 / 工具结果 / 工具错误）。
//! metadata 控制可见性：只有 agent_visible 的消息会发给 LLM，user_visible 决定是否展示给用户。

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// 消息角色（与 LLM API 一致）
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
    System,
}

/// 单个内容项
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum MessageContent {
    Text {
        text: String,
    },
    ToolRequest {
        id: String,
        tool: String,
        args: serde_json::Value,
    },
    ToolResponse {
        id: String,
        output: String,
    },
    /// 扩展调用失败：记录在对话中，Agent 继续运行
    ToolError {
        id: String,
        tool: String,
        error: String,
    },
}

impl MessageContent {
    /// 给 LLM 的文本形式
    pub fn as_prompt_text(&self) -> String {
        match self {
            MessageContent::Text { text } => text.clone(),
            MessageContent::ToolRequest { tool, args, .. } => {
                serde_json::json!({ "tool": tool, "args": args }).to_string()
            }
            MessageContent::ToolResponse { output, .. } => format!("Observation: {output}"),
            MessageContent::ToolError { tool, error, .. } => {
                format!("Tool '{tool}' failed: {error}")
            }
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageMetadata {
    pub agent_visible: bool,
    pub user_visible: bool,
}

impl Default for MessageMetadata {
    fn default() -> Self {
        Self {
            agent_visible: true,
            user_visible: true,
        }
    }
}

/// 单条消息
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub role: Role,
    pub content: Vec<MessageContent>,
    pub created: DateTime<Utc>,
    #[serde(default)]
    pub metadata: MessageMetadata,
}

impl Message {
    pub fn new(role: Role, content: Vec<MessageContent>) -> Self {
        Self {
            role,
            content,
            created: Utc::now(),
            metadata: MessageMetadata::default(),
        }
    }

    pub fn user(text: impl Into<String>) -> Self {
        Self::new(Role::User, vec![MessageContent::Text { text: text.into() }])
    }

    pub fn assistant(text: impl Into<String>) -> Self {
        Self::new(Role::Assistant, vec![MessageContent::Text { text: text.into() }])
    }

    pub fn system(text: impl Into<String>) -> Self {
        Self::new(Role::System, vec![MessageContent::Text { text: text.into() }])
    }

    pub fn tool_request(id: impl Into<String>, tool: impl Into<String>, args: serde_json::Value) -> Self {
        Self::new(
            Role::Assistant,
            vec![MessageContent::ToolRequest {
                id: id.into(),
                tool: tool.into(),
                args,
            }],
        )
    }

    pub fn tool_response(id: impl Into<String>, output: impl Into<String>) -> Self {
        Self::new(
            Role::User,
            vec![MessageContent::ToolResponse {
                id: id.into(),
                output: output.into(),
            }],
        )
    }

    pub fn tool_error(id: impl Into<String>, tool: impl Into<String>, error: impl Into<String>) -> Self {
        Self::new(
            Role::User,
            vec![MessageContent::ToolError {
                id: id.into(),
                tool: tool.into(),
                error: error.into(),
            }],
        )
    }

    /// 仅 Agent 可见（如恢复提示）
    pub fn agent_only(mut self) -> Self {
        self.metadata = MessageMetadata {
            agent_visible: true,
            user_visible: false,
        };
        self
    }

    /// 仅用户可见（如终止失败说明）
    pub fn user_only(mut self) -> Self {
        self.metadata = MessageMetadata {
            agent_visible: false,
            user_visible: true,
        };
        self
    }

    pub fn is_agent_visible(&self) -> bool {
        self.metadata.agent_visible
    }

    /// 拼接所有内容项为文本
    pub fn as_text(&self) -> String {
        self.content
            .iter()
            .map(MessageContent::as_prompt_text)
            .collect::<Vec<_>>()
            .join("\n")
    }

    /// 仅文本内容项
    pub fn text(&self) -> String {
        self.content
            .iter()
            .filter_map(|c| match c {
                MessageContent::Text { text } => Some(text.as_str()),
                _ => None,
            })
            .collect::<Vec<_>>()
            .join("\n")
    }

    pub fn has_tool_result(&self) -> bool {
        self.content.iter().any(|c| {
            matches!(
                c,
                MessageContent::ToolResponse { .. } | MessageContent::ToolError { .. }
            )
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_visibility_flags() {
        let m = Message::user("hi");
        assert!(m.metadata.agent_visible && m.metadata.user_visible);
        let hidden = Message::user("fix your json").agent_only();
        assert!(hidden.is_agent_visible());
        assert!(!hidden.metadata.user_visible);
        let notice = Message::assistant("run failed").user_only();
        assert!(!notice.is_agent_visible());
    }

    #[test]
    fn test_prompt_text_for_tool_items() {
        let req = Message::tool_request("1", "echo__echo", serde_json::json!({"text": "a"}));
        assert!(req.as_text().contains("\"tool\":\"echo__echo\""));
        let err = Message::tool_error("1", "echo__echo", "boom");
        assert!(err.has_tool_result());
        assert_eq!(err.as_text(), "Tool 'echo__echo' failed: boom");
        assert_eq!(err.text(), "");
    }

    #[test]
    fn test_serde_shape() {
        let m = Message::tool_response("7", "done");
        let v = serde_json::to_value(&m).unwrap();
        assert_eq!(v["role"], "user");
        assert_eq!(v["content"][0]["type"], "tool_response");
        let back: Message = serde_json::from_value(v).unwrap();
        assert_eq!(back, m);
    }
}
