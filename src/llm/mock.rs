//! Mock LLM 客户端（用于测试与离线运行，无需 API）
//!
//! 默认行为：第一步把最后一条用户消息回显为 echo 工具调用，拿到工具结果后给出最终回复。
//! 测试可注入 handler，按对话内容返回脚本化回复、延迟或错误。

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;

use crate::conversation::{last_user_text, Message};
use crate::llm::{estimate_tokens, Completion, LlmClient, LlmError, Usage};

/// handler 的单次返回
#[derive(Debug, Clone, Default)]
pub struct MockReply {
    pub content: String,
    pub delay: Duration,
    pub error: Option<LlmError>,
}

impl MockReply {
    pub fn text(content: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            ..Default::default()
        }
    }

    pub fn tool_call(tool: &str, args: serde_json::Value) -> Self {
        Self::text(serde_json::json!({ "tool": tool, "args": args }).to_string())
    }

    pub fn error(err: LlmError) -> Self {
        Self {
            error: Some(err),
            ..Default::default()
        }
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }
}

pub type MockHandler = Arc<dyn Fn(&str, &[Message]) -> MockReply + Send + Sync>;

/// Mock 客户端
pub struct MockLlmClient {
    model: String,
    handler: Option<MockHandler>,
    calls: AtomicUsize,
}

impl MockLlmClient {
    pub fn new(model: impl Into<String>) -> Self {
        Self {
            model: model.into(),
            handler: None,
            calls: AtomicUsize::new(0),
        }
    }

    /// 自定义 handler：入参为 system prompt 与 Agent 可见对话
    pub fn with_handler<F>(handler: F) -> Self
    where
        F: Fn(&str, &[Message]) -> MockReply + Send + Sync + 'static,
    {
        Self {
            model: "mock".to_string(),
            handler: Some(Arc::new(handler)),
            calls: AtomicUsize::new(0),
        }
    }

    /// 按顺序返回预置回复；用完后重复最后一条
    pub fn scripted(replies: Vec<MockReply>) -> Self {
        let queue = Mutex::new(VecDeque::from(replies));
        let last = Mutex::new(MockReply::text("(script exhausted)"));
        Self::with_handler(move |_, _| {
            let next = queue.lock().ok().and_then(|mut q| q.pop_front());
            match next {
                Some(reply) => {
                    if let Ok(mut l) = last.lock() {
                        *l = reply.clone();
                    }
                    reply
                }
                None => last
                    .lock()
                    .map(|l| l.clone())
                    .unwrap_or_else(|_| MockReply::text("(script exhausted)")),
            }
        })
    }

    pub fn call_count(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    fn default_reply(messages: &[Message]) -> MockReply {
        let last_user = last_user_text(messages).unwrap_or_else(|| "(no input)".to_string());
        let answered = messages.last().map(Message::has_tool_result).unwrap_or(false);
        if answered {
            MockReply::text(format!("Echo from Mock: {last_user}"))
        } else {
            MockReply::tool_call(
                "echo__echo",
                serde_json::json!({ "text": format!("Echo from Mock: {last_user}") }),
            )
        }
    }
}

impl Default for MockLlmClient {
    fn default() -> Self {
        Self::new("mock")
    }
}

#[async_trait]
impl LlmClient for MockLlmClient {
    fn provider(&self) -> &str {
        "mock"
    }

    fn model(&self) -> &str {
        &self.model
    }

    async fn complete(&self, system: &str, messages: &[Message]) -> Result<Completion, LlmError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let reply = match &self.handler {
            Some(handler) => handler(system, messages),
            None => Self::default_reply(messages),
        };
        if !reply.delay.is_zero() {
            tokio::time::sleep(reply.delay).await;
        }
        if let Some(err) = reply.error {
            return Err(err);
        }
        let prompt_chars: String = messages.iter().map(Message::as_text).collect();
        let usage = Usage::new(
            estimate_tokens(system) + estimate_tokens(&prompt_chars),
            estimate_tokens(&reply.content),
        );
        Ok(Completion {
            content: reply.content,
            usage,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_default_echo_then_answer() {
        let client = MockLlmClient::default();
        let first = client.complete("", &[Message::user("hello")]).await.unwrap();
        assert!(first.content.contains("\"tool\":\"echo__echo\""));

        let history = vec![
            Message::user("hello"),
            Message::tool_request("1", "echo__echo", serde_json::json!({})),
            Message::tool_response("1", "Echo from Mock: hello"),
        ];
        let second = client.complete("", &history).await.unwrap();
        assert_eq!(second.content, "Echo from Mock: hello");
        assert!(second.usage.input_tokens > 0);
        assert_eq!(client.call_count(), 2);
    }

    #[tokio::test]
    async fn test_scripted_replies_and_errors() {
        let client = MockLlmClient::scripted(vec![
            MockReply::error(LlmError::Timeout),
            MockReply::text("done"),
        ]);
        assert_eq!(client.complete("", &[]).await.unwrap_err(), LlmError::Timeout);
        assert_eq!(client.complete("", &[]).await.unwrap().content, "done");
        assert_eq!(client.complete("", &[]).await.unwrap().content, "done");
    }
}
