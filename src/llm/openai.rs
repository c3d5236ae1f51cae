//! OpenAI 兼容 API 客户端
//!
//! 通过 async_openai 调用任意 OpenAI 兼容端点（可配置 base_url）；DeepSeek 复用同一实现。

use async_openai::config::OpenAIConfig;
use async_openai::error::OpenAIError;
use async_openai::types::chat::{
    ChatCompletionRequestAssistantMessageArgs, ChatCompletionRequestMessage,
    ChatCompletionRequestSystemMessageArgs, ChatCompletionRequestUserMessageArgs,
    CreateChatCompletionRequestArgs,
};
use async_openai::Client;
use async_trait::async_trait;

use crate::conversation::{Message, Role};
use crate::llm::{Completion, LlmClient, LlmError, Usage};

pub const DEEPSEEK_BASE_URL: &str = "https://api.deepseek.com";
pub const DEEPSEEK_CHAT: &str = "deepseek-chat";

/// OpenAI 兼容客户端：持有 Client 与 model 名
pub struct OpenAiClient {
    client: Client<OpenAIConfig>,
    provider: String,
    model: String,
}

impl OpenAiClient {
    pub fn new(base_url: Option<&str>, model: &str, api_key: Option<&str>) -> Self {
        let api_key = api_key
            .map(String::from)
            .or_else(|| std::env::var("OPENAI_API_KEY").ok())
            .unwrap_or_else(|| "sk-placeholder".to_string());

        let config = if let Some(url) = base_url {
            OpenAIConfig::new().with_api_base(url).with_api_key(api_key)
        } else {
            OpenAIConfig::new().with_api_key(api_key)
        };

        Self {
            client: Client::with_config(config),
            provider: "openai".to_string(),
            model: model.to_string(),
        }
    }

    /// DeepSeek：优先 `DEEPSEEK_API_KEY`，未指定 base_url 时用官方端点
    pub fn deepseek(base_url: Option<&str>, model: &str) -> Self {
        let api_key = std::env::var("DEEPSEEK_API_KEY").ok();
        let model = if model.is_empty() { DEEPSEEK_CHAT } else { model };
        let mut client = Self::new(
            Some(base_url.unwrap_or(DEEPSEEK_BASE_URL)),
            model,
            api_key.as_deref(),
        );
        client.provider = "deepseek".to_string();
        client
    }

    fn to_openai_messages(
        &self,
        system: &str,
        messages: &[Message],
    ) -> Result<Vec<ChatCompletionRequestMessage>, LlmError> {
        let invalid = |e: OpenAIError| LlmError::InvalidRequest(e.to_string());
        let mut out = Vec::with_capacity(messages.len() + 1);
        if !system.is_empty() {
            out.push(ChatCompletionRequestMessage::System(
                ChatCompletionRequestSystemMessageArgs::default()
                    .content(system.to_string())
                    .build()
                    .map_err(invalid)?,
            ));
        }
        for m in messages {
            let text = m.as_text();
            let converted = match m.role {
                Role::System => ChatCompletionRequestMessage::System(
                    ChatCompletionRequestSystemMessageArgs::default()
                        .content(text)
                        .build()
                        .map_err(invalid)?,
                ),
                Role::User => ChatCompletionRequestMessage::User(
                    ChatCompletionRequestUserMessageArgs::default()
                        .content(text)
                        .build()
                        .map_err(invalid)?,
                ),
                Role::Assistant => ChatCompletionRequestMessage::Assistant(
                    ChatCompletionRequestAssistantMessageArgs::default()
                        .content(text)
                        .build()
                        .map_err(invalid)?,
                ),
            };
            out.push(converted);
        }
        Ok(out)
    }
}

/// 将 async_openai 错误归类为可重试 / 终止
pub fn classify_openai_error(err: &OpenAIError) -> LlmError {
    let text = err.to_string();
    let lower = text.to_lowercase();
    if lower.contains("rate limit") || lower.contains("429") {
        LlmError::RateLimited {
            retry_after_ms: 1000,
        }
    } else if lower.contains("timed out") || lower.contains("timeout") {
        LlmError::Timeout
    } else if lower.contains("content_policy") || lower.contains("content management policy") {
        LlmError::ContentPolicy(text)
    } else if lower.contains("context_length") || lower.contains("maximum context length") {
        LlmError::ContextLengthExceeded(text)
    } else if lower.contains("api key") || lower.contains("401") || lower.contains("unauthorized") {
        LlmError::Auth(text)
    } else if lower.contains("overloaded") || lower.contains("502") || lower.contains("503") {
        LlmError::Server {
            status: 503,
            message: text,
        }
    } else if lower.contains("error sending request") || lower.contains("connection") {
        LlmError::Connection(text)
    } else {
        LlmError::Api(text)
    }
}

#[async_trait]
impl LlmClient for OpenAiClient {
    fn provider(&self) -> &str {
        &self.provider
    }

    fn model(&self) -> &str {
        &self.model
    }

    async fn complete(&self, system: &str, messages: &[Message]) -> Result<Completion, LlmError> {
        let request = CreateChatCompletionRequestArgs::default()
            .model(&self.model)
            .messages(self.to_openai_messages(system, messages)?)
            .build()
            .map_err(|e| LlmError::InvalidRequest(e.to_string()))?;

        let response = self
            .client
            .chat()
            .create(request)
            .await
            .map_err(|e| classify_openai_error(&e))?;

        let usage = response
            .usage
            .as_ref()
            .map(|u| Usage::new(u.prompt_tokens as u64, u.completion_tokens as u64))
            .unwrap_or_default();

        let content = response
            .choices
            .first()
            .and_then(|c| c.message.content.clone())
            .unwrap_or_default();

        Ok(Completion { content, usage })
    }
}
