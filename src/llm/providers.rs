//! Provider 注册表：按名称构造 LLM 客户端
//!
//! 内置 openai / deepseek / mock；调用方（测试、嵌入方）可注册自定义构造器。
//! 所有客户端都包一层 TimeoutLlmClient，单次调用超时记为可重试的 Timeout。

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use crate::config::LlmSection;
use crate::conversation::Message;
use crate::llm::{Completion, LlmClient, LlmError, MockLlmClient, OpenAiClient};

/// 构造一个客户端所需的设置
#[derive(Debug, Clone)]
pub struct ProviderSettings {
    pub provider: String,
    pub model: String,
    pub base_url: Option<String>,
    pub request_timeout: Duration,
}

impl ProviderSettings {
    pub fn from_config(cfg: &LlmSection) -> Self {
        Self {
            provider: cfg.provider.clone(),
            model: cfg.model.clone(),
            base_url: cfg.base_url.clone(),
            request_timeout: Duration::from_secs(cfg.request_timeout_secs),
        }
    }

    /// 替换 provider / model（Recipe settings 或 Agent 控制接口）
    pub fn with_override(mut self, provider: Option<&str>, model: Option<&str>) -> Self {
        if let Some(p) = provider {
            self.provider = p.to_string();
        }
        if let Some(m) = model {
            self.model = m.to_string();
        }
        self
    }
}

pub type ProviderConstructor =
    Arc<dyn Fn(&ProviderSettings) -> Result<Arc<dyn LlmClient>, LlmError> + Send + Sync>;

pub struct ProviderRegistry {
    constructors: HashMap<String, ProviderConstructor>,
}

impl ProviderRegistry {
    pub fn empty() -> Self {
        Self {
            constructors: HashMap::new(),
        }
    }

    pub fn with_defaults() -> Self {
        let mut registry = Self::empty();
        registry.register("openai", |s: &ProviderSettings| {
            Ok(Arc::new(OpenAiClient::new(s.base_url.as_deref(), &s.model, None)) as Arc<dyn LlmClient>)
        });
        registry.register("deepseek", |s: &ProviderSettings| {
            Ok(Arc::new(OpenAiClient::deepseek(s.base_url.as_deref(), &s.model)) as Arc<dyn LlmClient>)
        });
        registry.register("mock", |s: &ProviderSettings| {
            Ok(Arc::new(MockLlmClient::new(s.model.clone())) as Arc<dyn LlmClient>)
        });
        registry
    }

    pub fn register<F>(&mut self, name: &str, constructor: F)
    where
        F: Fn(&ProviderSettings) -> Result<Arc<dyn LlmClient>, LlmError> + Send + Sync + 'static,
    {
        self.constructors
            .insert(name.to_string(), Arc::new(constructor));
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.constructors.keys().cloned().collect();
        names.sort();
        names
    }

    /// 未注册的 provider 名返回 UnknownProvider
    pub fn create(&self, settings: &ProviderSettings) -> Result<Arc<dyn LlmClient>, LlmError> {
        let constructor = self
            .constructors
            .get(&settings.provider)
            .ok_or_else(|| LlmError::UnknownProvider(settings.provider.clone()))?;
        let inner = constructor(settings)?;
        tracing::debug!(provider = %settings.provider, model = %settings.model, "provider created");
        Ok(Arc::new(TimeoutLlmClient {
            inner,
            timeout: settings.request_timeout,
        }))
    }
}

impl Default for ProviderRegistry {
    fn default() -> Self {
        Self::with_defaults()
    }
}

/// 单次调用超时包装
pub struct TimeoutLlmClient {
    inner: Arc<dyn LlmClient>,
    timeout: Duration,
}

#[async_trait]
impl LlmClient for TimeoutLlmClient {
    fn provider(&self) -> &str {
        self.inner.provider()
    }

    fn model(&self) -> &str {
        self.inner.model()
    }

    async fn complete(&self, system: &str, messages: &[Message]) -> Result<Completion, LlmError> {
        match tokio::time::timeout(self.timeout, self.inner.complete(system, messages)).await {
            Ok(result) => result,
            Err(_) => Err(LlmError::Timeout),
        }
    }
}
