//! Agent：绑定到单个会话的运行时对象
//!
//! 每个 Agent 独占自己的扩展实例、Provider 句柄、确认通道与工具策略，会话之间不共享任何可变状态。
//! - **events**: 流式过程事件
//! - **planner**: system prompt、输出解析、schema 校验
//! - **reply**: 单轮运行循环（LLM ⇄ 工具）
//! - **platform**: 平台工具（dispatch_tasks / subrecipe__*）
//! - **factory**: 按会话状态构造 Agent
//! - **manager**: session_id → Agent 映射，get-or-create 与闲置回收

pub mod events;
pub mod factory;
pub mod manager;
pub mod planner;
pub mod platform;
pub mod reply;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{Mutex, MutexGuard, RwLock};

use crate::conversation::{agent_visible, Message};
use crate::core::{AgentError, RecoveryEngine};
use crate::extensions::{
    ConfirmationRouter, ExtensionCatalog, ExtensionConfig, ExtensionContext, ExtensionError,
    ExtensionScope, ExtensionSet, PermissionDecision, PermissionError, PermissionLevel,
    ToolEntry, ToolExecutor, ToolPermissions, ToolSelection,
};
use crate::llm::{LlmClient, LlmError, ProviderRegistry, ProviderSettings};
use crate::recipe::{Recipe, SubRecipe};
use crate::session::SessionType;

pub use events::{AgentEvent, EventSender};
pub use factory::{AgentFactory, DefaultAgentFactory};
pub use manager::{AgentManager, AgentManagerMetrics};
pub use planner::{parse_llm_output, PlannerOutput, ToolCall, ToolDescriptor};
pub use reply::{AgentReply, ReplyContext, ReplyOutcome};

/// 运行参数
#[derive(Debug, Clone)]
pub struct AgentOptions {
    pub max_turns: usize,
    pub tool_timeout: Duration,
    pub confirmation_timeout: Duration,
    pub recovery: RecoveryEngine,
    pub permissions: ToolPermissions,
}

impl Default for AgentOptions {
    fn default() -> Self {
        Self {
            max_turns: 20,
            tool_timeout: Duration::from_secs(30),
            confirmation_timeout: Duration::from_secs(300),
            recovery: RecoveryEngine::default(),
            permissions: ToolPermissions::default(),
        }
    }
}

/// 构造 Agent 所需的全部依赖
pub struct AgentInit {
    pub session_id: String,
    pub session_type: SessionType,
    pub provider: Arc<dyn LlmClient>,
    pub provider_settings: ProviderSettings,
    pub providers: Arc<ProviderRegistry>,
    pub catalog: Arc<ExtensionCatalog>,
    pub extension_context: ExtensionContext,
    pub options: AgentOptions,
}

pub struct Agent {
    session_id: String,
    session_type: SessionType,
    provider: RwLock<Arc<dyn LlmClient>>,
    provider_settings: RwLock<ProviderSettings>,
    providers: Arc<ProviderRegistry>,
    catalog: Arc<ExtensionCatalog>,
    extension_context: ExtensionContext,
    extensions: RwLock<ExtensionSet>,
    prompt_extras: RwLock<Vec<String>>,
    sub_recipes: RwLock<Vec<SubRecipe>>,
    tool_selection: RwLock<ToolSelection>,
    permissions: RwLock<ToolPermissions>,
    confirmations: ConfirmationRouter,
    executor: ToolExecutor,
    recovery: RecoveryEngine,
    max_turns: usize,
    confirmation_timeout: Duration,
    run_lock: Mutex<()>,
    closed: AtomicBool,
}

impl Agent {
    pub fn new(init: AgentInit) -> Self {
        Self {
            session_id: init.session_id,
            session_type: init.session_type,
            provider: RwLock::new(init.provider),
            provider_settings: RwLock::new(init.provider_settings),
            providers: init.providers,
            catalog: init.catalog,
            extension_context: init.extension_context,
            extensions: RwLock::new(ExtensionSet::new()),
            prompt_extras: RwLock::new(Vec::new()),
            sub_recipes: RwLock::new(Vec::new()),
            tool_selection: RwLock::new(ToolSelection::default()),
            permissions: RwLock::new(init.options.permissions),
            confirmations: ConfirmationRouter::new(),
            executor: ToolExecutor::new(init.options.tool_timeout),
            recovery: init.options.recovery,
            max_turns: init.options.max_turns.max(1),
            confirmation_timeout: init.options.confirmation_timeout,
            run_lock: Mutex::new(()),
            closed: AtomicBool::new(false),
        }
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub fn session_type(&self) -> SessionType {
        self.session_type
    }

    /// 会话内串行：持有期间其他执行等待
    pub async fn lock_run(&self) -> MutexGuard<'_, ()> {
        self.run_lock.lock().await
    }

    /// 是否有运行在进行（闲置回收跳过忙碌的 Agent）
    pub fn is_busy(&self) -> bool {
        self.run_lock.try_lock().is_err()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// 启用扩展；已启用的跳过，任一初始化失败即返回错误
    pub async fn bind_extensions(&self, configs: &[ExtensionConfig]) -> Result<(), ExtensionError> {
        let mut set = self.extensions.write().await;
        for config in configs {
            if set.contains(config.name()) {
                continue;
            }
            let extension = self.catalog.instantiate(config, &self.extension_context)?;
            tracing::debug!(session_id = %self.session_id, extension = %config.name(), "extension enabled");
            set.insert(extension);
        }
        Ok(())
    }

    pub async fn disable_extension(&self, name: &str) -> Result<(), ExtensionError> {
        self.extensions.write().await.remove(name)?;
        tracing::info!(session_id = %self.session_id, extension = %name, "extension disabled");
        Ok(())
    }

    pub async fn extension_names(&self) -> Vec<String> {
        self.extensions.read().await.names()
    }

    pub(crate) async fn tool_entries(&self, scope: Option<&ExtensionScope>) -> Vec<ToolEntry> {
        self.extensions.read().await.tools(scope)
    }

    /// 可用工具：扩展工具（按 scope 过滤）加上平台工具
    pub async fn list_tools(&self, scope: Option<&ExtensionScope>) -> Vec<ToolDescriptor> {
        let mut tools: Vec<ToolDescriptor> = self
            .tool_entries(scope)
            .await
            .into_iter()
            .map(|e| ToolDescriptor {
                parameters: e.tool.parameters_schema(),
                description: e.description().to_string(),
                name: e.full_name,
            })
            .collect();
        if self.session_type != SessionType::SubAgent {
            tools.extend(platform::descriptors(&self.sub_recipes.read().await));
        }
        tools
    }

    pub async fn extend_system_prompt(&self, text: impl Into<String>) {
        self.prompt_extras.write().await.push(text.into());
    }

    /// 同名子 Recipe 覆盖
    pub async fn add_sub_recipes(&self, subs: Vec<SubRecipe>) {
        let mut current = self.sub_recipes.write().await;
        for sub in subs {
            match current.iter_mut().find(|s| s.name == sub.name) {
                Some(existing) => *existing = sub,
                None => current.push(sub),
            }
        }
    }

    pub async fn sub_recipes(&self) -> Vec<SubRecipe> {
        self.sub_recipes.read().await.clone()
    }

    /// 切换 provider / model；名称未知时保持原状并返回错误
    pub async fn update_provider(&self, provider: Option<&str>, model: Option<&str>) -> Result<(), LlmError> {
        let settings = self
            .provider_settings
            .read()
            .await
            .clone()
            .with_override(provider, model);
        let client = self.providers.create(&settings)?;
        *self.provider.write().await = client;
        tracing::info!(session_id = %self.session_id, provider = %settings.provider, model = %settings.model, "provider updated");
        *self.provider_settings.write().await = settings;
        Ok(())
    }

    pub async fn provider_info(&self) -> (String, String) {
        let s = self.provider_settings.read().await;
        (s.provider.clone(), s.model.clone())
    }

    pub async fn set_tool_selection(&self, selection: ToolSelection) {
        *self.tool_selection.write().await = selection;
    }

    pub async fn tool_selection(&self) -> ToolSelection {
        self.tool_selection.read().await.clone()
    }

    pub async fn set_permission(&self, tool: &str, level: PermissionLevel) {
        self.permissions.write().await.set(tool, level);
    }

    /// 回复一个待确认的工具调用
    pub fn confirm_tool_call(&self, request_id: &str, decision: PermissionDecision) -> Result<(), PermissionError> {
        self.confirmations.resolve(request_id, decision)
    }

    /// 请 LLM 把对话提炼成 Recipe（instructions + activities），扩展取当前已启用的
    pub async fn create_recipe(&self, conversation: &[Message]) -> Result<Recipe, AgentError> {
        const SYSTEM: &str = "You turn a conversation into a reusable recipe. \
Reply with ONLY a JSON object: {\"title\": string, \"description\": string, \
\"instructions\": string, \"activities\": [string]}. The instructions must let another agent \
repeat the task without the conversation.";
        let mut messages = agent_visible(conversation);
        messages.push(Message::user("Create the recipe JSON for the conversation above."));

        let provider = self.provider.read().await.clone();
        let completion = provider.complete(SYSTEM, &messages).await?;
        let schema = serde_json::json!({"type": "object", "required": ["instructions"]});
        let value = planner::check_response_schema(&completion.content, &schema)?;

        let text = |key: &str| value.get(key).and_then(|v| v.as_str()).map(str::to_string);
        let activities: Vec<String> = value
            .get("activities")
            .and_then(|v| v.as_array())
            .map(|a| a.iter().filter_map(|v| v.as_str().map(str::to_string)).collect())
            .unwrap_or_default();

        let mut builder = Recipe::builder()
            .title(text("title").unwrap_or_else(|| format!("Recipe from {}", self.session_id)))
            .description(text("description").unwrap_or_default())
            .instructions(text("instructions").unwrap_or_default())
            .activities(activities);
        for name in self.extension_names().await {
            builder = builder.extension(ExtensionConfig::builtin(name));
        }
        builder
            .build()
            .map_err(|e| AgentError::SchemaMismatch(e.to_string()))
    }

    /// 释放扩展；之后该 Agent 不再被使用
    pub async fn shutdown(&self) {
        self.closed.store(true, Ordering::SeqCst);
        self.extensions.write().await.clear();
        tracing::debug!(session_id = %self.session_id, "agent shut down");
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;
    use crate::llm::MockLlmClient;

    pub fn agent_with(provider: MockLlmClient, session_type: SessionType) -> Agent {
        let providers = Arc::new(ProviderRegistry::with_defaults());
        Agent::new(AgentInit {
            session_id: "test-session".into(),
            session_type,
            provider: Arc::new(provider),
            provider_settings: ProviderSettings {
                provider: "mock".into(),
                model: "mock".into(),
                base_url: None,
                request_timeout: Duration::from_secs(5),
            },
            providers,
            catalog: Arc::new(ExtensionCatalog::with_builtins()),
            extension_context: ExtensionContext {
                working_dir: std::env::temp_dir(),
                allowed_commands: vec!["echo".into(), "ls".into()],
                tool_timeout: Duration::from_secs(5),
            },
            options: AgentOptions {
                max_turns: 6,
                recovery: RecoveryEngine::new(2, Duration::from_millis(1)),
                ..AgentOptions::default()
            },
        })
    }
}

#[cfg(test)]
mod tests {
    use super::test_support::agent_with;
    use super::*;
    use crate::llm::{MockLlmClient, MockReply};

    #[tokio::test]
    async fn test_bind_and_disable() {
        let agent = agent_with(MockLlmClient::default(), SessionType::User);
        agent
            .bind_extensions(&[ExtensionConfig::builtin("echo"), ExtensionConfig::builtin("developer")])
            .await
            .unwrap();
        assert_eq!(agent.extension_names().await, vec!["developer", "echo"]);

        agent.disable_extension("developer").await.unwrap();
        let names: Vec<String> = agent.list_tools(None).await.into_iter().map(|t| t.name).collect();
        assert!(names.contains(&"echo__echo".to_string()));
        assert!(names.contains(&"platform__dispatch_tasks".to_string()));
        assert!(!names.iter().any(|n| n.starts_with("developer__")));

        let err = agent
            .bind_extensions(&[ExtensionConfig::builtin("github")])
            .await
            .unwrap_err();
        assert_eq!(err, ExtensionError::NotFound("github".into()));
    }

    #[tokio::test]
    async fn test_sub_agent_has_no_platform_tools() {
        let agent = agent_with(MockLlmClient::default(), SessionType::SubAgent);
        assert!(agent.list_tools(None).await.is_empty());
    }

    #[tokio::test]
    async fn test_update_provider_unknown_keeps_old() {
        let agent = agent_with(MockLlmClient::default(), SessionType::User);
        let err = agent.update_provider(Some("nope"), None).await.unwrap_err();
        assert_eq!(err, LlmError::UnknownProvider("nope".into()));
        assert_eq!(agent.provider_info().await.0, "mock");
        agent.update_provider(None, Some("mock-large")).await.unwrap();
        assert_eq!(agent.provider_info().await.1, "mock-large");
    }

    #[tokio::test]
    async fn test_create_recipe_from_conversation() {
        let reply = MockReply::text(
            r#"{"title": "List files", "description": "d", "instructions": "List the files", "activities": ["List"]}"#,
        );
        let agent = agent_with(MockLlmClient::scripted(vec![reply]), SessionType::User);
        agent.bind_extensions(&[ExtensionConfig::builtin("echo")]).await.unwrap();
        let recipe = agent
            .create_recipe(&[Message::user("list files"), Message::assistant("a.txt")])
            .await
            .unwrap();
        assert_eq!(recipe.title, "List files");
        assert_eq!(recipe.instructions.as_deref(), Some("List the files"));
        assert_eq!(recipe.extension_configs(), vec![ExtensionConfig::builtin("echo")]);
    }
}
