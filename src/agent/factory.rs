//! 按会话状态构造 Agent
//!
//! Provider 取配置，会话绑定的 Recipe 的 settings 可覆盖；扩展取默认扩展与 Recipe 声明的扩展，
//! SubAgent 会话只挂执行器按白名单收窄后的扩展。

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use crate::agent::{Agent, AgentInit, AgentOptions};
use crate::config::AppConfig;
use crate::core::{AgentError, RecoveryEngine};
use crate::extensions::{ExtensionCatalog, ExtensionConfig, ExtensionContext, ToolPermissions};
use crate::llm::{ProviderRegistry, ProviderSettings};
use crate::session::{Session, SessionType};

#[async_trait]
pub trait AgentFactory: Send + Sync {
    async fn create(&self, session: &Session) -> Result<Agent, AgentError>;
}

pub struct DefaultAgentFactory {
    config: Arc<AppConfig>,
    providers: Arc<ProviderRegistry>,
    catalog: Arc<ExtensionCatalog>,
}

impl DefaultAgentFactory {
    pub fn new(config: Arc<AppConfig>, providers: Arc<ProviderRegistry>, catalog: Arc<ExtensionCatalog>) -> Self {
        Self {
            config,
            providers,
            catalog,
        }
    }

    fn options(&self) -> AgentOptions {
        let cfg = &self.config;
        AgentOptions {
            max_turns: cfg.agents.max_turns,
            tool_timeout: Duration::from_secs(cfg.tools.tool_timeout_secs),
            confirmation_timeout: Duration::from_secs(cfg.tools.confirmation_timeout_secs),
            recovery: RecoveryEngine::new(
                cfg.llm.max_retries,
                Duration::from_millis(cfg.llm.retry_backoff_ms),
            ),
            permissions: ToolPermissions::new(cfg.tools.permissions.clone()),
        }
    }
}

#[async_trait]
impl AgentFactory for DefaultAgentFactory {
    async fn create(&self, session: &Session) -> Result<Agent, AgentError> {
        let recipe_settings = session.recipe.as_ref().and_then(|r| r.settings.as_ref());
        let settings = ProviderSettings::from_config(&self.config.llm).with_override(
            recipe_settings.and_then(|s| s.provider.as_deref()),
            recipe_settings.and_then(|s| s.model.as_deref()),
        );
        let provider = self
            .providers
            .create(&settings)
            .map_err(|e| AgentError::Creation(format!("provider '{}': {e}", settings.provider)))?;

        let agent = Agent::new(AgentInit {
            session_id: session.id.clone(),
            session_type: session.session_type,
            provider,
            provider_settings: settings,
            providers: Arc::clone(&self.providers),
            catalog: Arc::clone(&self.catalog),
            extension_context: ExtensionContext::from_config(&self.config, session.working_dir.clone()),
            options: self.options(),
        });

        if session.session_type != SessionType::SubAgent {
            let mut configs: Vec<ExtensionConfig> = self
                .config
                .agents
                .default_extensions
                .iter()
                .map(ExtensionConfig::builtin)
                .collect();
            if let Some(recipe) = &session.recipe {
                configs.extend(recipe.extension_configs());
                if let Some(subs) = &recipe.sub_recipes {
                    agent.add_sub_recipes(subs.clone()).await;
                }
            }
            agent.bind_extensions(&configs).await?;
        }

        let names = agent.extension_names().await;
        tracing::info!(
            session_id = %session.id,
            session_type = session.session_type.as_str(),
            extensions = ?names,
            "agent created"
        );
        Ok(agent)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::recipe::{Recipe, Settings};
    use crate::session::SessionSeed;

    fn factory() -> DefaultAgentFactory {
        let mut cfg = AppConfig::default();
        cfg.llm.provider = "mock".into();
        DefaultAgentFactory::new(
            Arc::new(cfg),
            Arc::new(ProviderRegistry::with_defaults()),
            Arc::new(ExtensionCatalog::with_builtins()),
        )
    }

    #[tokio::test]
    async fn test_defaults_plus_recipe_extensions() {
        let mut session = Session::new("s1", SessionSeed::new(std::env::temp_dir(), SessionType::User));
        session.recipe = Some(
            Recipe::builder()
                .title("t")
                .instructions("do it")
                .extension(ExtensionConfig::builtin("echo"))
                .build()
                .unwrap(),
        );
        let agent = factory().create(&session).await.unwrap();
        assert_eq!(agent.extension_names().await, vec!["developer", "echo"]);
        assert_eq!(agent.provider_info().await.0, "mock");
    }

    #[tokio::test]
    async fn test_create_on_spawned_task() {
        let factory = Arc::new(factory());
        let session = Session::new("s4", SessionSeed::new(std::env::temp_dir(), SessionType::User));
        let agent = tokio::spawn(async move { factory.create(&session).await })
            .await
            .unwrap()
            .unwrap();
        assert_eq!(agent.extension_names().await, vec!["developer"]);
    }

    #[tokio::test]
    async fn test_sub_agent_starts_bare() {
        let session = Session::new("s2", SessionSeed::new(std::env::temp_dir(), SessionType::SubAgent));
        let agent = factory().create(&session).await.unwrap();
        assert!(agent.extension_names().await.is_empty());
    }

    #[tokio::test]
    async fn test_unknown_recipe_provider_fails() {
        let mut session = Session::new("s3", SessionSeed::new(std::env::temp_dir(), SessionType::User));
        session.recipe = Some(
            Recipe::builder()
                .title("t")
                .instructions("do it")
                .settings(Settings {
                    provider: Some("nope".into()),
                    ..Default::default()
                })
                .build()
                .unwrap(),
        );
        let err = factory().create(&session).await.err().unwrap();
        assert!(matches!(err, AgentError::Creation(_)));
    }
}
