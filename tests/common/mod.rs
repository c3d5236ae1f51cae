//! 集成测试共用：内存会话库 + 可控延迟的 mock provider

#![allow(dead_code)]

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use apiary::config::{AppConfig, SessionBackend};
use apiary::conversation::last_user_text;
use apiary::llm::{LlmClient, MockLlmClient, MockReply, ProviderRegistry};
use apiary::ApiaryRuntime;

/// 用户文本里的第一个整数是回复前的延迟毫秒数
pub fn timed_mock() -> MockLlmClient {
    MockLlmClient::with_handler(|_, messages| {
        let text = last_user_text(messages).unwrap_or_default();
        let ms: u64 = text
            .split_whitespace()
            .find_map(|w| w.parse().ok())
            .unwrap_or(0);
        MockReply::text(format!("done: {text}")).with_delay(Duration::from_millis(ms))
    })
}

pub fn config(dir: &Path) -> AppConfig {
    let mut cfg = AppConfig::default();
    cfg.app.data_dir = dir.join("data");
    cfg.app.working_dir = Some(dir.to_path_buf());
    cfg.session.backend = SessionBackend::Memory;
    cfg.llm.provider = "mock".into();
    cfg.llm.retry_backoff_ms = 1;
    cfg.agents.default_extensions = vec!["echo".into()];
    cfg.scheduler.kill_grace_secs = 2;
    cfg.tasks.task_timeout_secs = 10;
    cfg
}

pub fn runtime(dir: &Path) -> ApiaryRuntime {
    runtime_with(config(dir))
}

pub fn runtime_with(cfg: AppConfig) -> ApiaryRuntime {
    let mut providers = ProviderRegistry::with_defaults();
    providers.register("mock", |_| {
        let client: Arc<dyn LlmClient> = Arc::new(timed_mock());
        Ok(client)
    });
    ApiaryRuntime::builder(cfg)
        .with_providers(providers)
        .build()
        .expect("runtime builds")
}

/// 在 Recipe 库目录写入一个 Recipe 文件
pub fn write_recipe(dir: &Path, name: &str, yaml: &str) {
    let recipes = dir.join("data").join("recipes");
    std::fs::create_dir_all(&recipes).unwrap();
    std::fs::write(recipes.join(format!("{name}.yaml")), yaml).unwrap();
}
