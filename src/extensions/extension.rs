//! 扩展：一组具名工具
//!
//! ExtensionCatalog 按名构造扩展实例；每个 Agent 持有自己的 ExtensionSet（实例不跨会话共享），
//! 启用 / 禁用只影响该 Agent。工具对外名称为 `扩展名__工具名`。

use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::config::AppConfig;
use crate::core::ErrorKind;
use crate::extensions::builtin::{developer_extension, echo_extension};
use crate::extensions::{Tool, ToolRegistry};

/// 工具全名分隔符
pub const TOOL_SEPARATOR: &str = "__";

#[derive(Error, Debug, Clone, PartialEq)]
pub enum ExtensionError {
    #[error("Extension not available: {0}")]
    NotFound(String),

    #[error("Extension '{name}' failed to initialize: {reason}")]
    InitFailed { name: String, reason: String },

    #[error("Extension not enabled: {0}")]
    NotEnabled(String),
}

impl ExtensionError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            ExtensionError::NotFound(_) | ExtensionError::InitFailed { .. } => ErrorKind::Precondition,
            ExtensionError::NotEnabled(_) => ErrorKind::NotFound,
        }
    }
}

/// Recipe / 请求中声明的扩展
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ExtensionConfig {
    Builtin {
        name: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        display_name: Option<String>,
        /// 该扩展工具的超时（秒），覆盖全局工具超时
        #[serde(default, skip_serializing_if = "Option::is_none")]
        timeout: Option<u64>,
    },
}

impl ExtensionConfig {
    pub fn builtin(name: impl Into<String>) -> Self {
        ExtensionConfig::Builtin {
            name: name.into(),
            display_name: None,
            timeout: None,
        }
    }

    pub fn name(&self) -> &str {
        match self {
            ExtensionConfig::Builtin { name, .. } => name,
        }
    }

    pub fn timeout(&self) -> Option<Duration> {
        match self {
            ExtensionConfig::Builtin { timeout, .. } => timeout.map(Duration::from_secs),
        }
    }
}

/// 一次运行允许使用的扩展名白名单
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExtensionScope {
    pub allowed: Vec<String>,
}

impl ExtensionScope {
    pub fn new<I, S>(allowed: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            allowed: allowed.into_iter().map(Into::into).collect(),
        }
    }

    pub fn allows(&self, extension: &str) -> bool {
        self.allowed.iter().any(|a| a == extension)
    }

    /// 把扩展声明收窄到白名单：白名单里有但声明里没有的，按内置扩展补上
    pub fn narrow(&self, declared: &[ExtensionConfig]) -> Vec<ExtensionConfig> {
        self.allowed
            .iter()
            .map(|name| {
                declared
                    .iter()
                    .find(|c| c.name() == name)
                    .cloned()
                    .unwrap_or_else(|| ExtensionConfig::builtin(name.clone()))
            })
            .collect()
    }
}

/// 构造扩展时的运行环境
#[derive(Debug, Clone)]
pub struct ExtensionContext {
    pub working_dir: PathBuf,
    pub allowed_commands: Vec<String>,
    pub tool_timeout: Duration,
}

impl ExtensionContext {
    pub fn from_config(cfg: &AppConfig, working_dir: PathBuf) -> Self {
        Self {
            working_dir,
            allowed_commands: cfg.tools.shell.allowed_commands.clone(),
            tool_timeout: Duration::from_secs(cfg.tools.tool_timeout_secs),
        }
    }
}

/// 扩展实例
pub struct Extension {
    name: String,
    description: String,
    tools: ToolRegistry,
    timeout: Option<Duration>,
}

impl Extension {
    pub fn new(name: impl Into<String>, description: impl Into<String>, tools: ToolRegistry) -> Self {
        Self {
            name: name.into(),
            description: description.into(),
            tools,
            timeout: None,
        }
    }

    pub fn with_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn description(&self) -> &str {
        &self.description
    }
}

/// 对 Agent 暴露的单个工具
#[derive(Clone)]
pub struct ToolEntry {
    pub full_name: String,
    pub extension: String,
    pub tool: Arc<dyn Tool>,
    pub timeout: Option<Duration>,
}

impl ToolEntry {
    pub fn description(&self) -> &str {
        self.tool.description()
    }
}

impl std::fmt::Debug for ToolEntry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ToolEntry")
            .field("full_name", &self.full_name)
            .field("extension", &self.extension)
            .finish()
    }
}

/// 一个 Agent 已启用的扩展
#[derive(Default)]
pub struct ExtensionSet {
    extensions: BTreeMap<String, Extension>,
}

impl ExtensionSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.extensions.contains_key(name)
    }

    pub fn insert(&mut self, extension: Extension) {
        self.extensions.insert(extension.name.clone(), extension);
    }

    pub fn remove(&mut self, name: &str) -> Result<(), ExtensionError> {
        self.extensions
            .remove(name)
            .map(|_| ())
            .ok_or_else(|| ExtensionError::NotEnabled(name.to_string()))
    }

    pub fn clear(&mut self) {
        self.extensions.clear();
    }

    pub fn names(&self) -> Vec<String> {
        self.extensions.keys().cloned().collect()
    }

    /// 全部工具；scope 非空时只保留白名单扩展的工具
    pub fn tools(&self, scope: Option<&ExtensionScope>) -> Vec<ToolEntry> {
        self.extensions
            .values()
            .filter(|ext| scope.map(|s| s.allows(&ext.name)).unwrap_or(true))
            .flat_map(|ext| {
                ext.tools.iter().map(move |(name, tool)| ToolEntry {
                    full_name: format!("{}{}{}", ext.name, TOOL_SEPARATOR, name),
                    extension: ext.name.clone(),
                    tool: Arc::clone(tool),
                    timeout: ext.timeout,
                })
            })
            .collect()
    }
}

pub type ExtensionBuilder =
    Arc<dyn Fn(&ExtensionContext) -> Result<Extension, ExtensionError> + Send + Sync>;

/// 可用扩展目录：按名构造新实例
#[derive(Clone)]
pub struct ExtensionCatalog {
    builders: HashMap<String, ExtensionBuilder>,
}

impl ExtensionCatalog {
    pub fn empty() -> Self {
        Self {
            builders: HashMap::new(),
        }
    }

    pub fn with_builtins() -> Self {
        let mut catalog = Self::empty();
        catalog.register("developer", |ctx: &ExtensionContext| {
            if !ctx.working_dir.is_dir() {
                return Err(ExtensionError::InitFailed {
                    name: "developer".to_string(),
                    reason: format!("working directory {} does not exist", ctx.working_dir.display()),
                });
            }
            Ok(developer_extension(ctx))
        });
        catalog.register("echo", |_: &ExtensionContext| Ok(echo_extension()));
        catalog
    }

    pub fn register<F>(&mut self, name: &str, builder: F)
    where
        F: Fn(&ExtensionContext) -> Result<Extension, ExtensionError> + Send + Sync + 'static,
    {
        self.builders.insert(name.to_string(), Arc::new(builder));
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.builders.keys().cloned().collect();
        names.sort();
        names
    }

    pub fn instantiate(
        &self,
        config: &ExtensionConfig,
        ctx: &ExtensionContext,
    ) -> Result<Extension, ExtensionError> {
        let builder = self
            .builders
            .get(config.name())
            .ok_or_else(|| ExtensionError::NotFound(config.name().to_string()))?;
        let extension = builder(ctx)?;
        Ok(extension.with_timeout(config.timeout()))
    }
}

impl Default for ExtensionCatalog {
    fn default() -> Self {
        Self::with_builtins()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ctx() -> ExtensionContext {
        ExtensionContext {
            working_dir: std::env::temp_dir(),
            allowed_commands: vec!["ls".into()],
            tool_timeout: Duration::from_secs(5),
        }
    }

    #[test]
    fn test_instantiate_and_scope() {
        let catalog = ExtensionCatalog::with_builtins();
        let mut set = ExtensionSet::new();
        set.insert(catalog.instantiate(&ExtensionConfig::builtin("developer"), &ctx()).unwrap());
        set.insert(catalog.instantiate(&ExtensionConfig::builtin("echo"), &ctx()).unwrap());

        let all: Vec<String> = set.tools(None).into_iter().map(|t| t.full_name).collect();
        assert!(all.contains(&"developer__shell".to_string()));
        assert!(all.contains(&"echo__echo".to_string()));

        let scope = ExtensionScope::new(["echo"]);
        let scoped: Vec<String> = set.tools(Some(&scope)).into_iter().map(|t| t.full_name).collect();
        assert_eq!(scoped, vec!["echo__echo".to_string()]);

        let empty = ExtensionScope::default();
        assert!(set.tools(Some(&empty)).is_empty());
    }

    #[test]
    fn test_unknown_extension() {
        let catalog = ExtensionCatalog::with_builtins();
        let err = catalog
            .instantiate(&ExtensionConfig::builtin("github"), &ctx())
            .err()
            .unwrap();
        assert_eq!(err, ExtensionError::NotFound("github".into()));
        assert_eq!(err.kind(), ErrorKind::Precondition);
    }

    #[test]
    fn test_remove_not_enabled() {
        let mut set = ExtensionSet::new();
        assert!(matches!(set.remove("echo"), Err(ExtensionError::NotEnabled(_))));
    }

    #[test]
    fn test_narrow_scope() {
        let declared = vec![ExtensionConfig::Builtin {
            name: "developer".into(),
            display_name: None,
            timeout: Some(9),
        }];
        let narrowed = ExtensionScope::new(["developer", "echo"]).narrow(&declared);
        assert_eq!(narrowed[0].timeout(), Some(Duration::from_secs(9)));
        assert_eq!(narrowed[1], ExtensionConfig::builtin("echo"));
    }

    #[test]
    fn test_yaml_shape() {
        let cfg: ExtensionConfig =
            serde_yaml::from_str("type: builtin\nname: developer\ntimeout: 300\nbundled: true\n").unwrap();
        assert_eq!(cfg.name(), "developer");
        assert_eq!(cfg.timeout(), Some(Duration::from_secs(300)));
    }
}
