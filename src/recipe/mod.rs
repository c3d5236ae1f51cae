//! Recipe：可复用的任务描述
//!
//! 一个 Recipe 携带指令 / 首条提示、所需扩展、参数声明、子 Recipe、输出 schema 与重试配置。
//! 来源可以是文件、内联对象或一段纯文本；三者最终都解析成同一个 `Recipe` 值。

pub mod deeplink;
pub mod library;
pub mod loader;
pub mod security;
pub mod template;

use std::collections::{HashMap, HashSet};
use std::path::PathBuf;

use serde::{Deserialize, Deserializer, Serialize};
use thiserror::Error;

use crate::core::ErrorKind;
use crate::extensions::ExtensionConfig;

pub use library::{RecipeLibrary, RecipeManifest};
pub use loader::{load_recipe_file, parse_recipe, RecipeFormat};
pub use security::{scan_recipe, SecurityWarning};

/// 文本来源合成的 Recipe 标题
pub const ADHOC_TITLE: &str = "Ad-hoc task";

/// 成功检查默认超时（秒）
pub const DEFAULT_CHECK_TIMEOUT_SECS: u64 = 300;
/// on_failure 默认超时（秒）
pub const DEFAULT_ON_FAILURE_TIMEOUT_SECS: u64 = 600;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum RecipeError {
    #[error("Recipe file not found: {0}")]
    NotFound(PathBuf),

    #[error("Failed to read recipe {path}: {message}")]
    Io { path: PathBuf, message: String },

    #[error("Failed to parse recipe: {0}")]
    Parse(String),

    #[error("Invalid recipe: {0}")]
    Invalid(String),

    #[error("Missing required parameters: {}", .0.join(", "))]
    MissingParameters(Vec<String>),

    #[error("Invalid value for parameter '{key}': {reason}")]
    InvalidParameter { key: String, reason: String },

    #[error("Template uses undeclared parameters: {}", .0.join(", "))]
    UndeclaredPlaceholders(Vec<String>),

    #[error("Invalid recipe deep link: {0}")]
    Deeplink(String),

    #[error("Recipe not in library: {0}")]
    NotInLibrary(String),
}

impl RecipeError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            RecipeError::NotInLibrary(_) => ErrorKind::NotFound,
            _ => ErrorKind::Resolution,
        }
    }
}

fn default_version() -> String {
    "1.0.0".to_string()
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Recipe {
    #[serde(default = "default_version")]
    pub version: String,
    pub title: String,
    #[serde(default)]
    pub description: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub instructions: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prompt: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub extensions: Option<Vec<ExtensionConfig>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub context: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub settings: Option<Settings>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub activities: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub author: Option<Author>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parameters: Option<Vec<RecipeParameter>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub response: Option<Response>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sub_recipes: Option<Vec<SubRecipe>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry: Option<RetryConfig>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct Settings {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub provider: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f32>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct Author {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub contact: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ParameterInputType {
    String,
    Number,
    Boolean,
    Date,
    File,
    Select,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ParameterRequirement {
    Required,
    Optional,
    UserPrompt,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecipeParameter {
    pub key: String,
    pub input_type: ParameterInputType,
    pub requirement: ParameterRequirement,
    #[serde(default)]
    pub description: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub options: Option<Vec<String>>,
}

/// 最终输出约束
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Response {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub json_schema: Option<serde_json::Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubRecipe {
    pub name: String,
    pub path: String,
    #[serde(
        default,
        deserialize_with = "deserialize_values",
        skip_serializing_if = "Option::is_none"
    )]
    pub values: Option<HashMap<String, String>>,
    #[serde(default)]
    pub sequential_when_repeated: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

/// 非字符串值（数字、布尔）转成字符串
fn deserialize_values<'de, D>(deserializer: D) -> Result<Option<HashMap<String, String>>, D::Error>
where
    D: Deserializer<'de>,
{
    let raw: Option<HashMap<String, serde_json::Value>> = Option::deserialize(deserializer)?;
    Ok(raw.map(|map| {
        map.into_iter()
            .map(|(k, v)| {
                let s = match v {
                    serde_json::Value::String(s) => s,
                    other => other.to_string(),
                };
                (k, s)
            })
            .collect()
    }))
}

/// 成功检查
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SuccessCheck {
    Shell { command: String },
}

/// 重试与校验配置
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryConfig {
    /// 首次之外的最大重试次数
    pub max_retries: u32,
    #[serde(default)]
    pub checks: Vec<SuccessCheck>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub on_failure: Option<String>,
    /// 每条检查命令的超时（秒），默认 300
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_seconds: Option<u64>,
    /// on_failure 命令超时（秒），默认 600
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub on_failure_timeout_seconds: Option<u64>,
}

impl RetryConfig {
    pub fn check_timeout_secs(&self) -> u64 {
        self.timeout_seconds.unwrap_or(DEFAULT_CHECK_TIMEOUT_SECS)
    }

    pub fn on_failure_timeout_secs(&self) -> u64 {
        self.on_failure_timeout_seconds
            .unwrap_or(DEFAULT_ON_FAILURE_TIMEOUT_SECS)
    }

    pub fn validate(&self) -> Result<(), RecipeError> {
        for check in &self.checks {
            let SuccessCheck::Shell { command } = check;
            if command.trim().is_empty() {
                return Err(RecipeError::Invalid("retry check command is empty".into()));
            }
        }
        if matches!(self.timeout_seconds, Some(0)) || matches!(self.on_failure_timeout_seconds, Some(0)) {
            return Err(RecipeError::Invalid("retry timeouts must be positive".into()));
        }
        Ok(())
    }
}

impl Recipe {
    pub fn builder() -> RecipeBuilder {
        RecipeBuilder::default()
    }

    /// 纯文本合成：文本作为 instructions，没有 prompt
    pub fn from_text(text: impl Into<String>) -> Self {
        Recipe {
            version: default_version(),
            title: ADHOC_TITLE.to_string(),
            description: String::new(),
            instructions: Some(text.into()),
            prompt: None,
            extensions: None,
            context: None,
            settings: None,
            activities: None,
            author: None,
            parameters: None,
            response: None,
            sub_recipes: None,
            retry: None,
        }
    }

    pub fn is_adhoc(&self) -> bool {
        self.title == ADHOC_TITLE && self.prompt.is_none()
    }

    /// 本次运行的用户消息：有 prompt 用 prompt，否则用 instructions
    pub fn initial_message(&self) -> Option<&str> {
        self.prompt
            .as_deref()
            .or(self.instructions.as_deref())
            .filter(|s| !s.trim().is_empty())
    }

    /// 进入 system prompt 的指令：仅当同时有 prompt 时 instructions 才作为系统上下文
    pub fn system_instructions(&self) -> Option<String> {
        let mut parts = Vec::new();
        if self.prompt.is_some() {
            if let Some(i) = &self.instructions {
                parts.push(i.clone());
            }
        }
        if let Some(ctx) = &self.context {
            if !ctx.is_empty() {
                parts.push(format!("Context:\n{}", ctx.join("\n")));
            }
        }
        if parts.is_empty() {
            None
        } else {
            Some(parts.join("\n\n"))
        }
    }

    pub fn extension_configs(&self) -> Vec<ExtensionConfig> {
        self.extensions.clone().unwrap_or_default()
    }

    pub fn response_schema(&self) -> Option<&serde_json::Value> {
        self.response.as_ref().and_then(|r| r.json_schema.as_ref())
    }

    pub fn validate(&self) -> Result<(), RecipeError> {
        if self.title.trim().is_empty() {
            return Err(RecipeError::Invalid("title must not be empty".into()));
        }
        if self.initial_message().is_none() {
            return Err(RecipeError::Invalid(
                "recipe needs instructions or a prompt".into(),
            ));
        }
        if let Some(params) = &self.parameters {
            let mut seen = HashSet::new();
            for p in params {
                if !seen.insert(p.key.as_str()) {
                    return Err(RecipeError::Invalid(format!("duplicate parameter '{}'", p.key)));
                }
                if p.requirement == ParameterRequirement::Optional && p.default.is_none() {
                    return Err(RecipeError::Invalid(format!(
                        "optional parameter '{}' needs a default",
                        p.key
                    )));
                }
                if p.input_type == ParameterInputType::Select
                    && p.options.as_ref().map(|o| o.is_empty()).unwrap_or(true)
                {
                    return Err(RecipeError::Invalid(format!(
                        "select parameter '{}' needs options",
                        p.key
                    )));
                }
            }
        }
        if let Some(subs) = &self.sub_recipes {
            let mut seen = HashSet::new();
            for s in subs {
                if !seen.insert(s.name.as_str()) {
                    return Err(RecipeError::Invalid(format!("duplicate sub-recipe '{}'", s.name)));
                }
            }
        }
        if let Some(retry) = &self.retry {
            retry.validate()?;
        }
        Ok(())
    }
}

/// Recipe 构造器
#[derive(Debug, Default)]
pub struct RecipeBuilder {
    title: Option<String>,
    description: String,
    instructions: Option<String>,
    prompt: Option<String>,
    extensions: Vec<ExtensionConfig>,
    activities: Vec<String>,
    sub_recipes: Vec<SubRecipe>,
    retry: Option<RetryConfig>,
    response_schema: Option<serde_json::Value>,
    settings: Option<Settings>,
}

impl RecipeBuilder {
    pub fn title(mut self, title: impl Into<String>) -> Self {
        self.title = Some(title.into());
        self
    }

    pub fn description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    pub fn instructions(mut self, instructions: impl Into<String>) -> Self {
        self.instructions = Some(instructions.into());
        self
    }

    pub fn prompt(mut self, prompt: impl Into<String>) -> Self {
        self.prompt = Some(prompt.into());
        self
    }

    pub fn extension(mut self, extension: ExtensionConfig) -> Self {
        self.extensions.push(extension);
        self
    }

    pub fn activities(mut self, activities: Vec<String>) -> Self {
        self.activities = activities;
        self
    }

    pub fn sub_recipe(mut self, sub: SubRecipe) -> Self {
        self.sub_recipes.push(sub);
        self
    }

    pub fn retry(mut self, retry: RetryConfig) -> Self {
        self.retry = Some(retry);
        self
    }

    pub fn response_schema(mut self, schema: serde_json::Value) -> Self {
        self.response_schema = Some(schema);
        self
    }

    pub fn settings(mut self, settings: Settings) -> Self {
        self.settings = Some(settings);
        self
    }

    pub fn build(self) -> Result<Recipe, RecipeError> {
        let non_empty = |v: Vec<String>| if v.is_empty() { None } else { Some(v) };
        let recipe = Recipe {
            version: default_version(),
            title: self
                .title
                .ok_or_else(|| RecipeError::Invalid("title is required".into()))?,
            description: self.description,
            instructions: self.instructions,
            prompt: self.prompt,
            extensions: if self.extensions.is_empty() {
                None
            } else {
                Some(self.extensions)
            },
            context: None,
            settings: self.settings,
            activities: non_empty(self.activities),
            author: None,
            parameters: None,
            response: self.response_schema.map(|s| Response {
                json_schema: Some(s),
            }),
            sub_recipes: if self.sub_recipes.is_empty() {
                None
            } else {
                Some(self.sub_recipes)
            },
            retry: self.retry,
        };
        recipe.validate()?;
        Ok(recipe)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_text_recipe_messages() {
        let r = Recipe::from_text("list files");
        assert!(r.is_adhoc());
        assert_eq!(r.initial_message(), Some("list files"));
        assert_eq!(r.system_instructions(), None);
        r.validate().unwrap();
    }

    #[test]
    fn test_prompt_moves_instructions_to_system() {
        let r = Recipe::builder()
            .title("Digest")
            .instructions("You summarise news.")
            .prompt("Summarise today")
            .build()
            .unwrap();
        assert_eq!(r.initial_message(), Some("Summarise today"));
        assert_eq!(r.system_instructions().as_deref(), Some("You summarise news."));
    }

    #[test]
    fn test_validation_errors() {
        assert!(Recipe::builder().title("x").build().is_err());
        assert!(Recipe::builder().instructions("x").build().is_err());

        let mut r = Recipe::from_text("x");
        r.parameters = Some(vec![RecipeParameter {
            key: "n".into(),
            input_type: ParameterInputType::String,
            requirement: ParameterRequirement::Optional,
            description: String::new(),
            default: None,
            options: None,
        }]);
        assert!(matches!(r.validate(), Err(RecipeError::Invalid(msg)) if msg.contains("default")));
    }

    #[test]
    fn test_sub_recipe_values_stringified() {
        let yaml = "name: child\npath: ./child.yaml\nvalues:\n  count: 3\n  flag: true\n  name: x\n";
        let sub: SubRecipe = serde_yaml::from_str(yaml).unwrap();
        let values = sub.values.unwrap();
        assert_eq!(values["count"], "3");
        assert_eq!(values["flag"], "true");
        assert_eq!(values["name"], "x");
        assert!(!sub.sequential_when_repeated);
    }

    #[test]
    fn test_retry_defaults() {
        let retry: RetryConfig = serde_yaml::from_str(
            "max_retries: 2\nchecks:\n  - type: shell\n    command: test -f out.txt\n",
        )
        .unwrap();
        assert_eq!(retry.check_timeout_secs(), 300);
        assert_eq!(retry.on_failure_timeout_secs(), 600);
        retry.validate().unwrap();
    }
}
