//! echo 扩展：回显文本（测试与连通性检查）

use async_trait::async_trait;
use schemars::JsonSchema;
use serde::Deserialize;
use serde_json::Value;

use crate::extensions::builtin::schema_of;
use crate::extensions::{Extension, Tool, ToolRegistry};

#[derive(Debug, Deserialize, JsonSchema)]
struct EchoArgs {
    /// 要回显的文本
    #[serde(default)]
    text: Option<String>,
}

/// Echo 工具：回显文本
pub struct EchoTool;

#[async_trait]
impl Tool for EchoTool {
    fn name(&self) -> &str {
        "echo"
    }

    fn description(&self) -> &str {
        "Echo text back. Args: {\"text\": \"message\"}"
    }

    fn parameters_schema(&self) -> Value {
        schema_of::<EchoArgs>()
    }

    async fn execute(&self, args: Value) -> Result<String, String> {
        let args: EchoArgs = serde_json::from_value(args).map_err(|e| e.to_string())?;
        Ok(args.text.unwrap_or_else(|| "(empty)".to_string()))
    }
}

pub fn echo_extension() -> Extension {
    let mut tools = ToolRegistry::new();
    tools.register(EchoTool);
    Extension::new("echo", "Echo text back to the caller", tools)
}
