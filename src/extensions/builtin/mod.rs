//! 内置扩展：developer（shell / read_file / list_dir）与 echo

pub mod developer;
pub mod echo;

use schemars::{schema_for, JsonSchema};
use serde_json::Value;

pub use developer::{developer_extension, forbidden_pattern, ListDirTool, ReadFileTool, SafeFs, ShellTool};
pub use echo::{echo_extension, EchoTool};

/// 由参数结构体生成 JSON Schema（供 prompt 中的工具说明）
pub(crate) fn schema_of<T: JsonSchema>() -> Value {
    serde_json::to_value(schema_for!(T)).unwrap_or_else(|_| serde_json::json!({ "type": "object" }))
}
