//! 扩展层：工具 trait 与注册表、扩展实例与目录、执行器、权限确认、工具选择策略

pub mod builtin;
pub mod executor;
pub mod extension;
pub mod permission;
pub mod selector;
pub mod tool;

pub use executor::ToolExecutor;
pub use extension::{
    Extension, ExtensionCatalog, ExtensionConfig, ExtensionContext, ExtensionError, ExtensionScope,
    ExtensionSet, ToolEntry, TOOL_SEPARATOR,
};
pub use permission::{
    ConfirmationRouter, PermissionDecision, PermissionError, PermissionLevel, ToolPermissions,
};
pub use selector::ToolSelection;
pub use tool::{Tool, ToolRegistry};
