//! Apiary - 统一 Agent 执行层
//!
//! 模块划分：
//! - **agent**: 会话级 Agent（回复循环、平台工具、工厂）与 Agent 管理器
//! - **config**: 应用配置加载（TOML + 环境变量）
//! - **conversation**: 消息模型与可见性
//! - **core**: 错误分类、恢复策略、会话监管、工作池、优雅关闭
//! - **execution**: 归一化请求、统一执行器、成功校验与重试
//! - **extensions**: 扩展目录、工具执行、权限与工具选择
//! - **llm**: LLM 客户端抽象与实现（OpenAI 兼容 / Mock）及 provider 注册表
//! - **recipe**: Recipe 模型、加载、模板、深链接、安全扫描、本地库
//! - **runtime**: 组装全部组件的门面
//! - **scheduler**: cron 调度
//! - **session**: 会话存储（内存 / SQLite）
//! - **tasks**: 子任务扇出

pub mod agent;
pub mod config;
pub mod conversation;
pub mod core;
pub mod execution;
pub mod extensions;
pub mod llm;
pub mod observability;
pub mod recipe;
pub mod runtime;
pub mod scheduler;
#[cfg(feature = "server")]
pub mod server;
pub mod session;
pub mod tasks;

pub use runtime::{ApiaryRuntime, RuntimeError};
