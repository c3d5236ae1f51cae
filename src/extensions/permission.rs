//! 工具权限与人工确认
//!
//! 每个工具有一个权限级别；ask_before 的调用在有实时消费者时发出确认请求，
//! 由 ConfirmationRouter 按 request_id 把用户的决定送回等待中的回复循环。

use std::collections::HashMap;
use std::sync::Mutex;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::oneshot;

use crate::core::ErrorKind;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum PermissionLevel {
    #[default]
    AlwaysAllow,
    AskBefore,
    NeverAllow,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PermissionDecision {
    Confirm,
    Deny,
}

#[derive(Error, Debug, Clone, PartialEq)]
pub enum PermissionError {
    #[error("No pending confirmation with id {0}")]
    UnknownRequest(String),
}

impl PermissionError {
    pub fn kind(&self) -> ErrorKind {
        ErrorKind::NotFound
    }
}

/// 工具全名到权限级别
#[derive(Debug, Clone, Default)]
pub struct ToolPermissions {
    levels: HashMap<String, PermissionLevel>,
}

impl ToolPermissions {
    pub fn new(levels: HashMap<String, PermissionLevel>) -> Self {
        Self { levels }
    }

    pub fn level(&self, full_name: &str) -> PermissionLevel {
        self.levels.get(full_name).copied().unwrap_or_default()
    }

    pub fn set(&mut self, full_name: impl Into<String>, level: PermissionLevel) {
        self.levels.insert(full_name.into(), level);
    }
}

/// 等待中的确认请求
#[derive(Debug, Default)]
pub struct ConfirmationRouter {
    pending: Mutex<HashMap<String, oneshot::Sender<PermissionDecision>>>,
}

impl ConfirmationRouter {
    pub fn new() -> Self {
        Self::default()
    }

    /// 登记一个请求，返回等待决定的接收端
    pub fn register(&self, request_id: &str) -> oneshot::Receiver<PermissionDecision> {
        let (tx, rx) = oneshot::channel();
        if let Ok(mut pending) = self.pending.lock() {
            pending.insert(request_id.to_string(), tx);
        }
        rx
    }

    /// 提交决定；请求不存在（已超时或已处理）时返回错误
    pub fn resolve(&self, request_id: &str, decision: PermissionDecision) -> Result<(), PermissionError> {
        let sender = self
            .pending
            .lock()
            .ok()
            .and_then(|mut pending| pending.remove(request_id))
            .ok_or_else(|| PermissionError::UnknownRequest(request_id.to_string()))?;
        sender
            .send(decision)
            .map_err(|_| PermissionError::UnknownRequest(request_id.to_string()))
    }

    pub fn forget(&self, request_id: &str) {
        if let Ok(mut pending) = self.pending.lock() {
            pending.remove(request_id);
        }
    }

    pub fn pending_count(&self) -> usize {
        self.pending.lock().map(|p| p.len()).unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_register_and_resolve() {
        let router = ConfirmationRouter::new();
        let rx = router.register("r1");
        assert_eq!(router.pending_count(), 1);
        router.resolve("r1", PermissionDecision::Deny).unwrap();
        assert_eq!(rx.await.unwrap(), PermissionDecision::Deny);
        assert_eq!(router.pending_count(), 0);
    }

    #[test]
    fn test_resolve_unknown() {
        let router = ConfirmationRouter::new();
        assert_eq!(
            router.resolve("missing", PermissionDecision::Confirm),
            Err(PermissionError::UnknownRequest("missing".into()))
        );
    }

    #[test]
    fn test_levels_default_allow() {
        let mut perms = ToolPermissions::default();
        assert_eq!(perms.level("developer__shell"), PermissionLevel::AlwaysAllow);
        perms.set("developer__shell", PermissionLevel::NeverAllow);
        assert_eq!(perms.level("developer__shell"), PermissionLevel::NeverAllow);
    }
}
