//! 会话存储
//!
//! Session 是每次执行留下的唯一持久记录：对话、token 计数、绑定的 Recipe、调度关联。
//! 无论由交互、调度还是子任务触发，都通过同一个 SessionStore 读写与列出。
//! 存储本身不含业务行为，只由执行器写入。

pub mod memory;
pub mod sqlite;

use std::path::PathBuf;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::conversation::Message;
use crate::core::ErrorKind;
use crate::llm::Usage;
use crate::recipe::Recipe;

pub use memory::MemorySessionStore;
pub use sqlite::SqliteSessionStore;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum SessionStoreError {
    #[error("Session not found: {0}")]
    NotFound(String),

    #[error("Session storage error: {0}")]
    Backend(String),
}

impl SessionStoreError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            SessionStoreError::NotFound(_) => ErrorKind::NotFound,
            SessionStoreError::Backend(_) => ErrorKind::Internal,
        }
    }
}

/// 会话来源
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum SessionType {
    #[default]
    User,
    Scheduled,
    SubAgent,
}

impl SessionType {
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionType::User => "user",
            SessionType::Scheduled => "scheduled",
            SessionType::SubAgent => "sub_agent",
        }
    }

    pub fn parse(s: &str) -> Self {
        match s {
            "scheduled" => SessionType::Scheduled,
            "sub_agent" => SessionType::SubAgent,
            _ => SessionType::User,
        }
    }
}

/// 最近一次运行的状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    #[default]
    Idle,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl SessionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionStatus::Idle => "idle",
            SessionStatus::Running => "running",
            SessionStatus::Completed => "completed",
            SessionStatus::Failed => "failed",
            SessionStatus::Cancelled => "cancelled",
        }
    }

    pub fn parse(s: &str) -> Self {
        match s {
            "running" => SessionStatus::Running,
            "completed" => SessionStatus::Completed,
            "failed" => SessionStatus::Failed,
            "cancelled" => SessionStatus::Cancelled,
            _ => SessionStatus::Idle,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Session {
    pub id: String,
    pub description: String,
    pub working_dir: PathBuf,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub messages: Vec<Message>,
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub total_tokens: u64,
    pub recipe: Option<Recipe>,
    pub schedule_id: Option<String>,
    pub session_type: SessionType,
    pub parent_session_id: Option<String>,
    pub status: SessionStatus,
    pub failure: Option<String>,
}

impl Session {
    pub fn new(id: impl Into<String>, seed: SessionSeed) -> Self {
        let now = Utc::now();
        Self {
            id: id.into(),
            description: seed.description,
            working_dir: seed.working_dir,
            created_at: now,
            updated_at: now,
            messages: Vec::new(),
            input_tokens: 0,
            output_tokens: 0,
            total_tokens: 0,
            recipe: None,
            schedule_id: seed.schedule_id,
            session_type: seed.session_type,
            parent_session_id: seed.parent_session_id,
            status: SessionStatus::Idle,
            failure: None,
        }
    }

    pub fn message_count(&self) -> usize {
        self.messages.len()
    }

    pub fn summary(&self) -> SessionSummary {
        SessionSummary {
            id: self.id.clone(),
            description: self.description.clone(),
            created_at: self.created_at,
            updated_at: self.updated_at,
            message_count: self.messages.len(),
            total_tokens: self.total_tokens,
            schedule_id: self.schedule_id.clone(),
            session_type: self.session_type,
            status: self.status,
        }
    }

    pub(crate) fn record_usage(&mut self, usage: Usage) {
        self.input_tokens += usage.input_tokens;
        self.output_tokens += usage.output_tokens;
        self.total_tokens = self.input_tokens + self.output_tokens;
    }
}

/// 首次创建会话时使用的初始字段；会话已存在时被忽略
#[derive(Debug, Clone, Default)]
pub struct SessionSeed {
    pub working_dir: PathBuf,
    pub description: String,
    pub session_type: SessionType,
    pub parent_session_id: Option<String>,
    pub schedule_id: Option<String>,
}

impl SessionSeed {
    pub fn new(working_dir: impl Into<PathBuf>, session_type: SessionType) -> Self {
        Self {
            working_dir: working_dir.into(),
            session_type,
            ..Default::default()
        }
    }

    pub fn with_parent(mut self, parent: impl Into<String>) -> Self {
        self.parent_session_id = Some(parent.into());
        self
    }

    pub fn with_schedule(mut self, schedule_id: impl Into<String>) -> Self {
        self.schedule_id = Some(schedule_id.into());
        self
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }
}

/// 会话列表项
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionSummary {
    pub id: String,
    pub description: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub message_count: usize,
    pub total_tokens: u64,
    pub schedule_id: Option<String>,
    pub session_type: SessionType,
    pub status: SessionStatus,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionInsights {
    pub total_sessions: usize,
    pub total_tokens: u64,
}

/// 新会话 id：`YYYYMMDD_HHMMSS_<8 hex>`
pub fn new_session_id() -> String {
    let suffix = uuid::Uuid::new_v4().simple().to_string();
    format!("{}_{}", Utc::now().format("%Y%m%d_%H%M%S"), &suffix[..8])
}

/// 会话持久化接口；同一 id 的写入由执行器串行化
#[async_trait]
pub trait SessionStore: Send + Sync {
    /// 返回已有会话，或用 seed 新建
    async fn get_or_create(&self, id: &str, seed: SessionSeed) -> Result<Session, SessionStoreError>;

    async fn get(&self, id: &str) -> Result<Session, SessionStoreError>;

    /// 按更新时间倒序
    async fn list(&self) -> Result<Vec<SessionSummary>, SessionStoreError>;

    async fn delete(&self, id: &str) -> Result<(), SessionStoreError>;

    async fn update_description(&self, id: &str, description: &str) -> Result<(), SessionStoreError>;

    /// 追加消息并累加 token 计数
    async fn append_messages(
        &self,
        id: &str,
        messages: &[Message],
        usage: Usage,
    ) -> Result<(), SessionStoreError>;

    async fn set_recipe(&self, id: &str, recipe: Option<Recipe>) -> Result<(), SessionStoreError>;

    async fn set_schedule_id(&self, id: &str, schedule_id: &str) -> Result<(), SessionStoreError>;

    async fn set_status(
        &self,
        id: &str,
        status: SessionStatus,
        failure: Option<String>,
    ) -> Result<(), SessionStoreError>;

    async fn list_by_schedule(&self, schedule_id: &str) -> Result<Vec<SessionSummary>, SessionStoreError> {
        Ok(self
            .list()
            .await?
            .into_iter()
            .filter(|s| s.schedule_id.as_deref() == Some(schedule_id))
            .collect())
    }

    async fn insights(&self) -> Result<SessionInsights, SessionStoreError> {
        let sessions = self.list().await?;
        Ok(SessionInsights {
            total_sessions: sessions.len(),
            total_tokens: sessions.iter().map(|s| s.total_tokens).sum(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_session_id_shape() {
        let id = new_session_id();
        let parts: Vec<&str> = id.split('_').collect();
        assert_eq!(parts.len(), 3);
        assert_eq!(parts[0].len(), 8);
        assert_eq!(parts[1].len(), 6);
        assert_eq!(parts[2].len(), 8);
        assert!(parts[2].chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn test_enum_strings() {
        for t in [SessionType::User, SessionType::Scheduled, SessionType::SubAgent] {
            assert_eq!(SessionType::parse(t.as_str()), t);
        }
        for s in [
            SessionStatus::Idle,
            SessionStatus::Running,
            SessionStatus::Completed,
            SessionStatus::Failed,
            SessionStatus::Cancelled,
        ] {
            assert_eq!(SessionStatus::parse(s.as_str()), s);
        }
    }
}
