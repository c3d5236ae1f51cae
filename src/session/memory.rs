//! 内存会话存储（测试与 `backend = "memory"`）

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::RwLock;

use crate::conversation::Message;
use crate::llm::Usage;
use crate::recipe::Recipe;
use crate::session::{
    Session, SessionSeed, SessionStatus, SessionStore, SessionStoreError, SessionSummary,
};

#[derive(Default)]
pub struct MemorySessionStore {
    sessions: RwLock<HashMap<String, Session>>,
}

impl MemorySessionStore {
    pub fn new() -> Self {
        Self::default()
    }

    async fn with_session<R>(
        &self,
        id: &str,
        f: impl FnOnce(&mut Session) -> R,
    ) -> Result<R, SessionStoreError> {
        let mut sessions = self.sessions.write().await;
        let session = sessions
            .get_mut(id)
            .ok_or_else(|| SessionStoreError::NotFound(id.to_string()))?;
        let out = f(session);
        session.updated_at = Utc::now();
        Ok(out)
    }
}

#[async_trait]
impl SessionStore for MemorySessionStore {
    async fn get_or_create(&self, id: &str, seed: SessionSeed) -> Result<Session, SessionStoreError> {
        let mut sessions = self.sessions.write().await;
        let session = sessions
            .entry(id.to_string())
            .or_insert_with(|| Session::new(id, seed));
        Ok(session.clone())
    }

    async fn get(&self, id: &str) -> Result<Session, SessionStoreError> {
        self.sessions
            .read()
            .await
            .get(id)
            .cloned()
            .ok_or_else(|| SessionStoreError::NotFound(id.to_string()))
    }

    async fn list(&self) -> Result<Vec<SessionSummary>, SessionStoreError> {
        let mut out: Vec<SessionSummary> =
            self.sessions.read().await.values().map(Session::summary).collect();
        out.sort_by(|a, b| b.updated_at.cmp(&a.updated_at).then(b.id.cmp(&a.id)));
        Ok(out)
    }

    async fn delete(&self, id: &str) -> Result<(), SessionStoreError> {
        self.sessions
            .write()
            .await
            .remove(id)
            .map(|_| ())
            .ok_or_else(|| SessionStoreError::NotFound(id.to_string()))
    }

    async fn update_description(&self, id: &str, description: &str) -> Result<(), SessionStoreError> {
        self.with_session(id, |s| s.description = description.to_string()).await
    }

    async fn append_messages(
        &self,
        id: &str,
        messages: &[Message],
        usage: Usage,
    ) -> Result<(), SessionStoreError> {
        self.with_session(id, |s| {
            s.messages.extend_from_slice(messages);
            s.record_usage(usage);
        })
        .await
    }

    async fn set_recipe(&self, id: &str, recipe: Option<Recipe>) -> Result<(), SessionStoreError> {
        self.with_session(id, |s| s.recipe = recipe).await
    }

    async fn set_schedule_id(&self, id: &str, schedule_id: &str) -> Result<(), SessionStoreError> {
        self.with_session(id, |s| s.schedule_id = Some(schedule_id.to_string())).await
    }

    async fn set_status(
        &self,
        id: &str,
        status: SessionStatus,
        failure: Option<String>,
    ) -> Result<(), SessionStoreError> {
        self.with_session(id, |s| {
            s.status = status;
            s.failure = failure;
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::SessionType;

    #[tokio::test]
    async fn test_get_or_create_is_idempotent() {
        let store = MemorySessionStore::new();
        let seed = SessionSeed::new("/tmp", SessionType::User).with_description("first");
        store.get_or_create("s1", seed).await.unwrap();
        store
            .append_messages("s1", &[Message::user("hi")], Usage::new(3, 4))
            .await
            .unwrap();

        let again = store
            .get_or_create("s1", SessionSeed::new("/other", SessionType::Scheduled))
            .await
            .unwrap();
        assert_eq!(again.description, "first");
        assert_eq!(again.session_type, SessionType::User);
        assert_eq!(again.message_count(), 1);
        assert_eq!(again.total_tokens, 7);
    }

    #[tokio::test]
    async fn test_schedule_listing_and_insights() {
        let store = MemorySessionStore::new();
        for id in ["a", "b", "c"] {
            store
                .get_or_create(id, SessionSeed::new("/tmp", SessionType::Scheduled))
                .await
                .unwrap();
        }
        store.set_schedule_id("a", "job").await.unwrap();
        store.set_schedule_id("c", "job").await.unwrap();
        store
            .append_messages("b", &[], Usage::new(10, 5))
            .await
            .unwrap();

        let ids: Vec<String> = store
            .list_by_schedule("job")
            .await
            .unwrap()
            .into_iter()
            .map(|s| s.id)
            .collect();
        assert_eq!(ids.len(), 2);
        assert!(ids.contains(&"a".to_string()) && ids.contains(&"c".to_string()));

        let insights = store.insights().await.unwrap();
        assert_eq!(insights.total_sessions, 3);
        assert_eq!(insights.total_tokens, 15);
    }

    #[tokio::test]
    async fn test_missing_session() {
        let store = MemorySessionStore::new();
        assert_eq!(
            store.set_status("nope", SessionStatus::Failed, None).await,
            Err(SessionStoreError::NotFound("nope".into()))
        );
        assert!(store.delete("nope").await.is_err());
    }
}
