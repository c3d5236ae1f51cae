//! SQLite 会话存储
//!
//! sessions 表存元数据，messages 表按 (session_id, seq) 存消息 JSON。
//! 连接放在 tokio Mutex 里，所有语句在持锁期间同步执行。

use std::path::Path;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use tokio::sync::Mutex;

use crate::conversation::Message;
use crate::llm::Usage;
use crate::recipe::Recipe;
use crate::session::{
    Session, SessionInsights, SessionSeed, SessionStatus, SessionStore, SessionStoreError,
    SessionSummary, SessionType,
};

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS sessions (
    id TEXT PRIMARY KEY,
    description TEXT NOT NULL DEFAULT '',
    working_dir TEXT NOT NULL,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL,
    input_tokens INTEGER NOT NULL DEFAULT 0,
    output_tokens INTEGER NOT NULL DEFAULT 0,
    total_tokens INTEGER NOT NULL DEFAULT 0,
    recipe_json TEXT,
    schedule_id TEXT,
    session_type TEXT NOT NULL,
    parent_session_id TEXT,
    status TEXT NOT NULL,
    failure TEXT
);
CREATE INDEX IF NOT EXISTS idx_sessions_schedule ON sessions(schedule_id);
CREATE TABLE IF NOT EXISTS messages (
    session_id TEXT NOT NULL,
    seq INTEGER NOT NULL,
    message_json TEXT NOT NULL,
    PRIMARY KEY (session_id, seq)
);
"#;

const SUMMARY_COLUMNS: &str = "s.id, s.description, s.created_at, s.updated_at, s.total_tokens, \
     s.schedule_id, s.session_type, s.status, \
     (SELECT COUNT(*) FROM messages m WHERE m.session_id = s.id)";

fn backend(context: &str, err: impl std::fmt::Display) -> SessionStoreError {
    SessionStoreError::Backend(format!("{context}: {err}"))
}

fn parse_time(raw: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(raw)
        .map(|t| t.with_timezone(&Utc))
        .unwrap_or_else(|_| Utc::now())
}

fn now_str() -> String {
    Utc::now().to_rfc3339()
}

pub struct SqliteSessionStore {
    conn: Mutex<Connection>,
}

impl SqliteSessionStore {
    pub fn open(path: &Path) -> Result<Self, SessionStoreError> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent).map_err(|e| backend("create db dir", e))?;
            }
        }
        let conn = Connection::open(path).map_err(|e| backend("open session db", e))?;
        tracing::info!(path = %path.display(), "session store opened");
        Self::with_connection(conn)
    }

    pub fn open_in_memory() -> Result<Self, SessionStoreError> {
        let conn = Connection::open_in_memory().map_err(|e| backend("open session db", e))?;
        Self::with_connection(conn)
    }

    fn with_connection(conn: Connection) -> Result<Self, SessionStoreError> {
        conn.execute_batch(SCHEMA)
            .map_err(|e| backend("ensure schema", e))?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn load(conn: &Connection, id: &str) -> Result<Option<Session>, SessionStoreError> {
        let row = conn
            .query_row(
                "SELECT id, description, working_dir, created_at, updated_at, input_tokens, \
                 output_tokens, total_tokens, recipe_json, schedule_id, session_type, \
                 parent_session_id, status, failure FROM sessions WHERE id = ?1",
                params![id],
                |r| {
                    Ok((
                        r.get::<_, String>(0)?,
                        r.get::<_, String>(1)?,
                        r.get::<_, String>(2)?,
                        r.get::<_, String>(3)?,
                        r.get::<_, String>(4)?,
                        [r.get::<_, i64>(5)?, r.get::<_, i64>(6)?, r.get::<_, i64>(7)?],
                        r.get::<_, Option<String>>(8)?,
                        r.get::<_, Option<String>>(9)?,
                        r.get::<_, String>(10)?,
                        r.get::<_, Option<String>>(11)?,
                        r.get::<_, String>(12)?,
                        r.get::<_, Option<String>>(13)?,
                    ))
                },
            )
            .optional()
            .map_err(|e| backend("load session", e))?;

        let Some((
            id,
            description,
            working_dir,
            created_at,
            updated_at,
            tokens,
            recipe_json,
            schedule_id,
            session_type,
            parent_session_id,
            status,
            failure,
        )) = row
        else {
            return Ok(None);
        };

        let recipe = match recipe_json {
            Some(raw) => Some(
                serde_json::from_str::<Recipe>(&raw).map_err(|e| backend("decode recipe", e))?,
            ),
            None => None,
        };

        let mut stmt = conn
            .prepare("SELECT message_json FROM messages WHERE session_id = ?1 ORDER BY seq")
            .map_err(|e| backend("load messages", e))?;
        let raw_messages = stmt
            .query_map(params![id], |r| r.get::<_, String>(0))
            .map_err(|e| backend("load messages", e))?
            .collect::<Result<Vec<_>, _>>()
            .map_err(|e| backend("load messages", e))?;
        let messages = raw_messages
            .iter()
            .map(|raw| serde_json::from_str::<Message>(raw))
            .collect::<Result<Vec<_>, _>>()
            .map_err(|e| backend("decode message", e))?;

        Ok(Some(Session {
            id,
            description,
            working_dir: working_dir.into(),
            created_at: parse_time(&created_at),
            updated_at: parse_time(&updated_at),
            messages,
            input_tokens: tokens[0].max(0) as u64,
            output_tokens: tokens[1].max(0) as u64,
            total_tokens: tokens[2].max(0) as u64,
            recipe,
            schedule_id,
            session_type: SessionType::parse(&session_type),
            parent_session_id,
            status: SessionStatus::parse(&status),
            failure,
        }))
    }

    fn summaries(
        conn: &Connection,
        filter: Option<&str>,
    ) -> Result<Vec<SessionSummary>, SessionStoreError> {
        let sql = match filter {
            Some(_) => format!(
                "SELECT {SUMMARY_COLUMNS} FROM sessions s WHERE s.schedule_id = ?1 \
                 ORDER BY s.updated_at DESC, s.id DESC"
            ),
            None => format!("SELECT {SUMMARY_COLUMNS} FROM sessions s ORDER BY s.updated_at DESC, s.id DESC"),
        };
        let mut stmt = conn.prepare(&sql).map_err(|e| backend("list sessions", e))?;
        let map_row = |r: &rusqlite::Row<'_>| {
            Ok(SessionSummary {
                id: r.get(0)?,
                description: r.get(1)?,
                created_at: parse_time(&r.get::<_, String>(2)?),
                updated_at: parse_time(&r.get::<_, String>(3)?),
                total_tokens: r.get::<_, i64>(4)?.max(0) as u64,
                schedule_id: r.get(5)?,
                session_type: SessionType::parse(&r.get::<_, String>(6)?),
                status: SessionStatus::parse(&r.get::<_, String>(7)?),
                message_count: r.get::<_, i64>(8)?.max(0) as usize,
            })
        };
        let rows = match filter {
            Some(schedule_id) => stmt.query_map(params![schedule_id], map_row),
            None => stmt.query_map([], map_row),
        }
        .map_err(|e| backend("list sessions", e))?;
        rows.collect::<Result<Vec<_>, _>>()
            .map_err(|e| backend("list sessions", e))
    }

    /// 执行 UPDATE；影响 0 行视为会话不存在
    fn update(
        conn: &Connection,
        id: &str,
        sql: &str,
        values: &[&dyn rusqlite::ToSql],
    ) -> Result<(), SessionStoreError> {
        let changed = conn
            .execute(sql, values)
            .map_err(|e| backend("update session", e))?;
        if changed == 0 {
            return Err(SessionStoreError::NotFound(id.to_string()));
        }
        Ok(())
    }
}

#[async_trait]
impl SessionStore for SqliteSessionStore {
    async fn get_or_create(&self, id: &str, seed: SessionSeed) -> Result<Session, SessionStoreError> {
        let conn = self.conn.lock().await;
        if let Some(existing) = Self::load(&conn, id)? {
            return Ok(existing);
        }
        let session = Session::new(id, seed);
        conn.execute(
            "INSERT INTO sessions (id, description, working_dir, created_at, updated_at, \
             schedule_id, session_type, parent_session_id, status) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
            params![
                session.id,
                session.description,
                session.working_dir.to_string_lossy().to_string(),
                session.created_at.to_rfc3339(),
                session.updated_at.to_rfc3339(),
                session.schedule_id,
                session.session_type.as_str(),
                session.parent_session_id,
                session.status.as_str(),
            ],
        )
        .map_err(|e| backend("create session", e))?;
        tracing::debug!(session_id = %id, "session created");
        Ok(session)
    }

    async fn get(&self, id: &str) -> Result<Session, SessionStoreError> {
        let conn = self.conn.lock().await;
        Self::load(&conn, id)?.ok_or_else(|| SessionStoreError::NotFound(id.to_string()))
    }

    async fn list(&self) -> Result<Vec<SessionSummary>, SessionStoreError> {
        let conn = self.conn.lock().await;
        Self::summaries(&conn, None)
    }

    async fn delete(&self, id: &str) -> Result<(), SessionStoreError> {
        let mut conn = self.conn.lock().await;
        let tx = conn.transaction().map_err(|e| backend("delete session", e))?;
        tx.execute("DELETE FROM messages WHERE session_id = ?1", params![id])
            .map_err(|e| backend("delete session", e))?;
        let changed = tx
            .execute("DELETE FROM sessions WHERE id = ?1", params![id])
            .map_err(|e| backend("delete session", e))?;
        tx.commit().map_err(|e| backend("delete session", e))?;
        if changed == 0 {
            return Err(SessionStoreError::NotFound(id.to_string()));
        }
        Ok(())
    }

    async fn update_description(&self, id: &str, description: &str) -> Result<(), SessionStoreError> {
        let conn = self.conn.lock().await;
        Self::update(
            &conn,
            id,
            "UPDATE sessions SET description = ?1, updated_at = ?2 WHERE id = ?3",
            &[&description, &now_str(), &id],
        )
    }

    async fn append_messages(
        &self,
        id: &str,
        messages: &[Message],
        usage: Usage,
    ) -> Result<(), SessionStoreError> {
        let mut conn = self.conn.lock().await;
        let tx = conn.transaction().map_err(|e| backend("append messages", e))?;
        let changed = tx
            .execute(
                "UPDATE sessions SET input_tokens = input_tokens + ?1, \
                 output_tokens = output_tokens + ?2, total_tokens = total_tokens + ?3, \
                 updated_at = ?4 WHERE id = ?5",
                params![
                    usage.input_tokens as i64,
                    usage.output_tokens as i64,
                    usage.total() as i64,
                    now_str(),
                    id
                ],
            )
            .map_err(|e| backend("append messages", e))?;
        if changed == 0 {
            return Err(SessionStoreError::NotFound(id.to_string()));
        }
        let next: i64 = tx
            .query_row(
                "SELECT COALESCE(MAX(seq) + 1, 0) FROM messages WHERE session_id = ?1",
                params![id],
                |r| r.get(0),
            )
            .map_err(|e| backend("append messages", e))?;
        for (offset, message) in messages.iter().enumerate() {
            let json = serde_json::to_string(message).map_err(|e| backend("encode message", e))?;
            tx.execute(
                "INSERT INTO messages (session_id, seq, message_json) VALUES (?1, ?2, ?3)",
                params![id, next + offset as i64, json],
            )
            .map_err(|e| backend("append messages", e))?;
        }
        tx.commit().map_err(|e| backend("append messages", e))
    }

    async fn set_recipe(&self, id: &str, recipe: Option<Recipe>) -> Result<(), SessionStoreError> {
        let json = recipe
            .as_ref()
            .map(serde_json::to_string)
            .transpose()
            .map_err(|e| backend("encode recipe", e))?;
        let conn = self.conn.lock().await;
        Self::update(
            &conn,
            id,
            "UPDATE sessions SET recipe_json = ?1, updated_at = ?2 WHERE id = ?3",
            &[&json, &now_str(), &id],
        )
    }

    async fn set_schedule_id(&self, id: &str, schedule_id: &str) -> Result<(), SessionStoreError> {
        let conn = self.conn.lock().await;
        Self::update(
            &conn,
            id,
            "UPDATE sessions SET schedule_id = ?1, updated_at = ?2 WHERE id = ?3",
            &[&schedule_id, &now_str(), &id],
        )
    }

    async fn set_status(
        &self,
        id: &str,
        status: SessionStatus,
        failure: Option<String>,
    ) -> Result<(), SessionStoreError> {
        let conn = self.conn.lock().await;
        Self::update(
            &conn,
            id,
            "UPDATE sessions SET status = ?1, failure = ?2, updated_at = ?3 WHERE id = ?4",
            &[&status.as_str(), &failure, &now_str(), &id],
        )
    }

    async fn list_by_schedule(&self, schedule_id: &str) -> Result<Vec<SessionSummary>, SessionStoreError> {
        let conn = self.conn.lock().await;
        Self::summaries(&conn, Some(schedule_id))
    }

    async fn insights(&self) -> Result<SessionInsights, SessionStoreError> {
        let conn = self.conn.lock().await;
        let (count, tokens): (i64, i64) = conn
            .query_row(
                "SELECT COUNT(*), COALESCE(SUM(total_tokens), 0) FROM sessions",
                [],
                |r| Ok((r.get(0)?, r.get(1)?)),
            )
            .map_err(|e| backend("insights", e))?;
        Ok(SessionInsights {
            total_sessions: count.max(0) as usize,
            total_tokens: tokens.max(0) as u64,
        })
    }
}
