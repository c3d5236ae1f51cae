//! Agent 管理器：session_id → Agent
//!
//! 同一会话的并发 get_or_create 共享一个 OnceCell，只构造一次；构造失败时移除占位，下次可重试。
//! 闲置超时或删除会话时回收（关闭扩展）；超出 max_agents 时回收最久未用且空闲的 Agent。

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::Serialize;
use tokio::sync::{OnceCell, RwLock};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::agent::{Agent, AgentFactory};
use crate::core::AgentError;
use crate::session::SessionStore;

struct AgentSlot {
    cell: OnceCell<Arc<Agent>>,
    last_used: std::sync::Mutex<Instant>,
}

impl AgentSlot {
    fn new() -> Self {
        Self {
            cell: OnceCell::new(),
            last_used: std::sync::Mutex::new(Instant::now()),
        }
    }

    fn touch(&self) {
        if let Ok(mut t) = self.last_used.lock() {
            *t = Instant::now();
        }
    }

    fn idle_for(&self) -> Duration {
        self.last_used
            .lock()
            .map(|t| t.elapsed())
            .unwrap_or_default()
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct AgentManagerMetrics {
    pub agents_created: u64,
    pub agents_evicted: u64,
    pub cache_hits: u64,
    pub cache_misses: u64,
    pub live_agents: usize,
}

pub struct AgentManager {
    agents: RwLock<HashMap<String, Arc<AgentSlot>>>,
    factory: Arc<dyn AgentFactory>,
    sessions: Arc<dyn SessionStore>,
    max_idle: Duration,
    max_agents: usize,
    created: AtomicU64,
    evicted: AtomicU64,
    hits: AtomicU64,
    misses: AtomicU64,
}

impl AgentManager {
    pub fn new(
        factory: Arc<dyn AgentFactory>,
        sessions: Arc<dyn SessionStore>,
        max_idle: Duration,
        max_agents: usize,
    ) -> Self {
        Self {
            agents: RwLock::new(HashMap::new()),
            factory,
            sessions,
            max_idle,
            max_agents: max_agents.max(1),
            created: AtomicU64::new(0),
            evicted: AtomicU64::new(0),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
        }
    }

    /// 取已有 Agent，或按会话的持久状态构造一个；会话必须已存在
    pub async fn get_or_create(&self, session_id: &str) -> Result<Arc<Agent>, AgentError> {
        let slot = {
            let existing = self.agents.read().await.get(session_id).cloned();
            match existing {
                Some(slot) => slot,
                None => {
                    let mut map = self.agents.write().await;
                    Arc::clone(
                        map.entry(session_id.to_string())
                            .or_insert_with(|| Arc::new(AgentSlot::new())),
                    )
                }
            }
        };

        let constructed = AtomicBool::new(false);
        let result = slot
            .cell
            .get_or_try_init(|| async {
                constructed.store(true, Ordering::SeqCst);
                let session = self
                    .sessions
                    .get(session_id)
                    .await
                    .map_err(|e| AgentError::Creation(e.to_string()))?;
                let agent = self.factory.create(&session).await?;
                Ok::<_, AgentError>(Arc::new(agent))
            })
            .await
            .cloned();

        match result {
            Ok(agent) => {
                slot.touch();
                if constructed.load(Ordering::SeqCst) {
                    self.misses.fetch_add(1, Ordering::Relaxed);
                    self.created.fetch_add(1, Ordering::Relaxed);
                    tracing::debug!(session_id = %session_id, "agent cached");
                    self.enforce_capacity(session_id).await;
                } else {
                    self.hits.fetch_add(1, Ordering::Relaxed);
                }
                Ok(agent)
            }
            Err(e) => {
                let mut map = self.agents.write().await;
                if map
                    .get(session_id)
                    .is_some_and(|s| Arc::ptr_eq(s, &slot) && s.cell.get().is_none())
                {
                    map.remove(session_id);
                }
                tracing::warn!(session_id = %session_id, error = %e, "agent construction failed");
                Err(e)
            }
        }
    }

    /// 只取不建；没有时为前置条件错误
    pub async fn get(&self, session_id: &str) -> Result<Arc<Agent>, AgentError> {
        let slot = self.agents.read().await.get(session_id).cloned();
        match slot.and_then(|s| {
            s.touch();
            s.cell.get().cloned()
        }) {
            Some(agent) => Ok(agent),
            None => Err(AgentError::NotInitialized(session_id.to_string())),
        }
    }

    pub async fn contains(&self, session_id: &str) -> bool {
        self.agents
            .read()
            .await
            .get(session_id)
            .is_some_and(|s| s.cell.initialized())
    }

    /// 移出映射并关闭扩展；不存在时返回 false
    pub async fn evict(&self, session_id: &str) -> bool {
        let slot = self.agents.write().await.remove(session_id);
        match slot.and_then(|s| s.cell.get().cloned()) {
            Some(agent) => {
                agent.shutdown().await;
                self.evicted.fetch_add(1, Ordering::Relaxed);
                tracing::info!(session_id = %session_id, "agent evicted");
                true
            }
            None => false,
        }
    }

    /// 回收闲置超过 max_idle 且没有运行中的 Agent，返回回收数量
    pub async fn cleanup_idle(&self) -> usize {
        let stale: Vec<String> = {
            let map = self.agents.read().await;
            map.iter()
                .filter(|(_, slot)| slot.idle_for() >= self.max_idle)
                .filter(|(_, slot)| slot.cell.get().is_some_and(|a| !a.is_busy()))
                .map(|(id, _)| id.clone())
                .collect()
        };
        let mut count = 0;
        for id in stale {
            if self.evict(&id).await {
                count += 1;
            }
        }
        if count > 0 {
            tracing::info!(evicted = count, "idle agents cleaned up");
        }
        count
    }

    async fn enforce_capacity(&self, keep: &str) {
        let victim = {
            let map = self.agents.read().await;
            if map.len() <= self.max_agents {
                return;
            }
            map.iter()
                .filter(|(id, _)| id.as_str() != keep)
                .filter(|(_, slot)| slot.cell.get().is_some_and(|a| !a.is_busy()))
                .max_by_key(|(_, slot)| slot.idle_for())
                .map(|(id, _)| id.clone())
        };
        if let Some(id) = victim {
            tracing::debug!(session_id = %id, "agent evicted for capacity");
            self.evict(&id).await;
        }
    }

    /// 关闭时回收全部
    pub async fn evict_all(&self) -> usize {
        let ids: Vec<String> = self.agents.read().await.keys().cloned().collect();
        let mut count = 0;
        for id in ids {
            if self.evict(&id).await {
                count += 1;
            }
        }
        count
    }

    pub async fn metrics(&self) -> AgentManagerMetrics {
        AgentManagerMetrics {
            agents_created: self.created.load(Ordering::Relaxed),
            agents_evicted: self.evicted.load(Ordering::Relaxed),
            cache_hits: self.hits.load(Ordering::Relaxed),
            cache_misses: self.misses.load(Ordering::Relaxed),
            live_agents: self.agents.read().await.len(),
        }
    }

    /// 后台闲置回收循环，shutdown 取消时退出
    pub fn spawn_cleanup_loop(self: &Arc<Self>, interval: Duration, shutdown: CancellationToken) -> JoinHandle<()> {
        let manager = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval.max(Duration::from_millis(10)));
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        manager.cleanup_idle().await;
                    }
                    _ = shutdown.cancelled() => {
                        tracing::debug!("agent cleanup loop stopped");
                        break;
                    }
                }
            }
        })
    }
}
