//! 会话监管：每个会话当前运行的取消令牌
//!
//! 执行器开始一次运行时登记令牌，结束时由 RunGuard 自动注销；删除会话、kill 调度任务、进程关闭时据此取消。
//! 所有令牌都是根令牌的子令牌，根令牌取消即全部取消。

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use tokio_util::sync::CancellationToken;

/// 会话级生命周期管理
#[derive(Debug)]
pub struct SessionSupervisor {
    root: CancellationToken,
    runs: DashMap<String, (u64, CancellationToken)>,
    next_run: AtomicU64,
}

impl SessionSupervisor {
    pub fn new(root: CancellationToken) -> Self {
        Self {
            root,
            runs: DashMap::new(),
            next_run: AtomicU64::new(0),
        }
    }

    /// 登记一次运行；传入外部令牌（如调度器持有的 kill 令牌）时以它为准，否则派生根令牌的子令牌
    pub fn begin(self: &Arc<Self>, session_id: &str, token: Option<CancellationToken>) -> RunGuard {
        let token = token.unwrap_or_else(|| self.root.child_token());
        let run_id = self.next_run.fetch_add(1, Ordering::Relaxed);
        self.runs
            .insert(session_id.to_string(), (run_id, token.clone()));
        RunGuard {
            supervisor: Arc::clone(self),
            session_id: session_id.to_string(),
            run_id,
            token,
        }
    }

    /// 取消会话当前的运行；没有运行时返回 false
    pub fn cancel(&self, session_id: &str) -> bool {
        match self.runs.get(session_id) {
            Some(entry) => {
                entry.value().1.cancel();
                tracing::info!(session_id = %session_id, "session run cancelled");
                true
            }
            None => false,
        }
    }

    pub fn is_running(&self, session_id: &str) -> bool {
        self.runs.contains_key(session_id)
    }

    pub fn running_sessions(&self) -> Vec<String> {
        self.runs.iter().map(|e| e.key().clone()).collect()
    }

    /// 取消全部运行（进程关闭）
    pub fn cancel_all(&self) {
        self.root.cancel();
    }

    pub fn root_token(&self) -> CancellationToken {
        self.root.clone()
    }
}

impl Default for SessionSupervisor {
    fn default() -> Self {
        Self::new(CancellationToken::new())
    }
}

/// 运行登记凭证：drop 时注销（仅当登记项仍属于本次运行）
#[derive(Debug)]
pub struct RunGuard {
    supervisor: Arc<SessionSupervisor>,
    session_id: String,
    run_id: u64,
    token: CancellationToken,
}

impl RunGuard {
    pub fn token(&self) -> CancellationToken {
        self.token.clone()
    }

    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }
}

impl Drop for RunGuard {
    fn drop(&mut self) {
        self.supervisor
            .runs
            .remove_if(&self.session_id, |_, (run_id, _)| *run_id == self.run_id);
    }
}
