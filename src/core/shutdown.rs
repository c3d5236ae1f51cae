//! 优雅关闭
//!
//! 关闭信号取消根令牌：会话运行、调度 tick、空闲 Agent 清理都挂在它下面。
//! 随后按注册顺序执行清理钩子（kill 运行中的任务并落盘、驱逐 Agent）。

use std::future::Future;
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use tokio_util::sync::CancellationToken;

/// 关闭原因；只记录第一次
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownReason {
    /// 前台命令或服务自行结束
    Completed,
    /// Ctrl+C
    Interrupt,
    /// SIGTERM
    Terminate,
}

impl ShutdownReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            ShutdownReason::Completed => "completed",
            ShutdownReason::Interrupt => "interrupt",
            ShutdownReason::Terminate => "terminate",
        }
    }
}

/// 关闭信号
#[derive(Default)]
pub struct ShutdownManager {
    token: CancellationToken,
    reason: OnceLock<ShutdownReason>,
}

impl ShutdownManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// 根令牌
    pub fn token(&self) -> CancellationToken {
        self.token.clone()
    }

    pub fn shutdown(&self, reason: ShutdownReason) {
        if self.reason.set(reason).is_ok() {
            tracing::info!(reason = reason.as_str(), "shutdown requested");
        }
        self.token.cancel();
    }

    pub fn is_shutdown(&self) -> bool {
        self.token.is_cancelled()
    }

    pub fn reason(&self) -> Option<ShutdownReason> {
        self.reason.get().copied()
    }

    pub async fn wait_for_shutdown(&self) {
        self.token.cancelled().await;
    }

    /// Ctrl+C 与（unix 下）SIGTERM
    pub fn install_signal_handlers(self: &Arc<Self>) {
        let manager = Arc::clone(self);
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                manager.shutdown(ShutdownReason::Interrupt);
            }
        });

        #[cfg(unix)]
        {
            let manager = Arc::clone(self);
            tokio::spawn(async move {
                use tokio::signal::unix::{signal, SignalKind};
                match signal(SignalKind::terminate()) {
                    Ok(mut sigterm) => {
                        sigterm.recv().await;
                        manager.shutdown(ShutdownReason::Terminate);
                    }
                    Err(e) => tracing::warn!(error = %e, "cannot listen for SIGTERM"),
                }
            });
        }
    }
}

/// 关闭时需要执行的清理任务
#[async_trait::async_trait]
pub trait ShutdownCleanup: Send + Sync {
    async fn cleanup(&self) -> anyhow::Result<()>;

    /// 清理任务名称（用于日志）
    fn name(&self) -> &'static str;
}

/// 关闭协调器：按注册顺序执行清理，每个任务单独限时
pub struct ShutdownCoordinator {
    manager: Arc<ShutdownManager>,
    cleanup_tasks: Vec<Arc<dyn ShutdownCleanup>>,
    timeout_secs: u64,
}

impl ShutdownCoordinator {
    pub fn new(manager: Arc<ShutdownManager>) -> Self {
        Self {
            manager,
            cleanup_tasks: Vec::new(),
            timeout_secs: 5,
        }
    }

    pub fn with_timeout(mut self, secs: u64) -> Self {
        self.timeout_secs = secs;
        self
    }

    pub fn register(&mut self, task: Arc<dyn ShutdownCleanup>) {
        self.cleanup_tasks.push(task);
    }

    pub async fn run_cleanup(&self) {
        let limit = Duration::from_secs(self.timeout_secs);
        for task in &self.cleanup_tasks {
            let name = task.name();
            match tokio::time::timeout(limit, task.cleanup()).await {
                Ok(Ok(())) => tracing::info!(task = name, "cleanup done"),
                Ok(Err(e)) => tracing::warn!(task = name, error = %e, "cleanup failed"),
                Err(_) => tracing::warn!(task = name, timeout_secs = self.timeout_secs, "cleanup timed out"),
            }
        }
    }

    pub fn manager(&self) -> &Arc<ShutdownManager> {
        &self.manager
    }
}

/// 运行主应用直到结束或收到关闭信号，然后执行清理
pub async fn run_with_graceful_shutdown<F>(coordinator: &ShutdownCoordinator, app: F)
where
    F: Future<Output = ()>,
{
    let manager = Arc::clone(coordinator.manager());
    manager.install_signal_handlers();

    tokio::select! {
        _ = app => {}
        _ = manager.wait_for_shutdown() => {}
    }

    manager.shutdown(ShutdownReason::Completed);
    tracing::info!(
        reason = manager.reason().map(|r| r.as_str()).unwrap_or("unknown"),
        "shutting down"
    );
    coordinator.run_cleanup().await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};

    #[test]
    fn test_first_reason_wins() {
        let manager = ShutdownManager::new();
        let child = manager.token().child_token();
        assert!(!manager.is_shutdown());
        assert_eq!(manager.reason(), None);

        manager.shutdown(ShutdownReason::Terminate);
        manager.shutdown(ShutdownReason::Completed);
        assert!(child.is_cancelled());
        assert_eq!(manager.reason(), Some(ShutdownReason::Terminate));
    }

    struct MockCleanup {
        called: Arc<AtomicBool>,
    }

    #[async_trait::async_trait]
    impl ShutdownCleanup for MockCleanup {
        async fn cleanup(&self) -> anyhow::Result<()> {
            self.called.store(true, Ordering::SeqCst);
            Ok(())
        }

        fn name(&self) -> &'static str {
            "MockCleanup"
        }
    }

    #[tokio::test]
    async fn test_graceful_shutdown_runs_cleanup_after_app() {
        let manager = Arc::new(ShutdownManager::new());
        let mut coordinator = ShutdownCoordinator::new(Arc::clone(&manager));
        let called = Arc::new(AtomicBool::new(false));
        coordinator.register(Arc::new(MockCleanup {
            called: called.clone(),
        }));

        run_with_graceful_shutdown(&coordinator, async {}).await;
        assert!(called.load(Ordering::SeqCst));
        assert!(manager.is_shutdown());
        assert_eq!(manager.reason(), Some(ShutdownReason::Completed));
    }
}
