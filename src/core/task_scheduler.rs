//! 工作池：用 Semaphore 限制并发子任务数
//!
//! 扇出的每个子任务先取得许可再执行；许可随 OwnedSemaphorePermit drop 归还。

use std::sync::Arc;

use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio_util::sync::CancellationToken;

/// 有界工作池
#[derive(Debug, Clone)]
pub struct WorkerPool {
    semaphore: Arc<Semaphore>,
    capacity: usize,
}

impl WorkerPool {
    pub fn new(max_workers: usize) -> Self {
        let capacity = max_workers.max(1);
        Self {
            semaphore: Arc::new(Semaphore::new(capacity)),
            capacity,
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn available(&self) -> usize {
        self.semaphore.available_permits()
    }

    /// 获取一个工作许可；取消或池已关闭时返回 None
    pub async fn acquire(&self, cancel: &CancellationToken) -> Option<OwnedSemaphorePermit> {
        tokio::select! {
            permit = Arc::clone(&self.semaphore).acquire_owned() => permit.ok(),
            _ = cancel.cancelled() => None,
        }
    }
}

impl Default for WorkerPool {
    fn default() -> Self {
        Self::new(10)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_pool_bounds_permits() {
        let pool = WorkerPool::new(2);
        let token = CancellationToken::new();
        let a = pool.acquire(&token).await;
        let b = pool.acquire(&token).await;
        assert!(a.is_some() && b.is_some());
        assert_eq!(pool.available(), 0);
        drop(a);
        assert_eq!(pool.available(), 1);
    }

    #[tokio::test]
    async fn test_acquire_cancelled() {
        let pool = WorkerPool::new(1);
        let token = CancellationToken::new();
        let _held = pool.acquire(&token).await;
        token.cancel();
        assert!(pool.acquire(&token).await.is_none());
    }

    #[test]
    fn test_zero_capacity_clamped() {
        assert_eq!(WorkerPool::new(0).capacity(), 1);
    }
}
