//! 核心层：错误分类与恢复、会话运行监管、工作池、优雅关闭

pub mod error;
pub mod recovery;
pub mod session_supervisor;
pub mod shutdown;
pub mod task_scheduler;

pub use error::{AgentError, ErrorKind, RecoveryAction};
pub use recovery::RecoveryEngine;
pub use session_supervisor::{RunGuard, SessionSupervisor};
pub use shutdown::{
    run_with_graceful_shutdown, ShutdownCleanup, ShutdownCoordinator, ShutdownManager,
    ShutdownReason,
};
pub use task_scheduler::WorkerPool;
