//! Cron 调度
//!
//! - **job**: ScheduledJob 与运行态
//! - **cron**: 5/6 段表达式归一与触发判断
//! - **store**: 任务列表的 JSON 持久化
//! - **service**: 单一 tick 循环 + 运行登记（run_now / pause / kill / inspect）

pub mod cron;
pub mod job;
pub mod service;
pub mod store;

use thiserror::Error;

use crate::core::ErrorKind;
use crate::recipe::RecipeError;
use crate::session::SessionStoreError;

pub use job::{JobExecutionMode, JobState, RunningJobInfo, ScheduledJob};
pub use service::Scheduler;
pub use store::JobStore;

#[derive(Error, Debug)]
pub enum SchedulerError {
    #[error("Job already exists: {0}")]
    Duplicate(String),

    #[error("Job not found: {0}")]
    NotFound(String),

    #[error("Job {0} is currently running")]
    Running(String),

    #[error("Job {0} is not running")]
    NotRunning(String),

    #[error("Job {0} has no active run")]
    NoActiveRun(String),

    #[error("Invalid job: {0}")]
    InvalidJob(String),

    #[error("Invalid cron expression '{expr}': {reason}")]
    InvalidCron { expr: String, reason: String },

    #[error(transparent)]
    Recipe(#[from] RecipeError),

    #[error(transparent)]
    Session(#[from] SessionStoreError),

    #[error("Job store error: {0}")]
    Store(String),
}

impl SchedulerError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            SchedulerError::Duplicate(_) | SchedulerError::Running(_) | SchedulerError::NotRunning(_) => {
                ErrorKind::Conflict
            }
            SchedulerError::NotFound(_) | SchedulerError::NoActiveRun(_) => ErrorKind::NotFound,
            SchedulerError::InvalidJob(_) | SchedulerError::InvalidCron { .. } => ErrorKind::Resolution,
            SchedulerError::Recipe(e) => e.kind(),
            SchedulerError::Session(e) => e.kind(),
            SchedulerError::Store(_) => ErrorKind::Internal,
        }
    }
}
