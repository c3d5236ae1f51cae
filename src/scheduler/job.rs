use std::collections::HashMap;
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// 调度任务的执行方式；两者都缓冲到结束，只影响记录
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum JobExecutionMode {
    Foreground,
    #[default]
    Background,
}

/// 派生状态；paused 与之正交
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    /// 表达式没有后续触发时刻
    Idle,
    Scheduled,
    Running,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScheduledJob {
    pub id: String,
    /// Recipe 文件路径（相对路径在 recipes 目录下查找）
    pub source: PathBuf,
    pub cron: String,
    #[serde(default)]
    pub params: HashMap<String, String>,
    #[serde(default)]
    pub execution_mode: JobExecutionMode,
    #[serde(default)]
    pub paused: bool,
    #[serde(default)]
    pub currently_running: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current_session_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub process_start_time: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_run: Option<DateTime<Utc>>,
    /// "ok" / "killed" / "failed: <reason>"
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_status: Option<String>,
}

impl ScheduledJob {
    pub fn new(id: impl Into<String>, source: impl Into<PathBuf>, cron: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            source: source.into(),
            cron: cron.into(),
            params: HashMap::new(),
            execution_mode: JobExecutionMode::default(),
            paused: false,
            currently_running: false,
            current_session_id: None,
            process_start_time: None,
            last_run: None,
            last_status: None,
        }
    }

    pub fn with_params(mut self, params: HashMap<String, String>) -> Self {
        self.params = params;
        self
    }

    pub fn with_mode(mut self, mode: JobExecutionMode) -> Self {
        self.execution_mode = mode;
        self
    }

    /// 清掉运行态字段（新建或重启加载时）
    pub(crate) fn clear_run(&mut self) {
        self.currently_running = false;
        self.current_session_id = None;
        self.process_start_time = None;
    }

    pub fn state(&self) -> JobState {
        if self.currently_running {
            return JobState::Running;
        }
        let upcoming = super::cron::parse(&self.cron)
            .ok()
            .and_then(|s| super::cron::next_fire(&s, Utc::now()));
        match upcoming {
            Some(_) => JobState::Scheduled,
            None => JobState::Idle,
        }
    }
}

/// inspect 的返回
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunningJobInfo {
    pub job_id: String,
    pub session_id: String,
    pub process_start_time: DateTime<Utc>,
    pub elapsed_secs: i64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_job_defaults_from_json() {
        let job: ScheduledJob =
            serde_json::from_str(r#"{"id": "daily", "source": "daily.yaml", "cron": "0 9 * * *"}"#).unwrap();
        assert_eq!(job.execution_mode, JobExecutionMode::Background);
        assert!(!job.paused);
        assert_eq!(job.state(), JobState::Scheduled);

        let mut running = job.clone();
        running.currently_running = true;
        assert_eq!(running.state(), JobState::Running);

        let past = ScheduledJob::new("once", "x.yaml", "0 0 0 1 1 * 2001");
        assert_eq!(past.state(), JobState::Idle);
    }
}
