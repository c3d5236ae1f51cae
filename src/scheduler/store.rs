//! 调度任务持久化：整份 JSON 数组，先写 `.tmp` 再 rename

use std::path::{Path, PathBuf};

use crate::scheduler::{ScheduledJob, SchedulerError};

#[derive(Debug, Clone)]
pub struct JobStore {
    path: PathBuf,
}

impl JobStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// 文件不存在时返回空列表；上次进程遗留的运行态会被清掉
    pub fn load(&self) -> Result<Vec<ScheduledJob>, SchedulerError> {
        if !self.path.exists() {
            return Ok(Vec::new());
        }
        let data = std::fs::read_to_string(&self.path)
            .map_err(|e| SchedulerError::Store(format!("read {}: {e}", self.path.display())))?;
        let mut jobs: Vec<ScheduledJob> = serde_json::from_str(&data)
            .map_err(|e| SchedulerError::Store(format!("parse {}: {e}", self.path.display())))?;
        for job in &mut jobs {
            if job.currently_running {
                tracing::warn!(job_id = %job.id, "clearing stale running state");
                job.clear_run();
                job.last_status = Some("failed: interrupted".to_string());
            }
        }
        tracing::info!(count = jobs.len(), path = %self.path.display(), "loaded scheduled jobs");
        Ok(jobs)
    }

    pub fn save(&self, jobs: &[ScheduledJob]) -> Result<(), SchedulerError> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| SchedulerError::Store(format!("create {}: {e}", parent.display())))?;
        }
        let data = serde_json::to_string_pretty(jobs)
            .map_err(|e| SchedulerError::Store(format!("serialize jobs: {e}")))?;
        let tmp = self.path.with_extension("json.tmp");
        std::fs::write(&tmp, data)
            .map_err(|e| SchedulerError::Store(format!("write {}: {e}", tmp.display())))?;
        std::fs::rename(&tmp, &self.path)
            .map_err(|e| SchedulerError::Store(format!("rename {}: {e}", tmp.display())))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_save_load_clears_running() {
        let dir = tempfile::tempdir().unwrap();
        let store = JobStore::new(dir.path().join("schedules.json"));
        assert!(store.load().unwrap().is_empty());

        let mut job = ScheduledJob::new("daily", "daily.yaml", "0 9 * * *");
        job.currently_running = true;
        job.current_session_id = Some("s1".into());
        store.save(&[job, ScheduledJob::new("hourly", "h.yaml", "0 * * * *")]).unwrap();
        assert!(!dir.path().join("schedules.json.tmp").exists());

        let loaded = store.load().unwrap();
        assert_eq!(loaded.len(), 2);
        assert!(!loaded[0].currently_running);
        assert!(loaded[0].current_session_id.is_none());
        assert_eq!(loaded[0].last_status.as_deref(), Some("failed: interrupted"));
        assert!(loaded[1].last_status.is_none());
    }

    #[test]
    fn test_corrupt_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("schedules.json");
        std::fs::write(&path, "not json").unwrap();
        assert!(matches!(JobStore::new(path).load(), Err(SchedulerError::Store(_))));
    }
}
