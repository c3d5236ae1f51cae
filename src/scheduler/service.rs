//! 调度服务
//!
//! 单一 tick 循环：每次 tick 检查 (上次 tick, 本次 tick] 内有触发时刻、未暂停、未在运行的任务，
//! 只负责启动，不等待运行结束。运行经统一执行器以 Background 模式进行，会话带上 schedule_id。
//! 每个运行登记一个 kill 令牌与一个完成令牌；kill 取消前者后在宽限期内等待后者。

use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::core::ShutdownCleanup;
use crate::execution::{ExecutionMode, ExecutionRequest, ExecutionStatus, RecipeSource, UnifiedExecutor};
use crate::recipe::load_recipe_file;
use crate::scheduler::{cron, JobStore, RunningJobInfo, ScheduledJob, SchedulerError};
use crate::session::{new_session_id, SessionStatus, SessionStoreError, SessionSummary};

/// 一次正在进行的运行
#[derive(Debug, Clone)]
struct ActiveRun {
    run_id: u64,
    session_id: String,
    kill: CancellationToken,
    finished: CancellationToken,
}

pub struct Scheduler {
    jobs: DashMap<String, ScheduledJob>,
    runs: DashMap<String, ActiveRun>,
    executor: Arc<UnifiedExecutor>,
    store: JobStore,
    kill_grace: Duration,
    next_run: AtomicU64,
    last_tick: Mutex<DateTime<Utc>>,
    persist_lock: Mutex<()>,
}

impl Scheduler {
    pub fn new(executor: Arc<UnifiedExecutor>, store: JobStore, kill_grace: Duration) -> Self {
        Self {
            jobs: DashMap::new(),
            runs: DashMap::new(),
            executor,
            store,
            kill_grace,
            next_run: AtomicU64::new(0),
            last_tick: Mutex::new(Utc::now()),
            persist_lock: Mutex::new(()),
        }
    }

    /// 新建并加载已持久化的任务
    pub fn open(
        executor: Arc<UnifiedExecutor>,
        store: JobStore,
        kill_grace: Duration,
    ) -> Result<Arc<Self>, SchedulerError> {
        let scheduler = Self::new(executor, store, kill_grace);
        let jobs = scheduler.store.load()?;
        let interrupted = jobs.iter().any(|j| j.last_status.as_deref() == Some("failed: interrupted"));
        for job in jobs {
            scheduler.jobs.insert(job.id.clone(), job);
        }
        if interrupted {
            scheduler.persist()?;
        }
        Ok(Arc::new(scheduler))
    }

    pub fn create(&self, mut job: ScheduledJob) -> Result<ScheduledJob, SchedulerError> {
        if job.id.trim().is_empty() {
            return Err(SchedulerError::InvalidJob("job id must not be empty".into()));
        }
        cron::parse(&job.cron)?;
        load_recipe_file(&job.source, &job.params, Some(self.executor.recipes_dir()))?;
        job.clear_run();
        job.last_run = None;
        job.last_status = None;

        match self.jobs.entry(job.id.clone()) {
            dashmap::mapref::entry::Entry::Occupied(_) => return Err(SchedulerError::Duplicate(job.id)),
            dashmap::mapref::entry::Entry::Vacant(slot) => {
                slot.insert(job.clone());
            }
        }
        self.persist()?;
        tracing::info!(job_id = %job.id, cron = %job.cron, source = %job.source.display(), "job created");
        Ok(job)
    }

    /// 修改 cron 表达式；运行中的任务不可修改
    pub fn update_cron(&self, id: &str, expr: &str) -> Result<ScheduledJob, SchedulerError> {
        cron::parse(expr)?;
        let updated = {
            let mut job = self.jobs.get_mut(id).ok_or_else(|| SchedulerError::NotFound(id.to_string()))?;
            if job.currently_running {
                return Err(SchedulerError::Running(id.to_string()));
            }
            job.cron = expr.to_string();
            job.clone()
        };
        self.persist()?;
        tracing::info!(job_id = %id, cron = %expr, "job schedule updated");
        Ok(updated)
    }

    pub fn delete(&self, id: &str) -> Result<(), SchedulerError> {
        let removed = self
            .jobs
            .remove_if(id, |_, job| !job.currently_running);
        if removed.is_none() {
            return Err(match self.jobs.contains_key(id) {
                true => SchedulerError::Running(id.to_string()),
                false => SchedulerError::NotFound(id.to_string()),
            });
        }
        self.persist()?;
        tracing::info!(job_id = %id, "job deleted");
        Ok(())
    }

    /// 按 id 排序
    pub fn list(&self) -> Vec<ScheduledJob> {
        let mut jobs: Vec<ScheduledJob> = self.jobs.iter().map(|e| e.value().clone()).collect();
        jobs.sort_by(|a, b| a.id.cmp(&b.id));
        jobs
    }

    pub fn get(&self, id: &str) -> Result<ScheduledJob, SchedulerError> {
        self.jobs
            .get(id)
            .map(|j| j.clone())
            .ok_or_else(|| SchedulerError::NotFound(id.to_string()))
    }

    /// 运行中的任务不可暂停
    pub fn pause(&self, id: &str) -> Result<(), SchedulerError> {
        {
            let mut job = self.jobs.get_mut(id).ok_or_else(|| SchedulerError::NotFound(id.to_string()))?;
            if job.currently_running {
                return Err(SchedulerError::Running(id.to_string()));
            }
            job.paused = true;
        }
        self.persist()?;
        tracing::info!(job_id = %id, "job paused");
        Ok(())
    }

    pub fn unpause(&self, id: &str) -> Result<(), SchedulerError> {
        {
            let mut job = self.jobs.get_mut(id).ok_or_else(|| SchedulerError::NotFound(id.to_string()))?;
            job.paused = false;
        }
        self.persist()?;
        tracing::info!(job_id = %id, "job unpaused");
        Ok(())
    }

    /// 立即运行（不受 paused 影响）；返回新会话 id，运行在后台进行
    pub fn run_now(self: &Arc<Self>, id: &str) -> Result<String, SchedulerError> {
        self.start_run(id)
    }

    /// 取消运行并在宽限期内等待其结束；会话标记为失败
    pub async fn kill(&self, id: &str) -> Result<(), SchedulerError> {
        if !self.jobs.contains_key(id) {
            return Err(SchedulerError::NotFound(id.to_string()));
        }
        let Some((_, run)) = self.runs.remove(id) else {
            return Err(SchedulerError::NotRunning(id.to_string()));
        };
        run.kill.cancel();
        if tokio::time::timeout(self.kill_grace, run.finished.cancelled())
            .await
            .is_err()
        {
            tracing::warn!(job_id = %id, grace_secs = self.kill_grace.as_secs(), "run did not stop within grace period");
        }
        self.finish_run(id, "killed".to_string());

        match self
            .executor
            .sessions()
            .set_status(&run.session_id, SessionStatus::Failed, Some("killed".to_string()))
            .await
        {
            Ok(()) | Err(SessionStoreError::NotFound(_)) => {}
            Err(e) => tracing::warn!(job_id = %id, error = %e, "failed to mark killed session"),
        }
        tracing::info!(job_id = %id, session_id = %run.session_id, "job killed");
        Ok(())
    }

    pub fn inspect(&self, id: &str) -> Result<RunningJobInfo, SchedulerError> {
        let job = self.get(id)?;
        match (job.currently_running, job.current_session_id, job.process_start_time) {
            (true, Some(session_id), Some(started)) => Ok(RunningJobInfo {
                job_id: job.id,
                session_id,
                process_start_time: started,
                elapsed_secs: (Utc::now() - started).num_seconds(),
            }),
            _ => Err(SchedulerError::NoActiveRun(id.to_string())),
        }
    }

    /// 该任务产生过的会话
    pub async fn sessions_for_job(&self, id: &str, limit: usize) -> Result<Vec<SessionSummary>, SchedulerError> {
        if !self.jobs.contains_key(id) {
            return Err(SchedulerError::NotFound(id.to_string()));
        }
        let mut sessions = self.executor.sessions().list_by_schedule(id).await?;
        sessions.truncate(limit);
        Ok(sessions)
    }

    /// 启动 (since, now] 内到期的任务；返回启动的任务 id
    pub fn run_due(self: &Arc<Self>, since: DateTime<Utc>, now: DateTime<Utc>) -> Vec<String> {
        let due: Vec<String> = self
            .jobs
            .iter()
            .filter(|e| !e.paused && !e.currently_running)
            .filter(|e| match cron::parse(&e.cron) {
                Ok(schedule) => cron::fires_between(&schedule, since, now),
                Err(err) => {
                    tracing::warn!(job_id = %e.id, error = %err, "skipping job with invalid cron");
                    false
                }
            })
            .map(|e| e.key().clone())
            .collect();

        let mut started = Vec::new();
        for id in due {
            match self.start_run(&id) {
                Ok(session_id) => {
                    tracing::info!(job_id = %id, session_id = %session_id, "scheduled run started");
                    started.push(id);
                }
                Err(e) => tracing::warn!(job_id = %id, error = %e, "scheduled run not started"),
            }
        }
        started
    }

    pub fn spawn_tick_loop(self: &Arc<Self>, tick: Duration, shutdown: CancellationToken) -> JoinHandle<()> {
        let scheduler = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(tick.max(Duration::from_millis(10)));
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        let now = Utc::now();
                        let since = match scheduler.last_tick.lock() {
                            Ok(mut last) => std::mem::replace(&mut *last, now),
                            Err(_) => now,
                        };
                        scheduler.run_due(since, now);
                    }
                    _ = shutdown.cancelled() => {
                        tracing::debug!("scheduler tick loop stopped");
                        break;
                    }
                }
            }
        })
    }

    /// kill 全部运行中的任务
    pub async fn kill_all(&self) {
        let running: Vec<String> = self.runs.iter().map(|e| e.key().clone()).collect();
        for id in running {
            if let Err(e) = self.kill(&id).await {
                tracing::debug!(job_id = %id, error = %e, "kill on shutdown skipped");
            }
        }
    }

    fn start_run(self: &Arc<Self>, id: &str) -> Result<String, SchedulerError> {
        let session_id = new_session_id();
        let (source, params) = {
            let mut job = self.jobs.get_mut(id).ok_or_else(|| SchedulerError::NotFound(id.to_string()))?;
            if job.currently_running {
                return Err(SchedulerError::Running(id.to_string()));
            }
            job.currently_running = true;
            job.current_session_id = Some(session_id.clone());
            job.process_start_time = Some(Utc::now());
            (job.source.clone(), job.params.clone())
        };

        let run = ActiveRun {
            run_id: self.next_run.fetch_add(1, Ordering::Relaxed),
            session_id: session_id.clone(),
            kill: self.executor.supervisor().root_token().child_token(),
            finished: CancellationToken::new(),
        };
        self.runs.insert(id.to_string(), run.clone());
        self.persist_logged();

        let scheduler = Arc::clone(self);
        let job_id = id.to_string();
        tokio::spawn(async move {
            let _finished = run.finished.clone().drop_guard();
            let req = ExecutionRequest::new(
                run.session_id.clone(),
                RecipeSource::File { path: source, params },
                ExecutionMode::Background,
            )
            .with_schedule(job_id.clone());
            let status = match scheduler.executor.execute_with_token(req, run.kill.clone()).await {
                Ok(result) => match result.status {
                    ExecutionStatus::Completed => "ok".to_string(),
                    ExecutionStatus::Cancelled => "failed: cancelled".to_string(),
                    ExecutionStatus::Failed => {
                        format!("failed: {}", result.error.unwrap_or_else(|| "unknown".to_string()))
                    }
                },
                Err(e) => format!("failed: {e}"),
            };
            // kill 已经移除登记时由 kill 负责收尾
            if scheduler
                .runs
                .remove_if(&job_id, |_, r| r.run_id == run.run_id)
                .is_some()
            {
                tracing::info!(job_id = %job_id, session_id = %run.session_id, status = %status, "scheduled run finished");
                scheduler.finish_run(&job_id, status);
            }
        });
        Ok(session_id)
    }

    fn finish_run(&self, id: &str, status: String) {
        if let Some(mut job) = self.jobs.get_mut(id) {
            job.clear_run();
            job.last_run = Some(Utc::now());
            job.last_status = Some(status);
        }
        self.persist_logged();
    }

    fn persist(&self) -> Result<(), SchedulerError> {
        let _guard = self
            .persist_lock
            .lock()
            .map_err(|_| SchedulerError::Store("persist lock poisoned".into()))?;
        self.store.save(&self.list())
    }

    fn persist_logged(&self) {
        if let Err(e) = self.persist() {
            tracing::warn!(error = %e, path = %self.store.path().display(), "failed to persist jobs");
        }
    }

    pub fn jobs_file(&self) -> PathBuf {
        self.store.path().to_path_buf()
    }
}

#[async_trait::async_trait]
impl ShutdownCleanup for Scheduler {
    async fn cleanup(&self) -> anyhow::Result<()> {
        self.kill_all().await;
        Ok(())
    }

    fn name(&self) -> &'static str {
        "scheduler"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::conversation::last_user_text;
    use crate::execution::executor::test_support::executor_with;
    use crate::llm::{MockLlmClient, MockReply};

    const RECIPE: &str = r#"
title: Digest
description: daily digest
prompt: "summarize {{ topic }} {{ delay }}"
parameters:
  - key: topic
    input_type: string
    requirement: required
    description: what to summarize
  - key: delay
    input_type: string
    requirement: optional
    default: "0"
    description: mock delay in ms
"#;

    /// 文本里的数字是延迟毫秒数
    fn slow_mock() -> MockLlmClient {
        MockLlmClient::with_handler(|_, messages| {
            let text = last_user_text(messages).unwrap_or_default();
            let ms: u64 = text
                .split_whitespace()
                .find_map(|w| w.parse().ok())
                .unwrap_or(0);
            MockReply::text(format!("digest: {text}")).with_delay(Duration::from_millis(ms))
        })
    }

    fn scheduler() -> (Arc<Scheduler>, tempfile::TempDir) {
        let (exec, dir) = executor_with(slow_mock);
        let recipes = dir.path().join("recipes");
        std::fs::create_dir_all(&recipes).unwrap();
        std::fs::write(recipes.join("digest.yaml"), RECIPE).unwrap();
        let store = JobStore::new(dir.path().join("schedules.json"));
        let scheduler = Scheduler::open(Arc::new(exec), store, Duration::from_secs(2)).unwrap();
        (scheduler, dir)
    }

    fn job(id: &str, delay_ms: u64) -> ScheduledJob {
        let params = [("topic".to_string(), "rust".to_string()), ("delay".to_string(), delay_ms.to_string())]
            .into_iter()
            .collect();
        ScheduledJob::new(id, "digest", "0 9 * * *").with_params(params)
    }

    async fn wait_idle(scheduler: &Scheduler, id: &str) -> ScheduledJob {
        for _ in 0..200 {
            let job = scheduler.get(id).unwrap();
            if !job.currently_running {
                return job;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("job {id} still running");
    }

    #[tokio::test]
    async fn test_create_validates() {
        let (scheduler, _dir) = scheduler();
        scheduler.create(job("daily", 0)).unwrap();
        assert!(matches!(scheduler.create(job("daily", 0)), Err(SchedulerError::Duplicate(_))));

        let bad_cron = ScheduledJob::new("bad", "digest", "every day");
        assert!(matches!(scheduler.create(bad_cron), Err(SchedulerError::InvalidCron { .. })));

        let missing = ScheduledJob::new("missing", "nope", "0 9 * * *");
        let err = scheduler.create(missing).unwrap_err();
        assert_eq!(err.kind(), crate::core::ErrorKind::Resolution);
        assert_eq!(scheduler.list().len(), 1);
    }

    #[tokio::test]
    async fn test_run_now_records_session() {
        let (scheduler, _dir) = scheduler();
        scheduler.create(job("daily", 0)).unwrap();
        let session_id = scheduler.run_now("daily").unwrap();

        let job = wait_idle(&scheduler, "daily").await;
        assert_eq!(job.last_status.as_deref(), Some("ok"));
        assert!(job.last_run.is_some());
        assert!(job.current_session_id.is_none());

        let sessions = scheduler.sessions_for_job("daily", 10).await.unwrap();
        assert_eq!(sessions.len(), 1);
        assert_eq!(sessions[0].id, session_id);
        assert!(sessions[0].message_count >= 1);
        assert_eq!(sessions[0].status, SessionStatus::Completed);
    }

    #[tokio::test]
    async fn test_running_job_rejects_changes() {
        let (scheduler, _dir) = scheduler();
        scheduler.create(job("slow", 2_000)).unwrap();
        let session_id = scheduler.run_now("slow").unwrap();

        assert!(matches!(scheduler.pause("slow"), Err(SchedulerError::Running(_))));
        assert!(!scheduler.get("slow").unwrap().paused);
        assert!(matches!(scheduler.delete("slow"), Err(SchedulerError::Running(_))));
        assert!(matches!(scheduler.update_cron("slow", "* * * * *"), Err(SchedulerError::Running(_))));
        assert!(matches!(scheduler.run_now("slow"), Err(SchedulerError::Running(_))));

        let info = scheduler.inspect("slow").unwrap();
        assert_eq!(info.session_id, session_id);
        assert!(info.elapsed_secs >= 0);

        scheduler.kill("slow").await.unwrap();
    }

    #[tokio::test]
    async fn test_kill_marks_session_failed() {
        let (scheduler, _dir) = scheduler();
        scheduler.create(job("slow", 5_000)).unwrap();
        let session_id = scheduler.run_now("slow").unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;

        scheduler.kill("slow").await.unwrap();
        let job = scheduler.get("slow").unwrap();
        assert!(!job.currently_running);
        assert_eq!(job.last_status.as_deref(), Some("killed"));
        assert!(matches!(scheduler.inspect("slow"), Err(SchedulerError::NoActiveRun(_))));
        assert!(matches!(scheduler.kill("slow").await, Err(SchedulerError::NotRunning(_))));

        let session = scheduler.executor.sessions().get(&session_id).await.unwrap();
        assert_eq!(session.status, SessionStatus::Failed);
        assert_eq!(session.failure.as_deref(), Some("killed"));
        assert_eq!(session.message_count(), 0);
    }

    #[tokio::test]
    async fn test_pause_suppresses_due_runs() {
        let (scheduler, _dir) = scheduler();
        let mut every_minute = job("minutely", 0);
        every_minute.cron = "* * * * *".into();
        scheduler.create(every_minute).unwrap();
        scheduler.pause("minutely").unwrap();

        let now = Utc::now();
        let since = now - chrono::Duration::seconds(61);
        assert!(scheduler.run_due(since, now).is_empty());

        scheduler.unpause("minutely").unwrap();
        assert_eq!(scheduler.run_due(since, now), vec!["minutely".to_string()]);
        let job = wait_idle(&scheduler, "minutely").await;
        assert_eq!(job.last_status.as_deref(), Some("ok"));
    }

    #[tokio::test]
    async fn test_jobs_survive_reopen() {
        let (scheduler, dir) = scheduler();
        scheduler.create(job("daily", 0)).unwrap();
        scheduler.pause("daily").unwrap();

        let store = JobStore::new(dir.path().join("schedules.json"));
        let jobs = store.load().unwrap();
        assert_eq!(jobs.len(), 1);
        assert!(jobs[0].paused);

        scheduler.delete("daily").unwrap();
        assert!(matches!(scheduler.delete("daily"), Err(SchedulerError::NotFound(_))));
        assert!(store.load().unwrap().is_empty());
    }
}
