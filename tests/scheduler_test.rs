//! 调度集成测试：cron 触发、kill、暂停保护

mod common;

use std::time::Duration;

use apiary::core::ErrorKind;
use apiary::scheduler::ScheduledJob;
use apiary::session::{SessionStatus, SessionType};
use chrono::Utc;

const REPORT: &str = r#"
title: Report
description: scheduled report
prompt: "write the report {{ delay }}"
parameters:
  - key: delay
    input_type: string
    requirement: optional
    default: "0"
"#;

fn with_delay(id: &str, cron: &str, delay_ms: u64) -> ScheduledJob {
    ScheduledJob::new(id, "report", cron)
        .with_params([("delay".to_string(), delay_ms.to_string())].into_iter().collect())
}

async fn wait_idle(rt: &apiary::ApiaryRuntime, id: &str) -> ScheduledJob {
    for _ in 0..300 {
        let job = rt.list_jobs().into_iter().find(|j| j.id == id).unwrap();
        if !job.currently_running {
            return job;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("job {id} did not finish");
}

#[tokio::test]
async fn cron_run_produces_browsable_session() {
    let dir = tempfile::tempdir().unwrap();
    common::write_recipe(dir.path(), "report", REPORT);
    let rt = common::runtime(dir.path());
    rt.create_job(with_delay("every-minute", "* * * * *", 0)).unwrap();

    let now = Utc::now();
    let started = rt
        .scheduler()
        .run_due(now - chrono::Duration::seconds(60), now);
    assert_eq!(started, vec!["every-minute".to_string()]);

    let job = wait_idle(&rt, "every-minute").await;
    assert_eq!(job.last_status.as_deref(), Some("ok"));

    let sessions = rt.list_sessions().await.unwrap();
    assert_eq!(sessions.len(), 1);
    let session = &sessions[0];
    assert_eq!(session.schedule_id.as_deref(), Some("every-minute"));
    assert_eq!(session.session_type, SessionType::Scheduled);
    assert!(session.message_count >= 1);
    assert_eq!(rt.job_sessions("every-minute", 10).await.unwrap().len(), 1);
}

#[tokio::test]
async fn kill_mid_run_marks_session_failed() {
    let dir = tempfile::tempdir().unwrap();
    common::write_recipe(dir.path(), "report", REPORT);
    let rt = common::runtime(dir.path());
    rt.create_job(with_delay("slow", "0 3 * * *", 5_000)).unwrap();

    let session_id = rt.run_job_now("slow").unwrap();
    tokio::time::sleep(Duration::from_millis(150)).await;
    assert_eq!(rt.inspect_job("slow").unwrap().session_id, session_id);

    rt.kill_job("slow").await.unwrap();
    let job = rt.list_jobs().into_iter().find(|j| j.id == "slow").unwrap();
    assert!(!job.currently_running);
    assert_eq!(job.last_status.as_deref(), Some("killed"));

    let session = rt.get_session(&session_id).await.unwrap();
    assert_eq!(session.status, SessionStatus::Failed);
    assert_eq!(session.message_count(), 0);

    tokio::time::sleep(Duration::from_millis(300)).await;
    let later = rt.get_session(&session_id).await.unwrap();
    assert_eq!(later.message_count(), 0);
    assert_eq!(later.updated_at, session.updated_at);
    assert_eq!(rt.inspect_job("slow").unwrap_err().kind(), ErrorKind::NotFound);
}

#[tokio::test]
async fn pause_guard_rejects_running_job() {
    let dir = tempfile::tempdir().unwrap();
    common::write_recipe(dir.path(), "report", REPORT);
    let rt = common::runtime(dir.path());
    rt.create_job(with_delay("busy", "0 3 * * *", 3_000)).unwrap();
    assert_eq!(
        rt.create_job(with_delay("busy", "0 3 * * *", 0)).unwrap_err().kind(),
        ErrorKind::Conflict
    );

    rt.run_job_now("busy").unwrap();
    let err = rt.pause_job("busy").unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Conflict);
    let job = rt.list_jobs().into_iter().find(|j| j.id == "busy").unwrap();
    assert!(job.currently_running);
    assert!(!job.paused);
    assert_eq!(rt.delete_job("busy").unwrap_err().kind(), ErrorKind::Conflict);

    rt.kill_job("busy").await.unwrap();
    rt.pause_job("busy").unwrap();
}
