//! cron 表达式
//!
//! 接受 5 段（分 时 日 月 周）或 6 段（带秒），转成 cron crate 需要的 7 段（秒 … 年）。

use std::str::FromStr;

use chrono::{DateTime, Utc};
use cron::Schedule;

use crate::scheduler::SchedulerError;

pub fn normalize(expr: &str) -> Result<String, SchedulerError> {
    let trimmed = expr.trim();
    let fields = trimmed.split_whitespace().count();
    match fields {
        5 => Ok(format!("0 {trimmed} *")),
        6 => Ok(format!("{trimmed} *")),
        7 => Ok(trimmed.to_string()),
        n => Err(SchedulerError::InvalidCron {
            expr: expr.to_string(),
            reason: format!("expected 5 or 6 fields, got {n}"),
        }),
    }
}

pub fn parse(expr: &str) -> Result<Schedule, SchedulerError> {
    let normalized = normalize(expr)?;
    Schedule::from_str(&normalized).map_err(|e| SchedulerError::InvalidCron {
        expr: expr.to_string(),
        reason: e.to_string(),
    })
}

/// (after, until] 内是否有触发时刻
pub fn fires_between(schedule: &Schedule, after: DateTime<Utc>, until: DateTime<Utc>) -> bool {
    schedule
        .after(&after)
        .next()
        .is_some_and(|t| t <= until)
}

pub fn next_fire(schedule: &Schedule, after: DateTime<Utc>) -> Option<DateTime<Utc>> {
    schedule.after(&after).next()
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone;

    use super::*;

    #[test]
    fn test_normalize() {
        assert_eq!(normalize("*/5 * * * *").unwrap(), "0 */5 * * * * *");
        assert_eq!(normalize("30 0 9 * * Mon").unwrap(), "30 0 9 * * Mon *");
        assert!(matches!(normalize("* *"), Err(SchedulerError::InvalidCron { .. })));
        assert!(parse("61 * * * *").is_err());
    }

    #[test]
    fn test_fires_between() {
        let every_minute = parse("* * * * *").unwrap();
        let t0 = Utc.with_ymd_and_hms(2026, 3, 1, 10, 0, 30).unwrap();
        assert!(fires_between(&every_minute, t0, t0 + chrono::Duration::seconds(31)));
        assert!(!fires_between(&every_minute, t0, t0 + chrono::Duration::seconds(29)));

        let nine_am = parse("0 9 * * *").unwrap();
        let next = next_fire(&nine_am, t0).unwrap();
        assert_eq!(next, Utc.with_ymd_and_hms(2026, 3, 2, 9, 0, 0).unwrap());
    }
}
