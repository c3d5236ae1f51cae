//! 工具执行器
//!
//! 对每次调用施加超时（扩展自带超时优先于全局超时）并响应取消；
//! 超时或失败时转为 AgentError（ToolTimeout / ToolExecutionFailed），每次调用输出结构化审计日志（JSON）。

use std::time::{Duration, Instant};

use tokio::time::timeout;
use tokio_util::sync::CancellationToken;

use crate::core::AgentError;
use crate::extensions::ToolEntry;

/// 工具执行器
#[derive(Debug, Clone)]
pub struct ToolExecutor {
    default_timeout: Duration,
}

impl ToolExecutor {
    pub fn new(default_timeout: Duration) -> Self {
        Self { default_timeout }
    }

    pub async fn execute(
        &self,
        entry: &ToolEntry,
        args: serde_json::Value,
        cancel: &CancellationToken,
    ) -> Result<String, AgentError> {
        let start = Instant::now();
        let args_preview = args_preview(&args);
        let limit = entry.timeout.unwrap_or(self.default_timeout);

        let result = tokio::select! {
            r = timeout(limit, entry.tool.execute(args)) => Some(r),
            _ = cancel.cancelled() => None,
        };

        let outcome = match &result {
            Some(Ok(Ok(_))) => "ok",
            Some(Ok(Err(_))) => "error",
            Some(Err(_)) => "timeout",
            None => "cancelled",
        };
        let audit = serde_json::json!({
            "event": "tool_audit",
            "tool": entry.full_name,
            "ok": outcome == "ok",
            "outcome": outcome,
            "duration_ms": start.elapsed().as_millis() as u64,
            "args_preview": args_preview,
        });
        tracing::info!(audit = %audit.to_string(), "tool");

        match result {
            Some(Ok(Ok(content))) => Ok(content),
            Some(Ok(Err(e))) => Err(AgentError::ToolExecutionFailed(e)),
            Some(Err(_)) => Err(AgentError::ToolTimeout(entry.full_name.clone())),
            None => Err(AgentError::Cancelled),
        }
    }
}

impl Default for ToolExecutor {
    fn default() -> Self {
        Self::new(Duration::from_secs(30))
    }
}

fn args_preview(args: &serde_json::Value) -> String {
    let s = args.to_string();
    if s.chars().count() > 200 {
        format!("{}...", s.chars().take(200).collect::<String>())
    } else {
        s
    }
}
