//! 成功校验与重试
//!
//! 一次运行后按顺序执行 success check（`sh -c`，退出码 0 且未超时为通过）。
//! 任一失败（或运行本身失败）即为失败尝试：先跑 on_failure 清理，再在尝试次数未超过 1 + max_retries 时重跑。
//! 全部尝试用尽后返回最终失败，并附上最后一次的失败原因。

use std::future::Future;
use std::path::Path;
use std::process::Stdio;
use std::time::Duration;

use tokio::process::Command;
use tokio_util::sync::CancellationToken;

use crate::agent::{AgentReply, ReplyOutcome};
use crate::core::AgentError;
use crate::llm::Usage;
use crate::recipe::{RetryConfig, SuccessCheck};

const STDERR_PREVIEW_CHARS: usize = 300;

/// 校验与重试后的最终结局
#[derive(Debug, Clone)]
pub struct FinalOutcome {
    /// 最后一次尝试的回复
    pub reply: AgentReply,
    pub attempts: u32,
    pub success: bool,
    pub failure: Option<String>,
    /// 全部尝试的用量之和
    pub usage: Usage,
}

#[derive(Debug, Clone, Default)]
pub struct RetryEngine;

impl RetryEngine {
    pub fn new() -> Self {
        Self
    }

    /// `rerun(attempt)` 发起第 attempt 次尝试（从 2 开始）
    pub async fn validate_and_retry<F, Fut>(
        &self,
        config: Option<&RetryConfig>,
        working_dir: &Path,
        first: AgentReply,
        cancel: &CancellationToken,
        mut rerun: F,
    ) -> Result<FinalOutcome, AgentError>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<AgentReply, AgentError>>,
    {
        let mut reply = first;
        let mut usage = reply.usage;
        let mut attempt: u32 = 1;

        let Some(config) = config else {
            let failure = run_failure(&reply);
            return Ok(FinalOutcome {
                success: failure.is_none(),
                reply,
                attempts: attempt,
                failure,
                usage,
            });
        };

        loop {
            let failure = match run_failure(&reply) {
                Some(reason) => Some(reason),
                None => self.run_checks(config, working_dir, cancel).await?,
            };
            let Some(reason) = failure else {
                tracing::info!(attempt, "success checks passed");
                return Ok(FinalOutcome {
                    reply,
                    attempts: attempt,
                    success: true,
                    failure: None,
                    usage,
                });
            };

            tracing::warn!(attempt, max_retries = config.max_retries, reason = %reason, "attempt failed");
            if let Some(command) = &config.on_failure {
                let limit = Duration::from_secs(config.on_failure_timeout_secs());
                if let Err(e) = run_shell(command, working_dir, limit, cancel).await? {
                    tracing::warn!(attempt, error = %e, "on_failure command failed");
                }
            }
            if attempt > config.max_retries {
                return Ok(FinalOutcome {
                    reply,
                    attempts: attempt,
                    success: false,
                    failure: Some(reason),
                    usage,
                });
            }

            attempt += 1;
            tracing::info!(attempt, "retrying run");
            reply = rerun(attempt).await?;
            usage.add(reply.usage);
        }
    }

    /// 返回第一个失败的 check 的原因；全部通过为 None
    async fn run_checks(
        &self,
        config: &RetryConfig,
        working_dir: &Path,
        cancel: &CancellationToken,
    ) -> Result<Option<String>, AgentError> {
        let limit = Duration::from_secs(config.check_timeout_secs());
        for check in &config.checks {
            let SuccessCheck::Shell { command } = check;
            if let Err(reason) = run_shell(command, working_dir, limit, cancel).await? {
                return Ok(Some(reason));
            }
        }
        Ok(None)
    }
}

fn run_failure(reply: &AgentReply) -> Option<String> {
    match &reply.outcome {
        ReplyOutcome::Completed(_) => None,
        ReplyOutcome::Failed(reason) => Some(format!("run failed: {reason}")),
    }
}

/// 外层 Err 只表示取消；内层 Err 为失败原因
async fn run_shell(
    command: &str,
    working_dir: &Path,
    limit: Duration,
    cancel: &CancellationToken,
) -> Result<Result<(), String>, AgentError> {
    let mut cmd = Command::new("sh");
    cmd.arg("-c")
        .arg(command)
        .current_dir(working_dir)
        .stdin(Stdio::null())
        .kill_on_drop(true);

    let output = tokio::select! {
        r = tokio::time::timeout(limit, cmd.output()) => r,
        _ = cancel.cancelled() => return Err(AgentError::Cancelled),
    };
    Ok(match output {
        Err(_) => Err(format!("`{command}` timed out after {}s", limit.as_secs())),
        Ok(Err(e)) => Err(format!("`{command}` could not start: {e}")),
        Ok(Ok(out)) if out.status.success() => Ok(()),
        Ok(Ok(out)) => {
            let stderr = String::from_utf8_lossy(&out.stderr);
            let stderr: String = stderr.trim().chars().take(STDERR_PREVIEW_CHARS).collect();
            let code = out
                .status
                .code()
                .map(|c| c.to_string())
                .unwrap_or_else(|| "signal".to_string());
            if stderr.is_empty() {
                Err(format!("`{command}` exited with {code}"))
            } else {
                Err(format!("`{command}` exited with {code}: {stderr}"))
            }
        }
    })
}
