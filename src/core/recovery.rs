//! 错误恢复引擎
//!
//! 根据 AgentError 类型返回 RecoveryAction，供回复循环决定是注入提示重试、退避后重调 Provider 还是终止。

use std::time::Duration;

use crate::core::{AgentError, RecoveryAction};

/// 语义化错误恢复：将错误映射为可执行动作
#[derive(Debug, Clone)]
pub struct RecoveryEngine {
    /// 瞬时 Provider 错误的最大重试次数
    max_provider_retries: u32,
    backoff: Duration,
}

impl RecoveryEngine {
    pub fn new(max_provider_retries: u32, backoff: Duration) -> Self {
        Self {
            max_provider_retries,
            backoff,
        }
    }

    /// attempt：同一步内已重试的次数（从 0 开始）
    pub fn handle(&self, err: &AgentError, attempt: u32) -> RecoveryAction {
        match err {
            AgentError::JsonParseError(raw) => RecoveryAction::RetryWithPrompt(format!(
                "上一轮输出的 JSON 格式错误: {raw}。\
                调用工具时你必须只输出一个合法的 JSON 对象，不能输出代码、Markdown 或其它文字。\
                格式必须为: {{\"tool\": \"扩展名__工具名\", \"args\": {{...}}}}。\
                例如: {{\"tool\": \"echo__echo\", \"args\": {{\"text\": \"hi\"}}}}。请只输出这一行 JSON。"
            )),
            AgentError::SchemaMismatch(reason) => RecoveryAction::RetryWithPrompt(format!(
                "最终回复必须是符合要求的 JSON：{reason}。请只输出该 JSON，不要附加其它文字。"
            )),
            AgentError::Provider(e) if e.is_retryable() && attempt < self.max_provider_retries => {
                let delay = e
                    .retry_after()
                    .unwrap_or_else(|| self.backoff * 2u32.saturating_pow(attempt));
                RecoveryAction::RetryAfter(delay)
            }
            _ => RecoveryAction::Abort,
        }
    }
}

impl Default for RecoveryEngine {
    fn default() -> Self {
        Self::new(2, Duration::from_millis(500))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::LlmError;

    #[test]
    fn test_recovery_json_parse_error() {
        let engine = RecoveryEngine::default();
        let err = AgentError::JsonParseError("invalid json".to_string());
        match engine.handle(&err, 0) {
            RecoveryAction::RetryWithPrompt(msg) => assert!(msg.contains("JSON")),
            other => panic!("Expected RetryWithPrompt, got {other:?}"),
        }
    }

    #[test]
    fn test_recovery_rate_limited_uses_hint() {
        let engine = RecoveryEngine::default();
        let err = AgentError::Provider(LlmError::RateLimited { retry_after_ms: 1000 });
        match engine.handle(&err, 0) {
            RecoveryAction::RetryAfter(d) => assert_eq!(d, Duration::from_millis(1000)),
            other => panic!("Expected RetryAfter, got {other:?}"),
        }
    }

    #[test]
    fn test_recovery_backoff_grows_then_aborts() {
        let engine = RecoveryEngine::new(2, Duration::from_millis(100));
        let err = AgentError::Provider(LlmError::Timeout);
        assert!(matches!(
            engine.handle(&err, 1),
            RecoveryAction::RetryAfter(d) if d == Duration::from_millis(200)
        ));
        assert!(matches!(engine.handle(&err, 2), RecoveryAction::Abort));
    }

    #[test]
    fn test_recovery_terminal_provider_error() {
        let engine = RecoveryEngine::default();
        let err = AgentError::Provider(LlmError::ContentPolicy("blocked".into()));
        assert!(matches!(engine.handle(&err, 0), RecoveryAction::Abort));
    }

    #[test]
    fn test_recovery_cancelled() {
        let engine = RecoveryEngine::default();
        assert!(matches!(
            engine.handle(&AgentError::Cancelled, 0),
            RecoveryAction::Abort
        ));
    }
}
