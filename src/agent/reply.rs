//! 单轮运行循环
//!
//! 每一步：拼 system prompt（指令 + 工具清单）→ 调 LLM → 解析为工具调用或最终回复。
//! 工具失败记为 ToolError 内容项后继续；可重试的 Provider 错误按 RecoveryEngine 退避重试；
//! JSON 格式错误与 schema 不符注入仅 Agent 可见的纠正提示；步数耗尽或终止类错误记为失败。
//! 只有取消会以 Err 返回，调用方据此不写入任何结果。

use std::sync::Arc;

use serde_json::Value;
use tokio_util::sync::CancellationToken;

use crate::agent::events::{preview, send_event};
use crate::agent::planner::{self, PlannerOutput, ToolCall, ToolDescriptor};
use crate::agent::{platform, Agent, AgentEvent, EventSender};
use crate::conversation::{last_user_text, Message};
use crate::core::{AgentError, RecoveryAction};
use crate::extensions::{ExtensionScope, PermissionDecision, PermissionLevel, ToolEntry};
use crate::llm::Usage;
use crate::session::SessionType;
use crate::tasks::TaskRunner;

const RESULT_PREVIEW_CHARS: usize = 200;

/// 一次运行的输入
pub struct ReplyContext {
    /// 运行开始前的会话对话
    pub conversation: Vec<Message>,
    pub instructions: Option<String>,
    pub response_schema: Option<Value>,
    pub scope: Option<ExtensionScope>,
    /// 实时消费者；None 表示缓冲模式
    pub events: Option<EventSender>,
    pub cancel: CancellationToken,
    pub task_runner: Option<Arc<dyn TaskRunner>>,
}

impl ReplyContext {
    pub fn new(cancel: CancellationToken) -> Self {
        Self {
            conversation: Vec::new(),
            instructions: None,
            response_schema: None,
            scope: None,
            events: None,
            cancel,
            task_runner: None,
        }
    }

    pub fn with_conversation(mut self, conversation: Vec<Message>) -> Self {
        self.conversation = conversation;
        self
    }

    pub fn with_instructions(mut self, instructions: Option<String>) -> Self {
        self.instructions = instructions;
        self
    }

    pub fn with_response_schema(mut self, schema: Option<Value>) -> Self {
        self.response_schema = schema;
        self
    }

    pub fn with_scope(mut self, scope: Option<ExtensionScope>) -> Self {
        self.scope = scope;
        self
    }

    pub fn with_events(mut self, events: Option<EventSender>) -> Self {
        self.events = events;
        self
    }

    pub fn with_task_runner(mut self, runner: Option<Arc<dyn TaskRunner>>) -> Self {
        self.task_runner = runner;
        self
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum ReplyOutcome {
    Completed(String),
    Failed(String),
}

/// 一次运行的产物：本次新增的消息（含用户消息）、token 用量、结局
#[derive(Debug, Clone)]
pub struct AgentReply {
    pub messages: Vec<Message>,
    pub usage: Usage,
    pub outcome: ReplyOutcome,
}

impl AgentReply {
    fn failed(messages: Vec<Message>, usage: Usage, reason: String) -> Self {
        Self {
            messages,
            usage,
            outcome: ReplyOutcome::Failed(reason),
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self.outcome, ReplyOutcome::Completed(_))
    }

    pub fn output(&self) -> Option<&str> {
        match &self.outcome {
            ReplyOutcome::Completed(text) => Some(text),
            ReplyOutcome::Failed(_) => None,
        }
    }
}

fn descriptor(entry: ToolEntry) -> ToolDescriptor {
    ToolDescriptor {
        parameters: entry.tool.parameters_schema(),
        description: entry.description().to_string(),
        name: entry.full_name,
    }
}

fn call_id() -> String {
    let raw = uuid::Uuid::new_v4().simple().to_string();
    format!("call_{}", &raw[..12])
}

impl Agent {
    pub async fn reply(&self, ctx: ReplyContext, user_message: Message) -> Result<AgentReply, AgentError> {
        if self.is_closed() {
            return Err(AgentError::NotInitialized(self.session_id.clone()));
        }
        let events = ctx.events.as_ref();
        let cancel = &ctx.cancel;
        let extras = self.prompt_extras.read().await.clone();
        let allow_platform = self.session_type != SessionType::SubAgent && ctx.task_runner.is_some();

        let mut produced = vec![user_message];
        let mut usage = Usage::default();
        let mut provider_attempt: u32 = 0;
        let mut step = 0usize;

        loop {
            if cancel.is_cancelled() {
                return Err(AgentError::Cancelled);
            }
            if step >= self.max_turns {
                let err = AgentError::MaxTurnsReached(self.max_turns);
                tracing::warn!(session_id = %self.session_id, "max turns reached");
                send_event(events, AgentEvent::Error { text: err.to_string() });
                return Ok(AgentReply::failed(produced, usage, err.to_string()));
            }
            send_event(events, AgentEvent::StepUpdate { step, max_steps: self.max_turns });

            let history: Vec<Message> = ctx
                .conversation
                .iter()
                .chain(produced.iter())
                .filter(|m| m.is_agent_visible())
                .cloned()
                .collect();
            let entries = self.tool_entries(ctx.scope.as_ref()).await;
            let selection = self.tool_selection.read().await.clone();
            let query = last_user_text(&history);
            let mut offered: Vec<ToolDescriptor> = selection
                .select(entries.clone(), query.as_deref())
                .into_iter()
                .map(descriptor)
                .collect();
            if allow_platform {
                offered.extend(platform::descriptors(&self.sub_recipes.read().await));
            }
            let system = planner::build_system_prompt(
                ctx.instructions.as_deref(),
                &extras,
                &offered,
                ctx.response_schema.as_ref(),
            );

            send_event(events, AgentEvent::Thinking);
            let provider = self.provider.read().await.clone();
            let result = tokio::select! {
                r = provider.complete(&system, &history) => r,
                _ = cancel.cancelled() => return Err(AgentError::Cancelled),
            };
            let completion = match result {
                Ok(c) => {
                    provider_attempt = 0;
                    c
                }
                Err(e) => {
                    let err = AgentError::Provider(e);
                    match self.recovery.handle(&err, provider_attempt) {
                        RecoveryAction::RetryAfter(delay) => {
                            provider_attempt += 1;
                            tracing::warn!(session_id = %self.session_id, attempt = provider_attempt, error = %err, "provider call failed, retrying");
                            send_event(events, AgentEvent::Recovery {
                                action: "RetryAfter".to_string(),
                                detail: format!("{err}; retrying in {}ms", delay.as_millis()),
                            });
                            tokio::select! {
                                _ = tokio::time::sleep(delay) => {}
                                _ = cancel.cancelled() => return Err(AgentError::Cancelled),
                            }
                            continue;
                        }
                        _ => {
                            tracing::warn!(session_id = %self.session_id, error = %err, "provider call failed");
                            send_event(events, AgentEvent::Recovery {
                                action: "Abort".to_string(),
                                detail: err.to_string(),
                            });
                            send_event(events, AgentEvent::Error { text: err.to_string() });
                            return Ok(AgentReply::failed(produced, usage, err.to_string()));
                        }
                    }
                }
            };
            usage.add(completion.usage);
            step += 1;

            match planner::parse_llm_output(&completion.content) {
                Ok(PlannerOutput::Response(text)) => {
                    if let Some(schema) = &ctx.response_schema {
                        if let Err(err) = planner::check_response_schema(&text, schema) {
                            if let RecoveryAction::RetryWithPrompt(prompt) = self.recovery.handle(&err, 0) {
                                send_event(events, AgentEvent::Recovery {
                                    action: "RetryWithPrompt".to_string(),
                                    detail: err.to_string(),
                                });
                                produced.push(Message::assistant(text).agent_only());
                                produced.push(Message::user(prompt).agent_only());
                                continue;
                            }
                        }
                    }
                    let message = Message::assistant(text.clone());
                    send_event(events, AgentEvent::Message { message: message.clone() });
                    send_event(events, AgentEvent::TokenUsage {
                        input_tokens: usage.input_tokens,
                        output_tokens: usage.output_tokens,
                        total_tokens: usage.total(),
                    });
                    produced.push(message);
                    return Ok(AgentReply {
                        messages: produced,
                        usage,
                        outcome: ReplyOutcome::Completed(text),
                    });
                }
                Ok(PlannerOutput::ToolCall(call)) => {
                    let id = call_id();
                    produced.push(Message::tool_request(&id, &call.tool, call.args.clone()));
                    send_event(events, AgentEvent::ToolCall {
                        id: id.clone(),
                        tool: call.tool.clone(),
                        args: call.args.clone(),
                    });
                    match self.invoke_tool(&call, &entries, &ctx, allow_platform).await {
                        Ok(output) => {
                            send_event(events, AgentEvent::ToolResult {
                                id: id.clone(),
                                tool: call.tool.clone(),
                                preview: preview(&output, RESULT_PREVIEW_CHARS),
                            });
                            produced.push(Message::tool_response(&id, output));
                        }
                        Err(AgentError::Cancelled) => return Err(AgentError::Cancelled),
                        Err(e) => {
                            tracing::warn!(session_id = %self.session_id, tool = %call.tool, error = %e, "tool call failed");
                            send_event(events, AgentEvent::ToolFailure {
                                id: id.clone(),
                                tool: call.tool.clone(),
                                reason: e.to_string(),
                            });
                            produced.push(Message::tool_error(&id, &call.tool, e.to_string()));
                        }
                    }
                }
                Err(err) => match self.recovery.handle(&err, 0) {
                    RecoveryAction::RetryWithPrompt(prompt) => {
                        send_event(events, AgentEvent::Recovery {
                            action: "RetryWithPrompt".to_string(),
                            detail: err.to_string(),
                        });
                        produced.push(Message::assistant(completion.content).agent_only());
                        produced.push(Message::user(prompt).agent_only());
                    }
                    _ => {
                        send_event(events, AgentEvent::Error { text: err.to_string() });
                        return Ok(AgentReply::failed(produced, usage, err.to_string()));
                    }
                },
            }
        }
    }

    async fn invoke_tool(
        &self,
        call: &ToolCall,
        entries: &[ToolEntry],
        ctx: &ReplyContext,
        allow_platform: bool,
    ) -> Result<String, AgentError> {
        if platform::is_platform_tool(&call.tool) {
            let runner = match (&ctx.task_runner, allow_platform) {
                (Some(runner), true) => Arc::clone(runner),
                _ => return Err(AgentError::HallucinatedTool(call.tool.clone())),
            };
            self.check_permission(call, ctx).await?;
            return self.run_platform_tool(call, runner.as_ref(), &ctx.cancel).await;
        }

        let entry = entries
            .iter()
            .find(|e| e.full_name == call.tool)
            .ok_or_else(|| AgentError::HallucinatedTool(call.tool.clone()))?;
        self.check_permission(call, ctx).await?;
        self.executor.execute(entry, call.args.clone(), &ctx.cancel).await
    }

    async fn check_permission(&self, call: &ToolCall, ctx: &ReplyContext) -> Result<(), AgentError> {
        let level = self.permissions.read().await.level(&call.tool);
        match level {
            PermissionLevel::AlwaysAllow => Ok(()),
            PermissionLevel::NeverAllow => Err(AgentError::ToolDenied(format!("{} is not allowed", call.tool))),
            PermissionLevel::AskBefore => self.ask_confirmation(call, ctx).await,
        }
    }

    /// 向实时消费者请求确认；没有消费者时直接拒绝
    async fn ask_confirmation(&self, call: &ToolCall, ctx: &ReplyContext) -> Result<(), AgentError> {
        let Some(events) = ctx.events.as_ref().filter(|tx| !tx.is_closed()) else {
            return Err(AgentError::ToolDenied(format!(
                "{} requires confirmation but no one is listening",
                call.tool
            )));
        };
        let request_id = uuid::Uuid::new_v4().to_string();
        let rx = self.confirmations.register(&request_id);
        send_event(Some(events), AgentEvent::ConfirmationRequired {
            request_id: request_id.clone(),
            tool: call.tool.clone(),
            args: call.args.clone(),
        });
        tracing::info!(session_id = %self.session_id, tool = %call.tool, request_id = %request_id, "waiting for tool confirmation");

        let decision = tokio::select! {
            d = rx => d.ok(),
            _ = tokio::time::sleep(self.confirmation_timeout) => None,
            _ = ctx.cancel.cancelled() => {
                self.confirmations.forget(&request_id);
                return Err(AgentError::Cancelled);
            }
        };
        self.confirmations.forget(&request_id);
        match decision {
            Some(PermissionDecision::Confirm) => Ok(()),
            Some(PermissionDecision::Deny) => Err(AgentError::ToolDenied(format!("{} denied by user", call.tool))),
            None => Err(AgentError::ToolDenied(format!("{} confirmation timed out", call.tool))),
        }
    }
}
