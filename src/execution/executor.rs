//! 统一执行器
//!
//! 同一会话的执行由 Agent 的运行锁串行化；运行令牌登记在 SessionSupervisor，删除会话或 kill 时取消。
//! 观察到取消后不再追加消息，只把仍处于 Running 的会话记为 Failed。

use std::path::{Path, PathBuf};
use std::sync::{Arc, OnceLock, Weak};

use tokio_util::sync::CancellationToken;

use crate::agent::{Agent, AgentManager, EventSender, ReplyContext};
use crate::conversation::Message;
use crate::core::{AgentError, SessionSupervisor};
use crate::execution::{
    ExecutionError, ExecutionMode, ExecutionRequest, ExecutionResult, ExecutionStatus, RecipeSource,
    RetryEngine,
};
use crate::llm::Usage;
use crate::recipe::{load_recipe_file, Recipe};
use crate::session::{SessionSeed, SessionStatus, SessionStore};
use crate::tasks::TaskRunner;

const DESCRIPTION_CHARS: usize = 60;

pub struct UnifiedExecutor {
    agents: Arc<AgentManager>,
    sessions: Arc<dyn SessionStore>,
    supervisor: Arc<SessionSupervisor>,
    retry: RetryEngine,
    default_working_dir: PathBuf,
    recipes_dir: PathBuf,
    task_runner: OnceLock<Weak<dyn TaskRunner>>,
}

/// 请求来源解析后的形态
enum Resolved {
    /// File / Inline：绑定到会话并应用 settings、子 Recipe
    Bound(Recipe),
    FollowUp(String),
}

impl UnifiedExecutor {
    pub fn new(
        agents: Arc<AgentManager>,
        sessions: Arc<dyn SessionStore>,
        supervisor: Arc<SessionSupervisor>,
        default_working_dir: PathBuf,
        recipes_dir: PathBuf,
    ) -> Self {
        Self {
            agents,
            sessions,
            supervisor,
            retry: RetryEngine::new(),
            default_working_dir,
            recipes_dir,
            task_runner: OnceLock::new(),
        }
    }

    /// 平台工具派发子任务用的扇出；只保存弱引用
    pub fn set_task_runner(&self, runner: &Arc<dyn TaskRunner>) {
        if self.task_runner.set(Arc::downgrade(runner)).is_err() {
            tracing::warn!("task runner already set");
        }
    }

    fn task_runner(&self) -> Option<Arc<dyn TaskRunner>> {
        self.task_runner.get().and_then(Weak::upgrade)
    }

    pub fn agents(&self) -> &Arc<AgentManager> {
        &self.agents
    }

    pub fn sessions(&self) -> &Arc<dyn SessionStore> {
        &self.sessions
    }

    pub fn supervisor(&self) -> &Arc<SessionSupervisor> {
        &self.supervisor
    }

    /// 缓冲执行
    pub async fn execute(&self, req: ExecutionRequest) -> Result<ExecutionResult, ExecutionError> {
        self.run(req, None, None).await
    }

    /// 由调用方持有取消令牌（调度器 kill、扇出超时）
    pub async fn execute_with_token(
        &self,
        req: ExecutionRequest,
        token: CancellationToken,
    ) -> Result<ExecutionResult, ExecutionError> {
        self.run(req, None, Some(token)).await
    }

    /// 事件实时推给消费者
    pub async fn execute_stream(
        &self,
        req: ExecutionRequest,
        events: EventSender,
    ) -> Result<ExecutionResult, ExecutionError> {
        self.run(req, Some(events), None).await
    }

    /// 向会话追加一轮消息（扇出结果写回父会话）；与该会话的运行串行
    pub async fn append_turn(&self, session_id: &str, messages: Vec<Message>) -> Result<(), ExecutionError> {
        let agent = self.agents.get(session_id).await.ok();
        let _guard = match &agent {
            Some(agent) => Some(agent.lock_run().await),
            None => None,
        };
        self.sessions
            .append_messages(session_id, &messages, Usage::default())
            .await?;
        Ok(())
    }

    async fn run(
        &self,
        req: ExecutionRequest,
        events: Option<EventSender>,
        token: Option<CancellationToken>,
    ) -> Result<ExecutionResult, ExecutionError> {
        let session_id = req.session_id.clone();
        let resolved = self.resolve(&req.source)?;

        let mut seed = SessionSeed::new(
            req.working_dir.clone().unwrap_or_else(|| self.default_working_dir.clone()),
            req.mode.session_type(),
        );
        if let Some(parent) = &req.parent_session_id {
            seed = seed.with_parent(parent.clone());
        }
        if let Some(schedule_id) = &req.schedule_id {
            seed = seed.with_schedule(schedule_id.clone());
        }
        self.sessions.get_or_create(&session_id, seed).await?;

        let agent = self
            .agents
            .get_or_create(&session_id)
            .await
            .map_err(ExecutionError::AgentUnavailable)?;
        // 会话与 Agent 的所有改动都在运行锁内
        let _run = agent.lock_run().await;
        let guard = self.supervisor.begin(&session_id, token);
        let cancel = guard.token();
        if cancel.is_cancelled() {
            return Ok(ExecutionResult::cancelled(session_id, 0));
        }

        let session = self.sessions.get(&session_id).await?;
        let (recipe, bound) = match resolved {
            Resolved::Bound(recipe) => {
                self.sessions.set_recipe(&session_id, Some(recipe.clone())).await?;
                (recipe, true)
            }
            Resolved::FollowUp(text) => (follow_up(session.recipe.as_ref(), &text), false),
        };
        let user_text = recipe.initial_message().unwrap_or_default().to_string();
        if bound {
            prepare_agent(&agent, &recipe).await?;
        }
        let declared = recipe.extension_configs();
        let configs = match &req.scope {
            Some(scope) => scope.narrow(&declared),
            None => declared,
        };
        agent
            .bind_extensions(&configs)
            .await
            .map_err(ExecutionError::Extension)?;

        let working_dir = session.working_dir.clone();
        self.sessions
            .set_status(&session_id, SessionStatus::Running, None)
            .await?;
        let mark = RunningMark::new(Arc::clone(&self.sessions), &session_id);
        tracing::info!(
            session_id = %session_id,
            mode = ?req.mode,
            recipe = %recipe.title,
            "execution started"
        );

        let make_ctx = || {
            ReplyContext::new(cancel.clone())
                .with_conversation(session.messages.clone())
                .with_instructions(recipe.system_instructions())
                .with_response_schema(recipe.response_schema().cloned())
                .with_scope(req.scope.clone())
                .with_events(events.clone())
                .with_task_runner(self.task_runner())
        };

        let first = match agent.reply(make_ctx(), Message::user(user_text.clone())).await {
            Ok(reply) => reply,
            Err(AgentError::Cancelled) => return Ok(cancelled(mark, 1).await),
            Err(e) => {
                mark.fail(&e.to_string()).await;
                return Err(ExecutionError::AgentUnavailable(e));
            }
        };
        let outcome = self
            .retry
            .validate_and_retry(recipe.retry.as_ref(), &working_dir, first, &cancel, |attempt| {
                let agent = Arc::clone(&agent);
                let ctx = make_ctx();
                let message = Message::user(user_text.clone());
                let session_id = session_id.clone();
                async move {
                    tracing::info!(session_id = %session_id, attempt, "starting fresh attempt");
                    agent.reply(ctx, message).await
                }
            })
            .await;
        let outcome = match outcome {
            Ok(outcome) => outcome,
            Err(AgentError::Cancelled) => return Ok(cancelled(mark, 1).await),
            Err(e) => {
                mark.fail(&e.to_string()).await;
                return Err(ExecutionError::AgentUnavailable(e));
            }
        };
        if cancel.is_cancelled() {
            return Ok(cancelled(mark, outcome.attempts).await);
        }

        let mut messages = outcome.reply.messages.clone();
        if let Some(reason) = &outcome.failure {
            messages.push(Message::assistant(format!("Run failed: {reason}")).user_only());
        }
        self.sessions
            .append_messages(&session_id, &messages, outcome.usage)
            .await?;
        if session.description.is_empty() {
            self.sessions
                .update_description(&session_id, &describe(&recipe, &user_text))
                .await?;
        }
        if req.mode == ExecutionMode::Background {
            if let Some(schedule_id) = &req.schedule_id {
                self.sessions.set_schedule_id(&session_id, schedule_id).await?;
            }
        }
        let (status, session_status) = if outcome.success {
            (ExecutionStatus::Completed, SessionStatus::Completed)
        } else {
            (ExecutionStatus::Failed, SessionStatus::Failed)
        };
        self.sessions
            .set_status(&session_id, session_status, outcome.failure.clone())
            .await?;
        mark.disarm();

        tracing::info!(
            session_id = %session_id,
            attempts = outcome.attempts,
            success = outcome.success,
            total_tokens = outcome.usage.total(),
            "execution finished"
        );
        Ok(ExecutionResult {
            session_id,
            status,
            output: outcome.reply.output().map(str::to_string),
            error: outcome.failure,
            attempts: outcome.attempts,
            usage: outcome.usage,
            messages,
        })
    }

    fn resolve(&self, source: &RecipeSource) -> Result<Resolved, ExecutionError> {
        match source {
            RecipeSource::File { path, params } => {
                let (recipe, resolved_path) = load_recipe_file(path, params, Some(self.recipes_dir.as_path()))?;
                tracing::debug!(path = %resolved_path.display(), title = %recipe.title, "recipe loaded");
                Ok(Resolved::Bound(recipe))
            }
            RecipeSource::Inline { recipe } => {
                recipe.validate()?;
                Ok(Resolved::Bound((**recipe).clone()))
            }
            RecipeSource::Text { text } => Ok(Resolved::FollowUp(text.clone())),
        }
    }

    pub fn default_working_dir(&self) -> &Path {
        &self.default_working_dir
    }

    pub fn recipes_dir(&self) -> &Path {
        &self.recipes_dir
    }
}

/// 运行期间会话处于 Running；未正常收尾就离开（出错、取消、future 被丢弃）时补记 Failed
struct RunningMark {
    sessions: Arc<dyn SessionStore>,
    session_id: String,
    armed: bool,
}

impl RunningMark {
    fn new(sessions: Arc<dyn SessionStore>, session_id: &str) -> Self {
        Self {
            sessions,
            session_id: session_id.to_string(),
            armed: true,
        }
    }

    async fn fail(mut self, reason: &str) {
        self.armed = false;
        mark_failed_if_running(self.sessions.as_ref(), &self.session_id, reason).await;
    }

    fn disarm(mut self) {
        self.armed = false;
    }
}

impl Drop for RunningMark {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            tracing::warn!(session_id = %self.session_id, "run dropped outside runtime, status left as running");
            return;
        };
        let sessions = Arc::clone(&self.sessions);
        let session_id = std::mem::take(&mut self.session_id);
        handle.spawn(async move {
            mark_failed_if_running(sessions.as_ref(), &session_id, "interrupted").await;
        });
    }
}

/// 只改仍处于 Running 的会话；已被别处收尾（kill、超时）的不覆盖
async fn mark_failed_if_running(sessions: &dyn SessionStore, session_id: &str, reason: &str) {
    match sessions.get(session_id).await {
        Ok(session) if session.status == SessionStatus::Running => {
            if let Err(e) = sessions
                .set_status(session_id, SessionStatus::Failed, Some(reason.to_string()))
                .await
            {
                tracing::warn!(session_id = %session_id, error = %e, "failed to record run failure");
            }
        }
        Ok(_) => {}
        Err(e) => tracing::debug!(session_id = %session_id, error = %e, "session gone, failure not recorded"),
    }
}

async fn cancelled(mark: RunningMark, attempts: u32) -> ExecutionResult {
    let session_id = mark.session_id.clone();
    mark.fail("cancelled").await;
    tracing::info!(session_id = %session_id, "execution cancelled, no messages written");
    ExecutionResult::cancelled(session_id, attempts)
}

/// 文本消息：会话已绑定 Recipe 时沿用其指令、上下文与扩展，不带重试与输出约束
fn follow_up(bound: Option<&Recipe>, text: &str) -> Recipe {
    match bound {
        Some(bound) => {
            let mut recipe = bound.clone();
            recipe.prompt = Some(text.to_string());
            recipe.retry = None;
            recipe.response = None;
            recipe
        }
        None => Recipe::from_text(text),
    }
}

async fn prepare_agent(agent: &Agent, recipe: &Recipe) -> Result<(), ExecutionError> {
    if let Some(settings) = &recipe.settings {
        if settings.provider.is_some() || settings.model.is_some() {
            agent
                .update_provider(settings.provider.as_deref(), settings.model.as_deref())
                .await
                .map_err(ExecutionError::Provider)?;
        }
    }
    if let Some(subs) = &recipe.sub_recipes {
        agent.add_sub_recipes(subs.clone()).await;
    }
    Ok(())
}

fn describe(recipe: &Recipe, user_text: &str) -> String {
    if !recipe.is_adhoc() {
        return recipe.title.clone();
    }
    let line = user_text.lines().next().unwrap_or_default().trim();
    line.chars().take(DESCRIPTION_CHARS).collect()
}
