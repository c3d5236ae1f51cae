//! 运行时门面
//!
//! 从 AppConfig 组装会话库、Agent 管理器、统一执行器、扇出与调度器，对外提供会话、Agent 控制、
//! Recipe、调度、子任务派发与工具确认的全部操作。CLI 与 HTTP 服务都只经过这一层。

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::agent::{Agent, AgentEvent, AgentManager, AgentManagerMetrics, DefaultAgentFactory, ToolDescriptor};
use crate::config::{AppConfig, SessionBackend};
use crate::core::{AgentError, ErrorKind, SessionSupervisor, ShutdownCleanup, WorkerPool};
use crate::execution::{ExecutionError, ExecutionRequest, ExecutionResult, UnifiedExecutor};
use crate::extensions::{ExtensionCatalog, ExtensionError, PermissionDecision, PermissionError, ToolSelection};
use crate::llm::{LlmError, ProviderRegistry};
use crate::recipe::{deeplink, scan_recipe, Recipe, RecipeError, RecipeLibrary, RecipeManifest, SecurityWarning, SubRecipe};
use crate::scheduler::{JobStore, RunningJobInfo, ScheduledJob, Scheduler, SchedulerError};
use crate::session::memory::MemorySessionStore;
use crate::session::sqlite::SqliteSessionStore;
use crate::session::{
    new_session_id, Session, SessionInsights, SessionSeed, SessionStore, SessionStoreError, SessionSummary,
    SessionType,
};
use crate::tasks::{DispatchMode, Task, TaskDispatcher, TaskError, TaskResult, TaskRunner};

/// 门面对外的统一错误；`kind()` 决定 HTTP 状态码与 CLI 退出信息
#[derive(Error, Debug)]
pub enum RuntimeError {
    #[error(transparent)]
    Execution(#[from] ExecutionError),

    #[error(transparent)]
    Agent(#[from] AgentError),

    #[error(transparent)]
    Session(#[from] SessionStoreError),

    #[error(transparent)]
    Recipe(#[from] RecipeError),

    #[error(transparent)]
    Scheduler(#[from] SchedulerError),

    #[error(transparent)]
    Task(#[from] TaskError),

    #[error(transparent)]
    Extension(#[from] ExtensionError),

    #[error(transparent)]
    Provider(#[from] LlmError),

    #[error(transparent)]
    Permission(#[from] PermissionError),
}

impl RuntimeError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            RuntimeError::Execution(e) => e.kind(),
            RuntimeError::Agent(e) => e.kind(),
            RuntimeError::Session(e) => e.kind(),
            RuntimeError::Recipe(e) => e.kind(),
            RuntimeError::Scheduler(e) => e.kind(),
            RuntimeError::Task(e) => e.kind(),
            RuntimeError::Extension(e) => e.kind(),
            RuntimeError::Provider(e) => e.kind(),
            RuntimeError::Permission(e) => e.kind(),
        }
    }
}

pub type RuntimeResult<T> = Result<T, RuntimeError>;

/// 组装选项；测试里用来换掉 provider 与会话库
pub struct RuntimeBuilder {
    config: AppConfig,
    providers: Option<ProviderRegistry>,
    extensions: Option<ExtensionCatalog>,
    sessions: Option<Arc<dyn SessionStore>>,
}

impl RuntimeBuilder {
    pub fn new(config: AppConfig) -> Self {
        Self {
            config,
            providers: None,
            extensions: None,
            sessions: None,
        }
    }

    pub fn with_providers(mut self, providers: ProviderRegistry) -> Self {
        self.providers = Some(providers);
        self
    }

    pub fn with_extensions(mut self, catalog: ExtensionCatalog) -> Self {
        self.extensions = Some(catalog);
        self
    }

    pub fn with_session_store(mut self, store: Arc<dyn SessionStore>) -> Self {
        self.sessions = Some(store);
        self
    }

    pub fn build(self) -> anyhow::Result<ApiaryRuntime> {
        let config = Arc::new(self.config);
        let sessions: Arc<dyn SessionStore> = match self.sessions {
            Some(store) => store,
            None => match config.session.backend {
                SessionBackend::Sqlite => Arc::new(SqliteSessionStore::open(&config.session_db_path())?),
                SessionBackend::Memory => Arc::new(MemorySessionStore::new()),
            },
        };
        let providers = Arc::new(self.providers.unwrap_or_else(ProviderRegistry::with_defaults));
        let catalog = Arc::new(self.extensions.unwrap_or_else(ExtensionCatalog::with_builtins));

        let factory = DefaultAgentFactory::new(Arc::clone(&config), providers, catalog);
        let agents = Arc::new(AgentManager::new(
            Arc::new(factory),
            Arc::clone(&sessions),
            Duration::from_secs(config.agents.max_idle_secs),
            config.agents.max_agents,
        ));
        let supervisor = Arc::new(SessionSupervisor::default());
        let executor = Arc::new(UnifiedExecutor::new(
            agents,
            Arc::clone(&sessions),
            supervisor,
            config.app.resolved_working_dir(),
            config.app.recipes_dir(),
        ));

        let dispatcher = Arc::new(TaskDispatcher::new(
            Arc::clone(&executor),
            WorkerPool::new(config.tasks.max_workers),
            Duration::from_secs(config.tasks.task_timeout_secs),
        ));
        let runner: Arc<dyn TaskRunner> = dispatcher.clone();
        executor.set_task_runner(&runner);

        let scheduler = Scheduler::open(
            Arc::clone(&executor),
            JobStore::new(config.jobs_file()),
            Duration::from_secs(config.scheduler.kill_grace_secs),
        )?;

        tracing::info!(
            data_dir = %config.app.data_dir.display(),
            backend = ?config.session.backend,
            jobs = scheduler.list().len(),
            "runtime assembled"
        );
        Ok(ApiaryRuntime {
            library: RecipeLibrary::new(config.app.recipes_dir()),
            config,
            executor,
            dispatcher,
            scheduler,
        })
    }
}

pub struct ApiaryRuntime {
    config: Arc<AppConfig>,
    executor: Arc<UnifiedExecutor>,
    dispatcher: Arc<TaskDispatcher>,
    scheduler: Arc<Scheduler>,
    library: RecipeLibrary,
}

impl ApiaryRuntime {
    pub fn builder(config: AppConfig) -> RuntimeBuilder {
        RuntimeBuilder::new(config)
    }

    pub fn from_config(config: AppConfig) -> anyhow::Result<Self> {
        RuntimeBuilder::new(config).build()
    }

    pub fn config(&self) -> &AppConfig {
        &self.config
    }

    pub fn executor(&self) -> &Arc<UnifiedExecutor> {
        &self.executor
    }

    pub fn scheduler(&self) -> &Arc<Scheduler> {
        &self.scheduler
    }

    fn sessions(&self) -> &Arc<dyn SessionStore> {
        self.executor.sessions()
    }

    fn agents(&self) -> &Arc<AgentManager> {
        self.executor.agents()
    }

    /// 已创建的 Agent；未初始化时为前置条件失败
    async fn live_agent(&self, session_id: &str) -> RuntimeResult<Arc<Agent>> {
        Ok(self.agents().get(session_id).await?)
    }

    // ---- 会话 ----

    /// 新建交互会话并创建其 Agent
    pub async fn start_session(&self, working_dir: Option<PathBuf>) -> RuntimeResult<Session> {
        let id = new_session_id();
        let dir = working_dir.unwrap_or_else(|| self.executor.default_working_dir().to_path_buf());
        let session = self
            .sessions()
            .get_or_create(&id, SessionSeed::new(dir, SessionType::User))
            .await?;
        self.agents().get_or_create(&id).await?;
        tracing::info!(session_id = %id, "session started");
        Ok(session)
    }

    /// 恢复已有会话：确保其 Agent 存在
    pub async fn resume_session(&self, session_id: &str) -> RuntimeResult<Session> {
        let session = self.sessions().get(session_id).await?;
        self.agents().get_or_create(session_id).await?;
        Ok(session)
    }

    pub async fn list_sessions(&self) -> RuntimeResult<Vec<SessionSummary>> {
        Ok(self.sessions().list().await?)
    }

    pub async fn get_session(&self, session_id: &str) -> RuntimeResult<Session> {
        Ok(self.sessions().get(session_id).await?)
    }

    /// 取消进行中的运行、释放 Agent、删除记录
    pub async fn delete_session(&self, session_id: &str) -> RuntimeResult<()> {
        self.sessions().get(session_id).await?;
        self.executor.supervisor().cancel(session_id);
        self.agents().evict(session_id).await;
        self.sessions().delete(session_id).await?;
        tracing::info!(session_id = %session_id, "session deleted");
        Ok(())
    }

    pub async fn update_session_description(&self, session_id: &str, description: &str) -> RuntimeResult<()> {
        Ok(self.sessions().update_description(session_id, description).await?)
    }

    pub async fn insights(&self) -> RuntimeResult<SessionInsights> {
        Ok(self.sessions().insights().await?)
    }

    /// 交互回复（缓冲）
    pub async fn reply(&self, session_id: &str, text: &str) -> RuntimeResult<ExecutionResult> {
        Ok(self
            .executor
            .execute(ExecutionRequest::interactive(session_id, text))
            .await?)
    }

    /// 交互回复，过程事件推给 `events`
    pub async fn reply_stream(
        &self,
        session_id: &str,
        text: &str,
        events: tokio::sync::mpsc::UnboundedSender<AgentEvent>,
    ) -> RuntimeResult<ExecutionResult> {
        Ok(self
            .executor
            .execute_stream(ExecutionRequest::interactive(session_id, text), events)
            .await?)
    }

    /// 任意归一化请求（Recipe 文件、内联 Recipe）
    pub async fn execute(&self, req: ExecutionRequest) -> RuntimeResult<ExecutionResult> {
        Ok(self.executor.execute(req).await?)
    }

    // ---- Agent 控制 ----

    pub async fn add_sub_recipes(&self, session_id: &str, subs: Vec<SubRecipe>) -> RuntimeResult<()> {
        self.live_agent(session_id).await?.add_sub_recipes(subs).await;
        Ok(())
    }

    pub async fn extend_system_prompt(&self, session_id: &str, text: &str) -> RuntimeResult<()> {
        self.live_agent(session_id).await?.extend_system_prompt(text).await;
        Ok(())
    }

    pub async fn list_tools(&self, session_id: &str) -> RuntimeResult<Vec<ToolDescriptor>> {
        Ok(self.live_agent(session_id).await?.list_tools(None).await)
    }

    pub async fn disable_extension(&self, session_id: &str, extension: &str) -> RuntimeResult<()> {
        Ok(self.live_agent(session_id).await?.disable_extension(extension).await?)
    }

    pub async fn update_provider(
        &self,
        session_id: &str,
        provider: Option<&str>,
        model: Option<&str>,
    ) -> RuntimeResult<()> {
        Ok(self
            .live_agent(session_id)
            .await?
            .update_provider(provider, model)
            .await?)
    }

    pub async fn set_tool_selection(&self, session_id: &str, selection: ToolSelection) -> RuntimeResult<()> {
        self.live_agent(session_id).await?.set_tool_selection(selection).await;
        Ok(())
    }

    /// 回复一个待确认的工具调用
    pub async fn confirm_tool_call(
        &self,
        session_id: &str,
        request_id: &str,
        decision: PermissionDecision,
    ) -> RuntimeResult<()> {
        Ok(self
            .live_agent(session_id)
            .await?
            .confirm_tool_call(request_id, decision)?)
    }

    pub async fn agent_metrics(&self) -> AgentManagerMetrics {
        self.agents().metrics().await
    }

    // ---- Recipe ----

    /// 由会话对话提炼 Recipe
    pub async fn create_recipe(&self, session_id: &str) -> RuntimeResult<Recipe> {
        let session = self.sessions().get(session_id).await?;
        let agent = self.live_agent(session_id).await?;
        Ok(agent.create_recipe(&session.messages).await?)
    }

    pub fn encode_recipe(&self, recipe: &Recipe) -> RuntimeResult<String> {
        Ok(deeplink::encode(recipe)?)
    }

    pub fn decode_recipe(&self, link: &str) -> RuntimeResult<Recipe> {
        Ok(deeplink::decode(link)?)
    }

    pub fn scan_recipe(&self, recipe: &Recipe) -> Vec<SecurityWarning> {
        scan_recipe(recipe)
    }

    pub fn save_recipe(&self, recipe: &Recipe) -> RuntimeResult<String> {
        Ok(self.library.save(recipe)?)
    }

    pub fn list_recipes(&self) -> Vec<RecipeManifest> {
        self.library.list()
    }

    pub fn load_recipe(&self, id: &str, params: &HashMap<String, String>) -> RuntimeResult<Recipe> {
        Ok(self.library.load(id, params)?)
    }

    pub fn delete_recipe(&self, id: &str) -> RuntimeResult<()> {
        Ok(self.library.delete(id)?)
    }

    // ---- 调度 ----

    pub fn create_job(&self, job: ScheduledJob) -> RuntimeResult<ScheduledJob> {
        Ok(self.scheduler.create(job)?)
    }

    pub fn update_job(&self, job_id: &str, cron: &str) -> RuntimeResult<ScheduledJob> {
        Ok(self.scheduler.update_cron(job_id, cron)?)
    }

    pub fn delete_job(&self, job_id: &str) -> RuntimeResult<()> {
        Ok(self.scheduler.delete(job_id)?)
    }

    pub fn list_jobs(&self) -> Vec<ScheduledJob> {
        self.scheduler.list()
    }

    pub fn pause_job(&self, job_id: &str) -> RuntimeResult<()> {
        Ok(self.scheduler.pause(job_id)?)
    }

    pub fn unpause_job(&self, job_id: &str) -> RuntimeResult<()> {
        Ok(self.scheduler.unpause(job_id)?)
    }

    /// 返回本次运行的会话 id
    pub fn run_job_now(&self, job_id: &str) -> RuntimeResult<String> {
        Ok(self.scheduler.run_now(job_id)?)
    }

    pub async fn kill_job(&self, job_id: &str) -> RuntimeResult<()> {
        Ok(self.scheduler.kill(job_id).await?)
    }

    pub fn inspect_job(&self, job_id: &str) -> RuntimeResult<RunningJobInfo> {
        Ok(self.scheduler.inspect(job_id)?)
    }

    pub async fn job_sessions(&self, job_id: &str, limit: usize) -> RuntimeResult<Vec<SessionSummary>> {
        Ok(self.scheduler.sessions_for_job(job_id, limit).await?)
    }

    // ---- 扇出 ----

    /// 派发子任务，结果作为一轮写回父会话
    pub async fn dispatch_tasks(
        &self,
        parent_session_id: &str,
        tasks: Vec<Task>,
        mode: DispatchMode,
    ) -> RuntimeResult<Vec<TaskResult>> {
        Ok(self
            .dispatcher
            .dispatch_for_parent(parent_session_id, tasks, mode)
            .await?)
    }

    // ---- 后台循环与关闭 ----

    /// 启动调度 tick 与 Agent 空闲清理；`shutdown` 取消后两者退出
    pub fn spawn_background(&self, shutdown: &CancellationToken) -> Vec<JoinHandle<()>> {
        vec![
            self.scheduler.spawn_tick_loop(
                Duration::from_secs(self.config.scheduler.tick_secs),
                shutdown.clone(),
            ),
            self.agents().spawn_cleanup_loop(
                Duration::from_secs(self.config.agents.cleanup_interval_secs),
                shutdown.clone(),
            ),
        ]
    }

    /// kill 运行中的任务、取消所有会话运行、释放全部 Agent
    pub async fn shutdown(&self) {
        self.scheduler.kill_all().await;
        self.executor.supervisor().cancel_all();
        let evicted = self.agents().evict_all().await;
        tracing::info!(evicted, "runtime shut down");
    }
}

#[async_trait::async_trait]
impl ShutdownCleanup for ApiaryRuntime {
    async fn cleanup(&self) -> anyhow::Result<()> {
        self.shutdown().await;
        Ok(())
    }

    fn name(&self) -> &'static str {
        "runtime"
    }
}
