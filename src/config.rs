//! 应用配置：从 config/default.toml 与环境变量加载
//!
//! 加载顺序：先读 TOML 文件，再用环境变量 `APIARY__*` 覆盖（双下划线表示嵌套，如 `APIARY__LLM__PROVIDER=openai`）。

use std::collections::HashMap;
use std::path::PathBuf;

use serde::Deserialize;

use crate::extensions::PermissionLevel;

/// 应用配置根（对应 config/default.toml 的顶层）
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct AppConfig {
    pub app: AppSection,
    pub llm: LlmSection,
    pub agents: AgentsSection,
    pub tools: ToolsSection,
    pub scheduler: SchedulerSection,
    pub tasks: TasksSection,
    pub session: SessionSection,
    pub server: ServerSection,
}

/// [app] 段：数据目录与默认工作目录
#[derive(Debug, Clone, Deserialize)]
pub struct AppSection {
    /// 会话库、调度文件、Recipe 库的根目录
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,
    /// 新会话的工作目录，未设置时用进程当前目录
    pub working_dir: Option<PathBuf>,
}

fn default_data_dir() -> PathBuf {
    PathBuf::from(".apiary")
}

impl Default for AppSection {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
            working_dir: None,
        }
    }
}

impl AppSection {
    pub fn resolved_working_dir(&self) -> PathBuf {
        self.working_dir
            .clone()
            .or_else(|| std::env::current_dir().ok())
            .unwrap_or_else(|| PathBuf::from("."))
    }

    pub fn recipes_dir(&self) -> PathBuf {
        self.data_dir.join("recipes")
    }
}

/// [llm] 段：后端选择、超时与可重试错误的重试次数
#[derive(Debug, Clone, Deserialize)]
pub struct LlmSection {
    /// 后端：openai / deepseek / mock
    #[serde(default = "default_provider")]
    pub provider: String,
    #[serde(default = "default_model")]
    pub model: String,
    pub base_url: Option<String>,
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,
    /// 超时、限流、连接错误的最大重试次数
    #[serde(default = "default_llm_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_retry_backoff_ms")]
    pub retry_backoff_ms: u64,
}

fn default_provider() -> String {
    "openai".to_string()
}

fn default_model() -> String {
    "gpt-4o-mini".to_string()
}

fn default_request_timeout() -> u64 {
    60
}

fn default_llm_max_retries() -> u32 {
    2
}

fn default_retry_backoff_ms() -> u64 {
    500
}

impl Default for LlmSection {
    fn default() -> Self {
        Self {
            provider: default_provider(),
            model: default_model(),
            base_url: None,
            request_timeout_secs: default_request_timeout(),
            max_retries: default_llm_max_retries(),
            retry_backoff_ms: default_retry_backoff_ms(),
        }
    }
}

/// [agents] 段：Agent 缓存与单轮步数上限
#[derive(Debug, Clone, Deserialize)]
pub struct AgentsSection {
    #[serde(default = "default_max_idle_secs")]
    pub max_idle_secs: u64,
    #[serde(default = "default_cleanup_interval_secs")]
    pub cleanup_interval_secs: u64,
    #[serde(default = "default_max_agents")]
    pub max_agents: usize,
    /// 单次回复内最大 LLM 步数，防止死循环
    #[serde(default = "default_max_turns")]
    pub max_turns: usize,
    /// 会话没有绑定 Recipe 时默认启用的扩展
    #[serde(default = "default_extensions")]
    pub default_extensions: Vec<String>,
}

fn default_max_idle_secs() -> u64 {
    3600
}

fn default_cleanup_interval_secs() -> u64 {
    300
}

fn default_max_agents() -> usize {
    100
}

fn default_max_turns() -> usize {
    20
}

fn default_extensions() -> Vec<String> {
    vec!["developer".to_string()]
}

impl Default for AgentsSection {
    fn default() -> Self {
        Self {
            max_idle_secs: default_max_idle_secs(),
            cleanup_interval_secs: default_cleanup_interval_secs(),
            max_agents: default_max_agents(),
            max_turns: default_max_turns(),
            default_extensions: default_extensions(),
        }
    }
}

/// [tools] 段：工具超时、确认等待、Shell 白名单、逐工具权限
#[derive(Debug, Clone, Deserialize)]
pub struct ToolsSection {
    /// 单次工具调用超时（秒）
    #[serde(default = "default_tool_timeout_secs")]
    pub tool_timeout_secs: u64,
    #[serde(default = "default_confirmation_timeout_secs")]
    pub confirmation_timeout_secs: u64,
    #[serde(default)]
    pub shell: ShellSection,
    /// 工具全名（如 developer__shell）到权限级别
    #[serde(default)]
    pub permissions: HashMap<String, PermissionLevel>,
}

fn default_tool_timeout_secs() -> u64 {
    30
}

fn default_confirmation_timeout_secs() -> u64 {
    300
}

impl Default for ToolsSection {
    fn default() -> Self {
        Self {
            tool_timeout_secs: default_tool_timeout_secs(),
            confirmation_timeout_secs: default_confirmation_timeout_secs(),
            shell: ShellSection::default(),
            permissions: HashMap::new(),
        }
    }
}

/// [tools.shell] 段：允许执行的命令名（仅首词，如 ls、grep、cargo）
#[derive(Debug, Clone, Deserialize)]
pub struct ShellSection {
    #[serde(default = "default_allowed_commands")]
    pub allowed_commands: Vec<String>,
}

fn default_allowed_commands() -> Vec<String> {
    vec![
        "ls".into(),
        "grep".into(),
        "cat".into(),
        "head".into(),
        "tail".into(),
        "wc".into(),
        "find".into(),
        "echo".into(),
        "git".into(),
        "cargo".into(),
        "rustc".into(),
    ]
}

impl Default for ShellSection {
    fn default() -> Self {
        Self {
            allowed_commands: default_allowed_commands(),
        }
    }
}

/// [scheduler] 段
#[derive(Debug, Clone, Deserialize)]
pub struct SchedulerSection {
    /// tick 间隔（秒）
    #[serde(default = "default_tick_secs")]
    pub tick_secs: u64,
    /// kill 后等待运行任务退出的时间（秒）
    #[serde(default = "default_kill_grace_secs")]
    pub kill_grace_secs: u64,
    /// 未设置时为 `<data_dir>/schedules.json`
    pub jobs_file: Option<PathBuf>,
}

fn default_tick_secs() -> u64 {
    15
}

fn default_kill_grace_secs() -> u64 {
    10
}

impl Default for SchedulerSection {
    fn default() -> Self {
        Self {
            tick_secs: default_tick_secs(),
            kill_grace_secs: default_kill_grace_secs(),
            jobs_file: None,
        }
    }
}

/// [tasks] 段：子任务扇出并发与单任务超时
#[derive(Debug, Clone, Deserialize)]
pub struct TasksSection {
    #[serde(default = "default_max_workers")]
    pub max_workers: usize,
    #[serde(default = "default_task_timeout_secs")]
    pub task_timeout_secs: u64,
}

fn default_max_workers() -> usize {
    10
}

fn default_task_timeout_secs() -> u64 {
    300
}

impl Default for TasksSection {
    fn default() -> Self {
        Self {
            max_workers: default_max_workers(),
            task_timeout_secs: default_task_timeout_secs(),
        }
    }
}

/// 会话存储后端
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum SessionBackend {
    #[default]
    Sqlite,
    Memory,
}

/// [session] 段
#[derive(Debug, Clone, Deserialize, Default)]
pub struct SessionSection {
    #[serde(default)]
    pub backend: SessionBackend,
    /// 未设置时为 `<data_dir>/sessions.db`
    pub db_path: Option<PathBuf>,
}

/// [server] 段（server feature）
#[derive(Debug, Clone, Deserialize)]
pub struct ServerSection {
    #[serde(default = "default_bind")]
    pub bind: String,
}

fn default_bind() -> String {
    "127.0.0.1:3000".to_string()
}

impl Default for ServerSection {
    fn default() -> Self {
        Self { bind: default_bind() }
    }
}

impl AppConfig {
    pub fn jobs_file(&self) -> PathBuf {
        self.scheduler
            .jobs_file
            .clone()
            .unwrap_or_else(|| self.app.data_dir.join("schedules.json"))
    }

    pub fn session_db_path(&self) -> PathBuf {
        self.session
            .db_path
            .clone()
            .unwrap_or_else(|| self.app.data_dir.join("sessions.db"))
    }
}

/// 从 config 目录加载配置，环境变量 APIARY__* 可覆盖
///
/// 1. 按顺序查找 config/default.toml、../config/default.toml、default.toml，找到则作为第一源
/// 2. 若传入 config_path 且文件存在，则追加该文件（可覆盖前面的键）
/// 3. 最后叠加环境变量 APIARY__*（双下划线表示嵌套键）
pub fn load_config(config_path: Option<PathBuf>) -> Result<AppConfig, config::ConfigError> {
    let mut builder = config::Config::builder();

    let default_names = ["config/default", "../config/default", "default"];
    for name in default_names {
        let path = format!("{}.toml", name);
        if std::path::Path::new(&path).exists() {
            builder = builder.add_source(config::File::with_name(name).required(false));
            break;
        }
    }

    if let Some(ref path) = config_path {
        if path.exists() {
            builder = builder.add_source(config::File::from(path.clone()).required(false));
        }
    }

    builder = builder.add_source(
        config::Environment::with_prefix("APIARY")
            .separator("__")
            .try_parsing(true),
    );

    let c = builder.build()?;
    c.try_deserialize()
}

/// 重新从磁盘与环境变量加载配置
pub fn reload_config() -> Result<AppConfig, config::ConfigError> {
    load_config(None)
}
