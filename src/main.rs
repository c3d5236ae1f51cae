//! apiary 命令行
//!
//! - `run <recipe>`：运行一个 Recipe 文件（或库中的名称）
//! - `chat <text>`：在新会话或 `--session` 指定的会话里发一条消息，过程事件实时打印
//! - `sessions`：列出会话
//! - `jobs`：管理调度任务
//! - `daemon`：运行调度循环与空闲清理，直到 Ctrl+C / SIGTERM
//! - `serve`：HTTP 服务（server feature）

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{bail, Context};
use apiary::agent::AgentEvent;
use apiary::config::load_config;
use apiary::core::{run_with_graceful_shutdown, ShutdownCoordinator, ShutdownManager};
use apiary::execution::{ExecutionMode, ExecutionRequest, ExecutionResult, RecipeSource};
use apiary::extensions::PermissionDecision;
use apiary::recipe::{load_recipe_file, scan_recipe};
use apiary::runtime::ApiaryRuntime;
use apiary::scheduler::{JobExecutionMode, ScheduledJob};
use apiary::session::new_session_id;
use clap::{Parser, Subcommand};
use tokio::sync::mpsc;

#[derive(Parser, Debug)]
#[command(name = "apiary", version, about = "Unified agent execution layer")]
struct Cli {
    /// 额外的配置文件（覆盖 config/default.toml）
    #[arg(long, global = true, env = "APIARY_CONFIG")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run a recipe file or a recipe from the library
    Run {
        recipe: PathBuf,
        /// Recipe parameter, repeatable: --param key=value
        #[arg(long = "param", value_parser = parse_param)]
        params: Vec<(String, String)>,
        /// Continue an existing session
        #[arg(long)]
        session: Option<String>,
        /// Run even if the security scan reports warnings
        #[arg(long)]
        yes: bool,
    },
    /// Send one message, printing progress as it happens
    Chat {
        text: String,
        #[arg(long)]
        session: Option<String>,
    },
    /// List sessions
    Sessions,
    /// Manage scheduled jobs
    Jobs {
        #[command(subcommand)]
        action: JobsAction,
    },
    /// Run the scheduler and idle cleanup until interrupted
    Daemon,
    /// Serve the HTTP API
    #[cfg(feature = "server")]
    Serve,
}

#[derive(Subcommand, Debug)]
enum JobsAction {
    List,
    Add {
        id: String,
        recipe: PathBuf,
        /// 5- or 6-field cron expression
        cron: String,
        #[arg(long = "param", value_parser = parse_param)]
        params: Vec<(String, String)>,
        #[arg(long)]
        foreground: bool,
    },
    Pause { id: String },
    Unpause { id: String },
    Remove { id: String },
}

fn parse_param(raw: &str) -> Result<(String, String), String> {
    match raw.split_once('=') {
        Some((k, v)) if !k.trim().is_empty() => Ok((k.trim().to_string(), v.to_string())),
        _ => Err(format!("expected key=value, got '{raw}'")),
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    apiary::observability::init();
    let cli = Cli::parse();
    let config = load_config(cli.config.clone()).context("Failed to load config")?;
    let runtime = Arc::new(ApiaryRuntime::from_config(config).context("Failed to assemble runtime")?);

    match cli.command {
        Command::Run {
            recipe,
            params,
            session,
            yes,
        } => {
            let params: HashMap<String, String> = params.into_iter().collect();
            let recipes_dir = runtime.config().app.recipes_dir();
            let (loaded, path) = load_recipe_file(&recipe, &params, Some(&recipes_dir))?;
            let warnings = scan_recipe(&loaded);
            for w in &warnings {
                eprintln!("warning: {}: {}", w.field, w.message);
            }
            if !warnings.is_empty() && !yes {
                bail!("recipe '{}' has security warnings; pass --yes to run it anyway", path.display());
            }
            let session_id = session.unwrap_or_else(new_session_id);
            let req = ExecutionRequest::new(
                session_id,
                RecipeSource::File { path, params },
                ExecutionMode::Interactive,
            );
            let result = runtime.execute(req).await?;
            print_result(&result);
            runtime.shutdown().await;
            if !result.is_success() {
                std::process::exit(1);
            }
        }
        Command::Chat { text, session } => {
            let session_id = match session {
                Some(id) => id,
                None => runtime.start_session(None).await?.id,
            };
            let (tx, mut rx) = mpsc::unbounded_channel();
            let rt = Arc::clone(&runtime);
            let sid = session_id.clone();
            let printer = tokio::spawn(async move {
                while let Some(ev) = rx.recv().await {
                    print_event(&ev);
                    // 命令行没有交互确认，直接拒绝
                    if let AgentEvent::ConfirmationRequired { request_id, .. } = &ev {
                        if let Err(e) = rt.confirm_tool_call(&sid, request_id, PermissionDecision::Deny).await {
                            tracing::warn!(error = %e, "failed to deny tool call");
                        }
                    }
                }
            });
            let result = runtime.reply_stream(&session_id, &text, tx).await;
            let _ = printer.await;
            print_result(&result?);
            runtime.shutdown().await;
        }
        Command::Sessions => {
            for s in runtime.list_sessions().await? {
                println!(
                    "{}  {:<9} {:<10} {:>4} msgs {:>7} tokens  {}",
                    s.id,
                    format!("{:?}", s.session_type).to_lowercase(),
                    format!("{:?}", s.status).to_lowercase(),
                    s.message_count,
                    s.total_tokens,
                    s.description
                );
            }
        }
        Command::Jobs { action } => run_jobs(&runtime, action)?,
        Command::Daemon => {
            let manager = Arc::new(ShutdownManager::new());
            run_with_manager(manager, runtime, std::future::pending::<()>()).await;
        }
        #[cfg(feature = "server")]
        Command::Serve => {
            let manager = Arc::new(ShutdownManager::new());
            let token = manager.token();
            let server = apiary::server::serve(Arc::clone(&runtime), token.clone());
            let app = async move {
                if let Err(e) = server.await {
                    tracing::error!(error = %e, "http server stopped");
                }
            };
            run_with_manager(manager, runtime, app).await;
        }
    }
    Ok(())
}

fn run_jobs(runtime: &ApiaryRuntime, action: JobsAction) -> anyhow::Result<()> {
    match action {
        JobsAction::List => {
            for job in runtime.list_jobs() {
                println!(
                    "{:<20} {:<16} {:<8} {:<7} last: {}",
                    job.id,
                    job.cron,
                    format!("{:?}", job.state()).to_lowercase(),
                    if job.paused { "paused" } else { "" },
                    job.last_status.as_deref().unwrap_or("-")
                );
            }
        }
        JobsAction::Add {
            id,
            recipe,
            cron,
            params,
            foreground,
        } => {
            let mode = if foreground {
                JobExecutionMode::Foreground
            } else {
                JobExecutionMode::Background
            };
            let job = ScheduledJob::new(id, recipe, cron)
                .with_params(params.into_iter().collect())
                .with_mode(mode);
            let job = runtime.create_job(job)?;
            println!("created job {}", job.id);
        }
        JobsAction::Pause { id } => runtime.pause_job(&id)?,
        JobsAction::Unpause { id } => runtime.unpause_job(&id)?,
        JobsAction::Remove { id } => runtime.delete_job(&id)?,
    }
    Ok(())
}

/// 后台循环 + 信号处理；结束时执行清理
async fn run_with_manager<F>(manager: Arc<ShutdownManager>, runtime: Arc<ApiaryRuntime>, app: F)
where
    F: std::future::Future<Output = ()>,
{
    let handles = runtime.spawn_background(&manager.token());
    let mut coordinator = ShutdownCoordinator::new(manager)
        .with_timeout(runtime.config().scheduler.kill_grace_secs + 5);
    coordinator.register(runtime);
    tracing::info!("apiary running, press Ctrl+C to stop");
    run_with_graceful_shutdown(&coordinator, app).await;
    for handle in handles {
        let _ = handle.await;
    }
}

fn print_event(ev: &AgentEvent) {
    match ev {
        AgentEvent::ToolCall { tool, args, .. } => println!("→ {tool} {args}"),
        AgentEvent::ToolResult { tool, preview, .. } => println!("← {tool}: {preview}"),
        AgentEvent::ToolFailure { tool, reason, .. } => println!("✗ {tool}: {reason}"),
        AgentEvent::ConfirmationRequired { request_id, tool, .. } => {
            println!("? {tool} needs confirmation (request {request_id}), denied")
        }
        AgentEvent::Recovery { action, detail } => println!("… {action}: {detail}"),
        AgentEvent::Error { text } => eprintln!("error: {text}"),
        _ => {}
    }
}

fn print_result(result: &ExecutionResult) {
    if let Some(output) = &result.output {
        println!("{output}");
    }
    if let Some(error) = &result.error {
        eprintln!("failed after {} attempt(s): {error}", result.attempts);
    }
    println!(
        "session {} · {:?} · {} tokens",
        result.session_id,
        result.status,
        result.usage.total()
    );
}
