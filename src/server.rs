//! HTTP 接口（server feature）
//!
//! 所有路由都只调用 [`ApiaryRuntime`]；错误按 `ErrorKind` 映射状态码。
//! 流式回复走 SSE：`agent` 事件为过程事件，最后一条 `done` 携带 ExecutionResult。

use std::collections::HashMap;
use std::convert::Infallible;
use std::path::PathBuf;
use std::sync::Arc;

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::{
        sse::{Event, KeepAlive, Sse},
        IntoResponse, Response,
    },
    routing::{delete, get, post, put},
    Json, Router,
};
use futures_util::stream::{self, Stream};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::core::ErrorKind;
use crate::execution::ExecutionRequest;
use crate::extensions::{PermissionDecision, ToolSelection};
use crate::recipe::{Recipe, SubRecipe};
use crate::runtime::{ApiaryRuntime, RuntimeError};
use crate::scheduler::ScheduledJob;
use crate::tasks::{DispatchMode, Task};

type AppState = Arc<ApiaryRuntime>;

pub struct ApiError(RuntimeError);

impl<E: Into<RuntimeError>> From<E> for ApiError {
    fn from(e: E) -> Self {
        ApiError(e.into())
    }
}

fn status_for(kind: ErrorKind) -> StatusCode {
    match kind {
        ErrorKind::Resolution | ErrorKind::Validation => StatusCode::BAD_REQUEST,
        ErrorKind::NotFound => StatusCode::NOT_FOUND,
        ErrorKind::Conflict | ErrorKind::Cancelled => StatusCode::CONFLICT,
        ErrorKind::Precondition => StatusCode::PRECONDITION_FAILED,
        ErrorKind::Transient | ErrorKind::Internal => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let kind = self.0.kind();
        let status = status_for(kind);
        if status.is_server_error() {
            tracing::error!(error = %self.0, kind = kind.as_str(), "request failed");
        }
        let body = serde_json::json!({ "error": self.0.to_string(), "kind": kind.as_str() });
        (status, Json(body)).into_response()
    }
}

type ApiResult<T> = Result<Json<T>, ApiError>;

#[derive(Debug, Deserialize, Default)]
struct StartSessionBody {
    working_dir: Option<PathBuf>,
}

#[derive(Debug, Deserialize)]
struct TextBody {
    text: String,
}

#[derive(Debug, Deserialize)]
struct DescriptionBody {
    description: String,
}

#[derive(Debug, Deserialize)]
struct ProviderBody {
    provider: Option<String>,
    model: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ConfirmBody {
    request_id: String,
    decision: PermissionDecision,
}

#[derive(Debug, Deserialize)]
struct DispatchBody {
    tasks: Vec<Task>,
    #[serde(default)]
    mode: DispatchMode,
}

#[derive(Debug, Deserialize)]
struct LinkBody {
    link: String,
}

#[derive(Debug, Serialize)]
struct LinkResponse {
    link: String,
}

#[derive(Debug, Deserialize)]
struct CronBody {
    cron: String,
}

#[derive(Debug, Deserialize)]
struct LimitQuery {
    #[serde(default = "default_limit")]
    limit: usize,
}

fn default_limit() -> usize {
    20
}

#[derive(Debug, Serialize)]
struct Ack {
    ok: bool,
}

const ACK: Ack = Ack { ok: true };

pub fn router(runtime: Arc<ApiaryRuntime>) -> Router {
    Router::new()
        .route("/sessions", get(list_sessions).post(start_session))
        .route("/sessions/:id", get(get_session).delete(delete_session))
        .route("/sessions/:id/resume", post(resume_session))
        .route("/sessions/:id/description", put(update_description))
        .route("/sessions/:id/reply", post(reply))
        .route("/sessions/:id/reply/stream", post(reply_stream))
        .route("/sessions/:id/tools", get(list_tools))
        .route("/sessions/:id/prompt", post(extend_prompt))
        .route("/sessions/:id/sub_recipes", post(add_sub_recipes))
        .route("/sessions/:id/provider", put(update_provider))
        .route("/sessions/:id/tool_selection", put(set_tool_selection))
        .route("/sessions/:id/extensions/:name", delete(disable_extension))
        .route("/sessions/:id/confirm", post(confirm_tool_call))
        .route("/sessions/:id/recipe", post(create_recipe))
        .route("/sessions/:id/tasks", post(dispatch_tasks))
        .route("/execute", post(execute))
        .route("/insights", get(insights))
        .route("/metrics", get(metrics))
        .route("/recipes", get(list_recipes).post(save_recipe))
        .route("/recipes/:id", delete(delete_recipe))
        .route("/recipes/encode", post(encode_recipe))
        .route("/recipes/decode", post(decode_recipe))
        .route("/recipes/scan", post(scan_recipe))
        .route("/schedules", get(list_jobs).post(create_job))
        .route("/schedules/:id", put(update_job).delete(delete_job))
        .route("/schedules/:id/pause", post(pause_job))
        .route("/schedules/:id/unpause", post(unpause_job))
        .route("/schedules/:id/run_now", post(run_job_now))
        .route("/schedules/:id/kill", post(kill_job))
        .route("/schedules/:id/inspect", get(inspect_job))
        .route("/schedules/:id/sessions", get(job_sessions))
        .with_state(runtime)
}

/// 监听 `[server] bind`，直到 shutdown 取消
pub async fn serve(
    runtime: Arc<ApiaryRuntime>,
    shutdown: tokio_util::sync::CancellationToken,
) -> anyhow::Result<()> {
    let bind = runtime.config().server.bind.clone();
    let listener = tokio::net::TcpListener::bind(&bind).await?;
    tracing::info!(bind = %bind, "http server listening");
    axum::serve(listener, router(runtime))
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await?;
    Ok(())
}

async fn start_session(
    State(rt): State<AppState>,
    body: Option<Json<StartSessionBody>>,
) -> ApiResult<crate::session::Session> {
    let body = body.map(|Json(b)| b).unwrap_or_default();
    Ok(Json(rt.start_session(body.working_dir).await?))
}

async fn list_sessions(State(rt): State<AppState>) -> ApiResult<Vec<crate::session::SessionSummary>> {
    Ok(Json(rt.list_sessions().await?))
}

async fn get_session(State(rt): State<AppState>, Path(id): Path<String>) -> ApiResult<crate::session::Session> {
    Ok(Json(rt.get_session(&id).await?))
}

async fn resume_session(
    State(rt): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<crate::session::Session> {
    Ok(Json(rt.resume_session(&id).await?))
}

async fn delete_session(State(rt): State<AppState>, Path(id): Path<String>) -> ApiResult<Ack> {
    rt.delete_session(&id).await?;
    Ok(Json(ACK))
}

async fn update_description(
    State(rt): State<AppState>,
    Path(id): Path<String>,
    Json(body): Json<DescriptionBody>,
) -> ApiResult<Ack> {
    rt.update_session_description(&id, &body.description).await?;
    Ok(Json(ACK))
}

async fn insights(State(rt): State<AppState>) -> ApiResult<crate::session::SessionInsights> {
    Ok(Json(rt.insights().await?))
}

async fn metrics(State(rt): State<AppState>) -> Json<crate::agent::AgentManagerMetrics> {
    Json(rt.agent_metrics().await)
}

async fn reply(
    State(rt): State<AppState>,
    Path(id): Path<String>,
    Json(body): Json<TextBody>,
) -> ApiResult<crate::execution::ExecutionResult> {
    Ok(Json(rt.reply(&id, &body.text).await?))
}

fn json_event(name: &str, value: &impl Serialize) -> Event {
    match Event::default().event(name).json_data(value) {
        Ok(ev) => ev,
        Err(e) => Event::default().event("error").data(e.to_string()),
    }
}

async fn reply_stream(
    State(rt): State<AppState>,
    Path(id): Path<String>,
    Json(body): Json<TextBody>,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    let (out_tx, out_rx) = mpsc::unbounded_channel::<Event>();
    tokio::spawn(async move {
        let (ev_tx, mut ev_rx) = mpsc::unbounded_channel();
        let run = rt.reply_stream(&id, &body.text, ev_tx);
        tokio::pin!(run);
        let result = loop {
            tokio::select! {
                Some(ev) = ev_rx.recv() => {
                    let _ = out_tx.send(json_event("agent", &ev));
                }
                res = &mut run => break res,
            }
        };
        while let Ok(ev) = ev_rx.try_recv() {
            let _ = out_tx.send(json_event("agent", &ev));
        }
        let last = match result {
            Ok(result) => json_event("done", &result),
            Err(e) => json_event("error", &serde_json::json!({ "error": e.to_string(), "kind": e.kind().as_str() })),
        };
        let _ = out_tx.send(last);
    });

    let stream = stream::unfold(out_rx, |mut rx| async move {
        rx.recv().await.map(|ev| (Ok::<_, Infallible>(ev), rx))
    });
    Sse::new(stream).keep_alive(KeepAlive::default())
}

async fn execute(
    State(rt): State<AppState>,
    Json(req): Json<ExecutionRequest>,
) -> ApiResult<crate::execution::ExecutionResult> {
    Ok(Json(rt.execute(req).await?))
}

async fn list_tools(
    State(rt): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<Vec<crate::agent::ToolDescriptor>> {
    Ok(Json(rt.list_tools(&id).await?))
}

async fn extend_prompt(
    State(rt): State<AppState>,
    Path(id): Path<String>,
    Json(body): Json<TextBody>,
) -> ApiResult<Ack> {
    rt.extend_system_prompt(&id, &body.text).await?;
    Ok(Json(ACK))
}

async fn add_sub_recipes(
    State(rt): State<AppState>,
    Path(id): Path<String>,
    Json(subs): Json<Vec<SubRecipe>>,
) -> ApiResult<Ack> {
    rt.add_sub_recipes(&id, subs).await?;
    Ok(Json(ACK))
}

async fn update_provider(
    State(rt): State<AppState>,
    Path(id): Path<String>,
    Json(body): Json<ProviderBody>,
) -> ApiResult<Ack> {
    rt.update_provider(&id, body.provider.as_deref(), body.model.as_deref())
        .await?;
    Ok(Json(ACK))
}

async fn set_tool_selection(
    State(rt): State<AppState>,
    Path(id): Path<String>,
    Json(selection): Json<ToolSelection>,
) -> ApiResult<Ack> {
    rt.set_tool_selection(&id, selection).await?;
    Ok(Json(ACK))
}

async fn disable_extension(
    State(rt): State<AppState>,
    Path((id, name)): Path<(String, String)>,
) -> ApiResult<Ack> {
    rt.disable_extension(&id, &name).await?;
    Ok(Json(ACK))
}

async fn confirm_tool_call(
    State(rt): State<AppState>,
    Path(id): Path<String>,
    Json(body): Json<ConfirmBody>,
) -> ApiResult<Ack> {
    rt.confirm_tool_call(&id, &body.request_id, body.decision).await?;
    Ok(Json(ACK))
}

async fn create_recipe(State(rt): State<AppState>, Path(id): Path<String>) -> ApiResult<Recipe> {
    Ok(Json(rt.create_recipe(&id).await?))
}

async fn dispatch_tasks(
    State(rt): State<AppState>,
    Path(id): Path<String>,
    Json(body): Json<DispatchBody>,
) -> ApiResult<Vec<crate::tasks::TaskResult>> {
    Ok(Json(rt.dispatch_tasks(&id, body.tasks, body.mode).await?))
}

async fn list_recipes(State(rt): State<AppState>) -> Json<Vec<crate::recipe::RecipeManifest>> {
    Json(rt.list_recipes())
}

async fn save_recipe(State(rt): State<AppState>, Json(recipe): Json<Recipe>) -> ApiResult<HashMap<String, String>> {
    let id = rt.save_recipe(&recipe)?;
    Ok(Json(HashMap::from([("id".to_string(), id)])))
}

async fn delete_recipe(State(rt): State<AppState>, Path(id): Path<String>) -> ApiResult<Ack> {
    rt.delete_recipe(&id)?;
    Ok(Json(ACK))
}

async fn encode_recipe(State(rt): State<AppState>, Json(recipe): Json<Recipe>) -> ApiResult<LinkResponse> {
    Ok(Json(LinkResponse {
        link: rt.encode_recipe(&recipe)?,
    }))
}

async fn decode_recipe(State(rt): State<AppState>, Json(body): Json<LinkBody>) -> ApiResult<Recipe> {
    Ok(Json(rt.decode_recipe(&body.link)?))
}

async fn scan_recipe(
    State(rt): State<AppState>,
    Json(recipe): Json<Recipe>,
) -> Json<Vec<crate::recipe::SecurityWarning>> {
    Json(rt.scan_recipe(&recipe))
}

async fn list_jobs(State(rt): State<AppState>) -> Json<Vec<ScheduledJob>> {
    Json(rt.list_jobs())
}

async fn create_job(State(rt): State<AppState>, Json(job): Json<ScheduledJob>) -> ApiResult<ScheduledJob> {
    Ok(Json(rt.create_job(job)?))
}

async fn update_job(
    State(rt): State<AppState>,
    Path(id): Path<String>,
    Json(body): Json<CronBody>,
) -> ApiResult<ScheduledJob> {
    Ok(Json(rt.update_job(&id, &body.cron)?))
}

async fn delete_job(State(rt): State<AppState>, Path(id): Path<String>) -> ApiResult<Ack> {
    rt.delete_job(&id)?;
    Ok(Json(ACK))
}

async fn pause_job(State(rt): State<AppState>, Path(id): Path<String>) -> ApiResult<Ack> {
    rt.pause_job(&id)?;
    Ok(Json(ACK))
}

async fn unpause_job(State(rt): State<AppState>, Path(id): Path<String>) -> ApiResult<Ack> {
    rt.unpause_job(&id)?;
    Ok(Json(ACK))
}

async fn run_job_now(State(rt): State<AppState>, Path(id): Path<String>) -> ApiResult<HashMap<String, String>> {
    let session_id = rt.run_job_now(&id)?;
    Ok(Json(HashMap::from([("session_id".to_string(), session_id)])))
}

async fn kill_job(State(rt): State<AppState>, Path(id): Path<String>) -> ApiResult<Ack> {
    rt.kill_job(&id).await?;
    Ok(Json(ACK))
}

async fn inspect_job(
    State(rt): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<crate::scheduler::RunningJobInfo> {
    Ok(Json(rt.inspect_job(&id)?))
}

async fn job_sessions(
    State(rt): State<AppState>,
    Path(id): Path<String>,
    Query(q): Query<LimitQuery>,
) -> ApiResult<Vec<crate::session::SessionSummary>> {
    Ok(Json(rt.job_sessions(&id, q.limit).await?))
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::{to_bytes, Body};
    use axum::http::Request;
    use tower::ServiceExt;

    use crate::config::{AppConfig, SessionBackend};
    use crate::llm::{LlmClient, MockLlmClient, ProviderRegistry};

    fn app(dir: &std::path::Path) -> Router {
        let mut cfg = AppConfig::default();
        cfg.app.data_dir = dir.join("data");
        cfg.app.working_dir = Some(dir.to_path_buf());
        cfg.session.backend = SessionBackend::Memory;
        cfg.llm.provider = "mock".into();
        let mut providers = ProviderRegistry::with_defaults();
        providers.register("mock", |_| {
            let client: Arc<dyn LlmClient> = Arc::new(MockLlmClient::default());
            Ok(client)
        });
        let rt = ApiaryRuntime::builder(cfg).with_providers(providers).build().unwrap();
        router(Arc::new(rt))
    }

    #[tokio::test]
    async fn test_unknown_session_is_404_with_kind() {
        let dir = tempfile::tempdir().unwrap();
        let resp = app(dir.path())
            .oneshot(Request::get("/sessions/nope").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
        let body = to_bytes(resp.into_body(), usize::MAX).await.unwrap();
        let json: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(json["kind"], "not_found");
    }

    #[tokio::test]
    async fn test_empty_schedule_list() {
        let dir = tempfile::tempdir().unwrap();
        let resp = app(dir.path())
            .oneshot(Request::get("/schedules").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let body = to_bytes(resp.into_body(), usize::MAX).await.unwrap();
        assert_eq!(&body[..], b"[]");
    }

    #[test]
    fn test_status_mapping() {
        assert_eq!(status_for(ErrorKind::Resolution), StatusCode::BAD_REQUEST);
        assert_eq!(status_for(ErrorKind::NotFound), StatusCode::NOT_FOUND);
        assert_eq!(status_for(ErrorKind::Conflict), StatusCode::CONFLICT);
        assert_eq!(status_for(ErrorKind::Precondition), StatusCode::PRECONDITION_FAILED);
        assert_eq!(status_for(ErrorKind::Internal), StatusCode::INTERNAL_SERVER_ERROR);
    }
}
