use axum::extract::{Request, State};
use axum::http::StatusCode;
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use axum::routing::post;
use axum::{Json, Router};
use base64::Engine;
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::error::{AgentError, AgentResult};
use crate::orchestrator::types::{CreateKernelConfig, ExecuteRequest};
use crate::orchestrator::Orchestrator;

/// Body-peeking middleware that extends a kernel's idle deadline on every
/// RPC call that names one, mirroring the host crate's practice of
/// extending a session's lifetime from an `axum` middleware layer rather
/// than threading a touch call through each handler. Most handlers touch
/// the registry again internally; that's a harmless double-touch, not a
/// bug — the middleware exists so a kernel's clock keeps ticking even if a
/// future handler forgets to call `touch` itself.
pub async fn last_used_touch(
    State(orchestrator): State<Orchestrator>,
    req: Request,
    next: Next,
) -> Response {
    let (parts, body) = req.into_parts();
    let bytes = match axum::body::to_bytes(body, 16 * 1024 * 1024).await {
        Ok(b) => b,
        Err(_) => return StatusCode::BAD_REQUEST.into_response(),
    };

    if let Ok(value) = serde_json::from_slice::<serde_json::Value>(&bytes) {
        if let Some(kernel_id) = value.get("kernel_id").and_then(|v| v.as_str()) {
            orchestrator.registry().touch(kernel_id).await;
        }
    }

    let req = Request::from_parts(parts, axum::body::Body::from(bytes));
    next.run(req).await
}

pub fn build_router(orchestrator: Orchestrator) -> Router {
    let touched = Router::new()
        .route("/rpc/ping_kernel", post(ping_kernel))
        .route("/rpc/create_kernel", post(create_kernel))
        .route("/rpc/destroy_kernel", post(destroy_kernel))
        .route("/rpc/restart_kernel", post(restart_kernel))
        .route("/rpc/interrupt_kernel", post(interrupt_kernel))
        .route("/rpc/get_completions", post(get_completions))
        .route("/rpc/get_logs", post(get_logs))
        .route("/rpc/execute", post(execute))
        .route("/rpc/start_service", post(start_service))
        .route("/rpc/upload_file", post(upload_file))
        .route("/rpc/download_file", post(download_file))
        .route("/rpc/list_files", post(list_files))
        .route("/rpc/reset", post(reset))
        .layer(axum::middleware::from_fn_with_state(
            orchestrator.clone(),
            last_used_touch,
        ));

    Router::new()
        .route("/rpc/ping", post(ping))
        .merge(touched)
        .with_state(orchestrator)
}

async fn ping(State(_orchestrator): State<Orchestrator>) -> Json<serde_json::Value> {
    Json(serde_json::json!({ "status": "ok" }))
}

#[derive(Debug, Deserialize)]
struct KernelIdOnly {
    kernel_id: String,
}

async fn ping_kernel(
    State(orchestrator): State<Orchestrator>,
    Json(req): Json<KernelIdOnly>,
) -> AgentResult<Json<serde_json::Value>> {
    orchestrator.ping_kernel(&req.kernel_id).await?;
    Ok(Json(serde_json::json!({ "status": "ok" })))
}

#[derive(Debug, Deserialize)]
struct CreateKernelRequest {
    kernel_id: String,
    #[serde(flatten)]
    config: CreateKernelConfig,
}

async fn create_kernel(
    State(orchestrator): State<Orchestrator>,
    Json(req): Json<CreateKernelRequest>,
) -> AgentResult<Json<serde_json::Value>> {
    let response = orchestrator.create_kernel(req.kernel_id, req.config).await?;
    Ok(Json(serde_json::to_value(response).map_err(|e| AgentError::Other(e.into()))?))
}

async fn destroy_kernel(
    State(orchestrator): State<Orchestrator>,
    Json(req): Json<KernelIdOnly>,
) -> AgentResult<Json<serde_json::Value>> {
    let stats = orchestrator.destroy_kernel(&req.kernel_id).await?;
    Ok(Json(serde_json::json!({ "stats": stats })))
}

#[derive(Debug, Deserialize)]
struct RestartKernelRequest {
    kernel_id: String,
    #[serde(flatten)]
    config: CreateKernelConfig,
}

async fn restart_kernel(
    State(orchestrator): State<Orchestrator>,
    Json(req): Json<RestartKernelRequest>,
) -> AgentResult<Json<serde_json::Value>> {
    let response = orchestrator
        .restart_kernel(&req.kernel_id, req.config)
        .await?;
    Ok(Json(serde_json::to_value(response).map_err(|e| AgentError::Other(e.into()))?))
}

async fn interrupt_kernel(
    State(orchestrator): State<Orchestrator>,
    Json(req): Json<KernelIdOnly>,
) -> AgentResult<StatusCode> {
    orchestrator.interrupt_kernel(&req.kernel_id).await?;
    Ok(StatusCode::NO_CONTENT)
}

#[derive(Debug, Deserialize)]
struct GetCompletionsRequest {
    kernel_id: String,
    text: String,
    #[serde(default)]
    opts: serde_json::Value,
}

async fn get_completions(
    State(orchestrator): State<Orchestrator>,
    Json(req): Json<GetCompletionsRequest>,
) -> AgentResult<Json<Vec<String>>> {
    let completions = orchestrator
        .get_completions(&req.kernel_id, req.text, req.opts)
        .await?;
    Ok(Json(completions))
}

async fn get_logs(
    State(orchestrator): State<Orchestrator>,
    Json(req): Json<KernelIdOnly>,
) -> AgentResult<Json<serde_json::Value>> {
    let logs = orchestrator.get_logs(&req.kernel_id).await?;
    Ok(Json(serde_json::json!({ "logs": logs })))
}

#[derive(Debug, Deserialize)]
struct ExecuteKernelRequest {
    kernel_id: String,
    #[serde(flatten)]
    req: ExecuteRequest,
}

async fn execute(
    State(orchestrator): State<Orchestrator>,
    Json(req): Json<ExecuteKernelRequest>,
) -> AgentResult<Json<serde_json::Value>> {
    let response = orchestrator.execute(&req.kernel_id, req.req).await?;
    Ok(Json(serde_json::to_value(response).map_err(|e| AgentError::Other(e.into()))?))
}

#[derive(Debug, Deserialize)]
struct StartServiceRequest {
    kernel_id: String,
    service: String,
    port: u16,
    protocol: String,
    #[serde(default)]
    options: serde_json::Value,
}

async fn start_service(
    State(orchestrator): State<Orchestrator>,
    Json(req): Json<StartServiceRequest>,
) -> AgentResult<Json<serde_json::Value>> {
    let result = orchestrator
        .start_service(&req.kernel_id, req.service, req.port, req.protocol, req.options)
        .await?;
    Ok(Json(serde_json::to_value(result).map_err(|e| AgentError::Other(e.into()))?))
}

#[derive(Debug, Deserialize)]
struct UploadFileRequest {
    kernel_id: String,
    filename: String,
    data_base64: String,
}

async fn upload_file(
    State(orchestrator): State<Orchestrator>,
    Json(req): Json<UploadFileRequest>,
) -> AgentResult<StatusCode> {
    let data = base64::engine::general_purpose::STANDARD
        .decode(req.data_base64)
        .map_err(|e| AgentError::Other(anyhow::anyhow!("invalid base64 upload payload: {e}")))?;
    orchestrator
        .upload_file(&req.kernel_id, &req.filename, data)
        .await?;
    Ok(StatusCode::NO_CONTENT)
}

#[derive(Debug, Deserialize)]
struct DownloadFileRequest {
    kernel_id: String,
    filepath: String,
}

#[derive(Debug, Serialize)]
struct DownloadFileResponse {
    data_base64: String,
}

async fn download_file(
    State(orchestrator): State<Orchestrator>,
    Json(req): Json<DownloadFileRequest>,
) -> AgentResult<Json<DownloadFileResponse>> {
    let data = orchestrator
        .download_file(&req.kernel_id, &req.filepath)
        .await?;
    Ok(Json(DownloadFileResponse {
        data_base64: base64::engine::general_purpose::STANDARD.encode(data),
    }))
}

#[derive(Debug, Deserialize)]
struct ListFilesRequest {
    kernel_id: String,
    path: String,
}

async fn list_files(
    State(orchestrator): State<Orchestrator>,
    Json(req): Json<ListFilesRequest>,
) -> AgentResult<Json<serde_json::Value>> {
    let listing = orchestrator.list_files(&req.kernel_id, &req.path).await?;
    Ok(Json(serde_json::to_value(listing).map_err(|e| AgentError::Other(e.into()))?))
}

async fn reset(State(orchestrator): State<Orchestrator>) -> Json<serde_json::Value> {
    orchestrator.reset().await;
    warn!("agent reset requested — all kernels destroyed");
    Json(serde_json::json!({ "status": "ok" }))
}
