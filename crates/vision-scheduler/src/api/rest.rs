//! REST API implementation using axum

use super::form::read_form;
use crate::lifecycle::{parse_cpu_update, ProvisionRequest};
use crate::pipeline::{submit_task, CompleteTask};
use crate::scheduler::Scheduler;
use crate::worker_pool::WorkerSnapshot;
use axum::{
    extract::{ConnectInfo, DefaultBodyLimit, Multipart, State},
    http::StatusCode,
    response::{IntoResponse, Json, Response},
    routing::{get, post},
    Router,
};
use serde::Serialize;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tower_http::timeout::TimeoutLayer;
use tower_http::trace::TraceLayer;
use tracing::{error, info, warn};
use vision_scheduler_core::{ResourceUsage, SchedError, TaskType};

/// API state
#[derive(Clone)]
pub struct ApiState {
    pub scheduler: Arc<Scheduler>,
}

#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: String,
}

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub workers: usize,
    pub bound_tasks: usize,
    pub pending_completions: usize,
}

/// A [`SchedError`] on its way out as an HTTP response
#[derive(Debug)]
pub struct ApiError(pub SchedError);

impl From<SchedError> for ApiError {
    fn from(err: SchedError) -> Self {
        ApiError(err)
    }
}

/// HTTP status a scheduler error is reported with
pub fn status_for(err: &SchedError) -> StatusCode {
    match err {
        SchedError::UnknownTaskType(_)
        | SchedError::UnknownStatus(_)
        | SchedError::UnknownPlacement { .. }
        | SchedError::FormField { .. }
        | SchedError::MissingFile(_)
        | SchedError::InvalidLatency { .. }
        | SchedError::InvalidQuantity { .. }
        | SchedError::InvalidRequest(_) => StatusCode::BAD_REQUEST,
        SchedError::UnknownTaskId(_) => StatusCode::NOT_FOUND,
        SchedError::NoPendingCompletion(_) | SchedError::WorkerOccupied(_) => StatusCode::CONFLICT,
        SchedError::EmptyPool(_) => StatusCode::SERVICE_UNAVAILABLE,
        SchedError::Transport(_) | SchedError::Orchestrator(_) => StatusCode::BAD_GATEWAY,
        SchedError::ProvisionTimeout { .. }
        | SchedError::OccupyTimeout { .. }
        | SchedError::CompletionTimeout { .. } => StatusCode::GATEWAY_TIMEOUT,
        SchedError::CompletionDropped(_) | SchedError::Config(_) => {
            StatusCode::INTERNAL_SERVER_ERROR
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = status_for(&self.0);
        if status.is_server_error() {
            error!("Request failed: {}", self.0);
        } else {
            warn!("Request rejected: {}", self.0);
        }

        let body = ErrorResponse {
            error: self.0.to_string(),
        };
        (status, Json(body)).into_response()
    }
}

type ApiResult<T> = std::result::Result<T, ApiError>;

/// Create API router.
///
/// Callback, query and control routes run under the request timeout. Task
/// submissions wait for a free worker for as long as it takes, and
/// provisioning can legitimately take minutes, so both are mounted without it.
pub fn create_router(scheduler: Arc<Scheduler>) -> Router {
    let server = scheduler.config().server.clone();
    let frame_limit = server.max_form_bytes;
    let video_limit = server.max_video_form_bytes;

    let mut callbacks = Router::new();
    for task_type in TaskType::ALL {
        let limit = match task_type {
            TaskType::Det | TaskType::Fusion => frame_limit,
            TaskType::Slam | TaskType::Mcmot => video_limit,
        };
        callbacks = callbacks.route(
            &format!("/{}", task_type.finish_route()),
            post(move |State(state): State<ApiState>, multipart: Multipart| {
                finish(state, task_type, multipart)
            })
            .layer(DefaultBodyLimit::max(limit)),
        );
    }

    let bounded = callbacks
        .route("/worker_register", post(worker_register_handler))
        .route("/query_metric", post(query_metric_handler))
        .route("/restart", post(restart_handler))
        .route("/workers", get(list_workers_handler))
        .route("/health", get(health_handler))
        .layer(TimeoutLayer::new(Duration::from_secs(
            server.request_timeout_secs,
        )));

    let unbounded = Router::new()
        .route(
            "/new_task",
            post(new_task_handler).layer(DefaultBodyLimit::max(video_limit)),
        )
        .route(
            "/complete_task",
            post(complete_task_handler).layer(DefaultBodyLimit::max(frame_limit)),
        )
        .route("/update_cpu", post(update_cpu_handler))
        .route("/create_workers", post(create_workers_handler));

    bounded
        .merge(unbounded)
        .layer(TraceLayer::new_for_http())
        .with_state(ApiState { scheduler })
}

/// Single-stage task; answers with the task id
async fn new_task_handler(
    State(state): State<ApiState>,
    ConnectInfo(client): ConnectInfo<SocketAddr>,
    multipart: Multipart,
) -> ApiResult<String> {
    let form = read_form(multipart).await?;
    let task_id = submit_task(&state.scheduler, client.ip(), form).await?;
    Ok(task_id)
}

/// Detection + localization + fusion; answers `"<det id>:<fusion id>"` or `Failed`
async fn complete_task_handler(
    State(state): State<ApiState>,
    ConnectInfo(client): ConnectInfo<SocketAddr>,
    multipart: Multipart,
) -> ApiResult<String> {
    let form = read_form(multipart).await?;
    let outcome = CompleteTask::accept(&state.scheduler, client.ip(), form).await?;
    Ok(outcome.body())
}

async fn worker_register_handler(
    ConnectInfo(worker): ConnectInfo<SocketAddr>,
    body: String,
) -> ApiResult<&'static str> {
    let task_type: TaskType = body.trim().parse()?;
    info!("Worker at {} announced itself as {}", worker.ip(), task_type);
    Ok("OK")
}

async fn finish(state: ApiState, task_type: TaskType, multipart: Multipart) -> ApiResult<&'static str> {
    let form = read_form(multipart).await?;
    state.scheduler.deliver_completion(task_type, form)?;
    Ok("OK")
}

/// Resource usage of the pod serving a task id
async fn query_metric_handler(State(state): State<ApiState>, body: String) -> ApiResult<Json<ResourceUsage>> {
    let usage = state.scheduler.query_usage(body.trim()).await?;
    Ok(Json(usage))
}

/// `"<node name>:<millicpu>"`
async fn update_cpu_handler(State(state): State<ApiState>, body: String) -> ApiResult<String> {
    let (node_name, millicpu) = parse_cpu_update(&body)?;
    info!("Updating CPU limit on {} to {}m", node_name, millicpu);

    let pods = state.scheduler.pods();
    let updated = tokio::spawn(async move { pods.update_node_cpu(&node_name, millicpu).await })
        .await
        .map_err(|e| SchedError::Orchestrator(format!("CPU update aborted: {}", e)))??;

    Ok(format!("Updated {} workers", updated))
}

/// Provision workers; answers with the names of the created workers
async fn create_workers_handler(
    State(state): State<ApiState>,
    Json(request): Json<ProvisionRequest>,
) -> ApiResult<Json<Vec<String>>> {
    let pods = state.scheduler.pods();
    let workers = tokio::spawn(async move { pods.provision(&request).await })
        .await
        .map_err(|e| SchedError::Orchestrator(format!("provisioning aborted: {}", e)))??;

    let names = workers.iter().map(|w| w.name().to_string()).collect();
    Ok(Json(names))
}

async fn restart_handler(State(state): State<ApiState>) -> &'static str {
    state.scheduler.shutdown();
    "OK"
}

async fn list_workers_handler(State(state): State<ApiState>) -> Json<Vec<WorkerSnapshot>> {
    Json(state.scheduler.pool().snapshot())
}

/// Health check handler
async fn health_handler(State(state): State<ApiState>) -> Json<HealthResponse> {
    let pool = state.scheduler.pool();
    Json(HealthResponse {
        status: "healthy".to_string(),
        workers: pool.snapshot().len(),
        bound_tasks: pool.bound_task_count(),
        pending_completions: state.scheduler.notifier().pending_count(),
    })
}
