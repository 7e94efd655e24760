//! REST API handlers

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::Json,
    routing::{get, post},
    Router,
};
use chrono::{DateTime, Utc};
use gpulet_core::{DeviceSlot, ScriptType, SubmitRequest, Task, TaskStatus};
use gpulet_scheduler::{Scheduler, SystemStatus};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tower_http::trace::TraceLayer;
use tracing::info;
use uuid::Uuid;

/// Application state shared across handlers
pub struct AppState {
    pub scheduler: Arc<Scheduler>,
}

/// Create the API router
pub fn create_router(scheduler: Arc<Scheduler>) -> Router {
    let state = Arc::new(AppState { scheduler });

    Router::new()
        .route("/api/v1/tasks", post(submit_task))
        .route("/api/v1/tasks", get(list_tasks))
        .route("/api/v1/tasks/:id", get(get_task))
        .route("/api/v1/tasks/:id/cancel", post(cancel_task))
        .route("/api/v1/gpus", get(get_gpus))
        .route("/api/v1/gpus/reconcile", post(reconcile_gpus))
        .route("/api/v1/status", get(get_status))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Request to submit a script
#[derive(Debug, Deserialize)]
pub struct SubmitTaskRequest {
    /// Path to the script on the daemon host
    pub script_path: String,
    /// Device count, overridden by devices named in the script
    #[serde(default)]
    pub gpu_count: Option<u32>,
    /// Wall-clock budget in seconds
    #[serde(default)]
    pub timeout_secs: Option<u64>,
}

/// Response for a submitted task
#[derive(Debug, Serialize)]
pub struct SubmitTaskResponse {
    pub task_id: Uuid,
}

/// Response for a task
#[derive(Debug, Serialize)]
pub struct TaskResponse {
    pub id: Uuid,
    pub script_path: String,
    pub script_type: ScriptType,
    pub status: TaskStatus,
    pub requested_gpus: u32,
    pub assigned_gpus: Vec<u32>,
    pub timeout_secs: u64,
    pub submitted_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub exit_code: Option<i32>,
    pub output_head: String,
    pub error_message: Option<String>,
}

impl From<Task> for TaskResponse {
    fn from(task: Task) -> Self {
        Self {
            id: task.id,
            script_path: task.script_path.display().to_string(),
            script_type: task.script_type,
            status: task.status,
            requested_gpus: task.requested_gpus,
            assigned_gpus: task.assigned_gpus,
            timeout_secs: task.timeout_secs,
            submitted_at: task.submitted_at,
            started_at: task.started_at,
            finished_at: task.finished_at,
            exit_code: task.exit_code,
            output_head: task.output_head,
            error_message: task.error_message,
        }
    }
}

/// Submit a script for execution
async fn submit_task(
    State(state): State<Arc<AppState>>,
    Json(req): Json<SubmitTaskRequest>,
) -> Json<SubmitTaskResponse> {
    info!(script = %req.script_path, gpus = ?req.gpu_count, "Submit requested");

    let mut request = SubmitRequest::new(req.script_path);
    request.gpu_count = req.gpu_count;
    request.timeout_secs = req.timeout_secs;

    let task_id = state.scheduler.submit(request).await;
    Json(SubmitTaskResponse { task_id })
}

/// Query parameters for listing tasks
#[derive(Debug, Deserialize)]
pub struct ListParams {
    /// Only return tasks with this status
    pub status: Option<TaskStatus>,
}

/// List all tasks
async fn list_tasks(
    State(state): State<Arc<AppState>>,
    Query(params): Query<ListParams>,
) -> Json<Vec<TaskResponse>> {
    let tasks = state.scheduler.list_tasks(params.status).await;
    Json(tasks.into_iter().map(TaskResponse::from).collect())
}

/// Get a specific task
async fn get_task(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
) -> Result<Json<TaskResponse>, (StatusCode, String)> {
    let task = state
        .scheduler
        .get_status(id)
        .await
        .ok_or((StatusCode::NOT_FOUND, format!("task {id} not found")))?;

    Ok(Json(TaskResponse::from(task)))
}

/// Response for a cancel request
#[derive(Debug, Serialize)]
pub struct CancelResponse {
    pub task_id: Uuid,
    pub cancelled: bool,
}

/// Cancel a task
async fn cancel_task(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
) -> Result<Json<CancelResponse>, (StatusCode, String)> {
    info!(task_id = %id, "Cancel requested");

    if state.scheduler.cancel(id).await {
        return Ok(Json(CancelResponse {
            task_id: id,
            cancelled: true,
        }));
    }
    match state.scheduler.get_status(id).await {
        Some(task) => Err((
            StatusCode::CONFLICT,
            format!("task is already {}", task.status),
        )),
        None => Err((StatusCode::NOT_FOUND, format!("task {id} not found"))),
    }
}

/// Get the device ledger
async fn get_gpus(State(state): State<Arc<AppState>>) -> Json<Vec<DeviceSlot>> {
    Json(state.scheduler.gpu_snapshot().await)
}

/// Re-probe the hardware and report the refreshed ledger
async fn reconcile_gpus(
    State(state): State<Arc<AppState>>,
) -> Result<Json<Vec<DeviceSlot>>, (StatusCode, String)> {
    info!("GPU reconcile requested");

    let snapshot = state
        .scheduler
        .reconcile_gpus()
        .await
        .map_err(|e| (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()))?;

    Ok(Json(snapshot))
}

/// System status response
#[derive(Debug, Serialize)]
pub struct StatusResponse {
    pub version: String,
    #[serde(flatten)]
    pub system: SystemStatus,
}

/// Get system status
async fn get_status(State(state): State<Arc<AppState>>) -> Json<StatusResponse> {
    Json(StatusResponse {
        version: env!("CARGO_PKG_VERSION").to_string(),
        system: state.scheduler.system_status().await,
    })
}
