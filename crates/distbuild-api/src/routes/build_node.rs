//! Endpoints polled by build nodes.

use axum::extract::State;
use axum::routing::post;
use axum::{Json, Router};
use distbuild_core::report::CompletionReport;
use distbuild_core::task::{CapabilitySet, Task, TaskKind};
use distbuild_core::ResourceId;
use distbuild_scheduler::PingOutcome;
use serde::Deserialize;

use super::{CompletionResponse, completion_response};
use crate::AppState;
use crate::error::ApiError;

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/get_task", post(get_task))
        .route("/ping", post(ping))
        .route("/build_done", post(build_done))
        .route("/extend_lease", post(extend_lease))
}

#[derive(Debug, Deserialize)]
struct GetTaskRequest {
    worker_id: String,
    arches: Vec<String>,
}

async fn get_task(
    State(state): State<AppState>,
    Json(req): Json<GetTaskRequest>,
) -> Result<Json<Option<Task>>, ApiError> {
    let capabilities = CapabilitySet::from_strings(req.arches.iter().map(|a| format!("arch:{}", a)))?;
    let task = state
        .coordinator
        .get_available_task(TaskKind::Build, &req.worker_id, &capabilities)
        .await?;
    Ok(Json(task))
}

#[derive(Debug, Deserialize)]
struct PingRequest {
    worker_id: String,
    #[serde(default)]
    active_tasks: Vec<ResourceId>,
}

async fn ping(
    State(state): State<AppState>,
    Json(req): Json<PingRequest>,
) -> Result<Json<PingOutcome>, ApiError> {
    let outcome = state.coordinator.ping(&req.worker_id, &req.active_tasks).await?;
    Ok(Json(outcome))
}

#[derive(Debug, Deserialize)]
struct BuildDoneRequest {
    task_id: ResourceId,
    #[serde(flatten)]
    report: CompletionReport,
}

async fn build_done(
    State(state): State<AppState>,
    Json(req): Json<BuildDoneRequest>,
) -> Result<Json<CompletionResponse>, ApiError> {
    completion_response(state.completion.complete_task(req.task_id, &req.report).await)
}

#[derive(Debug, Deserialize)]
struct ExtendLeaseRequest {
    task_id: ResourceId,
    epoch: i64,
    worker_id: String,
}

async fn extend_lease(
    State(state): State<AppState>,
    Json(req): Json<ExtendLeaseRequest>,
) -> Result<Json<Task>, ApiError> {
    let task = state
        .coordinator
        .extend_lease(req.task_id, req.epoch, &req.worker_id)
        .await?;
    Ok(Json(task))
}
