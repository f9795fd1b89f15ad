//! Sign task endpoints, for clients and for sign nodes.

use axum::extract::{Path, Query, State};
use axum::routing::{get, post};
use axum::{Json, Router};
use distbuild_core::ResourceId;
use distbuild_core::report::CompletionReport;
use distbuild_core::signing::SyncSignRequest;
use distbuild_core::task::{Capability, CapabilitySet, Task, TaskKind};
use serde::Deserialize;
use serde_json::{Value, json};

use super::{CompletionResponse, completion_response, gen_key_body};
use crate::AppState;
use crate::error::ApiError;
use crate::ws::sign_task_queue;

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/", get(list_sign_tasks).post(create_sign_task))
        .route("/get_sign_task", post(get_sign_task))
        .route("/{task_id}/complete", post(complete_sign_task))
        .route("/sync_sign_task", post(sync_sign_task))
        .route("/sign_task_queue", get(sign_task_queue))
        .route(
            "/community/get_gen_sign_key_task",
            post(get_gen_sign_key_task),
        )
        .route(
            "/community/{task_id}/complete",
            post(complete_gen_sign_key_task),
        )
}

#[derive(Debug, Deserialize)]
struct ListQuery {
    build_id: Option<ResourceId>,
}

async fn list_sign_tasks(
    State(state): State<AppState>,
    Query(query): Query<ListQuery>,
) -> Result<Json<Vec<Task>>, ApiError> {
    Ok(Json(state.sign_tasks.list_sign_tasks(query.build_id).await?))
}

#[derive(Debug, Deserialize)]
struct CreateSignTaskRequest {
    build_id: ResourceId,
    key_id: String,
}

async fn create_sign_task(
    State(state): State<AppState>,
    Json(req): Json<CreateSignTaskRequest>,
) -> Result<Json<Task>, ApiError> {
    let task = state
        .sign_tasks
        .create_sign_task(req.build_id, &req.key_id)
        .await?;
    Ok(Json(task))
}

#[derive(Debug, Deserialize)]
struct GetSignTaskRequest {
    worker_id: String,
    key_ids: Vec<String>,
}

/// Hand out a sign task for one of the node's keys, or `{}`.
async fn get_sign_task(
    State(state): State<AppState>,
    Json(req): Json<GetSignTaskRequest>,
) -> Result<Json<Value>, ApiError> {
    let capabilities =
        CapabilitySet::from_strings(req.key_ids.iter().map(|k| format!("key:{}", k)))?;
    let task = state
        .coordinator
        .get_available_task(TaskKind::Sign, &req.worker_id, &capabilities)
        .await?;
    let body = match task {
        Some(task) => serde_json::to_value(task)
            .map_err(|e| ApiError::Internal(format!("encode task: {}", e)))?,
        None => json!({}),
    };
    Ok(Json(body))
}

async fn complete_sign_task(
    State(state): State<AppState>,
    Path(task_id): Path<ResourceId>,
    Json(report): Json<CompletionReport>,
) -> Result<Json<Value>, ApiError> {
    state.sign_tasks.complete_sign_task(task_id, report).await?;
    Ok(Json(json!({ "success": true })))
}

async fn sync_sign_task(
    State(state): State<AppState>,
    Json(req): Json<SyncSignRequest>,
) -> Result<Json<Value>, ApiError> {
    Ok(Json(state.requester.request(req).await?))
}

#[derive(Debug, Deserialize)]
struct GenKeyTaskRequest {
    worker_id: String,
}

async fn get_gen_sign_key_task(
    State(state): State<AppState>,
    Json(req): Json<GenKeyTaskRequest>,
) -> Result<Json<Value>, ApiError> {
    let capabilities: CapabilitySet = [Capability::KeyGeneration].into_iter().collect();
    let task = state
        .coordinator
        .get_available_task(TaskKind::GenKey, &req.worker_id, &capabilities)
        .await?;
    Ok(Json(task.as_ref().map(gen_key_body).unwrap_or_else(|| json!({}))))
}

async fn complete_gen_sign_key_task(
    State(state): State<AppState>,
    Path(task_id): Path<ResourceId>,
    Json(report): Json<CompletionReport>,
) -> Result<Json<CompletionResponse>, ApiError> {
    completion_response(state.completion.complete_task(task_id, &report).await)
}
