//! API routes.

pub mod build_node;
pub mod builds;
pub mod errata;
pub mod health;
pub mod products;
pub mod sign_tasks;

use axum::{Json, Router};
use distbuild_core::task::{Task, TaskPayload};
use serde::Serialize;
use serde_json::{Value, json};

use crate::AppState;
use crate::error::ApiError;

/// Build the main API router.
pub fn router(state: AppState) -> Router {
    Router::new()
        .nest("/api/v1", api_router())
        .merge(health::router())
        .with_state(state)
}

fn api_router() -> Router<AppState> {
    Router::new()
        .nest("/build_node", build_node::router())
        .nest("/builds", builds::router())
        .nest("/sign-tasks", sign_tasks::router())
        .nest("/errata", errata::router())
        .nest("/products", products::router())
}

#[derive(Debug, Serialize)]
pub(crate) struct CompletionResponse {
    success: bool,
    /// False when the report lost a race and changed nothing.
    applied: bool,
}

/// Lost completion races are answered as success so workers need no
/// special handling for them.
pub(crate) fn completion_response(
    result: distbuild_core::Result<Task>,
) -> Result<Json<CompletionResponse>, ApiError> {
    match result {
        Ok(_) => Ok(Json(CompletionResponse {
            success: true,
            applied: true,
        })),
        Err(e) if e.is_race() => Ok(Json(CompletionResponse {
            success: true,
            applied: false,
        })),
        Err(e) => Err(e.into()),
    }
}

pub(crate) fn gen_key_body(task: &Task) -> Value {
    match &task.payload {
        TaskPayload::GenKey {
            product_name,
            user_name,
            user_email,
        } => json!({
            "id": task.id,
            "epoch": task.epoch,
            "product_name": product_name,
            "user_name": user_name,
            "user_email": user_email,
        }),
        _ => json!({ "id": task.id, "epoch": task.epoch }),
    }
}
