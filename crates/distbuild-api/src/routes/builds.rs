//! Build endpoints.

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::routing::{get, patch, post};
use axum::{Json, Router};
use distbuild_core::ResourceId;
use distbuild_core::build::{BuildDetails, NewBuild};
use serde::Serialize;

use crate::AppState;
use crate::error::ApiError;

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/", post(create_build))
        .route("/{build_id}", get(get_build).delete(remove_build))
        .route("/{build_id}/cancel", patch(cancel_build))
}

async fn create_build(
    State(state): State<AppState>,
    Json(req): Json<NewBuild>,
) -> Result<Json<BuildDetails>, ApiError> {
    Ok(Json(state.builds.create_build(&req).await?))
}

async fn get_build(
    State(state): State<AppState>,
    Path(build_id): Path<ResourceId>,
) -> Result<Json<BuildDetails>, ApiError> {
    Ok(Json(state.builds.get_build(build_id).await?))
}

#[derive(Debug, Serialize)]
struct CancelResponse {
    cancelled: Vec<ResourceId>,
}

async fn cancel_build(
    State(state): State<AppState>,
    Path(build_id): Path<ResourceId>,
) -> Result<Json<CancelResponse>, ApiError> {
    let cancelled = state.builds.cancel_build(build_id).await?;
    Ok(Json(CancelResponse { cancelled }))
}

async fn remove_build(
    State(state): State<AppState>,
    Path(build_id): Path<ResourceId>,
) -> Result<StatusCode, ApiError> {
    state.builds.remove_build(build_id).await?;
    Ok(StatusCode::NO_CONTENT)
}
