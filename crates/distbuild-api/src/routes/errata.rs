//! Errata record endpoints.

use axum::extract::{Path, Query, State};
use axum::routing::{get, post};
use axum::{Json, Router};
use distbuild_core::errata::{ErrataRecord, NewErrataRecord, ReleaseStatus};
use serde::{Deserialize, Serialize};

use crate::AppState;
use crate::error::ApiError;

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/", get(list_records).post(create_record))
        .route("/{record_id}", get(get_record))
        .route("/release_record/{record_id}", post(release_record))
        .route("/bulk_release", post(bulk_release))
}

#[derive(Debug, Serialize)]
struct MessageResponse {
    message: String,
}

async fn create_record(
    State(state): State<AppState>,
    Json(req): Json<NewErrataRecord>,
) -> Result<Json<ErrataRecord>, ApiError> {
    Ok(Json(state.errata.create_record(&req).await?))
}

async fn get_record(
    State(state): State<AppState>,
    Path(record_id): Path<String>,
) -> Result<Json<ErrataRecord>, ApiError> {
    Ok(Json(state.errata.get_record(&record_id).await?))
}

#[derive(Debug, Deserialize)]
struct ListQuery {
    status: Option<String>,
}

async fn list_records(
    State(state): State<AppState>,
    Query(query): Query<ListQuery>,
) -> Result<Json<Vec<ErrataRecord>>, ApiError> {
    let status = query
        .status
        .as_deref()
        .map(str::parse::<ReleaseStatus>)
        .transpose()?;
    Ok(Json(state.errata.list_records(status).await?))
}

#[derive(Debug, Deserialize)]
struct ReleaseQuery {
    #[serde(default)]
    force: bool,
}

async fn release_record(
    State(state): State<AppState>,
    Path(record_id): Path<String>,
    Query(query): Query<ReleaseQuery>,
) -> Result<Json<MessageResponse>, ApiError> {
    let start = state.errata.release_record(&record_id, query.force).await?;
    Ok(Json(MessageResponse {
        message: start.message(&record_id),
    }))
}

async fn bulk_release(
    State(state): State<AppState>,
    Json(record_ids): Json<Vec<String>>,
) -> Result<Json<MessageResponse>, ApiError> {
    let message = state.errata.bulk_release(record_ids).await?;
    Ok(Json(MessageResponse { message }))
}
