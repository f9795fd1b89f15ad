//! Product endpoints.

use axum::extract::{Path, State};
use axum::routing::{delete, get, post};
use axum::{Json, Router};
use distbuild_core::ResourceId;
use distbuild_core::product::{NewProduct, Product, ProductChange};
use serde::Serialize;
use serde_json::Value;

use super::gen_key_body;
use crate::AppState;
use crate::error::ApiError;

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/", post(create_product))
        .route("/{product_id}", get(get_product))
        .route("/{product_id}/gen-sign-key", post(gen_sign_key))
        .route("/{product_id}/remove", delete(remove_product))
        .route("/add/{build_id}/{product}", post(add_to_product))
        .route("/remove/{build_id}/{product}", post(remove_from_product))
}

#[derive(Debug, Serialize)]
struct ProductOpResult {
    success: bool,
    message: String,
}

impl From<String> for ProductOpResult {
    fn from(message: String) -> Self {
        Self {
            success: true,
            message,
        }
    }
}

#[derive(Debug, Serialize)]
struct CreatedProduct {
    #[serde(flatten)]
    product: Product,
    gen_key_task_id: ResourceId,
}

async fn create_product(
    State(state): State<AppState>,
    Json(req): Json<NewProduct>,
) -> Result<Json<CreatedProduct>, ApiError> {
    let (product, task) = state.products.create_product(&req).await?;
    Ok(Json(CreatedProduct {
        product,
        gen_key_task_id: task.id,
    }))
}

async fn get_product(
    State(state): State<AppState>,
    Path(product_id): Path<ResourceId>,
) -> Result<Json<Product>, ApiError> {
    Ok(Json(state.products.get_product(product_id).await?))
}

async fn gen_sign_key(
    State(state): State<AppState>,
    Path(product_id): Path<ResourceId>,
) -> Result<Json<Value>, ApiError> {
    let task = state.products.create_gen_key_task(product_id).await?;
    Ok(Json(gen_key_body(&task)))
}

async fn add_to_product(
    State(state): State<AppState>,
    Path((build_id, product)): Path<(ResourceId, String)>,
) -> Result<Json<ProductOpResult>, ApiError> {
    let message = state
        .products
        .modify_product(build_id, &product, ProductChange::Add)
        .await?;
    Ok(Json(message.into()))
}

async fn remove_from_product(
    State(state): State<AppState>,
    Path((build_id, product)): Path<(ResourceId, String)>,
) -> Result<Json<ProductOpResult>, ApiError> {
    let message = state
        .products
        .modify_product(build_id, &product, ProductChange::Remove)
        .await?;
    Ok(Json(message.into()))
}

async fn remove_product(
    State(state): State<AppState>,
    Path(product_id): Path<ResourceId>,
) -> Result<Json<ProductOpResult>, ApiError> {
    Ok(Json(state.products.remove_product(product_id).await?.into()))
}
