use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::Json,
    routing::get,
    Router,
};
use serde::Serialize;
use std::sync::Arc;
use crate::models::{Product, ProductFields};
use crate::store::{InventoryStore, StoreError};

#[derive(Clone)]
pub struct AppState {
    pub store: Arc<dyn InventoryStore>,
}

#[derive(Debug, Serialize)]
pub struct CreateProductResponse {
    pub id: String,
    pub message: String,
}

#[derive(Debug, Serialize)]
pub struct MessageResponse {
    pub message: String,
}

#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: String,
}

type ApiError = (StatusCode, Json<ErrorResponse>);

pub fn create_router(state: AppState) -> Router {
    Router::new()
        .route("/v1/products", axum::routing::post(create_product))
        .route(
            "/v1/products/:id",
            get(read_product).put(update_product).delete(delete_product),
        )
        .route("/health", get(health_check))
        .with_state(state)
        .layer(
            tower_http::cors::CorsLayer::new()
                .allow_origin(tower_http::cors::Any)
                .allow_methods(tower_http::cors::Any)
                .allow_headers(tower_http::cors::Any),
        )
}

fn store_failure(e: StoreError) -> ApiError {
    let status = match e {
        StoreError::NotFound => StatusCode::NOT_FOUND,
        _ => {
            tracing::error!("Product store failed: {}", e);
            StatusCode::INTERNAL_SERVER_ERROR
        }
    };
    (status, Json(ErrorResponse { error: e.to_string() }))
}

fn validate(fields: &ProductFields) -> Result<(), ApiError> {
    if fields.inventory_count < 0 || !fields.price.is_finite() || fields.price < 0.0 {
        return Err((
            StatusCode::UNPROCESSABLE_ENTITY,
            Json(ErrorResponse {
                error: "inventory_count and price must not be negative".to_string(),
            }),
        ));
    }
    Ok(())
}

pub async fn read_product(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<Product>, ApiError> {
    state.store.get(&id).await.map(Json).map_err(store_failure)
}

pub async fn create_product(
    State(state): State<AppState>,
    Json(fields): Json<ProductFields>,
) -> Result<(StatusCode, Json<CreateProductResponse>), ApiError> {
    validate(&fields)?;
    let id = state.store.create(fields).await.map_err(store_failure)?;
    tracing::info!("Created product {}", id);

    Ok((
        StatusCode::CREATED,
        Json(CreateProductResponse {
            id,
            message: "product created successfully".to_string(),
        }),
    ))
}

pub async fn update_product(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(fields): Json<ProductFields>,
) -> Result<Json<MessageResponse>, ApiError> {
    validate(&fields)?;
    state.store.replace(&id, fields).await.map_err(store_failure)?;

    Ok(Json(MessageResponse {
        message: "product updated successfully".to_string(),
    }))
}

pub async fn delete_product(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<MessageResponse>, ApiError> {
    state.store.delete(&id).await.map_err(store_failure)?;

    Ok(Json(MessageResponse {
        message: "product deleted successfully".to_string(),
    }))
}

pub async fn health_check() -> &'static str {
    "OK"
}
