use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::Json,
    routing::{get, post},
    Router,
};
use num_traits::ToPrimitive;
use serde::{Deserialize, Serialize};
use shared::{RpcClient, RpcError};
use std::sync::Arc;
use uuid::Uuid;
use crate::models::{Payment, PaymentView};
use crate::store::{PaymentStore, StoreError};
use crate::workflow::PaymentWorkflow;

#[derive(Clone)]
pub struct AppState {
    pub store: Arc<dyn PaymentStore>,
    pub inventory: Arc<RpcClient>,
    pub workflow: Arc<PaymentWorkflow>,
}

#[derive(Debug, Deserialize)]
pub struct CreateOrderRequest {
    pub product_id: String,
    pub quantity: i32,
}

#[derive(Debug, Serialize)]
pub struct CreateOrderResponse {
    pub payment_id: Uuid,
    pub status: String,
    pub total_price: f64,
    pub message: String,
}

#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: String,
}

type ApiError = (StatusCode, Json<ErrorResponse>);

fn api_error(status: StatusCode, error: impl Into<String>) -> ApiError {
    (status, Json(ErrorResponse { error: error.into() }))
}

pub fn create_router(state: AppState) -> Router {
    Router::new()
        .route("/v1/orders", post(create_order))
        .route("/v1/payments/:id", get(read_payment))
        .route("/health", get(health_check))
        .with_state(state)
        .layer(
            tower_http::cors::CorsLayer::new()
                .allow_origin(tower_http::cors::Any)
                .allow_methods(tower_http::cors::Any)
                .allow_headers(tower_http::cors::Any),
        )
}

fn inventory_failure(product_id: &str, e: RpcError) -> ApiError {
    match e {
        RpcError::NotFound => api_error(
            StatusCode::NOT_FOUND,
            format!("product {} not found", product_id),
        ),
        RpcError::Timeout(_) => api_error(
            StatusCode::REQUEST_TIMEOUT,
            "inventory service did not answer in time",
        ),
        _ => {
            tracing::error!("Reading product {} failed: {}", product_id, e);
            api_error(
                StatusCode::INTERNAL_SERVER_ERROR,
                "something went wrong, please try again later",
            )
        }
    }
}

fn store_failure(e: StoreError) -> ApiError {
    match e {
        StoreError::NotFound => api_error(StatusCode::NOT_FOUND, e.to_string()),
        _ => {
            tracing::error!("Payment store failed: {}", e);
            api_error(StatusCode::INTERNAL_SERVER_ERROR, e.to_string())
        }
    }
}

/// Accepts an order once stock is confirmed; payment and stock update finish in the background.
pub async fn create_order(
    State(state): State<AppState>,
    Json(request): Json<CreateOrderRequest>,
) -> Result<(StatusCode, Json<CreateOrderResponse>), ApiError> {
    if request.quantity <= 0 {
        return Err(api_error(
            StatusCode::UNPROCESSABLE_ENTITY,
            "quantity must be positive",
        ));
    }

    let product = state
        .inventory
        .read_product(&request.product_id)
        .await
        .map_err(|e| inventory_failure(&request.product_id, e))?;

    if product.inventory_count < request.quantity {
        return Err(api_error(
            StatusCode::BAD_REQUEST,
            "Quantity requested is more than inventory",
        ));
    }

    let payment = Payment::pending(&product.id, request.quantity, product.price).map_err(|e| {
        tracing::error!("Could not price product {}: {}", product.id, e);
        api_error(StatusCode::INTERNAL_SERVER_ERROR, e.to_string())
    })?;
    state.store.save(&payment).await.map_err(store_failure)?;

    let response = CreateOrderResponse {
        payment_id: payment.id,
        status: payment.status.clone(),
        total_price: payment.total_price.to_f64().unwrap_or_default(),
        message: "order accepted, payment is being processed".to_string(),
    };
    tracing::info!("Accepted order for {} x {} as payment {}", request.quantity, product.id, payment.id);
    state.workflow.start(payment);

    Ok((StatusCode::ACCEPTED, Json(response)))
}

pub async fn read_payment(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Json<PaymentView>, ApiError> {
    let payment = state.store.get(id).await.map_err(store_failure)?;
    Ok(Json(payment.into()))
}

pub async fn health_check() -> &'static str {
    "OK"
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::memory::MemoryPaymentStore;
    use crate::testing::{inventory, unanswered_inventory, Stock};
    use crate::workflow::GatewaySettings;
    use axum::body::{to_bytes, Body};
    use axum::http::Request;
    use serde_json::{json, Value};
    use std::time::Duration;
    use tower::ServiceExt;

    struct Harness {
        store: Arc<MemoryPaymentStore>,
        workflow: Arc<PaymentWorkflow>,
        router: Router,
    }

    fn harness(inventory: Arc<RpcClient>, delay: Duration) -> Harness {
        let store = Arc::new(MemoryPaymentStore::default());
        let workflow = Arc::new(PaymentWorkflow::new(
            store.clone(),
            inventory.clone(),
            GatewaySettings { delay, ..GatewaySettings::default() },
        ));
        let router = create_router(AppState {
            store: store.clone(),
            inventory,
            workflow: workflow.clone(),
        });
        Harness { store, workflow, router }
    }

    async fn stocked(records: &[(&str, i32, f64)], delay: Duration) -> (Arc<Stock>, Harness) {
        let (stock, client) = inventory(records).await;
        (stock, harness(client, delay))
    }

    async fn send(router: &Router, method: &str, uri: &str, body: Option<Value>) -> (StatusCode, Value) {
        let request = Request::builder()
            .method(method)
            .uri(uri)
            .header("content-type", "application/json")
            .body(body.map_or_else(Body::empty, |b| Body::from(b.to_string())))
            .unwrap();
        let response = router.clone().oneshot(request).await.unwrap();
        let status = response.status();
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        (status, serde_json::from_slice(&bytes).unwrap_or(Value::Null))
    }

    async fn order(router: &Router, product_id: &str, quantity: i32) -> (StatusCode, Value) {
        send(
            router,
            "POST",
            "/v1/orders",
            Some(json!({"product_id": product_id, "quantity": quantity})),
        )
        .await
    }

    #[tokio::test]
    async fn accepted_order_completes_in_background() {
        let (stock, h) = stocked(&[("P1", 10, 2.5)], Duration::ZERO).await;

        let (status, accepted) = order(&h.router, "P1", 3).await;
        assert_eq!(status, StatusCode::ACCEPTED);
        assert_eq!(accepted["status"], "pending");
        assert_eq!(accepted["total_price"], 7.5);

        h.workflow.shutdown(Duration::from_secs(5)).await;

        let id = accepted["payment_id"].as_str().unwrap();
        let (status, payment) = send(&h.router, "GET", &format!("/v1/payments/{}", id), None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(payment["status"], "completed");
        assert_eq!(payment["quantity"], 3);
        assert_eq!(payment["gateway_name"], "simulated-gateway");
        assert_eq!(stock.count("P1"), 7);
    }

    #[tokio::test]
    async fn order_is_acknowledged_before_the_gateway_answers() {
        let (stock, h) = stocked(&[("P1", 10, 2.5)], Duration::from_secs(30)).await;

        let (status, accepted) = order(&h.router, "P1", 3).await;
        assert_eq!(status, StatusCode::ACCEPTED);

        let id: Uuid = accepted["payment_id"].as_str().unwrap().parse().unwrap();
        assert_eq!(h.store.get(id).await.unwrap().status, "pending");
        assert_eq!(stock.count("P1"), 10);
        assert_eq!(h.workflow.in_flight(), 1);

        h.workflow.shutdown(Duration::ZERO).await;
    }

    #[tokio::test]
    async fn exact_stock_is_accepted() {
        let (_, h) = stocked(&[("P1", 5, 1.0)], Duration::ZERO).await;
        let (status, _) = order(&h.router, "P1", 5).await;
        assert_eq!(status, StatusCode::ACCEPTED);
        h.workflow.shutdown(Duration::from_secs(5)).await;
    }

    #[tokio::test]
    async fn insufficient_stock_is_400() {
        let (stock, h) = stocked(&[("P1", 2, 1.0)], Duration::ZERO).await;

        let (status, body) = order(&h.router, "P1", 3).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["error"], "Quantity requested is more than inventory");
        assert_eq!(h.workflow.in_flight(), 0);
        assert_eq!(stock.count("P1"), 2);
    }

    #[tokio::test]
    async fn unknown_product_is_404() {
        let (_, h) = stocked(&[], Duration::ZERO).await;
        let (status, _) = order(&h.router, "GHOST", 1).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn non_positive_quantity_is_422() {
        let (_, h) = stocked(&[("P1", 10, 1.0)], Duration::ZERO).await;
        for quantity in [0, -4] {
            let (status, _) = order(&h.router, "P1", quantity).await;
            assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
        }
    }

    #[tokio::test]
    async fn silent_inventory_is_408() {
        let h = harness(unanswered_inventory(Duration::from_millis(50)), Duration::ZERO);
        let (status, _) = order(&h.router, "P1", 1).await;
        assert_eq!(status, StatusCode::REQUEST_TIMEOUT);
    }

    #[tokio::test]
    async fn unknown_payment_is_404() {
        let (_, h) = stocked(&[], Duration::ZERO).await;
        let (status, body) =
            send(&h.router, "GET", &format!("/v1/payments/{}", Uuid::new_v4()), None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(body["error"], "payment not found");
    }

    #[tokio::test]
    async fn health_check_answers() {
        let (_, h) = stocked(&[], Duration::ZERO).await;
        let response = h
            .router
            .clone()
            .oneshot(Request::builder().uri("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }
}
