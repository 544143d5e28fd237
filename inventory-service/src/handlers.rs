use anyhow::Result;
use async_trait::async_trait;
use std::sync::Arc;
use tracing::{info, warn};
use shared::*;
use crate::store::{InventoryStore, StoreError};

/// Answers `read` and `subtract` requests arriving over the broker.
pub struct InventoryHandler {
    store: Arc<dyn InventoryStore>,
}

impl InventoryHandler {
    pub fn new(store: Arc<dyn InventoryStore>) -> Self {
        Self { store }
    }

    async fn handle_subtract(&self, product_id: &str, quantity: i32) -> Result<Reply> {
        if quantity <= 0 {
            warn!("Refusing to subtract {} from {}", quantity, product_id);
            return Ok(Reply::failed("quantity must be positive"));
        }

        match self.store.subtract(product_id, quantity).await {
            Ok(inventory_count) => {
                info!("Subtracted {} from {}, {} left", quantity, product_id, inventory_count);
                Ok(Reply::success(&SubtractOutcome { inventory_count })?)
            }
            Err(StoreError::NotFound) => Ok(Reply::NotFound),
            Err(e @ StoreError::InsufficientInventory { .. }) => {
                warn!("Subtract on {} refused: {}", product_id, e);
                Ok(Reply::failed(e.to_string()))
            }
            Err(e) => Err(e.into()),
        }
    }
}

#[async_trait]
impl RequestHandler for InventoryHandler {
    async fn handle(&self, request: InventoryRequest) -> Result<Reply> {
        let product = match self.store.get(request.product_id()).await {
            Ok(product) => product,
            Err(StoreError::NotFound) => return Ok(Reply::NotFound),
            Err(e) => return Err(e.into()),
        };

        match request {
            InventoryRequest::Read { .. } => Ok(Reply::success(&InventoryRecord::from(product))?),
            InventoryRequest::Subtract { product_id, quantity } => {
                self.handle_subtract(&product_id, quantity).await
            }
        }
    }
}
