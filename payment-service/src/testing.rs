//! Inventory stand-ins for exercising the payment flow without Kafka.

use anyhow::Result;
use async_trait::async_trait;
use shared::*;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

#[derive(Default)]
pub struct Stock {
    records: Mutex<HashMap<String, InventoryRecord>>,
}

impl Stock {
    pub fn count(&self, product_id: &str) -> i32 {
        self.records.lock().unwrap()[product_id].inventory_count
    }
}

#[async_trait]
impl RequestHandler for Stock {
    async fn handle(&self, request: InventoryRequest) -> Result<Reply> {
        let mut records = self.records.lock().unwrap();
        let Some(record) = records.get_mut(request.product_id()) else {
            return Ok(Reply::NotFound);
        };
        match request {
            InventoryRequest::Read { .. } => Ok(Reply::success(record)?),
            InventoryRequest::Subtract { quantity, .. } => {
                if record.inventory_count < quantity {
                    return Ok(Reply::failed("insufficient inventory"));
                }
                record.inventory_count -= quantity;
                Ok(Reply::success(&SubtractOutcome { inventory_count: record.inventory_count })?)
            }
        }
    }
}

/// Serves `records` over an in-memory broker and returns a client wired to it.
pub async fn inventory(records: &[(&str, i32, f64)]) -> (Arc<Stock>, Arc<RpcClient>) {
    let stock = Arc::new(Stock::default());
    for (id, count, price) in records {
        stock.records.lock().unwrap().insert(
            id.to_string(),
            InventoryRecord {
                id: id.to_string(),
                name: format!("product {}", id),
                info: "no info added".to_string(),
                inventory_count: *count,
                price: *price,
            },
        );
    }

    let broker = InMemoryBroker::new();
    let server = RpcServer::new(broker.connect().await.unwrap(), INVENTORY_QUEUE, stock.clone());
    tokio::spawn(async move { server.run().await });

    let client = RpcClient::new(Arc::new(broker), ClientSettings::default());
    (stock, Arc::new(client))
}

/// A client whose requests are queued but never answered.
pub fn unanswered_inventory(timeout: Duration) -> Arc<RpcClient> {
    Arc::new(RpcClient::new(
        Arc::new(InMemoryBroker::new()),
        ClientSettings::default().with_call_timeout(timeout),
    ))
}
