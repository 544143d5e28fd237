pub mod client;
pub mod error;
pub mod kafka;
pub mod memory;
pub mod pending;
pub mod server;
pub mod transport;

use serde::{Deserialize, Serialize};

pub use client::{ClientSettings, RpcClient};
pub use error::RpcError;
pub use kafka::{KafkaBroker, KafkaSettings};
pub use memory::InMemoryBroker;
pub use pending::PendingCalls;
pub use server::{RequestHandler, RpcServer};
pub use transport::{Acknowledgement, Broker, Channel, Delivery, Envelope};

/// Default name of the shared queue the inventory service consumes.
pub const INVENTORY_QUEUE: &str = "inventory-requests";

/// An operation the inventory service performs on behalf of a remote caller.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "method", rename_all = "snake_case")]
pub enum InventoryRequest {
    Read { product_id: String },
    Subtract { product_id: String, quantity: i32 },
}

impl InventoryRequest {
    pub fn product_id(&self) -> &str {
        match self {
            InventoryRequest::Read { product_id } => product_id,
            InventoryRequest::Subtract { product_id, .. } => product_id,
        }
    }
}

/// Outcome of a request, as carried back over the reply destination.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", content = "body", rename_all = "snake_case")]
pub enum Reply {
    Ok(serde_json::Value),
    NotFound,
    Error(String),
}

impl Reply {
    pub fn success<T: Serialize>(payload: &T) -> Result<Self, serde_json::Error> {
        Ok(Reply::Ok(serde_json::to_value(payload)?))
    }

    pub fn failed(reason: impl Into<String>) -> Self {
        Reply::Error(reason.into())
    }

    pub fn encode(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(self)
    }

    pub fn decode(body: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(body)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InventoryRecord {
    pub id: String,
    pub name: String,
    pub info: String,
    pub inventory_count: i32,
    pub price: f64,
}

/// Payload of a successful subtract.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubtractOutcome {
    pub inventory_count: i32,
}
