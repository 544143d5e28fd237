use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum RpcError {
    #[error("broker connection error: {0}")]
    Connection(String),

    #[error("connection closed")]
    ConnectionClosed,

    #[error("no reply within {0:?}")]
    Timeout(Duration),

    #[error("not found")]
    NotFound,

    #[error("remote error: {0}")]
    Remote(String),

    #[error("correlation id {0} is already in flight")]
    DuplicateCorrelation(String),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl From<rdkafka::error::KafkaError> for RpcError {
    fn from(err: rdkafka::error::KafkaError) -> Self {
        RpcError::Connection(err.to_string())
    }
}
