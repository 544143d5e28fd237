//! Broker abstraction the RPC layer is written against.
//!
//! A [`Broker`] hands out [`Channel`]s. A channel can publish to a named
//! destination, declare a private destination only it reads from, and consume a
//! shared destination with explicit acknowledgement.

use async_trait::async_trait;
use futures::stream::BoxStream;
use std::fmt;
use std::sync::Arc;

use crate::error::RpcError;

/// A message body plus the metadata request/reply correlation needs.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Envelope {
    pub body: Vec<u8>,
    pub correlation_id: Option<String>,
    pub reply_to: Option<String>,
}

impl Envelope {
    pub fn new(body: Vec<u8>) -> Self {
        Self { body, ..Default::default() }
    }

    pub fn with_correlation_id(mut self, id: impl Into<String>) -> Self {
        self.correlation_id = Some(id.into());
        self
    }

    pub fn with_reply_to(mut self, destination: impl Into<String>) -> Self {
        self.reply_to = Some(destination.into());
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Acknowledgement {
    /// Processed; remove from the queue.
    Ack,
    /// Failed; remove from the queue without redelivery.
    Reject,
}

/// A message taken from a shared queue that must be acknowledged.
///
/// Dropping a delivery without acknowledging it rejects it.
pub struct Delivery {
    pub envelope: Envelope,
    acker: Option<Box<dyn FnOnce(Acknowledgement) + Send>>,
}

impl Delivery {
    pub fn new(envelope: Envelope, acker: impl FnOnce(Acknowledgement) + Send + 'static) -> Self {
        Self { envelope, acker: Some(Box::new(acker)) }
    }

    pub fn ack(mut self) {
        self.settle(Acknowledgement::Ack);
    }

    pub fn reject(mut self) {
        self.settle(Acknowledgement::Reject);
    }

    fn settle(&mut self, outcome: Acknowledgement) {
        if let Some(acker) = self.acker.take() {
            acker(outcome);
        }
    }
}

impl Drop for Delivery {
    fn drop(&mut self) {
        self.settle(Acknowledgement::Reject);
    }
}

impl fmt::Debug for Delivery {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Delivery")
            .field("envelope", &self.envelope)
            .field("settled", &self.acker.is_none())
            .finish()
    }
}

#[async_trait]
pub trait Broker: Send + Sync + 'static {
    async fn connect(&self) -> Result<Arc<dyn Channel>, RpcError>;
}

#[async_trait]
pub trait Channel: Send + Sync {
    fn is_open(&self) -> bool;

    async fn publish(&self, destination: &str, envelope: Envelope) -> Result<(), RpcError>;

    /// Creates a destination only this channel reads from. It goes away with the channel.
    async fn declare_exclusive(&self) -> Result<(String, BoxStream<'static, Envelope>), RpcError>;

    /// Joins the consumers of a shared durable queue.
    async fn consume(&self, queue: &str) -> Result<BoxStream<'static, Delivery>, RpcError>;

    async fn close(&self) -> Result<(), RpcError>;
}
