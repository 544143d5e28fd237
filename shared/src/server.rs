use anyhow::{anyhow, Result};
use async_trait::async_trait;
use futures::StreamExt;
use std::sync::Arc;
use tracing::{debug, error, info, warn};

use crate::error::RpcError;
use crate::transport::{Channel, Delivery, Envelope};
use crate::{InventoryRequest, Reply};

/// Executes one decoded request and produces the reply to send back.
///
/// Returning `Err` marks the message as faulted: the caller gets an error reply
/// and the message is dropped without redelivery.
#[async_trait]
pub trait RequestHandler: Send + Sync + 'static {
    async fn handle(&self, request: InventoryRequest) -> Result<Reply>;
}

#[async_trait]
impl<H: RequestHandler + ?Sized> RequestHandler for Arc<H> {
    async fn handle(&self, request: InventoryRequest) -> Result<Reply> {
        (**self).handle(request).await
    }
}

/// Consumes a shared work queue and answers each request on its reply destination.
pub struct RpcServer<H> {
    channel: Arc<dyn Channel>,
    queue: String,
    handler: H,
}

impl<H: RequestHandler> RpcServer<H> {
    pub fn new(channel: Arc<dyn Channel>, queue: impl Into<String>, handler: H) -> Self {
        Self { channel, queue: queue.into(), handler }
    }

    /// Processes requests one at a time until the channel closes.
    pub async fn run(&self) -> Result<(), RpcError> {
        let mut deliveries = self.channel.consume(&self.queue).await?;
        info!("Consuming requests from {}", self.queue);

        while let Some(delivery) = deliveries.next().await {
            self.process(delivery).await;
        }

        info!("Request stream for {} ended", self.queue);
        Ok(())
    }

    /// Handles one delivery and settles it. Faults are logged, never propagated.
    pub async fn process(&self, delivery: Delivery) {
        match self.respond(&delivery.envelope).await {
            Ok(()) => delivery.ack(),
            Err(e) => {
                error!(
                    "Error handling request {:?}: {:#}",
                    delivery.envelope.correlation_id, e
                );
                if let Some(reply_to) = &delivery.envelope.reply_to {
                    let reply = Reply::failed(e.to_string());
                    if let Err(e) = self.send_reply(reply_to, &delivery.envelope, &reply).await {
                        warn!("Could not report failure to {}: {}", reply_to, e);
                    }
                }
                delivery.reject();
            }
        }
    }

    async fn respond(&self, envelope: &Envelope) -> Result<()> {
        let reply_to = envelope
            .reply_to
            .as_deref()
            .ok_or_else(|| anyhow!("request has no reply destination"))?;
        let request: InventoryRequest = serde_json::from_slice(&envelope.body)
            .map_err(|e| anyhow!("malformed request: {}", e))?;
        debug!("Handling {:?} for {:?}", request, envelope.correlation_id);

        let reply = self.handler.handle(request).await?;
        self.send_reply(reply_to, envelope, &reply).await?;
        Ok(())
    }

    async fn send_reply(&self, reply_to: &str, request: &Envelope, reply: &Reply) -> Result<()> {
        let mut envelope = Envelope::new(reply.encode()?);
        envelope.correlation_id = request.correlation_id.clone();

        self.channel
            .publish(reply_to, envelope)
            .await
            .map_err(|e| anyhow!("Failed to send reply: {}", e))?;
        Ok(())
    }
}
