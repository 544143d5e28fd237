use futures::stream::BoxStream;
use futures::StreamExt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::RpcError;
use crate::pending::PendingCalls;
use crate::transport::{Broker, Channel, Envelope};
use crate::{InventoryRecord, InventoryRequest, Reply, SubtractOutcome, INVENTORY_QUEUE};

#[derive(Debug, Clone)]
pub struct ClientSettings {
    /// Queue the requests are published to.
    pub work_queue: String,
    /// How long a call waits for its reply.
    pub call_timeout: Duration,
}

impl Default for ClientSettings {
    fn default() -> Self {
        Self {
            work_queue: INVENTORY_QUEUE.to_string(),
            call_timeout: Duration::from_secs(10),
        }
    }
}

impl ClientSettings {
    pub fn with_work_queue(mut self, queue: impl Into<String>) -> Self {
        self.work_queue = queue.into();
        self
    }

    pub fn with_call_timeout(mut self, timeout: Duration) -> Self {
        self.call_timeout = timeout;
        self
    }
}

/// A live channel together with the reply destination and listener bound to it.
struct Session {
    channel: Arc<dyn Channel>,
    reply_to: String,
    listener: JoinHandle<()>,
}

/// Request/reply client for the inventory service.
///
/// Create one at startup and share it by `Arc`. The underlying connection is
/// reopened on the next call if the broker closes it.
pub struct RpcClient {
    broker: Arc<dyn Broker>,
    settings: ClientSettings,
    session: Mutex<Option<Session>>,
    pending: PendingCalls,
}

impl RpcClient {
    /// Creates a client without touching the broker.
    pub fn new(broker: Arc<dyn Broker>, settings: ClientSettings) -> Self {
        Self {
            broker,
            settings,
            session: Mutex::new(None),
            pending: PendingCalls::new(),
        }
    }

    pub fn settings(&self) -> &ClientSettings {
        &self.settings
    }

    /// Number of calls currently waiting for a reply.
    pub fn in_flight(&self) -> usize {
        self.pending.len()
    }

    /// Opens the connection, the private reply destination and its listener.
    pub async fn connect(&self) -> Result<(), RpcError> {
        self.session().await.map(|_| ())
    }

    /// Returns the live channel and reply destination, reconnecting if needed.
    async fn session(&self) -> Result<(Arc<dyn Channel>, String), RpcError> {
        let mut slot = self.session.lock().await;

        if let Some(session) = slot.as_ref() {
            if session.channel.is_open() {
                return Ok((session.channel.clone(), session.reply_to.clone()));
            }
        }

        if let Some(stale) = slot.take() {
            info!("Broker connection lost, reconnecting");
            stale.listener.abort();
            if let Err(e) = stale.channel.close().await {
                warn!("Could not release stale broker channel: {}", e);
            }
        }

        let channel = self.broker.connect().await?;
        let (reply_to, replies) = match channel.declare_exclusive().await {
            Ok(declared) => declared,
            Err(e) => {
                let _ = channel.close().await;
                return Err(e);
            }
        };
        let listener = tokio::spawn(listen(replies, self.pending.clone()));
        info!("Connected to broker, replies arrive on {}", reply_to);

        *slot = Some(Session {
            channel: channel.clone(),
            reply_to: reply_to.clone(),
            listener,
        });
        Ok((channel, reply_to))
    }

    /// Sends `request` and waits for the correlated reply payload.
    ///
    /// The call timeout bounds the whole call, reconnecting and publishing included.
    pub async fn call(&self, request: &InventoryRequest) -> Result<serde_json::Value, RpcError> {
        let correlation_id = Uuid::new_v4().to_string();
        let exchange = self.exchange(request, &correlation_id);

        let reply = match tokio::time::timeout(self.settings.call_timeout, exchange).await {
            Ok(reply) => reply?,
            Err(_) => {
                self.pending.evict(&correlation_id);
                warn!("Call {} timed out after {:?}", correlation_id, self.settings.call_timeout);
                return Err(RpcError::Timeout(self.settings.call_timeout));
            }
        };

        match reply {
            Reply::Ok(payload) => Ok(payload),
            Reply::NotFound => Err(RpcError::NotFound),
            Reply::Error(reason) => Err(RpcError::Remote(reason)),
        }
    }

    async fn exchange(&self, request: &InventoryRequest, correlation_id: &str) -> Result<Reply, RpcError> {
        let (channel, reply_to) = self.session().await?;

        let envelope = Envelope::new(serde_json::to_vec(request)?)
            .with_correlation_id(correlation_id)
            .with_reply_to(reply_to);

        let slot = self.pending.register(correlation_id)?;
        if let Err(e) = channel.publish(&self.settings.work_queue, envelope).await {
            self.pending.evict(correlation_id);
            return Err(e);
        }
        debug!("Sent {:?} as {}", request, correlation_id);

        slot.await.map_err(|_| RpcError::ConnectionClosed)
    }

    pub async fn read_product(&self, product_id: &str) -> Result<InventoryRecord, RpcError> {
        let payload = self
            .call(&InventoryRequest::Read { product_id: product_id.to_string() })
            .await?;
        Ok(serde_json::from_value(payload)?)
    }

    /// Removes `quantity` units from stock and returns what is left.
    pub async fn subtract(&self, product_id: &str, quantity: i32) -> Result<i32, RpcError> {
        let payload = self
            .call(&InventoryRequest::Subtract { product_id: product_id.to_string(), quantity })
            .await?;
        let outcome: SubtractOutcome = serde_json::from_value(payload)?;
        Ok(outcome.inventory_count)
    }

    /// Releases the connection. Calls still waiting fail with `ConnectionClosed`.
    pub async fn close(&self) -> Result<(), RpcError> {
        let session = self.session.lock().await.take();
        self.pending.clear();

        let Some(session) = session else {
            return Ok(());
        };
        session.listener.abort();
        session.channel.close().await?;
        info!("Closed broker connection");
        Ok(())
    }
}

async fn listen(mut replies: BoxStream<'static, Envelope>, pending: PendingCalls) {
    while let Some(envelope) = replies.next().await {
        pending.dispatch(envelope);
    }
    debug!("Reply stream ended");
}
