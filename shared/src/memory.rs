//! In-process broker for tests and single-process runs.
//!
//! Queues are created on first use and buffer messages until someone consumes
//! them. Several consumers of one queue share its messages; each message goes to
//! exactly one of them. Exclusive queues belong to the channel that declared them
//! and are deleted when it closes; later publishes to them are dropped.
//!
//! ```
//! # async fn demo() -> Result<(), shared::RpcError> {
//! use shared::{Broker, Envelope, InMemoryBroker};
//! use futures::StreamExt;
//!
//! let broker = InMemoryBroker::new();
//! let channel = broker.connect().await?;
//! let (name, mut replies) = channel.declare_exclusive().await?;
//! channel.publish(&name, Envelope::new(b"hi".to_vec())).await?;
//! assert_eq!(replies.next().await.unwrap().body, b"hi");
//! # Ok(())
//! # }
//! ```

use async_trait::async_trait;
use futures::stream::{self, BoxStream};
use futures::StreamExt;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::{mpsc, watch};
use tracing::debug;
use uuid::Uuid;

use crate::error::RpcError;
use crate::transport::{Acknowledgement, Broker, Channel, Delivery, Envelope};

const EXCLUSIVE_PREFIX: &str = "amq.gen-";

type SharedReceiver = Arc<tokio::sync::Mutex<mpsc::UnboundedReceiver<Envelope>>>;

struct Queue {
    sender: mpsc::UnboundedSender<Envelope>,
    receiver: SharedReceiver,
    owner: Option<u64>,
}

impl Queue {
    fn new(owner: Option<u64>) -> Self {
        let (sender, receiver) = mpsc::unbounded_channel();
        Self {
            sender,
            receiver: Arc::new(tokio::sync::Mutex::new(receiver)),
            owner,
        }
    }
}

#[derive(Default)]
struct BrokerState {
    queues: HashMap<String, Queue>,
    channels: HashMap<u64, Arc<watch::Sender<bool>>>,
    next_channel_id: u64,
}

#[derive(Default)]
struct Counters {
    connections: AtomicUsize,
    closed: AtomicUsize,
    acked: AtomicUsize,
    rejected: AtomicUsize,
}

#[derive(Clone, Default)]
pub struct InMemoryBroker {
    state: Arc<Mutex<BrokerState>>,
    counters: Arc<Counters>,
    unreachable: Arc<AtomicBool>,
}

impl InMemoryBroker {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, BrokerState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Makes subsequent `connect` calls fail, as if the broker were down.
    pub fn set_reachable(&self, reachable: bool) {
        self.unreachable.store(!reachable, Ordering::SeqCst);
    }

    /// Closes channel `id` from the broker side. Channel ids start at 1 and
    /// follow connection order.
    pub fn sever(&self, id: u64) {
        let mut state = self.state();
        if let Some(open) = state.channels.remove(&id) {
            open.send_replace(false);
        }
        state.queues.retain(|_, queue| queue.owner != Some(id));
    }

    /// Number of successful `connect` calls so far.
    pub fn connections_opened(&self) -> usize {
        self.counters.connections.load(Ordering::SeqCst)
    }

    /// Number of `Channel::close` calls so far.
    pub fn connections_closed(&self) -> usize {
        self.counters.closed.load(Ordering::SeqCst)
    }

    pub fn acked(&self) -> usize {
        self.counters.acked.load(Ordering::SeqCst)
    }

    pub fn rejected(&self) -> usize {
        self.counters.rejected.load(Ordering::SeqCst)
    }

    /// Whether `queue` currently exists.
    pub fn has_queue(&self, queue: &str) -> bool {
        self.state().queues.contains_key(queue)
    }

    fn receiver(&self, queue: &str) -> SharedReceiver {
        let mut state = self.state();
        state
            .queues
            .entry(queue.to_string())
            .or_insert_with(|| Queue::new(None))
            .receiver
            .clone()
    }
}

#[async_trait]
impl Broker for InMemoryBroker {
    async fn connect(&self) -> Result<Arc<dyn Channel>, RpcError> {
        if self.unreachable.load(Ordering::SeqCst) {
            return Err(RpcError::Connection("in-memory broker is unreachable".to_string()));
        }

        let (open, _) = watch::channel(true);
        let open = Arc::new(open);
        let id = {
            let mut state = self.state();
            state.next_channel_id += 1;
            let id = state.next_channel_id;
            state.channels.insert(id, open.clone());
            id
        };
        self.counters.connections.fetch_add(1, Ordering::SeqCst);
        debug!("In-memory channel {} opened", id);

        Ok(Arc::new(InMemoryChannel { id, broker: self.clone(), open }))
    }
}

struct InMemoryChannel {
    id: u64,
    broker: InMemoryBroker,
    open: Arc<watch::Sender<bool>>,
}

impl InMemoryChannel {
    fn ensure_open(&self) -> Result<(), RpcError> {
        if self.is_open() {
            Ok(())
        } else {
            Err(RpcError::ConnectionClosed)
        }
    }
}

/// Yields messages from `receiver` until the channel behind `open` closes.
fn drain(receiver: SharedReceiver, open: watch::Receiver<bool>) -> BoxStream<'static, Envelope> {
    stream::unfold((receiver, open), |(receiver, mut open)| async move {
        let next = {
            let mut rx = receiver.lock().await;
            tokio::select! {
                envelope = rx.recv() => envelope,
                _ = open.wait_for(|open| !*open) => None,
            }
        };
        next.map(|envelope| (envelope, (receiver, open)))
    })
    .boxed()
}

#[async_trait]
impl Channel for InMemoryChannel {
    fn is_open(&self) -> bool {
        *self.open.borrow()
    }

    async fn publish(&self, destination: &str, envelope: Envelope) -> Result<(), RpcError> {
        self.ensure_open()?;
        let mut state = self.broker.state();

        if destination.starts_with(EXCLUSIVE_PREFIX) && !state.queues.contains_key(destination) {
            debug!("Dropping message for deleted queue {}", destination);
            return Ok(());
        }
        let queue = state
            .queues
            .entry(destination.to_string())
            .or_insert_with(|| Queue::new(None));
        // The receiver half lives in the same map entry, so this only fails during teardown.
        let _ = queue.sender.send(envelope);
        Ok(())
    }

    async fn declare_exclusive(&self) -> Result<(String, BoxStream<'static, Envelope>), RpcError> {
        self.ensure_open()?;
        let name = format!("{}{}", EXCLUSIVE_PREFIX, Uuid::new_v4());
        let queue = Queue::new(Some(self.id));
        let receiver = queue.receiver.clone();
        self.broker.state().queues.insert(name.clone(), queue);

        Ok((name, drain(receiver, self.open.subscribe())))
    }

    async fn consume(&self, queue: &str) -> Result<BoxStream<'static, Delivery>, RpcError> {
        self.ensure_open()?;
        let receiver = self.broker.receiver(queue);
        let counters = self.broker.counters.clone();

        let deliveries = drain(receiver, self.open.subscribe()).map(move |envelope| {
            let counters = counters.clone();
            Delivery::new(envelope, move |outcome| {
                let counter = match outcome {
                    Acknowledgement::Ack => &counters.acked,
                    Acknowledgement::Reject => &counters.rejected,
                };
                counter.fetch_add(1, Ordering::SeqCst);
            })
        });
        Ok(deliveries.boxed())
    }

    async fn close(&self) -> Result<(), RpcError> {
        self.broker.sever(self.id);
        self.broker.counters.closed.fetch_add(1, Ordering::SeqCst);
        debug!("In-memory channel {} closed", self.id);
        Ok(())
    }
}
