//! Kafka-backed [`Broker`].
//!
//! - A shared queue is a topic read by one consumer group; each message goes to one
//!   member of the group.
//! - An exclusive destination is a topic named `<prefix>-<uuid>`. It is created
//!   through the admin client, read by a consumer group of the same name, and
//!   deleted when the channel closes.
//! - The correlation id and reply destination travel as message headers.
//! - Offsets on shared queues are committed once the delivery is settled. Rejected
//!   messages are committed too, so they are not redelivered.

use async_trait::async_trait;
use futures::stream::{self, BoxStream};
use futures::StreamExt;
use rdkafka::admin::{AdminClient, AdminOptions, NewTopic, TopicReplication};
use rdkafka::client::DefaultClientContext;
use rdkafka::config::ClientConfig;
use rdkafka::consumer::{CommitMode, Consumer, StreamConsumer};
use rdkafka::message::{BorrowedMessage, Header, Headers, OwnedHeaders};
use rdkafka::producer::{FutureProducer, FutureRecord, Producer};
use rdkafka::Message;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::error::RpcError;
use crate::transport::{Acknowledgement, Broker, Channel, Delivery, Envelope};

pub const CORRELATION_ID_HEADER: &str = "correlation_id";
pub const REPLY_TO_HEADER: &str = "reply_to";

#[derive(Debug, Clone)]
pub struct KafkaSettings {
    pub brokers: String,
    /// Consumer group used for shared queues.
    pub group_id: String,
    /// Prefix of the per-connection reply topics.
    pub reply_topic_prefix: String,
    pub send_timeout: Duration,
    pub metadata_timeout: Duration,
}

impl KafkaSettings {
    pub fn new(brokers: impl Into<String>, group_id: impl Into<String>) -> Self {
        let group_id = group_id.into();
        Self {
            brokers: brokers.into(),
            reply_topic_prefix: format!("{}-replies", group_id),
            group_id,
            send_timeout: Duration::from_secs(5),
            metadata_timeout: Duration::from_secs(5),
        }
    }

    pub fn with_reply_topic_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.reply_topic_prefix = prefix.into();
        self
    }

    fn consumer(&self, group_id: &str, auto_offset_reset: &str) -> Result<StreamConsumer, RpcError> {
        let consumer = ClientConfig::new()
            .set("group.id", group_id)
            .set("bootstrap.servers", &self.brokers)
            .set("enable.partition.eof", "false")
            .set("session.timeout.ms", "6000")
            .set("enable.auto.commit", "false")
            .set("auto.offset.reset", auto_offset_reset)
            .create()?;
        Ok(consumer)
    }
}

pub struct KafkaBroker {
    settings: KafkaSettings,
}

impl KafkaBroker {
    pub fn new(settings: KafkaSettings) -> Self {
        Self { settings }
    }
}

#[async_trait]
impl Broker for KafkaBroker {
    async fn connect(&self) -> Result<Arc<dyn Channel>, RpcError> {
        let producer: FutureProducer = ClientConfig::new()
            .set("bootstrap.servers", &self.settings.brokers)
            .set("message.timeout.ms", "5000")
            .create()?;

        // Client creation is lazy; fetching metadata is what proves the broker is there.
        let probe = producer.clone();
        let timeout = self.settings.metadata_timeout;
        tokio::task::spawn_blocking(move || probe.client().fetch_metadata(None, timeout).map(|_| ()))
            .await
            .map_err(|e| RpcError::Connection(e.to_string()))??;

        let admin: AdminClient<DefaultClientContext> = ClientConfig::new()
            .set("bootstrap.servers", &self.settings.brokers)
            .create()?;

        info!("Connected to Kafka at {}", self.settings.brokers);
        Ok(Arc::new(KafkaChannel {
            settings: self.settings.clone(),
            producer,
            admin,
            open: Arc::new(AtomicBool::new(true)),
            reply_topics: Mutex::new(Vec::new()),
            pumps: Mutex::new(Vec::new()),
        }))
    }
}

struct KafkaChannel {
    settings: KafkaSettings,
    producer: FutureProducer,
    admin: AdminClient<DefaultClientContext>,
    open: Arc<AtomicBool>,
    reply_topics: Mutex<Vec<String>>,
    pumps: Mutex<Vec<JoinHandle<()>>>,
}

impl KafkaChannel {
    fn ensure_open(&self) -> Result<(), RpcError> {
        if self.is_open() {
            Ok(())
        } else {
            Err(RpcError::ConnectionClosed)
        }
    }

    fn track(&self, pump: JoinHandle<()>) {
        self.pumps.lock().unwrap_or_else(PoisonError::into_inner).push(pump);
    }
}

fn header_value(message: &BorrowedMessage<'_>, key: &str) -> Option<String> {
    message
        .headers()?
        .iter()
        .find(|header| header.key == key)
        .and_then(|header| header.value)
        .and_then(|value| std::str::from_utf8(value).ok())
        .map(str::to_owned)
}

fn envelope_from(message: &BorrowedMessage<'_>) -> Envelope {
    Envelope {
        body: message.payload().map(<[u8]>::to_vec).unwrap_or_default(),
        correlation_id: header_value(message, CORRELATION_ID_HEADER),
        reply_to: header_value(message, REPLY_TO_HEADER),
    }
}

fn receiver_stream<T: Send + 'static>(rx: mpsc::Receiver<T>) -> BoxStream<'static, T> {
    stream::unfold(rx, |mut rx| async move { rx.recv().await.map(|item| (item, rx)) }).boxed()
}

#[async_trait]
impl Channel for KafkaChannel {
    fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }

    async fn publish(&self, destination: &str, envelope: Envelope) -> Result<(), RpcError> {
        self.ensure_open()?;

        let mut headers = OwnedHeaders::new();
        if let Some(id) = envelope.correlation_id.as_deref() {
            headers = headers.insert(Header { key: CORRELATION_ID_HEADER, value: Some(id) });
        }
        if let Some(reply_to) = envelope.reply_to.as_deref() {
            headers = headers.insert(Header { key: REPLY_TO_HEADER, value: Some(reply_to) });
        }

        let key = envelope.correlation_id.clone().unwrap_or_default();
        let record = FutureRecord::to(destination)
            .payload(&envelope.body)
            .key(&key)
            .headers(headers);

        self.producer
            .send(record, self.settings.send_timeout)
            .await
            .map_err(|(e, _)| RpcError::Connection(format!("Failed to publish: {}", e)))?;
        Ok(())
    }

    async fn declare_exclusive(&self) -> Result<(String, BoxStream<'static, Envelope>), RpcError> {
        self.ensure_open()?;
        let topic = format!("{}-{}", self.settings.reply_topic_prefix, Uuid::new_v4());

        let created = self
            .admin
            .create_topics(
                &[NewTopic::new(&topic, 1, TopicReplication::Fixed(1))],
                &AdminOptions::new(),
            )
            .await?;
        for result in created {
            if let Err((name, code)) = result {
                return Err(RpcError::Connection(format!("Failed to create {}: {}", name, code)));
            }
        }
        self.reply_topics
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(topic.clone());

        let consumer = self.settings.consumer(&topic, "earliest")?;
        consumer.subscribe(&[&topic])?;

        let (tx, rx) = mpsc::channel(64);
        let open = self.open.clone();
        let name = topic.clone();
        self.track(tokio::spawn(async move {
            let mut messages = consumer.stream();
            while let Some(message) = messages.next().await {
                match message {
                    Ok(m) => {
                        if let Err(e) = consumer.commit_message(&m, CommitMode::Async) {
                            error!("Error committing reply on {}: {}", name, e);
                        }
                        if tx.send(envelope_from(&m)).await.is_err() {
                            break;
                        }
                    }
                    Err(e) => {
                        error!("Error receiving reply on {}: {}", name, e);
                        open.store(false, Ordering::SeqCst);
                        break;
                    }
                }
            }
        }));

        Ok((topic, receiver_stream(rx)))
    }

    async fn consume(&self, queue: &str) -> Result<BoxStream<'static, Delivery>, RpcError> {
        self.ensure_open()?;
        let consumer = self.settings.consumer(&self.settings.group_id, "earliest")?;
        consumer.subscribe(&[queue])?;

        let (tx, rx) = mpsc::channel(1);
        let name = queue.to_string();
        self.track(tokio::spawn(async move {
            let mut messages = consumer.stream();
            while let Some(message) = messages.next().await {
                let m = match message {
                    Ok(m) => m,
                    Err(e) => {
                        error!("Error receiving message on {}: {}", name, e);
                        continue;
                    }
                };

                let (settled_tx, settled_rx) = oneshot::channel();
                let delivery = Delivery::new(envelope_from(&m), move |outcome| {
                    let _ = settled_tx.send(outcome);
                });
                if tx.send(delivery).await.is_err() {
                    break;
                }

                if settled_rx.await.unwrap_or(Acknowledgement::Reject) == Acknowledgement::Reject {
                    warn!("Dropping rejected message at offset {} of {}", m.offset(), name);
                }
                if let Err(e) = consumer.commit_message(&m, CommitMode::Async) {
                    error!("Error committing message: {}", e);
                }
            }
        }));

        Ok(receiver_stream(rx))
    }

    async fn close(&self) -> Result<(), RpcError> {
        if !self.open.swap(false, Ordering::SeqCst) {
            debug!("Kafka channel already closed");
        }

        for pump in self.pumps.lock().unwrap_or_else(PoisonError::into_inner).drain(..) {
            pump.abort();
        }

        let topics: Vec<String> = self
            .reply_topics
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .drain(..)
            .collect();
        if !topics.is_empty() {
            let names: Vec<&str> = topics.iter().map(String::as_str).collect();
            self.admin.delete_topics(&names, &AdminOptions::new()).await?;
            info!("Deleted reply topics {:?}", names);
        }

        let _ = self.producer.flush(self.settings.send_timeout);
        Ok(())
    }
}
