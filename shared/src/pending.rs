use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::oneshot;
use tracing::{debug, warn};

use crate::error::RpcError;
use crate::transport::Envelope;
use crate::Reply;

/// Outstanding calls keyed by correlation id.
///
/// Every operation takes the lock once and never holds it across an await, so
/// registering, evicting and resolving an entry are each atomic with respect to
/// the other tasks touching the table.
#[derive(Clone, Default)]
pub struct PendingCalls {
    slots: Arc<Mutex<HashMap<String, oneshot::Sender<Reply>>>>,
}

impl PendingCalls {
    pub fn new() -> Self {
        Self::default()
    }

    fn slots(&self) -> MutexGuard<'_, HashMap<String, oneshot::Sender<Reply>>> {
        self.slots.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Reserves a result slot for `correlation_id`.
    pub fn register(&self, correlation_id: &str) -> Result<oneshot::Receiver<Reply>, RpcError> {
        let mut slots = self.slots();
        if slots.contains_key(correlation_id) {
            return Err(RpcError::DuplicateCorrelation(correlation_id.to_string()));
        }
        let (tx, rx) = oneshot::channel();
        slots.insert(correlation_id.to_string(), tx);
        Ok(rx)
    }

    /// Removes the call without resolving it. Returns false if it was already gone.
    pub fn evict(&self, correlation_id: &str) -> bool {
        self.slots().remove(correlation_id).is_some()
    }

    /// Hands `reply` to the waiting call. Returns false if no such call is pending.
    pub fn resolve(&self, correlation_id: &str, reply: Reply) -> bool {
        let Some(slot) = self.slots().remove(correlation_id) else {
            return false;
        };
        if slot.send(reply).is_err() {
            debug!("Caller for {} went away before its reply arrived", correlation_id);
        }
        true
    }

    /// Routes an envelope from the reply destination to its call.
    pub fn dispatch(&self, envelope: Envelope) {
        let Some(correlation_id) = envelope.correlation_id else {
            debug!("Dropping reply without correlation id");
            return;
        };

        let reply = match Reply::decode(&envelope.body) {
            Ok(reply) => reply,
            Err(e) => Reply::failed(format!("malformed reply: {}", e)),
        };

        if !self.resolve(&correlation_id, reply) {
            warn!("Reply for unknown or expired call {}, dropping", correlation_id);
        }
    }

    pub fn len(&self) -> usize {
        self.slots().len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots().is_empty()
    }

    /// Drops every slot; their callers observe a closed channel.
    pub fn clear(&self) {
        let drained = self.slots().drain().count();
        if drained > 0 {
            debug!("Abandoned {} pending calls", drained);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn reply_envelope(id: Option<&str>, reply: &Reply) -> Envelope {
        let envelope = Envelope::new(reply.encode().unwrap());
        match id {
            Some(id) => envelope.with_correlation_id(id),
            None => envelope,
        }
    }

    #[tokio::test]
    async fn dispatch_resolves_matching_call() {
        let pending = PendingCalls::new();
        let rx = pending.register("a").unwrap();

        pending.dispatch(reply_envelope(Some("a"), &Reply::Ok(json!({"x": 1}))));

        assert_eq!(rx.await.unwrap(), Reply::Ok(json!({"x": 1})));
        assert!(pending.is_empty());
    }

    #[test]
    fn duplicate_registration_is_refused() {
        let pending = PendingCalls::new();
        let _rx = pending.register("a").unwrap();
        assert!(matches!(pending.register("a"), Err(RpcError::DuplicateCorrelation(id)) if id == "a"));
        assert_eq!(pending.len(), 1);
    }

    #[test]
    fn reply_after_eviction_is_dropped() {
        let pending = PendingCalls::new();
        let _rx = pending.register("a").unwrap();
        assert!(pending.evict("a"));
        assert!(!pending.evict("a"));

        pending.dispatch(reply_envelope(Some("a"), &Reply::NotFound));
        assert!(pending.is_empty());
    }

    #[test]
    fn reply_without_correlation_id_is_ignored() {
        let pending = PendingCalls::new();
        let mut rx = pending.register("a").unwrap();

        pending.dispatch(reply_envelope(None, &Reply::NotFound));

        assert_eq!(pending.len(), 1);
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn undecodable_reply_resolves_as_error() {
        let pending = PendingCalls::new();
        let rx = pending.register("a").unwrap();

        pending.dispatch(Envelope::new(b"NOT_FOUND".to_vec()).with_correlation_id("a"));

        assert!(matches!(rx.await.unwrap(), Reply::Error(reason) if reason.starts_with("malformed reply")));
    }

    #[tokio::test]
    async fn clear_wakes_waiters_with_closed_channel() {
        let pending = PendingCalls::new();
        let rx = pending.register("a").unwrap();
        pending.clear();
        assert!(rx.await.is_err());
    }
}
