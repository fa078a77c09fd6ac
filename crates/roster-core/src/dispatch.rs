//! Process-local delivery.
//!
//! Each connection served by this process gets a bounded outbound queue
//! keyed by its [`ConnectionId`]. The task serving the connection drains the
//! queue and writes to the socket.

use crate::fanout::{Delivery, DeliveryError, DeliveryOutcome};
use crate::identity::ConnectionId;
use crate::message::Envelope;
use async_trait::async_trait;
use dashmap::DashMap;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tracing::{debug, trace};

/// Default outbound queue length per connection.
pub const DEFAULT_QUEUE_CAPACITY: usize = 256;

/// Outbound queues of the connections this process owns.
pub struct LocalDispatch {
    node: String,
    queues: DashMap<ConnectionId, mpsc::Sender<Arc<Envelope>>>,
    capacity: usize,
}

impl LocalDispatch {
    #[must_use]
    pub fn new(node: impl Into<String>) -> Self {
        Self::with_capacity(node, DEFAULT_QUEUE_CAPACITY)
    }

    #[must_use]
    pub fn with_capacity(node: impl Into<String>, capacity: usize) -> Self {
        Self {
            node: node.into(),
            queues: DashMap::new(),
            capacity: capacity.max(1),
        }
    }

    /// Node id the connections of this dispatch belong to.
    #[must_use]
    pub fn node(&self) -> &str {
        &self.node
    }

    /// Create the outbound queue for `connection`, replacing any previous one.
    pub fn attach(&self, connection: ConnectionId) -> mpsc::Receiver<Arc<Envelope>> {
        let (tx, rx) = mpsc::channel(self.capacity);
        debug!(connection = %connection, "Attached outbound queue");
        self.queues.insert(connection, tx);
        rx
    }

    pub fn detach(&self, connection: &ConnectionId) {
        if self.queues.remove(connection).is_some() {
            debug!(connection = %connection, "Detached outbound queue");
        }
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.queues.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.queues.is_empty()
    }

    /// Queue `envelope` for `connection` without waiting.
    pub fn dispatch(&self, connection: &ConnectionId, envelope: Arc<Envelope>) -> DeliveryOutcome {
        // Clone out of the map so removal below cannot deadlock the shard.
        let Some(sender) = self.queues.get(connection).map(|s| s.clone()) else {
            return DeliveryOutcome::Stale;
        };

        match sender.try_send(envelope) {
            Ok(()) => {
                trace!(connection = %connection, "Queued envelope");
                DeliveryOutcome::Delivered
            }
            Err(TrySendError::Full(_)) => DeliveryOutcome::Rejected,
            Err(TrySendError::Closed(_)) => {
                self.queues.remove(connection);
                DeliveryOutcome::Stale
            }
        }
    }
}

#[async_trait]
impl Delivery for LocalDispatch {
    async fn deliver(
        &self,
        connection: &ConnectionId,
        envelope: Arc<Envelope>,
    ) -> Result<DeliveryOutcome, DeliveryError> {
        Ok(self.dispatch(connection, envelope))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn envelope() -> Arc<Envelope> {
        Arc::new(Envelope::new("ping", b"{}".to_vec()))
    }

    #[tokio::test]
    async fn test_dispatch_to_attached_connection() {
        let dispatch = LocalDispatch::new("node-a");
        let id = ConnectionId::new("node-a/1");
        let mut rx = dispatch.attach(id.clone());

        assert_eq!(dispatch.dispatch(&id, envelope()), DeliveryOutcome::Delivered);
        assert_eq!(rx.recv().await.unwrap().event, "ping");
    }

    #[test]
    fn test_unknown_connection_is_stale() {
        let dispatch = LocalDispatch::new("node-a");
        let outcome = dispatch.dispatch(&ConnectionId::new("node-a/404"), envelope());
        assert_eq!(outcome, DeliveryOutcome::Stale);
    }

    #[test]
    fn test_full_queue_rejects() {
        let dispatch = LocalDispatch::with_capacity("node-a", 1);
        let id = ConnectionId::new("node-a/1");
        let _rx = dispatch.attach(id.clone());

        assert_eq!(dispatch.dispatch(&id, envelope()), DeliveryOutcome::Delivered);
        assert_eq!(dispatch.dispatch(&id, envelope()), DeliveryOutcome::Rejected);
        assert_eq!(dispatch.len(), 1);
    }

    #[test]
    fn test_dropped_receiver_is_pruned() {
        let dispatch = LocalDispatch::new("node-a");
        let id = ConnectionId::new("node-a/1");
        drop(dispatch.attach(id.clone()));

        assert_eq!(dispatch.dispatch(&id, envelope()), DeliveryOutcome::Stale);
        assert!(dispatch.is_empty());
    }

    #[test]
    fn test_detach() {
        let dispatch = LocalDispatch::new("node-a");
        let id = ConnectionId::new("node-a/1");
        let _rx = dispatch.attach(id.clone());
        dispatch.detach(&id);
        assert_eq!(dispatch.dispatch(&id, envelope()), DeliveryOutcome::Stale);
    }
}
