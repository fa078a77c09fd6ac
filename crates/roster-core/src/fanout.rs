//! Fan-out to every live connection of a set of identities.
//!
//! `emit` is resolve-then-deliver: the registry is asked for each identity's
//! connections, then each connection is handed to a [`Delivery`]. Nothing is
//! held between the two steps, so a connection may vanish in between; that
//! counts as stale, not as an error.

use crate::identity::{ConnectionId, Identity};
use crate::message::Envelope;
use crate::registry::PresenceRegistry;
use async_trait::async_trait;
use bytes::Bytes;
use futures_util::future::join_all;
use serde::Serialize;
use std::collections::{BTreeSet, HashSet};
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, warn};

/// Delivery errors.
#[derive(Debug, Error)]
pub enum DeliveryError {
    /// The cross-process hop could not be made.
    #[error("Relay unavailable: {0}")]
    Unavailable(String),

    #[error("Failed to encode envelope: {0}")]
    Encode(String),
}

/// What happened to one envelope sent to one connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryOutcome {
    /// The connection accepted the envelope.
    Delivered,
    /// The connection exists but cannot take more right now.
    Rejected,
    /// The connection no longer has a live owner.
    Stale,
}

/// Hands an envelope to one connection, wherever it lives.
#[async_trait]
pub trait Delivery: Send + Sync {
    async fn deliver(
        &self,
        connection: &ConnectionId,
        envelope: Arc<Envelope>,
    ) -> Result<DeliveryOutcome, DeliveryError>;
}

/// Result of one [`FanoutEmitter::emit`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct EmitReport {
    /// Connections that accepted the payload.
    pub delivered: usize,
    pub rejected: usize,
    /// Connections that disappeared between resolution and delivery.
    pub stale: usize,
    /// Connections whose delivery errored.
    pub failed: usize,
    /// Identities whose connections could not be looked up.
    pub unresolved: Vec<Identity>,
}

impl EmitReport {
    /// Number of connections resolved for the emit.
    #[must_use]
    pub fn attempted(&self) -> usize {
        self.delivered + self.rejected + self.stale + self.failed
    }
}

pub struct FanoutEmitter {
    registry: Arc<PresenceRegistry>,
    delivery: Arc<dyn Delivery>,
}

impl FanoutEmitter {
    #[must_use]
    pub fn new(registry: Arc<PresenceRegistry>, delivery: Arc<dyn Delivery>) -> Self {
        Self { registry, delivery }
    }

    /// Deliver `payload` as `event` to every live connection of
    /// `identities`.
    ///
    /// Duplicate identities are collapsed and every resolved connection is
    /// tried at most once. A store failure for one identity is reported in
    /// [`EmitReport::unresolved`] and does not stop delivery to the others.
    pub async fn emit<I>(&self, identities: I, event: &str, payload: impl Into<Bytes>) -> EmitReport
    where
        I: IntoIterator<Item = Identity>,
    {
        let targets: BTreeSet<Identity> = identities.into_iter().collect();
        let envelope = Arc::new(Envelope::new(event, payload));
        let mut report = EmitReport::default();

        let lookups = join_all(targets.iter().map(|identity| async move {
            (identity, self.registry.list_connections(identity).await)
        }))
        .await;

        let mut connections: HashSet<ConnectionId> = HashSet::new();
        for (identity, lookup) in lookups {
            match lookup {
                Ok(found) => connections.extend(found),
                Err(e) => {
                    warn!(identity = %identity, error = %e, "Cannot resolve connections");
                    report.unresolved.push(identity.clone());
                }
            }
        }

        let connections: Vec<ConnectionId> = connections.into_iter().collect();
        let outcomes = join_all(
            connections
                .iter()
                .map(|connection| self.delivery.deliver(connection, envelope.clone())),
        )
        .await;

        for (connection, outcome) in connections.iter().zip(outcomes) {
            match outcome {
                Ok(DeliveryOutcome::Delivered) => report.delivered += 1,
                Ok(DeliveryOutcome::Rejected) => {
                    debug!(connection = %connection, "Connection rejected envelope");
                    report.rejected += 1;
                }
                Ok(DeliveryOutcome::Stale) => report.stale += 1,
                Err(e) => {
                    warn!(connection = %connection, error = %e, "Delivery failed");
                    report.failed += 1;
                }
            }
        }

        debug!(
            event = %event,
            identities = targets.len(),
            delivered = report.delivered,
            stale = report.stale,
            "Emitted"
        );
        report
    }
}
