//! Cross-process delivery over Redis pub/sub.
//!
//! Every process listens on `{prefix}node:{node_id}`. Envelopes for a
//! connection owned by another node are MessagePack-encoded and published on
//! that node's channel; its listener hands them to its [`LocalDispatch`].
//! Connections owned by this node skip Redis entirely.

use crate::dispatch::LocalDispatch;
use crate::fanout::{Delivery, DeliveryError, DeliveryOutcome};
use crate::identity::ConnectionId;
use crate::message::{Envelope, EnvelopeId};
use crate::store::redis::mask_redis_url;
use ::redis::aio::ConnectionManager;
use ::redis::{AsyncCommands, Client};
use async_trait::async_trait;
use bytes::Bytes;
use futures_util::StreamExt;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn};

const RECONNECT_DELAY: Duration = Duration::from_secs(1);

/// An envelope in transit to the node owning `connection`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
struct RelayFrame {
    connection: ConnectionId,
    id: EnvelopeId,
    event: String,
    #[serde(with = "serde_bytes")]
    payload: Vec<u8>,
    timestamp: u64,
}

impl RelayFrame {
    fn new(connection: &ConnectionId, envelope: &Envelope) -> Self {
        Self {
            connection: connection.clone(),
            id: envelope.id,
            event: envelope.event.clone(),
            payload: envelope.payload.to_vec(),
            timestamp: envelope.timestamp,
        }
    }

    fn into_parts(self) -> (ConnectionId, Envelope) {
        let envelope = Envelope {
            id: self.id,
            event: self.event,
            payload: Bytes::from(self.payload),
            timestamp: self.timestamp,
        };
        (self.connection, envelope)
    }
}

pub struct RedisRelay {
    local: Arc<LocalDispatch>,
    conn: ConnectionManager,
    prefix: String,
    timeout: Duration,
    listener: JoinHandle<()>,
}

impl RedisRelay {
    /// Connect to Redis and start listening for envelopes addressed to
    /// `local`'s node.
    ///
    /// # Errors
    ///
    /// Returns an error if the URL is invalid or the server is unreachable.
    pub async fn connect(
        url: &str,
        prefix: &str,
        timeout: Duration,
        local: Arc<LocalDispatch>,
    ) -> Result<Self, DeliveryError> {
        info!(url = %mask_redis_url(url), node = %local.node(), "Connecting relay to Redis");

        let client = Client::open(url).map_err(|e| DeliveryError::Unavailable(e.to_string()))?;
        let conn = ConnectionManager::new(client.clone())
            .await
            .map_err(|e| DeliveryError::Unavailable(e.to_string()))?;

        let channel = node_channel(prefix, local.node());
        let listener = tokio::spawn(listen(client, channel, local.clone()));

        Ok(Self {
            local,
            conn,
            prefix: prefix.to_string(),
            timeout,
            listener,
        })
    }
}

impl Drop for RedisRelay {
    fn drop(&mut self) {
        self.listener.abort();
    }
}

fn node_channel(prefix: &str, node: &str) -> String {
    format!("{prefix}node:{node}")
}

async fn listen(client: Client, channel: String, local: Arc<LocalDispatch>) {
    loop {
        match client.get_async_pubsub().await {
            Ok(mut pubsub) => {
                if let Err(e) = pubsub.subscribe(&channel).await {
                    warn!(channel = %channel, error = %e, "Relay subscribe failed");
                } else {
                    debug!(channel = %channel, "Relay listening");
                    let mut messages = pubsub.on_message();
                    while let Some(msg) = messages.next().await {
                        let bytes: Vec<u8> = match msg.get_payload() {
                            Ok(bytes) => bytes,
                            Err(e) => {
                                warn!(error = %e, "Unreadable relay payload");
                                continue;
                            }
                        };
                        match rmp_serde::from_slice::<RelayFrame>(&bytes) {
                            Ok(frame) => {
                                let (connection, envelope) = frame.into_parts();
                                let outcome = local.dispatch(&connection, Arc::new(envelope));
                                trace!(connection = %connection, ?outcome, "Relayed envelope");
                            }
                            Err(e) => warn!(error = %e, "Malformed relay frame"),
                        }
                    }
                    warn!(channel = %channel, "Relay connection lost");
                }
            }
            Err(e) => warn!(error = %e, "Relay cannot reach Redis"),
        }
        tokio::time::sleep(RECONNECT_DELAY).await;
    }
}

#[async_trait]
impl Delivery for RedisRelay {
    async fn deliver(
        &self,
        connection: &ConnectionId,
        envelope: Arc<Envelope>,
    ) -> Result<DeliveryOutcome, DeliveryError> {
        let Some(node) = connection.node() else {
            return Ok(DeliveryOutcome::Stale);
        };
        if node == self.local.node() {
            return Ok(self.local.dispatch(connection, envelope));
        }

        let frame = RelayFrame::new(connection, &envelope);
        let body =
            rmp_serde::to_vec_named(&frame).map_err(|e| DeliveryError::Encode(e.to_string()))?;
        let target = node_channel(&self.prefix, node);
        let mut conn = self.conn.clone();

        let receivers: i64 = tokio::time::timeout(self.timeout, conn.publish(&target, body))
            .await
            .map_err(|_| DeliveryError::Unavailable(format!("timed out after {:?}", self.timeout)))?
            .map_err(|e| DeliveryError::Unavailable(e.to_string()))?;

        // Nobody listening means the owning node is gone.
        if receivers > 0 {
            Ok(DeliveryOutcome::Delivered)
        } else {
            Ok(DeliveryOutcome::Stale)
        }
    }
}
