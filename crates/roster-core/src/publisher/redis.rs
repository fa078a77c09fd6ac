//! Publisher bridged through Redis pub/sub.
//!
//! Events are `PUBLISH`ed to `{prefix}events:{channel}`. Every process runs
//! one listener that pattern-subscribes to all event channels and hands what
//! it receives to its own [`LocalPublisher`], so subscribers anywhere in the
//! cluster see every event, including those published by their own process.

use super::{Event, EventHandler, EventPublisher, LocalPublisher, PublishError, Subscription};
use crate::store::redis::mask_redis_url;
use ::redis::aio::ConnectionManager;
use ::redis::{AsyncCommands, Client};
use async_trait::async_trait;
use futures_util::StreamExt;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

const RECONNECT_DELAY: Duration = Duration::from_secs(1);

pub struct RedisPublisher {
    conn: ConnectionManager,
    local: Arc<LocalPublisher>,
    prefix: String,
    timeout: Duration,
    listener: JoinHandle<()>,
}

impl std::fmt::Debug for RedisPublisher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisPublisher")
            .field("prefix", &self.prefix)
            .field("timeout", &self.timeout)
            .finish_non_exhaustive()
    }
}

impl RedisPublisher {
    /// Connect to Redis and start the event listener.
    ///
    /// # Errors
    ///
    /// Returns an error if the URL is invalid or the server is unreachable.
    pub async fn connect(url: &str, prefix: &str, timeout: Duration) -> Result<Self, PublishError> {
        info!(url = %mask_redis_url(url), "Connecting event publisher to Redis");

        let client = Client::open(url).map_err(|e| PublishError::Unavailable(e.to_string()))?;
        let conn = ConnectionManager::new(client.clone())
            .await
            .map_err(|e| PublishError::Unavailable(e.to_string()))?;

        let local = Arc::new(LocalPublisher::new());
        let pattern = format!("{prefix}events:*");
        let listener = tokio::spawn(listen(client, pattern, local.clone()));

        Ok(Self {
            conn,
            local,
            prefix: prefix.to_string(),
            timeout,
            listener,
        })
    }

    fn redis_channel(&self, channel: &str) -> String {
        format!("{}events:{channel}", self.prefix)
    }
}

impl Drop for RedisPublisher {
    fn drop(&mut self) {
        self.listener.abort();
    }
}

async fn listen(client: Client, pattern: String, local: Arc<LocalPublisher>) {
    loop {
        match client.get_async_pubsub().await {
            Ok(mut pubsub) => {
                if let Err(e) = pubsub.psubscribe(&pattern).await {
                    warn!(pattern = %pattern, error = %e, "Event listener subscribe failed");
                } else {
                    debug!(pattern = %pattern, "Event listener subscribed");
                    let mut messages = pubsub.on_message();
                    while let Some(msg) = messages.next().await {
                        let payload: Vec<u8> = match msg.get_payload() {
                            Ok(payload) => payload,
                            Err(e) => {
                                warn!(error = %e, "Unreadable event payload");
                                continue;
                            }
                        };
                        match serde_json::from_slice::<Event>(&payload) {
                            Ok(event) => {
                                local.deliver(event);
                            }
                            Err(e) => warn!(error = %e, "Malformed event on broker"),
                        }
                    }
                    warn!(pattern = %pattern, "Event listener connection lost");
                }
            }
            Err(e) => warn!(error = %e, "Event listener cannot reach Redis"),
        }
        tokio::time::sleep(RECONNECT_DELAY).await;
    }
}

#[async_trait]
impl EventPublisher for RedisPublisher {
    async fn publish(
        &self,
        channel: &str,
        name: &str,
        payload: serde_json::Value,
    ) -> Result<(), PublishError> {
        let body = serde_json::to_string(&Event::new(channel, name, payload))?;
        let mut conn = self.conn.clone();
        let target = self.redis_channel(channel);

        let receivers: i64 = tokio::time::timeout(self.timeout, conn.publish(&target, body))
            .await
            .map_err(|_| PublishError::Timeout(self.timeout))?
            .map_err(|e| PublishError::Unavailable(e.to_string()))?;

        debug!(channel = %channel, event = %name, receivers, "Published event to broker");
        Ok(())
    }

    fn subscribe(
        &self,
        channel: &str,
        name: &str,
        handler: Arc<dyn EventHandler>,
    ) -> Subscription {
        self.local.subscribe(channel, name, handler)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::publisher::{HandlerError, ANY_EVENT};
    use std::time::{SystemTime, UNIX_EPOCH};

    fn redis_url() -> String {
        std::env::var("REDIS_URL").unwrap_or_else(|_| "redis://127.0.0.1:6379".to_string())
    }

    fn unique_prefix() -> String {
        let nanos = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap()
            .as_nanos();
        format!("roster-test:{nanos:x}:")
    }

    #[tokio::test]
    #[ignore = "needs a Redis server at REDIS_URL"]
    async fn test_events_cross_processes() {
        let prefix = unique_prefix();
        let timeout = Duration::from_secs(2);
        let sender = RedisPublisher::connect(&redis_url(), &prefix, timeout)
            .await
            .unwrap();
        let receiver = RedisPublisher::connect(&redis_url(), &prefix, timeout)
            .await
            .unwrap();

        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        let handler: Arc<dyn EventHandler> = Arc::new(move |event: &Event| -> Result<(), HandlerError> {
            tx.send(event.clone())?;
            Ok(())
        });
        let _subscription = receiver.subscribe("presence:user", ANY_EVENT, handler);

        // The listener subscribes in the background; publish until it hears.
        let mut received = None;
        for _ in 0..50 {
            sender
                .publish("presence:user", "online", serde_json::json!({ "id": "alice" }))
                .await
                .unwrap();
            if let Ok(event) = tokio::time::timeout(Duration::from_millis(50), rx.recv()).await {
                received = event;
                break;
            }
        }

        let event = received.unwrap();
        assert_eq!(event.channel, "presence:user");
        assert_eq!(event.name, "online");
        assert_eq!(event.payload["id"], "alice");
    }
}
