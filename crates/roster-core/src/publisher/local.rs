//! In-process publisher built on Tokio broadcast channels.

use super::{Event, EventHandler, EventPublisher, PublishError, Subscription};
use async_trait::async_trait;
use dashmap::DashMap;
use futures_util::FutureExt;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{debug, error, trace, warn};

/// Default broadcast capacity per channel.
const DEFAULT_CHANNEL_CAPACITY: usize = 1024;

/// Delivers events to subscribers of the same process.
#[derive(Debug)]
pub struct LocalPublisher {
    channels: DashMap<String, broadcast::Sender<Arc<Event>>>,
    capacity: usize,
}

impl LocalPublisher {
    #[must_use]
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_CHANNEL_CAPACITY)
    }

    /// A subscriber that falls more than `capacity` events behind loses the
    /// oldest ones.
    #[must_use]
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            channels: DashMap::new(),
            capacity,
        }
    }

    /// Hand an already built event to local subscribers.
    ///
    /// Returns the number of subscriptions on the event's channel.
    pub fn deliver(&self, event: Event) -> usize {
        match self.channels.get(&event.channel) {
            Some(sender) => {
                let channel = event.channel.clone();
                let count = sender.send(Arc::new(event)).unwrap_or_default();
                trace!(channel = %channel, subscribers = count, "Delivered event");
                count
            }
            None => 0,
        }
    }

    /// Number of subscriptions attached to `channel`.
    #[must_use]
    pub fn subscriber_count(&self, channel: &str) -> usize {
        self.channels
            .get(channel)
            .map(|sender| sender.receiver_count())
            .unwrap_or(0)
    }

    fn sender(&self, channel: &str) -> broadcast::Sender<Arc<Event>> {
        self.channels
            .entry(channel.to_string())
            .or_insert_with(|| broadcast::channel(self.capacity).0)
            .clone()
    }
}

impl Default for LocalPublisher {
    fn default() -> Self {
        Self::new()
    }
}

async fn invoke(handler: &dyn EventHandler, event: &Event) {
    match AssertUnwindSafe(handler.handle(event)).catch_unwind().await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => {
            warn!(channel = %event.channel, event = %event.name, error = %e, "Event handler failed");
        }
        Err(_) => {
            error!(channel = %event.channel, event = %event.name, "Event handler panicked");
        }
    }
}

#[async_trait]
impl EventPublisher for LocalPublisher {
    async fn publish(
        &self,
        channel: &str,
        name: &str,
        payload: serde_json::Value,
    ) -> Result<(), PublishError> {
        self.deliver(Event::new(channel, name, payload));
        Ok(())
    }

    fn subscribe(
        &self,
        channel: &str,
        name: &str,
        handler: Arc<dyn EventHandler>,
    ) -> Subscription {
        let mut receiver = self.sender(channel).subscribe();
        let filter = name.to_string();
        let channel_name = channel.to_string();

        let task = tokio::spawn(async move {
            loop {
                match receiver.recv().await {
                    Ok(event) => {
                        if event.matches(&filter) {
                            invoke(handler.as_ref(), &event).await;
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!(channel = %channel_name, skipped, "Subscriber lagged, events dropped");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
            debug!(channel = %channel_name, "Subscription ended");
        });

        debug!(channel = %channel, event = %name, "Subscribed");
        Subscription::new(channel, name, task)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::publisher::{HandlerError, ANY_EVENT};
    use serde_json::json;
    use std::time::Duration;
    use tokio::sync::mpsc;

    fn forwarding(tx: mpsc::UnboundedSender<Event>) -> Arc<dyn EventHandler> {
        Arc::new(move |event: &Event| -> Result<(), HandlerError> {
            tx.send(event.clone())?;
            Ok(())
        })
    }

    async fn next(rx: &mut mpsc::UnboundedReceiver<Event>) -> Event {
        tokio::time::timeout(Duration::from_secs(1), rx.recv())
            .await
            .expect("event not delivered")
            .expect("handler channel closed")
    }

    #[tokio::test]
    async fn test_publish_without_subscribers_is_noop() {
        let publisher = LocalPublisher::new();
        publisher
            .publish("presence:user", "online", json!({}))
            .await
            .unwrap();
        assert_eq!(publisher.subscriber_count("presence:user"), 0);
    }

    #[tokio::test]
    async fn test_subscribers_filter_by_event_name() {
        let publisher = LocalPublisher::new();
        let (online_tx, mut online_rx) = mpsc::unbounded_channel();
        let (all_tx, mut all_rx) = mpsc::unbounded_channel();

        let _online = publisher.subscribe("presence:user", "online", forwarding(online_tx));
        let _all = publisher.subscribe("presence:user", ANY_EVENT, forwarding(all_tx));

        publisher
            .publish("presence:user", "offline", json!({"id": 1}))
            .await
            .unwrap();
        publisher
            .publish("presence:user", "online", json!({"id": 2}))
            .await
            .unwrap();

        assert_eq!(next(&mut online_rx).await.payload, json!({"id": 2}));
        assert_eq!(next(&mut all_rx).await.name, "offline");
        assert_eq!(next(&mut all_rx).await.name, "online");
    }

    #[tokio::test]
    async fn test_failing_handlers_are_isolated() {
        let publisher = LocalPublisher::new();
        let (tx, mut rx) = mpsc::unbounded_channel();

        let failing: Arc<dyn EventHandler> =
            Arc::new(|_: &Event| -> Result<(), HandlerError> { Err("boom".into()) });
        let panicking: Arc<dyn EventHandler> =
            Arc::new(|_: &Event| -> Result<(), HandlerError> { panic!("handler bug") });

        let _failing = publisher.subscribe("c", "e", failing);
        let panicking = publisher.subscribe("c", "e", panicking);
        let _ok = publisher.subscribe("c", "e", forwarding(tx));

        publisher.publish("c", "e", json!(1)).await.unwrap();
        publisher.publish("c", "e", json!(2)).await.unwrap();

        assert_eq!(next(&mut rx).await.payload, json!(1));
        assert_eq!(next(&mut rx).await.payload, json!(2));
        assert!(panicking.is_active());
    }

    #[tokio::test]
    async fn test_cancelled_subscription_stops_receiving() {
        let publisher = LocalPublisher::new();
        let (tx, mut rx) = mpsc::unbounded_channel();

        let subscription = publisher.subscribe("c", "e", forwarding(tx));
        assert_eq!(subscription.channel(), "c");
        subscription.cancel();
        tokio::task::yield_now().await;

        publisher.publish("c", "e", json!(1)).await.unwrap();
        assert!(rx.recv().await.is_none());
    }
}
