//! Named-channel publish/subscribe.
//!
//! Publishing is fire-and-forget: no acknowledgment, no retry, no
//! persistence. Subscribers that were not attached at publish time never
//! see the event. Each subscription runs in its own task, so a slow, failing
//! or panicking handler never affects delivery to the others.

use crate::message::now_millis;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::task::JoinHandle;

pub mod local;
#[cfg(feature = "redis")]
pub mod redis;

pub use local::LocalPublisher;
#[cfg(feature = "redis")]
pub use self::redis::RedisPublisher;

/// Event name that matches every event on a channel.
pub const ANY_EVENT: &str = "*";

/// Error returned by an [`EventHandler`].
pub type HandlerError = Box<dyn std::error::Error + Send + Sync>;

/// Publish errors.
#[derive(Debug, Error)]
pub enum PublishError {
    #[error("Broker unavailable: {0}")]
    Unavailable(String),

    #[error("Publish timed out after {0:?}")]
    Timeout(Duration),

    #[error("Failed to encode event: {0}")]
    Encode(#[from] serde_json::Error),
}

/// A published event as seen by subscribers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    pub channel: String,
    pub name: String,
    pub payload: serde_json::Value,
    /// Milliseconds since the Unix epoch.
    pub published_at: u64,
}

impl Event {
    #[must_use]
    pub fn new(
        channel: impl Into<String>,
        name: impl Into<String>,
        payload: serde_json::Value,
    ) -> Self {
        Self {
            channel: channel.into(),
            name: name.into(),
            payload,
            published_at: now_millis(),
        }
    }

    fn matches(&self, name: &str) -> bool {
        name == ANY_EVENT || self.name == name
    }
}

/// Reacts to published events.
#[async_trait]
pub trait EventHandler: Send + Sync + 'static {
    async fn handle(&self, event: &Event) -> Result<(), HandlerError>;
}

#[async_trait]
impl<F> EventHandler for F
where
    F: Fn(&Event) -> Result<(), HandlerError> + Send + Sync + 'static,
{
    async fn handle(&self, event: &Event) -> Result<(), HandlerError> {
        (self)(event)
    }
}

/// A live subscription. Stays active until cancelled or the publisher
/// shuts down; dropping the value does not cancel it.
#[derive(Debug)]
pub struct Subscription {
    channel: String,
    name: String,
    task: JoinHandle<()>,
}

impl Subscription {
    pub(crate) fn new(channel: &str, name: &str, task: JoinHandle<()>) -> Self {
        Self {
            channel: channel.to_string(),
            name: name.to_string(),
            task,
        }
    }

    #[must_use]
    pub fn channel(&self) -> &str {
        &self.channel
    }

    #[must_use]
    pub fn event_name(&self) -> &str {
        &self.name
    }

    #[must_use]
    pub fn is_active(&self) -> bool {
        !self.task.is_finished()
    }

    pub fn cancel(self) {
        self.task.abort();
    }
}

/// Channel-based event broadcast.
#[async_trait]
pub trait EventPublisher: Send + Sync {
    /// Broadcast to every current subscriber of `channel` interested in `name`.
    ///
    /// Publishing with no subscribers is a silent no-op.
    async fn publish(
        &self,
        channel: &str,
        name: &str,
        payload: serde_json::Value,
    ) -> Result<(), PublishError>;

    /// Invoke `handler` for every later publish matching `channel` and
    /// `name` ([`ANY_EVENT`] matches all names). Must be called from within
    /// a Tokio runtime.
    fn subscribe(&self, channel: &str, name: &str, handler: Arc<dyn EventHandler>)
        -> Subscription;
}
