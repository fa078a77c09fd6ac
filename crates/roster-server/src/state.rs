//! Shared server state and its assembly from configuration.

use crate::auth::JwtAuthenticator;
use crate::config::{Config, StoreBackend};
use crate::metrics;
use anyhow::{Context, Result};
use roster_core::publisher::{HandlerError, RedisPublisher, ANY_EVENT};
use roster_core::store::RedisStore;
use roster_core::{
    ConnectionGateway, Delivery, Event, EventHandler, EventPublisher, FanoutEmitter,
    LifecycleChannels, LifecycleEvent, LocalDispatch, LocalPublisher, MemoryStore,
    PresenceLifecycle, PresenceRegistry, PresenceStore, RedisRelay, RegistryConfig, Subscription,
};
use std::sync::Arc;
use tokio::sync::Semaphore;
use tracing::{info, warn};

/// Shared server state.
pub struct AppState {
    pub config: Config,
    pub registry: Arc<PresenceRegistry>,
    pub publisher: Arc<dyn EventPublisher>,
    pub lifecycle: Arc<PresenceLifecycle>,
    pub gateway: ConnectionGateway,
    /// Outbound queues of connections served by this process.
    pub dispatch: Arc<LocalDispatch>,
    pub emitter: FanoutEmitter,
    /// One permit per open WebSocket, bounded by `limits.max_connections`.
    pub connection_slots: Arc<Semaphore>,
    _observers: Vec<Subscription>,
}

impl AppState {
    /// Connect the configured backends and wire the core components.
    ///
    /// # Errors
    ///
    /// Returns an error if a backend cannot be reached.
    pub async fn build(config: Config) -> Result<Self> {
        let timeout = config.store.timeout();
        let prefix = config.store.key_prefix.clone();
        let dispatch = Arc::new(LocalDispatch::with_capacity(
            config.node().to_string(),
            config.limits.outbound_queue,
        ));

        let (store, publisher, delivery) = match config.store.backend {
            StoreBackend::Memory => {
                info!("Using in-memory presence store");
                let store: Arc<dyn PresenceStore> = Arc::new(MemoryStore::new());
                let publisher: Arc<dyn EventPublisher> = Arc::new(LocalPublisher::new());
                let delivery: Arc<dyn Delivery> = dispatch.clone();
                (store, publisher, delivery)
            }
            StoreBackend::Redis => {
                let url = &config.store.url;
                let store: Arc<dyn PresenceStore> = Arc::new(
                    RedisStore::connect(url)
                        .await
                        .context("Failed to connect presence store")?,
                );
                let publisher: Arc<dyn EventPublisher> = Arc::new(
                    RedisPublisher::connect(url, &prefix, timeout)
                        .await
                        .context("Failed to connect event publisher")?,
                );
                let delivery: Arc<dyn Delivery> = Arc::new(
                    RedisRelay::connect(url, &prefix, timeout, dispatch.clone())
                        .await
                        .context("Failed to connect relay")?,
                );
                (store, publisher, delivery)
            }
        };

        let registry = Arc::new(PresenceRegistry::with_config(
            store,
            RegistryConfig {
                key_prefix: prefix,
                timeout,
            },
        ));

        let channels = LifecycleChannels {
            user: config.channels.user.clone(),
            performer: config.channels.performer.clone(),
        };
        let observers = vec![
            publisher.subscribe(&channels.user, ANY_EVENT, observer()),
            publisher.subscribe(&channels.performer, ANY_EVENT, observer()),
        ];

        let lifecycle = Arc::new(PresenceLifecycle::new(
            registry.clone(),
            publisher.clone(),
            channels,
            timeout,
        ));

        let gateway = ConnectionGateway::new(
            Arc::new(JwtAuthenticator::new(
                &config.auth.secret,
                config.auth.leeway_secs,
            )),
            lifecycle.clone(),
            config.auth.timeout(),
        );
        let emitter = FanoutEmitter::new(registry.clone(), delivery);
        let connection_slots = Arc::new(Semaphore::new(max_connections(&config)));

        Ok(Self {
            config,
            registry,
            publisher,
            lifecycle,
            gateway,
            dispatch,
            emitter,
            connection_slots,
            _observers: observers,
        })
    }

    /// WebSockets currently open on this process.
    #[must_use]
    pub fn open_connections(&self) -> usize {
        max_connections(&self.config) - self.connection_slots.available_permits()
    }

    /// Clear presence left behind by an earlier run of this node. Skipped
    /// for generated node ids, which no earlier run can have used.
    pub async fn reclaim(&self) {
        let node = self.config.node();
        if !self.config.has_stable_node() {
            info!(node = %node, "Generated node id, nothing to reclaim");
            return;
        }
        match self.lifecycle.reclaim_node(node).await {
            Ok(offline) if offline.is_empty() => {}
            Ok(offline) => {
                info!(node = %node, count = offline.len(), "Reclaimed stale presence");
            }
            Err(e) => warn!(node = %node, error = %e, "Could not reclaim stale presence"),
        }
    }
}

fn max_connections(config: &Config) -> usize {
    config.limits.max_connections.min(Semaphore::MAX_PERMITS)
}

/// Logs and counts every lifecycle event seen on a channel.
fn observer() -> Arc<dyn EventHandler> {
    Arc::new(|event: &Event| -> Result<(), HandlerError> {
        let lifecycle: LifecycleEvent = serde_json::from_value(event.payload.clone())?;
        metrics::record_transition(lifecycle.identity.kind, lifecycle.transition);
        info!(
            channel = %event.channel,
            identity = %lifecycle.identity,
            transition = lifecycle.transition.event_name(),
            "Presence changed"
        );
        Ok(())
    })
}
