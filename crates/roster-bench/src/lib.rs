//! Shared fixtures for the roster benchmarks.

use async_trait::async_trait;
use roster_core::{
    AuthError, Authenticator, Claims, ConnectionGateway, Identity, LifecycleChannels,
    LocalPublisher, MemoryStore, Principal, PresenceLifecycle, PresenceRegistry,
};
use std::sync::Arc;
use std::time::Duration;

/// Accepts any credential and treats it as a user id.
pub struct TrustingAuthenticator;

#[async_trait]
impl Authenticator for TrustingAuthenticator {
    async fn verify(&self, credential: &str) -> Result<Principal, AuthError> {
        Ok(Principal {
            identity: Identity::user(credential),
            claims: Claims::default(),
        })
    }
}

/// Registry over a fresh in-memory store.
#[must_use]
pub fn memory_registry() -> Arc<PresenceRegistry> {
    Arc::new(PresenceRegistry::new(Arc::new(MemoryStore::new())))
}

/// Gateway wired to `registry` and a local publisher.
#[must_use]
pub fn gateway(registry: Arc<PresenceRegistry>) -> ConnectionGateway {
    let lifecycle = PresenceLifecycle::new(
        registry,
        Arc::new(LocalPublisher::new()),
        LifecycleChannels::default(),
        Duration::from_secs(1),
    );
    ConnectionGateway::new(
        Arc::new(TrustingAuthenticator),
        Arc::new(lifecycle),
        Duration::from_secs(1),
    )
}

/// Single-threaded runtime for driving async code from criterion.
///
/// # Panics
///
/// Panics if the runtime cannot be built.
#[must_use]
pub fn runtime() -> tokio::runtime::Runtime {
    tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .expect("failed to build benchmark runtime")
}
