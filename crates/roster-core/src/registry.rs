//! Presence registry.
//!
//! Maps each identity to the set of its live connection ids, held in the
//! shared store so every server process sees the same picture. The store is
//! the only source of truth: the registry keeps no in-process copy, and the
//! first-connection / last-disconnection edges are read straight off the
//! result of one atomic store operation.

use crate::identity::{ConnectionId, Identity, PrincipalKind};
use crate::store::{PresenceStore, StoreError};
use std::collections::HashSet;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, warn};

/// Registry errors.
#[derive(Debug, Error)]
pub enum RegistryError {
    /// The shared store failed or did not answer in time.
    #[error("Store unavailable during {operation}: {reason}")]
    StoreUnavailable {
        operation: &'static str,
        reason: String,
    },
}

/// Registry configuration.
#[derive(Debug, Clone)]
pub struct RegistryConfig {
    /// Prefix applied to every key the registry writes.
    pub key_prefix: String,
    /// Upper bound on every store call.
    pub timeout: Duration,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            key_prefix: "roster:".to_string(),
            timeout: Duration::from_secs(2),
        }
    }
}

/// Outcome of [`PresenceRegistry::register`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Registration {
    /// The identity had no live connection immediately before this call.
    pub first_connection: bool,
}

/// Outcome of [`PresenceRegistry::unregister`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Unregistration {
    /// The connection was registered until this call.
    pub removed: bool,
    /// Live connections left for the identity.
    pub remaining: usize,
}

impl Unregistration {
    /// This call removed the identity's last connection.
    #[must_use]
    pub fn was_last(&self) -> bool {
        self.removed && self.remaining == 0
    }
}

pub struct PresenceRegistry {
    store: Arc<dyn PresenceStore>,
    config: RegistryConfig,
}

impl PresenceRegistry {
    #[must_use]
    pub fn new(store: Arc<dyn PresenceStore>) -> Self {
        Self::with_config(store, RegistryConfig::default())
    }

    #[must_use]
    pub fn with_config(store: Arc<dyn PresenceStore>, config: RegistryConfig) -> Self {
        Self { store, config }
    }

    fn entry_key(&self, identity: &Identity) -> String {
        format!(
            "{}presence:{}:{}",
            self.config.key_prefix, identity.kind, identity.id
        )
    }

    fn online_key(&self) -> String {
        format!("{}online", self.config.key_prefix)
    }

    async fn bounded<T>(
        &self,
        operation: &'static str,
        call: impl Future<Output = Result<T, StoreError>>,
    ) -> Result<T, RegistryError> {
        match tokio::time::timeout(self.config.timeout, call).await {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(e)) => {
                warn!(operation, error = %e, "Presence store call failed");
                Err(RegistryError::StoreUnavailable {
                    operation,
                    reason: e.to_string(),
                })
            }
            Err(_) => {
                warn!(operation, timeout = ?self.config.timeout, "Presence store call timed out");
                Err(RegistryError::StoreUnavailable {
                    operation,
                    reason: format!("timed out after {:?}", self.config.timeout),
                })
            }
        }
    }

    /// Add `connection` to the live set of `identity` and mark it online.
    ///
    /// Registering the same pair twice leaves the state unchanged and reports
    /// `first_connection = false` the second time.
    ///
    /// # Errors
    ///
    /// Returns an error if the store is unreachable or times out.
    pub async fn register(
        &self,
        identity: &Identity,
        connection: &ConnectionId,
    ) -> Result<Registration, RegistryError> {
        let entry_key = self.entry_key(identity);
        let online_key = self.online_key();
        let member = identity.to_string();

        let attached = self
            .bounded(
                "register",
                self.store
                    .attach(&entry_key, &online_key, &member, connection.as_str()),
            )
            .await?;

        let registration = Registration {
            first_connection: attached.added && attached.size == 1,
        };

        debug!(
            identity = %identity,
            connection = %connection,
            connections = attached.size,
            first = registration.first_connection,
            "Registered connection"
        );

        Ok(registration)
    }

    /// Remove `connection` from the live set of `identity`. When the set
    /// becomes empty the identity also leaves the online set.
    ///
    /// # Errors
    ///
    /// Returns an error if the store is unreachable or times out.
    pub async fn unregister(
        &self,
        identity: &Identity,
        connection: &ConnectionId,
    ) -> Result<Unregistration, RegistryError> {
        let entry_key = self.entry_key(identity);
        let online_key = self.online_key();
        let member = identity.to_string();

        let detached = self
            .bounded(
                "unregister",
                self.store
                    .detach(&entry_key, &online_key, &member, connection.as_str()),
            )
            .await?;

        let outcome = Unregistration {
            removed: detached.removed,
            remaining: detached.remaining,
        };

        debug!(
            identity = %identity,
            connection = %connection,
            remaining = outcome.remaining,
            last = outcome.was_last(),
            "Unregistered connection"
        );

        Ok(outcome)
    }

    /// Snapshot of the live connections of `identity`.
    ///
    /// May be stale by the time the caller acts on it.
    ///
    /// # Errors
    ///
    /// Returns an error if the store is unreachable or times out.
    pub async fn list_connections(
        &self,
        identity: &Identity,
    ) -> Result<HashSet<ConnectionId>, RegistryError> {
        let entry_key = self.entry_key(identity);
        let members = self
            .bounded("list_connections", self.store.members(&entry_key))
            .await?;
        Ok(members.into_iter().map(ConnectionId::from).collect())
    }

    /// # Errors
    ///
    /// Returns an error if the store is unreachable or times out.
    pub async fn is_online(&self, identity: &Identity) -> Result<bool, RegistryError> {
        let online_key = self.online_key();
        let member = identity.to_string();
        self.bounded("is_online", self.store.contains(&online_key, &member))
            .await
    }

    /// Identities currently online, optionally restricted to one kind.
    ///
    /// Members of the online set that do not parse as identities are skipped.
    ///
    /// # Errors
    ///
    /// Returns an error if the store is unreachable or times out.
    pub async fn online_identities(
        &self,
        kind: Option<PrincipalKind>,
    ) -> Result<Vec<Identity>, RegistryError> {
        let online_key = self.online_key();
        let members = self
            .bounded("online_identities", self.store.members(&online_key))
            .await?;

        let mut identities: Vec<Identity> = members
            .iter()
            .filter_map(|member| match member.parse::<Identity>() {
                Ok(identity) => Some(identity),
                Err(e) => {
                    warn!(member = %member, error = %e, "Skipping malformed online member");
                    None
                }
            })
            .filter(|identity| kind.map_or(true, |k| identity.kind == k))
            .collect();
        identities.sort();
        Ok(identities)
    }

    /// Remove every connection owned by `node` and return the identities
    /// that went offline as a result.
    ///
    /// Used when a process restarts under the same node id: whatever its
    /// previous incarnation left registered can no longer be delivered to.
    ///
    /// # Errors
    ///
    /// Returns an error if the store is unreachable or times out.
    pub async fn reclaim_node(&self, node: &str) -> Result<Vec<Identity>, RegistryError> {
        let mut went_offline = Vec::new();

        for identity in self.online_identities(None).await? {
            let stale: Vec<ConnectionId> = self
                .list_connections(&identity)
                .await?
                .into_iter()
                .filter(|connection| connection.node() == Some(node))
                .collect();

            for connection in stale {
                if self.unregister(&identity, &connection).await?.was_last() {
                    went_offline.push(identity.clone());
                }
            }
        }

        if !went_offline.is_empty() {
            debug!(node, count = went_offline.len(), "Reclaimed stale presence");
        }
        Ok(went_offline)
    }

    /// # Errors
    ///
    /// Returns an error if the store is unreachable or times out.
    pub async fn health_check(&self) -> Result<(), RegistryError> {
        self.bounded("health_check", self.store.ping()).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{Attached, Detached, MemoryStore};
    use async_trait::async_trait;
    use proptest::prelude::*;

    fn registry() -> PresenceRegistry {
        PresenceRegistry::new(Arc::new(MemoryStore::new()))
    }

    #[tokio::test]
    async fn test_register_twice_is_idempotent() {
        let registry = registry();
        let alice = Identity::user("alice");
        let conn = ConnectionId::new("n1/c1");

        assert!(registry.register(&alice, &conn).await.unwrap().first_connection);
        assert!(!registry.register(&alice, &conn).await.unwrap().first_connection);
        assert_eq!(registry.list_connections(&alice).await.unwrap().len(), 1);
        assert!(registry.is_online(&alice).await.unwrap());
    }

    #[tokio::test]
    async fn test_last_disconnect_edge() {
        let registry = registry();
        let alice = Identity::user("alice");
        let c1 = ConnectionId::new("n1/c1");
        let c2 = ConnectionId::new("n2/c2");

        registry.register(&alice, &c1).await.unwrap();
        assert!(!registry.register(&alice, &c2).await.unwrap().first_connection);

        let first = registry.unregister(&alice, &c1).await.unwrap();
        assert_eq!(first.remaining, 1);
        assert!(!first.was_last());
        assert!(registry.is_online(&alice).await.unwrap());

        let last = registry.unregister(&alice, &c2).await.unwrap();
        assert!(last.was_last());
        assert!(!registry.is_online(&alice).await.unwrap());

        let again = registry.unregister(&alice, &c2).await.unwrap();
        assert!(!again.removed);
        assert!(!again.was_last());
    }

    #[tokio::test]
    async fn test_identities_are_isolated_by_kind() {
        let registry = registry();
        let user = Identity::user("7");
        let performer = Identity::performer("7");

        registry
            .register(&performer, &ConnectionId::new("n1/p"))
            .await
            .unwrap();

        assert!(registry.is_online(&performer).await.unwrap());
        assert!(!registry.is_online(&user).await.unwrap());
        assert_eq!(
            registry
                .online_identities(Some(PrincipalKind::Performer))
                .await
                .unwrap(),
            vec![performer]
        );
        assert!(registry
            .online_identities(Some(PrincipalKind::User))
            .await
            .unwrap()
            .is_empty());
    }

    #[tokio::test]
    async fn test_concurrent_edges_are_exclusive() {
        let registry = Arc::new(registry());
        let alice = Identity::user("alice");
        let connections: Vec<ConnectionId> = (0..32)
            .map(|i| ConnectionId::new(format!("n{}/c{i}", i % 3)))
            .collect();

        let registrations =
            futures_util::future::join_all(connections.iter().map(|connection| {
                let registry = registry.clone();
                let alice = alice.clone();
                let connection = connection.clone();
                tokio::spawn(async move { registry.register(&alice, &connection).await })
            }))
            .await;
        let firsts = registrations
            .into_iter()
            .filter(|r| r.as_ref().unwrap().as_ref().unwrap().first_connection)
            .count();
        assert_eq!(firsts, 1);

        let unregistrations =
            futures_util::future::join_all(connections.iter().map(|connection| {
                let registry = registry.clone();
                let alice = alice.clone();
                let connection = connection.clone();
                tokio::spawn(async move { registry.unregister(&alice, &connection).await })
            }))
            .await;
        let lasts = unregistrations
            .into_iter()
            .filter(|r| r.as_ref().unwrap().as_ref().unwrap().was_last())
            .count();
        assert_eq!(lasts, 1);
        assert!(!registry.is_online(&alice).await.unwrap());
    }

    #[tokio::test]
    async fn test_reclaim_node() {
        let registry = registry();
        let alice = Identity::user("alice");
        let bob = Identity::performer("bob");

        registry.register(&alice, &ConnectionId::new("old/1")).await.unwrap();
        registry.register(&alice, &ConnectionId::new("other/2")).await.unwrap();
        registry.register(&bob, &ConnectionId::new("old/3")).await.unwrap();

        let offline = registry.reclaim_node("old").await.unwrap();
        assert_eq!(offline, vec![bob.clone()]);
        assert!(registry.is_online(&alice).await.unwrap());
        assert!(!registry.is_online(&bob).await.unwrap());
    }

    struct StalledStore;

    #[async_trait]
    impl PresenceStore for StalledStore {
        async fn attach(&self, _: &str, _: &str, _: &str, _: &str) -> Result<Attached, StoreError> {
            std::future::pending().await
        }

        async fn detach(&self, _: &str, _: &str, _: &str, _: &str) -> Result<Detached, StoreError> {
            Err(StoreError::Unavailable("connection refused".into()))
        }

        async fn members(&self, _: &str) -> Result<Vec<String>, StoreError> {
            std::future::pending().await
        }

        async fn contains(&self, _: &str, _: &str) -> Result<bool, StoreError> {
            std::future::pending().await
        }

        async fn ping(&self) -> Result<(), StoreError> {
            std::future::pending().await
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_store_timeout_surfaces() {
        let registry = PresenceRegistry::with_config(
            Arc::new(StalledStore),
            RegistryConfig {
                key_prefix: String::new(),
                timeout: Duration::from_millis(50),
            },
        );
        let alice = Identity::user("alice");
        let conn = ConnectionId::new("n/1");

        assert!(matches!(
            registry.register(&alice, &conn).await,
            Err(RegistryError::StoreUnavailable { operation: "register", .. })
        ));
        assert!(matches!(
            registry.unregister(&alice, &conn).await,
            Err(RegistryError::StoreUnavailable { operation: "unregister", .. })
        ));
        assert!(registry.health_check().await.is_err());
    }

    #[derive(Debug, Clone)]
    enum Op {
        Register(u8, u8),
        Unregister(u8, u8),
    }

    fn op() -> impl Strategy<Value = Op> {
        prop_oneof![
            (0u8..4, 0u8..6).prop_map(|(i, c)| Op::Register(i, c)),
            (0u8..4, 0u8..6).prop_map(|(i, c)| Op::Unregister(i, c)),
        ]
    }

    proptest! {
        #[test]
        fn prop_online_iff_connections(ops in proptest::collection::vec(op(), 0..64)) {
            let rt = tokio::runtime::Builder::new_current_thread()
                .enable_all()
                .build()
                .unwrap();

            rt.block_on(async {
                let registry = registry();
                for op in &ops {
                    match op {
                        Op::Register(i, c) => {
                            registry
                                .register(&Identity::user(i.to_string()), &ConnectionId::new(format!("n/{c}")))
                                .await
                                .unwrap();
                        }
                        Op::Unregister(i, c) => {
                            registry
                                .unregister(&Identity::user(i.to_string()), &ConnectionId::new(format!("n/{c}")))
                                .await
                                .unwrap();
                        }
                    }

                    for i in 0u8..4 {
                        let identity = Identity::user(i.to_string());
                        let online = registry.is_online(&identity).await.unwrap();
                        let connections = registry.list_connections(&identity).await.unwrap();
                        assert_eq!(online, !connections.is_empty());
                    }
                }
            });
        }
    }
}
