//! Connection gateway.
//!
//! Drives each connection through `Unauthenticated -> Authenticated ->
//! Closed`, independent of the transport carrying it. The transport calls
//! [`GatewayConnection::login`], [`GatewayConnection::logout`] and
//! [`GatewayConnection::close`]; presence bookkeeping happens behind the
//! [`ConnectionLifecycleHandler`] seam so it can be exercised without a
//! socket.
//!
//! ```text
//!  accept ──▶ Unauthenticated ──login──▶ Authenticated ──close──▶ Closed
//!                    ▲                        │
//!                    └─────────logout─────────┘
//! ```

use crate::identity::{Claims, ConnectionHandle, ConnectionId, Identity};
use crate::lifecycle::{LifecycleChannels, LifecycleEvent};
use crate::publisher::EventPublisher;
use crate::registry::{PresenceRegistry, RegistryError};
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info, warn};

/// Credential verification failures.
#[derive(Debug, Error)]
pub enum AuthError {
    #[error("Invalid credential: {0}")]
    Invalid(String),

    #[error("Credential expired")]
    Expired,

    #[error("Authentication timed out after {0:?}")]
    Timeout(Duration),
}

/// Gateway errors.
#[derive(Debug, Error)]
pub enum GatewayError {
    #[error("Authentication failed: {0}")]
    Authentication(#[from] AuthError),

    #[error(transparent)]
    Registry(#[from] RegistryError),

    #[error("Connection is closed")]
    Closed,
}

/// What a verified credential resolves to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Principal {
    pub identity: Identity,
    pub claims: Claims,
}

/// Verifies bearer credentials. Must have no side effects visible to the
/// gateway.
#[async_trait]
pub trait Authenticator: Send + Sync {
    async fn verify(&self, credential: &str) -> Result<Principal, AuthError>;
}

/// Whether the lifecycle event for a transition reached the publisher.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Announcement {
    /// No edge, nothing to announce.
    NotRequired,
    Published,
    /// The edge was committed to the registry but the publish failed.
    Failed(String),
}

/// Result of a presence transition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Transition {
    /// First connection on login, last connection on logout or close.
    pub edge: bool,
    pub announcement: Announcement,
}

impl Transition {
    #[must_use]
    pub fn unchanged() -> Self {
        Self {
            edge: false,
            announcement: Announcement::NotRequired,
        }
    }
}

/// How a session is being ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Departure {
    /// First attempt to unregister the session.
    First,
    /// An earlier attempt failed after the store may have applied it.
    Retry,
}

/// Hooks a connection's lifecycle calls into.
#[async_trait]
pub trait ConnectionLifecycleHandler: Send + Sync {
    /// The connection just authenticated as `handle.identity`.
    ///
    /// An error means the login must fail. The store may still have applied
    /// the write, so the caller hands the handle to [`Self::on_abandoned`].
    async fn on_authenticated(&self, handle: &ConnectionHandle) -> Result<Transition, GatewayError>;

    /// The connection's session ended, by logout or transport close.
    async fn on_closed(
        &self,
        handle: &ConnectionHandle,
        departure: Departure,
    ) -> Result<Transition, GatewayError>;

    /// Withdraw a handle whose login failed. Never announces anything.
    async fn on_abandoned(&self, handle: &ConnectionHandle) -> Result<(), GatewayError>;
}

/// Registry-backed lifecycle: registers connections and announces the
/// online/offline edges the registry reports.
pub struct PresenceLifecycle {
    registry: Arc<PresenceRegistry>,
    publisher: Arc<dyn EventPublisher>,
    channels: LifecycleChannels,
    publish_timeout: Duration,
}

impl PresenceLifecycle {
    #[must_use]
    pub fn new(
        registry: Arc<PresenceRegistry>,
        publisher: Arc<dyn EventPublisher>,
        channels: LifecycleChannels,
        publish_timeout: Duration,
    ) -> Self {
        Self {
            registry,
            publisher,
            channels,
            publish_timeout,
        }
    }

    async fn announce(&self, event: LifecycleEvent) -> Announcement {
        let channel = self.channels.for_kind(event.identity.kind);
        let name = event.transition.event_name();
        let identity = event.identity.clone();

        let payload = match serde_json::to_value(&event) {
            Ok(payload) => payload,
            Err(e) => return Announcement::Failed(e.to_string()),
        };

        let outcome = tokio::time::timeout(
            self.publish_timeout,
            self.publisher.publish(channel, name, payload),
        )
        .await;

        match outcome {
            Ok(Ok(())) => {
                info!(identity = %identity, channel = %channel, event = name, "Presence transition");
                Announcement::Published
            }
            Ok(Err(e)) => {
                warn!(identity = %identity, event = name, error = %e, "Failed to publish transition");
                Announcement::Failed(e.to_string())
            }
            Err(_) => {
                warn!(identity = %identity, event = name, "Publishing transition timed out");
                Announcement::Failed(format!("timed out after {:?}", self.publish_timeout))
            }
        }
    }

    /// Drop whatever a previous run of `node` left registered and announce
    /// the identities that went offline because of it.
    ///
    /// # Errors
    ///
    /// Returns an error if the store is unreachable or times out.
    pub async fn reclaim_node(&self, node: &str) -> Result<Vec<Identity>, RegistryError> {
        let offline = self.registry.reclaim_node(node).await?;
        for identity in &offline {
            self.announce(LifecycleEvent::offline(identity.clone(), None))
                .await;
        }
        Ok(offline)
    }
}

fn claims_of(handle: &ConnectionHandle) -> Option<Claims> {
    (handle.claims != Claims::default()).then(|| handle.claims.clone())
}

#[async_trait]
impl ConnectionLifecycleHandler for PresenceLifecycle {
    async fn on_authenticated(&self, handle: &ConnectionHandle) -> Result<Transition, GatewayError> {
        let registration = self.registry.register(&handle.identity, &handle.id).await?;
        if !registration.first_connection {
            return Ok(Transition::unchanged());
        }

        let event = LifecycleEvent::online(handle.identity.clone(), claims_of(handle));
        Ok(Transition {
            edge: true,
            announcement: self.announce(event).await,
        })
    }

    async fn on_closed(
        &self,
        handle: &ConnectionHandle,
        departure: Departure,
    ) -> Result<Transition, GatewayError> {
        let outcome = self.registry.unregister(&handle.identity, &handle.id).await?;
        // A failed first attempt may already have removed the handle.
        let last = outcome.was_last() || (departure == Departure::Retry && outcome.remaining == 0);
        if !last {
            return Ok(Transition::unchanged());
        }

        let event = LifecycleEvent::offline(handle.identity.clone(), claims_of(handle));
        Ok(Transition {
            edge: true,
            announcement: self.announce(event).await,
        })
    }

    async fn on_abandoned(&self, handle: &ConnectionHandle) -> Result<(), GatewayError> {
        let outcome = self.registry.unregister(&handle.identity, &handle.id).await?;
        if outcome.removed {
            debug!(identity = %handle.identity, connection = %handle.id, "Withdrew abandoned registration");
        }
        Ok(())
    }
}

/// Observable state of a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Unauthenticated,
    Authenticated,
    Closed,
}

/// Successful login.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoginOutcome {
    pub handle: ConnectionHandle,
    pub transition: Transition,
}

/// Accepts connections and hands out their state machines.
#[derive(Clone)]
pub struct ConnectionGateway {
    authenticator: Arc<dyn Authenticator>,
    lifecycle: Arc<dyn ConnectionLifecycleHandler>,
    auth_timeout: Duration,
}

impl ConnectionGateway {
    #[must_use]
    pub fn new(
        authenticator: Arc<dyn Authenticator>,
        lifecycle: Arc<dyn ConnectionLifecycleHandler>,
        auth_timeout: Duration,
    ) -> Self {
        Self {
            authenticator,
            lifecycle,
            auth_timeout,
        }
    }

    /// Start tracking a freshly accepted connection.
    #[must_use]
    pub fn accept(&self, id: ConnectionId) -> GatewayConnection {
        debug!(connection = %id, "Connection accepted");
        GatewayConnection {
            id,
            gateway: self.clone(),
            sessions: 0,
            session: None,
            departure: Departure::First,
            abandoned: None,
            closed: false,
        }
    }
}

/// One connection's lifecycle. Owned by the task serving the connection, so
/// its transitions are strictly ordered.
///
/// Every login mints a new handle id (`{connection}.{n}`), so a handle
/// resolved for one identity can never reach a later session of another.
pub struct GatewayConnection {
    id: ConnectionId,
    gateway: ConnectionGateway,
    sessions: u64,
    session: Option<ConnectionHandle>,
    departure: Departure,
    /// Handle of a failed login the store may still hold.
    abandoned: Option<ConnectionHandle>,
    closed: bool,
}

impl GatewayConnection {
    /// Transport-level id, stable across sessions.
    #[must_use]
    pub fn id(&self) -> &ConnectionId {
        &self.id
    }

    #[must_use]
    pub fn state(&self) -> ConnectionState {
        if self.closed {
            ConnectionState::Closed
        } else if self.session.is_some() {
            ConnectionState::Authenticated
        } else {
            ConnectionState::Unauthenticated
        }
    }

    /// The authenticated session, if any.
    #[must_use]
    pub fn handle(&self) -> Option<&ConnectionHandle> {
        self.session.as_ref()
    }

    async fn verify(&self, credential: &str) -> Result<Principal, AuthError> {
        let timeout = self.gateway.auth_timeout;
        tokio::time::timeout(timeout, self.gateway.authenticator.verify(credential))
            .await
            .map_err(|_| AuthError::Timeout(timeout))?
    }

    fn next_handle_id(&mut self) -> ConnectionId {
        self.sessions += 1;
        ConnectionId::new(format!("{}.{}", self.id, self.sessions))
    }

    async fn withdraw_abandoned(&mut self) -> Result<(), GatewayError> {
        let Some(handle) = &self.abandoned else {
            return Ok(());
        };
        self.gateway.lifecycle.on_abandoned(handle).await?;
        self.abandoned = None;
        Ok(())
    }

    /// Authenticate with `credential`.
    ///
    /// A rejected credential leaves the connection exactly as it was. Logging
    /// in again as the identity already held is a no-op; logging in as a
    /// different identity ends the current session first.
    ///
    /// # Errors
    ///
    /// Returns an error if the credential is rejected, the registry cannot
    /// be written, or the connection is closed.
    pub async fn login(&mut self, credential: &str) -> Result<LoginOutcome, GatewayError> {
        if self.closed {
            return Err(GatewayError::Closed);
        }

        let principal = self.verify(credential).await.map_err(|e| {
            debug!(connection = %self.id, error = %e, "Authentication rejected");
            e
        })?;

        if let Some(current) = &self.session {
            if current.identity == principal.identity {
                return Ok(LoginOutcome {
                    handle: current.clone(),
                    transition: Transition::unchanged(),
                });
            }
            debug!(
                connection = %self.id,
                from = %current.identity,
                to = %principal.identity,
                "Switching identity"
            );
            self.logout().await?;
        }

        if let Err(e) = self.withdraw_abandoned().await {
            debug!(connection = %self.id, error = %e, "Failed registration still pending");
        }

        let handle = ConnectionHandle::new(self.next_handle_id(), principal.identity, principal.claims);
        let registered = self.gateway.lifecycle.on_authenticated(&handle).await;
        let transition = match registered {
            Ok(transition) => transition,
            Err(e) => {
                warn!(connection = %self.id, identity = %handle.identity, error = %e, "Registration failed");
                // The write may have been applied before the failure.
                self.abandoned = Some(handle);
                if let Err(pending) = self.withdraw_abandoned().await {
                    debug!(connection = %self.id, error = %pending, "Could not withdraw failed registration");
                }
                return Err(e);
            }
        };

        debug!(connection = %self.id, handle = %handle.id, identity = %handle.identity, "Authenticated");
        self.session = Some(handle.clone());
        self.departure = Departure::First;
        Ok(LoginOutcome { handle, transition })
    }

    /// End the session but keep the transport open. No-op when not
    /// authenticated.
    ///
    /// # Errors
    ///
    /// Returns an error if the registry cannot be written; the connection
    /// then stays authenticated and the next logout or close retries.
    pub async fn logout(&mut self) -> Result<Transition, GatewayError> {
        let Some(handle) = &self.session else {
            return Ok(Transition::unchanged());
        };

        match self.gateway.lifecycle.on_closed(handle, self.departure).await {
            Ok(transition) => {
                debug!(connection = %self.id, identity = %handle.identity, "Logged out");
                self.session = None;
                Ok(transition)
            }
            Err(e) => {
                self.departure = Departure::Retry;
                Err(e)
            }
        }
    }

    /// The transport went away. Idempotent.
    ///
    /// # Errors
    ///
    /// Returns an error if the registry cannot be written. The connection is
    /// closed regardless; whatever it left registered is reclaimed when its
    /// node restarts.
    pub async fn close(&mut self) -> Result<Transition, GatewayError> {
        if self.closed {
            return Ok(Transition::unchanged());
        }
        self.closed = true;

        let withdrawn = self.withdraw_abandoned().await;

        let transition = match self.session.take() {
            Some(handle) => {
                debug!(connection = %self.id, identity = %handle.identity, "Closing session");
                self.gateway
                    .lifecycle
                    .on_closed(&handle, self.departure)
                    .await?
            }
            None => Transition::unchanged(),
        };

        withdrawn.map(|()| transition)
    }
}
