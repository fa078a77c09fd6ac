//! # roster-core
//!
//! Presence bookkeeping and fan-out for the Roster realtime service.
//!
//! - **Registry** - which identities hold live connections, kept in a shared
//!   store so every process sees the same state
//! - **Publisher** - named-channel pub/sub for online/offline announcements
//! - **Gateway** - per-connection `Unauthenticated -> Authenticated -> Closed`
//!   state machine driving the registry and publisher
//! - **Fan-out** - deliver one payload to every connection of some identities,
//!   wherever they live
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────┐     ┌─────────────┐     ┌─────────────┐
//! │ Connection  │────▶│   Gateway   │────▶│  Publisher  │
//! └─────────────┘     └─────────────┘     └─────────────┘
//!                            │
//!                            ▼
//! ┌─────────────┐     ┌─────────────┐     ┌─────────────┐
//! │   Fan-out   │────▶│  Registry   │────▶│    Store    │
//! └─────────────┘     └─────────────┘     └─────────────┘
//!        │
//!        ▼
//! ┌─────────────┐
//! │  Delivery   │  local queue or relay to the owning node
//! └─────────────┘
//! ```

pub mod dispatch;
pub mod fanout;
pub mod gateway;
pub mod identity;
pub mod lifecycle;
pub mod message;
pub mod publisher;
pub mod registry;
#[cfg(feature = "redis")]
pub mod relay;
pub mod store;

pub use dispatch::LocalDispatch;
pub use fanout::{Delivery, DeliveryError, DeliveryOutcome, EmitReport, FanoutEmitter};
pub use gateway::{
    Announcement, AuthError, Authenticator, ConnectionGateway, ConnectionLifecycleHandler,
    ConnectionState, Departure, GatewayConnection, GatewayError, LoginOutcome, Principal,
    PresenceLifecycle, Transition,
};
pub use identity::{Claims, ConnectionHandle, ConnectionId, Identity, PrincipalKind};
pub use lifecycle::{LifecycleChannels, LifecycleEvent, TransitionKind};
pub use message::Envelope;
pub use publisher::{Event, EventHandler, EventPublisher, LocalPublisher, PublishError, Subscription};
pub use registry::{PresenceRegistry, RegistryConfig, RegistryError};
#[cfg(feature = "redis")]
pub use relay::RedisRelay;
pub use store::{MemoryStore, PresenceStore, StoreError};
