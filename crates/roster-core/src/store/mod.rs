//! Shared key-value store backing the presence registry.
//!
//! The store only knows about named sets of strings. Its two mutating
//! operations each touch an entry set and the global online set as a single
//! atomic step, which is what keeps online/offline edges exact when several
//! processes race on the same identity.

use async_trait::async_trait;
use thiserror::Error;

pub mod memory;
#[cfg(feature = "redis")]
pub mod redis;

pub use memory::MemoryStore;
#[cfg(feature = "redis")]
pub use self::redis::RedisStore;

/// Store errors.
#[derive(Debug, Error)]
pub enum StoreError {
    /// The store could not be reached.
    #[error("Store unavailable: {0}")]
    Unavailable(String),

    /// The store answered with something unexpected.
    #[error("Unexpected store reply: {0}")]
    Protocol(String),
}

/// Result of adding a connection to an entry set.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Attached {
    /// The member was not in the set before.
    pub added: bool,
    /// Size of the set after the operation.
    pub size: usize,
}

/// Result of removing a connection from an entry set.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Detached {
    /// The member was in the set before.
    pub removed: bool,
    /// Size of the set after the operation.
    pub remaining: usize,
}

/// Atomic set primitives needed by the registry.
#[async_trait]
pub trait PresenceStore: Send + Sync {
    /// Add `connection` to `entry_key` and `member` to `online_key`, atomically.
    async fn attach(
        &self,
        entry_key: &str,
        online_key: &str,
        member: &str,
        connection: &str,
    ) -> Result<Attached, StoreError>;

    /// Remove `connection` from `entry_key`; when the set becomes empty also
    /// remove `member` from `online_key`. Atomic.
    async fn detach(
        &self,
        entry_key: &str,
        online_key: &str,
        member: &str,
        connection: &str,
    ) -> Result<Detached, StoreError>;

    /// All members of a set. Missing sets are empty.
    async fn members(&self, key: &str) -> Result<Vec<String>, StoreError>;

    /// Whether `member` belongs to the set at `key`.
    async fn contains(&self, key: &str, member: &str) -> Result<bool, StoreError>;

    /// Check that the store is reachable.
    async fn ping(&self) -> Result<(), StoreError>;
}
