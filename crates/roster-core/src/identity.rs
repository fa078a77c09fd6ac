//! Principals and connection identifiers.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};
use thiserror::Error;

/// Separator between the owning node and the local part of a [`ConnectionId`].
const NODE_SEPARATOR: char = '/';

static CONNECTION_COUNTER: AtomicU64 = AtomicU64::new(0);

/// The two kinds of principal that can hold connections.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PrincipalKind {
    User,
    Performer,
}

impl PrincipalKind {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            PrincipalKind::User => "user",
            PrincipalKind::Performer => "performer",
        }
    }
}

impl fmt::Display for PrincipalKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for PrincipalKind {
    type Err = ParseIdentityError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "user" => Ok(PrincipalKind::User),
            "performer" => Ok(PrincipalKind::Performer),
            other => Err(ParseIdentityError::UnknownKind(other.to_string())),
        }
    }
}

/// Failure to parse an [`Identity`] from its textual form.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ParseIdentityError {
    #[error("Unknown principal kind: {0}")]
    UnknownKind(String),

    #[error("Malformed identity: {0}")]
    Malformed(String),
}

/// Stable key of a principal. Equality is by value.
///
/// The textual form is `"{kind}:{id}"`, which is also how the identity is
/// stored in the shared online set.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Identity {
    pub kind: PrincipalKind,
    pub id: String,
}

impl Identity {
    #[must_use]
    pub fn new(kind: PrincipalKind, id: impl Into<String>) -> Self {
        Self { kind, id: id.into() }
    }

    #[must_use]
    pub fn user(id: impl Into<String>) -> Self {
        Self::new(PrincipalKind::User, id)
    }

    #[must_use]
    pub fn performer(id: impl Into<String>) -> Self {
        Self::new(PrincipalKind::Performer, id)
    }
}

impl fmt::Display for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.kind, self.id)
    }
}

impl FromStr for Identity {
    type Err = ParseIdentityError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (kind, id) = s
            .split_once(':')
            .ok_or_else(|| ParseIdentityError::Malformed(s.to_string()))?;
        if id.is_empty() {
            return Err(ParseIdentityError::Malformed(s.to_string()));
        }
        Ok(Self::new(kind.parse()?, id))
    }
}

/// Small set of claims attached to a connection at authentication time.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Claims {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub role: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
}

/// Identifier of one live connection.
///
/// Formatted as `"{node}/{local}"`: the prefix names the process that owns
/// the connection, which is how cross-process delivery finds it.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ConnectionId(String);

impl ConnectionId {
    /// Wrap an existing identifier.
    #[must_use]
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Generate a fresh identifier owned by `node`.
    #[must_use]
    pub fn generate(node: &str) -> Self {
        let timestamp = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_nanos() as u64)
            .unwrap_or_default();
        let counter = CONNECTION_COUNTER.fetch_add(1, Ordering::Relaxed);
        Self(format!(
            "{node}{NODE_SEPARATOR}{:x}",
            timestamp.wrapping_add(counter)
        ))
    }

    /// The node that owns this connection, if the id carries one.
    #[must_use]
    pub fn node(&self) -> Option<&str> {
        self.0
            .rsplit_once(NODE_SEPARATOR)
            .map(|(node, _)| node)
            .filter(|node| !node.is_empty())
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<String> for ConnectionId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for ConnectionId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// One authenticated connection on this process.
///
/// Only its [`ConnectionId`] ever leaves the process, through the registry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionHandle {
    pub id: ConnectionId,
    pub identity: Identity,
    pub claims: Claims,
}

impl ConnectionHandle {
    #[must_use]
    pub fn new(id: ConnectionId, identity: Identity, claims: Claims) -> Self {
        Self {
            id,
            identity,
            claims,
        }
    }
}
