//! Online/offline lifecycle events.

use crate::identity::{Claims, Identity, PrincipalKind};
use crate::message::now_millis;
use serde::{Deserialize, Serialize};

/// Kind of presence transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransitionKind {
    Online,
    Offline,
}

impl TransitionKind {
    /// Event name used on the publish channel.
    #[must_use]
    pub fn event_name(&self) -> &'static str {
        match self {
            TransitionKind::Online => "online",
            TransitionKind::Offline => "offline",
        }
    }
}

/// Immutable record of one genuine presence transition.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LifecycleEvent {
    pub identity: Identity,
    pub transition: TransitionKind,
    /// Milliseconds since the Unix epoch.
    pub timestamp: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub claims: Option<Claims>,
}

impl LifecycleEvent {
    #[must_use]
    pub fn new(identity: Identity, transition: TransitionKind, claims: Option<Claims>) -> Self {
        Self {
            identity,
            transition,
            timestamp: now_millis(),
            claims,
        }
    }

    #[must_use]
    pub fn online(identity: Identity, claims: Option<Claims>) -> Self {
        Self::new(identity, TransitionKind::Online, claims)
    }

    #[must_use]
    pub fn offline(identity: Identity, claims: Option<Claims>) -> Self {
        Self::new(identity, TransitionKind::Offline, claims)
    }
}

/// Channel names lifecycle events are published on, one per principal kind.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LifecycleChannels {
    pub user: String,
    pub performer: String,
}

impl LifecycleChannels {
    #[must_use]
    pub fn for_kind(&self, kind: PrincipalKind) -> &str {
        match kind {
            PrincipalKind::User => &self.user,
            PrincipalKind::Performer => &self.performer,
        }
    }
}

impl Default for LifecycleChannels {
    fn default() -> Self {
        Self {
            user: "presence:user".to_string(),
            performer: "presence:performer".to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_json_shape() {
        let event = LifecycleEvent::online(Identity::performer("9"), None);
        let value = serde_json::to_value(&event).unwrap();

        assert_eq!(value["transition"], "online");
        assert_eq!(value["identity"]["kind"], "performer");
        assert_eq!(value["identity"]["id"], "9");
        assert!(value.get("claims").is_none());

        let back: LifecycleEvent = serde_json::from_value(value).unwrap();
        assert_eq!(back, event);
    }

    #[test]
    fn test_channel_per_kind() {
        let channels = LifecycleChannels::default();
        assert_eq!(channels.for_kind(PrincipalKind::User), "presence:user");
        assert_eq!(channels.for_kind(PrincipalKind::Performer), "presence:performer");
    }
}
