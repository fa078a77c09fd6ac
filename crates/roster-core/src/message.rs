//! Payloads carried by the fan-out layer.

use bytes::Bytes;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

/// A unique envelope identifier.
pub type EnvelopeId = u64;

static ID_COUNTER: AtomicU64 = AtomicU64::new(0);

/// Milliseconds since the Unix epoch.
#[must_use]
pub fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or_default()
}

/// Generate a unique envelope ID.
#[must_use]
pub fn generate_envelope_id() -> EnvelopeId {
    let timestamp = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos() as u64)
        .unwrap_or_default();
    timestamp.wrapping_add(ID_COUNTER.fetch_add(1, Ordering::Relaxed))
}

/// One named payload on its way to every connection of some identities.
///
/// The payload is reference counted so one emit shares a single buffer
/// across all of its deliveries.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Envelope {
    pub id: EnvelopeId,
    pub event: String,
    pub payload: Bytes,
    pub timestamp: u64,
}

impl Envelope {
    #[must_use]
    pub fn new(event: impl Into<String>, payload: impl Into<Bytes>) -> Self {
        Self {
            id: generate_envelope_id(),
            event: event.into(),
            payload: payload.into(),
            timestamp: now_millis(),
        }
    }

    #[must_use]
    pub fn payload_size(&self) -> usize {
        self.payload.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_envelope_creation() {
        let envelope = Envelope::new("ping", br#"{"x":1}"#.to_vec());
        assert_eq!(envelope.event, "ping");
        assert_eq!(envelope.payload_size(), 7);
        assert!(envelope.timestamp > 0);
    }

    #[test]
    fn test_unique_envelope_ids() {
        assert_ne!(generate_envelope_id(), generate_envelope_id());
    }
}
