//! Frame types for the roster protocol.
//!
//! Every frame is serialized with MessagePack. Clients send `Connect`,
//! `Login`, `Logout` and `Ping`; the server answers with `Connected`,
//! `Authenticated`, `Ack`, `Error` and `Pong`, and pushes fan-out
//! deliveries as `Event` frames.

use serde::{Deserialize, Serialize};

/// Error codes carried by [`Frame::Error`].
pub mod codes {
    /// The frame could not be decoded or was not expected.
    pub const INVALID_FRAME: u16 = 1001;
    /// The client speaks an incompatible protocol version.
    pub const UNSUPPORTED_VERSION: u16 = 1002;
    /// The credential was rejected.
    pub const AUTHENTICATION_FAILED: u16 = 4001;
    /// The connection has already been closed.
    pub const CONNECTION_CLOSED: u16 = 4002;
    /// The shared presence store could not be reached.
    pub const STORE_UNAVAILABLE: u16 = 5003;
}

/// Frame type identifiers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum FrameType {
    Connect = 0x01,
    Connected = 0x02,
    Login = 0x03,
    Logout = 0x04,
    Authenticated = 0x05,
    Event = 0x06,
    Ack = 0x07,
    Error = 0x08,
    Ping = 0x09,
    Pong = 0x0A,
}

/// A protocol frame.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum Frame {
    /// Opening handshake, optionally carrying a credential for implicit login.
    #[serde(rename = "connect")]
    Connect {
        /// Major protocol version spoken by the client.
        version: u8,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        token: Option<String>,
    },

    /// Handshake response.
    #[serde(rename = "connected")]
    Connected {
        /// Identifier of this connection.
        connection_id: String,
        /// Negotiated major version.
        version: u8,
        /// Heartbeat interval the client should keep, in milliseconds.
        heartbeat: u32,
    },

    /// Authenticate the connection with a bearer credential.
    #[serde(rename = "login")]
    Login { id: u64, token: String },

    /// Drop the connection's session without closing the transport.
    #[serde(rename = "logout")]
    Logout {
        id: u64,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        token: Option<String>,
    },

    /// Successful login.
    #[serde(rename = "authenticated")]
    Authenticated {
        /// ID of the login request, 0 for implicit handshake logins.
        id: u64,
        /// Textual identity the connection is now bound to.
        identity: String,
    },

    /// A payload fanned out to this connection.
    #[serde(rename = "event")]
    Event {
        event: String,
        #[serde(with = "serde_bytes")]
        payload: Vec<u8>,
    },

    /// Acknowledgment of a request.
    #[serde(rename = "ack")]
    Ack { id: u64 },

    /// Error response.
    #[serde(rename = "error")]
    Error {
        /// ID of the failed request (0 if not applicable).
        id: u64,
        /// One of [`codes`].
        code: u16,
        message: String,
    },

    /// Keepalive ping.
    #[serde(rename = "ping")]
    Ping {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        timestamp: Option<u64>,
    },

    /// Keepalive pong.
    #[serde(rename = "pong")]
    Pong {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        timestamp: Option<u64>,
    },
}

impl Frame {
    /// Get the frame type.
    #[must_use]
    pub fn frame_type(&self) -> FrameType {
        match self {
            Frame::Connect { .. } => FrameType::Connect,
            Frame::Connected { .. } => FrameType::Connected,
            Frame::Login { .. } => FrameType::Login,
            Frame::Logout { .. } => FrameType::Logout,
            Frame::Authenticated { .. } => FrameType::Authenticated,
            Frame::Event { .. } => FrameType::Event,
            Frame::Ack { .. } => FrameType::Ack,
            Frame::Error { .. } => FrameType::Error,
            Frame::Ping { .. } => FrameType::Ping,
            Frame::Pong { .. } => FrameType::Pong,
        }
    }

    /// Create a Connect frame.
    #[must_use]
    pub fn connect(version: u8, token: Option<String>) -> Self {
        Frame::Connect { version, token }
    }

    /// Create a Connected frame.
    #[must_use]
    pub fn connected(connection_id: impl Into<String>, version: u8, heartbeat: u32) -> Self {
        Frame::Connected {
            connection_id: connection_id.into(),
            version,
            heartbeat,
        }
    }

    /// Create a Login frame.
    #[must_use]
    pub fn login(id: u64, token: impl Into<String>) -> Self {
        Frame::Login {
            id,
            token: token.into(),
        }
    }

    /// Create a Logout frame.
    #[must_use]
    pub fn logout(id: u64) -> Self {
        Frame::Logout { id, token: None }
    }

    /// Create an Authenticated frame.
    #[must_use]
    pub fn authenticated(id: u64, identity: impl Into<String>) -> Self {
        Frame::Authenticated {
            id,
            identity: identity.into(),
        }
    }

    /// Create an Event frame.
    #[must_use]
    pub fn event(event: impl Into<String>, payload: impl Into<Vec<u8>>) -> Self {
        Frame::Event {
            event: event.into(),
            payload: payload.into(),
        }
    }

    #[must_use]
    pub fn ack(id: u64) -> Self {
        Frame::Ack { id }
    }

    #[must_use]
    pub fn error(id: u64, code: u16, message: impl Into<String>) -> Self {
        Frame::Error {
            id,
            code,
            message: message.into(),
        }
    }

    #[must_use]
    pub fn ping() -> Self {
        Frame::Ping { timestamp: None }
    }

    #[must_use]
    pub fn pong(timestamp: Option<u64>) -> Self {
        Frame::Pong { timestamp }
    }

    /// Request ID carried by the frame, if it is a request or a response to one.
    #[must_use]
    pub fn request_id(&self) -> Option<u64> {
        match self {
            Frame::Login { id, .. }
            | Frame::Logout { id, .. }
            | Frame::Authenticated { id, .. }
            | Frame::Ack { id }
            | Frame::Error { id, .. } => Some(*id),
            _ => None,
        }
    }
}
