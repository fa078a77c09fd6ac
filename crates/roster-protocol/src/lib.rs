//! # roster-protocol
//!
//! Wire protocol spoken between roster clients and the roster server.
//!
//! ## Frame Types
//!
//! - `Connect` / `Connected` - Handshake, with optional implicit login
//! - `Login` / `Logout` / `Authenticated` - Session management
//! - `Event` - Fan-out delivery pushed by the server
//! - `Ack` / `Error` - Request outcomes
//! - `Ping` / `Pong` - Keepalive
//!
//! ## Example
//!
//! ```rust
//! use roster_protocol::{codec, Frame};
//!
//! let frame = Frame::login(1, "bearer-token");
//! let encoded = codec::encode(&frame).unwrap();
//! assert_eq!(codec::decode(&encoded).unwrap(), frame);
//! ```

pub mod codec;
pub mod frames;
pub mod version;

pub use codec::{decode, encode, ProtocolError};
pub use frames::{codes, Frame, FrameType};
pub use version::{Version, PROTOCOL_VERSION};
