//! # roster-server
//!
//! WebSocket front end for the roster presence core: authenticates
//! connections, keeps the presence registry in step with them and pushes
//! fanned-out events down the socket.

pub mod auth;
pub mod config;
pub mod handlers;
pub mod metrics;
pub mod state;

pub use config::Config;
pub use handlers::{app, run_server};
pub use state::AppState;
