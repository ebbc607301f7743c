//! Punchmole agent
//!
//! Runs next to an internal service. Holds a control WebSocket to a relay,
//! registers a domain on it and replays every exchange and WebSocket the relay
//! forwards against the internal target URL.

pub mod config;
pub mod error;
mod forwarder;
pub mod session;
pub mod supervisor;
mod websocket;

pub use config::AgentConfig;
pub use error::AgentError;
pub use session::{AgentSession, SessionEnd};
pub use supervisor::Supervisor;
