//! Punchmole relay
//!
//! The publicly reachable half of the tunnel. Agents open one control
//! WebSocket per domain and register it with a shared API key; every HTTP
//! request or WebSocket that later arrives for that domain is multiplexed over
//! the control connection as a stream of protocol messages.
//!
//! Each control connection is served by a [`session`] task that exclusively
//! owns the exchanges and WebSocket relays running over it. Public handlers
//! never touch that state directly; they talk to the session through its
//! [`SessionHandle`].

pub mod config;
pub mod error;
pub mod exchange;
pub mod registry;
pub mod server;
pub mod session;
pub mod websocket;

pub use config::RelayConfig;
pub use error::RelayError;
pub use registry::{DomainRegistry, Liveness, Registration};
pub use server::{requested_domain, strip_port, RelayServer};
pub use session::SessionHandle;
