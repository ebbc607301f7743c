//! Punchmole control protocol
//!
//! This crate defines the messages exchanged between a relay and an agent over
//! a single control WebSocket, the binary-safe payload encoding they share and
//! the lifecycle every forwarded HTTP exchange goes through.

pub mod codec;
pub mod exchange;
pub mod headers;
pub mod ids;
pub mod messages;

pub use codec::{decode_latin1, encode_latin1, CodecError, ControlCodec, Payload};
pub use exchange::{ExchangeEvent, ExchangePhase, InvalidTransition};
pub use headers::Headers;
pub use ids::StreamId;
pub use messages::{AgentMessage, ControlMessage, RelayMessage};

/// Default path of the control endpoint on the relay
pub const DEFAULT_ENDPOINT_PATH: &str = "/_punchmole";

/// Body sent to the public client when an agent cannot reach its target
pub const SERVICE_UNAVAILABLE_BODY: &str =
    "no registration for domain and/or remote service not available";
