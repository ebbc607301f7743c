//! Relay errors

use thiserror::Error;

#[derive(Debug, Error)]
pub enum RelayError {
    #[error("invalid api keys, at least one non-empty key is required")]
    NoApiKeys,

    #[error("Invalid control endpoint path '{0}': must start with '/'")]
    InvalidEndpointPath(String),

    #[error("Failed to bind to {address}: {reason}\n\nTroubleshooting:\n  • Check if another process is using this port: lsof -i :{port}\n  • Try using a different address or port")]
    BindError {
        address: String,
        port: u16,
        reason: String,
    },

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Control connection write failed: {0}")]
    ControlWrite(String),

    #[error("Control session closed")]
    SessionClosed,
}
