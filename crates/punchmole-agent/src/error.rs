//! Agent errors

use thiserror::Error;

#[derive(Debug, Error)]
pub enum AgentError {
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Invalid URL: {0}")]
    InvalidUrl(#[from] url::ParseError),

    #[error("Connection to relay failed: {0}")]
    ConnectionFailed(String),

    #[error("Control connection error: {0}")]
    TransportError(#[from] tokio_tungstenite::tungstenite::Error),

    #[error("HTTP client error: {0}")]
    HttpClient(#[from] reqwest::Error),

    #[error("Protocol error: {0}")]
    ProtocolError(#[from] punchmole_proto::CodecError),
}
