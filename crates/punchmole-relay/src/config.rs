//! Relay configuration

use crate::error::RelayError;
use punchmole_proto::DEFAULT_ENDPOINT_PATH;
use std::net::SocketAddr;

#[derive(Debug, Clone)]
pub struct RelayConfig {
    /// Address the public HTTP/WebSocket listener binds to
    pub bind_addr: SocketAddr,

    /// Shared keys accepted in `register` messages
    pub api_keys: Vec<String>,

    /// Path on which agents open their control WebSocket
    pub endpoint_path: String,
}

impl RelayConfig {
    pub fn new(bind_addr: SocketAddr, api_keys: Vec<String>) -> Self {
        Self {
            bind_addr,
            api_keys,
            endpoint_path: DEFAULT_ENDPOINT_PATH.to_string(),
        }
    }

    pub fn with_endpoint_path(mut self, path: &str) -> Self {
        self.endpoint_path = path.to_string();
        self
    }

    pub fn validate(&self) -> Result<(), RelayError> {
        if !self.api_keys.iter().any(|k| !k.is_empty()) {
            return Err(RelayError::NoApiKeys);
        }
        if !self.endpoint_path.starts_with('/') {
            return Err(RelayError::InvalidEndpointPath(self.endpoint_path.clone()));
        }
        Ok(())
    }

    pub fn accepts_key(&self, key: &str) -> bool {
        !key.is_empty() && self.api_keys.iter().any(|k| k == key)
    }
}
