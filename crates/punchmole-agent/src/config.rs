//! Agent configuration

use crate::error::AgentError;
use std::time::Duration;
use url::Url;

/// Interval between keepalive pings on the control connection
pub const DEFAULT_PING_INTERVAL: Duration = Duration::from_secs(10);

/// Pause between a lost control connection and the next attempt
pub const DEFAULT_RECONNECT_DELAY: Duration = Duration::from_millis(500);

#[derive(Debug, Clone)]
pub struct AgentConfig {
    /// Control endpoint of the relay (`ws://` or `wss://`)
    pub endpoint_url: Url,

    pub api_key: String,

    /// Public domain to claim on the relay
    pub domain: String,

    /// Internal service every exchange is replayed against (`http://` or `https://`)
    pub target_url: Url,

    pub ping_interval: Duration,

    pub reconnect_delay: Duration,
}

impl AgentConfig {
    pub fn new(
        endpoint_url: &str,
        api_key: &str,
        domain: &str,
        target_url: &str,
    ) -> Result<Self, AgentError> {
        let config = Self {
            endpoint_url: Url::parse(endpoint_url)?,
            api_key: api_key.to_string(),
            domain: domain.to_string(),
            target_url: Url::parse(target_url)?,
            ping_interval: DEFAULT_PING_INTERVAL,
            reconnect_delay: DEFAULT_RECONNECT_DELAY,
        };
        config.validate()?;
        Ok(config)
    }

    pub fn with_ping_interval(mut self, interval: Duration) -> Self {
        self.ping_interval = interval;
        self
    }

    pub fn with_reconnect_delay(mut self, delay: Duration) -> Self {
        self.reconnect_delay = delay;
        self
    }

    pub fn validate(&self) -> Result<(), AgentError> {
        if self.api_key.is_empty() {
            return Err(AgentError::InvalidConfig("api key is empty".to_string()));
        }
        if self.domain.is_empty() {
            return Err(AgentError::InvalidConfig("domain is empty".to_string()));
        }
        if !matches!(self.endpoint_url.scheme(), "ws" | "wss") {
            return Err(AgentError::InvalidConfig(format!(
                "endpoint url must use ws:// or wss://, got {}",
                self.endpoint_url
            )));
        }
        if !matches!(self.target_url.scheme(), "http" | "https") {
            return Err(AgentError::InvalidConfig(format!(
                "target url must use http:// or https://, got {}",
                self.target_url
            )));
        }
        if self.ping_interval.is_zero() {
            return Err(AgentError::InvalidConfig(
                "ping interval must be positive".to_string(),
            ));
        }
        Ok(())
    }

    /// Target URL for a forwarded request path (path and query as received)
    pub fn target_http_url(&self, path: &str) -> String {
        join(self.target_url.as_str(), path)
    }

    /// Target URL for a relayed WebSocket, with `http` mapped to `ws`
    pub fn target_ws_url(&self, path: &str) -> String {
        let url = self.target_http_url(path);
        if let Some(rest) = url.strip_prefix("https://") {
            format!("wss://{}", rest)
        } else if let Some(rest) = url.strip_prefix("http://") {
            format!("ws://{}", rest)
        } else {
            url
        }
    }
}

fn join(base: &str, path: &str) -> String {
    let base = base.trim_end_matches('/');
    if path.starts_with('/') {
        format!("{}{}", base, path)
    } else {
        format!("{}/{}", base, path)
    }
}
