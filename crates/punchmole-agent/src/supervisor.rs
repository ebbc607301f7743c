//! Reconnect loop
//!
//! Keeps one control connection alive for as long as the agent runs. Every
//! ended session, whatever the reason, is followed by the same fixed pause
//! and a fresh attempt.

use crate::config::AgentConfig;
use crate::error::AgentError;
use crate::session::{AgentSession, SessionEnd};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

pub struct Supervisor {
    session: AgentSession,
    attempts: u64,
}

impl Supervisor {
    pub fn new(config: AgentConfig) -> Result<Self, AgentError> {
        config.validate()?;
        Ok(Self {
            session: AgentSession::new(Arc::new(config))?,
            attempts: 0,
        })
    }

    /// Connection attempts made so far
    pub fn attempts(&self) -> u64 {
        self.attempts
    }

    pub fn reconnect_delay(&self) -> Duration {
        self.session.config().reconnect_delay
    }

    /// Run sessions back to back until `shutdown` fires
    pub async fn run(&mut self, shutdown: CancellationToken) {
        loop {
            self.attempts += 1;
            debug!(attempt = self.attempts, "Connecting to relay");

            let outcome = tokio::select! {
                _ = shutdown.cancelled() => break,
                outcome = self.session.run() => outcome,
            };

            match outcome {
                Ok(SessionEnd::Closed) => info!("Connection with upstream server closed"),
                Ok(SessionEnd::Rejected(message)) => {
                    error!(domain = %self.session.config().domain, "Registration rejected: {}", message)
                }
                Err(e) => warn!(attempt = self.attempts, "Control connection failed: {}", e),
            }

            let delay = self.reconnect_delay();
            info!("Restarting client in {}ms", delay.as_millis());

            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = sleep(delay) => {}
            }
        }

        info!(attempts = self.attempts, "Agent stopped");
    }
}
