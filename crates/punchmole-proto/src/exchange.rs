//! Lifecycle of one forwarded HTTP exchange
//!
//! Both ends track every exchange through the same phases:
//!
//! ```text
//! Created -> HeadersSent -> Streaming* -> DataComplete -> Completed
//!     \__________\_____________\_____________\________-> Aborted
//! ```
//!
//! Nothing follows a terminal phase. A message addressed to an exchange in a
//! terminal phase (or to an unknown id) is a no-op for the receiver.

use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExchangePhase {
    /// `request-start` sent/received, no response yet
    Created,
    /// `response-start` sent/received
    HeadersSent,
    /// At least one body chunk forwarded
    Streaming,
    /// `data-end` sent/received
    DataComplete,
    Completed,
    Aborted,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExchangeEvent {
    HeadersSent,
    Data,
    DataEnd,
    Finish,
    Abort,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("invalid exchange transition: {event:?} while {phase:?}")]
pub struct InvalidTransition {
    pub phase: ExchangePhase,
    pub event: ExchangeEvent,
}

impl ExchangePhase {
    pub fn is_terminal(self) -> bool {
        matches!(self, ExchangePhase::Completed | ExchangePhase::Aborted)
    }

    /// Whether a `response-start` has already crossed the tunnel
    pub fn response_started(self) -> bool {
        matches!(
            self,
            ExchangePhase::HeadersSent
                | ExchangePhase::Streaming
                | ExchangePhase::DataComplete
                | ExchangePhase::Completed
        )
    }

    pub fn apply(self, event: ExchangeEvent) -> Result<ExchangePhase, InvalidTransition> {
        use ExchangeEvent as E;
        use ExchangePhase as P;

        let next = match (self, event) {
            (P::Created, E::HeadersSent) => P::HeadersSent,
            (P::HeadersSent | P::Streaming, E::Data) => P::Streaming,
            (P::HeadersSent | P::Streaming, E::DataEnd) => P::DataComplete,
            (P::DataComplete, E::Finish) => P::Completed,
            (phase, E::Abort) if !phase.is_terminal() => P::Aborted,
            (phase, event) => return Err(InvalidTransition { phase, event }),
        };
        Ok(next)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_happy_path() {
        let phase = ExchangePhase::Created
            .apply(ExchangeEvent::HeadersSent)
            .and_then(|p| p.apply(ExchangeEvent::Data))
            .and_then(|p| p.apply(ExchangeEvent::Data))
            .and_then(|p| p.apply(ExchangeEvent::DataEnd))
            .and_then(|p| p.apply(ExchangeEvent::Finish))
            .unwrap();
        assert_eq!(phase, ExchangePhase::Completed);
        assert!(phase.is_terminal());
    }

    #[test]
    fn test_empty_body() {
        let phase = ExchangePhase::Created
            .apply(ExchangeEvent::HeadersSent)
            .and_then(|p| p.apply(ExchangeEvent::DataEnd))
            .unwrap();
        assert_eq!(phase, ExchangePhase::DataComplete);
    }

    #[test]
    fn test_abort_from_every_live_phase() {
        for phase in [
            ExchangePhase::Created,
            ExchangePhase::HeadersSent,
            ExchangePhase::Streaming,
            ExchangePhase::DataComplete,
        ] {
            assert_eq!(
                phase.apply(ExchangeEvent::Abort),
                Ok(ExchangePhase::Aborted)
            );
        }
    }

    #[test]
    fn test_nothing_follows_terminal() {
        for phase in [ExchangePhase::Completed, ExchangePhase::Aborted] {
            for event in [
                ExchangeEvent::HeadersSent,
                ExchangeEvent::Data,
                ExchangeEvent::DataEnd,
                ExchangeEvent::Finish,
                ExchangeEvent::Abort,
            ] {
                assert!(phase.apply(event).is_err());
            }
        }
    }

    #[test]
    fn test_data_before_headers_is_invalid() {
        let err = ExchangePhase::Created
            .apply(ExchangeEvent::Data)
            .unwrap_err();
        assert_eq!(err.phase, ExchangePhase::Created);
        assert_eq!(err.event, ExchangeEvent::Data);
    }

    #[test]
    fn test_response_started_flag() {
        assert!(!ExchangePhase::Created.response_started());
        assert!(ExchangePhase::HeadersSent.response_started());
        assert!(!ExchangePhase::Aborted.response_started());
    }
}
