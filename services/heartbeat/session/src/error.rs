//! Heartbeat error types.

use std::io;
use thiserror::Error;

/// Heartbeat errors
///
/// `Subscription` and `NoRuntime` are returned synchronously from
/// [`crate::Heartbeat::register`]. `ProbeFailure` and `EscalationExhausted`
/// are terminal and only ever reach the caller through
/// [`crate::HeartbeatOperations::broken`]. `NotifierRead` is logged and
/// otherwise absorbed.
#[derive(Error, Debug)]
pub enum HeartbeatError {
    /// The runtime refused to route liveness notifications for the handle
    #[error("liveness subscription refused: {0}")]
    Subscription(#[source] io::Error),

    /// Registration was attempted outside a tokio runtime
    #[error("heartbeat registration requires a tokio runtime")]
    NoRuntime,

    /// The probe capability reported failure
    #[error("probe #{probes} failed: {source}")]
    ProbeFailure {
        /// Probe count at the time of the failed attempt
        probes: u32,
        /// Underlying send error
        #[source]
        source: io::Error,
    },

    /// Consecutive unanswered probes exceeded the configured ceiling
    #[error("peer unresponsive after {max_probes} probes")]
    EscalationExhausted {
        /// Configured probe ceiling
        max_probes: u32,
    },

    /// Non-benign error draining the out-of-band side channel
    #[error("out-of-band read failed: {0}")]
    NotifierRead(#[source] io::Error),
}

impl HeartbeatError {
    /// Whether this error ends the session (and is delivered to the broken callback)
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            HeartbeatError::ProbeFailure { .. } | HeartbeatError::EscalationExhausted { .. }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_terminal_classification() {
        let probe = HeartbeatError::ProbeFailure {
            probes: 1,
            source: io::Error::from(io::ErrorKind::BrokenPipe),
        };
        assert!(probe.is_terminal());
        assert!(HeartbeatError::EscalationExhausted { max_probes: 3 }.is_terminal());

        let read = HeartbeatError::NotifierRead(io::Error::from(io::ErrorKind::ConnectionReset));
        assert!(!read.is_terminal());
        assert!(!HeartbeatError::Subscription(io::Error::from(io::ErrorKind::InvalidInput)).is_terminal());
    }

    #[test]
    fn test_display() {
        let err = HeartbeatError::EscalationExhausted { max_probes: 3 };
        assert_eq!(err.to_string(), "peer unresponsive after 3 probes");

        let err = HeartbeatError::ProbeFailure {
            probes: 2,
            source: io::Error::new(io::ErrorKind::BrokenPipe, "broken pipe"),
        };
        assert_eq!(err.to_string(), "probe #2 failed: broken pipe");
    }
}
