//! Error types for pow-p2p.

use std::time::Duration;

use thiserror::Error;

/// Errors that can occur in P2P operations.
#[derive(Debug, Error)]
pub enum P2pError {
    /// Connection failed.
    #[error("connection failed: {0}")]
    Connection(String),

    /// A network operation did not complete in time.
    #[error("{operation} timed out after {after:?}")]
    Timeout {
        /// What was being attempted (connect, send, recv).
        operation: &'static str,
        /// The bound that elapsed.
        after: Duration,
    },

    /// Discovery failed.
    #[error("discovery failed: {0}")]
    Discovery(String),

    /// Gossip protocol error.
    #[error("gossip error: {0}")]
    Gossip(String),

    /// Protocol error (malformed or unexpected message).
    #[error("protocol error: {0}")]
    Protocol(String),

    /// Invalid configuration.
    #[error("configuration error: {0}")]
    Config(String),

    /// IO error.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON encoding or decoding failed.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl P2pError {
    /// Returns true for failures that only mean "peer unreachable this cycle".
    #[must_use]
    pub const fn is_transient(&self) -> bool {
        matches!(self, Self::Connection(_) | Self::Timeout { .. } | Self::Io(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_timeout_display() {
        let err = P2pError::Timeout {
            operation: "connect",
            after: Duration::from_secs(5),
        };
        assert_eq!(err.to_string(), "connect timed out after 5s");
    }

    #[test]
    fn test_config_display() {
        let err = P2pError::Config("max_peers must be at least 1".to_string());
        assert_eq!(
            err.to_string(),
            "configuration error: max_peers must be at least 1"
        );
    }

    #[test]
    fn test_transient_classification() {
        assert!(P2pError::Connection("refused".into()).is_transient());
        assert!(
            P2pError::Timeout {
                operation: "recv",
                after: Duration::from_secs(3)
            }
            .is_transient()
        );
        assert!(!P2pError::Protocol("bad frame".into()).is_transient());
        assert!(!P2pError::Config("bad".into()).is_transient());
    }

    #[test]
    fn test_from_serde_error() {
        let parse: Result<serde_json::Value, _> = serde_json::from_str("{not json");
        let err: P2pError = parse.unwrap_err().into();
        assert!(matches!(err, P2pError::Serialization(_)));
    }
}
