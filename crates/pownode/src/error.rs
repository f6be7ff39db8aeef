//! Error types for pownode.

use thiserror::Error;

/// Errors that can occur while configuring or running the node.
#[derive(Debug, Error)]
pub enum NodeError {
    /// Configuration error.
    #[error("configuration error: {0}")]
    Config(String),

    /// IO error.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// Networking layer error.
    #[error("p2p error: {0}")]
    P2p(#[from] pow_p2p::P2pError),
}
