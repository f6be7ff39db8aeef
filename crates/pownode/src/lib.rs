//! pownode - proof-of-work network node
//!
//! Runs peer discovery and proof gossip side by side. Discovery supplies the
//! gossip fan-out targets; locally mined proofs are announced by CID.

pub mod config;
pub mod error;
pub mod handler;

pub use config::NodeConfig;
pub use error::NodeError;
pub use handler::LoggingHandler;
