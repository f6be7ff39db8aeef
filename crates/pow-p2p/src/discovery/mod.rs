//! Peer discovery: bootstrap queries, peer exchange and reputation upkeep.
//!
//! - [`PeerTable`]: Bounded table of known peers
//! - [`BootstrapNode`]: A configured entry point and its reachability
//! - [`DiscoveryEngine`]: Runs the discovery loops over a [`Transport`](crate::transport::Transport)

mod engine;
mod peer_table;

pub use engine::{DiscoveryEngine, PeerStatistics, SweepReport};
pub use peer_table::{MergeOutcome, PeerTable};

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::fmt;

use crate::error::P2pError;

/// A bootstrap node used for initial peer discovery.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BootstrapNode {
    host: String,
    port: u16,
    connected: bool,
    last_connected: Option<DateTime<Utc>>,
}

impl BootstrapNode {
    /// Creates a new bootstrap node for `host:port`.
    #[must_use]
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
            connected: false,
            last_connected: None,
        }
    }

    /// Parses a `host:port` address. IPv6 hosts may be bracketed.
    ///
    /// # Errors
    ///
    /// Returns [`P2pError::Config`] if the host is empty or the port is
    /// missing or invalid.
    pub fn parse(address: &str) -> Result<Self, P2pError> {
        let invalid = || P2pError::Config(format!("bootstrap address {address:?} is not host:port"));

        let (host, port) = address.trim().rsplit_once(':').ok_or_else(invalid)?;
        let host = host.trim_start_matches('[').trim_end_matches(']');
        if host.is_empty() {
            return Err(invalid());
        }
        let port: u16 = port.parse().map_err(|_| invalid())?;
        if port == 0 {
            return Err(invalid());
        }
        Ok(Self::new(host, port))
    }

    /// Returns the node's host.
    #[must_use]
    pub fn host(&self) -> &str {
        &self.host
    }

    /// Returns the node's port.
    #[must_use]
    pub const fn port(&self) -> u16 {
        self.port
    }

    /// Returns whether the last query to this node succeeded.
    #[must_use]
    pub const fn is_connected(&self) -> bool {
        self.connected
    }

    /// Returns when the node last answered, if ever.
    #[must_use]
    pub const fn last_connected(&self) -> Option<DateTime<Utc>> {
        self.last_connected
    }

    /// Marks the node as reachable at `now`.
    pub fn mark_connected(&mut self, now: DateTime<Utc>) {
        self.connected = true;
        self.last_connected = Some(now);
    }

    /// Marks the node as unreachable.
    pub const fn mark_disconnected(&mut self) {
        self.connected = false;
    }
}

impl fmt::Display for BootstrapNode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.host.contains(':') {
            write!(f, "[{}]:{}", self.host, self.port)
        } else {
            write!(f, "{}:{}", self.host, self.port)
        }
    }
}
