//! Configuration for the discovery engine and the gossip broadcaster.

use std::time::Duration;

use crate::discovery::BootstrapNode;
use crate::error::P2pError;

/// Default multiplier for loop cadences (`cadence = scale / state`).
pub const DEFAULT_CADENCE_SCALE: Duration = Duration::from_secs(10);
/// Default bound on joining workers during stop.
pub const DEFAULT_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(10);

/// Configuration for the discovery engine.
#[derive(Debug, Clone)]
pub struct DiscoveryConfig {
    /// Bootstrap addresses in `host:port` form.
    pub bootstrap_nodes: Vec<String>,
    /// Interface the discovery responder binds to.
    pub listen_host: String,
    /// Port for answering discovery requests. `None` disables the responder.
    pub listen_port: Option<u16>,
    /// Gossip port advertised to other peers.
    pub gossip_port: Option<u16>,
    /// Maximum number of peer records.
    pub max_peers: usize,
    /// Records idle longer than this are removed by cleanup.
    pub peer_timeout: Duration,
    /// Records below this reputation are removed by cleanup.
    pub min_reputation: f64,
    /// Multiplier for loop cadences.
    pub cadence_scale: Duration,
    /// Bound on establishing a connection.
    pub connect_timeout: Duration,
    /// Bound on each send or receive.
    pub io_timeout: Duration,
    /// Bound on joining workers during stop.
    pub shutdown_timeout: Duration,
    /// Peers contacted per exchange round.
    pub exchange_fanout: usize,
    /// Peers offered in each exchange request.
    pub exchange_share: usize,
    /// Peers returned in each response.
    pub advertise_limit: usize,
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            bootstrap_nodes: Vec::new(),
            listen_host: "0.0.0.0".to_string(),
            listen_port: None,
            gossip_port: None,
            max_peers: 50,
            peer_timeout: Duration::from_secs(300),
            min_reputation: 0.3,
            cadence_scale: DEFAULT_CADENCE_SCALE,
            connect_timeout: Duration::from_secs(5),
            io_timeout: Duration::from_secs(5),
            shutdown_timeout: DEFAULT_SHUTDOWN_TIMEOUT,
            exchange_fanout: 3,
            exchange_share: 5,
            advertise_limit: 50,
        }
    }
}

impl DiscoveryConfig {
    /// Creates a config for nodes on one host with short cadences and
    /// timeouts.
    #[must_use]
    pub fn local() -> Self {
        Self {
            listen_host: "127.0.0.1".to_string(),
            cadence_scale: Duration::from_millis(100),
            connect_timeout: Duration::from_millis(500),
            io_timeout: Duration::from_millis(500),
            shutdown_timeout: Duration::from_secs(2),
            ..Self::default()
        }
    }

    /// Sets the bootstrap addresses.
    #[must_use]
    pub fn with_bootstrap_nodes<I, S>(mut self, nodes: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.bootstrap_nodes = nodes.into_iter().map(Into::into).collect();
        self
    }

    /// Sets the responder bind address.
    #[must_use]
    pub fn with_listen(mut self, host: impl Into<String>, port: u16) -> Self {
        self.listen_host = host.into();
        self.listen_port = Some(port);
        self
    }

    /// Sets the gossip port advertised to peers.
    #[must_use]
    pub const fn with_gossip_port(mut self, port: u16) -> Self {
        self.gossip_port = Some(port);
        self
    }

    /// Sets the maximum number of peer records.
    #[must_use]
    pub const fn with_max_peers(mut self, max: usize) -> Self {
        self.max_peers = max;
        self
    }

    /// Sets the idle timeout after which records are removed.
    #[must_use]
    pub const fn with_peer_timeout(mut self, timeout: Duration) -> Self {
        self.peer_timeout = timeout;
        self
    }

    /// Sets the cadence multiplier.
    #[must_use]
    pub const fn with_cadence_scale(mut self, scale: Duration) -> Self {
        self.cadence_scale = scale;
        self
    }

    /// Sets connect and I/O timeouts.
    #[must_use]
    pub const fn with_timeouts(mut self, connect: Duration, io: Duration) -> Self {
        self.connect_timeout = connect;
        self.io_timeout = io;
        self
    }

    /// Sets the bound on joining workers during stop.
    #[must_use]
    pub const fn with_shutdown_timeout(mut self, timeout: Duration) -> Self {
        self.shutdown_timeout = timeout;
        self
    }

    /// Parses the bootstrap addresses.
    ///
    /// # Errors
    ///
    /// Returns [`P2pError::Config`] for the first address that is not
    /// `host:port`.
    pub fn bootstrap(&self) -> Result<Vec<BootstrapNode>, P2pError> {
        self.bootstrap_nodes
            .iter()
            .map(|addr| BootstrapNode::parse(addr))
            .collect()
    }

    /// Checks the configuration for values the engine cannot run with.
    ///
    /// # Errors
    ///
    /// Returns [`P2pError::Config`] describing the first invalid field.
    pub fn validate(&self) -> Result<(), P2pError> {
        if self.max_peers == 0 {
            return Err(P2pError::Config("max_peers must be at least 1".into()));
        }
        if !(0.0..=1.0).contains(&self.min_reputation) {
            return Err(P2pError::Config(format!(
                "min_reputation {} outside [0, 1]",
                self.min_reputation
            )));
        }
        if self.exchange_fanout == 0 {
            return Err(P2pError::Config("exchange_fanout must be at least 1".into()));
        }
        // An ephemeral gossip port cannot be advertised
        if self.gossip_port == Some(0) {
            return Err(P2pError::Config("gossip_port must not be 0".into()));
        }
        require_nonzero("peer_timeout", self.peer_timeout)?;
        require_nonzero("cadence_scale", self.cadence_scale)?;
        require_nonzero("connect_timeout", self.connect_timeout)?;
        require_nonzero("io_timeout", self.io_timeout)?;
        require_nonzero("shutdown_timeout", self.shutdown_timeout)?;
        self.bootstrap()?;
        Ok(())
    }
}

/// Configuration for the gossip broadcaster.
#[derive(Debug, Clone)]
pub struct GossipConfig {
    /// Interface the gossip listener binds to.
    pub listen_host: String,
    /// Port for inbound gossip. `None` disables the built-in listener.
    pub listen_port: Option<u16>,
    /// Multiplier for loop cadences.
    pub cadence_scale: Duration,
    /// Liveness entries older than this are pruned.
    pub staleness_threshold: Duration,
    /// Maximum number of queued CIDs.
    pub max_pending: usize,
    /// Longest accepted CID, in bytes.
    pub max_cid_len: usize,
    /// Bound on establishing a connection.
    pub connect_timeout: Duration,
    /// Bound on reading an inbound message.
    pub io_timeout: Duration,
    /// Bound on joining workers during stop.
    pub shutdown_timeout: Duration,
}

impl Default for GossipConfig {
    fn default() -> Self {
        Self {
            listen_host: "0.0.0.0".to_string(),
            listen_port: None,
            cadence_scale: DEFAULT_CADENCE_SCALE,
            staleness_threshold: Duration::from_secs(300),
            max_pending: 10_000,
            max_cid_len: 256,
            connect_timeout: Duration::from_secs(5),
            io_timeout: Duration::from_secs(3),
            shutdown_timeout: DEFAULT_SHUTDOWN_TIMEOUT,
        }
    }
}

impl GossipConfig {
    /// Creates a config for nodes on one host with short cadences and
    /// timeouts.
    #[must_use]
    pub fn local() -> Self {
        Self {
            listen_host: "127.0.0.1".to_string(),
            cadence_scale: Duration::from_millis(100),
            connect_timeout: Duration::from_millis(500),
            io_timeout: Duration::from_millis(500),
            shutdown_timeout: Duration::from_secs(2),
            ..Self::default()
        }
    }

    /// Sets the listener bind address.
    #[must_use]
    pub fn with_listen(mut self, host: impl Into<String>, port: u16) -> Self {
        self.listen_host = host.into();
        self.listen_port = Some(port);
        self
    }

    /// Sets the cadence multiplier.
    #[must_use]
    pub const fn with_cadence_scale(mut self, scale: Duration) -> Self {
        self.cadence_scale = scale;
        self
    }

    /// Sets the liveness staleness threshold.
    #[must_use]
    pub const fn with_staleness_threshold(mut self, threshold: Duration) -> Self {
        self.staleness_threshold = threshold;
        self
    }

    /// Sets the queue bound.
    #[must_use]
    pub const fn with_max_pending(mut self, max: usize) -> Self {
        self.max_pending = max;
        self
    }

    /// Sets connect and I/O timeouts.
    #[must_use]
    pub const fn with_timeouts(mut self, connect: Duration, io: Duration) -> Self {
        self.connect_timeout = connect;
        self.io_timeout = io;
        self
    }

    /// Checks the configuration for values the broadcaster cannot run with.
    ///
    /// # Errors
    ///
    /// Returns [`P2pError::Config`] describing the first invalid field.
    pub fn validate(&self) -> Result<(), P2pError> {
        if self.max_pending == 0 {
            return Err(P2pError::Config("max_pending must be at least 1".into()));
        }
        if self.max_cid_len == 0 {
            return Err(P2pError::Config("max_cid_len must be at least 1".into()));
        }
        require_nonzero("cadence_scale", self.cadence_scale)?;
        require_nonzero("staleness_threshold", self.staleness_threshold)?;
        require_nonzero("connect_timeout", self.connect_timeout)?;
        require_nonzero("io_timeout", self.io_timeout)?;
        require_nonzero("shutdown_timeout", self.shutdown_timeout)?;
        Ok(())
    }
}

fn require_nonzero(field: &str, value: Duration) -> Result<(), P2pError> {
    if value.is_zero() {
        return Err(P2pError::Config(format!("{field} must be greater than zero")));
    }
    Ok(())
}
