//! Node configuration.
//!
//! A JSON file with two optional sections:
//! - `discovery`: bootstrap addresses, responder port and peer table limits
//! - `gossip`: listener port, queue bound and liveness threshold
//!
//! Missing fields fall back to the library defaults.

use std::path::Path;
use std::time::Duration;

use pow_p2p::{DiscoveryConfig, GossipConfig, PeerId};
use serde::{Deserialize, Serialize};

use crate::error::NodeError;

/// Discovery settings as written in the config file.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct DiscoverySection {
    /// Bootstrap addresses in `host:port` form.
    pub bootstrap_nodes: Vec<String>,
    /// Interface the responder binds to.
    pub listen_host: String,
    /// Responder port. Absent means the node only makes outbound requests.
    pub listen_port: Option<u16>,
    /// Maximum number of peer records.
    pub max_peers: usize,
    /// Idle time after which a peer is dropped.
    pub peer_timeout_secs: u64,
    /// Reputation below which a peer is dropped.
    pub min_reputation: f64,
}

impl Default for DiscoverySection {
    fn default() -> Self {
        let defaults = DiscoveryConfig::default();
        Self {
            bootstrap_nodes: Vec::new(),
            listen_host: defaults.listen_host,
            listen_port: None,
            max_peers: defaults.max_peers,
            peer_timeout_secs: defaults.peer_timeout.as_secs(),
            min_reputation: defaults.min_reputation,
        }
    }
}

/// Gossip settings as written in the config file.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct GossipSection {
    /// Interface the gossip listener binds to.
    pub listen_host: String,
    /// Listener port, also advertised through discovery.
    pub listen_port: Option<u16>,
    /// Bound on queued, unsent CIDs.
    pub max_pending: usize,
    /// Peers silent for longer than this stop counting as live.
    pub staleness_threshold_secs: u64,
}

impl Default for GossipSection {
    fn default() -> Self {
        let defaults = GossipConfig::default();
        Self {
            listen_host: defaults.listen_host,
            listen_port: None,
            max_pending: defaults.max_pending,
            staleness_threshold_secs: defaults.staleness_threshold.as_secs(),
        }
    }
}

/// Main node configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct NodeConfig {
    /// Stable identity. A random one is generated when absent.
    pub peer_id: Option<String>,
    /// Base for every loop cadence, in milliseconds.
    pub cadence_scale_ms: Option<u64>,
    /// Discovery configuration.
    pub discovery: DiscoverySection,
    /// Gossip configuration.
    pub gossip: GossipSection,
}

impl NodeConfig {
    /// Load configuration from a JSON file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, NodeError> {
        let content = std::fs::read_to_string(path.as_ref()).map_err(|e| {
            NodeError::Config(format!(
                "failed to read config file '{}': {}",
                path.as_ref().display(),
                e
            ))
        })?;

        Self::from_json(&content)
    }

    /// Parse configuration from a JSON string.
    ///
    /// # Errors
    ///
    /// Returns an error if the JSON is invalid or fails validation.
    pub fn from_json(content: &str) -> Result<Self, NodeError> {
        let config: Self = serde_json::from_str(content)
            .map_err(|e| NodeError::Config(format!("invalid JSON: {e}")))?;

        config.validate()?;
        Ok(config)
    }

    /// Write the configuration as pretty JSON.
    pub fn save(&self, path: impl AsRef<Path>) -> Result<(), NodeError> {
        let path = path.as_ref();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }
        let json = serde_json::to_string_pretty(self)
            .map_err(|e| NodeError::Config(format!("failed to serialize config: {e}")))?;
        std::fs::write(path, json)?;
        Ok(())
    }

    /// Validate the configuration.
    ///
    /// # Errors
    ///
    /// Returns an error if any configuration values are invalid.
    pub fn validate(&self) -> Result<(), NodeError> {
        if self.peer_id.as_deref().is_some_and(|id| id.trim().is_empty()) {
            return Err(NodeError::Config("peer_id cannot be empty".to_string()));
        }
        if self.cadence_scale_ms == Some(0) {
            return Err(NodeError::Config(
                "cadence_scale_ms must be greater than 0".to_string(),
            ));
        }
        if self.gossip.listen_port == Some(0) {
            return Err(NodeError::Config(
                "gossip.listen_port must be a fixed port".to_string(),
            ));
        }

        self.discovery_config().validate()?;
        self.gossip_config().validate()?;
        Ok(())
    }

    /// The configured identity, or a fresh random one.
    pub fn peer_id(&self) -> PeerId {
        self.peer_id
            .as_deref()
            .map_or_else(PeerId::random, PeerId::new)
    }

    /// Builds the discovery engine configuration.
    ///
    /// The gossip listener port is advertised so peers can fan out to us.
    pub fn discovery_config(&self) -> DiscoveryConfig {
        let section = &self.discovery;
        let mut config = DiscoveryConfig {
            bootstrap_nodes: section.bootstrap_nodes.clone(),
            listen_host: section.listen_host.clone(),
            listen_port: section.listen_port,
            gossip_port: self.gossip.listen_port,
            max_peers: section.max_peers,
            peer_timeout: Duration::from_secs(section.peer_timeout_secs),
            min_reputation: section.min_reputation,
            ..DiscoveryConfig::default()
        };
        if let Some(scale) = self.cadence_scale() {
            config.cadence_scale = scale;
        }
        config
    }

    /// Builds the gossip broadcaster configuration.
    pub fn gossip_config(&self) -> GossipConfig {
        let section = &self.gossip;
        let mut config = GossipConfig {
            listen_host: section.listen_host.clone(),
            listen_port: section.listen_port,
            max_pending: section.max_pending,
            staleness_threshold: Duration::from_secs(section.staleness_threshold_secs),
            ..GossipConfig::default()
        };
        if let Some(scale) = self.cadence_scale() {
            config.cadence_scale = scale;
        }
        config
    }

    fn cadence_scale(&self) -> Option<Duration> {
        self.cadence_scale_ms.map(Duration::from_millis)
    }
}
