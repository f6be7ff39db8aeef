//! Where the broadcaster finds its fan-out targets.

use std::fmt;

use parking_lot::RwLock;

use crate::protocol::PeerEndpoint;

/// Supplies the peers a gossip batch is sent to.
pub trait PeerSource: Send + Sync + fmt::Debug {
    /// Returns the current gossip endpoints.
    fn gossip_targets(&self) -> Vec<PeerEndpoint>;
}

/// A fixed, replaceable list of gossip endpoints.
#[derive(Debug, Default)]
pub struct StaticPeers {
    peers: RwLock<Vec<PeerEndpoint>>,
}

impl StaticPeers {
    /// Creates a source with the given endpoints.
    #[must_use]
    pub fn new(peers: Vec<PeerEndpoint>) -> Self {
        Self {
            peers: RwLock::new(peers),
        }
    }

    /// Adds an endpoint, replacing any with the same peer id.
    pub fn add(&self, endpoint: PeerEndpoint) {
        let mut peers = self.peers.write();
        peers.retain(|p| p.peer_id != endpoint.peer_id);
        peers.push(endpoint);
    }

    /// Replaces every endpoint.
    pub fn replace(&self, peers: Vec<PeerEndpoint>) {
        *self.peers.write() = peers;
    }
}

impl PeerSource for StaticPeers {
    fn gossip_targets(&self) -> Vec<PeerEndpoint> {
        self.peers.read().clone()
    }
}
