//! Gossip handler that reports received proofs through tracing.

use std::sync::atomic::{AtomicU64, Ordering};

use pow_p2p::{GossipHandler, PeerId};
use tracing::{debug, info};

/// Logs every proof CID handed up by the broadcaster.
#[derive(Debug, Default)]
pub struct LoggingHandler {
    received: AtomicU64,
}

impl LoggingHandler {
    /// Creates a handler with a zeroed counter.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of CIDs seen so far.
    pub fn received(&self) -> u64 {
        self.received.load(Ordering::Relaxed)
    }
}

impl GossipHandler for LoggingHandler {
    fn on_cid(&self, cid: &str, from_peer: &PeerId) {
        let total = self.received.fetch_add(1, Ordering::Relaxed) + 1;
        info!(cid, from_peer = %from_peer, total, "proof received");
    }

    fn on_liveness(&self, peer_id: &PeerId) {
        debug!(peer_id = %peer_id, "peer alive");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counts_received_cids() {
        let handler = LoggingHandler::new();
        handler.on_cid("QmA", &PeerId::from("miner"));
        handler.on_cid("QmB", &PeerId::from("miner"));
        handler.on_liveness(&PeerId::from("miner"));
        assert_eq!(handler.received(), 2);
    }
}
