//! Application hooks for delivered gossip.

use std::fmt;

use tokio::sync::mpsc;
use tracing::warn;

use crate::protocol::PeerId;

/// Events emitted by the gossip broadcaster.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GossipEvent {
    /// A content identifier arrived in a gossip batch.
    CidReceived {
        /// The identifier.
        cid: String,
        /// The peer that sent the batch.
        from_peer: PeerId,
    },

    /// A peer sent us something and is alive.
    PeerSeen {
        /// The live peer.
        peer_id: PeerId,
    },
}

/// Receives identifiers delivered by the gossip broadcaster.
///
/// Called from the listen loop, so implementations must not block.
pub trait GossipHandler: Send + Sync + fmt::Debug {
    /// Called once for each CID in each received batch.
    fn on_cid(&self, cid: &str, from_peer: &PeerId);

    /// Called whenever a peer's liveness is refreshed.
    fn on_liveness(&self, peer_id: &PeerId) {
        let _ = peer_id;
    }
}

/// Forwards gossip to an mpsc channel as [`GossipEvent`]s.
///
/// Events are dropped with a warning when the channel is full.
#[derive(Debug, Clone)]
pub struct ChannelHandler {
    sender: mpsc::Sender<GossipEvent>,
    liveness: bool,
}

impl ChannelHandler {
    /// Creates a handler and the receiving end of its channel.
    #[must_use]
    pub fn new(capacity: usize) -> (Self, mpsc::Receiver<GossipEvent>) {
        let (sender, receiver) = mpsc::channel(capacity.max(1));
        (
            Self {
                sender,
                liveness: false,
            },
            receiver,
        )
    }

    /// Also emits [`GossipEvent::PeerSeen`] events.
    #[must_use]
    pub const fn with_liveness_events(mut self) -> Self {
        self.liveness = true;
        self
    }

    fn emit(&self, event: GossipEvent) {
        if let Err(e) = self.sender.try_send(event) {
            match e {
                mpsc::error::TrySendError::Full(event) => {
                    warn!(?event, "gossip event channel full, dropping event");
                }
                mpsc::error::TrySendError::Closed(_) => {}
            }
        }
    }
}

impl GossipHandler for ChannelHandler {
    fn on_cid(&self, cid: &str, from_peer: &PeerId) {
        self.emit(GossipEvent::CidReceived {
            cid: cid.to_string(),
            from_peer: from_peer.clone(),
        });
    }

    fn on_liveness(&self, peer_id: &PeerId) {
        if self.liveness {
            self.emit(GossipEvent::PeerSeen {
                peer_id: peer_id.clone(),
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn forwards_cids() {
        let (handler, mut events) = ChannelHandler::new(4);
        handler.on_cid("QmA", &PeerId::from("miner"));
        handler.on_liveness(&PeerId::from("miner"));

        assert_eq!(
            events.recv().await,
            Some(GossipEvent::CidReceived {
                cid: "QmA".into(),
                from_peer: PeerId::from("miner"),
            })
        );
        // Liveness events are off by default
        assert!(events.try_recv().is_err());
    }

    #[tokio::test]
    async fn liveness_events_when_enabled() {
        let (handler, mut events) = ChannelHandler::new(4);
        let handler = handler.with_liveness_events();
        handler.on_liveness(&PeerId::from("p1"));

        assert_eq!(
            events.recv().await,
            Some(GossipEvent::PeerSeen {
                peer_id: PeerId::from("p1")
            })
        );
    }

    #[test]
    fn full_channel_drops_without_blocking() {
        let (handler, mut events) = ChannelHandler::new(1);
        handler.on_cid("Qm1", &PeerId::from("p"));
        handler.on_cid("Qm2", &PeerId::from("p"));

        assert!(matches!(
            events.try_recv(),
            Ok(GossipEvent::CidReceived { cid, .. }) if cid == "Qm1"
        ));
        assert!(events.try_recv().is_err());
    }

    #[test]
    fn closed_channel_is_ignored() {
        let (handler, events) = ChannelHandler::new(1);
        drop(events);
        handler.on_cid("Qm1", &PeerId::from("p"));
    }
}
