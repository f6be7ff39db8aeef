//! # pow-p2p
//!
//! Peer discovery and gossip broadcast for the proof-of-work network.
//!
//! This crate provides:
//!
//! - Peer discovery via bootstrap nodes and peer exchange
//! - A reputation-scored, bounded peer table
//! - Batched gossip of proof CIDs at a self-regulating cadence
//! - Newline-delimited JSON over TCP with bounded timeouts
//!
//! ## Core Types
//!
//! - [`DiscoveryEngine`]: Bootstrap, exchange and cleanup loops over a [`PeerTable`]
//! - [`GossipBroadcaster`]: Broadcast, listen and cleanup loops over a [`PendingQueue`]
//! - [`EquilibriumState`]: The λ/η scalars that pace both components
//! - [`WireMessage`]: Everything that crosses the wire
//! - [`Transport`]: The connection seam, with [`TcpTransport`] for production

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod config;
pub mod discovery;
pub mod equilibrium;
pub mod error;
pub mod gossip;
mod lifecycle;
pub mod message;
pub mod protocol;
pub mod transport;

pub use config::{DiscoveryConfig, GossipConfig};
pub use discovery::{
    BootstrapNode, DiscoveryEngine, MergeOutcome, PeerStatistics, PeerTable, SweepReport,
};
pub use equilibrium::EquilibriumState;
pub use error::P2pError;
pub use gossip::{
    BroadcastReport, ChannelHandler, GossipBroadcaster, GossipEvent, GossipHandler,
    GossipStatistics, LivenessTable, PeerSource, PendingQueue, QueueOutcome, StaticPeers,
};
pub use lifecycle::LoopState;
pub use message::{AdvertisedPeer, ResponderInfo, WireMessage};
pub use protocol::{DiscoveryProtocol, PeerEndpoint, PeerId, PeerRecord};
pub use transport::{Connection, FramedConnection, TcpTransport, Transport};
