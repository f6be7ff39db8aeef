//! Batched gossip broadcast of proof announcements.
//!
//! - [`GossipBroadcaster`]: Queues announcements and fans them out in batches
//! - [`PendingQueue`]: Bounded set of CIDs awaiting the next flush
//! - [`LivenessTable`]: When each gossip sender was last heard from
//! - [`PeerSource`]: Where fan-out targets come from
//! - [`GossipHandler`]: Application hook for delivered CIDs
//!
//! Received CIDs are delivered to the handler and not relayed further.

mod broadcaster;
mod handler;
mod liveness;
mod queue;
mod source;

pub use broadcaster::{BroadcastReport, GossipBroadcaster, GossipStatistics};
pub use handler::{ChannelHandler, GossipEvent, GossipHandler};
pub use liveness::LivenessTable;
pub use queue::{PendingQueue, QueueOutcome};
pub use source::{PeerSource, StaticPeers};
