//! When each gossip sender was last heard from.

use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::time::Duration;

use crate::protocol::{PeerEndpoint, PeerId};

#[derive(Debug, Clone)]
struct LivenessEntry {
    last_seen: DateTime<Utc>,
    endpoint: Option<PeerEndpoint>,
}

/// Tracks liveness of peers that send us gossip.
///
/// Separate from the discovery table: entries here carry no reputation and
/// are refreshed by any inbound message.
#[derive(Debug, Clone, Default)]
pub struct LivenessTable {
    entries: HashMap<PeerId, LivenessEntry>,
}

impl LivenessTable {
    /// Creates an empty table.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Marks `peer_id` as seen at `now`.
    ///
    /// A known endpoint is kept when `endpoint` is `None`. Returns true if
    /// the peer was not tracked before.
    pub fn touch(
        &mut self,
        peer_id: &PeerId,
        endpoint: Option<PeerEndpoint>,
        now: DateTime<Utc>,
    ) -> bool {
        match self.entries.get_mut(peer_id) {
            Some(entry) => {
                if now > entry.last_seen {
                    entry.last_seen = now;
                }
                if endpoint.is_some() {
                    entry.endpoint = endpoint;
                }
                false
            }
            None => {
                self.entries.insert(
                    peer_id.clone(),
                    LivenessEntry {
                        last_seen: now,
                        endpoint,
                    },
                );
                true
            }
        }
    }

    /// Removes entries not seen for longer than `threshold`. Returns the
    /// removed ids.
    pub fn prune(&mut self, now: DateTime<Utc>, threshold: Duration) -> Vec<PeerId> {
        let stale: Vec<PeerId> = self
            .entries
            .iter()
            .filter(|(_, entry)| {
                now.signed_duration_since(entry.last_seen)
                    .to_std()
                    .is_ok_and(|idle| idle > threshold)
            })
            .map(|(peer_id, _)| peer_id.clone())
            .collect();
        for peer_id in &stale {
            self.entries.remove(peer_id);
        }
        stale
    }

    /// Returns when `peer_id` was last seen.
    #[must_use]
    pub fn last_seen(&self, peer_id: &PeerId) -> Option<DateTime<Utc>> {
        self.entries.get(peer_id).map(|e| e.last_seen)
    }

    /// Returns all tracked peers, sorted by id.
    #[must_use]
    pub fn live_peers(&self) -> Vec<PeerId> {
        let mut peers: Vec<PeerId> = self.entries.keys().cloned().collect();
        peers.sort();
        peers
    }

    /// Returns the gossip endpoints of tracked peers that advertised one.
    #[must_use]
    pub fn endpoints(&self) -> Vec<PeerEndpoint> {
        self.entries
            .values()
            .filter_map(|e| e.endpoint.clone())
            .collect()
    }

    /// Returns the number of tracked peers.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Returns true if no peers are tracked.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
