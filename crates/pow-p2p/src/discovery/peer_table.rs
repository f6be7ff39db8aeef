//! Bounded, reputation-scored table of known peers.

use chrono::{DateTime, Utc};
use rand::Rng;
use rand::seq::SliceRandom;
use std::collections::HashMap;
use std::time::Duration;

use crate::message::AdvertisedPeer;
use crate::protocol::{DiscoveryProtocol, FAILURE_PENALTY, PeerId, PeerRecord};

/// What a merge did to the table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MergeOutcome {
    /// A new record was inserted.
    Inserted {
        /// Record evicted to keep the table within `max_peers`.
        evicted: Option<PeerId>,
    },
    /// An existing record was refreshed in place.
    Refreshed,
}

impl MergeOutcome {
    /// Returns true if a new record was created.
    #[must_use]
    pub const fn is_insert(&self) -> bool {
        matches!(self, Self::Inserted { .. })
    }
}

/// A table tracking known peers, keyed by peer id.
///
/// Holds at most `max_peers` records. When an insert overflows the table the
/// record with the oldest `last_seen` is evicted.
#[derive(Debug, Clone)]
pub struct PeerTable {
    peers: HashMap<PeerId, PeerRecord>,
    max_peers: usize,
}

impl PeerTable {
    /// Creates a new empty peer table holding at most `max_peers` records.
    #[must_use]
    pub fn new(max_peers: usize) -> Self {
        Self {
            peers: HashMap::new(),
            max_peers: max_peers.max(1),
        }
    }

    /// Returns the capacity of the table.
    #[must_use]
    pub const fn max_peers(&self) -> usize {
        self.max_peers
    }

    /// Merges an advertised peer seen at `now`.
    ///
    /// Known peers are refreshed (last seen, +0.1 reputation, capability
    /// union). Unknown peers are inserted, possibly evicting the oldest
    /// record.
    pub fn merge(
        &mut self,
        advert: &AdvertisedPeer,
        protocol: DiscoveryProtocol,
        now: DateTime<Utc>,
    ) -> MergeOutcome {
        if let Some(existing) = self.peers.get_mut(&advert.peer_id) {
            existing.refresh(advert, now);
            return MergeOutcome::Refreshed;
        }

        self.peers.insert(
            advert.peer_id.clone(),
            PeerRecord::from_advertised(advert, protocol, now),
        );

        let evicted = if self.peers.len() > self.max_peers {
            self.evict_oldest(&advert.peer_id)
        } else {
            None
        };
        MergeOutcome::Inserted { evicted }
    }

    /// Removes the record with the oldest `last_seen`, never `keep`.
    fn evict_oldest(&mut self, keep: &PeerId) -> Option<PeerId> {
        let victim = self
            .peers
            .values()
            .filter(|record| record.peer_id() != keep)
            .min_by(|a, b| {
                a.last_seen()
                    .cmp(&b.last_seen())
                    .then_with(|| a.peer_id().cmp(b.peer_id()))
            })
            .map(|record| record.peer_id().clone())?;
        self.peers.remove(&victim);
        Some(victim)
    }

    /// Rewards a peer after a successful interaction.
    ///
    /// Returns the new reputation, or `None` if the peer is unknown.
    pub fn record_success(&mut self, peer_id: &PeerId, bonus: f64, now: DateTime<Utc>) -> Option<f64> {
        let record = self.peers.get_mut(peer_id)?;
        record.touch(now);
        record.reward(bonus);
        Some(record.reputation())
    }

    /// Penalizes a peer after a failed interaction. Never removes it.
    ///
    /// Returns the new reputation, or `None` if the peer is unknown.
    pub fn record_failure(&mut self, peer_id: &PeerId) -> Option<f64> {
        let record = self.peers.get_mut(peer_id)?;
        record.penalize(FAILURE_PENALTY);
        Some(record.reputation())
    }

    /// Removes records idle longer than `peer_timeout` or below
    /// `min_reputation`. Returns the removed ids.
    pub fn cleanup(
        &mut self,
        now: DateTime<Utc>,
        peer_timeout: Duration,
        min_reputation: f64,
    ) -> Vec<PeerId> {
        let doomed: Vec<PeerId> = self
            .peers
            .values()
            .filter(|r| r.is_stale(now, peer_timeout) || r.reputation() < min_reputation)
            .map(|r| r.peer_id().clone())
            .collect();
        for peer_id in &doomed {
            self.peers.remove(peer_id);
        }
        doomed
    }

    /// Retrieves a peer's record by id.
    #[must_use]
    pub fn get(&self, peer_id: &PeerId) -> Option<&PeerRecord> {
        self.peers.get(peer_id)
    }

    /// Returns true if the peer is known.
    #[must_use]
    pub fn contains(&self, peer_id: &PeerId) -> bool {
        self.peers.contains_key(peer_id)
    }

    /// Returns the number of peers in the table.
    #[must_use]
    pub fn len(&self) -> usize {
        self.peers.len()
    }

    /// Returns true if the table is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }

    /// Returns copies of all records, most recently seen first.
    #[must_use]
    pub fn snapshot(&self) -> Vec<PeerRecord> {
        let mut records: Vec<PeerRecord> = self.peers.values().cloned().collect();
        records.sort_by(|a, b| {
            b.last_seen()
                .cmp(&a.last_seen())
                .then_with(|| a.peer_id().cmp(b.peer_id()))
        });
        records
    }

    /// Returns records seen within `peer_timeout` with reputation of at
    /// least `min_reputation`.
    #[must_use]
    pub fn connected(
        &self,
        now: DateTime<Utc>,
        peer_timeout: Duration,
        min_reputation: f64,
    ) -> Vec<PeerRecord> {
        self.snapshot()
            .into_iter()
            .filter(|r| !r.is_stale(now, peer_timeout) && r.reputation() >= min_reputation)
            .collect()
    }

    /// Picks up to `count` connected peers at random.
    pub fn sample_connected<R: Rng + ?Sized>(
        &self,
        rng: &mut R,
        count: usize,
        now: DateTime<Utc>,
        peer_timeout: Duration,
        min_reputation: f64,
    ) -> Vec<PeerRecord> {
        let mut candidates = self.connected(now, peer_timeout, min_reputation);
        if candidates.len() > count {
            candidates.shuffle(rng);
            candidates.truncate(count);
        }
        candidates
    }

    /// Returns up to `limit` peers for sharing, highest reputation first,
    /// excluding `exclude`.
    #[must_use]
    pub fn advertise(&self, limit: usize, exclude: Option<&PeerId>) -> Vec<AdvertisedPeer> {
        let mut records: Vec<&PeerRecord> = self
            .peers
            .values()
            .filter(|r| exclude.is_none_or(|id| r.peer_id() != id))
            .collect();
        records.sort_by(|a, b| {
            b.reputation()
                .total_cmp(&a.reputation())
                .then_with(|| b.last_seen().cmp(&a.last_seen()))
                .then_with(|| a.peer_id().cmp(b.peer_id()))
        });
        records
            .into_iter()
            .take(limit)
            .map(PeerRecord::to_advertised)
            .collect()
    }

    /// Finds peers that advertise a specific capability.
    #[must_use]
    pub fn find_by_capability(&self, capability: &str) -> Vec<&PeerRecord> {
        self.peers
            .values()
            .filter(|record| record.capabilities().contains(capability))
            .collect()
    }

    /// Returns the mean reputation, or 0.0 for an empty table.
    #[must_use]
    pub fn average_reputation(&self) -> f64 {
        if self.peers.is_empty() {
            return 0.0;
        }
        self.peers.values().map(PeerRecord::reputation).sum::<f64>() / self.peers.len() as f64
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use proptest::prelude::*;
    use rand::SeedableRng;
    use rand::rngs::StdRng;

    const TIMEOUT: Duration = Duration::from_secs(300);

    fn at(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(1_700_000_000 + secs, 0).unwrap()
    }

    fn advert(id: &str) -> AdvertisedPeer {
        AdvertisedPeer::new(id, "1.2.3.4", 9000)
    }

    #[test]
    fn first_discovery_inserts_with_full_reputation() {
        let mut table = PeerTable::new(50);
        let outcome = table.merge(&advert("p1"), DiscoveryProtocol::Bootstrap, at(0));

        assert_eq!(outcome, MergeOutcome::Inserted { evicted: None });
        assert_eq!(table.len(), 1);
        let record = table.get(&PeerId::from("p1")).unwrap();
        assert!((record.reputation() - 1.0).abs() < f64::EPSILON);
        assert_eq!(record.protocol(), DiscoveryProtocol::Bootstrap);
    }

    #[test]
    fn rediscovery_updates_in_place() {
        let mut table = PeerTable::new(50);
        table.merge(
            &advert("p1").with_capabilities(["miner"]),
            DiscoveryProtocol::Bootstrap,
            at(0),
        );
        table.record_failure(&PeerId::from("p1"));
        table.record_failure(&PeerId::from("p1"));

        let outcome = table.merge(
            &advert("p1").with_capabilities(["relay"]),
            DiscoveryProtocol::PeerExchange,
            at(5),
        );

        assert_eq!(outcome, MergeOutcome::Refreshed);
        assert_eq!(table.len(), 1);
        let record = table.get(&PeerId::from("p1")).unwrap();
        assert_eq!(record.last_seen(), at(5));
        assert!((record.reputation() - 0.9).abs() < 1e-9);
        assert_eq!(record.capabilities().len(), 2);
        // The first protocol sticks
        assert_eq!(record.protocol(), DiscoveryProtocol::Bootstrap);
    }

    #[test]
    fn overflow_evicts_oldest_last_seen() {
        let mut table = PeerTable::new(2);
        table.merge(&advert("p1"), DiscoveryProtocol::Bootstrap, at(0));
        table.merge(&advert("p2"), DiscoveryProtocol::Bootstrap, at(1));
        let outcome = table.merge(&advert("p3"), DiscoveryProtocol::Bootstrap, at(2));

        assert_eq!(
            outcome,
            MergeOutcome::Inserted {
                evicted: Some(PeerId::from("p1"))
            }
        );
        assert_eq!(table.len(), 2);
        assert!(!table.contains(&PeerId::from("p1")));
        assert!(table.contains(&PeerId::from("p2")));
        assert!(table.contains(&PeerId::from("p3")));
    }

    #[test]
    fn eviction_ignores_reputation() {
        let mut table = PeerTable::new(2);
        table.merge(&advert("old-good"), DiscoveryProtocol::Bootstrap, at(0));
        table.merge(&advert("new-bad"), DiscoveryProtocol::Bootstrap, at(1));
        for _ in 0..5 {
            table.record_failure(&PeerId::from("new-bad"));
        }
        table.merge(&advert("p3"), DiscoveryProtocol::Bootstrap, at(2));

        assert!(!table.contains(&PeerId::from("old-good")));
        assert!(table.contains(&PeerId::from("new-bad")));
    }

    #[test]
    fn new_record_is_never_the_victim() {
        let mut table = PeerTable::new(1);
        table.merge(&advert("p1"), DiscoveryProtocol::Bootstrap, at(10));
        // Same timestamp as older entries must still evict the older one
        table.merge(&advert("p2"), DiscoveryProtocol::Bootstrap, at(0));
        assert!(table.contains(&PeerId::from("p2")));
        assert_eq!(table.len(), 1);
    }

    #[test]
    fn success_and_failure_adjust_reputation() {
        let mut table = PeerTable::new(10);
        table.merge(&advert("p1"), DiscoveryProtocol::Bootstrap, at(0));
        let id = PeerId::from("p1");

        assert!((table.record_failure(&id).unwrap() - 0.9).abs() < 1e-9);
        assert!((table.record_failure(&id).unwrap() - 0.8).abs() < 1e-9);
        assert!((table.record_success(&id, 0.2, at(1)).unwrap() - 1.0).abs() < 1e-9);
        assert!((table.record_success(&id, 0.2, at(2)).unwrap() - 1.0).abs() < 1e-9);
        assert!(table.record_failure(&PeerId::from("ghost")).is_none());
    }

    #[test]
    fn cleanup_removes_stale_and_low_reputation() {
        let mut table = PeerTable::new(10);
        table.merge(&advert("stale"), DiscoveryProtocol::Bootstrap, at(0));
        table.merge(&advert("fresh"), DiscoveryProtocol::Bootstrap, at(301));
        table.merge(&advert("bad"), DiscoveryProtocol::Bootstrap, at(301));
        for _ in 0..8 {
            table.record_failure(&PeerId::from("bad"));
        }

        let mut removed = table.cleanup(at(301), TIMEOUT, 0.3);
        removed.sort();

        assert_eq!(removed, vec![PeerId::from("bad"), PeerId::from("stale")]);
        assert_eq!(table.len(), 1);
        assert!(table.contains(&PeerId::from("fresh")));
    }

    #[test]
    fn cleanup_keeps_peer_at_exact_timeout() {
        let mut table = PeerTable::new(10);
        table.merge(&advert("edge"), DiscoveryProtocol::Bootstrap, at(0));
        assert!(table.cleanup(at(300), TIMEOUT, 0.3).is_empty());
        assert_eq!(table.cleanup(at(301), TIMEOUT, 0.3).len(), 1);
    }

    #[test]
    fn connected_filters_and_sample_is_bounded() {
        let mut table = PeerTable::new(10);
        for i in 0..6 {
            table.merge(&advert(&format!("p{i}")), DiscoveryProtocol::Bootstrap, at(100));
        }
        table.merge(&advert("idle"), DiscoveryProtocol::Bootstrap, at(-500));
        for _ in 0..8 {
            table.record_failure(&PeerId::from("p0"));
        }

        let connected = table.connected(at(100), TIMEOUT, 0.3);
        assert_eq!(connected.len(), 5);

        let mut rng = StdRng::seed_from_u64(7);
        let sample = table.sample_connected(&mut rng, 3, at(100), TIMEOUT, 0.3);
        assert_eq!(sample.len(), 3);
        assert!(sample.iter().all(|r| r.peer_id().as_str() != "idle"));
        assert!(sample.iter().all(|r| r.peer_id().as_str() != "p0"));
    }

    #[test]
    fn advertise_prefers_reputation_and_excludes() {
        let mut table = PeerTable::new(10);
        table.merge(&advert("a"), DiscoveryProtocol::Bootstrap, at(0));
        table.merge(&advert("b"), DiscoveryProtocol::Bootstrap, at(0));
        table.merge(&advert("c"), DiscoveryProtocol::Bootstrap, at(0));
        table.record_failure(&PeerId::from("a"));

        let shared = table.advertise(2, Some(&PeerId::from("c")));
        let ids: Vec<&str> = shared.iter().map(|p| p.peer_id.as_str()).collect();
        assert_eq!(ids, vec!["b", "a"]);
    }

    #[test]
    fn find_by_capability() {
        let mut table = PeerTable::new(10);
        table.merge(
            &advert("miner").with_capabilities(["mining", "relay"]),
            DiscoveryProtocol::Bootstrap,
            at(0),
        );
        table.merge(
            &advert("relay").with_capabilities(["relay"]),
            DiscoveryProtocol::Bootstrap,
            at(0),
        );

        assert_eq!(table.find_by_capability("relay").len(), 2);
        assert_eq!(table.find_by_capability("mining").len(), 1);
        assert!(table.find_by_capability("archive").is_empty());
    }

    #[test]
    fn average_reputation() {
        let mut table = PeerTable::new(10);
        assert!(table.average_reputation().abs() < f64::EPSILON);

        table.merge(&advert("a"), DiscoveryProtocol::Bootstrap, at(0));
        table.merge(&advert("b"), DiscoveryProtocol::Bootstrap, at(0));
        for _ in 0..4 {
            table.record_failure(&PeerId::from("b"));
        }
        assert!((table.average_reputation() - 0.8).abs() < 1e-9);
    }

    #[test]
    fn snapshot_is_most_recent_first() {
        let mut table = PeerTable::new(10);
        table.merge(&advert("old"), DiscoveryProtocol::Bootstrap, at(0));
        table.merge(&advert("new"), DiscoveryProtocol::Bootstrap, at(9));
        let ids: Vec<String> = table
            .snapshot()
            .iter()
            .map(|r| r.peer_id().to_string())
            .collect();
        assert_eq!(ids, vec!["new", "old"]);
    }

    proptest! {
        #[test]
        fn table_never_exceeds_capacity(
            max_peers in 1usize..8,
            inserts in proptest::collection::vec((0u8..20, 0i64..1_000), 0..64),
        ) {
            let mut table = PeerTable::new(max_peers);
            for (id, t) in inserts {
                table.merge(&advert(&format!("p{id}")), DiscoveryProtocol::PeerExchange, at(t));
                prop_assert!(table.len() <= max_peers);
            }
        }

        #[test]
        fn repeated_merges_keep_one_record(times in 1usize..20) {
            let mut table = PeerTable::new(4);
            for t in 0..times {
                table.merge(&advert("same"), DiscoveryProtocol::Bootstrap, at(t as i64));
            }
            prop_assert_eq!(table.len(), 1);
            let rep = table.get(&PeerId::from("same")).unwrap().reputation();
            prop_assert!((0.0..=1.0).contains(&rep));
        }
    }
}
