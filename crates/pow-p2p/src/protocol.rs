//! Core peer types shared by discovery and gossip.
//!
//! - [`PeerId`]: Unique identifier for peers
//! - [`PeerRecord`]: What the discovery engine knows about a peer
//! - [`PeerEndpoint`]: Where to deliver gossip for a peer

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use std::time::Duration;
use uuid::Uuid;

use crate::message::AdvertisedPeer;

/// Reputation assigned to a newly discovered peer.
pub const INITIAL_REPUTATION: f64 = 1.0;
/// Upper bound for reputation.
pub const MAX_REPUTATION: f64 = 1.0;
/// Lower bound for reputation.
pub const MIN_REPUTATION: f64 = 0.0;
/// Bonus applied when a known peer is discovered again.
pub const REDISCOVERY_BONUS: f64 = 0.1;
/// Bonus applied when a validation connection succeeds.
pub const CONNECT_BONUS: f64 = 0.2;
/// Penalty applied when an interaction with the peer fails.
pub const FAILURE_PENALTY: f64 = 0.1;

/// Unique identifier for a peer in the network.
///
/// Peer ids are opaque strings chosen by each node. Fresh nodes use a random
/// UUID.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PeerId(String);

impl PeerId {
    /// Creates a `PeerId` from any string.
    #[must_use]
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Creates a random `PeerId`.
    #[must_use]
    pub fn random() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    /// Returns the id as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Returns true if the id is empty (never valid on the wire).
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.trim().is_empty()
    }
}

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for PeerId {
    fn from(id: &str) -> Self {
        Self::new(id)
    }
}

impl From<String> for PeerId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

/// How a peer record was first learned.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DiscoveryProtocol {
    /// Learned from a bootstrap node's peer list.
    Bootstrap,
    /// Learned during a peer-exchange round.
    PeerExchange,
}

impl fmt::Display for DiscoveryProtocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Bootstrap => f.write_str("bootstrap"),
            Self::PeerExchange => f.write_str("peer_exchange"),
        }
    }
}

/// Information about a known peer in the network.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PeerRecord {
    peer_id: PeerId,
    address: String,
    port: u16,
    protocol: DiscoveryProtocol,
    last_seen: DateTime<Utc>,
    reputation: f64,
    capabilities: BTreeSet<String>,
    gossip_port: Option<u16>,
}

impl PeerRecord {
    /// Creates a new record with full reputation, seen at `now`.
    #[must_use]
    pub fn new(
        peer_id: PeerId,
        address: impl Into<String>,
        port: u16,
        protocol: DiscoveryProtocol,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            peer_id,
            address: address.into(),
            port,
            protocol,
            last_seen: now,
            reputation: INITIAL_REPUTATION,
            capabilities: BTreeSet::new(),
            gossip_port: None,
        }
    }

    /// Creates a record from a peer advertised on the wire.
    #[must_use]
    pub fn from_advertised(
        advert: &AdvertisedPeer,
        protocol: DiscoveryProtocol,
        now: DateTime<Utc>,
    ) -> Self {
        let mut record = Self::new(
            advert.peer_id.clone(),
            advert.address.clone(),
            advert.port,
            protocol,
            now,
        );
        record.capabilities.extend(advert.capabilities.iter().cloned());
        record.gossip_port = advert.gossip_port;
        record
    }

    /// Sets the capabilities.
    #[must_use]
    pub fn with_capabilities<I, S>(mut self, capabilities: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.capabilities = capabilities.into_iter().map(Into::into).collect();
        self
    }

    /// Sets the gossip port.
    #[must_use]
    pub const fn with_gossip_port(mut self, port: u16) -> Self {
        self.gossip_port = Some(port);
        self
    }

    /// Returns the peer's unique identifier.
    #[must_use]
    pub const fn peer_id(&self) -> &PeerId {
        &self.peer_id
    }

    /// Returns the peer's host address.
    #[must_use]
    pub fn address(&self) -> &str {
        &self.address
    }

    /// Returns the peer's discovery port.
    #[must_use]
    pub const fn port(&self) -> u16 {
        self.port
    }

    /// Returns how the peer was first learned.
    #[must_use]
    pub const fn protocol(&self) -> DiscoveryProtocol {
        self.protocol
    }

    /// Returns when the peer was last seen.
    #[must_use]
    pub const fn last_seen(&self) -> DateTime<Utc> {
        self.last_seen
    }

    /// Returns the current reputation in `[0, 1]`.
    #[must_use]
    pub const fn reputation(&self) -> f64 {
        self.reputation
    }

    /// Returns the peer's advertised capabilities.
    #[must_use]
    pub const fn capabilities(&self) -> &BTreeSet<String> {
        &self.capabilities
    }

    /// Returns the port the peer accepts gossip on, if it differs from `port`.
    #[must_use]
    pub const fn gossip_port(&self) -> Option<u16> {
        self.gossip_port
    }

    /// Applies a re-discovery: refresh, reward, and union capabilities.
    pub fn refresh(&mut self, advert: &AdvertisedPeer, now: DateTime<Utc>) {
        self.touch(now);
        self.reward(REDISCOVERY_BONUS);
        self.capabilities.extend(advert.capabilities.iter().cloned());
        if advert.gossip_port.is_some() {
            self.gossip_port = advert.gossip_port;
        }
    }

    /// Updates the last seen timestamp.
    pub fn touch(&mut self, now: DateTime<Utc>) {
        if now > self.last_seen {
            self.last_seen = now;
        }
    }

    /// Raises reputation, capped at [`MAX_REPUTATION`].
    pub fn reward(&mut self, amount: f64) {
        self.reputation = (self.reputation + amount).min(MAX_REPUTATION);
    }

    /// Lowers reputation, floored at [`MIN_REPUTATION`].
    pub fn penalize(&mut self, amount: f64) {
        self.reputation = (self.reputation - amount).max(MIN_REPUTATION);
    }

    /// Returns how long ago the peer was seen, relative to `now`.
    #[must_use]
    pub fn idle_for(&self, now: DateTime<Utc>) -> Duration {
        now.signed_duration_since(self.last_seen)
            .to_std()
            .unwrap_or(Duration::ZERO)
    }

    /// Returns true if the peer has not been seen for longer than `timeout`.
    #[must_use]
    pub fn is_stale(&self, now: DateTime<Utc>, timeout: Duration) -> bool {
        self.idle_for(now) > timeout
    }

    /// Converts the record back to its wire form.
    #[must_use]
    pub fn to_advertised(&self) -> AdvertisedPeer {
        AdvertisedPeer {
            peer_id: self.peer_id.clone(),
            address: self.address.clone(),
            port: self.port,
            capabilities: self.capabilities.iter().cloned().collect(),
            gossip_port: self.gossip_port,
        }
    }

    /// Returns where gossip for this peer should be delivered.
    ///
    /// `None` when the peer never advertised a gossip port. Its discovery
    /// port only answers discovery requests.
    #[must_use]
    pub fn gossip_endpoint(&self) -> Option<PeerEndpoint> {
        self.gossip_port
            .map(|port| PeerEndpoint::new(self.peer_id.clone(), self.address.clone(), port))
    }
}

/// A network location where a peer accepts messages.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PeerEndpoint {
    /// The peer that listens here.
    pub peer_id: PeerId,
    /// Host name or IP address.
    pub host: String,
    /// TCP port.
    pub port: u16,
}

impl PeerEndpoint {
    /// Creates a new endpoint.
    #[must_use]
    pub fn new(peer_id: PeerId, host: impl Into<String>, port: u16) -> Self {
        Self {
            peer_id,
            host: host.into(),
            port,
        }
    }
}

impl fmt::Display for PeerEndpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}:{}", self.peer_id, self.host, self.port)
    }
}
