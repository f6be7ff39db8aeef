//! Wire messages exchanged between nodes.
//!
//! Every message is a JSON object with a `type` discriminant, sent as one
//! line over a TCP stream.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::P2pError;
use crate::protocol::PeerId;

/// A peer as it appears in peer lists on the wire.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AdvertisedPeer {
    /// The peer's id.
    pub peer_id: PeerId,
    /// Host name or IP address.
    pub address: String,
    /// Discovery port.
    pub port: u16,
    /// Capability tags.
    #[serde(default)]
    pub capabilities: Vec<String>,
    /// Gossip port, when different from `port`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gossip_port: Option<u16>,
}

impl AdvertisedPeer {
    /// Creates an advertised peer without capabilities.
    #[must_use]
    pub fn new(peer_id: impl Into<PeerId>, address: impl Into<String>, port: u16) -> Self {
        Self {
            peer_id: peer_id.into(),
            address: address.into(),
            port,
            capabilities: Vec::new(),
            gossip_port: None,
        }
    }

    /// Sets capability tags.
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

    /// Checks that the entry can be merged into a peer table.
    ///
    /// # Errors
    ///
    /// Returns [`P2pError::Protocol`] describing the first invalid field.
    pub fn validate(&self) -> Result<(), P2pError> {
        if self.peer_id.is_empty() {
            return Err(P2pError::Protocol("peer entry has empty peer_id".into()));
        }
        if self.address.trim().is_empty() {
            return Err(P2pError::Protocol(format!(
                "peer {} has empty address",
                self.peer_id
            )));
        }
        if self.port == 0 {
            return Err(P2pError::Protocol(format!(
                "peer {} advertised port 0",
                self.peer_id
            )));
        }
        Ok(())
    }
}

/// Identity of the node answering a discovery request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResponderInfo {
    /// The responder's id.
    pub peer_id: PeerId,
    /// The responder's gossip port, if it runs a gossip listener.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gossip_port: Option<u16>,
}

/// Messages exchanged between peers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WireMessage {
    /// Ask a bootstrap node for its peer list.
    PeerListRequest {
        /// Sender's current lambda state.
        lambda_coupling: f64,
        /// When the request was made.
        timestamp: DateTime<Utc>,
        /// The requesting node.
        requester_id: PeerId,
        /// Port the requester answers discovery requests on.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        listen_port: Option<u16>,
        /// Port the requester accepts gossip on.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        gossip_port: Option<u16>,
    },

    /// Reply to [`WireMessage::PeerListRequest`].
    PeerListResponse {
        /// Known peers.
        peers: Vec<AdvertisedPeer>,
        /// Who answered.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        responder: Option<ResponderInfo>,
    },

    /// Trade peer lists with a connected peer.
    PeerExchangeRequest {
        /// Sender's current eta state.
        eta_damping: f64,
        /// A sample of the sender's peers.
        our_peers: Vec<AdvertisedPeer>,
        /// When the request was made.
        timestamp: DateTime<Utc>,
        /// The requesting node.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        requester_id: Option<PeerId>,
        /// Port the requester answers discovery requests on.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        listen_port: Option<u16>,
        /// Port the requester accepts gossip on.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        gossip_port: Option<u16>,
    },

    /// Reply to [`WireMessage::PeerExchangeRequest`].
    PeerExchangeResponse {
        /// Known peers.
        peers: Vec<AdvertisedPeer>,
        /// Who answered.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        responder: Option<ResponderInfo>,
    },

    /// A batch of content identifiers announced by the sender.
    GossipBatch {
        /// The announcing node.
        sender_id: PeerId,
        /// Content identifiers, in announcement order.
        cids: Vec<String>,
        /// When the batch was flushed.
        timestamp: DateTime<Utc>,
        /// Port the sender accepts gossip on.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        listen_port: Option<u16>,
    },

    /// Liveness signal with no payload.
    Heartbeat {
        /// The live node.
        sender_id: PeerId,
        /// When the signal was sent.
        timestamp: DateTime<Utc>,
        /// Port the sender accepts gossip on.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        listen_port: Option<u16>,
    },
}

impl WireMessage {
    /// Creates a peer list request stamped with the current time.
    #[must_use]
    pub fn peer_list_request(
        lambda_coupling: f64,
        requester_id: PeerId,
        listen_port: Option<u16>,
        gossip_port: Option<u16>,
    ) -> Self {
        Self::PeerListRequest {
            lambda_coupling,
            timestamp: Utc::now(),
            requester_id,
            listen_port,
            gossip_port,
        }
    }

    /// Creates a peer exchange request stamped with the current time.
    #[must_use]
    pub fn peer_exchange_request(
        eta_damping: f64,
        our_peers: Vec<AdvertisedPeer>,
        requester_id: PeerId,
        listen_port: Option<u16>,
        gossip_port: Option<u16>,
    ) -> Self {
        Self::PeerExchangeRequest {
            eta_damping,
            our_peers,
            timestamp: Utc::now(),
            requester_id: Some(requester_id),
            listen_port,
            gossip_port,
        }
    }

    /// Creates a gossip batch stamped with the current time.
    #[must_use]
    pub fn gossip_batch(sender_id: PeerId, cids: Vec<String>, listen_port: Option<u16>) -> Self {
        Self::GossipBatch {
            sender_id,
            cids,
            timestamp: Utc::now(),
            listen_port,
        }
    }

    /// Creates a heartbeat stamped with the current time.
    #[must_use]
    pub fn heartbeat(sender_id: PeerId, listen_port: Option<u16>) -> Self {
        Self::Heartbeat {
            sender_id,
            timestamp: Utc::now(),
            listen_port,
        }
    }

    /// Returns the wire name of the message type.
    #[must_use]
    pub const fn kind(&self) -> &'static str {
        match self {
            Self::PeerListRequest { .. } => "peer_list_request",
            Self::PeerListResponse { .. } => "peer_list_response",
            Self::PeerExchangeRequest { .. } => "peer_exchange_request",
            Self::PeerExchangeResponse { .. } => "peer_exchange_response",
            Self::GossipBatch { .. } => "gossip_batch",
            Self::Heartbeat { .. } => "heartbeat",
        }
    }

    /// Encodes the message as a single JSON line (without the newline).
    ///
    /// # Errors
    ///
    /// Returns an error if serialization fails.
    pub fn to_line(&self) -> Result<String, P2pError> {
        Ok(serde_json::to_string(self)?)
    }

    /// Decodes a message from a JSON line.
    ///
    /// # Errors
    ///
    /// Returns an error if the line is not a known message.
    pub fn from_line(line: &str) -> Result<Self, P2pError> {
        Ok(serde_json::from_str(line.trim())?)
    }
}
