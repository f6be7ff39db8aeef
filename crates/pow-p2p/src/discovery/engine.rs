//! The discovery engine and its loops.

use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;

use chrono::Utc;
use futures::future::join_all;
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::{BootstrapNode, MergeOutcome, PeerTable};
use crate::config::DiscoveryConfig;
use crate::equilibrium::{EquilibriumState, cleanup_cadence};
use crate::error::P2pError;
use crate::gossip::PeerSource;
use crate::lifecycle::{LoopSet, LoopState, Worker, spawn_periodic};
use crate::message::{AdvertisedPeer, ResponderInfo, WireMessage};
use crate::protocol::{CONNECT_BONUS, DiscoveryProtocol, PeerEndpoint, PeerId, PeerRecord};
use crate::transport::{
    Connection, FramedConnection, TcpTransport, Transport, bind_listener, request,
};

/// Outcome of one bootstrap or exchange round.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SweepReport {
    /// Remote nodes contacted.
    pub contacted: usize,
    /// Remote nodes that answered with a valid response.
    pub succeeded: usize,
    /// Remote nodes that were unreachable or answered badly.
    pub failed: usize,
    /// New records created.
    pub inserted: usize,
    /// Existing records refreshed.
    pub refreshed: usize,
    /// Records evicted to stay within `max_peers`.
    pub evicted: usize,
    /// Advertised entries dropped as malformed or self.
    pub rejected: usize,
}

impl SweepReport {
    fn record_merge(&mut self, outcome: Option<MergeOutcome>) {
        match outcome {
            Some(MergeOutcome::Inserted { evicted }) => {
                self.inserted += 1;
                if evicted.is_some() {
                    self.evicted += 1;
                }
            }
            Some(MergeOutcome::Refreshed) => self.refreshed += 1,
            None => self.rejected += 1,
        }
    }
}

/// Point-in-time statistics for the discovery engine.
#[derive(Debug, Clone, Serialize)]
pub struct PeerStatistics {
    /// Records in the table.
    pub total_peers: usize,
    /// Records considered connected.
    pub connected_peers: usize,
    /// Mean reputation over all records.
    pub average_reputation: f64,
    /// Current lambda scalar.
    pub lambda_state: f64,
    /// Current eta scalar.
    pub eta_state: f64,
    /// `lambda / eta`.
    pub equilibrium_ratio: f64,
    /// Live discovery workers.
    pub discovery_threads: usize,
    /// Loop lifecycle state.
    pub state: LoopState,
    /// Configured bootstrap nodes.
    pub bootstrap_nodes: usize,
    /// Bootstrap nodes that answered their last query.
    pub reachable_bootstrap_nodes: usize,
}

#[derive(Debug)]
struct DiscoveryInner {
    local_id: PeerId,
    config: DiscoveryConfig,
    transport: Arc<dyn Transport>,
    table: RwLock<PeerTable>,
    equilibrium: Mutex<EquilibriumState>,
    bootstrap: Mutex<Vec<BootstrapNode>>,
    local_addr: Mutex<Option<SocketAddr>>,
}

/// Finds peers through bootstrap nodes and peer exchange, and keeps a
/// reputation-scored table of them.
///
/// Three loops run while started: bootstrap (cadence `scale / λ`), peer
/// exchange (`scale / η`) and cleanup (five baseline cadences). A fourth
/// worker answers inbound discovery requests when a listen port is
/// configured.
#[derive(Debug)]
pub struct DiscoveryEngine {
    inner: Arc<DiscoveryInner>,
    loops: LoopSet,
}

impl DiscoveryEngine {
    /// Creates an engine using TCP.
    ///
    /// # Errors
    ///
    /// Returns [`P2pError::Config`] if the configuration is invalid.
    pub fn new(local_id: PeerId, config: DiscoveryConfig) -> Result<Self, P2pError> {
        let transport = Arc::new(TcpTransport::new(config.io_timeout));
        Self::with_transport(local_id, config, transport)
    }

    /// Creates an engine over a custom transport.
    ///
    /// # Errors
    ///
    /// Returns [`P2pError::Config`] if the configuration is invalid.
    pub fn with_transport(
        local_id: PeerId,
        config: DiscoveryConfig,
        transport: Arc<dyn Transport>,
    ) -> Result<Self, P2pError> {
        if local_id.is_empty() {
            return Err(P2pError::Config("local peer id must not be empty".into()));
        }
        config.validate()?;
        let bootstrap = config.bootstrap()?;

        Ok(Self {
            inner: Arc::new(DiscoveryInner {
                local_id,
                table: RwLock::new(PeerTable::new(config.max_peers)),
                equilibrium: Mutex::new(EquilibriumState::new()),
                bootstrap: Mutex::new(bootstrap),
                local_addr: Mutex::new(None),
                transport,
                config,
            }),
            loops: LoopSet::new("discovery"),
        })
    }

    /// Returns this node's id.
    #[must_use]
    pub fn local_id(&self) -> &PeerId {
        &self.inner.local_id
    }

    /// Returns the configuration.
    #[must_use]
    pub fn config(&self) -> &DiscoveryConfig {
        &self.inner.config
    }

    /// Returns the address the responder is bound to, once started.
    #[must_use]
    pub fn local_addr(&self) -> Option<SocketAddr> {
        *self.inner.local_addr.lock()
    }

    /// Returns the loop lifecycle state.
    #[must_use]
    pub fn state(&self) -> LoopState {
        self.loops.state()
    }

    /// Starts the discovery loops.
    ///
    /// Returns `true` if the loops are running afterwards, including when
    /// they already were. Returns `false` outside a tokio runtime or when the
    /// responder cannot bind its port.
    pub fn start(&self) -> bool {
        let inner = &self.inner;
        self.loops.start(|token| {
            let mut workers = Vec::with_capacity(4);

            if let Some(port) = inner.config.listen_port {
                let listener = bind_listener(&inner.config.listen_host, port)?;
                let addr = listener.local_addr()?;
                *inner.local_addr.lock() = Some(addr);
                info!(addr = %addr, peer_id = %inner.local_id, "discovery responder listening");
                workers.push(spawn_responder(Arc::clone(inner), listener, token.clone()));
            }

            inner.equilibrium.lock().reset();
            workers.push(inner.spawn_bootstrap_loop(token));
            workers.push(inner.spawn_exchange_loop(token));
            workers.push(inner.spawn_cleanup_loop(token));
            Ok(workers)
        })
    }

    /// Stops all loops, waiting at most `shutdown_timeout` for them to exit.
    pub async fn stop(&self) {
        self.loops.stop(self.inner.config.shutdown_timeout).await;
        *self.inner.local_addr.lock() = None;
    }

    /// Returns a snapshot of all known peers, most recently seen first.
    #[must_use]
    pub fn get_peers(&self) -> Vec<PeerRecord> {
        self.inner.table.read().snapshot()
    }

    /// Returns a snapshot of peers that are fresh and well reputed.
    #[must_use]
    pub fn get_connected_peers(&self) -> Vec<PeerRecord> {
        self.inner.connected_peers()
    }

    /// Returns a copy of one peer's record.
    #[must_use]
    pub fn get_peer(&self, peer_id: &PeerId) -> Option<PeerRecord> {
        self.inner.table.read().get(peer_id).cloned()
    }

    /// Returns peers advertising `capability`.
    #[must_use]
    pub fn find_by_capability(&self, capability: &str) -> Vec<PeerRecord> {
        self.inner
            .table
            .read()
            .find_by_capability(capability)
            .into_iter()
            .cloned()
            .collect()
    }

    /// Returns the current equilibrium scalars.
    #[must_use]
    pub fn equilibrium(&self) -> EquilibriumState {
        *self.inner.equilibrium.lock()
    }

    /// Returns the bootstrap nodes and their reachability.
    #[must_use]
    pub fn bootstrap_nodes(&self) -> Vec<BootstrapNode> {
        self.inner.bootstrap.lock().clone()
    }

    /// Opens a short-lived validation connection to a known peer.
    ///
    /// Success adds the connect bonus to the peer's reputation; failure
    /// subtracts the failure penalty. The record is never removed here.
    /// Returns `false` for unknown peers.
    pub async fn connect_to_peer(&self, peer_id: &PeerId) -> bool {
        let target = {
            let table = self.inner.table.read();
            table
                .get(peer_id)
                .map(|r| (r.address().to_string(), r.port()))
        };
        let Some((host, port)) = target else {
            debug!(peer_id = %peer_id, "connect requested for unknown peer");
            return false;
        };

        let connect_timeout = self.inner.config.connect_timeout;
        match self.inner.transport.connect(&host, port, connect_timeout).await {
            Ok(conn) => {
                conn.close().await;
                let reputation = self
                    .inner
                    .table
                    .write()
                    .record_success(peer_id, CONNECT_BONUS, Utc::now());
                debug!(peer_id = %peer_id, ?reputation, "validation connect succeeded");
                true
            }
            Err(e) => {
                let reputation = self.inner.table.write().record_failure(peer_id);
                debug!(peer_id = %peer_id, error = %e, ?reputation, "validation connect failed");
                false
            }
        }
    }

    /// Merges one advertised peer into the table.
    ///
    /// Returns `None` if the entry is malformed or describes this node.
    pub fn merge_peer(
        &self,
        advert: &AdvertisedPeer,
        protocol: DiscoveryProtocol,
    ) -> Option<MergeOutcome> {
        self.inner.merge(advert, protocol)
    }

    /// Queries every bootstrap node once and merges the answers.
    pub async fn run_bootstrap_round(&self) -> SweepReport {
        self.inner.bootstrap_round().await
    }

    /// Exchanges peer lists with a random sample of connected peers.
    pub async fn run_exchange_round(&self) -> SweepReport {
        self.inner.exchange_round().await
    }

    /// Removes stale and poorly reputed peers. Returns the number removed.
    pub fn run_cleanup(&self) -> usize {
        self.inner.cleanup()
    }

    /// Returns counts, reputation and equilibrium state.
    #[must_use]
    pub fn get_peer_statistics(&self) -> PeerStatistics {
        let (total_peers, average_reputation) = {
            let table = self.inner.table.read();
            (table.len(), table.average_reputation())
        };
        let connected_peers = self.inner.connected_peers().len();
        let equilibrium = self.equilibrium();
        let (bootstrap_nodes, reachable_bootstrap_nodes) = {
            let nodes = self.inner.bootstrap.lock();
            (nodes.len(), nodes.iter().filter(|n| n.is_connected()).count())
        };

        PeerStatistics {
            total_peers,
            connected_peers,
            average_reputation,
            lambda_state: equilibrium.lambda(),
            eta_state: equilibrium.eta(),
            equilibrium_ratio: equilibrium.ratio(),
            discovery_threads: self.loops.worker_count(),
            state: self.loops.state(),
            bootstrap_nodes,
            reachable_bootstrap_nodes,
        }
    }
}

impl PeerSource for DiscoveryEngine {
    fn gossip_targets(&self) -> Vec<PeerEndpoint> {
        self.get_connected_peers()
            .iter()
            .filter_map(PeerRecord::gossip_endpoint)
            .collect()
    }
}

impl DiscoveryInner {
    fn connected_peers(&self) -> Vec<PeerRecord> {
        self.table.read().connected(
            Utc::now(),
            self.config.peer_timeout,
            self.config.min_reputation,
        )
    }

    /// Port other nodes should use to reach our responder.
    fn advertised_listen_port(&self) -> Option<u16> {
        self.local_addr
            .lock()
            .map(|addr| addr.port())
            .or(self.config.listen_port)
            .filter(|port| *port != 0)
    }

    fn responder_info(&self) -> ResponderInfo {
        ResponderInfo {
            peer_id: self.local_id.clone(),
            gossip_port: self.config.gossip_port,
        }
    }

    fn merge(&self, advert: &AdvertisedPeer, protocol: DiscoveryProtocol) -> Option<MergeOutcome> {
        if advert.peer_id == self.local_id {
            return None;
        }
        if let Err(e) = advert.validate() {
            warn!(error = %e, "ignoring malformed peer entry");
            return None;
        }

        let outcome = self.table.write().merge(advert, protocol, Utc::now());
        match &outcome {
            MergeOutcome::Inserted { evicted: Some(victim) } => {
                debug!(peer_id = %advert.peer_id, evicted = %victim, "peer discovered, table full")
            }
            MergeOutcome::Inserted { evicted: None } => {
                debug!(peer_id = %advert.peer_id, %protocol, "peer discovered")
            }
            MergeOutcome::Refreshed => {}
        }
        Some(outcome)
    }

    fn merge_all(&self, peers: &[AdvertisedPeer], protocol: DiscoveryProtocol, report: &mut SweepReport) {
        for advert in peers {
            report.record_merge(self.merge(advert, protocol));
        }
    }

    /// Records a node that contacted us and told us where it listens.
    fn learn_requester(
        &self,
        requester_id: &PeerId,
        remote_ip: IpAddr,
        listen_port: Option<u16>,
        gossip_port: Option<u16>,
        protocol: DiscoveryProtocol,
    ) {
        let Some(port) = listen_port else {
            return;
        };
        let mut advert = AdvertisedPeer::new(requester_id.clone(), remote_ip.to_string(), port);
        advert.gossip_port = gossip_port;
        self.merge(&advert, protocol);
    }

    fn load(&self, inserted: usize) -> f64 {
        inserted as f64 / self.config.max_peers as f64
    }

    async fn bootstrap_round(&self) -> SweepReport {
        let targets: Vec<(String, u16)> = self
            .bootstrap
            .lock()
            .iter()
            .map(|node| (node.host().to_string(), node.port()))
            .collect();

        let lambda = self.equilibrium.lock().lambda();
        let message = WireMessage::peer_list_request(
            lambda,
            self.local_id.clone(),
            self.advertised_listen_port(),
            self.config.gossip_port,
        );

        let results = join_all(
            targets
                .iter()
                .map(|(host, port)| self.query_bootstrap(host, *port, &message)),
        )
        .await;

        let mut report = SweepReport {
            contacted: targets.len(),
            ..SweepReport::default()
        };
        let now = Utc::now();
        let mut nodes = Vec::with_capacity(results.len());
        for ((host, port), result) in targets.iter().zip(results) {
            match result {
                Ok(reply) => {
                    report.succeeded += 1;
                    nodes.push((host, *port, true));
                    self.apply_peer_list(host, *port, reply, &mut report);
                }
                Err(e) => {
                    report.failed += 1;
                    nodes.push((host, *port, false));
                    debug!(host = %host, port, error = %e, "bootstrap node unreachable");
                }
            }
        }

        {
            let mut bootstrap = self.bootstrap.lock();
            for (host, port, reachable) in nodes {
                if let Some(node) = bootstrap
                    .iter_mut()
                    .find(|n| n.host() == host.as_str() && n.port() == port)
                {
                    if reachable {
                        node.mark_connected(now);
                    } else {
                        node.mark_disconnected();
                    }
                }
            }
        }

        self.equilibrium.lock().tick_lambda(self.load(report.inserted));
        log_sweep("bootstrap", &report, self.table.read().len());
        report
    }

    async fn query_bootstrap(
        &self,
        host: &str,
        port: u16,
        message: &WireMessage,
    ) -> Result<(Option<ResponderInfo>, Vec<AdvertisedPeer>), P2pError> {
        let reply = request(
            self.transport.as_ref(),
            host,
            port,
            message,
            self.config.connect_timeout,
            self.config.io_timeout,
        )
        .await?;

        match reply {
            WireMessage::PeerListResponse { peers, responder } => Ok((responder, peers)),
            other => Err(P2pError::Discovery(format!(
                "expected peer_list_response, got {}",
                other.kind()
            ))),
        }
    }

    fn apply_peer_list(
        &self,
        host: &str,
        port: u16,
        (responder, peers): (Option<ResponderInfo>, Vec<AdvertisedPeer>),
        report: &mut SweepReport,
    ) {
        if let Some(responder) = responder {
            let mut advert = AdvertisedPeer::new(responder.peer_id, host, port);
            advert.gossip_port = responder.gossip_port;
            report.record_merge(self.merge(&advert, DiscoveryProtocol::Bootstrap));
        }
        self.merge_all(&peers, DiscoveryProtocol::Bootstrap, report);
    }

    async fn exchange_round(&self) -> SweepReport {
        let partners = {
            let table = self.table.read();
            table.sample_connected(
                &mut rand::thread_rng(),
                self.config.exchange_fanout,
                Utc::now(),
                self.config.peer_timeout,
                self.config.min_reputation,
            )
        };

        let eta = self.equilibrium.lock().eta();
        let requests: Vec<WireMessage> = {
            let table = self.table.read();
            partners
                .iter()
                .map(|partner| {
                    WireMessage::peer_exchange_request(
                        eta,
                        table.advertise(self.config.exchange_share, Some(partner.peer_id())),
                        self.local_id.clone(),
                        self.advertised_listen_port(),
                        self.config.gossip_port,
                    )
                })
                .collect()
        };

        let results = join_all(
            partners
                .iter()
                .zip(&requests)
                .map(|(partner, message)| self.exchange_with(partner, message)),
        )
        .await;

        let mut report = SweepReport {
            contacted: partners.len(),
            ..SweepReport::default()
        };
        for (partner, result) in partners.iter().zip(results) {
            match result {
                Ok(peers) => {
                    report.succeeded += 1;
                    self.table.write().record_success(partner.peer_id(), 0.0, Utc::now());
                    self.merge_all(&peers, DiscoveryProtocol::PeerExchange, &mut report);
                }
                Err(e) => {
                    report.failed += 1;
                    let reputation = self.table.write().record_failure(partner.peer_id());
                    debug!(peer_id = %partner.peer_id(), error = %e, ?reputation, "peer exchange failed");
                }
            }
        }

        self.equilibrium.lock().tick_eta(self.load(report.inserted));
        log_sweep("exchange", &report, self.table.read().len());
        report
    }

    async fn exchange_with(
        &self,
        partner: &PeerRecord,
        message: &WireMessage,
    ) -> Result<Vec<AdvertisedPeer>, P2pError> {
        let reply = request(
            self.transport.as_ref(),
            partner.address(),
            partner.port(),
            message,
            self.config.connect_timeout,
            self.config.io_timeout,
        )
        .await?;

        match reply {
            WireMessage::PeerExchangeResponse { peers, .. } => Ok(peers),
            other => Err(P2pError::Discovery(format!(
                "expected peer_exchange_response, got {}",
                other.kind()
            ))),
        }
    }

    fn cleanup(&self) -> usize {
        let (removed, remaining) = {
            let mut table = self.table.write();
            let removed = table.cleanup(
                Utc::now(),
                self.config.peer_timeout,
                self.config.min_reputation,
            );
            (removed, table.len())
        };
        info!(removed = removed.len(), remaining, "discovery cleanup complete");
        removed.len()
    }

    async fn serve(&self, stream: TcpStream, remote: SocketAddr, token: CancellationToken) {
        let io_timeout = self.config.io_timeout;
        let mut conn = Box::new(FramedConnection::new(stream, io_timeout));

        let received = tokio::select! {
            () = token.cancelled() => {
                debug!(remote = %remote, "discovery request dropped by shutdown");
                conn.close().await;
                return;
            }
            received = conn.recv(io_timeout) => received,
        };
        let request = match received {
            Ok(request) => request,
            Err(e) => {
                if e.is_transient() {
                    debug!(remote = %remote, error = %e, "discovery request not received");
                } else {
                    warn!(remote = %remote, error = %e, "malformed discovery request");
                }
                conn.close().await;
                return;
            }
        };

        let reply = match request {
            WireMessage::PeerListRequest {
                requester_id,
                listen_port,
                gossip_port,
                ..
            } => {
                self.learn_requester(
                    &requester_id,
                    remote.ip(),
                    listen_port,
                    gossip_port,
                    DiscoveryProtocol::Bootstrap,
                );
                WireMessage::PeerListResponse {
                    peers: self
                        .table
                        .read()
                        .advertise(self.config.advertise_limit, Some(&requester_id)),
                    responder: Some(self.responder_info()),
                }
            }
            WireMessage::PeerExchangeRequest {
                our_peers,
                requester_id,
                listen_port,
                gossip_port,
                ..
            } => {
                let mut report = SweepReport::default();
                self.merge_all(&our_peers, DiscoveryProtocol::PeerExchange, &mut report);
                if let Some(requester_id) = &requester_id {
                    self.learn_requester(
                        requester_id,
                        remote.ip(),
                        listen_port,
                        gossip_port,
                        DiscoveryProtocol::PeerExchange,
                    );
                }
                WireMessage::PeerExchangeResponse {
                    peers: self
                        .table
                        .read()
                        .advertise(self.config.advertise_limit, requester_id.as_ref()),
                    responder: Some(self.responder_info()),
                }
            }
            other => {
                warn!(remote = %remote, kind = other.kind(), "unexpected message on discovery port");
                conn.close().await;
                return;
            }
        };

        if let Err(e) = conn.send(&reply).await {
            debug!(remote = %remote, error = %e, "failed to send discovery response");
        }
        conn.close().await;
    }

    fn spawn_bootstrap_loop(self: &Arc<Self>, token: &CancellationToken) -> Worker {
        let cadence_inner = Arc::clone(self);
        let tick_inner = Arc::clone(self);
        spawn_periodic(
            "bootstrap",
            token.clone(),
            move || {
                cadence_inner
                    .equilibrium
                    .lock()
                    .lambda_cadence(cadence_inner.config.cadence_scale)
            },
            move || {
                let inner = Arc::clone(&tick_inner);
                async move {
                    inner.bootstrap_round().await;
                }
            },
        )
    }

    fn spawn_exchange_loop(self: &Arc<Self>, token: &CancellationToken) -> Worker {
        let cadence_inner = Arc::clone(self);
        let tick_inner = Arc::clone(self);
        spawn_periodic(
            "peer-exchange",
            token.clone(),
            move || {
                cadence_inner
                    .equilibrium
                    .lock()
                    .eta_cadence(cadence_inner.config.cadence_scale)
            },
            move || {
                let inner = Arc::clone(&tick_inner);
                async move {
                    inner.exchange_round().await;
                }
            },
        )
    }

    fn spawn_cleanup_loop(self: &Arc<Self>, token: &CancellationToken) -> Worker {
        let inner = Arc::clone(self);
        let cadence = cleanup_cadence(self.config.cadence_scale);
        spawn_periodic(
            "discovery-cleanup",
            token.clone(),
            move || cadence,
            move || {
                inner.cleanup();
                async {}
            },
        )
    }
}

fn spawn_responder(
    inner: Arc<DiscoveryInner>,
    listener: TcpListener,
    token: CancellationToken,
) -> Worker {
    let handle = tokio::spawn(async move {
        let mut connections = JoinSet::new();
        loop {
            tokio::select! {
                () = token.cancelled() => break,
                accept = listener.accept() => match accept {
                    Ok((stream, remote)) => {
                        let inner = Arc::clone(&inner);
                        let token = token.child_token();
                        connections.spawn(async move {
                            inner.serve(stream, remote, token).await;
                        });
                    }
                    Err(e) => warn!(error = %e, "discovery accept failed"),
                },
                Some(_) = connections.join_next(), if !connections.is_empty() => {}
            }
        }

        drop(listener);
        connections.shutdown().await;
        debug!("discovery responder exited");
    });
    Worker::new("discovery-responder", handle)
}

fn log_sweep(round: &'static str, report: &SweepReport, table_size: usize) {
    if report.inserted > 0 || report.evicted > 0 {
        info!(
            round,
            contacted = report.contacted,
            failed = report.failed,
            inserted = report.inserted,
            evicted = report.evicted,
            table_size,
            "discovery sweep complete"
        );
    } else {
        debug!(
            round,
            contacted = report.contacted,
            failed = report.failed,
            refreshed = report.refreshed,
            table_size,
            "discovery sweep complete"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::BoxFuture;
    use std::collections::HashMap;
    use std::time::Duration;

    /// Answers every request to a known address with a canned reply.
    #[derive(Debug, Default)]
    struct ScriptedTransport {
        replies: Mutex<HashMap<(String, u16), WireMessage>>,
        sent: Arc<Mutex<Vec<WireMessage>>>,
    }

    impl ScriptedTransport {
        fn reply(self, host: &str, port: u16, message: WireMessage) -> Self {
            self.replies.lock().insert((host.to_string(), port), message);
            self
        }
    }

    struct ScriptedConnection {
        reply: WireMessage,
        sent: Arc<Mutex<Vec<WireMessage>>>,
    }

    impl Transport for ScriptedTransport {
        fn connect<'a>(
            &'a self,
            host: &'a str,
            port: u16,
            timeout: Duration,
        ) -> BoxFuture<'a, Result<Box<dyn Connection>, P2pError>> {
            Box::pin(async move {
                let reply = self
                    .replies
                    .lock()
                    .get(&(host.to_string(), port))
                    .cloned()
                    .ok_or(P2pError::Timeout {
                        operation: "connect",
                        after: timeout,
                    })?;
                let conn: Box<dyn Connection> = Box::new(ScriptedConnection {
                    reply,
                    sent: Arc::clone(&self.sent),
                });
                Ok(conn)
            })
        }
    }

    impl Connection for ScriptedConnection {
        fn send<'a>(&'a mut self, message: &'a WireMessage) -> BoxFuture<'a, Result<(), P2pError>> {
            self.sent.lock().push(message.clone());
            Box::pin(async { Ok(()) })
        }

        fn recv(&mut self, _timeout: Duration) -> BoxFuture<'_, Result<WireMessage, P2pError>> {
            let reply = self.reply.clone();
            Box::pin(async move { Ok(reply) })
        }

        fn close(self: Box<Self>) -> BoxFuture<'static, ()> {
            Box::pin(async {})
        }
    }

    fn engine_with(config: DiscoveryConfig, transport: ScriptedTransport) -> DiscoveryEngine {
        DiscoveryEngine::with_transport(PeerId::from("local"), config, Arc::new(transport)).unwrap()
    }

    fn peer_list(peers: Vec<AdvertisedPeer>, responder: Option<&str>) -> WireMessage {
        WireMessage::PeerListResponse {
            peers,
            responder: responder.map(|id| ResponderInfo {
                peer_id: PeerId::from(id),
                gossip_port: None,
            }),
        }
    }

    #[test]
    fn rejects_invalid_config() {
        let err = DiscoveryEngine::new(
            PeerId::from("local"),
            DiscoveryConfig::default().with_max_peers(0),
        )
        .unwrap_err();
        assert!(matches!(err, P2pError::Config(_)));

        let err = DiscoveryEngine::new(PeerId::from(""), DiscoveryConfig::default()).unwrap_err();
        assert!(matches!(err, P2pError::Config(_)));
    }

    #[tokio::test]
    async fn bootstrap_discovers_single_peer() {
        let transport = ScriptedTransport::default().reply(
            "seed",
            9000,
            peer_list(vec![AdvertisedPeer::new("p1", "1.2.3.4", 9000)], None),
        );
        let engine = engine_with(
            DiscoveryConfig::default().with_bootstrap_nodes(["seed:9000"]),
            transport,
        );

        let report = engine.run_bootstrap_round().await;

        assert_eq!(report.inserted, 1);
        let peers = engine.get_peers();
        assert_eq!(peers.len(), 1);
        assert_eq!(peers[0].peer_id().as_str(), "p1");
        assert_eq!(peers[0].protocol(), DiscoveryProtocol::Bootstrap);
        assert!((peers[0].reputation() - 1.0).abs() < f64::EPSILON);
        assert!(engine.bootstrap_nodes()[0].is_connected());
    }

    #[tokio::test]
    async fn bootstrap_records_responder_and_skips_self_and_malformed() {
        let transport = ScriptedTransport::default().reply(
            "seed",
            9000,
            peer_list(
                vec![
                    AdvertisedPeer::new("local", "127.0.0.1", 7000),
                    AdvertisedPeer::new("bad", "", 7000),
                    AdvertisedPeer::new("p2", "5.6.7.8", 9001),
                ],
                Some("seed-node"),
            ),
        );
        let engine = engine_with(
            DiscoveryConfig::default().with_bootstrap_nodes(["seed:9000"]),
            transport,
        );

        let report = engine.run_bootstrap_round().await;

        assert_eq!(report.inserted, 2);
        assert_eq!(report.rejected, 2);
        let seed = engine.get_peer(&PeerId::from("seed-node")).unwrap();
        assert_eq!(seed.address(), "seed");
        assert_eq!(seed.port(), 9000);
        assert!(engine.get_peer(&PeerId::from("local")).is_none());
    }

    #[tokio::test]
    async fn unreachable_bootstrap_leaves_empty_table() {
        let engine = engine_with(
            DiscoveryConfig::default().with_bootstrap_nodes(["nowhere:9000"]),
            ScriptedTransport::default(),
        );

        let report = engine.run_bootstrap_round().await;

        assert_eq!(report.failed, 1);
        assert!(engine.get_peers().is_empty());
        assert!(!engine.bootstrap_nodes()[0].is_connected());
        let stats = engine.get_peer_statistics();
        assert_eq!(stats.total_peers, 0);
        assert_eq!(stats.reachable_bootstrap_nodes, 0);
    }

    #[tokio::test]
    async fn wrong_reply_type_is_a_failure() {
        let transport = ScriptedTransport::default().reply(
            "seed",
            9000,
            WireMessage::heartbeat(PeerId::from("seed"), None),
        );
        let engine = engine_with(
            DiscoveryConfig::default().with_bootstrap_nodes(["seed:9000"]),
            transport,
        );

        let report = engine.run_bootstrap_round().await;
        assert_eq!(report.failed, 1);
        assert!(engine.get_peers().is_empty());
    }

    #[tokio::test]
    async fn connect_to_unreachable_peer_penalizes() {
        let engine = engine_with(DiscoveryConfig::default(), ScriptedTransport::default());
        engine.merge_peer(
            &AdvertisedPeer::new("p1", "10.0.0.1", 9000),
            DiscoveryProtocol::Bootstrap,
        );

        assert!(!engine.connect_to_peer(&PeerId::from("p1")).await);

        let record = engine.get_peer(&PeerId::from("p1")).unwrap();
        assert!((record.reputation() - 0.9).abs() < 1e-9);
    }

    #[tokio::test]
    async fn connect_to_reachable_peer_rewards() {
        let transport = ScriptedTransport::default().reply(
            "10.0.0.1",
            9000,
            peer_list(vec![], None),
        );
        let engine = engine_with(DiscoveryConfig::default(), transport);
        engine.merge_peer(
            &AdvertisedPeer::new("p1", "10.0.0.1", 9000),
            DiscoveryProtocol::Bootstrap,
        );
        engine.inner.table.write().record_failure(&PeerId::from("p1"));
        engine.inner.table.write().record_failure(&PeerId::from("p1"));

        assert!(engine.connect_to_peer(&PeerId::from("p1")).await);
        let record = engine.get_peer(&PeerId::from("p1")).unwrap();
        assert!((record.reputation() - 1.0).abs() < 1e-9);
    }

    #[tokio::test]
    async fn connect_to_unknown_peer_is_false() {
        let engine = engine_with(DiscoveryConfig::default(), ScriptedTransport::default());
        assert!(!engine.connect_to_peer(&PeerId::from("ghost")).await);
    }

    #[tokio::test]
    async fn exchange_merges_reply_and_penalizes_failures() {
        let transport = ScriptedTransport::default().reply(
            "10.0.0.1",
            9000,
            WireMessage::PeerExchangeResponse {
                peers: vec![AdvertisedPeer::new("p9", "10.0.0.9", 9000)],
                responder: None,
            },
        );
        let sent = Arc::clone(&transport.sent);
        let engine = engine_with(DiscoveryConfig::default(), transport);
        engine.merge_peer(
            &AdvertisedPeer::new("good", "10.0.0.1", 9000),
            DiscoveryProtocol::Bootstrap,
        );
        engine.merge_peer(
            &AdvertisedPeer::new("dead", "10.0.0.2", 9000),
            DiscoveryProtocol::Bootstrap,
        );

        let report = engine.run_exchange_round().await;

        assert_eq!(report.contacted, 2);
        assert_eq!(report.succeeded, 1);
        assert_eq!(report.failed, 1);
        let learned = engine.get_peer(&PeerId::from("p9")).unwrap();
        assert_eq!(learned.protocol(), DiscoveryProtocol::PeerExchange);
        let dead = engine.get_peer(&PeerId::from("dead")).unwrap();
        assert!((dead.reputation() - 0.9).abs() < 1e-9);

        let sent = sent.lock();
        let WireMessage::PeerExchangeRequest { our_peers, .. } = &sent[0] else {
            panic!("expected exchange request, got {:?}", sent[0]);
        };
        assert!(our_peers.len() <= 5);
        assert!(our_peers.iter().all(|p| p.peer_id.as_str() != "good"));
    }

    #[tokio::test]
    async fn exchange_samples_at_most_fanout_partners() {
        let engine = engine_with(DiscoveryConfig::default(), ScriptedTransport::default());
        for i in 0..10 {
            engine.merge_peer(
                &AdvertisedPeer::new(format!("p{i}"), "10.0.0.1", 9000 + i),
                DiscoveryProtocol::Bootstrap,
            );
        }
        let report = engine.run_exchange_round().await;
        assert_eq!(report.contacted, 3);
    }

    #[test]
    fn cleanup_removes_low_reputation() {
        let engine = engine_with(DiscoveryConfig::default(), ScriptedTransport::default());
        engine.merge_peer(
            &AdvertisedPeer::new("p1", "10.0.0.1", 9000),
            DiscoveryProtocol::Bootstrap,
        );
        engine.merge_peer(
            &AdvertisedPeer::new("p2", "10.0.0.2", 9000),
            DiscoveryProtocol::Bootstrap,
        );
        for _ in 0..8 {
            engine.inner.table.write().record_failure(&PeerId::from("p2"));
        }

        assert_eq!(engine.get_connected_peers().len(), 1);
        assert_eq!(engine.run_cleanup(), 1);
        assert_eq!(engine.get_peers().len(), 1);
    }

    #[test]
    fn gossip_targets_use_connected_peers() {
        let engine = engine_with(DiscoveryConfig::default(), ScriptedTransport::default());
        engine.merge_peer(
            &AdvertisedPeer::new("p1", "10.0.0.1", 9000).with_gossip_port(9100),
            DiscoveryProtocol::Bootstrap,
        );
        let targets = engine.gossip_targets();
        assert_eq!(targets.len(), 1);
        assert_eq!(targets[0].port, 9100);
    }

    #[test]
    fn gossip_targets_skip_peers_without_gossip_port() {
        let engine = engine_with(DiscoveryConfig::default(), ScriptedTransport::default());
        engine.merge_peer(
            &AdvertisedPeer::new("discovery-only", "10.0.0.2", 9000),
            DiscoveryProtocol::Bootstrap,
        );
        engine.merge_peer(
            &AdvertisedPeer::new("gossiper", "10.0.0.3", 9000).with_gossip_port(9100),
            DiscoveryProtocol::Bootstrap,
        );

        assert_eq!(engine.get_connected_peers().len(), 2);
        let targets = engine.gossip_targets();
        assert_eq!(targets.len(), 1);
        assert_eq!(targets[0].peer_id, PeerId::from("gossiper"));
    }

    #[tokio::test]
    async fn lifecycle_is_idempotent() {
        let engine = engine_with(
            DiscoveryConfig::local().with_cadence_scale(Duration::from_secs(60)),
            ScriptedTransport::default(),
        );

        engine.stop().await;
        assert_eq!(engine.state(), LoopState::Stopped);

        assert!(engine.start());
        let threads = engine.get_peer_statistics().discovery_threads;
        assert_eq!(threads, 3);
        assert!(engine.start());
        assert_eq!(engine.get_peer_statistics().discovery_threads, threads);

        engine.stop().await;
        engine.stop().await;
        let stats = engine.get_peer_statistics();
        assert_eq!(stats.discovery_threads, 0);
        assert_eq!(stats.state, LoopState::Stopped);
    }

    #[tokio::test]
    async fn start_fails_when_port_taken() {
        let taken = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let port = taken.local_addr().unwrap().port();
        let engine = engine_with(
            DiscoveryConfig::local().with_listen("127.0.0.1", port),
            ScriptedTransport::default(),
        );

        assert!(!engine.start());
        assert_eq!(engine.state(), LoopState::Stopped);
    }

    #[test]
    fn statistics_start_at_baseline() {
        let engine = engine_with(DiscoveryConfig::default(), ScriptedTransport::default());
        let stats = engine.get_peer_statistics();
        assert!((stats.lambda_state - std::f64::consts::FRAC_1_SQRT_2).abs() < 1e-12);
        assert!((stats.equilibrium_ratio - 1.0).abs() < 1e-12);
        assert_eq!(stats.state, LoopState::Stopped);
        assert!(stats.average_reputation.abs() < f64::EPSILON);
    }
}
