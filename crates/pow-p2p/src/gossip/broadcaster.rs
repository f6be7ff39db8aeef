//! Batched fan-out of proof announcements.

use std::collections::HashSet;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::time::Duration;

use chrono::Utc;
use futures::future::join_all;
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::{GossipHandler, LivenessTable, PeerSource, PendingQueue, QueueOutcome};
use crate::config::GossipConfig;
use crate::equilibrium::{EquilibriumState, cleanup_cadence};
use crate::error::P2pError;
use crate::lifecycle::{LoopSet, LoopState, Worker, spawn_periodic};
use crate::message::WireMessage;
use crate::protocol::{PeerEndpoint, PeerId};
use crate::transport::{Connection, FramedConnection, TcpTransport, Transport, bind_listener, deliver};

/// Outcome of one broadcast flush or heartbeat round.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct BroadcastReport {
    /// CIDs in the batch.
    pub cids: usize,
    /// Peers the message was sent to.
    pub targets: usize,
    /// Deliveries that completed.
    pub delivered: usize,
    /// Deliveries that failed.
    pub failed: usize,
}

/// Point-in-time statistics for the gossip broadcaster.
#[derive(Debug, Clone, Serialize)]
pub struct GossipStatistics {
    /// CIDs waiting for the next flush.
    pub pending: usize,
    /// Queue bound.
    pub max_pending: usize,
    /// Peers in the liveness table.
    pub live_peers: usize,
    /// Current lambda scalar.
    pub lambda_state: f64,
    /// Current eta scalar.
    pub eta_state: f64,
    /// `lambda / eta`.
    pub equilibrium_ratio: f64,
    /// Live gossip workers.
    pub gossip_threads: usize,
    /// Loop lifecycle state.
    pub state: LoopState,
    /// CIDs accepted by `announce_proof`.
    pub announced: u64,
    /// CIDs dropped because the queue was full.
    pub dropped: u64,
    /// Non-empty batches flushed.
    pub batches_sent: u64,
    /// Batch deliveries that completed.
    pub deliveries_succeeded: u64,
    /// Batch deliveries that failed.
    pub deliveries_failed: u64,
    /// Batches received from peers.
    pub batches_received: u64,
    /// CIDs handed to the handler.
    pub cids_received: u64,
}

#[derive(Debug, Default)]
struct Counters {
    announced: AtomicU64,
    dropped: AtomicU64,
    batches_sent: AtomicU64,
    deliveries_succeeded: AtomicU64,
    deliveries_failed: AtomicU64,
    batches_received: AtomicU64,
    cids_received: AtomicU64,
}

#[derive(Debug)]
struct BroadcasterInner {
    local_id: PeerId,
    config: GossipConfig,
    transport: Arc<dyn Transport>,
    source: Arc<dyn PeerSource>,
    queue: Mutex<PendingQueue>,
    liveness: RwLock<LivenessTable>,
    equilibrium: Mutex<EquilibriumState>,
    handler: RwLock<Option<Arc<dyn GossipHandler>>>,
    received_in_window: AtomicUsize,
    counters: Counters,
    local_addr: Mutex<Option<SocketAddr>>,
}

/// Queues proof announcements and broadcasts them in batches.
///
/// Announcements are collected between flushes instead of being sent one by
/// one. While started, three loops run: broadcast (cadence `scale / λ`),
/// listen (`scale / η` windows) and cleanup (five baseline cadences).
#[derive(Debug)]
pub struct GossipBroadcaster {
    inner: Arc<BroadcasterInner>,
    loops: LoopSet,
}

impl GossipBroadcaster {
    /// Creates a broadcaster using TCP.
    ///
    /// # Errors
    ///
    /// Returns [`P2pError::Config`] if the configuration is invalid.
    pub fn new(
        local_id: PeerId,
        config: GossipConfig,
        source: Arc<dyn PeerSource>,
    ) -> Result<Self, P2pError> {
        let transport = Arc::new(TcpTransport::new(config.io_timeout));
        Self::with_transport(local_id, config, source, transport)
    }

    /// Creates a broadcaster over a custom transport.
    ///
    /// # Errors
    ///
    /// Returns [`P2pError::Config`] if the configuration is invalid.
    pub fn with_transport(
        local_id: PeerId,
        config: GossipConfig,
        source: Arc<dyn PeerSource>,
        transport: Arc<dyn Transport>,
    ) -> Result<Self, P2pError> {
        if local_id.is_empty() {
            return Err(P2pError::Config("local peer id must not be empty".into()));
        }
        config.validate()?;

        Ok(Self {
            inner: Arc::new(BroadcasterInner {
                local_id,
                queue: Mutex::new(PendingQueue::new(config.max_pending)),
                liveness: RwLock::new(LivenessTable::new()),
                equilibrium: Mutex::new(EquilibriumState::new()),
                handler: RwLock::new(None),
                received_in_window: AtomicUsize::new(0),
                counters: Counters::default(),
                local_addr: Mutex::new(None),
                transport,
                source,
                config,
            }),
            loops: LoopSet::new("gossip"),
        })
    }

    /// Returns this node's id.
    #[must_use]
    pub fn local_id(&self) -> &PeerId {
        &self.inner.local_id
    }

    /// Returns the address the listener is bound to, once started.
    #[must_use]
    pub fn local_addr(&self) -> Option<SocketAddr> {
        *self.inner.local_addr.lock()
    }

    /// Returns the loop lifecycle state.
    #[must_use]
    pub fn state(&self) -> LoopState {
        self.loops.state()
    }

    /// Registers the application callback for delivered CIDs.
    pub fn set_handler(&self, handler: Arc<dyn GossipHandler>) {
        *self.inner.handler.write() = Some(handler);
    }

    /// Queues a CID for the next broadcast.
    ///
    /// Returns `true` if the CID was newly queued, `false` if it was already
    /// pending or is empty or too long.
    pub fn announce_proof(&self, cid: &str) -> bool {
        self.inner.announce(cid)
    }

    /// Marks a peer as alive.
    pub fn update_peer(&self, peer_id: &PeerId) {
        self.inner.touch_peer(peer_id, None);
    }

    /// Handles a message that arrived through an external transport.
    ///
    /// Returns the number of CIDs handed to the handler.
    ///
    /// # Errors
    ///
    /// Returns [`P2pError::Gossip`] for messages that do not belong on the
    /// gossip channel and [`P2pError::Protocol`] for messages without a
    /// sender.
    pub fn receive(&self, message: WireMessage, remote_ip: Option<IpAddr>) -> Result<usize, P2pError> {
        self.inner.handle_inbound(message, remote_ip)
    }

    /// Broadcasts everything pending right now.
    pub async fn flush(&self) -> BroadcastReport {
        self.inner.flush().await
    }

    /// Sends a heartbeat to every target.
    pub async fn send_heartbeats(&self) -> BroadcastReport {
        self.inner.send_heartbeats().await
    }

    /// Prunes stale liveness entries. Returns the number removed.
    pub fn cleanup(&self) -> usize {
        self.inner.cleanup()
    }

    /// Returns the CIDs waiting for the next flush, oldest first.
    #[must_use]
    pub fn pending_cids(&self) -> Vec<String> {
        self.inner.queue.lock().pending()
    }

    /// Returns peers heard from within the staleness threshold.
    #[must_use]
    pub fn live_peers(&self) -> Vec<PeerId> {
        self.inner.liveness.read().live_peers()
    }

    /// Returns where the next batch would be sent.
    #[must_use]
    pub fn targets(&self) -> Vec<PeerEndpoint> {
        self.inner.targets()
    }

    /// Returns the current equilibrium scalars.
    #[must_use]
    pub fn equilibrium(&self) -> EquilibriumState {
        *self.inner.equilibrium.lock()
    }

    /// Starts the broadcast, listen and cleanup loops.
    ///
    /// Returns `true` if the loops are running afterwards, including when
    /// they already were. Returns `false` outside a tokio runtime or when the
    /// listener cannot bind its port.
    pub fn start_equilibrium_loops(&self) -> bool {
        let inner = &self.inner;
        self.loops.start(|token| {
            let listener = match inner.config.listen_port {
                Some(port) => {
                    let listener = bind_listener(&inner.config.listen_host, port)?;
                    let addr = listener.local_addr()?;
                    *inner.local_addr.lock() = Some(addr);
                    info!(addr = %addr, peer_id = %inner.local_id, "gossip listener bound");
                    Some(listener)
                }
                None => None,
            };

            inner.equilibrium.lock().reset();
            inner.received_in_window.store(0, Ordering::Relaxed);
            Ok(vec![
                inner.spawn_broadcast_loop(token),
                spawn_listen_loop(Arc::clone(inner), listener, token.clone()),
                inner.spawn_cleanup_loop(token),
            ])
        })
    }

    /// Stops all loops, waiting at most `shutdown_timeout` for them to exit.
    ///
    /// CIDs still pending are kept and go out with the next flush.
    pub async fn stop_equilibrium_loops(&self) {
        self.loops.stop(self.inner.config.shutdown_timeout).await;
        *self.inner.local_addr.lock() = None;
    }

    /// Returns queue, liveness and equilibrium statistics.
    #[must_use]
    pub fn statistics(&self) -> GossipStatistics {
        let (pending, max_pending) = {
            let queue = self.inner.queue.lock();
            (queue.len(), queue.max_pending())
        };
        let equilibrium = self.equilibrium();
        let counters = &self.inner.counters;

        GossipStatistics {
            pending,
            max_pending,
            live_peers: self.inner.liveness.read().len(),
            lambda_state: equilibrium.lambda(),
            eta_state: equilibrium.eta(),
            equilibrium_ratio: equilibrium.ratio(),
            gossip_threads: self.loops.worker_count(),
            state: self.loops.state(),
            announced: counters.announced.load(Ordering::Relaxed),
            dropped: counters.dropped.load(Ordering::Relaxed),
            batches_sent: counters.batches_sent.load(Ordering::Relaxed),
            deliveries_succeeded: counters.deliveries_succeeded.load(Ordering::Relaxed),
            deliveries_failed: counters.deliveries_failed.load(Ordering::Relaxed),
            batches_received: counters.batches_received.load(Ordering::Relaxed),
            cids_received: counters.cids_received.load(Ordering::Relaxed),
        }
    }
}

impl BroadcasterInner {
    fn valid_cid(&self, cid: &str) -> bool {
        !cid.trim().is_empty() && cid.len() <= self.config.max_cid_len
    }

    fn announce(&self, cid: &str) -> bool {
        if !self.valid_cid(cid) {
            warn!(len = cid.len(), max = self.config.max_cid_len, "rejecting invalid cid");
            return false;
        }

        let outcome = self.queue.lock().insert(cid);
        match &outcome {
            QueueOutcome::Queued => {
                self.counters.announced.fetch_add(1, Ordering::Relaxed);
                debug!(cid, "proof announced");
            }
            QueueOutcome::QueuedEvicting(dropped) => {
                self.counters.announced.fetch_add(1, Ordering::Relaxed);
                self.counters.dropped.fetch_add(1, Ordering::Relaxed);
                warn!(cid, dropped = %dropped, "broadcast queue full, dropped oldest cid");
            }
            QueueOutcome::Duplicate => debug!(cid, "cid already pending"),
        }
        outcome.is_new()
    }

    fn handler(&self) -> Option<Arc<dyn GossipHandler>> {
        self.handler.read().clone()
    }

    fn touch_peer(&self, peer_id: &PeerId, endpoint: Option<PeerEndpoint>) {
        let first_seen = self.liveness.write().touch(peer_id, endpoint, Utc::now());
        if first_seen {
            debug!(peer_id = %peer_id, "gossip peer seen");
        }
        if let Some(handler) = self.handler() {
            handler.on_liveness(peer_id);
        }
    }

    fn sender_endpoint(
        sender_id: &PeerId,
        remote_ip: Option<IpAddr>,
        listen_port: Option<u16>,
    ) -> Option<PeerEndpoint> {
        match (remote_ip, listen_port) {
            (Some(ip), Some(port)) if port != 0 => {
                Some(PeerEndpoint::new(sender_id.clone(), ip.to_string(), port))
            }
            _ => None,
        }
    }

    fn handle_inbound(&self, message: WireMessage, remote_ip: Option<IpAddr>) -> Result<usize, P2pError> {
        match message {
            WireMessage::GossipBatch {
                sender_id,
                cids,
                listen_port,
                ..
            } => {
                if sender_id.is_empty() {
                    return Err(P2pError::Protocol("gossip batch without sender".into()));
                }
                if sender_id == self.local_id {
                    return Ok(0);
                }
                self.touch_peer(
                    &sender_id,
                    Self::sender_endpoint(&sender_id, remote_ip, listen_port),
                );
                self.counters.batches_received.fetch_add(1, Ordering::Relaxed);

                let handler = self.handler();
                let mut seen = HashSet::with_capacity(cids.len());
                let mut delivered = 0;
                for cid in &cids {
                    if !self.valid_cid(cid) || !seen.insert(cid.as_str()) {
                        continue;
                    }
                    if let Some(handler) = &handler {
                        handler.on_cid(cid, &sender_id);
                    }
                    delivered += 1;
                }
                if delivered < cids.len() {
                    debug!(peer_id = %sender_id, skipped = cids.len() - delivered, "skipped invalid or repeated cids");
                }

                self.received_in_window.fetch_add(delivered, Ordering::Relaxed);
                self.counters
                    .cids_received
                    .fetch_add(delivered as u64, Ordering::Relaxed);
                debug!(peer_id = %sender_id, cids = delivered, "gossip batch received");
                Ok(delivered)
            }
            WireMessage::Heartbeat {
                sender_id,
                listen_port,
                ..
            } => {
                if sender_id.is_empty() {
                    return Err(P2pError::Protocol("heartbeat without sender".into()));
                }
                if sender_id != self.local_id {
                    self.touch_peer(
                        &sender_id,
                        Self::sender_endpoint(&sender_id, remote_ip, listen_port),
                    );
                }
                Ok(0)
            }
            other => Err(P2pError::Gossip(format!(
                "unexpected {} on gossip channel",
                other.kind()
            ))),
        }
    }

    /// Port other nodes should send gossip to.
    fn advertised_listen_port(&self) -> Option<u16> {
        self.local_addr
            .lock()
            .map(|addr| addr.port())
            .or(self.config.listen_port)
            .filter(|port| *port != 0)
    }

    fn targets(&self) -> Vec<PeerEndpoint> {
        let mut seen = HashSet::new();
        seen.insert(self.local_id.clone());

        let from_source = self.source.gossip_targets();
        let from_liveness = self.liveness.read().endpoints();
        from_source
            .into_iter()
            .chain(from_liveness)
            .filter(|endpoint| seen.insert(endpoint.peer_id.clone()))
            .collect()
    }

    async fn send_to_all(&self, message: &WireMessage) -> BroadcastReport {
        let targets = self.targets();
        let results = join_all(targets.iter().map(|target| {
            deliver(
                self.transport.as_ref(),
                &target.host,
                target.port,
                message,
                self.config.connect_timeout,
            )
        }))
        .await;

        let mut report = BroadcastReport {
            targets: targets.len(),
            ..BroadcastReport::default()
        };
        for (target, result) in targets.iter().zip(results) {
            match result {
                Ok(()) => report.delivered += 1,
                Err(e) => {
                    report.failed += 1;
                    debug!(target = %target, kind = message.kind(), error = %e, "gossip delivery failed");
                }
            }
        }
        report
    }

    async fn flush(&self) -> BroadcastReport {
        let cids = self.queue.lock().drain();
        if cids.is_empty() {
            self.equilibrium.lock().tick_lambda(0.0);
            return BroadcastReport::default();
        }

        let batch_len = cids.len();
        let message =
            WireMessage::gossip_batch(self.local_id.clone(), cids, self.advertised_listen_port());
        let mut report = self.send_to_all(&message).await;
        report.cids = batch_len;

        self.counters.batches_sent.fetch_add(1, Ordering::Relaxed);
        self.counters
            .deliveries_succeeded
            .fetch_add(report.delivered as u64, Ordering::Relaxed);
        self.counters
            .deliveries_failed
            .fetch_add(report.failed as u64, Ordering::Relaxed);

        self.equilibrium
            .lock()
            .tick_lambda(batch_len as f64 / self.config.max_pending as f64);

        info!(
            cids = report.cids,
            targets = report.targets,
            delivered = report.delivered,
            failed = report.failed,
            "gossip batch flushed"
        );
        report
    }

    async fn send_heartbeats(&self) -> BroadcastReport {
        let message = WireMessage::heartbeat(self.local_id.clone(), self.advertised_listen_port());
        let report = self.send_to_all(&message).await;
        debug!(targets = report.targets, delivered = report.delivered, "heartbeats sent");
        report
    }

    fn cleanup(&self) -> usize {
        let (removed, remaining) = {
            let mut liveness = self.liveness.write();
            let removed = liveness.prune(Utc::now(), self.config.staleness_threshold);
            (removed, liveness.len())
        };
        if removed.is_empty() {
            debug!(remaining, "gossip liveness cleanup complete");
        } else {
            info!(removed = removed.len(), remaining, "pruned stale gossip peers");
        }
        removed.len()
    }

    /// Ends a listen window, exciting eta by what arrived during it.
    fn close_listen_window(&self) {
        let received = self.received_in_window.swap(0, Ordering::Relaxed);
        self.equilibrium
            .lock()
            .tick_eta(received as f64 / self.config.max_pending as f64);
    }

    fn listen_window(&self) -> Duration {
        self.equilibrium.lock().eta_cadence(self.config.cadence_scale)
    }

    /// Handles messages on one inbound connection until the peer goes quiet,
    /// sends something invalid, or `token` is cancelled.
    async fn serve(&self, stream: TcpStream, remote: SocketAddr, token: CancellationToken) {
        let io_timeout = self.config.io_timeout;
        let mut conn = Box::new(FramedConnection::new(stream, io_timeout));

        loop {
            let received = tokio::select! {
                () = token.cancelled() => {
                    debug!(remote = %remote, "gossip connection closed by shutdown");
                    break;
                }
                received = conn.recv(io_timeout) => received,
            };
            match received {
                Ok(message) => {
                    if let Err(e) = self.handle_inbound(message, Some(remote.ip())) {
                        warn!(remote = %remote, error = %e, "rejected gossip message");
                        break;
                    }
                }
                Err(e) if e.is_transient() => {
                    debug!(remote = %remote, error = %e, "gossip connection ended");
                    break;
                }
                Err(e) => {
                    warn!(remote = %remote, error = %e, "malformed gossip message");
                    break;
                }
            }
        }
        conn.close().await;
    }

    fn spawn_broadcast_loop(self: &Arc<Self>, token: &CancellationToken) -> Worker {
        let cadence_inner = Arc::clone(self);
        let tick_inner = Arc::clone(self);
        spawn_periodic(
            "gossip-broadcast",
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
                    inner.flush().await;
                }
            },
        )
    }

    fn spawn_cleanup_loop(self: &Arc<Self>, token: &CancellationToken) -> Worker {
        let inner = Arc::clone(self);
        let cadence = cleanup_cadence(self.config.cadence_scale);
        spawn_periodic("gossip-cleanup", token.clone(), move || cadence, move || {
            let inner = Arc::clone(&inner);
            async move {
                inner.cleanup();
                inner.send_heartbeats().await;
            }
        })
    }
}

async fn accept_next(listener: Option<&TcpListener>) -> std::io::Result<(TcpStream, SocketAddr)> {
    match listener {
        Some(listener) => listener.accept().await,
        None => std::future::pending().await,
    }
}

fn spawn_listen_loop(
    inner: Arc<BroadcasterInner>,
    listener: Option<TcpListener>,
    token: CancellationToken,
) -> Worker {
    let handle = tokio::spawn(async move {
        let window = tokio::time::sleep(inner.listen_window());
        tokio::pin!(window);
        let mut connections = JoinSet::new();

        loop {
            tokio::select! {
                () = token.cancelled() => break,
                () = &mut window => {
                    inner.close_listen_window();
                    let next = tokio::time::Instant::now() + inner.listen_window();
                    window.as_mut().reset(next);
                }
                accept = accept_next(listener.as_ref()) => match accept {
                    Ok((stream, remote)) => {
                        let inner = Arc::clone(&inner);
                        let token = token.child_token();
                        connections.spawn(async move {
                            inner.serve(stream, remote, token).await;
                        });
                    }
                    Err(e) => warn!(error = %e, "gossip accept failed"),
                },
                Some(_) = connections.join_next(), if !connections.is_empty() => {}
            }
        }

        // No inbound message is handled once the loop has stopped
        drop(listener);
        connections.shutdown().await;
        debug!("gossip listen loop exited");
    });
    Worker::new("gossip-listen", handle)
}
