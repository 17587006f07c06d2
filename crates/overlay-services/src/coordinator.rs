//! Coordinator — the registry process's network side.
//!
//! Accepts node connections, feeds registration traffic into the
//! [`PeerRegistry`], pushes overlay assignments and link weights, and runs
//! messaging rounds:
//!
//! 1. `RoundPrepare` to every node; wait for every `RoundReady`.
//! 2. `TaskInitiate` to every node; wait for every `TaskComplete`.
//! 3. Pull summaries until the conservation law holds or the quiescence
//!    timeout passes, then hand back the last report.
//!
//! Round replies arrive on connection tasks and are forwarded to whoever is
//! running the round through one event channel. Holding the receiver also
//! keeps two rounds from overlapping.

use std::collections::{BTreeMap, BTreeSet};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use rand::rngs::StdRng;
use rand::SeedableRng;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, mpsc, Mutex};
use tokio::time::{timeout_at, Instant};

use overlay_core::config::RegistryConfig;
use overlay_core::wire::LinkWeight;
use overlay_core::{AggregateReport, Message, PeerIdentity, StatsSnapshot};

use crate::connection::Connection;
use crate::registry::{check_origin, PeerRegistry, RegistryError};
use crate::topology::Overlay;

#[derive(Debug, thiserror::Error)]
pub enum CoordinatorError {
    #[error(transparent)]
    Registry(#[from] RegistryError),
    #[error("{phase}: no reply from {} node(s): {}", .missing.len(), join(.missing))]
    RoundTimeout {
        phase: &'static str,
        missing: Vec<PeerIdentity>,
    },
}

fn join(peers: &[PeerIdentity]) -> String {
    peers
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join(", ")
}

#[derive(Debug)]
enum RoundEvent {
    Ready(PeerIdentity),
    Complete(PeerIdentity),
    Summary(PeerIdentity, StatsSnapshot),
}

pub struct Coordinator {
    config: RegistryConfig,
    local_addr: SocketAddr,
    registry: Mutex<PeerRegistry<Connection>>,
    events_tx: mpsc::UnboundedSender<RoundEvent>,
    events_rx: Mutex<mpsc::UnboundedReceiver<RoundEvent>>,
    shutdown: broadcast::Sender<()>,
}

impl Coordinator {
    /// Bind the registry port and start accepting nodes.
    pub async fn start(config: RegistryConfig) -> anyhow::Result<Arc<Self>> {
        let listener = TcpListener::bind((config.listen_host.as_str(), config.port)).await?;
        let local_addr = listener.local_addr()?;
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (shutdown, _) = broadcast::channel(1);

        let coordinator = Arc::new(Self {
            config,
            local_addr,
            registry: Mutex::new(PeerRegistry::new()),
            events_tx,
            events_rx: Mutex::new(events_rx),
            shutdown,
        });

        tracing::info!(%local_addr, "registry listening");
        tokio::spawn(Arc::clone(&coordinator).accept_loop(listener));
        Ok(coordinator)
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn shutdown(&self) {
        let _ = self.shutdown.send(());
    }

    async fn accept_loop(self: Arc<Self>, listener: TcpListener) {
        let mut shutdown = self.shutdown.subscribe();
        loop {
            tokio::select! {
                _ = shutdown.recv() => {
                    tracing::info!("registry listener shutting down");
                    return;
                }

                accepted = listener.accept() => {
                    match accepted {
                        Ok((stream, remote)) => {
                            tokio::spawn(Arc::clone(&self).serve_node(stream, remote));
                        }
                        Err(e) => tracing::warn!(error = %e, "accept failed"),
                    }
                }
            }
        }
    }

    // ── Connections ───────────────────────────────────────────────────────────

    async fn serve_node(self: Arc<Self>, stream: TcpStream, remote: SocketAddr) {
        let (conn, mut reader) = match Connection::spawn(stream) {
            Ok(pair) => pair,
            Err(e) => {
                tracing::warn!(%remote, error = %e, "connection setup failed");
                return;
            }
        };
        tracing::debug!(%remote, "node connected");

        let mut registered: Option<PeerIdentity> = None;
        loop {
            match reader.next().await {
                Ok(Some(message)) => self.dispatch(&conn, &mut registered, message).await,
                Ok(None) => break,
                Err(e) if e.is_recoverable() => {
                    tracing::warn!(%remote, error = %e, "dropping malformed frame");
                }
                Err(e) => {
                    tracing::warn!(%remote, error = %e, "closing connection");
                    break;
                }
            }
        }

        // the node vanished without deregistering
        if let Some(identity) = registered {
            let removed = self.registry.lock().await.deregister(&identity);
            if let Ok((_, invalidated)) = removed {
                tracing::warn!(%identity, invalidated, "connection lost, node deregistered");
            }
        }
    }

    async fn dispatch(
        &self,
        conn: &Connection,
        registered: &mut Option<PeerIdentity>,
        message: Message,
    ) {
        match message {
            Message::RegisterRequest(identity) => {
                let reply = match self.register(conn, registered, identity).await {
                    Ok(count) => Message::RegisterResponse {
                        success: true,
                        info: format!(
                            "registration successful, {count} messaging nodes in the overlay"
                        ),
                    },
                    Err(e) => {
                        tracing::warn!(remote = %conn.remote(), error = %e, "registration refused");
                        Message::RegisterResponse {
                            success: false,
                            info: e.to_string(),
                        }
                    }
                };
                let _ = conn.send(reply);
            }
            Message::DeregisterRequest(identity) => {
                let reply = match self.deregister(conn, registered, identity).await {
                    Ok(count) => Message::DeregisterResponse {
                        success: true,
                        info: format!(
                            "deregistration successful, {count} messaging nodes remain"
                        ),
                    },
                    Err(e) => {
                        tracing::warn!(remote = %conn.remote(), error = %e, "deregistration refused");
                        Message::DeregisterResponse {
                            success: false,
                            info: e.to_string(),
                        }
                    }
                };
                let _ = conn.send(reply);
            }
            Message::RoundReady => self.round_event(registered, RoundEvent::Ready),
            Message::TaskComplete(identity) => {
                let _ = self.events_tx.send(RoundEvent::Complete(identity));
            }
            Message::TrafficSummary { peer, stats } => {
                let _ = self.events_tx.send(RoundEvent::Summary(peer, stats));
            }
            other => {
                tracing::warn!(remote = %conn.remote(), kind = other.kind(), "unexpected message");
            }
        }
    }

    fn round_event(&self, registered: &Option<PeerIdentity>, event: fn(PeerIdentity) -> RoundEvent) {
        match registered {
            Some(identity) => {
                let _ = self.events_tx.send(event(identity.clone()));
            }
            None => tracing::warn!("round reply from an unregistered connection"),
        }
    }

    async fn register(
        &self,
        conn: &Connection,
        registered: &mut Option<PeerIdentity>,
        identity: PeerIdentity,
    ) -> Result<usize, RegistryError> {
        if registered.is_some() {
            return Err(RegistryError::DuplicateRegistration(identity));
        }
        check_origin(&identity, conn.remote().ip())?;
        let mut registry = self.registry.lock().await;
        registry.register(identity.clone(), conn.clone())?;
        *registered = Some(identity);
        Ok(registry.len())
    }

    async fn deregister(
        &self,
        conn: &Connection,
        registered: &mut Option<PeerIdentity>,
        identity: PeerIdentity,
    ) -> Result<usize, RegistryError> {
        if registered.as_ref() != Some(&identity) {
            return Err(RegistryError::NotRegistered(identity));
        }
        check_origin(&identity, conn.remote().ip())?;
        let mut registry = self.registry.lock().await;
        registry.deregister(&identity)?;
        *registered = None;
        Ok(registry.len())
    }

    // ── Operator commands ─────────────────────────────────────────────────────

    /// Registered identities in vertex order.
    pub async fn messaging_nodes(&self) -> Vec<PeerIdentity> {
        self.registry.lock().await.identities()
    }

    pub async fn overlay(&self) -> Option<Overlay> {
        self.registry.lock().await.overlay().cloned()
    }

    pub async fn link_weights(&self) -> Result<Vec<LinkWeight>, CoordinatorError> {
        Ok(self.registry.lock().await.link_weights()?)
    }

    /// Build an overlay of `degree` and push each node its assignment.
    /// Returns the number of nodes in the overlay.
    pub async fn setup_overlay(&self, degree: usize) -> Result<usize, CoordinatorError> {
        let mut registry = self.registry.lock().await;
        let mut rng = StdRng::from_entropy();
        let outgoing =
            registry.setup_overlay(degree, self.config.topology_attempts, &mut rng)?;
        let nodes = outgoing.len();
        for (conn, message) in outgoing {
            if let Err(e) = conn.send(message) {
                tracing::warn!(error = %e, "neighbor assignment not delivered");
            }
        }
        Ok(nodes)
    }

    /// Push the full edge set to every node. Returns the edge count.
    pub async fn send_link_weights(&self) -> Result<usize, CoordinatorError> {
        let registry = self.registry.lock().await;
        let edges = registry.link_weights()?.len();
        for (conn, message) in registry.send_link_weights()? {
            if let Err(e) = conn.send(message) {
                tracing::warn!(error = %e, "link weights not delivered");
            }
        }
        tracing::info!(edges, "link weights sent");
        Ok(edges)
    }

    /// Run one messaging round of `burst` tasks per node and return the
    /// aggregate statistics. An inconsistent report is returned, not
    /// raised; only a node missing the prepare barrier aborts the round.
    pub async fn start_round(&self, burst: u32) -> Result<AggregateReport, CoordinatorError> {
        let mut events = self.events_rx.lock().await;
        while events.try_recv().is_ok() {}

        let peers = {
            let registry = self.registry.lock().await;
            if !registry.is_overlay_valid() {
                return Err(RegistryError::NoValidOverlay.into());
            }
            registry.handles()
        };
        let expected: Vec<PeerIdentity> = peers.iter().map(|(id, _)| id.clone()).collect();

        broadcast_to(&peers, Message::RoundPrepare);
        let missing = await_phase(&mut events, &expected, Phase::Ready, self.config.round_timeout()).await;
        if !missing.is_empty() {
            return Err(CoordinatorError::RoundTimeout {
                phase: "round prepare",
                missing,
            });
        }

        tracing::info!(nodes = peers.len(), burst, "round started");
        broadcast_to(&peers, Message::TaskInitiate { burst });
        let missing =
            await_phase(&mut events, &expected, Phase::Complete, self.config.round_timeout()).await;
        if !missing.is_empty() {
            tracing::warn!(missing = %join(&missing), "nodes did not report task completion");
        }

        // tasks may still be in transit; poll until the totals balance
        let deadline = Instant::now() + self.config.quiescence_timeout();
        loop {
            let report = pull_summaries(&mut events, &peers, self.config.quiescence_timeout()).await;
            if report.is_consistent() {
                tracing::info!(sent = report.total.sent, "round quiesced");
                return Ok(report);
            }
            if Instant::now() >= deadline {
                tracing::warn!(in_flight = report.in_flight(), "round did not quiesce");
                return Ok(report);
            }
            tokio::time::sleep(self.config.poll_interval()).await;
        }
    }

    /// Pull a summary from every registered node now.
    pub async fn collect_statistics(&self) -> AggregateReport {
        let mut events = self.events_rx.lock().await;
        while events.try_recv().is_ok() {}
        let peers = self.registry.lock().await.handles();
        pull_summaries(&mut events, &peers, self.config.quiescence_timeout()).await
    }
}

// ── Round helpers ─────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy)]
enum Phase {
    Ready,
    Complete,
}

fn broadcast_to(peers: &[(PeerIdentity, Connection)], message: Message) {
    for (identity, conn) in peers {
        if let Err(e) = conn.send(message.clone()) {
            tracing::warn!(%identity, error = %e, kind = message.kind(), "send failed");
        }
    }
}

/// Wait until every expected peer has sent the phase's reply. Returns the
/// peers still silent at the deadline.
async fn await_phase(
    events: &mut mpsc::UnboundedReceiver<RoundEvent>,
    expected: &[PeerIdentity],
    phase: Phase,
    limit: Duration,
) -> Vec<PeerIdentity> {
    let deadline = Instant::now() + limit;
    let mut pending: BTreeSet<PeerIdentity> = expected.iter().cloned().collect();
    while !pending.is_empty() {
        let event = match timeout_at(deadline, events.recv()).await {
            Ok(Some(event)) => event,
            Ok(None) | Err(_) => break,
        };
        match (phase, event) {
            (Phase::Ready, RoundEvent::Ready(p)) | (Phase::Complete, RoundEvent::Complete(p)) => {
                pending.remove(&p);
            }
            (_, other) => tracing::debug!(?other, "ignoring stale round event"),
        }
    }
    pending.into_iter().collect()
}

async fn pull_summaries(
    events: &mut mpsc::UnboundedReceiver<RoundEvent>,
    peers: &[(PeerIdentity, Connection)],
    limit: Duration,
) -> AggregateReport {
    broadcast_to(peers, Message::PullTrafficSummary);

    let deadline = Instant::now() + limit;
    let mut answers: BTreeMap<PeerIdentity, StatsSnapshot> = BTreeMap::new();
    let expected: BTreeSet<&PeerIdentity> = peers.iter().map(|(id, _)| id).collect();
    while answers.len() < expected.len() {
        let event = match timeout_at(deadline, events.recv()).await {
            Ok(Some(event)) => event,
            Ok(None) | Err(_) => break,
        };
        if let RoundEvent::Summary(peer, stats) = event {
            if expected.contains(&peer) {
                answers.insert(peer, stats);
            }
        }
    }

    let missing = peers
        .iter()
        .filter(|(id, _)| !answers.contains_key(id))
        .map(|(id, _)| id.clone())
        .collect();
    let mut report = AggregateReport::from_peers(answers.into_iter().collect());
    report.missing = missing;
    report
}
