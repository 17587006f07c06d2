//! Messaging node runtime: the registry connection, the neighbor listener
//! and one task per neighbor link, all feeding a shared [`MessagingPeer`].

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Context;
use rand::rngs::StdRng;
use rand::SeedableRng;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, watch};

use overlay_core::config::NodeConfig;
use overlay_core::wire::NeighborEntry;
use overlay_core::{Message, PeerIdentity};

use crate::connection::{Connection, FrameReader};
use crate::peer::{Delivery, MessagingPeer};

/// Where the node stands with the registry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NodeStatus {
    Registering,
    Registered,
    Rejected(String),
    Deregistered,
    /// Registry connection closed.
    Disconnected,
}

pub struct MessagingNode {
    peer: Arc<MessagingPeer<Connection>>,
    registry: Connection,
    status: watch::Sender<NodeStatus>,
    shutdown: broadcast::Sender<()>,
}

impl MessagingNode {
    /// Bind the neighbor listener, connect to the registry and send the
    /// registration request. The response arrives asynchronously; see
    /// [`MessagingNode::wait_registered`].
    pub async fn start(config: &NodeConfig, registry_addr: &str) -> anyhow::Result<Arc<Self>> {
        let listener = TcpListener::bind(("0.0.0.0", config.listen_port))
            .await
            .context("failed to bind neighbor listener")?;
        let port = listener.local_addr()?.port();
        let me = PeerIdentity::new(config.advertise_host.clone(), port);

        let (registry, registry_reader) = Connection::connect(registry_addr)
            .await
            .with_context(|| format!("failed to reach registry at {registry_addr}"))?;

        let (status, _) = watch::channel(NodeStatus::Registering);
        let (shutdown, _) = broadcast::channel(1);
        let node = Arc::new(Self {
            peer: Arc::new(MessagingPeer::new(me.clone())),
            registry,
            status,
            shutdown,
        });

        tokio::spawn(Arc::clone(&node).accept_loop(listener));
        tokio::spawn(Arc::clone(&node).registry_loop(registry_reader));

        node.registry.send(Message::RegisterRequest(me.clone()))?;
        tracing::info!(identity = %me, registry = %registry_addr, "registration sent");
        Ok(node)
    }

    pub fn identity(&self) -> &PeerIdentity {
        self.peer.identity()
    }

    pub fn peer(&self) -> &Arc<MessagingPeer<Connection>> {
        &self.peer
    }

    pub fn status(&self) -> watch::Receiver<NodeStatus> {
        self.status.subscribe()
    }

    /// Resolve once the registry has answered the registration.
    pub async fn wait_registered(&self) -> anyhow::Result<()> {
        let mut rx = self.status();
        let status = rx
            .wait_for(|s| *s != NodeStatus::Registering)
            .await
            .context("node stopped")?
            .clone();
        match status {
            NodeStatus::Registered => Ok(()),
            NodeStatus::Rejected(info) => anyhow::bail!("registration rejected: {info}"),
            other => anyhow::bail!("registration did not complete: {other:?}"),
        }
    }

    /// Ask the registry to let this node go. The node is done once the
    /// status turns `Deregistered`.
    pub fn exit_overlay(&self) -> anyhow::Result<()> {
        self.registry
            .send(Message::DeregisterRequest(self.identity().clone()))?;
        Ok(())
    }

    pub fn shutdown(&self) {
        let _ = self.shutdown.send(());
    }

    /// One line per destination: the hop-by-hop path and its total cost.
    pub fn shortest_paths(&self) -> Vec<String> {
        let Some(table) = self.peer.routes() else {
            return Vec::new();
        };
        table
            .destinations()
            .filter_map(|d| {
                let path = table.describe_path(d)?;
                let cost = table.distance(d)?;
                Some(format!("{path} (cost {cost})"))
            })
            .collect()
    }

    // ── Registry ──────────────────────────────────────────────────────────────

    async fn registry_loop(self: Arc<Self>, mut reader: FrameReader) {
        loop {
            match reader.next().await {
                Ok(Some(message)) => self.on_registry_message(message),
                Ok(None) => break,
                Err(e) if e.is_recoverable() => {
                    tracing::warn!(error = %e, "dropping malformed registry frame");
                }
                Err(e) => {
                    tracing::warn!(error = %e, "registry connection failed");
                    break;
                }
            }
        }
        tracing::warn!("registry connection closed");
        self.status.send_if_modified(|s| {
            let changed = *s != NodeStatus::Deregistered;
            if changed {
                *s = NodeStatus::Disconnected;
            }
            changed
        });
    }

    fn on_registry_message(self: &Arc<Self>, message: Message) {
        match message {
            Message::RegisterResponse { success, info } => {
                if success {
                    tracing::info!(%info, "registered");
                    self.peer.mark_registered();
                    self.status.send_replace(NodeStatus::Registered);
                } else {
                    tracing::error!(%info, "registration rejected");
                    self.status.send_replace(NodeStatus::Rejected(info));
                }
            }
            Message::DeregisterResponse { success, info } => {
                if success {
                    tracing::info!(%info, "deregistered");
                    self.status.send_replace(NodeStatus::Deregistered);
                } else {
                    tracing::warn!(%info, "deregistration refused");
                }
            }
            Message::NeighborAssignment(entries) => {
                for entry in self.peer.on_neighbor_assignment(entries) {
                    tokio::spawn(Arc::clone(self).dial(entry));
                }
            }
            Message::LinkWeights(edges) => {
                if let Err(e) = self.peer.on_link_weights_received(&edges) {
                    tracing::error!(error = %e, "link weights rejected");
                }
            }
            Message::RoundPrepare => {
                if let Err(e) = self.peer.prepare_round() {
                    tracing::warn!(error = %e, "round prepared without routes");
                }
                let _ = self.registry.send(Message::RoundReady);
            }
            Message::TaskInitiate { burst } => {
                let mut rng = StdRng::from_entropy();
                if let Err(e) = self.peer.begin_messaging_round(burst, &mut rng) {
                    tracing::error!(error = %e, "burst not originated");
                }
                let _ = self
                    .registry
                    .send(Message::TaskComplete(self.identity().clone()));
            }
            Message::PullTrafficSummary => {
                let _ = self.registry.send(Message::TrafficSummary {
                    peer: self.identity().clone(),
                    stats: self.peer.report_statistics(),
                });
            }
            other => tracing::warn!(kind = other.kind(), "unexpected message from registry"),
        }
    }

    // ── Neighbors ─────────────────────────────────────────────────────────────

    /// Connect to an assigned neighbor and announce ourselves over the link.
    async fn dial(self: Arc<Self>, entry: NeighborEntry) {
        let target = (entry.peer.host.as_str(), entry.peer.port);
        let (conn, reader) = match Connection::connect(target).await {
            Ok(pair) => pair,
            Err(e) => {
                tracing::error!(peer = %entry.peer, error = %e, "neighbor unreachable");
                return;
            }
        };
        let announcement = Message::WeightAnnouncement {
            port: self.identity().port,
            cost: entry.weight,
        };
        if let Err(e) = conn.send(announcement) {
            tracing::error!(peer = %entry.peer, error = %e, "announcement failed");
            return;
        }
        self.peer.add_link(entry.peer.clone(), conn, entry.weight);
        self.serve_link(reader, entry.peer).await;
    }

    async fn accept_loop(self: Arc<Self>, listener: TcpListener) {
        let mut shutdown = self.shutdown.subscribe();
        loop {
            tokio::select! {
                _ = shutdown.recv() => {
                    tracing::info!("neighbor listener shutting down");
                    return;
                }

                accepted = listener.accept() => {
                    match accepted {
                        Ok((stream, remote)) => {
                            tokio::spawn(Arc::clone(&self).accept_link(stream, remote));
                        }
                        Err(e) => tracing::warn!(error = %e, "accept failed"),
                    }
                }
            }
        }
    }

    /// The dialing side speaks first: its announcement names its listening
    /// port and the edge weight.
    async fn accept_link(self: Arc<Self>, stream: TcpStream, remote: SocketAddr) {
        let (conn, mut reader) = match Connection::spawn(stream) {
            Ok(pair) => pair,
            Err(e) => {
                tracing::warn!(%remote, error = %e, "link setup failed");
                return;
            }
        };
        let (port, cost) = match reader.next().await {
            Ok(Some(Message::WeightAnnouncement { port, cost })) => (port, cost),
            Ok(Some(other)) => {
                tracing::warn!(%remote, kind = other.kind(), "expected a weight announcement");
                return;
            }
            Ok(None) => return,
            Err(e) => {
                tracing::warn!(%remote, error = %e, "bad weight announcement");
                return;
            }
        };
        let neighbor = PeerIdentity::new(remote.ip().to_canonical().to_string(), port);
        self.peer.add_link(neighbor.clone(), conn, cost);
        self.serve_link(reader, neighbor).await;
    }

    async fn serve_link(&self, mut reader: FrameReader, neighbor: PeerIdentity) {
        loop {
            match reader.next().await {
                Ok(Some(Message::Task(task))) => match self.peer.on_task_message_received(task) {
                    Ok(Delivery::Received) => {}
                    Ok(Delivery::Relayed { next_hop }) => {
                        tracing::trace!(from = %neighbor, to = %next_hop, "relayed");
                    }
                    Err(e) => tracing::warn!(from = %neighbor, error = %e, "task dropped"),
                },
                Ok(Some(other)) => {
                    tracing::warn!(%neighbor, kind = other.kind(), "unexpected message on link");
                }
                Ok(None) => break,
                Err(e) if e.is_recoverable() => {
                    tracing::warn!(%neighbor, error = %e, "dropping malformed frame");
                }
                Err(e) => {
                    tracing::warn!(%neighbor, error = %e, "link failed");
                    break;
                }
            }
        }
        tracing::warn!(%neighbor, "link closed");
        self.peer.remove_link(&neighbor);
    }
}
