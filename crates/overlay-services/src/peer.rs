//! Messaging peer — node-side overlay state, independent of the transport.
//!
//! Holds the links to direct neighbors, the current routing table and the
//! traffic counters. Connection tasks call in here for every task message;
//! the console and the registry connection drive the state transitions:
//!
//! ```text
//! Unregistered → Registered → NeighborsAssigned → RoutesReady ⇄ MessagingActive
//! ```
//!
//! A new neighbor assignment drops the peer back to `NeighborsAssigned`
//! until the matching link weights arrive.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock};

use dashmap::DashMap;
use rand::Rng;

use overlay_core::wire::{LinkWeight, NeighborEntry, TaskMessage};
use overlay_core::{Message, PeerIdentity, StatsSnapshot, TrafficStats};

use crate::routing::{RouteError, RoutingTable};

/// Outbound half of a neighbor connection. Sends must not block and must
/// keep frames from different callers whole.
pub trait Link: Send + Sync {
    fn send(&self, message: Message) -> anyhow::Result<()>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum PeerState {
    Unregistered,
    Registered,
    NeighborsAssigned,
    RoutesReady,
    MessagingActive,
}

impl fmt::Display for PeerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            PeerState::Unregistered => "unregistered",
            PeerState::Registered => "registered",
            PeerState::NeighborsAssigned => "neighbors assigned",
            PeerState::RoutesReady => "routes ready",
            PeerState::MessagingActive => "messaging active",
        };
        f.write_str(s)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum PeerError {
    #[error("no route to {0}, routing table missing or stale")]
    StaleRoutingTable(PeerIdentity),
    #[error("routes not ready (state: {0})")]
    RoutesNotReady(PeerState),
    #[error("connection to {0} lost")]
    ConnectionLost(PeerIdentity),
    #[error("no destinations in the overlay")]
    NoDestinations,
    #[error(transparent)]
    Route(#[from] RouteError),
}

/// What happened to an incoming task message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Delivery {
    Received,
    Relayed { next_hop: PeerIdentity },
}

/// Result of originating a burst.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BurstOutcome {
    pub sent: u32,
    /// Picks whose next hop had no live link. Not counted as sent.
    pub dropped: u32,
}

struct LinkEntry<L> {
    link: L,
    weight: u8,
}

pub struct MessagingPeer<L> {
    me: PeerIdentity,
    state: Mutex<PeerState>,
    routes: RwLock<Option<Arc<RoutingTable>>>,
    stats: TrafficStats,
    /// Set by `prepare_round`, taken by the burst that follows it.
    round_prepared: AtomicBool,
    links: DashMap<PeerIdentity, LinkEntry<L>>,
}

impl<L: Link> MessagingPeer<L> {
    pub fn new(me: PeerIdentity) -> Self {
        Self {
            me,
            state: Mutex::new(PeerState::Unregistered),
            routes: RwLock::new(None),
            stats: TrafficStats::new(),
            round_prepared: AtomicBool::new(false),
            links: DashMap::new(),
        }
    }

    pub fn identity(&self) -> &PeerIdentity {
        &self.me
    }

    pub fn state(&self) -> PeerState {
        *self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn set_state(&self, next: PeerState) {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        let from = *state;
        if from != next {
            tracing::debug!(%from, to = %next, "peer state");
            *state = next;
        }
    }

    pub fn mark_registered(&self) {
        if self.state() == PeerState::Unregistered {
            self.set_state(PeerState::Registered);
        }
    }

    // ── Links ─────────────────────────────────────────────────────────────────

    /// Record a fresh assignment and return the entries this peer still has
    /// to dial.
    pub fn on_neighbor_assignment(&self, entries: Vec<NeighborEntry>) -> Vec<NeighborEntry> {
        self.set_state(PeerState::NeighborsAssigned);
        tracing::info!(count = entries.len(), "neighbor assignment received");
        entries
            .into_iter()
            .filter(|e| match self.links.get_mut(&e.peer) {
                Some(mut existing) => {
                    existing.weight = e.weight;
                    false
                }
                None => true,
            })
            .collect()
    }

    /// Install a neighbor link. Replaces any previous link to the same peer.
    pub fn add_link(&self, peer: PeerIdentity, link: L, weight: u8) {
        tracing::debug!(%peer, weight, "link up");
        self.links.insert(peer, LinkEntry { link, weight });
    }

    pub fn remove_link(&self, peer: &PeerIdentity) -> Option<L> {
        self.links.remove(peer).map(|(_, e)| e.link)
    }

    pub fn link_count(&self) -> usize {
        self.links.len()
    }

    /// Linked neighbors with edge weights, sorted.
    pub fn neighbors(&self) -> Vec<(PeerIdentity, u8)> {
        let mut out: Vec<_> = self
            .links
            .iter()
            .map(|e| (e.key().clone(), e.value().weight))
            .collect();
        out.sort();
        out
    }

    // ── Routing ───────────────────────────────────────────────────────────────

    /// Compute a routing table from the full edge set and swap it in whole.
    /// On failure the previous table stays.
    pub fn on_link_weights_received(
        &self,
        edges: &[LinkWeight],
    ) -> Result<Arc<RoutingTable>, PeerError> {
        let table = Arc::new(RoutingTable::build(edges, &self.me)?);
        *self.routes.write().unwrap_or_else(PoisonError::into_inner) = Some(Arc::clone(&table));
        self.set_state(PeerState::RoutesReady);
        tracing::info!(
            edges = edges.len(),
            destinations = table.destination_count(),
            "routing table installed"
        );
        Ok(table)
    }

    pub fn routes(&self) -> Option<Arc<RoutingTable>> {
        self.routes
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    // ── Messaging ─────────────────────────────────────────────────────────────

    /// Enter a round: counters go to zero whatever the state, and the peer
    /// becomes `MessagingActive` if it has routes.
    pub fn prepare_round(&self) -> Result<(), PeerError> {
        self.stats.reset();
        match self.state() {
            PeerState::RoutesReady | PeerState::MessagingActive => {
                self.set_state(PeerState::MessagingActive);
                self.round_prepared.store(true, Ordering::Release);
                Ok(())
            }
            other => Err(PeerError::RoutesNotReady(other)),
        }
    }

    /// Originate `burst` task messages to uniformly random destinations.
    ///
    /// A burst that follows `prepare_round` runs in the round it prepared,
    /// so tasks already received from faster neighbors stay counted. Any
    /// other burst starts a new round and zeroes the counters first. Only
    /// messages handed to a live link count as sent.
    pub fn begin_messaging_round<R: Rng + ?Sized>(
        &self,
        burst: u32,
        rng: &mut R,
    ) -> Result<BurstOutcome, PeerError> {
        if !self.round_prepared.swap(false, Ordering::AcqRel) {
            self.prepare_round()?;
            self.round_prepared.store(false, Ordering::Release);
        }
        let table = self
            .routes()
            .ok_or(PeerError::RoutesNotReady(PeerState::MessagingActive))?;

        let mut outcome = BurstOutcome::default();
        if burst == 0 {
            return Ok(outcome);
        }
        let count = table.destination_count();
        if count == 0 {
            return Err(PeerError::NoDestinations);
        }

        for _ in 0..burst {
            let Some(destination) = table.destination_at(rng.gen_range(0..count)) else {
                continue;
            };
            let payload: i32 = rng.gen();
            match self.forward(&table, destination, payload) {
                Ok(_) => {
                    self.stats.record_sent(payload);
                    outcome.sent += 1;
                }
                Err(e) => {
                    tracing::warn!(%destination, error = %e, "task not sent");
                    outcome.dropped += 1;
                }
            }
        }
        tracing::info!(sent = outcome.sent, dropped = outcome.dropped, "burst originated");
        Ok(outcome)
    }

    /// Count a task addressed here, or pass it on unchanged toward its
    /// destination. A relay failure drops only this message.
    pub fn on_task_message_received(&self, task: TaskMessage) -> Result<Delivery, PeerError> {
        if task.destination == self.me {
            self.stats.record_received(task.payload);
            return Ok(Delivery::Received);
        }
        let table = self
            .routes()
            .ok_or_else(|| PeerError::StaleRoutingTable(task.destination.clone()))?;
        let next_hop = self.forward(&table, &task.destination, task.payload)?;
        self.stats.record_relayed();
        Ok(Delivery::Relayed { next_hop })
    }

    fn forward(
        &self,
        table: &RoutingTable,
        destination: &PeerIdentity,
        payload: i32,
    ) -> Result<PeerIdentity, PeerError> {
        let next_hop = table
            .next_hop(destination)
            .ok_or_else(|| PeerError::StaleRoutingTable(destination.clone()))?;
        let entry = self
            .links
            .get(next_hop)
            .ok_or_else(|| PeerError::ConnectionLost(next_hop.clone()))?;
        let task = TaskMessage {
            destination: destination.clone(),
            payload,
        };
        entry
            .link
            .send(Message::Task(task))
            .map_err(|_| PeerError::ConnectionLost(next_hop.clone()))?;
        Ok(next_hop.clone())
    }

    pub fn report_statistics(&self) -> StatsSnapshot {
        self.stats.snapshot()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::topology;
    use rand::rngs::StdRng;
    use rand::SeedableRng;
    use std::collections::{HashMap, VecDeque};

    type Outbox = Arc<Mutex<VecDeque<(PeerIdentity, Message)>>>;

    /// Queues messages for the test to deliver by hand.
    struct QueueLink {
        to: PeerIdentity,
        outbox: Outbox,
    }

    impl Link for QueueLink {
        fn send(&self, message: Message) -> anyhow::Result<()> {
            self.outbox
                .lock()
                .unwrap()
                .push_back((self.to.clone(), message));
            Ok(())
        }
    }

    struct BrokenLink;

    impl Link for BrokenLink {
        fn send(&self, _: Message) -> anyhow::Result<()> {
            anyhow::bail!("closed")
        }
    }

    fn id(port: u16) -> PeerIdentity {
        PeerIdentity::new("127.0.0.1", port)
    }

    /// A fully linked in-memory overlay with routes installed everywhere.
    fn network(n: usize, degree: usize, seed: u64) -> (HashMap<PeerIdentity, MessagingPeer<QueueLink>>, Outbox) {
        let mut rng = StdRng::seed_from_u64(seed);
        let overlay = topology::build(n, degree, 10_000, &mut rng).unwrap();
        let ids: Vec<PeerIdentity> = (0..n).map(|i| id(9000 + i as u16)).collect();
        let outbox: Outbox = Arc::default();

        let peers: HashMap<_, _> = ids
            .iter()
            .map(|p| {
                let peer = MessagingPeer::new(p.clone());
                peer.mark_registered();
                (p.clone(), peer)
            })
            .collect();

        let edges: Vec<LinkWeight> = overlay
            .edges()
            .map(|(i, j, weight)| LinkWeight {
                a: ids[i].clone(),
                b: ids[j].clone(),
                weight,
            })
            .collect();
        for (i, j, weight) in overlay.edges() {
            for (from, to) in [(i, j), (j, i)] {
                let link = QueueLink {
                    to: ids[to].clone(),
                    outbox: Arc::clone(&outbox),
                };
                peers[&ids[from]].add_link(ids[to].clone(), link, weight);
            }
        }
        for peer in peers.values() {
            peer.on_neighbor_assignment(Vec::new());
            peer.on_link_weights_received(&edges).unwrap();
        }
        (peers, outbox)
    }

    fn drain(peers: &HashMap<PeerIdentity, MessagingPeer<QueueLink>>, outbox: &Outbox) {
        loop {
            let next = outbox.lock().unwrap().pop_front();
            let Some((to, message)) = next else { break };
            let Message::Task(task) = message else {
                panic!("unexpected {}", message.kind());
            };
            peers[&to].on_task_message_received(task).unwrap();
        }
    }

    #[test]
    fn state_machine_walks_forward() {
        let peer: MessagingPeer<QueueLink> = MessagingPeer::new(id(1));
        assert_eq!(peer.state(), PeerState::Unregistered);
        peer.mark_registered();
        assert_eq!(peer.state(), PeerState::Registered);
        peer.on_neighbor_assignment(Vec::new());
        assert_eq!(peer.state(), PeerState::NeighborsAssigned);
        let edges = vec![LinkWeight {
            a: id(1),
            b: id(2),
            weight: 3,
        }];
        peer.on_link_weights_received(&edges).unwrap();
        assert_eq!(peer.state(), PeerState::RoutesReady);
        peer.prepare_round().unwrap();
        assert_eq!(peer.state(), PeerState::MessagingActive);
        // re-entrant
        peer.prepare_round().unwrap();
        assert_eq!(peer.state(), PeerState::MessagingActive);
    }

    #[test]
    fn round_before_routes_is_refused() {
        let peer: MessagingPeer<QueueLink> = MessagingPeer::new(id(1));
        peer.mark_registered();
        let mut rng = StdRng::seed_from_u64(1);
        assert!(matches!(
            peer.begin_messaging_round(3, &mut rng),
            Err(PeerError::RoutesNotReady(PeerState::Registered))
        ));
        assert!(matches!(
            peer.prepare_round(),
            Err(PeerError::RoutesNotReady(_))
        ));
    }

    #[test]
    fn assignment_returns_only_unlinked_neighbors() {
        let outbox: Outbox = Arc::default();
        let peer = MessagingPeer::new(id(1));
        peer.add_link(
            id(2),
            QueueLink {
                to: id(2),
                outbox: Arc::clone(&outbox),
            },
            1,
        );
        let todo = peer.on_neighbor_assignment(vec![
            NeighborEntry {
                peer: id(2),
                weight: 7,
            },
            NeighborEntry {
                peer: id(3),
                weight: 4,
            },
        ]);
        assert_eq!(todo.len(), 1);
        assert_eq!(todo[0].peer, id(3));
        // existing link picks up the new weight
        assert_eq!(peer.neighbors(), vec![(id(2), 7)]);
    }

    #[test]
    fn every_sent_message_is_received_exactly_once() {
        let (peers, outbox) = network(8, 3, 21);
        let mut rng = StdRng::seed_from_u64(99);
        for peer in peers.values() {
            let outcome = peer.begin_messaging_round(25, &mut rng).unwrap();
            assert_eq!(outcome.sent, 25);
        }
        drain(&peers, &outbox);

        let mut total = StatsSnapshot::default();
        for peer in peers.values() {
            total.merge(&peer.report_statistics());
        }
        assert_eq!(total.sent, 8 * 25);
        assert_eq!(total.received, total.sent);
        assert_eq!(total.sum_received, total.sum_sent);
    }

    #[test]
    fn relay_forwards_toward_destination() {
        let (peers, outbox) = network(6, 2, 3);
        let me = id(9000);
        let table = peers[&me].routes().unwrap();
        // a destination two or more hops away on the ring
        let far = table
            .destinations()
            .find(|d| table.path_to(d).unwrap().len() > 2)
            .unwrap()
            .clone();
        let task = TaskMessage {
            destination: far.clone(),
            payload: 5,
        };
        let delivery = peers[&me].on_task_message_received(task).unwrap();
        assert_eq!(
            delivery,
            Delivery::Relayed {
                next_hop: table.next_hop(&far).unwrap().clone()
            }
        );
        assert_eq!(peers[&me].report_statistics().relayed, 1);

        drain(&peers, &outbox);
        assert_eq!(peers[&far].report_statistics().received, 1);
        assert_eq!(peers[&far].report_statistics().sum_received, 5);
    }

    #[test]
    fn relay_without_routes_is_an_error() {
        let peer: MessagingPeer<QueueLink> = MessagingPeer::new(id(1));
        let err = peer
            .on_task_message_received(TaskMessage {
                destination: id(2),
                payload: 1,
            })
            .unwrap_err();
        assert!(matches!(err, PeerError::StaleRoutingTable(_)));
        assert_eq!(peer.report_statistics(), StatsSnapshot::default());
    }

    #[test]
    fn missing_link_is_connection_lost() {
        let (peers, _outbox) = network(4, 2, 5);
        let me = id(9000);
        let table = peers[&me].routes().unwrap();
        let dest = table.destinations().next().unwrap().clone();
        let hop = table.next_hop(&dest).unwrap().clone();
        peers[&me].remove_link(&hop);

        let err = peers[&me]
            .on_task_message_received(TaskMessage {
                destination: dest,
                payload: 1,
            })
            .unwrap_err();
        assert!(matches!(err, PeerError::ConnectionLost(p) if p == hop));
    }

    #[test]
    fn failed_sends_are_not_counted() {
        let peer = MessagingPeer::new(id(1));
        peer.add_link(id(2), BrokenLink, 1);
        let edges = vec![LinkWeight {
            a: id(1),
            b: id(2),
            weight: 1,
        }];
        peer.on_link_weights_received(&edges).unwrap();
        let mut rng = StdRng::seed_from_u64(2);
        let outcome = peer.begin_messaging_round(4, &mut rng).unwrap();
        assert_eq!(outcome, BurstOutcome { sent: 0, dropped: 4 });
        assert_eq!(peer.report_statistics().sent, 0);
    }

    #[test]
    fn lone_peer_has_nowhere_to_send() {
        let peer: MessagingPeer<QueueLink> = MessagingPeer::new(id(1));
        peer.on_link_weights_received(&[]).unwrap();
        let mut rng = StdRng::seed_from_u64(2);
        assert!(matches!(
            peer.begin_messaging_round(1, &mut rng),
            Err(PeerError::NoDestinations)
        ));
        assert_eq!(
            peer.begin_messaging_round(0, &mut rng).unwrap(),
            BurstOutcome::default()
        );
    }

    #[test]
    fn new_round_resets_counters() {
        let (peers, outbox) = network(4, 2, 8);
        let mut rng = StdRng::seed_from_u64(4);
        let first = &peers[&id(9000)];
        first.begin_messaging_round(5, &mut rng).unwrap();
        drain(&peers, &outbox);
        assert_eq!(first.report_statistics().sent, 5);

        first.prepare_round().unwrap();
        assert_eq!(first.report_statistics(), StatsSnapshot::default());
    }

    #[test]
    fn back_to_back_bursts_each_start_from_zero() {
        let (peers, outbox) = network(4, 2, 8);
        let mut rng = StdRng::seed_from_u64(5);
        let first = &peers[&id(9000)];

        first.begin_messaging_round(5, &mut rng).unwrap();
        drain(&peers, &outbox);
        assert_eq!(first.report_statistics().sent, 5);

        first.begin_messaging_round(3, &mut rng).unwrap();
        drain(&peers, &outbox);
        let second = first.report_statistics();
        assert_eq!(second.sent, 3);
        assert_eq!(second.relayed, 0);
        assert_eq!(second.received, 0);
    }

    #[test]
    fn prepared_round_keeps_early_arrivals() {
        let (peers, outbox) = network(4, 2, 8);
        let mut rng = StdRng::seed_from_u64(6);
        for peer in peers.values() {
            peer.prepare_round().unwrap();
        }
        // every other peer sends and delivers before 9000 starts its burst
        for (identity, peer) in &peers {
            if *identity != id(9000) {
                peer.begin_messaging_round(10, &mut rng).unwrap();
            }
        }
        drain(&peers, &outbox);
        let first = &peers[&id(9000)];
        let early = first.report_statistics();

        first.begin_messaging_round(10, &mut rng).unwrap();
        drain(&peers, &outbox);
        let after = first.report_statistics();
        assert_eq!(after.sent, 10);
        assert!(after.received >= early.received);
        assert!(after.relayed >= early.relayed);

        let mut total = StatsSnapshot::default();
        for peer in peers.values() {
            total.merge(&peer.report_statistics());
        }
        assert_eq!(total.sent, 40);
        assert_eq!(total.received, 40);
    }

    #[test]
    fn bad_edge_set_keeps_previous_table() {
        let (peers, _outbox) = network(4, 2, 9);
        let peer = &peers[&id(9000)];
        let before = peer.routes().unwrap();
        let disconnected = vec![
            LinkWeight {
                a: id(9000),
                b: id(9001),
                weight: 1,
            },
            LinkWeight {
                a: id(9002),
                b: id(9003),
                weight: 1,
            },
        ];
        assert!(peer.on_link_weights_received(&disconnected).is_err());
        assert!(Arc::ptr_eq(&before, &peer.routes().unwrap()));
    }
}
