//! Peer registry — the coordinator's single owned view of who is registered
//! and which overlay is current.
//!
//! The registry knows nothing about sockets. Each entry carries an opaque
//! handle `C` (the coordinator uses its connection type), and operations that
//! need to reach peers return `(handle, message)` pairs for the caller to
//! send. Callers keep the whole registry behind one lock so registration,
//! deregistration and overlay rebuilds never interleave.

use std::collections::BTreeMap;
use std::net::IpAddr;

use rand::Rng;

use overlay_core::wire::{LinkWeight, NeighborEntry};
use overlay_core::{Message, PeerIdentity};

use crate::topology::{self, Overlay, TopologyError};

#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    #[error("{0} is already registered")]
    DuplicateRegistration(PeerIdentity),
    #[error("{0} is not registered")]
    NotRegistered(PeerIdentity),
    #[error("degree {requested} needs at least {} nodes, {registered} registered", .requested.saturating_add(1))]
    InsufficientNodes { requested: usize, registered: usize },
    #[error("no valid overlay, run setup-overlay first")]
    NoValidOverlay,
    #[error("{claimed} does not match the connection's address {remote}")]
    AddressMismatch { claimed: PeerIdentity, remote: IpAddr },
    #[error("{claimed} must spell its address as {canonical}")]
    NonCanonicalHost {
        claimed: PeerIdentity,
        canonical: IpAddr,
    },
    #[error(transparent)]
    Topology(#[from] TopologyError),
}

/// The overlay together with the vertex order it was built over.
#[derive(Debug, Clone)]
struct OverlaySnapshot {
    vertices: Vec<PeerIdentity>,
    overlay: Overlay,
}

/// Registered peers keyed by identity. Iteration order is identity order,
/// which is also overlay vertex order.
#[derive(Debug)]
pub struct PeerRegistry<C> {
    entries: BTreeMap<PeerIdentity, C>,
    overlay: Option<OverlaySnapshot>,
}

impl<C> Default for PeerRegistry<C> {
    fn default() -> Self {
        Self {
            entries: BTreeMap::new(),
            overlay: None,
        }
    }
}

/// Reject a registration whose advertised host is not where the connection
/// comes from.
///
/// Address literals must be in canonical form, the same spelling a neighbor
/// derives from an accepted connection, so identities from the registry and
/// from inbound links compare equal.
pub fn check_origin(claimed: &PeerIdentity, remote: IpAddr) -> Result<(), RegistryError> {
    let remote = remote.to_canonical();
    let matches = match claimed.host.parse::<IpAddr>() {
        Ok(ip) => {
            let canonical = ip.to_canonical();
            if claimed.host != canonical.to_string() {
                return Err(RegistryError::NonCanonicalHost {
                    claimed: claimed.clone(),
                    canonical,
                });
            }
            canonical == remote
        }
        Err(_) => claimed.host == remote.to_string(),
    };
    if matches {
        Ok(())
    } else {
        Err(RegistryError::AddressMismatch {
            claimed: claimed.clone(),
            remote,
        })
    }
}

impl<C: Clone> PeerRegistry<C> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn contains(&self, identity: &PeerIdentity) -> bool {
        self.entries.contains_key(identity)
    }

    /// Registered identities in vertex order.
    pub fn identities(&self) -> Vec<PeerIdentity> {
        self.entries.keys().cloned().collect()
    }

    pub fn handle(&self, identity: &PeerIdentity) -> Option<&C> {
        self.entries.get(identity)
    }

    /// Every registered peer with its handle, in vertex order.
    pub fn handles(&self) -> Vec<(PeerIdentity, C)> {
        self.entries
            .iter()
            .map(|(id, c)| (id.clone(), c.clone()))
            .collect()
    }

    /// Add a peer. A registration while an overlay is current invalidates it:
    /// the new peer would have no place in it.
    pub fn register(&mut self, identity: PeerIdentity, handle: C) -> Result<(), RegistryError> {
        if self.entries.contains_key(&identity) {
            return Err(RegistryError::DuplicateRegistration(identity));
        }
        if self.overlay.take().is_some() {
            tracing::warn!(%identity, "registration invalidated the overlay, rerun setup-overlay");
        }
        tracing::info!(%identity, registered = self.entries.len() + 1, "peer registered");
        self.entries.insert(identity, handle);
        Ok(())
    }

    /// Remove a peer. Returns its handle and whether a valid overlay was
    /// invalidated by the removal. Peers keep their routing tables; running a
    /// round before the next setup is the operator's mistake, not a crash.
    pub fn deregister(&mut self, identity: &PeerIdentity) -> Result<(C, bool), RegistryError> {
        let handle = self
            .entries
            .remove(identity)
            .ok_or_else(|| RegistryError::NotRegistered(identity.clone()))?;
        let invalidated = self.overlay.take().is_some();
        if invalidated {
            tracing::warn!(%identity, "deregistration invalidated the overlay, rerun setup-overlay");
        }
        tracing::info!(%identity, registered = self.entries.len(), "peer deregistered");
        Ok((handle, invalidated))
    }

    pub fn overlay(&self) -> Option<&Overlay> {
        self.overlay.as_ref().map(|s| &s.overlay)
    }

    pub fn is_overlay_valid(&self) -> bool {
        self.overlay.is_some()
    }

    /// Build a new overlay of `degree` over every registered peer and return
    /// the neighbor assignment for each of them.
    ///
    /// For every edge the lower-indexed endpoint is told to dial the other,
    /// so each node gets the neighbors above it (possibly none). On any
    /// failure the previous overlay, valid or not, is left untouched.
    pub fn setup_overlay<R: Rng + ?Sized>(
        &mut self,
        degree: usize,
        max_attempts: u32,
        rng: &mut R,
    ) -> Result<Vec<(C, Message)>, RegistryError> {
        let registered = self.entries.len();
        if degree >= registered {
            return Err(RegistryError::InsufficientNodes {
                requested: degree,
                registered,
            });
        }

        let overlay = topology::build(registered, degree, max_attempts, rng)?;
        let vertices = self.identities();

        let mut assignments: Vec<Vec<NeighborEntry>> = vec![Vec::new(); registered];
        for (i, j, weight) in overlay.edges() {
            assignments[i].push(NeighborEntry {
                peer: vertices[j].clone(),
                weight,
            });
        }

        let outgoing = self
            .entries
            .values()
            .cloned()
            .zip(assignments)
            .map(|(handle, list)| (handle, Message::NeighborAssignment(list)))
            .collect();

        tracing::info!(nodes = registered, degree, "overlay set up");
        self.overlay = Some(OverlaySnapshot { vertices, overlay });
        Ok(outgoing)
    }

    /// The current overlay's edges as identity triples, row-major.
    pub fn link_weights(&self) -> Result<Vec<LinkWeight>, RegistryError> {
        let snapshot = self.overlay.as_ref().ok_or(RegistryError::NoValidOverlay)?;
        Ok(snapshot
            .overlay
            .edges()
            .map(|(i, j, weight)| LinkWeight {
                a: snapshot.vertices[i].clone(),
                b: snapshot.vertices[j].clone(),
                weight,
            })
            .collect())
    }

    /// The full edge set addressed to every peer.
    pub fn send_link_weights(&self) -> Result<Vec<(C, Message)>, RegistryError> {
        let weights = self.link_weights()?;
        Ok(self
            .entries
            .values()
            .map(|handle| (handle.clone(), Message::LinkWeights(weights.clone())))
            .collect())
    }
}
