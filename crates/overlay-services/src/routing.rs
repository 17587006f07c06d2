//! Shortest-path engine — Dijkstra over the overlay and the per-node routing
//! table built from it.
//!
//! Every node receives the same edge set and sorts the identities it contains
//! the same way, so all nodes agree on vertex indices without the registry
//! sending them. Ties between equal-cost predecessors go to the lowest vertex
//! index, which makes a table reproducible from its input.

use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap};

use overlay_core::wire::LinkWeight;
use overlay_core::PeerIdentity;

/// Single-source result over a weight matrix.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShortestPaths {
    source: usize,
    /// `None` for vertices the source cannot reach.
    distance: Vec<Option<u32>>,
    predecessor: Vec<Option<usize>>,
}

impl ShortestPaths {
    pub fn source(&self) -> usize {
        self.source
    }

    pub fn distance(&self, target: usize) -> Option<u32> {
        self.distance.get(target).copied().flatten()
    }

    /// Vertices from the source to `target`, both included.
    pub fn path(&self, target: usize) -> Option<Vec<usize>> {
        self.distance(target)?;
        let mut path = vec![target];
        let mut v = target;
        while v != self.source {
            v = self.predecessor[v]?;
            path.push(v);
        }
        path.reverse();
        Some(path)
    }

    /// First vertex after the source on the path to `target`. A direct
    /// neighbor reached over its own edge is its own next hop.
    pub fn next_hop(&self, target: usize) -> Option<usize> {
        if target == self.source {
            return None;
        }
        self.distance(target)?;
        let mut v = target;
        loop {
            let p = self.predecessor[v]?;
            if p == self.source {
                return Some(v);
            }
            v = p;
        }
    }
}

/// Dijkstra from `source` over a symmetric matrix where 0 means "no edge".
pub fn shortest_paths(matrix: &[Vec<u8>], source: usize) -> ShortestPaths {
    let n = matrix.len();
    let mut distance: Vec<Option<u32>> = vec![None; n];
    let mut predecessor: Vec<Option<usize>> = vec![None; n];
    let mut heap = BinaryHeap::new();

    if source < n {
        distance[source] = Some(0);
        heap.push(Reverse((0u32, source)));
    }

    while let Some(Reverse((d, u))) = heap.pop() {
        if distance[u].is_some_and(|best| d > best) {
            continue;
        }
        for (v, &w) in matrix[u].iter().enumerate() {
            if w == 0 || v == source {
                continue;
            }
            let nd = d + u32::from(w);
            match distance[v] {
                Some(best) if nd > best => {}
                Some(best) if nd == best => {
                    // every equal-cost predecessor relaxes v once; keep the lowest
                    if predecessor[v].is_some_and(|p| u < p) {
                        predecessor[v] = Some(u);
                    }
                }
                _ => {
                    distance[v] = Some(nd);
                    predecessor[v] = Some(u);
                    heap.push(Reverse((nd, v)));
                }
            }
        }
    }

    ShortestPaths {
        source,
        distance,
        predecessor,
    }
}

// ── Routing table ─────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RouteError {
    /// The edge set leaves a vertex unreachable. A valid overlay is connected,
    /// so this means the registry sent something it should not have.
    #[error("no route to {0}")]
    UnreachableVertex(PeerIdentity),
    #[error("{0} does not appear in the link weights")]
    UnknownSource(PeerIdentity),
}

/// Per-node routing state, built once per link-weight push and replaced
/// whole; never updated in place.
#[derive(Debug, Clone)]
pub struct RoutingTable {
    me: PeerIdentity,
    /// Sorted; position is the vertex index.
    vertices: Vec<PeerIdentity>,
    index: HashMap<PeerIdentity, usize>,
    weights: Vec<Vec<u8>>,
    paths: ShortestPaths,
    next_hops: Vec<Option<usize>>,
}

impl RoutingTable {
    /// Build the table for `me` from the full weighted edge set.
    ///
    /// An empty edge set is valid only for a single-node overlay and yields
    /// a table with no destinations.
    pub fn build(edges: &[LinkWeight], me: &PeerIdentity) -> Result<Self, RouteError> {
        let mut vertices: Vec<PeerIdentity> = edges
            .iter()
            .flat_map(|e| [e.a.clone(), e.b.clone()])
            .collect();
        if !edges.is_empty() && !vertices.contains(me) {
            return Err(RouteError::UnknownSource(me.clone()));
        }
        vertices.push(me.clone());
        vertices.sort();
        vertices.dedup();

        let index: HashMap<PeerIdentity, usize> = vertices
            .iter()
            .enumerate()
            .map(|(i, p)| (p.clone(), i))
            .collect();

        let n = vertices.len();
        let mut weights = vec![vec![0u8; n]; n];
        for e in edges {
            let (i, j) = (index[&e.a], index[&e.b]);
            if i == j {
                continue;
            }
            weights[i][j] = e.weight;
            weights[j][i] = e.weight;
        }

        let source = index[me];
        let paths = shortest_paths(&weights, source);
        if let Some(v) = (0..n).find(|&v| paths.distance(v).is_none()) {
            return Err(RouteError::UnreachableVertex(vertices[v].clone()));
        }
        let next_hops = (0..n).map(|v| paths.next_hop(v)).collect();

        Ok(Self {
            me: me.clone(),
            vertices,
            index,
            weights,
            paths,
            next_hops,
        })
    }

    pub fn me(&self) -> &PeerIdentity {
        &self.me
    }

    /// Every peer except this one, in vertex order.
    pub fn destinations(&self) -> impl Iterator<Item = &PeerIdentity> + '_ {
        self.vertices.iter().filter(move |p| **p != self.me)
    }

    pub fn destination_count(&self) -> usize {
        self.vertices.len().saturating_sub(1)
    }

    /// Uniform pick used by the round originator.
    pub fn destination_at(&self, i: usize) -> Option<&PeerIdentity> {
        self.destinations().nth(i)
    }

    pub fn contains(&self, peer: &PeerIdentity) -> bool {
        self.index.contains_key(peer)
    }

    pub fn distance(&self, destination: &PeerIdentity) -> Option<u32> {
        self.paths.distance(*self.index.get(destination)?)
    }

    pub fn next_hop(&self, destination: &PeerIdentity) -> Option<&PeerIdentity> {
        let v = *self.index.get(destination)?;
        self.next_hops[v].map(|hop| &self.vertices[hop])
    }

    /// Identities from this node to `destination`, both included.
    pub fn path_to(&self, destination: &PeerIdentity) -> Option<Vec<&PeerIdentity>> {
        let v = *self.index.get(destination)?;
        let path = self.paths.path(v)?;
        Some(path.into_iter().map(|i| &self.vertices[i]).collect())
    }

    /// `a--w--b--w--c`, the form the node console prints.
    pub fn describe_path(&self, destination: &PeerIdentity) -> Option<String> {
        let v = *self.index.get(destination)?;
        let path = self.paths.path(v)?;
        let mut out = self.vertices[path[0]].to_string();
        for pair in path.windows(2) {
            let w = self.weights[pair[0]][pair[1]];
            out.push_str(&format!("--{w}--{}", self.vertices[pair[1]]));
        }
        Some(out)
    }
}
