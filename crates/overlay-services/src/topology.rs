//! Link weight assignment — builds the random, degree-regular, weighted
//! overlay graph.
//!
//! Construction seeds a Hamiltonian ring (which makes every result connected)
//! and then adds random chords, always serving the vertex furthest from
//! `degree` first. An attempt that gets stuck before every vertex has exactly
//! `degree` edges is thrown away whole and construction restarts, up to a
//! fixed number of attempts.

use std::cmp::Reverse;
use std::collections::VecDeque;
use std::fmt;

use rand::seq::SliceRandom;
use rand::Rng;

use overlay_core::wire::{MAX_WEIGHT, MIN_WEIGHT};

/// A valid overlay: symmetric `W[i][j]` with 0 for "no edge" and 1–9 for an
/// edge weight. Every row has exactly `degree` non-zero entries and the graph
/// is connected. Immutable once built.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Overlay {
    matrix: Vec<Vec<u8>>,
    degree: usize,
}

impl Overlay {
    /// Number of vertices.
    pub fn size(&self) -> usize {
        self.matrix.len()
    }

    pub fn degree(&self) -> usize {
        self.degree
    }

    /// Weight of the edge `i`-`j`, 0 if absent.
    pub fn weight(&self, i: usize, j: usize) -> u8 {
        self.matrix[i][j]
    }

    pub fn matrix(&self) -> &[Vec<u8>] {
        &self.matrix
    }

    /// Neighbors of `vertex` with their edge weights, ascending by index.
    pub fn neighbors(&self, vertex: usize) -> impl Iterator<Item = (usize, u8)> + '_ {
        self.matrix[vertex]
            .iter()
            .enumerate()
            .filter(|(_, w)| **w != 0)
            .map(|(j, w)| (j, *w))
    }

    /// Every undirected edge once, as `(i, j, weight)` with `i < j`, in
    /// row-major order.
    pub fn edges(&self) -> impl Iterator<Item = (usize, usize, u8)> + '_ {
        self.matrix.iter().enumerate().flat_map(|(i, row)| {
            row.iter()
                .enumerate()
                .skip(i + 1)
                .filter(|(_, w)| **w != 0)
                .map(move |(j, w)| (i, j, *w))
        })
    }
}

impl fmt::Display for Overlay {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, row) in self.matrix.iter().enumerate() {
            write!(f, "{i:02} ->")?;
            for w in row {
                write!(f, " {w}")?;
            }
            if i + 1 < self.matrix.len() {
                writeln!(f)?;
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TopologyError {
    #[error("invalid topology: {nodes} nodes with degree {degree}: {reason}")]
    InvalidTopology {
        nodes: usize,
        degree: usize,
        reason: String,
    },
}

/// Build an overlay of `nodes` vertices where every vertex has exactly
/// `degree` edges.
///
/// Fails fast for requests no construction can satisfy (`degree >= nodes`,
/// odd `nodes * degree`, or a degree below what the seed ring already
/// gives), and fails after `max_attempts` discarded attempts otherwise.
pub fn build<R: Rng + ?Sized>(
    nodes: usize,
    degree: usize,
    max_attempts: u32,
    rng: &mut R,
) -> Result<Overlay, TopologyError> {
    let invalid = |reason: String| TopologyError::InvalidTopology {
        nodes,
        degree,
        reason,
    };

    if nodes == 0 {
        return Err(invalid("no nodes registered".into()));
    }
    if degree >= nodes {
        return Err(invalid("degree must be less than the node count".into()));
    }
    if (nodes * degree) % 2 != 0 {
        return Err(invalid("nodes * degree must be even".into()));
    }
    let ring = ring_degree(nodes);
    if degree < ring {
        return Err(invalid(format!(
            "the connectivity ring already gives every node {ring} links"
        )));
    }

    for attempt in 1..=max_attempts {
        if let Some(matrix) = attempt_build(nodes, degree, rng) {
            let overlay = Overlay { matrix, degree };
            if is_valid(&overlay) {
                tracing::debug!(nodes, degree, attempt, "overlay constructed");
                return Ok(overlay);
            }
        }
    }

    Err(invalid(format!(
        "no regular overlay found after {max_attempts} attempts"
    )))
}

/// Degree every vertex has after seeding the ring.
fn ring_degree(nodes: usize) -> usize {
    match nodes {
        0 | 1 => 0,
        2 => 1,
        _ => 2,
    }
}

fn attempt_build<R: Rng + ?Sized>(n: usize, degree: usize, rng: &mut R) -> Option<Vec<Vec<u8>>> {
    let mut w = vec![vec![0u8; n]; n];
    let mut realized = vec![0usize; n];

    if n >= 2 {
        for i in 0..n {
            let j = (i + 1) % n;
            if w[i][j] == 0 {
                connect(&mut w, &mut realized, i, j, rng);
            }
        }
    }

    // Most deficient vertex first, linked to the most deficient eligible
    // partners. Ties are broken at random, which is where the variety between
    // attempts comes from.
    loop {
        let deficit = |v: usize| degree - realized[v];
        let worst = (0..n).map(deficit).max().unwrap_or(0);
        if worst == 0 {
            return Some(w);
        }
        let tied: Vec<usize> = (0..n).filter(|&v| deficit(v) == worst).collect();
        let v = *tied.choose(rng)?;

        let mut partners: Vec<usize> = (0..n)
            .filter(|&u| u != v && w[v][u] == 0 && realized[u] < degree)
            .collect();
        if partners.len() < worst {
            return None;
        }
        partners.shuffle(rng);
        partners.sort_by_key(|&u| Reverse(deficit(u)));
        for u in partners.into_iter().take(worst) {
            connect(&mut w, &mut realized, v, u, rng);
        }
    }
}

fn connect<R: Rng + ?Sized>(
    w: &mut [Vec<u8>],
    realized: &mut [usize],
    i: usize,
    j: usize,
    rng: &mut R,
) {
    let weight = rng.gen_range(MIN_WEIGHT..=MAX_WEIGHT);
    w[i][j] = weight;
    w[j][i] = weight;
    realized[i] += 1;
    realized[j] += 1;
}

/// The full overlay predicate: square, zero diagonal, symmetric, weights in
/// range, exact degree on every row, connected.
pub fn is_valid(overlay: &Overlay) -> bool {
    let n = overlay.size();
    let m = overlay.matrix();
    for (i, row) in m.iter().enumerate() {
        if row.len() != n || row[i] != 0 {
            return false;
        }
        let mut edges = 0;
        for (j, &w) in row.iter().enumerate() {
            if w != m[j][i] {
                return false;
            }
            if w != 0 {
                if !(MIN_WEIGHT..=MAX_WEIGHT).contains(&w) {
                    return false;
                }
                edges += 1;
            }
        }
        if edges != overlay.degree() {
            return false;
        }
    }
    is_connected(m)
}

/// BFS over non-zero entries from vertex 0.
pub fn is_connected(matrix: &[Vec<u8>]) -> bool {
    let n = matrix.len();
    if n == 0 {
        return true;
    }
    let mut seen = vec![false; n];
    let mut queue = VecDeque::from([0usize]);
    seen[0] = true;
    while let Some(v) = queue.pop_front() {
        for (u, &w) in matrix[v].iter().enumerate() {
            if w != 0 && !seen[u] {
                seen[u] = true;
                queue.push_back(u);
            }
        }
    }
    seen.into_iter().all(|s| s)
}
