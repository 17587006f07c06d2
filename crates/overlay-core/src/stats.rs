//! Traffic statistics — per-peer counters and the registry-side aggregate.
//!
//! Counters are updated from connection handler tasks and read from the
//! console task, so they are plain atomics. A snapshot is not a
//! linearizable cut across all five counters; it only needs to be exact once
//! a round has quiesced.

use std::fmt;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};

use crate::identity::PeerIdentity;

/// Point-in-time copy of a peer's counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StatsSnapshot {
    pub sent: u64,
    pub sum_sent: i64,
    pub received: u64,
    pub sum_received: i64,
    pub relayed: u64,
}

impl StatsSnapshot {
    /// Component-wise sum. Payload sums wrap; only equality between the two
    /// sums matters, and wrapping addition preserves it.
    pub fn merge(&mut self, other: &StatsSnapshot) {
        self.sent += other.sent;
        self.sum_sent = self.sum_sent.wrapping_add(other.sum_sent);
        self.received += other.received;
        self.sum_received = self.sum_received.wrapping_add(other.sum_received);
        self.relayed += other.relayed;
    }
}

/// Live counters owned by one messaging peer.
#[derive(Debug, Default)]
pub struct TrafficStats {
    sent: AtomicU64,
    sum_sent: AtomicI64,
    received: AtomicU64,
    sum_received: AtomicI64,
    relayed: AtomicU64,
}

impl TrafficStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_sent(&self, payload: i32) {
        self.sent.fetch_add(1, Ordering::Relaxed);
        self.sum_sent.fetch_add(i64::from(payload), Ordering::Relaxed);
    }

    pub fn record_received(&self, payload: i32) {
        self.received.fetch_add(1, Ordering::Relaxed);
        self.sum_received
            .fetch_add(i64::from(payload), Ordering::Relaxed);
    }

    pub fn record_relayed(&self) {
        self.relayed.fetch_add(1, Ordering::Relaxed);
    }

    /// Zero every counter. Called when a peer enters a messaging round.
    pub fn reset(&self) {
        self.sent.store(0, Ordering::Relaxed);
        self.sum_sent.store(0, Ordering::Relaxed);
        self.received.store(0, Ordering::Relaxed);
        self.sum_received.store(0, Ordering::Relaxed);
        self.relayed.store(0, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            sent: self.sent.load(Ordering::Relaxed),
            sum_sent: self.sum_sent.load(Ordering::Relaxed),
            received: self.received.load(Ordering::Relaxed),
            sum_received: self.sum_received.load(Ordering::Relaxed),
            relayed: self.relayed.load(Ordering::Relaxed),
        }
    }
}

// ── Aggregate ─────────────────────────────────────────────────────────────────

/// Summaries collected from every registered peer plus their total.
#[derive(Debug, Clone, Default)]
pub struct AggregateReport {
    pub peers: Vec<(PeerIdentity, StatsSnapshot)>,
    pub total: StatsSnapshot,
    /// Registered peers that did not answer the pull.
    pub missing: Vec<PeerIdentity>,
}

impl AggregateReport {
    pub fn from_peers(peers: Vec<(PeerIdentity, StatsSnapshot)>) -> Self {
        let mut total = StatsSnapshot::default();
        for (_, s) in &peers {
            total.merge(s);
        }
        Self {
            peers,
            total,
            missing: Vec::new(),
        }
    }

    /// Conservation law: everything sent was received, by count and by sum,
    /// and every peer answered.
    pub fn is_consistent(&self) -> bool {
        self.missing.is_empty()
            && self.total.sent == self.total.received
            && self.total.sum_sent == self.total.sum_received
    }

    /// Messages sent but not (yet) received.
    pub fn in_flight(&self) -> i128 {
        i128::from(self.total.sent) - i128::from(self.total.received)
    }
}

impl fmt::Display for AggregateReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(
            f,
            "{:<24} {:>8} {:>8} {:>8} {:>16} {:>16}",
            "node", "sent", "recv", "relayed", "sum sent", "sum recv"
        )?;
        for (peer, s) in &self.peers {
            writeln!(
                f,
                "{:<24} {:>8} {:>8} {:>8} {:>16} {:>16}",
                peer.to_string(),
                s.sent,
                s.received,
                s.relayed,
                s.sum_sent,
                s.sum_received
            )?;
        }
        let t = &self.total;
        write!(
            f,
            "{:<24} {:>8} {:>8} {:>8} {:>16} {:>16}",
            "sum", t.sent, t.received, t.relayed, t.sum_sent, t.sum_received
        )?;
        for peer in &self.missing {
            write!(f, "\n(no summary from {peer})")?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counters_accumulate_and_reset() {
        let stats = TrafficStats::new();
        stats.record_sent(10);
        stats.record_sent(-4);
        stats.record_received(7);
        stats.record_relayed();

        let snap = stats.snapshot();
        assert_eq!(snap.sent, 2);
        assert_eq!(snap.sum_sent, 6);
        assert_eq!(snap.received, 1);
        assert_eq!(snap.sum_received, 7);
        assert_eq!(snap.relayed, 1);

        stats.reset();
        assert_eq!(stats.snapshot(), StatsSnapshot::default());
    }

    #[test]
    fn sums_do_not_overflow_on_extreme_payloads() {
        let stats = TrafficStats::new();
        for _ in 0..1000 {
            stats.record_sent(i32::MAX);
            stats.record_received(i32::MAX);
        }
        let snap = stats.snapshot();
        assert_eq!(snap.sum_sent, 1000 * i64::from(i32::MAX));
        assert_eq!(snap.sum_sent, snap.sum_received);
    }

    #[test]
    fn aggregate_detects_conservation() {
        let a = StatsSnapshot {
            sent: 5,
            sum_sent: 100,
            received: 3,
            sum_received: 40,
            relayed: 2,
        };
        let b = StatsSnapshot {
            sent: 5,
            sum_sent: -20,
            received: 7,
            sum_received: 40,
            relayed: 0,
        };
        let report = AggregateReport::from_peers(vec![
            (PeerIdentity::new("a", 1), a),
            (PeerIdentity::new("b", 2), b),
        ]);
        assert_eq!(report.total.sent, 10);
        assert_eq!(report.total.received, 10);
        assert_eq!(report.total.sum_sent, 80);
        assert_eq!(report.total.sum_received, 80);
        assert!(report.is_consistent());
        assert_eq!(report.in_flight(), 0);
    }

    #[test]
    fn aggregate_flags_missing_messages() {
        let a = StatsSnapshot {
            sent: 5,
            sum_sent: 5,
            received: 4,
            sum_received: 4,
            relayed: 0,
        };
        let report = AggregateReport::from_peers(vec![(PeerIdentity::new("a", 1), a)]);
        assert!(!report.is_consistent());
        assert_eq!(report.in_flight(), 1);
    }

    #[test]
    fn aggregate_flags_silent_peer() {
        let mut report = AggregateReport::from_peers(Vec::new());
        assert!(report.is_consistent());
        report.missing.push(PeerIdentity::new("c", 3));
        assert!(!report.is_consistent());
        assert!(report.to_string().contains("no summary from c:3"));
    }

    #[test]
    fn display_has_row_per_peer_and_total() {
        let report = AggregateReport::from_peers(vec![
            (PeerIdentity::new("a", 1), StatsSnapshot::default()),
            (PeerIdentity::new("b", 2), StatsSnapshot::default()),
        ]);
        let text = report.to_string();
        assert_eq!(text.lines().count(), 4);
        assert!(text.lines().last().unwrap().starts_with("sum"));
    }
}
