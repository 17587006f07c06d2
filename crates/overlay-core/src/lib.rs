//! overlay-core — shared types, wire format, statistics and configuration.
//! All other overlay crates depend on this one.

pub mod command;
pub mod config;
pub mod identity;
pub mod stats;
pub mod wire;

pub use identity::PeerIdentity;
pub use stats::{AggregateReport, StatsSnapshot, TrafficStats};
pub use wire::{Message, WireError};
