//! Overlay integration test harness.
//!
//! Every test runs a real registry and real messaging nodes on loopback
//! inside the test's own runtime. Ports are OS-assigned, so tests can run
//! in parallel.
//!
//!   cargo test --test integration

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Result};

use overlay_core::config::{NodeConfig, RegistryConfig};
use overlay_services::{Coordinator, MessagingNode};

mod overlay;
mod registration;

// ── Harness ───────────────────────────────────────────────────────────────────

pub const WAIT: Duration = Duration::from_secs(10);

pub fn registry_config() -> RegistryConfig {
    RegistryConfig {
        listen_host: "127.0.0.1".to_string(),
        port: 0,
        topology_attempts: 10_000,
        round_timeout_ms: 10_000,
        quiescence_timeout_ms: 5_000,
        poll_interval_ms: 50,
    }
}

pub fn node_config() -> NodeConfig {
    NodeConfig {
        advertise_host: "127.0.0.1".to_string(),
        listen_port: 0,
    }
}

pub async fn start_registry() -> Result<Arc<Coordinator>> {
    Coordinator::start(registry_config()).await
}

/// Start `n` nodes against `coordinator` and wait until each is registered.
pub async fn start_nodes(coordinator: &Coordinator, n: usize) -> Result<Vec<Arc<MessagingNode>>> {
    let addr = coordinator.local_addr().to_string();
    let mut nodes = Vec::with_capacity(n);
    for _ in 0..n {
        let node = MessagingNode::start(&node_config(), &addr).await?;
        node.wait_registered().await?;
        nodes.push(node);
    }
    Ok(nodes)
}

/// Poll `check` until it holds or [`WAIT`] runs out.
pub async fn eventually<F, Fut>(what: &str, mut check: F) -> Result<()>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + WAIT;
    while tokio::time::Instant::now() < deadline {
        if check().await {
            return Ok(());
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    bail!("timed out waiting for {what}")
}

/// Set up an overlay, wait for every link, push weights and wait for every
/// routing table.
pub async fn build_overlay(
    coordinator: &Coordinator,
    nodes: &[Arc<MessagingNode>],
    degree: usize,
) -> Result<()> {
    coordinator.setup_overlay(degree).await?;
    eventually("neighbor links", move || async move {
        nodes.iter().all(|n| n.peer().link_count() == degree)
    })
    .await?;
    coordinator.send_link_weights().await?;
    eventually("routing tables", move || async move {
        nodes
            .iter()
            .all(|n| n.peer().routes().is_some_and(|t| t.destination_count() == nodes.len() - 1))
    })
    .await
}

pub fn shutdown_all(coordinator: &Coordinator, nodes: &[Arc<MessagingNode>]) {
    for node in nodes {
        node.shutdown();
    }
    coordinator.shutdown();
}
