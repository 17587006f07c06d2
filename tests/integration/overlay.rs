use overlay_core::wire::LinkWeight;
use overlay_services::{CoordinatorError, PeerState, RegistryError};

use crate::*;

/// Four nodes in a ring, five messages each: every message is accounted for.
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_round_conserves_messages() -> Result<()> {
    let coordinator = start_registry().await?;
    let nodes = start_nodes(&coordinator, 4).await?;
    build_overlay(&coordinator, &nodes, 2).await?;

    let report = coordinator.start_round(5).await?;
    println!("{report}");
    assert!(report.missing.is_empty());
    assert_eq!(report.peers.len(), 4);
    assert_eq!(report.total.sent, 20);
    assert_eq!(report.total.received, 20);
    assert_eq!(report.total.sum_sent, report.total.sum_received);
    assert!(report.is_consistent());
    for node in &nodes {
        assert_eq!(node.peer().state(), PeerState::MessagingActive);
    }

    shutdown_all(&coordinator, &nodes);
    Ok(())
}

/// A denser overlay exercises multi-hop relaying under concurrent senders.
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_dense_overlay_round() -> Result<()> {
    let coordinator = start_registry().await?;
    let nodes = start_nodes(&coordinator, 8).await?;
    build_overlay(&coordinator, &nodes, 3).await?;

    let report = coordinator.start_round(50).await?;
    assert_eq!(report.total.sent, 400);
    assert!(report.is_consistent(), "{report}");

    shutdown_all(&coordinator, &nodes);
    Ok(())
}

/// Counters start from zero on every round.
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_consecutive_rounds_reset_counters() -> Result<()> {
    let coordinator = start_registry().await?;
    let nodes = start_nodes(&coordinator, 4).await?;
    build_overlay(&coordinator, &nodes, 3).await?;

    let first = coordinator.start_round(10).await?;
    assert_eq!(first.total.sent, 40);
    let second = coordinator.start_round(3).await?;
    assert_eq!(second.total.sent, 12);
    assert_eq!(second.total.received, 12);

    let again = coordinator.collect_statistics().await;
    assert_eq!(again.total, second.total);

    shutdown_all(&coordinator, &nodes);
    Ok(())
}

#[tokio::test]
async fn test_round_requires_overlay() -> Result<()> {
    let coordinator = start_registry().await?;
    let nodes = start_nodes(&coordinator, 3).await?;

    let err = coordinator.start_round(1).await.unwrap_err();
    assert!(matches!(
        err,
        CoordinatorError::Registry(RegistryError::NoValidOverlay)
    ));

    shutdown_all(&coordinator, &nodes);
    Ok(())
}

/// Every node sees the same weights the registry lists, and prints a path
/// to every other node.
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_weights_and_paths_agree() -> Result<()> {
    let coordinator = start_registry().await?;
    let nodes = start_nodes(&coordinator, 5).await?;
    build_overlay(&coordinator, &nodes, 2).await?;

    let weights: Vec<LinkWeight> = coordinator.link_weights().await?;
    assert_eq!(weights.len(), 5);

    for node in &nodes {
        let paths = node.shortest_paths();
        assert_eq!(paths.len(), 4);
        assert!(paths.iter().all(|p| p.starts_with(&node.identity().to_string())));

        // the table's cost to a direct neighbor never exceeds the edge weight
        let table = node.peer().routes().unwrap();
        for w in weights.iter().filter(|w| &w.a == node.identity()) {
            assert!(table.distance(&w.b).unwrap() <= u32::from(w.weight));
        }
    }

    shutdown_all(&coordinator, &nodes);
    Ok(())
}
