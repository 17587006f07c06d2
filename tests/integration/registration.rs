use overlay_core::{Message, PeerIdentity};
use overlay_services::{Connection, CoordinatorError, NodeStatus, RegistryError};

use crate::*;

/// Register over a bare connection and return the response.
async fn raw_register(coordinator: &Coordinator, identity: PeerIdentity) -> Result<(Connection, bool, String)> {
    let (conn, mut reader) = Connection::connect(coordinator.local_addr()).await?;
    conn.send(Message::RegisterRequest(identity))?;
    match reader.next().await? {
        Some(Message::RegisterResponse { success, info }) => Ok((conn, success, info)),
        other => bail!("unexpected reply: {other:?}"),
    }
}

#[tokio::test]
async fn test_duplicate_registration_is_refused() -> Result<()> {
    let coordinator = start_registry().await?;
    let nodes = start_nodes(&coordinator, 1).await?;

    let (_conn, success, info) = raw_register(&coordinator, nodes[0].identity().clone()).await?;
    assert!(!success);
    assert!(info.contains("already registered"), "{info}");
    assert_eq!(coordinator.messaging_nodes().await.len(), 1);

    shutdown_all(&coordinator, &nodes);
    Ok(())
}

#[tokio::test]
async fn test_mismatched_host_is_refused() -> Result<()> {
    let coordinator = start_registry().await?;

    let (_conn, success, info) =
        raw_register(&coordinator, PeerIdentity::new("10.9.9.9", 4000)).await?;
    assert!(!success);
    assert!(info.contains("does not match"), "{info}");
    assert!(coordinator.messaging_nodes().await.is_empty());

    coordinator.shutdown();
    Ok(())
}

#[tokio::test]
async fn test_non_canonical_host_is_refused() -> Result<()> {
    let coordinator = start_registry().await?;

    let (_conn, success, info) =
        raw_register(&coordinator, PeerIdentity::new("::ffff:127.0.0.1", 4000)).await?;
    assert!(!success);
    assert!(info.contains("must spell its address as 127.0.0.1"), "{info}");
    assert!(coordinator.messaging_nodes().await.is_empty());

    coordinator.shutdown();
    Ok(())
}

#[tokio::test]
async fn test_insufficient_nodes_keeps_previous_overlay() -> Result<()> {
    let coordinator = start_registry().await?;
    let nodes = start_nodes(&coordinator, 3).await?;

    coordinator.setup_overlay(2).await?;
    let before = coordinator.overlay().await;
    assert!(before.is_some());

    let err = coordinator.setup_overlay(3).await.unwrap_err();
    assert!(matches!(
        err,
        CoordinatorError::Registry(RegistryError::InsufficientNodes {
            requested: 3,
            registered: 3
        })
    ));
    assert_eq!(coordinator.overlay().await, before);

    shutdown_all(&coordinator, &nodes);
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_exit_overlay_invalidates_overlay() -> Result<()> {
    let coordinator = start_registry().await?;
    let nodes = start_nodes(&coordinator, 4).await?;
    build_overlay(&coordinator, &nodes, 2).await?;

    let leaving = &nodes[3];
    let mut status = leaving.status();
    leaving.exit_overlay()?;
    tokio::time::timeout(WAIT, status.wait_for(|s| *s == NodeStatus::Deregistered)).await??;

    let remaining = coordinator.messaging_nodes().await;
    assert_eq!(remaining.len(), 3);
    assert!(!remaining.contains(leaving.identity()));
    assert!(coordinator.overlay().await.is_none());
    assert!(matches!(
        coordinator.send_link_weights().await,
        Err(CoordinatorError::Registry(RegistryError::NoValidOverlay))
    ));

    // the remaining nodes can form a new overlay
    coordinator.setup_overlay(2).await?;

    shutdown_all(&coordinator, &nodes);
    Ok(())
}

#[tokio::test]
async fn test_dropped_connection_deregisters() -> Result<()> {
    let coordinator = start_registry().await?;
    let (conn, success, _) =
        raw_register(&coordinator, PeerIdentity::new("127.0.0.1", 4100)).await?;
    assert!(success);
    assert_eq!(coordinator.messaging_nodes().await.len(), 1);

    drop(conn);
    let c = &coordinator;
    eventually("deregistration on disconnect", move || async move {
        c.messaging_nodes().await.is_empty()
    })
    .await?;

    coordinator.shutdown();
    Ok(())
}
