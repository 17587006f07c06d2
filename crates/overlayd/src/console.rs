//! Operator consoles. One line per command on stdin; output goes to stdout,
//! diagnostics to the tracing subscriber.

use std::io::Write;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use tokio::io::{AsyncBufReadExt, BufReader};

use overlay_core::command::{CommandError, NodeCommand, RegistryCommand};
use overlay_core::config::{NodeConfig, RegistryConfig};
use overlay_services::{Coordinator, MessagingNode, NodeStatus};

const DEREGISTER_WAIT: Duration = Duration::from_secs(5);

/// Unrecognized input changes nothing; the reason and the usage summary go
/// to the error stream.
fn reject(mut out: impl Write, error: &CommandError, usage: &str) {
    let _ = writeln!(out, "{error}\n{usage}");
}

// ── Registry ──────────────────────────────────────────────────────────────────

pub async fn run_registry(config: RegistryConfig) -> Result<()> {
    let coordinator = Coordinator::start(config).await?;
    println!("registry listening on {}", coordinator.local_addr());

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,

            line = lines.next_line() => {
                let Some(line) = line? else { break };
                match RegistryCommand::parse(&line) {
                    Ok(command) => registry_command(&coordinator, command).await,
                    Err(CommandError::Empty) => {}
                    Err(e) => reject(std::io::stderr(), &e, RegistryCommand::usage()),
                }
            }
        }
    }

    coordinator.shutdown();
    tracing::info!("registry stopped");
    Ok(())
}

async fn registry_command(coordinator: &Arc<Coordinator>, command: RegistryCommand) {
    match command {
        RegistryCommand::SetupOverlay { degree } => match coordinator.setup_overlay(degree).await {
            Ok(nodes) => println!("overlay set up: {nodes} nodes, {degree} links each"),
            Err(e) => println!("setup-overlay failed: {e}"),
        },
        RegistryCommand::SendOverlayLinkWeights => match coordinator.send_link_weights().await {
            Ok(edges) => println!("link weights sent ({edges} edges)"),
            Err(e) => println!("send-overlay-link-weights failed: {e}"),
        },
        RegistryCommand::Start { messages_per_node } => {
            match coordinator.start_round(messages_per_node).await {
                Ok(report) => {
                    println!("{report}");
                    if report.is_consistent() {
                        println!("all messages accounted for");
                    } else {
                        println!("inconsistent totals, {} in flight", report.in_flight());
                    }
                }
                Err(e) => println!("start failed: {e}"),
            }
        }
        RegistryCommand::ListMessagingNodes => {
            let nodes = coordinator.messaging_nodes().await;
            if nodes.is_empty() {
                println!("no messaging nodes registered");
            }
            for node in nodes {
                println!("{node}");
            }
        }
        RegistryCommand::ListWeights => match coordinator.link_weights().await {
            Ok(edges) => {
                for e in edges {
                    println!("{} {} {}", e.a, e.b, e.weight);
                }
            }
            Err(e) => println!("list-weights failed: {e}"),
        },
        RegistryCommand::PrintOverlay => match coordinator.overlay().await {
            Some(overlay) => println!("{overlay}"),
            None => println!("no valid overlay"),
        },
        RegistryCommand::PrintStats => println!("{}", coordinator.collect_statistics().await),
        RegistryCommand::GetPort => println!("{}", coordinator.local_addr().port()),
        RegistryCommand::GetHost => println!("{}", coordinator.local_addr().ip()),
    }
}

// ── Messaging node ────────────────────────────────────────────────────────────

pub async fn run_node(config: NodeConfig, registry_addr: &str) -> Result<()> {
    let node = MessagingNode::start(&config, registry_addr).await?;
    if let Err(e) = node.wait_registered().await {
        eprintln!("{e}");
        std::process::exit(1);
    }
    println!("registered as {}", node.identity());

    let mut status = node.status();
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,

            changed = status.changed() => {
                if changed.is_err() {
                    break;
                }
                let current = status.borrow_and_update().clone();
                if current == NodeStatus::Disconnected {
                    println!("registry connection lost");
                    break;
                }
            }

            line = lines.next_line() => {
                let Some(line) = line? else { break };
                match NodeCommand::parse(&line) {
                    Ok(NodeCommand::ExitOverlay) => {
                        exit_overlay(&node).await;
                        break;
                    }
                    Ok(command) => node_command(&node, command),
                    Err(CommandError::Empty) => {}
                    Err(e) => reject(std::io::stderr(), &e, NodeCommand::usage()),
                }
            }
        }
    }

    node.shutdown();
    Ok(())
}

fn node_command(node: &MessagingNode, command: NodeCommand) {
    match command {
        NodeCommand::PrintShortestPath => {
            let paths = node.shortest_paths();
            if paths.is_empty() {
                println!("no routes yet, waiting for link weights");
            }
            for line in paths {
                println!("{line}");
            }
        }
        NodeCommand::PrintStats => {
            let s = node.peer().report_statistics();
            println!(
                "sent {} (sum {}), received {} (sum {}), relayed {}",
                s.sent, s.sum_sent, s.received, s.sum_received, s.relayed
            );
        }
        NodeCommand::GetPort => println!("{}", node.identity().port),
        NodeCommand::GetHost => println!("{}", node.identity().host),
        NodeCommand::ExitOverlay => {}
    }
}

async fn exit_overlay(node: &MessagingNode) {
    if let Err(e) = node.exit_overlay() {
        println!("exit-overlay failed: {e}");
        return;
    }
    let mut status = node.status();
    let done = tokio::time::timeout(
        DEREGISTER_WAIT,
        status.wait_for(|s| *s == NodeStatus::Deregistered),
    )
    .await;
    match done {
        Ok(Ok(_)) => println!("deregistered, exiting"),
        _ => println!("no deregistration response, exiting anyway"),
    }
}
