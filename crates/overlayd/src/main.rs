//! overlayd — overlay registry and messaging node.
//!
//!   overlayd registry [port]
//!   overlayd node <registry-host> <registry-port>

use anyhow::Result;

use overlay_core::config::OverlayConfig;

mod console;

const USAGE: &str = "usage:\n  \
    overlayd registry [port]\n  \
    overlayd node <registry-host> <registry-port>";

#[derive(Debug, PartialEq, Eq)]
enum Role {
    Registry { port: Option<u16> },
    Node { registry_host: String, registry_port: u16 },
}

fn parse_args(args: &[String]) -> Result<Role, String> {
    let args: Vec<&str> = args.iter().map(String::as_str).collect();
    match args.as_slice() {
        ["registry"] => Ok(Role::Registry { port: None }),
        ["registry", port] => port
            .parse()
            .map(|p| Role::Registry { port: Some(p) })
            .map_err(|_| format!("invalid port: {port}")),
        ["node", host, port] => port
            .parse()
            .map(|registry_port| Role::Node {
                registry_host: host.to_string(),
                registry_port,
            })
            .map_err(|_| format!("invalid registry port: {port}")),
        _ => Err("missing or unknown arguments".to_string()),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let args: Vec<String> = std::env::args().skip(1).collect();
    let role = match parse_args(&args) {
        Ok(role) => role,
        Err(msg) => {
            eprintln!("{msg}\n{USAGE}");
            std::process::exit(1);
        }
    };

    if let Err(e) = OverlayConfig::write_default_if_missing() {
        tracing::warn!(error = %e, "failed to write default config");
    }
    let mut config = OverlayConfig::load().unwrap_or_else(|e| {
        tracing::warn!(error = %e, "failed to load config, using defaults");
        OverlayConfig::default()
    });

    match role {
        Role::Registry { port } => {
            if let Some(port) = port {
                config.registry.port = port;
            }
            tracing::info!(port = config.registry.port, "overlayd registry starting");
            console::run_registry(config.registry).await
        }
        Role::Node {
            registry_host,
            registry_port,
        } => {
            tracing::info!(%registry_host, registry_port, "overlayd node starting");
            let registry_addr = format!("{registry_host}:{registry_port}");
            console::run_node(config.node, &registry_addr).await
        }
    }
}
