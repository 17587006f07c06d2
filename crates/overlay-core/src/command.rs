//! Operator console commands for the registry and for messaging nodes.
//!
//! Tokens are whitespace-separated and case-sensitive. Parsing happens once;
//! the console loops dispatch on the typed command.

/// Commands accepted by the registry console.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RegistryCommand {
    SetupOverlay { degree: usize },
    SendOverlayLinkWeights,
    Start { messages_per_node: u32 },
    ListMessagingNodes,
    ListWeights,
    PrintOverlay,
    PrintStats,
    GetPort,
    GetHost,
}

/// Commands accepted by a messaging node console.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NodeCommand {
    PrintShortestPath,
    PrintStats,
    ExitOverlay,
    GetPort,
    GetHost,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CommandError {
    #[error("empty command")]
    Empty,
    #[error("unknown command: {0}")]
    Unknown(String),
    #[error("{command} expects {expected}")]
    BadArgument {
        command: &'static str,
        expected: &'static str,
    },
}

impl RegistryCommand {
    pub fn parse(line: &str) -> Result<Self, CommandError> {
        let tokens: Vec<&str> = line.split_whitespace().collect();
        match tokens.as_slice() {
            [] => Err(CommandError::Empty),
            ["setup-overlay", degree] => degree
                .parse()
                .map(|degree| RegistryCommand::SetupOverlay { degree })
                .map_err(|_| CommandError::BadArgument {
                    command: "setup-overlay",
                    expected: "a non-negative connection count",
                }),
            ["send-overlay-link-weights"] => Ok(RegistryCommand::SendOverlayLinkWeights),
            ["start", count] => count
                .parse()
                .map(|messages_per_node| RegistryCommand::Start { messages_per_node })
                .map_err(|_| CommandError::BadArgument {
                    command: "start",
                    expected: "a non-negative message count",
                }),
            ["list-messaging-nodes"] => Ok(RegistryCommand::ListMessagingNodes),
            ["list-weights"] => Ok(RegistryCommand::ListWeights),
            ["print-overlay"] => Ok(RegistryCommand::PrintOverlay),
            ["print-stats"] => Ok(RegistryCommand::PrintStats),
            ["get-port"] => Ok(RegistryCommand::GetPort),
            ["get-host"] => Ok(RegistryCommand::GetHost),
            _ => Err(CommandError::Unknown(line.trim().to_string())),
        }
    }

    pub fn usage() -> &'static str {
        "Registry commands:\n  \
         setup-overlay <degree>       Build an overlay where every node has <degree> links\n  \
         send-overlay-link-weights    Send the full weighted edge set to every node\n  \
         start <messages-per-node>    Run a messaging round and print traffic statistics\n  \
         list-messaging-nodes         List registered nodes in vertex order\n  \
         list-weights                 List every overlay edge and its weight\n  \
         print-overlay                Print the overlay weight matrix\n  \
         print-stats                  Pull and print traffic statistics now\n  \
         get-port                     Print the registry listening port\n  \
         get-host                     Print the registry listening host"
    }
}

impl NodeCommand {
    pub fn parse(line: &str) -> Result<Self, CommandError> {
        let tokens: Vec<&str> = line.split_whitespace().collect();
        match tokens.as_slice() {
            [] => Err(CommandError::Empty),
            ["print-shortest-path"] => Ok(NodeCommand::PrintShortestPath),
            ["print-stats"] => Ok(NodeCommand::PrintStats),
            ["exit-overlay"] => Ok(NodeCommand::ExitOverlay),
            ["get-port"] => Ok(NodeCommand::GetPort),
            ["get-host"] => Ok(NodeCommand::GetHost),
            _ => Err(CommandError::Unknown(line.trim().to_string())),
        }
    }

    pub fn usage() -> &'static str {
        "Messaging node commands:\n  \
         print-shortest-path   Print the shortest path and cost to every node\n  \
         print-stats           Print this node's traffic counters\n  \
         exit-overlay          Deregister from the registry and exit\n  \
         get-port              Print this node's listening port\n  \
         get-host              Print this node's advertised host"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_registry_commands() {
        assert_eq!(
            RegistryCommand::parse("setup-overlay 4"),
            Ok(RegistryCommand::SetupOverlay { degree: 4 })
        );
        assert_eq!(
            RegistryCommand::parse("  start   5 "),
            Ok(RegistryCommand::Start {
                messages_per_node: 5
            })
        );
        assert_eq!(
            RegistryCommand::parse("send-overlay-link-weights"),
            Ok(RegistryCommand::SendOverlayLinkWeights)
        );
        assert_eq!(
            RegistryCommand::parse("list-weights"),
            Ok(RegistryCommand::ListWeights)
        );
    }

    #[test]
    fn commands_are_case_sensitive() {
        assert!(matches!(
            RegistryCommand::parse("Setup-Overlay 4"),
            Err(CommandError::Unknown(_))
        ));
        assert!(matches!(
            NodeCommand::parse("PRINT-STATS"),
            Err(CommandError::Unknown(_))
        ));
    }

    #[test]
    fn rejects_bad_arguments() {
        assert!(matches!(
            RegistryCommand::parse("setup-overlay -1"),
            Err(CommandError::BadArgument { .. })
        ));
        assert!(matches!(
            RegistryCommand::parse("start many"),
            Err(CommandError::BadArgument { .. })
        ));
        assert!(matches!(
            RegistryCommand::parse("setup-overlay"),
            Err(CommandError::Unknown(_))
        ));
        assert_eq!(RegistryCommand::parse("   "), Err(CommandError::Empty));
    }

    #[test]
    fn parses_node_commands() {
        assert_eq!(
            NodeCommand::parse("print-shortest-path"),
            Ok(NodeCommand::PrintShortestPath)
        );
        assert_eq!(
            NodeCommand::parse("exit-overlay"),
            Ok(NodeCommand::ExitOverlay)
        );
        // registry-only commands are unknown to a node
        assert!(NodeCommand::parse("setup-overlay 2").is_err());
    }
}
