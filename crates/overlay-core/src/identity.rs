//! Peer identity — the `host:port` pair a messaging node advertises.

use std::fmt;
use std::str::FromStr;

/// Identity of a connected peer. Used as the graph-vertex key on both the
/// registry and the messaging nodes.
///
/// Ordering is `(host, port)`; nodes sort identities this way to assign
/// local vertex indices.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct PeerIdentity {
    pub host: String,
    pub port: u16,
}

impl PeerIdentity {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }
}

impl fmt::Display for PeerIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid peer identity {0:?}, expected host:port")]
pub struct ParseIdentityError(pub String);

impl FromStr for PeerIdentity {
    type Err = ParseIdentityError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        // rsplit so bracket-less IPv6 hosts keep their colons
        let (host, port) = s
            .rsplit_once(':')
            .ok_or_else(|| ParseIdentityError(s.to_string()))?;
        if host.is_empty() {
            return Err(ParseIdentityError(s.to_string()));
        }
        let port = port
            .parse::<u16>()
            .map_err(|_| ParseIdentityError(s.to_string()))?;
        Ok(Self::new(host, port))
    }
}
