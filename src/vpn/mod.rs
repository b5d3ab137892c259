// src/vpn/mod.rs
//
// Client side of a connection: assembling the configuration, running the
// tunnel and keeping the routing table in line with the split-tunnel policy.

pub mod configuration;
pub mod connection;
pub mod routes;
pub mod settings;
pub mod tunnel;

use std::fmt;

use serde::{Deserialize, Serialize};

pub use configuration::{ConfigVersion, RouteMode, VpnConfiguration};
pub use connection::{ConnectionConfig, ConnectionEvent, VpnConnection};
pub use settings::{MemorySettings, ServerEntry, Settings};
pub use tunnel::{DefaultTunnelFactory, TunnelBinaries, TunnelFactory};

/// Owned by the orchestrator; everything else only observes it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
    Disconnecting,
    Error,
    Unknown,
}

impl ConnectionState {
    pub fn as_str(self) -> &'static str {
        match self {
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Connected => "connected",
            ConnectionState::Reconnecting => "reconnecting",
            ConnectionState::Disconnecting => "disconnecting",
            ConnectionState::Error => "error",
            ConnectionState::Unknown => "unknown",
        }
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
