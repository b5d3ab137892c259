// src/sys/traits.rs

use async_trait::async_trait;
use std::net::IpAddr;
use tokio::sync::mpsc;

use crate::containers::TransportProto;
use crate::credentials::ServerCredentials;
use crate::error::Result;
use crate::vpn::ConnectionState;

// ==============================================================================
// 1. Remote Execution (Line-Streamed Output)
// ==============================================================================

/// Receives a remote script's output one line at a time.
///
/// Returning an error stops the script: the shell kills the session and hands
/// that error back to the caller unchanged.
pub trait OutputSink: Send {
    fn on_stdout(&mut self, line: &str) -> Result<()> {
        let _ = line;
        Ok(())
    }

    fn on_stderr(&mut self, line: &str) -> Result<()> {
        let _ = line;
        Ok(())
    }
}

/// What to do when an upload targets a file that already exists.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum OverwriteMode {
    #[default]
    OverwriteExisting,
    FailIfExists,
}

#[async_trait]
pub trait RemoteShell: Send + Sync {
    /// Runs `script` with bash on the host and returns its exit code.
    /// 🛡️ Transport or authentication failures are errors; a non-zero exit is not.
    async fn exec(
        &self,
        credentials: &ServerCredentials,
        script: &str,
        sink: &mut dyn OutputSink,
    ) -> Result<i32>;

    /// Writes `data` to `remote_path` on the host (root owned, mode 0600).
    async fn upload(
        &self,
        credentials: &ServerCredentials,
        data: &[u8],
        remote_path: &str,
        mode: OverwriteMode,
    ) -> Result<()>;

    /// Reads `remote_path` from the host with root privileges.
    async fn download(&self, credentials: &ServerCredentials, remote_path: &str) -> Result<Vec<u8>>;
}

// ==============================================================================
// 2. Host Firewall (Type-Safe)
// ==============================================================================

/// A port the host must accept traffic on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FirewallPolicy {
    pub port: u16,
    pub transport: TransportProto,
}

// ==============================================================================
// 3. Tunnel Implementations
// ==============================================================================

/// Gateways a tunnel learned while coming up.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Gateways {
    /// Next hop inside the tunnel.
    pub vpn_gateway: String,
    /// Default gateway of the physical link, used for bypass routes.
    pub route_gateway: String,
}

#[derive(Debug, Clone, PartialEq)]
pub enum TunnelEvent {
    StateChanged(ConnectionState),
    Bytes { received: u64, sent: u64 },
    Gateways(Gateways),
}

/// A running VPN tunnel. Exactly one is alive per connection attempt.
#[async_trait]
pub trait TunnelBackend: Send {
    /// Starts the tunnel; progress is reported through `events`.
    async fn start(&mut self, events: mpsc::UnboundedSender<TunnelEvent>) -> Result<()>;

    /// Stops the tunnel. Returns once every local resource is released.
    async fn stop(&mut self);

    fn gateways(&self) -> Gateways;
}

// ==============================================================================
// 4. Name Resolution
// ==============================================================================

#[async_trait]
pub trait SiteResolver: Send + Sync {
    async fn resolve(&self, host: &str) -> std::io::Result<Vec<IpAddr>>;
}

/// Resolves through the system resolver.
pub struct SystemResolver;

#[async_trait]
impl SiteResolver for SystemResolver {
    async fn resolve(&self, host: &str) -> std::io::Result<Vec<IpAddr>> {
        let addrs = tokio::net::lookup_host((host, 0)).await?;
        Ok(addrs.map(|addr| addr.ip()).collect())
    }
}
