// src/config.rs

use std::env;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use crate::daemon::DaemonConfig;
use crate::error::{Error, Result};
use crate::sys::ssh::SshConfig;
use crate::vpn::{ConnectionConfig, TunnelBinaries};

const PREFIX: &str = "VPNORCH_";

#[derive(Clone, Debug)]
pub struct OrchestratorConfig {
    // 🔌 Local daemon IPC
    pub daemon: DaemonConfig,

    // 🔐 Remote shell
    pub ssh: SshConfig,

    // 🧭 Connection behaviour
    pub connection: ConnectionConfig,
    pub tunnel_binaries: TunnelBinaries,

    // 📂 Persistent state
    pub settings_path: PathBuf,
}

impl OrchestratorConfig {
    /// Reads `VPNORCH_*` variables from the process environment.
    pub fn load() -> Result<Self> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Same as [`load`](Self::load) against any key lookup. Unset keys take
    /// their defaults; a key that is set but unparsable is an error.
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |name: &str| lookup(&format!("{PREFIX}{name}")).filter(|v| !v.trim().is_empty());

        let mut daemon = DaemonConfig::default();
        if let Some(path) = get("DAEMON_SOCKET") {
            daemon.socket_path = PathBuf::from(path);
        }
        if let Some(path) = get("DAEMON_FALLBACK_SOCKET") {
            daemon.fallback_socket_path = PathBuf::from(path);
        }
        if let Some(ms) = parsed::<u64>(&get, "DAEMON_RETRY_DELAY_MS")? {
            daemon.retry_delay = Duration::from_millis(ms);
        }
        if let Some(retries) = parsed::<u32>(&get, "DAEMON_MAX_RETRIES")? {
            daemon.max_retries = retries;
        }

        let mut ssh = SshConfig::default();
        if let Some(path) = get("SSH_BINARY") {
            ssh.ssh_binary = PathBuf::from(path);
        }
        if let Some(path) = get("SSH_KEYGEN_BINARY") {
            ssh.keygen_binary = PathBuf::from(path);
        }
        if let Some(secs) = parsed::<u64>(&get, "SSH_CONNECT_TIMEOUT_SECS")? {
            ssh.connect_timeout = Duration::from_secs(secs);
        }

        let mut connection = ConnectionConfig::default();
        if let Some(hours) = parsed::<u64>(&get, "CONFIG_TTL_HOURS")? {
            connection.config_ttl = Duration::from_secs(hours * 60 * 60);
        }

        let mut tunnel_binaries = TunnelBinaries::default();
        if let Some(path) = get("OPENVPN_BINARY") {
            tunnel_binaries.openvpn = PathBuf::from(path);
        }
        if let Some(path) = get("SS_TUNNEL_BINARY") {
            tunnel_binaries.ss_tunnel = PathBuf::from(path);
        }
        if let Some(path) = get("CK_CLIENT_BINARY") {
            tunnel_binaries.ck_client = PathBuf::from(path);
        }

        let settings_path = get("SETTINGS")
            .map(PathBuf::from)
            .unwrap_or_else(default_settings_path);

        Ok(Self {
            daemon,
            ssh,
            connection,
            tunnel_binaries,
            settings_path,
        })
    }
}

fn parsed<T>(get: &impl Fn(&str) -> Option<String>, name: &str) -> Result<Option<T>>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    get(name)
        .map(|raw| {
            raw.trim()
                .parse::<T>()
                .map_err(|e| Error::InvalidConfig(format!("{PREFIX}{name}={raw}: {e}")))
        })
        .transpose()
}

/// `$XDG_CONFIG_HOME/vpn-orchestrator/settings.json`, falling back to `~/.config`.
fn default_settings_path() -> PathBuf {
    let base = env::var_os("XDG_CONFIG_HOME")
        .map(PathBuf::from)
        .or_else(|| env::var_os("HOME").map(|home| PathBuf::from(home).join(".config")))
        .unwrap_or_else(|| PathBuf::from("."));
    base.join("vpn-orchestrator").join("settings.json")
}
