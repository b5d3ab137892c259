// src/vpn/settings.rs
//
// The key/value contract the orchestrator reads its inputs from, and a small
// JSON-file backed implementation of it.

use std::collections::BTreeMap;
use std::io::Write;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::sync::RwLock;

use serde::{Deserialize, Serialize};
use tempfile::NamedTempFile;
use tracing::{debug, warn};

use crate::containers::{
    ContainerConfig, DockerContainer, Protocol, ProtocolConfig, DEFAULT_PRIMARY_DNS, DEFAULT_SECONDARY_DNS,
};
use crate::error::{Error, Result};

use super::configuration::{ConfigVersion, RouteMode};

/// A server the user added, with the containers known to run on it.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerEntry {
    pub host_name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub config_version: ConfigVersion,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default_container: Option<DockerContainer>,
    #[serde(default)]
    pub containers: BTreeMap<DockerContainer, ContainerConfig>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dns1: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dns2: Option<String>,
}

pub trait Settings: Send + Sync {
    fn server(&self, index: usize) -> Option<ServerEntry>;

    fn default_container(&self, server: usize) -> Option<DockerContainer>;

    fn route_mode(&self) -> RouteMode;

    fn protocol_config(&self, server: usize, container: DockerContainer, proto: Protocol) -> ProtocolConfig;

    fn set_protocol_config(&self, server: usize, container: DockerContainer, proto: Protocol, config: ProtocolConfig);

    /// Site (address, subnet or hostname) to its last resolved address, if any.
    fn vpn_sites(&self, mode: RouteMode) -> BTreeMap<String, Option<String>>;

    fn add_vpn_site(&self, mode: RouteMode, site: &str, ip: &str);

    /// Primary and secondary DNS for connections to `server`.
    fn dns_servers(&self, server: usize) -> (String, String);
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SettingsDocument {
    #[serde(default)]
    servers: Vec<ServerEntry>,
    #[serde(default)]
    route_mode: RouteMode,
    #[serde(default)]
    forward_sites: BTreeMap<String, String>,
    #[serde(default)]
    except_sites: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    primary_dns: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    secondary_dns: Option<String>,
}

impl SettingsDocument {
    fn sites(&self, mode: RouteMode) -> Option<&BTreeMap<String, String>> {
        match mode {
            RouteMode::AllSites => None,
            RouteMode::OnlyForwardSites => Some(&self.forward_sites),
            RouteMode::AllExceptSites => Some(&self.except_sites),
        }
    }

    fn sites_mut(&mut self, mode: RouteMode) -> Option<&mut BTreeMap<String, String>> {
        match mode {
            RouteMode::AllSites => None,
            RouteMode::OnlyForwardSites => Some(&mut self.forward_sites),
            RouteMode::AllExceptSites => Some(&mut self.except_sites),
        }
    }
}

/// Settings kept in memory and, when a path is set, written back to a JSON
/// file after every change.
#[derive(Debug, Default)]
pub struct MemorySettings {
    doc: RwLock<SettingsDocument>,
    path: Option<PathBuf>,
}

impl MemorySettings {
    pub fn new() -> Self {
        Self::default()
    }

    /// Reads `path`; a missing file starts from empty settings.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let doc = match std::fs::read_to_string(path) {
            Ok(text) if text.trim().is_empty() => SettingsDocument::default(),
            Ok(text) => serde_json::from_str(&text)
                .map_err(|e| Error::InvalidConfig(format!("{}: {e}", path.display())))?,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => SettingsDocument::default(),
            Err(err) => return Err(err.into()),
        };
        Ok(Self {
            doc: RwLock::new(doc),
            path: Some(path.to_path_buf()),
        })
    }

    pub fn save(&self) -> Result<()> {
        let Some(path) = &self.path else {
            return Ok(());
        };
        let text = serde_json::to_string_pretty(&*self.read())?;
        let dir = match path.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent,
            _ => Path::new("."),
        };
        std::fs::create_dir_all(dir)?;

        // 🛡️ Cached client configs carry private keys: owner-only, replaced atomically.
        let mut file = NamedTempFile::new_in(dir)?;
        file.write_all(text.as_bytes())?;
        file.as_file().set_permissions(std::fs::Permissions::from_mode(0o600))?;
        file.as_file().sync_all()?;
        file.persist(path).map_err(|e| e.error)?;
        debug!(path = %path.display(), "settings saved");
        Ok(())
    }

    /// Appends a server and returns its index.
    pub fn add_server(&self, server: ServerEntry) -> usize {
        let index = {
            let mut doc = self.write();
            doc.servers.push(server);
            doc.servers.len() - 1
        };
        self.persist();
        index
    }

    /// Index of the server reached at `host`, adding an entry when there is none.
    pub fn server_for_host(&self, host: &str) -> usize {
        if let Some(index) = self.read().servers.iter().position(|s| s.host_name == host) {
            return index;
        }
        self.add_server(ServerEntry {
            host_name: host.to_string(),
            ..ServerEntry::default()
        })
    }

    /// Records `config` as installed on `server`. Cached client configs of the
    /// previous install are dropped with it.
    pub fn set_container(&self, server: usize, config: ContainerConfig) {
        {
            let mut doc = self.write();
            let Some(entry) = doc.servers.get_mut(server) else {
                return;
            };
            entry.default_container.get_or_insert(config.container);
            entry.containers.insert(config.container, config);
        }
        self.persist();
    }

    /// Forgets `container` on `server`, or every container when `None`.
    pub fn remove_container(&self, server: usize, container: Option<DockerContainer>) {
        {
            let mut doc = self.write();
            let Some(entry) = doc.servers.get_mut(server) else {
                return;
            };
            match container {
                Some(container) => {
                    entry.containers.remove(&container);
                }
                None => entry.containers.clear(),
            }
            if entry
                .default_container
                .is_some_and(|c| !entry.containers.contains_key(&c))
            {
                entry.default_container = None;
            }
        }
        self.persist();
    }

    pub fn set_route_mode(&self, mode: RouteMode) {
        self.write().route_mode = mode;
        self.persist();
    }

    pub fn set_dns(&self, primary: Option<String>, secondary: Option<String>) {
        {
            let mut doc = self.write();
            doc.primary_dns = primary;
            doc.secondary_dns = secondary;
        }
        self.persist();
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, SettingsDocument> {
        self.doc.read().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn write(&self) -> std::sync::RwLockWriteGuard<'_, SettingsDocument> {
        self.doc.write().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn persist(&self) {
        if let Err(err) = self.save() {
            warn!(error = %err, "could not save settings");
        }
    }
}

impl Settings for MemorySettings {
    fn server(&self, index: usize) -> Option<ServerEntry> {
        self.read().servers.get(index).cloned()
    }

    fn default_container(&self, server: usize) -> Option<DockerContainer> {
        let doc = self.read();
        let entry = doc.servers.get(server)?;
        entry
            .default_container
            .or_else(|| entry.containers.keys().next().copied())
    }

    fn route_mode(&self) -> RouteMode {
        self.read().route_mode
    }

    fn protocol_config(&self, server: usize, container: DockerContainer, proto: Protocol) -> ProtocolConfig {
        self.read()
            .servers
            .get(server)
            .and_then(|entry| entry.containers.get(&container))
            .map(|config| config.protocol(proto))
            .unwrap_or_default()
    }

    fn set_protocol_config(&self, server: usize, container: DockerContainer, proto: Protocol, config: ProtocolConfig) {
        {
            let mut doc = self.write();
            let Some(entry) = doc.servers.get_mut(server) else {
                warn!(server, "protocol config for an unknown server dropped");
                return;
            };
            let container_config = entry
                .containers
                .entry(container)
                .or_insert_with(|| ContainerConfig::new(container));
            *container_config.protocol_mut(proto) = config;
        }
        self.persist();
    }

    fn vpn_sites(&self, mode: RouteMode) -> BTreeMap<String, Option<String>> {
        self.read()
            .sites(mode)
            .map(|sites| {
                sites
                    .iter()
                    .map(|(site, ip)| (site.clone(), (!ip.is_empty()).then(|| ip.clone())))
                    .collect()
            })
            .unwrap_or_default()
    }

    fn add_vpn_site(&self, mode: RouteMode, site: &str, ip: &str) {
        {
            let mut doc = self.write();
            let Some(sites) = doc.sites_mut(mode) else {
                return;
            };
            sites.insert(site.to_string(), ip.to_string());
        }
        self.persist();
    }

    fn dns_servers(&self, server: usize) -> (String, String) {
        let doc = self.read();
        let entry = doc.servers.get(server);
        let primary = entry
            .and_then(|e| e.dns1.clone())
            .or_else(|| doc.primary_dns.clone())
            .unwrap_or_else(|| DEFAULT_PRIMARY_DNS.to_string());
        let secondary = entry
            .and_then(|e| e.dns2.clone())
            .or_else(|| doc.secondary_dns.clone())
            .unwrap_or_else(|| DEFAULT_SECONDARY_DNS.to_string());
        (primary, secondary)
    }
}
