// src/provision/mapping.rs
//
// Host mapping: the JSON document on each server recording which containers
// the orchestrator installed and with what settings.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::containers::{ContainerConfig, DockerContainer};
use crate::credentials::ServerCredentials;
use crate::error::Result;
use crate::scripts::vars::HOST_MAPPING_FILE;
use crate::sys::traits::OverwriteMode;

use super::{CollectSink, ServerController, Stage};

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct HostMapping {
    containers: BTreeMap<DockerContainer, ContainerConfig>,
}

impl HostMapping {
    /// Blank input is an empty mapping (first install on a host).
    pub fn parse(raw: &str) -> Result<Self> {
        if raw.trim().is_empty() {
            return Ok(Self::default());
        }
        Ok(serde_json::from_str(raw)?)
    }

    pub fn to_document(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    /// Records `config`. Cached client configs never reach the server.
    pub fn upsert(&mut self, config: &ContainerConfig) {
        self.containers
            .insert(config.container, config.without_cache());
    }

    pub fn remove(&mut self, container: DockerContainer) -> bool {
        self.containers.remove(&container).is_some()
    }

    /// Keeps the entries `alive` accepts and returns the ones dropped.
    pub fn retain(&mut self, alive: impl Fn(DockerContainer) -> bool) -> Vec<DockerContainer> {
        let dropped: Vec<_> = self
            .containers
            .keys()
            .copied()
            .filter(|c| !alive(*c))
            .collect();
        for container in &dropped {
            self.containers.remove(container);
        }
        dropped
    }

    pub fn get(&self, container: DockerContainer) -> Option<&ContainerConfig> {
        self.containers.get(&container)
    }

    pub fn into_containers(self) -> BTreeMap<DockerContainer, ContainerConfig> {
        self.containers
    }
}

impl ServerController {
    /// Reads the mapping; also returns the raw text so unchanged documents are not rewritten.
    pub(crate) async fn load_mapping(
        &self,
        credentials: &ServerCredentials,
    ) -> Result<(HostMapping, String)> {
        let script = format!("sudo cat {HOST_MAPPING_FILE} 2>/dev/null || true\n");
        let mut sink = CollectSink::default();
        self.run_script(credentials, &script, Stage::Query, &mut sink)
            .await?;
        let raw = sink.stdout_text();
        Ok((HostMapping::parse(&raw)?, raw))
    }

    /// Uploads `mapping` unless it matches what `before` already held.
    pub(crate) async fn store_mapping(
        &self,
        credentials: &ServerCredentials,
        mapping: &HostMapping,
        before: &str,
    ) -> Result<bool> {
        if HostMapping::parse(before).is_ok_and(|old| &old == mapping) {
            debug!("host mapping unchanged");
            return Ok(false);
        }
        let document = mapping.to_document()?;
        self.upload_file_to_host(
            credentials,
            document.as_bytes(),
            HOST_MAPPING_FILE,
            OverwriteMode::OverwriteExisting,
        )
        .await?;
        Ok(true)
    }

    /// Read-modify-write of the host mapping.
    pub(crate) async fn update_mapping(
        &self,
        credentials: &ServerCredentials,
        change: impl FnOnce(&mut HostMapping),
    ) -> Result<()> {
        let (mut mapping, before) = self.load_mapping(credentials).await?;
        change(&mut mapping);
        self.store_mapping(credentials, &mapping, &before).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::containers::{CachedConfig, Protocol};
    use crate::testing::{creds, FakeShell, Reply};

    #[test]
    fn blank_document_is_an_empty_mapping() {
        assert_eq!(HostMapping::parse("  \n").unwrap(), HostMapping::default());
        assert!(HostMapping::parse("[1, 2]").is_err());
    }

    #[test]
    fn cached_client_configs_are_not_stored() {
        let mut config = ContainerConfig::create_initial(DockerContainer::OpenVpn, None, None);
        config.protocol_mut(Protocol::OpenVpn).last_config = Some(CachedConfig::new("secret".into()));

        let mut mapping = HostMapping::default();
        mapping.upsert(&config);

        let doc = mapping.to_document().unwrap();
        assert!(!doc.contains("secret"));
        assert_eq!(HostMapping::parse(&doc).unwrap(), mapping);
    }

    #[test]
    fn retain_reports_dropped_entries() {
        let mut mapping = HostMapping::default();
        for container in [DockerContainer::OpenVpn, DockerContainer::Awg] {
            mapping.upsert(&ContainerConfig::create_initial(container, None, None));
        }
        let dropped = mapping.retain(|c| c == DockerContainer::Awg);
        assert_eq!(dropped, vec![DockerContainer::OpenVpn]);
        assert!(mapping.get(DockerContainer::Awg).is_some());
    }

    #[tokio::test]
    async fn identical_mapping_is_not_uploaded_again() {
        let mut mapping = HostMapping::default();
        let config = ContainerConfig::create_initial(DockerContainer::WireGuard, None, None);
        mapping.upsert(&config);

        let shell = Arc::new(FakeShell::new());
        shell.reply_to(
            "cat /opt/vpn-orchestrator/containers.json",
            Reply::stdout(&[mapping.to_document().unwrap().as_str()]),
        );
        let ctl = ServerController::new(shell.clone());

        ctl.update_mapping(&creds(), |m| m.upsert(&config)).await.unwrap();
        assert!(shell.uploads().is_empty());

        ctl.update_mapping(&creds(), |m| {
            m.remove(DockerContainer::WireGuard);
        })
        .await
        .unwrap();
        assert_eq!(shell.uploaded(HOST_MAPPING_FILE).unwrap().trim(), "{}");
    }
}
