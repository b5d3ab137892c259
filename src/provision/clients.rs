// src/provision/clients.rs
//
// Per-protocol clients table kept next to the server config inside the container.

use std::collections::BTreeMap;
use std::sync::LazyLock;

use chrono::Utc;
use regex::Regex;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::containers::{DockerContainer, Protocol, REMOTE_ROOT};
use crate::credentials::ServerCredentials;
use crate::error::{Error, Result};
use crate::sys::traits::OverwriteMode;

use super::{CollectSink, ServerController, Stage};

static PEER_KEY: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?m)^\s*PublicKey\s*=\s*(\S+)\s*$").expect("valid regex"));

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClientRecord {
    pub client_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub creation_date: Option<String>,
}

/// Client id (certificate CN or WireGuard public key) to user-facing metadata.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ClientsTable {
    clients: BTreeMap<String, ClientRecord>,
}

impl ClientsTable {
    pub fn parse(raw: &str) -> Result<Self> {
        if raw.trim().is_empty() {
            return Ok(Self::default());
        }
        Ok(serde_json::from_str(raw)?)
    }

    pub fn to_document(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    pub fn get(&self, client_id: &str) -> Option<&ClientRecord> {
        self.clients.get(client_id)
    }

    pub fn len(&self) -> usize {
        self.clients.len()
    }

    pub fn is_empty(&self) -> bool {
        self.clients.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &ClientRecord)> {
        self.clients.iter().map(|(id, record)| (id.as_str(), record))
    }

    /// Adds `client_id` under `name`, or "Client N" without one. An existing entry keeps its name.
    pub fn register(&mut self, client_id: &str, name: Option<&str>) -> bool {
        if self.clients.contains_key(client_id) {
            return false;
        }
        let name = name.map_or_else(|| self.default_name(), str::to_string);
        self.clients.insert(
            client_id.to_string(),
            ClientRecord {
                client_name: name,
                creation_date: Some(Utc::now().to_rfc3339()),
            },
        );
        true
    }

    pub fn rename(&mut self, client_id: &str, name: &str) -> Result<()> {
        let record = self
            .clients
            .get_mut(client_id)
            .ok_or_else(|| Error::InvalidConfig(format!("unknown client '{client_id}'")))?;
        record.client_name = name.to_string();
        Ok(())
    }

    fn default_name(&self) -> String {
        format!("Client {}", self.clients.len() + 1)
    }

    /// Adds every id in `live` the table does not know yet, naming them "Client N".
    /// Returns whether anything was added.
    pub fn reconcile<'a>(&mut self, live: impl IntoIterator<Item = &'a str>) -> bool {
        let mut changed = false;
        for client_id in live {
            if self.clients.contains_key(client_id) {
                continue;
            }
            let name = self.default_name();
            self.clients.insert(
                client_id.to_string(),
                ClientRecord {
                    client_name: name,
                    creation_date: None,
                },
            );
            changed = true;
        }
        changed
    }
}

/// Public keys of every `[Peer]` in a WireGuard config. The interface section
/// carries a private key only, so every `PublicKey` line belongs to a peer.
pub fn wireguard_peer_keys(wg_conf: &str) -> Vec<&str> {
    PEER_KEY
        .captures_iter(wg_conf)
        .filter_map(|c| c.get(1).map(|m| m.as_str()))
        .collect()
}

/// Client ids from a listing of `pki/issued`, without the server's own certificate.
pub fn openvpn_issued_ids(listing: &str) -> Vec<&str> {
    listing
        .lines()
        .map(str::trim)
        .filter_map(|name| name.strip_suffix(".crt"))
        .filter(|id| *id != "server")
        .collect()
}

impl ServerController {
    pub async fn load_clients_table(
        &self,
        credentials: &ServerCredentials,
        container: DockerContainer,
        proto: Protocol,
    ) -> Result<ClientsTable> {
        match self
            .get_text_file_from_container(credentials, container, &proto.clients_table_path())
            .await
        {
            Ok(raw) => ClientsTable::parse(&raw),
            Err(Error::Command { stage: Stage::FileTransfer, message, .. }) => {
                warn!(%container, %proto, %message, "clients table unreadable, starting empty");
                Ok(ClientsTable::default())
            }
            Err(other) => Err(other),
        }
    }

    pub async fn store_clients_table(
        &self,
        credentials: &ServerCredentials,
        container: DockerContainer,
        proto: Protocol,
        table: &ClientsTable,
    ) -> Result<()> {
        self.upload_text_file_to_container(
            credentials,
            container,
            &table.to_document()?,
            &proto.clients_table_path(),
            OverwriteMode::OverwriteExisting,
        )
        .await
    }

    /// Records a freshly generated client.
    pub async fn register_client(
        &self,
        credentials: &ServerCredentials,
        container: DockerContainer,
        proto: Protocol,
        client_id: &str,
        name: Option<&str>,
    ) -> Result<()> {
        let mut table = self.load_clients_table(credentials, container, proto).await?;
        if table.register(client_id, name) {
            self.store_clients_table(credentials, container, proto, &table)
                .await?;
            info!(%container, %proto, "client registered");
        }
        Ok(())
    }

    pub async fn rename_client(
        &self,
        credentials: &ServerCredentials,
        container: DockerContainer,
        proto: Protocol,
        client_id: &str,
        name: &str,
    ) -> Result<()> {
        let mut table = self.load_clients_table(credentials, container, proto).await?;
        table.rename(client_id, name)?;
        self.store_clients_table(credentials, container, proto, &table)
            .await
    }

    /// Brings the table in line with the clients the server actually knows.
    /// The table is only written back when it changed.
    pub async fn reconcile_clients(
        &self,
        credentials: &ServerCredentials,
        container: DockerContainer,
        proto: Protocol,
    ) -> Result<ClientsTable> {
        let mut table = self.load_clients_table(credentials, container, proto).await?;

        let changed = match proto {
            Protocol::OpenVpn => {
                let script = format!(
                    "sudo ls -1 {}/openvpn/pki/issued 2>/dev/null || true\n",
                    container.host_volume()
                );
                let mut sink = CollectSink::default();
                self.run_script(credentials, &script, Stage::Query, &mut sink)
                    .await?;
                table.reconcile(openvpn_issued_ids(&sink.stdout_text()))
            }
            Protocol::WireGuard | Protocol::Awg => {
                let wg_conf = self
                    .get_text_file_from_container(
                        credentials,
                        container,
                        &format!("{REMOTE_ROOT}/{}/wg0.conf", proto.as_str()),
                    )
                    .await?;
                table.reconcile(wireguard_peer_keys(&wg_conf))
            }
            // Clients of the wrapping protocols are the inner OpenVPN clients.
            Protocol::ShadowSocks | Protocol::Cloak => false,
        };

        if changed {
            self.store_clients_table(credentials, container, proto, &table)
                .await?;
        }
        Ok(table)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::testing::{creds, FakeShell, Reply};

    const WG_CONF: &str = "[Interface]\nPrivateKey = c2VydmVy\nAddress = 10.8.1.1/24\n\n\
        [Peer]\nPublicKey = cGVlcjE=\nPresharedKey = cHNr\nAllowedIPs = 10.8.1.2/32\n\n\
        [Peer]\nPublicKey = cGVlcjI=\nPresharedKey = cHNr\nAllowedIPs = 10.8.1.3/32\n";

    #[test]
    fn peer_keys_come_from_peer_sections() {
        assert_eq!(wireguard_peer_keys(WG_CONF), vec!["cGVlcjE=", "cGVlcjI="]);
    }

    #[test]
    fn issued_listing_skips_the_server_certificate() {
        let listing = "server.crt\nabc123.crt\n\nnotes.txt\n";
        assert_eq!(openvpn_issued_ids(listing), vec!["abc123"]);
    }

    #[test]
    fn reconcile_names_unknown_clients_in_order() {
        let mut table = ClientsTable::default();
        table.register("known", Some("Laptop"));
        assert!(table.reconcile(["known", "new-a", "new-b"]));
        assert_eq!(table.get("known").unwrap().client_name, "Laptop");
        assert_eq!(table.get("new-a").unwrap().client_name, "Client 2");
        assert_eq!(table.get("new-b").unwrap().client_name, "Client 3");
        assert!(!table.reconcile(["known"]));
    }

    #[test]
    fn renaming_an_unknown_client_fails() {
        let mut table = ClientsTable::default();
        assert!(table.rename("nobody", "x").is_err());
    }

    #[test]
    fn table_document_uses_camel_case() {
        let mut table = ClientsTable::default();
        table.reconcile(["id1"]);
        let doc = table.to_document().unwrap();
        assert!(doc.contains("\"clientName\": \"Client 1\""));
        assert_eq!(ClientsTable::parse(&doc).unwrap(), table);
    }

    #[tokio::test]
    async fn wireguard_reconcile_writes_back_only_when_changed() {
        let shell = Arc::new(FakeShell::new());
        shell.put_file("/opt/vpn-orchestrator/wireguard/data/wireguard/wg0.conf", WG_CONF);
        let ctl = ServerController::new(shell.clone());

        let table = ctl
            .reconcile_clients(&creds(), DockerContainer::WireGuard, Protocol::WireGuard)
            .await
            .unwrap();
        assert_eq!(table.len(), 2);
        let stored = shell
            .uploaded("/opt/vpn-orchestrator/wireguard/data/wireguard/clientsTable")
            .unwrap();
        assert!(stored.contains("cGVlcjE="));

        shell.clear_uploads();
        ctl.reconcile_clients(&creds(), DockerContainer::WireGuard, Protocol::WireGuard)
            .await
            .unwrap();
        assert!(shell.uploads().is_empty());
    }

    #[tokio::test]
    async fn openvpn_reconcile_reads_issued_certificates() {
        let shell = Arc::new(FakeShell::new());
        shell.reply_to("pki/issued", Reply::stdout(&["server.crt", "c0ffee.crt"]));
        let ctl = ServerController::new(shell.clone());

        let table = ctl
            .reconcile_clients(&creds(), DockerContainer::OpenVpn, Protocol::OpenVpn)
            .await
            .unwrap();
        assert_eq!(table.get("c0ffee").unwrap().client_name, "Client 1");
    }
}
