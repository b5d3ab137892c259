// src/configurators/wireguard.rs
//
// WireGuard and AWG clients: the key pair is made locally, the server only
// learns the public half through a new [Peer] section.

use std::collections::HashSet;
use std::net::Ipv4Addr;
use std::sync::LazyLock;

use async_trait::async_trait;
use regex::Regex;
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::containers::{ContainerConfig, DockerContainer, JunkParams, Protocol};
use crate::credentials::ServerCredentials;
use crate::error::{Error, Result};
use crate::provision::{LogSink, ServerController, Stage};
use crate::scripts::{gen_vars_for_script, script_data, substitute, ScriptKind};
use crate::sys::traits::OverwriteMode;

use super::keys::{is_valid_key, ClientKeyPair};
use super::{fetch_artifact, generation_error, Configurator, GeneratedConfig};

static ALLOWED_IP: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?m)^\s*AllowedIPs\s*=\s*(\d{1,3}\.\d{1,3}\.\d{1,3}\.\d{1,3})").expect("valid regex")
});

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WireGuardConfigData {
    pub config: String,
    #[serde(rename = "hostName")]
    pub host_name: String,
    pub port: u16,
    pub client_ip: String,
    pub client_priv_key: String,
    pub client_pub_key: String,
    pub server_pub_key: String,
    pub psk_key: String,
    pub mtu: u16,
    /// Routes sent through the tunnel; empty means everything.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub allowed_ips: Vec<String>,
    #[serde(flatten)]
    pub junk: Option<JunkParams>,
}

pub struct WireGuardConfigurator {
    proto: Protocol,
}

impl WireGuardConfigurator {
    pub fn new(proto: Protocol) -> Self {
        debug_assert!(proto.is_wireguard_family());
        Self { proto }
    }

    fn placeholder_prefix(&self) -> &'static str {
        match self.proto {
            Protocol::Awg => "AWG",
            _ => "WIREGUARD",
        }
    }

    fn tool(&self) -> &'static str {
        match self.proto {
            Protocol::Awg => "awg",
            _ => "wg",
        }
    }
}

/// First free host address in the /24 of `subnet`. `.1` is the server.
pub fn next_client_ip(wg_conf: &str, subnet: Ipv4Addr) -> Option<Ipv4Addr> {
    let used: HashSet<Ipv4Addr> = ALLOWED_IP
        .captures_iter(wg_conf)
        .filter_map(|c| c.get(1)?.as_str().parse().ok())
        .collect();
    let [a, b, c, _] = subnet.octets();
    (2..=254)
        .map(|host| Ipv4Addr::new(a, b, c, host))
        .find(|ip| !used.contains(ip))
}

fn peer_section(public_key: &str, psk: &str, ip: Ipv4Addr) -> String {
    format!("[Peer]\nPublicKey = {public_key}\nPresharedKey = {psk}\nAllowedIPs = {ip}/32\n")
}

#[async_trait]
impl Configurator for WireGuardConfigurator {
    fn protocol(&self) -> Protocol {
        self.proto
    }

    async fn generate(
        &self,
        controller: &ServerController,
        credentials: &ServerCredentials,
        container: DockerContainer,
        config: &ContainerConfig,
    ) -> Result<GeneratedConfig> {
        let proto = self.proto;
        let dir = proto.container_dir();
        let keys = ClientKeyPair::generate();

        let server_pub_key = fetch_artifact(
            controller,
            credentials,
            container,
            proto,
            &format!("{dir}/wireguard_server_public_key.key"),
        )
        .await?;
        if !is_valid_key(&server_pub_key) {
            return Err(generation_error(proto, "server public key is not a WireGuard key"));
        }
        let psk = fetch_artifact(controller, credentials, container, proto, &format!("{dir}/wireguard_psk.key")).await?;

        let conf_path = format!("{dir}/wg0.conf");
        let wg_conf = fetch_artifact(controller, credentials, container, proto, &conf_path).await?;

        let block = config.protocol(proto);
        let client_ip = next_client_ip(&wg_conf, block.subnet_or_default(proto)).ok_or_else(|| {
            Error::ConfigGeneration {
                protocol: proto,
                message: "no free client address left in the subnet".into(),
            }
        })?;

        let updated = format!("{wg_conf}\n\n{}", peer_section(&keys.public_base64(), &psk, client_ip));
        controller
            .upload_text_file_to_container(credentials, container, &updated, &conf_path, OverwriteMode::OverwriteExisting)
            .await?;

        let mut vars = gen_vars_for_script(credentials, Some(container), Some(config));
        vars.push("$WG_TOOL", self.tool())
            .push("$WG_CONFIG_PATH", conf_path.as_str());
        controller
            .run_registry_script(
                credentials,
                ScriptKind::SyncWireGuardPeers,
                Some(container),
                &vars,
                Stage::ConfigureContainer,
                &mut LogSink::new(Stage::ConfigureContainer),
            )
            .await?;
        info!(%container, %client_ip, "peer added");

        let prefix = self.placeholder_prefix();
        vars.push(format!("${prefix}_CLIENT_IP"), client_ip.to_string())
            .push(format!("${prefix}_CLIENT_PRIVATE_KEY"), keys.private_base64())
            .push(format!("${prefix}_SERVER_PUBLIC_KEY"), server_pub_key.as_str())
            .push(format!("${prefix}_PSK"), psk.as_str());
        let rendered = substitute(script_data(ScriptKind::WireGuardTemplate, Some(container))?, &vars);

        let data = WireGuardConfigData {
            config: rendered,
            host_name: credentials.host.clone(),
            port: block.port_or_default(proto),
            client_ip: client_ip.to_string(),
            client_priv_key: keys.private_base64(),
            client_pub_key: keys.public_base64(),
            server_pub_key,
            psk_key: psk,
            mtu: block.mtu_or_default(proto),
            allowed_ips: Vec::new(),
            junk: (proto == Protocol::Awg).then(|| block.junk.unwrap_or_default()),
        };

        Ok(GeneratedConfig {
            protocol: proto,
            text: serde_json::to_string(&data)?,
            client_id: Some(keys.public_base64()),
        })
    }
}
