// src/containers.rs

use std::collections::BTreeMap;
use std::fmt;
use std::net::Ipv4Addr;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::error::Error;

/// Root of everything the orchestrator owns on a remote host.
pub const REMOTE_ROOT: &str = "/opt/vpn-orchestrator";

pub const DEFAULT_PRIMARY_DNS: &str = "1.1.1.1";
pub const DEFAULT_SECONDARY_DNS: &str = "1.0.0.1";

// ==============================================================================
// 1. Containers
// ==============================================================================

/// A containerized VPN service that can be installed on a server.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum DockerContainer {
    #[serde(rename = "openvpn")]
    OpenVpn,
    /// OpenVPN carried over ShadowSocks.
    #[serde(rename = "openvpn-shadowsocks")]
    ShadowSocks,
    /// OpenVPN over ShadowSocks over Cloak.
    #[serde(rename = "openvpn-cloak")]
    Cloak,
    #[serde(rename = "wireguard")]
    WireGuard,
    /// WireGuard with junk-packet obfuscation.
    #[serde(rename = "awg")]
    Awg,
}

impl DockerContainer {
    pub const ALL: [DockerContainer; 5] = [
        DockerContainer::OpenVpn,
        DockerContainer::ShadowSocks,
        DockerContainer::Cloak,
        DockerContainer::WireGuard,
        DockerContainer::Awg,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            DockerContainer::OpenVpn => "openvpn",
            DockerContainer::ShadowSocks => "openvpn-shadowsocks",
            DockerContainer::Cloak => "openvpn-cloak",
            DockerContainer::WireGuard => "wireguard",
            DockerContainer::Awg => "awg",
        }
    }

    /// Name of both the image and the running container on the host.
    pub fn remote_name(self) -> String {
        format!("vpnorch-{}", self.as_str())
    }

    /// Folder under `server_scripts/` holding this container's scripts.
    pub fn script_folder(self) -> &'static str {
        match self {
            DockerContainer::OpenVpn => "openvpn",
            DockerContainer::ShadowSocks => "openvpn_shadowsocks",
            DockerContainer::Cloak => "openvpn_cloak",
            DockerContainer::WireGuard => "wireguard",
            DockerContainer::Awg => "awg",
        }
    }

    /// Build context and staging folder on the host.
    pub fn host_folder(self) -> String {
        format!("{REMOTE_ROOT}/{}", self.as_str())
    }

    /// Host directory mounted at [`REMOTE_ROOT`] inside the container.
    pub fn host_volume(self) -> String {
        format!("{}/data", self.host_folder())
    }

    /// Protocol stack, innermost first.
    pub fn protocols(self) -> &'static [Protocol] {
        match self {
            DockerContainer::OpenVpn => &[Protocol::OpenVpn],
            DockerContainer::ShadowSocks => &[Protocol::OpenVpn, Protocol::ShadowSocks],
            DockerContainer::Cloak => &[Protocol::OpenVpn, Protocol::ShadowSocks, Protocol::Cloak],
            DockerContainer::WireGuard => &[Protocol::WireGuard],
            DockerContainer::Awg => &[Protocol::Awg],
        }
    }

    /// The outermost protocol: the one whose port is published.
    pub fn default_protocol(self) -> Protocol {
        match self.protocols().last() {
            Some(proto) => *proto,
            None => Protocol::OpenVpn,
        }
    }

    /// Maps an in-container path (under [`REMOTE_ROOT`]) to its location on the host volume.
    pub fn host_path_for(self, container_path: &str) -> Option<String> {
        let relative = container_path.strip_prefix(REMOTE_ROOT)?.trim_start_matches('/');
        if relative.is_empty() || relative.split('/').any(|part| part == "..") {
            return None;
        }
        Some(format!("{}/{relative}", self.host_volume()))
    }
}

impl fmt::Display for DockerContainer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DockerContainer {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        DockerContainer::ALL
            .into_iter()
            .find(|c| c.as_str() == s)
            .ok_or_else(|| Error::InvalidConfig(format!("unknown container '{s}'")))
    }
}

// ==============================================================================
// 2. Protocols
// ==============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    OpenVpn,
    ShadowSocks,
    Cloak,
    WireGuard,
    Awg,
}

impl Protocol {
    pub fn as_str(self) -> &'static str {
        match self {
            Protocol::OpenVpn => "openvpn",
            Protocol::ShadowSocks => "shadowsocks",
            Protocol::Cloak => "cloak",
            Protocol::WireGuard => "wireguard",
            Protocol::Awg => "awg",
        }
    }

    /// Key of this protocol's block inside a VpnConfiguration document.
    pub fn config_data_key(self) -> String {
        format!("{}_config_data", self.as_str())
    }

    /// Directory of this protocol's state inside its container.
    pub fn container_dir(self) -> String {
        format!("{REMOTE_ROOT}/{}", self.as_str())
    }

    /// Path of the clients table inside the container.
    pub fn clients_table_path(self) -> String {
        format!("{}/clientsTable", self.container_dir())
    }

    pub fn default_port(self) -> u16 {
        match self {
            Protocol::OpenVpn => 1194,
            Protocol::ShadowSocks => 6789,
            Protocol::Cloak => 443,
            Protocol::WireGuard => 51820,
            Protocol::Awg => 55424,
        }
    }

    pub fn default_transport(self) -> TransportProto {
        match self {
            Protocol::OpenVpn | Protocol::WireGuard | Protocol::Awg => TransportProto::Udp,
            Protocol::ShadowSocks | Protocol::Cloak => TransportProto::Tcp,
        }
    }

    /// True for the WireGuard family, which is activated through the daemon.
    pub fn is_wireguard_family(self) -> bool {
        matches!(self, Protocol::WireGuard | Protocol::Awg)
    }
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Protocol {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        [
            Protocol::OpenVpn,
            Protocol::ShadowSocks,
            Protocol::Cloak,
            Protocol::WireGuard,
            Protocol::Awg,
        ]
        .into_iter()
        .find(|p| p.as_str() == s)
        .ok_or_else(|| Error::InvalidConfig(format!("unknown protocol '{s}'")))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransportProto {
    Udp,
    Tcp,
}

impl TransportProto {
    pub fn as_str(self) -> &'static str {
        match self {
            TransportProto::Udp => "udp",
            TransportProto::Tcp => "tcp",
        }
    }
}

impl fmt::Display for TransportProto {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TransportProto {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "udp" => Ok(TransportProto::Udp),
            "tcp" => Ok(TransportProto::Tcp),
            other => Err(Error::InvalidConfig(format!("unknown transport '{other}'"))),
        }
    }
}

// ==============================================================================
// 3. Per-protocol settings
// ==============================================================================

pub mod defaults {
    pub const OPENVPN_CIPHER: &str = "AES-256-GCM";
    pub const OPENVPN_HASH: &str = "SHA512";
    pub const OPENVPN_SUBNET: &str = "10.8.0.0";
    pub const SHADOWSOCKS_CIPHER: &str = "chacha20-ietf-poly1305";
    pub const SHADOWSOCKS_LOCAL_PORT: u16 = 8585;
    pub const CLOAK_SITE: &str = "tile.openstreetmap.org";
    pub const WIREGUARD_SUBNET: &str = "10.8.1.0";
    pub const WIREGUARD_MTU: u16 = 1420;
    pub const AWG_MTU: u16 = 1280;
    pub const SUBNET_CIDR: u8 = 24;
}

/// Junk-packet obfuscation parameters of an AWG service.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct JunkParams {
    #[serde(rename = "Jc")]
    pub junk_packet_count: u32,
    #[serde(rename = "Jmin")]
    pub junk_packet_min_size: u32,
    #[serde(rename = "Jmax")]
    pub junk_packet_max_size: u32,
    #[serde(rename = "S1")]
    pub init_packet_junk_size: u32,
    #[serde(rename = "S2")]
    pub response_packet_junk_size: u32,
    #[serde(rename = "H1")]
    pub init_packet_magic_header: u32,
    #[serde(rename = "H2")]
    pub response_packet_magic_header: u32,
    #[serde(rename = "H3")]
    pub underload_packet_magic_header: u32,
    #[serde(rename = "H4")]
    pub transport_packet_magic_header: u32,
}

impl Default for JunkParams {
    /// Values that make the obfuscation layer a no-op on the wire.
    fn default() -> Self {
        Self {
            junk_packet_count: 4,
            junk_packet_min_size: 40,
            junk_packet_max_size: 70,
            init_packet_junk_size: 0,
            response_packet_junk_size: 0,
            init_packet_magic_header: 1,
            response_packet_magic_header: 2,
            underload_packet_magic_header: 3,
            transport_packet_magic_header: 4,
        }
    }
}

impl JunkParams {
    /// Fresh random parameters. The junk sizes never collide with the handshake
    /// size difference and the four magic headers are distinct.
    pub fn random() -> Self {
        let mut rng = rand::thread_rng();
        let init_packet_junk_size = rng.gen_range(15..=150);
        let response_packet_junk_size = loop {
            let candidate = rng.gen_range(15..=150);
            if init_packet_junk_size + 56 != candidate {
                break candidate;
            }
        };

        let mut headers: Vec<u32> = Vec::with_capacity(4);
        while headers.len() < 4 {
            let candidate = rng.gen_range(5..=i32::MAX as u32);
            if !headers.contains(&candidate) {
                headers.push(candidate);
            }
        }

        Self {
            junk_packet_count: rng.gen_range(3..=10),
            junk_packet_min_size: 50,
            junk_packet_max_size: 1000,
            init_packet_junk_size,
            response_packet_junk_size,
            init_packet_magic_header: headers[0],
            response_packet_magic_header: headers[1],
            underload_packet_magic_header: headers[2],
            transport_packet_magic_header: headers[3],
        }
    }
}

/// Last client config generated for a protocol, kept so reconnects skip the server round trip.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CachedConfig {
    pub config: String,
    pub created_at: DateTime<Utc>,
}

impl CachedConfig {
    pub fn new(config: String) -> Self {
        Self {
            config,
            created_at: Utc::now(),
        }
    }

    pub fn is_fresh(&self, ttl: chrono::Duration, now: DateTime<Utc>) -> bool {
        now.signed_duration_since(self.created_at) < ttl
    }
}

/// Settings of one protocol layer in a container. Absent fields fall back to the protocol defaults.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ProtocolConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub port: Option<u16>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub transport_proto: Option<TransportProto>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cipher: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hash: Option<String>,
    /// Decoy web site Cloak forwards unauthenticated traffic to.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub site: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subnet_address: Option<Ipv4Addr>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mtu: Option<u16>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub junk: Option<JunkParams>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_config: Option<CachedConfig>,
}

impl ProtocolConfig {
    pub fn port_or_default(&self, proto: Protocol) -> u16 {
        self.port.unwrap_or_else(|| proto.default_port())
    }

    pub fn transport_or_default(&self, proto: Protocol) -> TransportProto {
        self.transport_proto
            .unwrap_or_else(|| proto.default_transport())
    }

    pub fn subnet_or_default(&self, proto: Protocol) -> Ipv4Addr {
        let fallback = match proto {
            Protocol::WireGuard | Protocol::Awg => defaults::WIREGUARD_SUBNET,
            _ => defaults::OPENVPN_SUBNET,
        };
        self.subnet_address
            .unwrap_or_else(|| fallback.parse().unwrap_or(Ipv4Addr::UNSPECIFIED))
    }

    pub fn mtu_or_default(&self, proto: Protocol) -> u16 {
        self.mtu.unwrap_or(match proto {
            Protocol::Awg => defaults::AWG_MTU,
            _ => defaults::WIREGUARD_MTU,
        })
    }

    /// Copy without the cached client config, for comparing server-relevant settings.
    pub fn without_cache(&self) -> Self {
        Self {
            last_config: None,
            ..self.clone()
        }
    }
}

/// Settings of one installed container: `{ "container": "<id>", "<proto>": {...} }`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContainerConfig {
    pub container: DockerContainer,
    #[serde(flatten)]
    pub protocols: BTreeMap<Protocol, ProtocolConfig>,
}

impl ContainerConfig {
    pub fn new(container: DockerContainer) -> Self {
        Self {
            container,
            protocols: BTreeMap::new(),
        }
    }

    /// Builds the configuration for a fresh install. `port`/`transport` apply to the
    /// published protocol; inner layers keep their defaults.
    pub fn create_initial(
        container: DockerContainer,
        port: Option<u16>,
        transport: Option<TransportProto>,
    ) -> Self {
        let mut config = Self::new(container);
        let published = container.default_protocol();

        for &proto in container.protocols() {
            let mut block = ProtocolConfig {
                port: Some(proto.default_port()),
                transport_proto: Some(proto.default_transport()),
                ..ProtocolConfig::default()
            };

            match proto {
                Protocol::OpenVpn => {
                    block.cipher = Some(defaults::OPENVPN_CIPHER.to_string());
                    block.hash = Some(defaults::OPENVPN_HASH.to_string());
                    // Inside an obfuscation chain OpenVPN only ever speaks TCP to its local peer.
                    if published != Protocol::OpenVpn {
                        block.transport_proto = Some(TransportProto::Tcp);
                    }
                }
                Protocol::ShadowSocks => {
                    block.cipher = Some(defaults::SHADOWSOCKS_CIPHER.to_string());
                }
                Protocol::Cloak => {
                    block.site = Some(defaults::CLOAK_SITE.to_string());
                }
                Protocol::WireGuard => {
                    block.subnet_address = defaults::WIREGUARD_SUBNET.parse().ok();
                    block.mtu = Some(defaults::WIREGUARD_MTU);
                }
                Protocol::Awg => {
                    block.subnet_address = defaults::WIREGUARD_SUBNET.parse().ok();
                    block.mtu = Some(defaults::AWG_MTU);
                    block.junk = Some(JunkParams::random());
                }
            }

            if proto == published {
                if let Some(port) = port {
                    block.port = Some(port);
                }
                if let Some(transport) = transport {
                    block.transport_proto = Some(transport);
                }
            }

            config.protocols.insert(proto, block);
        }

        config
    }

    /// The block for `proto`, or an empty one when the document omits it.
    pub fn protocol(&self, proto: Protocol) -> ProtocolConfig {
        self.protocols.get(&proto).cloned().unwrap_or_default()
    }

    pub fn protocol_mut(&mut self, proto: Protocol) -> &mut ProtocolConfig {
        self.protocols.entry(proto).or_default()
    }

    /// Port and transport of the published protocol.
    pub fn published_endpoint(&self) -> (u16, TransportProto) {
        let proto = self.container.default_protocol();
        let block = self.protocol(proto);
        (block.port_or_default(proto), block.transport_or_default(proto))
    }

    /// Copy with every cached client config removed.
    pub fn without_cache(&self) -> Self {
        Self {
            container: self.container,
            protocols: self
                .protocols
                .iter()
                .map(|(proto, block)| (*proto, block.without_cache()))
                .collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_protocol_is_outermost_layer() {
        assert_eq!(DockerContainer::OpenVpn.default_protocol(), Protocol::OpenVpn);
        assert_eq!(DockerContainer::ShadowSocks.default_protocol(), Protocol::ShadowSocks);
        assert_eq!(DockerContainer::Cloak.default_protocol(), Protocol::Cloak);
        assert_eq!(DockerContainer::Awg.default_protocol(), Protocol::Awg);
    }

    #[test]
    fn container_ids_round_trip_through_strings() {
        for container in DockerContainer::ALL {
            assert_eq!(container.as_str().parse::<DockerContainer>().unwrap(), container);
        }
        assert!("openvpn-ikev2".parse::<DockerContainer>().is_err());
    }

    #[test]
    fn container_paths_map_onto_the_host_volume() {
        let c = DockerContainer::WireGuard;
        assert_eq!(
            c.host_path_for("/opt/vpn-orchestrator/wireguard/wg0.conf").as_deref(),
            Some("/opt/vpn-orchestrator/wireguard/data/wireguard/wg0.conf")
        );
        assert_eq!(c.host_path_for("/etc/passwd"), None);
        assert_eq!(c.host_path_for("/opt/vpn-orchestrator/../etc/shadow"), None);
    }

    #[test]
    fn initial_config_applies_port_to_published_protocol_only() {
        let config = ContainerConfig::create_initial(
            DockerContainer::Cloak,
            Some(8443),
            Some(TransportProto::Tcp),
        );
        assert_eq!(config.protocol(Protocol::Cloak).port, Some(8443));
        assert_eq!(config.protocol(Protocol::OpenVpn).port, Some(1194));
        assert_eq!(
            config.protocol(Protocol::OpenVpn).transport_proto,
            Some(TransportProto::Tcp)
        );
        assert_eq!(config.published_endpoint(), (8443, TransportProto::Tcp));
    }

    #[test]
    fn random_junk_params_are_well_formed() {
        for _ in 0..50 {
            let junk = JunkParams::random();
            assert_ne!(junk.init_packet_junk_size + 56, junk.response_packet_junk_size);
            let headers = [
                junk.init_packet_magic_header,
                junk.response_packet_magic_header,
                junk.underload_packet_magic_header,
                junk.transport_packet_magic_header,
            ];
            for (i, a) in headers.iter().enumerate() {
                assert!(*a >= 5);
                assert!(headers[i + 1..].iter().all(|b| b != a));
            }
        }
    }

    #[test]
    fn container_config_json_uses_protocol_keys() {
        let config = ContainerConfig::create_initial(DockerContainer::OpenVpn, None, None);
        let json = serde_json::to_value(&config).unwrap();
        assert_eq!(json["container"], "openvpn");
        assert_eq!(json["openvpn"]["port"], 1194);
        assert_eq!(json["openvpn"]["transport_proto"], "udp");

        let parsed: ContainerConfig = serde_json::from_value(json).unwrap();
        assert_eq!(parsed, config);
    }

    #[test]
    fn unknown_protocol_block_is_rejected() {
        let raw = r#"{"container":"openvpn","ikev2":{"port":500}}"#;
        assert!(serde_json::from_str::<ContainerConfig>(raw).is_err());
    }
}
