// src/vpn/configuration.rs
//
// The document handed to a tunnel: one typed block per protocol layer plus the
// DNS and split-tunnel policy that apply to the whole connection.

use serde::{Deserialize, Serialize};

use crate::configurators::{CloakConfigData, OpenVpnConfigData, ShadowSocksConfigData, WireGuardConfigData};
use crate::containers::Protocol;
use crate::error::{Error, Result};

/// Layout marker. Unknown versions are rejected when parsing.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "u8", into = "u8")]
pub enum ConfigVersion {
    /// Generated by this orchestrator against a server it provisioned.
    #[default]
    Managed,
    /// Imported as-is; routing comes from the config itself.
    Native,
}

impl TryFrom<u8> for ConfigVersion {
    type Error = String;

    fn try_from(value: u8) -> std::result::Result<Self, Self::Error> {
        match value {
            0 => Ok(ConfigVersion::Managed),
            1 => Ok(ConfigVersion::Native),
            other => Err(format!("unsupported config version {other}")),
        }
    }
}

impl From<ConfigVersion> for u8 {
    fn from(value: ConfigVersion) -> Self {
        match value {
            ConfigVersion::Managed => 0,
            ConfigVersion::Native => 1,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "u8", into = "u8")]
pub enum RouteMode {
    /// Full tunnel.
    #[default]
    AllSites,
    /// Include list: only the listed sites go through the tunnel.
    OnlyForwardSites,
    /// Exclude list: everything except the listed sites.
    AllExceptSites,
}

impl TryFrom<u8> for RouteMode {
    type Error = String;

    fn try_from(value: u8) -> std::result::Result<Self, Self::Error> {
        match value {
            0 => Ok(RouteMode::AllSites),
            1 => Ok(RouteMode::OnlyForwardSites),
            2 => Ok(RouteMode::AllExceptSites),
            other => Err(format!("unknown route mode {other}")),
        }
    }
}

impl From<RouteMode> for u8 {
    fn from(value: RouteMode) -> Self {
        match value {
            RouteMode::AllSites => 0,
            RouteMode::OnlyForwardSites => 1,
            RouteMode::AllExceptSites => 2,
        }
    }
}

impl std::str::FromStr for RouteMode {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "all" | "0" => Ok(RouteMode::AllSites),
            "include" | "1" => Ok(RouteMode::OnlyForwardSites),
            "exclude" | "2" => Ok(RouteMode::AllExceptSites),
            other => Err(Error::InvalidConfig(format!("unknown route mode '{other}'"))),
        }
    }
}

const FULL_TUNNEL: [&str; 2] = ["0.0.0.0/0", "::/0"];

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VpnConfiguration {
    pub vpnproto: Protocol,
    pub dns1: String,
    pub dns2: String,
    pub host_name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub config_version: ConfigVersion,
    #[serde(default)]
    pub split_tunnel_type: RouteMode,
    #[serde(default)]
    pub split_tunnel_sites: Vec<String>,

    #[serde(rename = "openvpn_config_data", default, skip_serializing_if = "Option::is_none")]
    pub openvpn: Option<OpenVpnConfigData>,
    #[serde(rename = "shadowsocks_config_data", default, skip_serializing_if = "Option::is_none")]
    pub shadowsocks: Option<ShadowSocksConfigData>,
    #[serde(rename = "cloak_config_data", default, skip_serializing_if = "Option::is_none")]
    pub cloak: Option<CloakConfigData>,
    #[serde(rename = "wireguard_config_data", default, skip_serializing_if = "Option::is_none")]
    pub wireguard: Option<WireGuardConfigData>,
    #[serde(rename = "awg_config_data", default, skip_serializing_if = "Option::is_none")]
    pub awg: Option<WireGuardConfigData>,
}

impl VpnConfiguration {
    pub fn new(vpnproto: Protocol, host_name: impl Into<String>, dns: (String, String)) -> Self {
        Self {
            vpnproto,
            dns1: dns.0,
            dns2: dns.1,
            host_name: host_name.into(),
            description: String::new(),
            config_version: ConfigVersion::Managed,
            split_tunnel_type: RouteMode::AllSites,
            split_tunnel_sites: Vec::new(),
            openvpn: None,
            shadowsocks: None,
            cloak: None,
            wireguard: None,
            awg: None,
        }
    }

    pub fn from_json(text: &str) -> Result<Self> {
        Ok(serde_json::from_str(text)?)
    }

    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    /// Parses a generated config document into the block of `proto`.
    pub fn set_protocol_data(&mut self, proto: Protocol, text: &str) -> Result<()> {
        let invalid = |e: serde_json::Error| Error::ConfigGeneration {
            protocol: proto,
            message: format!("unreadable client config: {e}"),
        };
        match proto {
            Protocol::OpenVpn => self.openvpn = Some(serde_json::from_str(text).map_err(invalid)?),
            Protocol::ShadowSocks => self.shadowsocks = Some(serde_json::from_str(text).map_err(invalid)?),
            Protocol::Cloak => self.cloak = Some(serde_json::from_str(text).map_err(invalid)?),
            Protocol::WireGuard => self.wireguard = Some(serde_json::from_str(text).map_err(invalid)?),
            Protocol::Awg => self.awg = Some(serde_json::from_str(text).map_err(invalid)?),
        }
        Ok(())
    }

    pub fn has_protocol_data(&self, proto: Protocol) -> bool {
        match proto {
            Protocol::OpenVpn => self.openvpn.is_some(),
            Protocol::ShadowSocks => self.shadowsocks.is_some(),
            Protocol::Cloak => self.cloak.is_some(),
            Protocol::WireGuard => self.wireguard.is_some(),
            Protocol::Awg => self.awg.is_some(),
        }
    }

    /// The WireGuard-family block matching `vpnproto`.
    pub fn wireguard_data(&self) -> Option<&WireGuardConfigData> {
        match self.vpnproto {
            Protocol::WireGuard => self.wireguard.as_ref(),
            Protocol::Awg => self.awg.as_ref(),
            _ => None,
        }
    }

    /// Records the split-tunnel policy. Include lists always carry the DNS
    /// servers. A native AWG config that narrows its own AllowedIPs overrides
    /// the user's policy with that list.
    pub fn append_split_tunnel(&mut self, mode: RouteMode, sites: Vec<String>) {
        if let Some(allowed) = self.native_allowed_ips() {
            self.split_tunnel_type = RouteMode::OnlyForwardSites;
            self.split_tunnel_sites = allowed;
            self.push_dns_sites();
            return;
        }

        self.split_tunnel_type = mode;
        self.split_tunnel_sites = sites;
        if mode == RouteMode::OnlyForwardSites {
            self.push_dns_sites();
        }
    }

    fn native_allowed_ips(&self) -> Option<Vec<String>> {
        if self.config_version != ConfigVersion::Native || self.vpnproto != Protocol::Awg {
            return None;
        }
        let allowed: Vec<String> = self
            .awg
            .as_ref()?
            .allowed_ips
            .iter()
            .map(|ip| ip.trim().to_string())
            .filter(|ip| !ip.is_empty())
            .collect();
        let full_tunnel = allowed.iter().all(|ip| FULL_TUNNEL.contains(&ip.as_str()));
        (!full_tunnel).then_some(allowed)
    }

    fn push_dns_sites(&mut self) {
        for dns in [self.dns1.clone(), self.dns2.clone()] {
            if !dns.is_empty() {
                self.split_tunnel_sites.push(dns);
            }
        }
    }
}
