// src/daemon/protocol.rs
//
// Wire messages exchanged with the privileged daemon: one compact JSON object
// per line, discriminated by `type`.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::configurators::WireGuardConfigData;
use crate::containers::JunkParams;
use crate::error::{Error, Result};

// ==============================================================================
// Outbound
// ==============================================================================

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum DaemonRequest {
    Activate(ActivateParams),
    Deactivate,
    Status,
    Logs,
    #[serde(rename = "cleanlogs")]
    CleanLogs,
    FlushDns,
    RouteAdd { gateway: String, ips: Vec<String> },
    RouteDelete { gateway: String, ips: Vec<String> },
    ClearSavedRoutes,
}

impl DaemonRequest {
    pub fn kind(&self) -> &'static str {
        match self {
            DaemonRequest::Activate(_) => "activate",
            DaemonRequest::Deactivate => "deactivate",
            DaemonRequest::Status => "status",
            DaemonRequest::Logs => "logs",
            DaemonRequest::CleanLogs => "cleanlogs",
            DaemonRequest::FlushDns => "flushDns",
            DaemonRequest::RouteAdd { .. } => "routeAdd",
            DaemonRequest::RouteDelete { .. } => "routeDelete",
            DaemonRequest::ClearSavedRoutes => "clearSavedRoutes",
        }
    }

    /// Newline terminated wire form.
    pub fn to_line(&self) -> Result<String> {
        let mut line = serde_json::to_string(self)?;
        line.push('\n');
        Ok(line)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IpRange {
    pub address: String,
    pub range: u8,
    pub is_ipv6: bool,
}

impl IpRange {
    /// Parses `a.b.c.d/n`, `a.b.c.d` or an IPv6 equivalent.
    pub fn parse(value: &str) -> Result<Self> {
        let net: ipnetwork::IpNetwork = value
            .trim()
            .parse()
            .map_err(|_| Error::InvalidConfig(format!("invalid address range '{value}'")))?;
        Ok(Self {
            address: net.network().to_string(),
            range: net.prefix(),
            is_ipv6: net.is_ipv6(),
        })
    }

    pub fn everything() -> Vec<Self> {
        vec![
            Self {
                address: "0.0.0.0".into(),
                range: 0,
                is_ipv6: false,
            },
            Self {
                address: "::".into(),
                range: 0,
                is_ipv6: true,
            },
        ]
    }
}

/// Everything the daemon needs to bring a WireGuard-family interface up.
#[derive(Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ActivateParams {
    pub private_key: String,
    pub device_ipv4_address: String,
    pub device_ipv6_address: String,
    pub server_public_key: String,
    pub server_psk_key: String,
    pub server_ipv4_addr_in: String,
    pub server_port: u16,
    pub server_ipv4_gateway: String,
    pub dns_server: String,
    #[serde(rename = "allowedIPAddressRanges")]
    pub allowed_ip_address_ranges: Vec<IpRange>,
    pub excluded_addresses: Vec<String>,
    #[serde(flatten)]
    pub junk: Option<JunkParams>,
}

impl ActivateParams {
    /// Builds the activation from a generated client config. The server's own
    /// address is always excluded so the tunnel never routes its own transport.
    pub fn from_config(data: &WireGuardConfigData, dns_server: &str) -> Result<Self> {
        let allowed_ip_address_ranges = if data.allowed_ips.is_empty() {
            IpRange::everything()
        } else {
            data.allowed_ips
                .iter()
                .map(|ip| IpRange::parse(ip))
                .collect::<Result<_>>()?
        };

        Ok(Self {
            private_key: data.client_priv_key.clone(),
            device_ipv4_address: data.client_ip.clone(),
            device_ipv6_address: "dead::1".into(),
            server_public_key: data.server_pub_key.clone(),
            server_psk_key: data.psk_key.clone(),
            server_ipv4_addr_in: data.host_name.clone(),
            server_port: data.port,
            server_ipv4_gateway: data.host_name.clone(),
            dns_server: dns_server.to_string(),
            allowed_ip_address_ranges,
            excluded_addresses: vec![data.host_name.clone()],
            junk: data.junk,
        })
    }
}

impl fmt::Debug for ActivateParams {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ActivateParams")
            .field("private_key", &"[REDACTED]")
            .field("device_ipv4_address", &self.device_ipv4_address)
            .field("server_public_key", &self.server_public_key)
            .field("server_psk_key", &"[REDACTED]")
            .field("server_ipv4_addr_in", &self.server_ipv4_addr_in)
            .field("server_port", &self.server_port)
            .field("allowed_ip_address_ranges", &self.allowed_ip_address_ranges)
            .field("junk", &self.junk.is_some())
            .finish_non_exhaustive()
    }
}

// ==============================================================================
// Inbound
// ==============================================================================

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum DaemonMessage {
    Status(StatusReport),
    Connected { pubkey: String },
    Disconnected,
    BackendFailure,
    Logs {
        #[serde(default)]
        logs: Option<String>,
    },
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct StatusReport {
    pub connected: bool,
    pub date: Option<String>,
    pub server_ipv4_gateway: Option<String>,
    pub device_ipv4_address: Option<String>,
    pub tx_bytes: u64,
    pub rx_bytes: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn wg_data() -> WireGuardConfigData {
        WireGuardConfigData {
            config: String::new(),
            host_name: "203.0.113.7".into(),
            port: 51820,
            client_ip: "10.8.1.2".into(),
            client_priv_key: "cHJpdg==".into(),
            client_pub_key: "cHVi".into(),
            server_pub_key: "c2VydmVy".into(),
            psk_key: "cHNr".into(),
            mtu: 1420,
            allowed_ips: Vec::new(),
            junk: None,
        }
    }

    #[test]
    fn requests_carry_their_type_tag() {
        assert_eq!(DaemonRequest::Status.to_line().unwrap(), "{\"type\":\"status\"}\n");
        assert_eq!(DaemonRequest::CleanLogs.to_line().unwrap(), "{\"type\":\"cleanlogs\"}\n");
        let route = DaemonRequest::RouteAdd {
            gateway: "10.8.1.1".into(),
            ips: vec!["1.2.3.4".into()],
        };
        assert_eq!(
            route.to_line().unwrap(),
            "{\"type\":\"routeAdd\",\"gateway\":\"10.8.1.1\",\"ips\":[\"1.2.3.4\"]}\n"
        );
    }

    #[test]
    fn activate_uses_daemon_field_names() {
        let params = ActivateParams::from_config(&wg_data(), "1.1.1.1").unwrap();
        let value = serde_json::to_value(DaemonRequest::Activate(params)).unwrap();
        assert_eq!(value["type"], "activate");
        assert_eq!(value["privateKey"], "cHJpdg==");
        assert_eq!(value["deviceIpv4Address"], "10.8.1.2");
        assert_eq!(value["serverIpv4AddrIn"], "203.0.113.7");
        assert_eq!(value["serverPort"], 51820);
        assert_eq!(value["dnsServer"], "1.1.1.1");
        assert_eq!(value["allowedIPAddressRanges"][1]["isIpv6"], true);
        assert_eq!(value["excludedAddresses"][0], "203.0.113.7");
        assert!(value.get("Jc").is_none());
    }

    #[test]
    fn awg_activation_inlines_junk_parameters() {
        let mut data = wg_data();
        data.junk = Some(JunkParams::default());
        data.allowed_ips = vec!["10.0.0.0/8".into(), "192.168.1.1".into()];
        let params = ActivateParams::from_config(&data, "1.1.1.1").unwrap();
        let value = serde_json::to_value(&params).unwrap();
        assert_eq!(value["Jc"], 4);
        assert_eq!(value["H4"], 4);
        assert_eq!(
            params.allowed_ip_address_ranges,
            vec![
                IpRange { address: "10.0.0.0".into(), range: 8, is_ipv6: false },
                IpRange { address: "192.168.1.1".into(), range: 32, is_ipv6: false },
            ]
        );
    }

    #[test]
    fn debug_output_redacts_keys() {
        let params = ActivateParams::from_config(&wg_data(), "1.1.1.1").unwrap();
        let debug = format!("{params:?}");
        assert!(!debug.contains("cHJpdg=="));
        assert!(!debug.contains("cHNr"));
    }

    #[test]
    fn minimal_status_parses_with_defaults() {
        let msg: DaemonMessage = serde_json::from_str(r#"{"type":"status","connected":false}"#).unwrap();
        assert_eq!(msg, DaemonMessage::Status(StatusReport::default()));
    }

    #[test]
    fn inbound_messages_parse() {
        let msg: DaemonMessage = serde_json::from_str(r#"{"type":"connected","pubkey":"abc"}"#).unwrap();
        assert_eq!(msg, DaemonMessage::Connected { pubkey: "abc".into() });
        let msg: DaemonMessage = serde_json::from_str(r#"{"type":"backendFailure"}"#).unwrap();
        assert_eq!(msg, DaemonMessage::BackendFailure);
        let msg: DaemonMessage =
            serde_json::from_str(r#"{"type":"status","connected":true,"txBytes":10,"rxBytes":20}"#).unwrap();
        match msg {
            DaemonMessage::Status(report) => {
                assert!(report.connected);
                assert_eq!((report.tx_bytes, report.rx_bytes), (10, 20));
            }
            other => panic!("unexpected {other:?}"),
        }
        assert!(serde_json::from_str::<DaemonMessage>(r#"{"type":"reboot"}"#).is_err());
    }
}
