// src/configurators/mod.rs
//
// Protocol configurators: pull artifacts the server generated and render the
// client side configuration for one protocol.

pub mod cloak;
pub mod keys;
pub mod openvpn;
pub mod shadowsocks;
pub mod wireguard;

use std::sync::Arc;

use async_trait::async_trait;
use tracing::{info, warn};

use crate::containers::{ContainerConfig, DockerContainer, Protocol};
use crate::credentials::ServerCredentials;
use crate::error::{Error, Result};
use crate::provision::ServerController;
use crate::scripts::{substitute_json, VarsList};

pub use cloak::{CloakConfigData, CloakConfigurator};
pub use openvpn::{OpenVpnConfigData, OpenVpnConfigurator};
pub use shadowsocks::{ShadowSocksConfigData, ShadowSocksConfigurator};
pub use wireguard::{WireGuardConfigData, WireGuardConfigurator};

/// Client configuration for one protocol, serialized as JSON.
#[derive(Debug, Clone, PartialEq)]
pub struct GeneratedConfig {
    pub protocol: Protocol,
    pub text: String,
    /// Identity the server now knows this client by, when the protocol has one.
    pub client_id: Option<String>,
}

#[async_trait]
pub trait Configurator: Send + Sync {
    fn protocol(&self) -> Protocol;

    async fn generate(
        &self,
        controller: &ServerController,
        credentials: &ServerCredentials,
        container: DockerContainer,
        config: &ContainerConfig,
    ) -> Result<GeneratedConfig>;
}

pub fn configurator_for(proto: Protocol) -> Box<dyn Configurator> {
    match proto {
        Protocol::OpenVpn => Box::new(OpenVpnConfigurator),
        Protocol::ShadowSocks => Box::new(ShadowSocksConfigurator),
        Protocol::Cloak => Box::new(CloakConfigurator),
        Protocol::WireGuard => Box::new(WireGuardConfigurator::new(Protocol::WireGuard)),
        Protocol::Awg => Box::new(WireGuardConfigurator::new(Protocol::Awg)),
    }
}

/// Reads a small artifact from the container, trimmed. Fetch failures are
/// returned as they are; an empty artifact is a generation error.
pub(crate) async fn fetch_artifact(
    controller: &ServerController,
    credentials: &ServerCredentials,
    container: DockerContainer,
    protocol: Protocol,
    path: &str,
) -> Result<String> {
    let raw = controller
        .get_text_file_from_container(credentials, container, path)
        .await?;
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return Err(Error::ConfigGeneration {
            protocol,
            message: format!("{path} is empty"),
        });
    }
    Ok(trimmed.to_string())
}

pub(crate) fn generation_error(protocol: Protocol, err: impl std::fmt::Display) -> Error {
    Error::ConfigGeneration {
        protocol,
        message: err.to_string(),
    }
}

// ==============================================================================
// Facade
// ==============================================================================

pub struct VpnConfigurator {
    controller: Arc<ServerController>,
}

impl VpnConfigurator {
    pub fn new(controller: Arc<ServerController>) -> Self {
        Self { controller }
    }

    pub fn controller(&self) -> &Arc<ServerController> {
        &self.controller
    }

    /// Generates the client config of `proto` and records the new client in
    /// the server's clients table. Failing to record it is only logged.
    pub async fn gen_vpn_protocol_config(
        &self,
        credentials: &ServerCredentials,
        container: DockerContainer,
        config: &ContainerConfig,
        proto: Protocol,
    ) -> Result<GeneratedConfig> {
        info!(%container, %proto, "generating client config");
        let generated = configurator_for(proto)
            .generate(&self.controller, credentials, container, config)
            .await?;

        if let Some(client_id) = &generated.client_id {
            if let Err(err) = self
                .controller
                .register_client(credentials, container, proto, client_id, None)
                .await
            {
                warn!(%container, %proto, error = %err, "could not record the new client");
            }
        }
        Ok(generated)
    }

    /// Fills the DNS placeholders of a generated config with the user's choice.
    pub fn process_config_with_local_settings(config: &str, primary_dns: &str, secondary_dns: &str) -> String {
        let mut vars = VarsList::new();
        vars.push("$PRIMARY_DNS", primary_dns)
            .push("$SECONDARY_DNS", secondary_dns);
        substitute_json(config, &vars)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{creds, FakeShell};

    #[test]
    fn local_settings_fill_dns_placeholders_inside_json() {
        let generated = r#"{"config":"dhcp-option DNS $PRIMARY_DNS\ndhcp-option DNS $SECONDARY_DNS"}"#;
        let processed = VpnConfigurator::process_config_with_local_settings(generated, "9.9.9.9", "149.112.112.112");
        let value: serde_json::Value = serde_json::from_str(&processed).unwrap();
        assert_eq!(
            value["config"],
            "dhcp-option DNS 9.9.9.9\ndhcp-option DNS 149.112.112.112"
        );
    }

    #[test]
    fn every_protocol_has_a_configurator() {
        for proto in [
            Protocol::OpenVpn,
            Protocol::ShadowSocks,
            Protocol::Cloak,
            Protocol::WireGuard,
            Protocol::Awg,
        ] {
            assert_eq!(configurator_for(proto).protocol(), proto);
        }
    }

    #[tokio::test]
    async fn empty_artifact_is_a_generation_error() {
        let shell = Arc::new(FakeShell::new());
        shell.put_file("/opt/vpn-orchestrator/openvpn-shadowsocks/data/shadowsocks/shadowsocks.key", " \n");
        let ctl = ServerController::new(shell);

        let err = fetch_artifact(
            &ctl,
            &creds(),
            DockerContainer::ShadowSocks,
            Protocol::ShadowSocks,
            "/opt/vpn-orchestrator/shadowsocks/shadowsocks.key",
        )
        .await
        .unwrap_err();
        assert!(matches!(err, Error::ConfigGeneration { protocol: Protocol::ShadowSocks, .. }));
    }

    #[tokio::test]
    async fn missing_artifact_error_is_passed_through() {
        let shell = Arc::new(FakeShell::new());
        let ctl = ServerController::new(shell);

        let err = fetch_artifact(
            &ctl,
            &creds(),
            DockerContainer::Cloak,
            Protocol::Cloak,
            "/opt/vpn-orchestrator/cloak/cloak_public.key",
        )
        .await
        .unwrap_err();
        assert_eq!(err.stage(), Some(crate::provision::Stage::FileTransfer));
    }
}
