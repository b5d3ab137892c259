// src/configurators/shadowsocks.rs

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::containers::{ContainerConfig, DockerContainer, Protocol};
use crate::credentials::ServerCredentials;
use crate::error::Result;
use crate::provision::ServerController;
use crate::scripts::{gen_vars_for_script, script_data, substitute_json, ScriptKind};

use super::{fetch_artifact, generation_error, Configurator, GeneratedConfig};

/// Client document for a shadowsocks local tunnel. Ports stay strings, as the
/// template renders them.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ShadowSocksConfigData {
    pub server: String,
    pub server_port: String,
    pub local_port: String,
    pub password: String,
    pub timeout: u32,
    pub method: String,
}

pub struct ShadowSocksConfigurator;

#[async_trait]
impl Configurator for ShadowSocksConfigurator {
    fn protocol(&self) -> Protocol {
        Protocol::ShadowSocks
    }

    async fn generate(
        &self,
        controller: &ServerController,
        credentials: &ServerCredentials,
        container: DockerContainer,
        config: &ContainerConfig,
    ) -> Result<GeneratedConfig> {
        let proto = Protocol::ShadowSocks;
        let password = fetch_artifact(
            controller,
            credentials,
            container,
            proto,
            &format!("{}/shadowsocks.key", proto.container_dir()),
        )
        .await?;

        let mut vars = gen_vars_for_script(credentials, Some(container), Some(config));
        vars.push("$SHADOWSOCKS_PASSWORD", password);
        let rendered = substitute_json(script_data(ScriptKind::ShadowSocksTemplate, Some(container))?, &vars);

        let data: ShadowSocksConfigData =
            serde_json::from_str(&rendered).map_err(|e| generation_error(proto, e))?;

        Ok(GeneratedConfig {
            protocol: proto,
            text: serde_json::to_string(&data)?,
            client_id: None,
        })
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::testing::{creds, FakeShell};

    #[tokio::test]
    async fn renders_the_local_tunnel_document() {
        let shell = Arc::new(FakeShell::new());
        shell.put_file(
            "/opt/vpn-orchestrator/openvpn-shadowsocks/data/shadowsocks/shadowsocks.key",
            "p\"ss\\word\n",
        );
        let ctl = ServerController::new(shell);
        let config = ContainerConfig::create_initial(DockerContainer::ShadowSocks, Some(8388), None);

        let generated = ShadowSocksConfigurator
            .generate(&ctl, &creds(), DockerContainer::ShadowSocks, &config)
            .await
            .unwrap();

        let data: ShadowSocksConfigData = serde_json::from_str(&generated.text).unwrap();
        assert_eq!(
            data,
            ShadowSocksConfigData {
                server: "203.0.113.7".into(),
                server_port: "8388".into(),
                local_port: "8585".into(),
                password: "p\"ss\\word".into(),
                timeout: 60,
                method: "chacha20-ietf-poly1305".into(),
            }
        );
        assert_eq!(generated.client_id, None);
    }
}
