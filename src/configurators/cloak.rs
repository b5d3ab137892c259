// src/configurators/cloak.rs

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::containers::{ContainerConfig, DockerContainer, Protocol};
use crate::credentials::ServerCredentials;
use crate::error::Result;
use crate::provision::ServerController;
use crate::scripts::{gen_vars_for_script, script_data, substitute_json, ScriptKind};

use super::{fetch_artifact, generation_error, Configurator, GeneratedConfig};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct CloakConfigData {
    pub transport: String,
    pub proxy_method: String,
    pub encryption_method: String,
    #[serde(rename = "UID")]
    pub uid: String,
    pub public_key: String,
    pub server_name: String,
    pub num_conn: u32,
    pub browser_sig: String,
    pub stream_timeout: u32,
    #[serde(rename = "transport_proto")]
    pub transport_proto: String,
    #[serde(rename = "remote")]
    pub remote: String,
    #[serde(rename = "port")]
    pub port: String,
}

pub struct CloakConfigurator;

#[async_trait]
impl Configurator for CloakConfigurator {
    fn protocol(&self) -> Protocol {
        Protocol::Cloak
    }

    async fn generate(
        &self,
        controller: &ServerController,
        credentials: &ServerCredentials,
        container: DockerContainer,
        config: &ContainerConfig,
    ) -> Result<GeneratedConfig> {
        let proto = Protocol::Cloak;
        let dir = proto.container_dir();
        let public_key =
            fetch_artifact(controller, credentials, container, proto, &format!("{dir}/cloak_public.key")).await?;
        let bypass_uid =
            fetch_artifact(controller, credentials, container, proto, &format!("{dir}/cloak_bypass_uid.key")).await?;

        let mut vars = gen_vars_for_script(credentials, Some(container), Some(config));
        vars.push("$CLOAK_PUBLIC_KEY", public_key)
            .push("$CLOAK_BYPASS_UID", bypass_uid);
        let rendered = substitute_json(script_data(ScriptKind::CloakTemplate, Some(container))?, &vars);

        let data: CloakConfigData =
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
    use crate::error::Error;
    use crate::testing::{creds, FakeShell};

    const DIR: &str = "/opt/vpn-orchestrator/openvpn-cloak/data/cloak";

    #[tokio::test]
    async fn renders_fixed_and_fetched_fields() {
        let shell = Arc::new(FakeShell::new());
        shell.put_file(&format!("{DIR}/cloak_public.key"), "PUBKEY=\n");
        shell.put_file(&format!("{DIR}/cloak_bypass_uid.key"), "\tUID==  \n");
        let ctl = ServerController::new(shell);
        let mut config = ContainerConfig::create_initial(DockerContainer::Cloak, None, None);
        config.protocol_mut(Protocol::Cloak).site = Some("example.org".into());

        let generated = CloakConfigurator
            .generate(&ctl, &creds(), DockerContainer::Cloak, &config)
            .await
            .unwrap();

        let value: serde_json::Value = serde_json::from_str(&generated.text).unwrap();
        assert_eq!(value["UID"], "UID==");
        assert_eq!(value["PublicKey"], "PUBKEY=");
        assert_eq!(value["ServerName"], "example.org");
        assert_eq!(value["ProxyMethod"], "openvpn");
        assert_eq!(value["NumConn"], 1);
        assert_eq!(value["transport_proto"], "tcp");
        assert_eq!(value["remote"], "203.0.113.7");
        assert_eq!(value["port"], "443");
    }

    #[tokio::test]
    async fn missing_bypass_uid_stops_generation() {
        let shell = Arc::new(FakeShell::new());
        shell.put_file(&format!("{DIR}/cloak_public.key"), "PUBKEY=\n");
        let ctl = ServerController::new(shell);
        let config = ContainerConfig::create_initial(DockerContainer::Cloak, None, None);

        let err = CloakConfigurator
            .generate(&ctl, &creds(), DockerContainer::Cloak, &config)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Command { .. }));
    }
}
