// src/scripts/mod.rs
//
// Server-side scripts and client templates, embedded at compile time.

pub mod vars;

use std::fmt;

use crate::containers::DockerContainer;
use crate::error::{Error, Result};

pub use vars::{gen_vars_for_script, substitute, substitute_json, VarsList};

/// Every script or template the registry knows about.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ScriptKind {
    // Shared: same text for every container.
    PrepareHost,
    InstallDocker,
    BuildContainer,
    ConfigureContainerRunner,
    RestartContainer,
    RemoveContainer,
    RemoveAllContainers,
    SetupHostFirewall,
    CheckConnection,
    CheckServerIsBusy,
    CheckUserInSudo,
    CheckPortInUse,
    ListContainers,
    IssueOpenVpnClient,
    SyncWireGuardPeers,

    // Per container.
    Dockerfile,
    RunContainer,
    ConfigureContainer,
    ContainerStartup,
    OpenVpnTemplate,
    WireGuardTemplate,
    ShadowSocksTemplate,
    CloakTemplate,
}

impl ScriptKind {
    pub fn is_shared(self) -> bool {
        !matches!(
            self,
            ScriptKind::Dockerfile
                | ScriptKind::RunContainer
                | ScriptKind::ConfigureContainer
                | ScriptKind::ContainerStartup
                | ScriptKind::OpenVpnTemplate
                | ScriptKind::WireGuardTemplate
                | ScriptKind::ShadowSocksTemplate
                | ScriptKind::CloakTemplate
        )
    }

    /// File name inside `server_scripts/` (or the container's folder).
    pub fn file_name(self) -> &'static str {
        match self {
            ScriptKind::PrepareHost => "prepare_host.sh",
            ScriptKind::InstallDocker => "install_docker.sh",
            ScriptKind::BuildContainer => "build_container.sh",
            ScriptKind::ConfigureContainerRunner => "configure_container_runner.sh",
            ScriptKind::RestartContainer => "restart_container.sh",
            ScriptKind::RemoveContainer => "remove_container.sh",
            ScriptKind::RemoveAllContainers => "remove_all_containers.sh",
            ScriptKind::SetupHostFirewall => "setup_host_firewall.sh",
            ScriptKind::CheckConnection => "check_connection.sh",
            ScriptKind::CheckServerIsBusy => "check_server_is_busy.sh",
            ScriptKind::CheckUserInSudo => "check_user_in_sudo.sh",
            ScriptKind::CheckPortInUse => "check_port_in_use.sh",
            ScriptKind::ListContainers => "list_containers.sh",
            ScriptKind::IssueOpenVpnClient => "issue_openvpn_client.sh",
            ScriptKind::SyncWireGuardPeers => "sync_wireguard_peers.sh",
            ScriptKind::Dockerfile => "Dockerfile",
            ScriptKind::RunContainer => "run_container.sh",
            ScriptKind::ConfigureContainer => "configure_container.sh",
            ScriptKind::ContainerStartup => "start.sh",
            ScriptKind::OpenVpnTemplate => "template.ovpn",
            ScriptKind::WireGuardTemplate => "template.conf",
            ScriptKind::ShadowSocksTemplate => "template_shadowsocks.json",
            ScriptKind::CloakTemplate => "template_cloak.json",
        }
    }
}

impl fmt::Display for ScriptKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.file_name())
    }
}

macro_rules! embedded {
    ($path:literal) => {
        include_str!(concat!(env!("CARGO_MANIFEST_DIR"), "/server_scripts/", $path))
    };
}

fn shared_script(kind: ScriptKind) -> Option<&'static str> {
    let text = match kind {
        ScriptKind::PrepareHost => embedded!("prepare_host.sh"),
        ScriptKind::InstallDocker => embedded!("install_docker.sh"),
        ScriptKind::BuildContainer => embedded!("build_container.sh"),
        ScriptKind::ConfigureContainerRunner => embedded!("configure_container_runner.sh"),
        ScriptKind::RestartContainer => embedded!("restart_container.sh"),
        ScriptKind::RemoveContainer => embedded!("remove_container.sh"),
        ScriptKind::RemoveAllContainers => embedded!("remove_all_containers.sh"),
        ScriptKind::SetupHostFirewall => embedded!("setup_host_firewall.sh"),
        ScriptKind::CheckConnection => embedded!("check_connection.sh"),
        ScriptKind::CheckServerIsBusy => embedded!("check_server_is_busy.sh"),
        ScriptKind::CheckUserInSudo => embedded!("check_user_in_sudo.sh"),
        ScriptKind::CheckPortInUse => embedded!("check_port_in_use.sh"),
        ScriptKind::ListContainers => embedded!("list_containers.sh"),
        ScriptKind::IssueOpenVpnClient => embedded!("issue_openvpn_client.sh"),
        ScriptKind::SyncWireGuardPeers => embedded!("sync_wireguard_peers.sh"),
        _ => return None,
    };
    Some(text)
}

fn container_script(kind: ScriptKind, container: DockerContainer) -> Option<&'static str> {
    use DockerContainer::*;
    use ScriptKind::*;

    let text = match (container, kind) {
        (OpenVpn, Dockerfile) => embedded!("openvpn/Dockerfile"),
        (OpenVpn, RunContainer) => embedded!("openvpn/run_container.sh"),
        (OpenVpn, ConfigureContainer) => embedded!("openvpn/configure_container.sh"),
        (OpenVpn, ContainerStartup) => embedded!("openvpn/start.sh"),
        (OpenVpn, OpenVpnTemplate) => embedded!("openvpn/template.ovpn"),

        (ShadowSocks, Dockerfile) => embedded!("openvpn_shadowsocks/Dockerfile"),
        (ShadowSocks, RunContainer) => embedded!("openvpn_shadowsocks/run_container.sh"),
        (ShadowSocks, ConfigureContainer) => embedded!("openvpn_shadowsocks/configure_container.sh"),
        (ShadowSocks, ContainerStartup) => embedded!("openvpn_shadowsocks/start.sh"),
        (ShadowSocks, OpenVpnTemplate) => embedded!("openvpn_shadowsocks/template.ovpn"),
        (ShadowSocks, ShadowSocksTemplate) => embedded!("openvpn_shadowsocks/template_shadowsocks.json"),

        (Cloak, Dockerfile) => embedded!("openvpn_cloak/Dockerfile"),
        (Cloak, RunContainer) => embedded!("openvpn_cloak/run_container.sh"),
        (Cloak, ConfigureContainer) => embedded!("openvpn_cloak/configure_container.sh"),
        (Cloak, ContainerStartup) => embedded!("openvpn_cloak/start.sh"),
        (Cloak, OpenVpnTemplate) => embedded!("openvpn_cloak/template.ovpn"),
        (Cloak, ShadowSocksTemplate) => embedded!("openvpn_cloak/template_shadowsocks.json"),
        (Cloak, CloakTemplate) => embedded!("openvpn_cloak/template_cloak.json"),

        (WireGuard, Dockerfile) => embedded!("wireguard/Dockerfile"),
        (WireGuard, RunContainer) => embedded!("wireguard/run_container.sh"),
        (WireGuard, ConfigureContainer) => embedded!("wireguard/configure_container.sh"),
        (WireGuard, ContainerStartup) => embedded!("wireguard/start.sh"),
        (WireGuard, WireGuardTemplate) => embedded!("wireguard/template.conf"),

        (Awg, Dockerfile) => embedded!("awg/Dockerfile"),
        (Awg, RunContainer) => embedded!("awg/run_container.sh"),
        (Awg, ConfigureContainer) => embedded!("awg/configure_container.sh"),
        (Awg, ContainerStartup) => embedded!("awg/start.sh"),
        (Awg, WireGuardTemplate) => embedded!("awg/template.conf"),

        _ => return None,
    };
    Some(text)
}

/// Raw text of a script. Shared scripts ignore `container`; per-container
/// scripts need one and fail with `ScriptNotFound` when that container has none.
pub fn script_data(kind: ScriptKind, container: Option<DockerContainer>) -> Result<&'static str> {
    let found = if kind.is_shared() {
        shared_script(kind)
    } else {
        container.and_then(|c| container_script(kind, c))
    };

    found.ok_or(Error::ScriptNotFound {
        name: kind.file_name(),
        container,
    })
}
