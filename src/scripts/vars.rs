// src/scripts/vars.rs
//
// Placeholder substitution for server scripts and client templates.

use tracing::warn;

use crate::containers::{
    defaults, ContainerConfig, DockerContainer, JunkParams, Protocol, REMOTE_ROOT,
};
use crate::credentials::ServerCredentials;

pub const HOST_MAPPING_FILE: &str = "/opt/vpn-orchestrator/containers.json";

/// Ordered placeholder → value list. Names always carry the leading `$`.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct VarsList {
    entries: Vec<(String, String)>,
}

impl VarsList {
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends a placeholder. A name that is already present keeps its first value.
    pub fn push(&mut self, name: impl Into<String>, value: impl Into<String>) -> &mut Self {
        let mut name = name.into();
        if !name.starts_with('$') {
            name.insert(0, '$');
        }
        if self.get(&name).is_some() {
            warn!(placeholder = %name, "duplicate placeholder ignored, keeping first value");
            return self;
        }
        self.entries.push((name, value.into()));
        self
    }

    pub fn extend(&mut self, other: VarsList) -> &mut Self {
        for (name, value) in other.entries {
            self.push(name, value);
        }
        self
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        let name = name.strip_prefix('$').unwrap_or(name);
        self.entries
            .iter()
            .find(|(n, _)| &n[1..] == name)
            .map(|(_, v)| v.as_str())
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.entries.iter().map(|(n, v)| (n.as_str(), v.as_str()))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn escaped_for_json(&self) -> VarsList {
        let entries = self
            .entries
            .iter()
            .map(|(name, value)| (name.clone(), escape_json(value)))
            .collect();
        VarsList { entries }
    }
}

fn escape_json(value: &str) -> String {
    let quoted = serde_json::Value::String(value.to_string()).to_string();
    quoted[1..quoted.len() - 1].to_string()
}

fn continues_identifier(rest: &str) -> bool {
    rest.chars()
        .next()
        .is_some_and(|c| c.is_ascii_alphanumeric() || c == '_')
}

/// Replaces every placeholder of `vars` found in `text` in a single pass.
///
/// At each `$` the longest matching name wins and only whole identifiers match,
/// so `$WIREGUARD_PORT` never clobbers `$WIREGUARD_PORT_RANGE`. Inserted values
/// are not scanned again and unknown placeholders are left as they are.
pub fn substitute(text: &str, vars: &VarsList) -> String {
    let mut names: Vec<&(String, String)> = vars.entries.iter().collect();
    names.sort_by_key(|(name, _)| std::cmp::Reverse(name.len()));

    let mut out = String::with_capacity(text.len());
    let mut rest = text;

    while let Some(pos) = rest.find('$') {
        out.push_str(&rest[..pos]);
        let tail = &rest[pos..];

        let hit = names.iter().find(|(name, _)| {
            tail.starts_with(name.as_str()) && !continues_identifier(&tail[name.len()..])
        });

        match hit {
            Some((name, value)) => {
                out.push_str(value);
                rest = &tail[name.len()..];
            }
            None => {
                out.push('$');
                rest = &tail[1..];
            }
        }
    }

    out.push_str(rest);
    out
}

/// Same as [`substitute`] but escapes values so they can sit inside a JSON string literal.
pub fn substitute_json(text: &str, vars: &VarsList) -> String {
    substitute(text, &vars.escaped_for_json())
}

// ==============================================================================
// Variable builder shared by the provisioning controller and the configurators
// ==============================================================================

fn netmask(cidr: u8) -> String {
    let bits: u32 = if cidr == 0 { 0 } else { u32::MAX << (32 - u32::from(cidr.min(32))) };
    std::net::Ipv4Addr::from(bits).to_string()
}

/// Builds every placeholder a script for `container` may reference.
///
/// General host variables are unprefixed; protocol variables carry their
/// protocol's prefix so a chained container can hold several protocols at once.
pub fn gen_vars_for_script(
    credentials: &ServerCredentials,
    container: Option<DockerContainer>,
    config: Option<&ContainerConfig>,
) -> VarsList {
    let mut vars = VarsList::new();
    vars.push("$REMOTE_HOST", credentials.host.as_str())
        .push("$HOST_MAPPING_FILE", HOST_MAPPING_FILE)
        .push("$REMOTE_ROOT", REMOTE_ROOT);

    let Some(container) = container else {
        return vars;
    };

    let empty = ContainerConfig::new(container);
    let config = config.unwrap_or(&empty);

    vars.push("$CONTAINER_NAME", container.remote_name())
        .push("$DOCKERFILE_FOLDER", container.host_folder())
        .push("$CONTAINER_VOLUME", container.host_volume());

    let (port, transport) = config.published_endpoint();
    vars.push("$SERVER_PORT_DEFAULT", port.to_string())
        .push("$SERVER_TRANSPORT_DEFAULT", transport.as_str());

    for &proto in container.protocols() {
        let block = config.protocol(proto);
        let port = block.port_or_default(proto).to_string();
        let transport = block.transport_or_default(proto).as_str();

        match proto {
            Protocol::OpenVpn => {
                vars.push("$OPENVPN_PORT", port)
                    .push("$OPENVPN_TRANSPORT_PROTO", transport)
                    .push(
                        "$OPENVPN_CIPHER",
                        block.cipher.as_deref().unwrap_or(defaults::OPENVPN_CIPHER),
                    )
                    .push(
                        "$OPENVPN_HASH",
                        block.hash.as_deref().unwrap_or(defaults::OPENVPN_HASH),
                    )
                    .push("$OPENVPN_SUBNET_IP", block.subnet_or_default(proto).to_string())
                    .push("$OPENVPN_SUBNET_CIDR", defaults::SUBNET_CIDR.to_string())
                    .push("$OPENVPN_SUBNET_MASK", netmask(defaults::SUBNET_CIDR));
            }
            Protocol::ShadowSocks => {
                vars.push("$SHADOWSOCKS_SERVER_PORT", port)
                    .push(
                        "$SHADOWSOCKS_LOCAL_PORT",
                        defaults::SHADOWSOCKS_LOCAL_PORT.to_string(),
                    )
                    .push(
                        "$SHADOWSOCKS_CIPHER",
                        block.cipher.as_deref().unwrap_or(defaults::SHADOWSOCKS_CIPHER),
                    );
            }
            Protocol::Cloak => {
                vars.push("$CLOAK_SERVER_PORT", port)
                    .push(
                        "$CLOAK_FAKE_WEB_SITE_ADDRESS",
                        block.site.as_deref().unwrap_or(defaults::CLOAK_SITE),
                    );
            }
            Protocol::WireGuard | Protocol::Awg => {
                let prefix = if proto == Protocol::Awg { "AWG" } else { "WIREGUARD" };
                vars.push(format!("${prefix}_SERVER_PORT"), port)
                    .push(
                        format!("${prefix}_SUBNET_IP"),
                        block.subnet_or_default(proto).to_string(),
                    )
                    .push(format!("${prefix}_SUBNET_CIDR"), defaults::SUBNET_CIDR.to_string())
                    .push(format!("${prefix}_SUBNET_MASK"), netmask(defaults::SUBNET_CIDR))
                    .push(format!("${prefix}_MTU"), block.mtu_or_default(proto).to_string());

                if proto == Protocol::Awg {
                    push_junk_vars(&mut vars, &block.junk.unwrap_or_default());
                }
            }
        }
    }

    vars
}

fn push_junk_vars(vars: &mut VarsList, junk: &JunkParams) {
    vars.push("$AWG_JUNK_PACKET_COUNT", junk.junk_packet_count.to_string())
        .push("$AWG_JUNK_PACKET_MIN_SIZE", junk.junk_packet_min_size.to_string())
        .push("$AWG_JUNK_PACKET_MAX_SIZE", junk.junk_packet_max_size.to_string())
        .push("$AWG_INIT_PACKET_JUNK_SIZE", junk.init_packet_junk_size.to_string())
        .push("$AWG_RESPONSE_PACKET_JUNK_SIZE", junk.response_packet_junk_size.to_string())
        .push("$AWG_INIT_PACKET_MAGIC_HEADER", junk.init_packet_magic_header.to_string())
        .push("$AWG_RESPONSE_PACKET_MAGIC_HEADER", junk.response_packet_magic_header.to_string())
        .push("$AWG_UNDERLOAD_PACKET_MAGIC_HEADER", junk.underload_packet_magic_header.to_string())
        .push("$AWG_TRANSPORT_PACKET_MAGIC_HEADER", junk.transport_packet_magic_header.to_string());
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::containers::TransportProto;
    use crate::credentials::{ServerCredentials, ServerSecret};
    use crate::sys::secrets::SecretText;

    fn creds() -> ServerCredentials {
        ServerCredentials {
            host: "203.0.113.7".into(),
            port: 22,
            login: "root".into(),
            secret: ServerSecret::Password(SecretText::new("hunter2".into())),
        }
    }

    #[test]
    fn longer_placeholder_wins_over_its_prefix() {
        let mut vars = VarsList::new();
        vars.push("$PORT", "1").push("$PORT_RANGE", "2");
        assert_eq!(substitute("$PORT $PORT_RANGE", &vars), "1 2");
    }

    #[test]
    fn partial_identifier_is_not_replaced() {
        let mut vars = VarsList::new();
        vars.push("$PORT", "1");
        assert_eq!(substitute("$PORTS $PORT/udp", &vars), "$PORTS 1/udp");
    }

    #[test]
    fn unknown_placeholders_are_left_untouched() {
        let vars = VarsList::new();
        assert_eq!(substitute("echo $HOME $1", &vars), "echo $HOME $1");
    }

    #[test]
    fn substituted_values_are_not_rescanned() {
        let mut vars = VarsList::new();
        vars.push("$A", "$B").push("$B", "boom");
        assert_eq!(substitute("$A", &vars), "$B");
    }

    #[test]
    fn duplicate_placeholder_keeps_first_value() {
        let mut vars = VarsList::new();
        vars.push("$X", "first").push("X", "second");
        assert_eq!(vars.len(), 1);
        assert_eq!(vars.get("$X"), Some("first"));
    }

    #[test]
    fn json_substitution_escapes_values() {
        let mut vars = VarsList::new();
        vars.push("$CERT", "line1\nline\"2\"\\");
        let out = substitute_json(r#"{"config":"$CERT"}"#, &vars);
        let parsed: serde_json::Value = serde_json::from_str(&out).unwrap();
        assert_eq!(parsed["config"], "line1\nline\"2\"\\");
    }

    #[test]
    fn general_scripts_only_get_host_variables() {
        let vars = gen_vars_for_script(&creds(), None, None);
        assert_eq!(vars.get("$REMOTE_HOST"), Some("203.0.113.7"));
        assert!(vars.get("$CONTAINER_NAME").is_none());
    }

    #[test]
    fn chained_container_gets_namespaced_variables_for_every_layer() {
        let config = ContainerConfig::create_initial(
            DockerContainer::Cloak,
            Some(8443),
            Some(TransportProto::Tcp),
        );
        let vars = gen_vars_for_script(&creds(), Some(DockerContainer::Cloak), Some(&config));

        assert_eq!(vars.get("$CONTAINER_NAME"), Some("vpnorch-openvpn-cloak"));
        assert_eq!(vars.get("$CLOAK_SERVER_PORT"), Some("8443"));
        assert_eq!(vars.get("$SHADOWSOCKS_SERVER_PORT"), Some("6789"));
        assert_eq!(vars.get("$OPENVPN_PORT"), Some("1194"));
        assert_eq!(vars.get("$OPENVPN_TRANSPORT_PROTO"), Some("tcp"));
        assert_eq!(vars.get("$SERVER_PORT_DEFAULT"), Some("8443"));
        assert_eq!(vars.get("$OPENVPN_SUBNET_MASK"), Some("255.255.255.0"));
    }

    #[test]
    fn awg_variables_carry_junk_parameters() {
        let config = ContainerConfig::create_initial(DockerContainer::Awg, None, None);
        let junk = config.protocol(Protocol::Awg).junk.unwrap();
        let vars = gen_vars_for_script(&creds(), Some(DockerContainer::Awg), Some(&config));

        assert_eq!(vars.get("$AWG_SERVER_PORT"), Some("55424"));
        assert_eq!(
            vars.get("$AWG_JUNK_PACKET_COUNT"),
            Some(junk.junk_packet_count.to_string().as_str())
        );
        assert!(vars.get("$WIREGUARD_SERVER_PORT").is_none());
    }
}
