// src/provision/reinstall.rs

use std::net::Ipv4Addr;

use crate::containers::{ContainerConfig, DockerContainer, Protocol, ProtocolConfig, TransportProto};

/// True when moving `container` from `old` to `new` needs the container rebuilt.
///
/// Anything that changes what the container publishes or how its network is
/// laid out (port, transport, subnet) forces a reinstall. Ciphers, hashes, the
/// masquerade site, MTU and junk parameters are applied by reconfiguring.
pub fn is_reinstall_required(
    container: DockerContainer,
    old: &ContainerConfig,
    new: &ContainerConfig,
) -> bool {
    container.protocols().iter().any(|&proto| {
        let before = old.protocol(proto);
        let after = new.protocol(proto);
        network_shape(&before, proto) != network_shape(&after, proto)
    })
}

fn network_shape(config: &ProtocolConfig, proto: Protocol) -> (u16, TransportProto, Ipv4Addr) {
    (
        config.port_or_default(proto),
        config.transport_or_default(proto),
        config.subnet_or_default(proto),
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn identical_configs_need_nothing() {
        let config = ContainerConfig::create_initial(DockerContainer::Cloak, None, None);
        assert!(!is_reinstall_required(DockerContainer::Cloak, &config, &config.clone()));
    }

    #[test]
    fn explicit_default_equals_unset() {
        let old = ContainerConfig::new(DockerContainer::WireGuard);
        let mut new = old.clone();
        new.protocol_mut(Protocol::WireGuard).port = Some(51820);
        assert!(!is_reinstall_required(DockerContainer::WireGuard, &old, &new));
    }

    #[test]
    fn transport_change_on_an_inner_protocol_reinstalls() {
        let old = ContainerConfig::create_initial(DockerContainer::ShadowSocks, None, None);
        let mut new = old.clone();
        new.protocol_mut(Protocol::OpenVpn).transport_proto = Some(TransportProto::Udp);
        assert!(is_reinstall_required(DockerContainer::ShadowSocks, &old, &new));
    }

    #[test]
    fn subnet_change_reinstalls() {
        let old = ContainerConfig::create_initial(DockerContainer::Awg, None, None);
        let mut new = old.clone();
        new.protocol_mut(Protocol::Awg).subnet_address = Some("10.9.0.0".parse().unwrap());
        assert!(is_reinstall_required(DockerContainer::Awg, &old, &new));
    }

    #[test]
    fn cipher_mtu_and_site_are_live_updates() {
        let old = ContainerConfig::create_initial(DockerContainer::Cloak, None, None);
        let mut new = old.clone();
        new.protocol_mut(Protocol::OpenVpn).cipher = Some("AES-128-GCM".into());
        new.protocol_mut(Protocol::Cloak).site = Some("example.org".into());
        new.protocol_mut(Protocol::OpenVpn).mtu = Some(1400);
        assert!(!is_reinstall_required(DockerContainer::Cloak, &old, &new));
    }
}
