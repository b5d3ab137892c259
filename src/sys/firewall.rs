// src/sys/firewall.rs
//
// 🛡️ Single responsibility: turns firewall policies into host iptables rules.
// 🛡️ Zero-Trust: every policy is validated before it is rendered into a script.

use tracing::info;

use crate::containers::ContainerConfig;
use crate::error::{Error, Result};
use crate::sys::traits::FirewallPolicy;

fn rule_args(policy: &FirewallPolicy) -> String {
    format!(
        "INPUT -p {} --dport {} -j ACCEPT",
        policy.transport.as_str(),
        policy.port
    )
}

/// Renders one policy as an idempotent shell line: the rule is only appended
/// when `iptables -C` cannot find it already.
pub fn render_rule(policy: &FirewallPolicy) -> Result<String> {
    // Port 0 is reserved; the upper bound is enforced by u16.
    if policy.port == 0 {
        return Err(Error::InvalidConfig("port 0 is reserved and cannot be opened".into()));
    }
    let args = rule_args(policy);
    Ok(format!("sudo iptables -C {args} 2>/dev/null || sudo iptables -A {args}"))
}

/// Policies a running container needs: its published port, open to everyone.
pub fn policies_for(config: &ContainerConfig) -> Vec<FirewallPolicy> {
    let (port, transport) = config.published_endpoint();
    vec![FirewallPolicy { port, transport }]
}

/// Script applying every policy in order.
pub fn render_script(policies: &[FirewallPolicy]) -> Result<String> {
    let mut lines = Vec::with_capacity(policies.len());
    for policy in policies {
        lines.push(render_rule(policy)?);
        info!("🛡️ Firewall: ACCEPT port {}/{}", policy.port, policy.transport);
    }
    lines.push(String::new());
    Ok(lines.join("\n"))
}

// ==============================================================================
// 🛡️ Unit Tests: Firewall Rule Rendering
// ==============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::containers::{DockerContainer, TransportProto};

    fn open(port: u16, transport: TransportProto) -> FirewallPolicy {
        FirewallPolicy { port, transport }
    }

    #[test]
    fn udp_port_renders_check_then_append() {
        let rule = render_rule(&open(51820, TransportProto::Udp)).unwrap();
        assert_eq!(
            rule,
            "sudo iptables -C INPUT -p udp --dport 51820 -j ACCEPT 2>/dev/null \
             || sudo iptables -A INPUT -p udp --dport 51820 -j ACCEPT"
        );
    }

    #[test]
    fn port_zero_is_rejected() {
        assert!(matches!(
            render_rule(&open(0, TransportProto::Tcp)),
            Err(Error::InvalidConfig(_))
        ));
    }

    #[test]
    fn container_policy_opens_the_published_endpoint() {
        let config = ContainerConfig::create_initial(DockerContainer::Cloak, Some(8443), None);
        let policies = policies_for(&config);
        assert_eq!(policies, vec![open(8443, TransportProto::Tcp)]);

        let script = render_script(&policies).unwrap();
        assert!(script.contains("--dport 8443 -j ACCEPT"));
        assert!(script.ends_with('\n'));
    }

    #[test]
    fn every_policy_gets_its_own_line() {
        let script = render_script(&[open(1194, TransportProto::Udp), open(443, TransportProto::Tcp)]).unwrap();
        let lines: Vec<_> = script.lines().collect();
        assert_eq!(lines.len(), 2);
        assert!(lines[0].contains("-p udp --dport 1194"));
        assert!(lines[1].contains("-p tcp --dport 443"));
    }
}
