// src/vpn/tunnel.rs
//
// Tunnel implementations. WireGuard-family tunnels are brought up by the
// daemon; OpenVPN and its obfuscation chains run as local processes.

use std::io::Write;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::{Arc, LazyLock, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use nix::sys::signal::{self, Signal};
use nix::unistd::Pid;
use regex::Regex;
use tempfile::NamedTempFile;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::containers::Protocol;
use crate::daemon::{ActivateParams, DaemonEvent, DaemonHandle, DaemonRequest};
use crate::error::{Error, Result};
use crate::sys::traits::{Gateways, TunnelBackend, TunnelEvent};

use super::configuration::VpnConfiguration;
use super::ConnectionState;

const STATUS_INTERVAL: Duration = Duration::from_secs(1);
const STOP_GRACE: Duration = Duration::from_secs(3);
const CONFIG_PLACEHOLDER: &str = "{config}";

/// Picks and builds the tunnel for a configuration.
pub trait TunnelFactory: Send + Sync {
    fn create(&self, config: &VpnConfiguration) -> Result<Box<dyn TunnelBackend>>;
}

#[derive(Debug, Clone)]
pub struct TunnelBinaries {
    pub openvpn: PathBuf,
    pub ss_tunnel: PathBuf,
    pub ck_client: PathBuf,
}

impl Default for TunnelBinaries {
    fn default() -> Self {
        Self {
            openvpn: PathBuf::from("openvpn"),
            ss_tunnel: PathBuf::from("ss-tunnel"),
            ck_client: PathBuf::from("ck-client"),
        }
    }
}

pub struct DefaultTunnelFactory {
    daemon: DaemonHandle,
    binaries: TunnelBinaries,
}

impl DefaultTunnelFactory {
    pub fn new(daemon: DaemonHandle, binaries: TunnelBinaries) -> Self {
        Self { daemon, binaries }
    }
}

impl TunnelFactory for DefaultTunnelFactory {
    fn create(&self, config: &VpnConfiguration) -> Result<Box<dyn TunnelBackend>> {
        if config.vpnproto.is_wireguard_family() {
            Ok(Box::new(DaemonTunnel::new(self.daemon.clone(), config)?))
        } else {
            Ok(Box::new(ProcessTunnel::new(config, &self.binaries)?))
        }
    }
}

// ==============================================================================
// 1. Daemon-driven tunnels (WireGuard, AWG)
// ==============================================================================

pub struct DaemonTunnel {
    daemon: DaemonHandle,
    params: ActivateParams,
    gateways: Gateways,
    forwarder: Option<JoinHandle<()>>,
}

impl DaemonTunnel {
    pub fn new(daemon: DaemonHandle, config: &VpnConfiguration) -> Result<Self> {
        let data = config
            .wireguard_data()
            .ok_or_else(|| Error::ProtocolStart(format!("no {} block in the configuration", config.vpnproto)))?;
        Ok(Self {
            daemon,
            params: ActivateParams::from_config(data, &config.dns1)?,
            // The daemon owns the physical route; an empty gateway leaves the choice to it.
            gateways: Gateways {
                vpn_gateway: data.client_ip.clone(),
                route_gateway: String::new(),
            },
            forwarder: None,
        })
    }
}

/// Tunnel events a daemon event stands for.
fn translate(event: DaemonEvent, gateways: &Gateways) -> Vec<TunnelEvent> {
    match event {
        DaemonEvent::Connected { .. } => vec![
            TunnelEvent::Gateways(gateways.clone()),
            TunnelEvent::StateChanged(ConnectionState::Connected),
        ],
        DaemonEvent::Disconnected => vec![TunnelEvent::StateChanged(ConnectionState::Disconnected)],
        DaemonEvent::BackendFailure | DaemonEvent::TransportClosed => {
            vec![TunnelEvent::StateChanged(ConnectionState::Error)]
        }
        DaemonEvent::Status(report) => vec![TunnelEvent::Bytes {
            received: report.rx_bytes,
            sent: report.tx_bytes,
        }],
        _ => Vec::new(),
    }
}

async fn forward_daemon_events(
    daemon: DaemonHandle,
    mut daemon_events: broadcast::Receiver<DaemonEvent>,
    gateways: Gateways,
    events: mpsc::UnboundedSender<TunnelEvent>,
) {
    let mut status = tokio::time::interval(STATUS_INTERVAL);
    let mut connected = false;
    loop {
        tokio::select! {
            received = daemon_events.recv() => match received {
                Ok(event) => {
                    for translated in translate(event, &gateways) {
                        if let TunnelEvent::StateChanged(state) = &translated {
                            connected = *state == ConnectionState::Connected;
                        }
                        if events.send(translated).is_err() {
                            return;
                        }
                    }
                }
                Err(broadcast::error::RecvError::Lagged(missed)) => {
                    warn!(missed, "tunnel fell behind on daemon events");
                }
                Err(broadcast::error::RecvError::Closed) => return,
            },
            _ = status.tick(), if connected => {
                if let Err(err) = daemon.send(DaemonRequest::Status).await {
                    debug!(error = %err, "status poll skipped");
                }
            }
        }
    }
}

#[async_trait]
impl TunnelBackend for DaemonTunnel {
    async fn start(&mut self, events: mpsc::UnboundedSender<TunnelEvent>) -> Result<()> {
        let daemon_events = self.daemon.subscribe();
        let _ = events.send(TunnelEvent::StateChanged(ConnectionState::Connecting));

        info!(server = %self.params.server_ipv4_addr_in, "activating tunnel through the daemon");
        self.daemon
            .send(DaemonRequest::Activate(self.params.clone()))
            .await
            .map_err(|e| Error::ProtocolStart(e.to_string()))?;

        self.forwarder = Some(tokio::spawn(forward_daemon_events(
            self.daemon.clone(),
            daemon_events,
            self.gateways.clone(),
            events,
        )));
        Ok(())
    }

    async fn stop(&mut self) {
        // Deactivation is the orchestrator's call; here we only stop listening.
        if let Some(forwarder) = self.forwarder.take() {
            forwarder.abort();
        }
    }

    fn gateways(&self) -> Gateways {
        self.gateways.clone()
    }
}

// ==============================================================================
// 2. Local process chains (OpenVPN, OpenVPN over ShadowSocks / Cloak)
// ==============================================================================

/// One process of a chain, with the config file it reads.
#[derive(Debug, Clone, PartialEq)]
pub struct ProcessSpec {
    pub name: &'static str,
    pub program: PathBuf,
    /// `{config}` is replaced by the path of the written config file.
    pub args: Vec<String>,
    pub config: String,
}

/// Processes to start, outermost obfuscation layer first, OpenVPN last.
pub fn plan_processes(config: &VpnConfiguration, binaries: &TunnelBinaries) -> Result<Vec<ProcessSpec>> {
    let openvpn = config
        .openvpn
        .as_ref()
        .ok_or_else(|| Error::ProtocolStart("no openvpn block in the configuration".into()))?;
    let local = |port: &dyn std::fmt::Display| format!("127.0.0.1:{port}");

    let mut plan = Vec::new();
    match config.vpnproto {
        Protocol::Cloak => {
            let cloak = config
                .cloak
                .as_ref()
                .ok_or_else(|| Error::ProtocolStart("no cloak block in the configuration".into()))?;
            plan.push(ProcessSpec {
                name: "ck-client",
                program: binaries.ck_client.clone(),
                args: vec![
                    "-c".into(),
                    CONFIG_PLACEHOLDER.into(),
                    "-s".into(),
                    cloak.remote.clone(),
                    "-p".into(),
                    cloak.port.clone(),
                    "-l".into(),
                    openvpn.port.to_string(),
                ],
                config: serde_json::to_string(cloak)?,
            });
        }
        Protocol::ShadowSocks => {
            let ss = config
                .shadowsocks
                .as_ref()
                .ok_or_else(|| Error::ProtocolStart("no shadowsocks block in the configuration".into()))?;
            plan.push(ProcessSpec {
                name: "ss-tunnel",
                program: binaries.ss_tunnel.clone(),
                args: vec![
                    "-c".into(),
                    CONFIG_PLACEHOLDER.into(),
                    "-L".into(),
                    local(&openvpn.port),
                ],
                config: serde_json::to_string(ss)?,
            });
        }
        Protocol::OpenVpn => {}
        other => {
            return Err(Error::ProtocolStart(format!("{other} is not started as a local process")));
        }
    }

    plan.push(ProcessSpec {
        name: "openvpn",
        program: binaries.openvpn.clone(),
        args: vec!["--config".into(), CONFIG_PLACEHOLDER.into()],
        config: openvpn.config.clone(),
    });
    Ok(plan)
}

static ROUTE_GATEWAY: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?:ROUTE_GATEWAY|net_route_v4_best_gw result: via)\s+(\d{1,3}(?:\.\d{1,3}){3})")
        .expect("valid regex")
});
static VPN_GATEWAY: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"route-gateway\s+(\d{1,3}(?:\.\d{1,3}){3})").expect("valid regex"));

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OpenVpnSignal {
    RouteGateway(String),
    VpnGateway(String),
    Connected,
    Failed(String),
}

/// Interprets one line of OpenVPN's log output.
pub fn parse_openvpn_line(line: &str) -> Option<OpenVpnSignal> {
    if line.contains("Initialization Sequence Completed") {
        return Some(OpenVpnSignal::Connected);
    }
    if ["AUTH_FAILED", "Exiting due to fatal error", "Cannot resolve host"]
        .iter()
        .any(|marker| line.contains(marker))
    {
        return Some(OpenVpnSignal::Failed(line.trim().to_string()));
    }
    if let Some(c) = VPN_GATEWAY.captures(line) {
        return Some(OpenVpnSignal::VpnGateway(c[1].to_string()));
    }
    ROUTE_GATEWAY
        .captures(line)
        .map(|c| OpenVpnSignal::RouteGateway(c[1].to_string()))
}

pub struct ProcessTunnel {
    plan: Vec<ProcessSpec>,
    children: Vec<(&'static str, Child)>,
    files: Vec<NamedTempFile>,
    readers: Vec<JoinHandle<()>>,
    gateways: Arc<Mutex<Gateways>>,
}

impl ProcessTunnel {
    pub fn new(config: &VpnConfiguration, binaries: &TunnelBinaries) -> Result<Self> {
        Ok(Self {
            plan: plan_processes(config, binaries)?,
            children: Vec::new(),
            files: Vec::new(),
            readers: Vec::new(),
            gateways: Arc::new(Mutex::new(Gateways::default())),
        })
    }

    fn spawn(&mut self, spec: &ProcessSpec) -> Result<Child> {
        let mut file = NamedTempFile::new()?;
        file.write_all(spec.config.as_bytes())?;
        file.flush()?;
        let path = file.path().to_string_lossy().into_owned();
        self.files.push(file);

        let args: Vec<String> = spec
            .args
            .iter()
            .map(|arg| if arg == CONFIG_PLACEHOLDER { path.clone() } else { arg.clone() })
            .collect();

        debug!(name = spec.name, program = %spec.program.display(), "starting tunnel process");
        Command::new(&spec.program)
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| Error::ProtocolStart(format!("{}: {e}", spec.name)))
    }
}

fn lock(gateways: &Mutex<Gateways>) -> std::sync::MutexGuard<'_, Gateways> {
    gateways.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

fn follow_openvpn(
    child: &mut Child,
    gateways: Arc<Mutex<Gateways>>,
    events: mpsc::UnboundedSender<TunnelEvent>,
) -> Option<JoinHandle<()>> {
    let stdout = child.stdout.take()?;
    Some(tokio::spawn(async move {
        let mut lines = BufReader::new(stdout).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            debug!(target: "openvpn", "{line}");
            let Some(signal) = parse_openvpn_line(&line) else {
                continue;
            };
            match signal {
                OpenVpnSignal::RouteGateway(gw) => lock(&gateways).route_gateway = gw,
                OpenVpnSignal::VpnGateway(gw) => lock(&gateways).vpn_gateway = gw,
                OpenVpnSignal::Connected => {
                    let current = lock(&gateways).clone();
                    let _ = events.send(TunnelEvent::Gateways(current));
                    let _ = events.send(TunnelEvent::StateChanged(ConnectionState::Connected));
                }
                OpenVpnSignal::Failed(reason) => {
                    error!(%reason, "openvpn failed");
                    let _ = events.send(TunnelEvent::StateChanged(ConnectionState::Error));
                }
            }
        }
        let _ = events.send(TunnelEvent::StateChanged(ConnectionState::Disconnected));
    }))
}

fn drain_stderr(name: &'static str, child: &mut Child) -> Option<JoinHandle<()>> {
    let stderr = child.stderr.take()?;
    Some(tokio::spawn(async move {
        let mut lines = BufReader::new(stderr).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            debug!(process = name, "{line}");
        }
    }))
}

async fn terminate(name: &str, child: &mut Child) {
    if let Some(pid) = child.id() {
        if let Err(err) = signal::kill(Pid::from_raw(pid as i32), Signal::SIGTERM) {
            debug!(process = name, error = %err, "SIGTERM not delivered");
        }
    }
    if tokio::time::timeout(STOP_GRACE, child.wait()).await.is_err() {
        warn!(process = name, "did not exit after SIGTERM, killing");
        let _ = child.kill().await;
    }
}

#[async_trait]
impl TunnelBackend for ProcessTunnel {
    async fn start(&mut self, events: mpsc::UnboundedSender<TunnelEvent>) -> Result<()> {
        let _ = events.send(TunnelEvent::StateChanged(ConnectionState::Connecting));

        for spec in self.plan.clone() {
            let mut child = match self.spawn(&spec) {
                Ok(child) => child,
                Err(err) => {
                    self.stop().await;
                    return Err(err);
                }
            };
            if spec.name == "openvpn" {
                self.readers
                    .extend(follow_openvpn(&mut child, self.gateways.clone(), events.clone()));
            }
            self.readers.extend(drain_stderr(spec.name, &mut child));
            info!(process = spec.name, pid = ?child.id(), "tunnel process started");
            self.children.push((spec.name, child));
        }
        Ok(())
    }

    async fn stop(&mut self) {
        for reader in self.readers.drain(..) {
            reader.abort();
        }
        // OpenVPN first, then the layers under it.
        while let Some((name, mut child)) = self.children.pop() {
            terminate(name, &mut child).await;
        }
        self.files.clear();
    }

    fn gateways(&self) -> Gateways {
        lock(&self.gateways).clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::configurators::{CloakConfigData, OpenVpnConfigData, ShadowSocksConfigData};
    use crate::daemon::{DaemonConfig, StatusReport};

    fn openvpn_block(port: u16) -> OpenVpnConfigData {
        OpenVpnConfigData {
            config: "client\nremote 127.0.0.1 1194\n".into(),
            client_id: "c0ffee".into(),
            host_name: "203.0.113.7".into(),
            port,
            transport_proto: "tcp".into(),
        }
    }

    fn dns() -> (String, String) {
        ("1.1.1.1".into(), "1.0.0.1".into())
    }

    #[test]
    fn plain_openvpn_is_a_single_process() {
        let mut config = VpnConfiguration::new(Protocol::OpenVpn, "203.0.113.7", dns());
        config.openvpn = Some(openvpn_block(1194));
        let plan = plan_processes(&config, &TunnelBinaries::default()).unwrap();
        assert_eq!(plan.len(), 1);
        assert_eq!(plan[0].args, vec!["--config", "{config}"]);
        assert!(plan[0].config.starts_with("client"));
    }

    #[test]
    fn shadowsocks_chain_forwards_to_the_openvpn_port() {
        let mut config = VpnConfiguration::new(Protocol::ShadowSocks, "203.0.113.7", dns());
        config.openvpn = Some(openvpn_block(1194));
        config.shadowsocks = Some(ShadowSocksConfigData {
            server: "203.0.113.7".into(),
            server_port: "6789".into(),
            local_port: "8585".into(),
            password: "pw".into(),
            timeout: 60,
            method: "chacha20-ietf-poly1305".into(),
        });
        let plan = plan_processes(&config, &TunnelBinaries::default()).unwrap();
        let names: Vec<_> = plan.iter().map(|p| p.name).collect();
        assert_eq!(names, vec!["ss-tunnel", "openvpn"]);
        assert_eq!(plan[0].args[2..], ["-L".to_string(), "127.0.0.1:1194".to_string()]);
        let ss: serde_json::Value = serde_json::from_str(&plan[0].config).unwrap();
        assert_eq!(ss["local_port"], "8585");
    }

    #[test]
    fn cloak_chain_needs_its_block() {
        let mut config = VpnConfiguration::new(Protocol::Cloak, "203.0.113.7", dns());
        config.openvpn = Some(openvpn_block(1194));
        assert!(matches!(
            plan_processes(&config, &TunnelBinaries::default()),
            Err(Error::ProtocolStart(_))
        ));

        config.cloak = Some(CloakConfigData {
            transport: "direct".into(),
            proxy_method: "openvpn".into(),
            encryption_method: "aes-gcm".into(),
            uid: "uid".into(),
            public_key: "pk".into(),
            server_name: "example.org".into(),
            num_conn: 1,
            browser_sig: "chrome".into(),
            stream_timeout: 300,
            transport_proto: "tcp".into(),
            remote: "203.0.113.7".into(),
            port: "443".into(),
        });
        let plan = plan_processes(&config, &TunnelBinaries::default()).unwrap();
        assert_eq!(plan[0].name, "ck-client");
        assert_eq!(plan[0].args[2..], ["-s", "203.0.113.7", "-p", "443", "-l", "1194"].map(String::from));
    }

    #[test]
    fn openvpn_log_lines() {
        assert_eq!(
            parse_openvpn_line("2026-01-01 ROUTE_GATEWAY 192.168.1.1/255.255.255.0 IFACE=eth0"),
            Some(OpenVpnSignal::RouteGateway("192.168.1.1".into()))
        );
        assert_eq!(
            parse_openvpn_line("PUSH: Received control message: 'PUSH_REPLY,route-gateway 10.8.0.1,topology subnet'"),
            Some(OpenVpnSignal::VpnGateway("10.8.0.1".into()))
        );
        assert_eq!(
            parse_openvpn_line("Initialization Sequence Completed"),
            Some(OpenVpnSignal::Connected)
        );
        assert!(matches!(parse_openvpn_line("AUTH_FAILED"), Some(OpenVpnSignal::Failed(_))));
        assert_eq!(parse_openvpn_line("TUN/TAP device tun0 opened"), None);
    }

    #[test]
    fn daemon_events_become_tunnel_events() {
        let gw = Gateways {
            vpn_gateway: "10.8.1.2".into(),
            route_gateway: String::new(),
        };
        assert_eq!(
            translate(DaemonEvent::Connected { pubkey: "k".into() }, &gw),
            vec![TunnelEvent::Gateways(gw.clone()), TunnelEvent::StateChanged(ConnectionState::Connected)]
        );
        let report = StatusReport {
            connected: true,
            tx_bytes: 5,
            rx_bytes: 9,
            ..StatusReport::default()
        };
        assert_eq!(
            translate(DaemonEvent::Status(report), &gw),
            vec![TunnelEvent::Bytes { received: 9, sent: 5 }]
        );
        assert_eq!(
            translate(DaemonEvent::TransportClosed, &gw),
            vec![TunnelEvent::StateChanged(ConnectionState::Error)]
        );
        assert!(translate(DaemonEvent::Logs("x".into()), &gw).is_empty());
    }

    #[tokio::test]
    async fn factory_picks_the_daemon_for_wireguard() {
        let dir = tempfile::tempdir().unwrap();
        let daemon = DaemonHandle::spawn(DaemonConfig {
            socket_path: dir.path().join("d.socket"),
            fallback_socket_path: dir.path().join("f.socket"),
            ..DaemonConfig::default()
        });
        let factory = DefaultTunnelFactory::new(daemon, TunnelBinaries::default());

        let config = VpnConfiguration::new(Protocol::WireGuard, "203.0.113.7", dns());
        assert!(matches!(factory.create(&config), Err(Error::ProtocolStart(_))));

        let mut config = VpnConfiguration::new(Protocol::OpenVpn, "203.0.113.7", dns());
        config.openvpn = Some(openvpn_block(1194));
        assert!(factory.create(&config).is_ok());
    }
}
