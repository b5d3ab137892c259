// src/vpn/connection.rs
//
// The connection orchestrator. It owns the connection state and the single
// active tunnel; tunnel events, site lookups and deferred work all arrive on
// one queue and are handled in order, so route changes reach the daemon
// serialized.

use std::collections::HashSet;
use std::net::Ipv4Addr;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::{broadcast, mpsc};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::configurators::VpnConfigurator;
use crate::containers::{CachedConfig, ContainerConfig, DockerContainer, Protocol};
use crate::credentials::ServerCredentials;
use crate::daemon::{DaemonControl, DaemonRequest};
use crate::error::Result;
use crate::sys::traits::{Gateways, SiteResolver, TunnelBackend, TunnelEvent};

use super::configuration::{ConfigVersion, RouteMode, VpnConfiguration};
use super::routes::{plan_sites, resolve_sites, SiteResolved};
use super::settings::Settings;
use super::tunnel::TunnelFactory;
use super::ConnectionState;

const EVENT_CAPACITY: usize = 128;
const CATCH_ALL: &str = "0.0.0.0";
const LOWER_HALF: &str = "0.0.0.0/1";
const UPPER_HALF: &str = "128.0.0.0/1";

#[derive(Debug, Clone)]
pub struct ConnectionConfig {
    /// How long a generated client config is reused before a fresh one is made.
    pub config_ttl: Duration,
    /// Wait between Connected and routing the include list.
    pub site_expansion_delay: Duration,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            config_ttl: Duration::from_secs(7 * 24 * 60 * 60),
            site_expansion_delay: Duration::from_secs(1),
        }
    }
}

/// What observers of a connection see.
#[derive(Debug, Clone, PartialEq)]
pub enum ConnectionEvent {
    StateChanged(ConnectionState),
    Bytes { received: u64, sent: u64 },
    /// The daemon could not be reached; nothing was started.
    ServiceNotReady,
}

#[derive(Debug)]
enum ControlMsg {
    Tunnel(TunnelEvent),
    Site(SiteResolved),
    ExpandSites { generation: u64 },
}

impl From<SiteResolved> for ControlMsg {
    fn from(resolved: SiteResolved) -> Self {
        ControlMsg::Site(resolved)
    }
}

pub struct VpnConnection {
    settings: Arc<dyn Settings>,
    configurator: Arc<VpnConfigurator>,
    factory: Arc<dyn TunnelFactory>,
    /// None on platforms where the tunnel manages routing itself.
    daemon: Option<Arc<dyn DaemonControl>>,
    resolver: Arc<dyn SiteResolver>,
    config: ConnectionConfig,

    state: ConnectionState,
    tunnel: Option<Box<dyn TunnelBackend>>,
    tunnel_events: Option<mpsc::UnboundedReceiver<TunnelEvent>>,
    vpn_configuration: Option<VpnConfiguration>,
    remote_address: String,
    route_mode: RouteMode,
    gateways: Gateways,
    site_gateway: String,

    /// Bumped on every connect and disconnect; late lookups of an older
    /// attempt are recognised by it.
    generation: u64,
    routed: HashSet<Ipv4Addr>,

    control_tx: mpsc::UnboundedSender<ControlMsg>,
    control_rx: mpsc::UnboundedReceiver<ControlMsg>,
    events: broadcast::Sender<ConnectionEvent>,
}

async fn recv_tunnel(rx: &mut Option<mpsc::UnboundedReceiver<TunnelEvent>>) -> Option<TunnelEvent> {
    match rx {
        Some(rx) => rx.recv().await,
        None => std::future::pending().await,
    }
}

impl VpnConnection {
    pub fn new(
        settings: Arc<dyn Settings>,
        configurator: Arc<VpnConfigurator>,
        factory: Arc<dyn TunnelFactory>,
        daemon: Option<Arc<dyn DaemonControl>>,
        resolver: Arc<dyn SiteResolver>,
        config: ConnectionConfig,
    ) -> Self {
        let (control_tx, control_rx) = mpsc::unbounded_channel();
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            settings,
            configurator,
            factory,
            daemon,
            resolver,
            config,
            state: ConnectionState::Disconnected,
            tunnel: None,
            tunnel_events: None,
            vpn_configuration: None,
            remote_address: String::new(),
            route_mode: RouteMode::AllSites,
            gateways: Gateways::default(),
            site_gateway: String::new(),
            generation: 0,
            routed: HashSet::new(),
            control_tx,
            control_rx,
            events,
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ConnectionEvent> {
        self.events.subscribe()
    }

    /// The configuration of the current connection attempt.
    pub fn vpn_configuration(&self) -> Option<&VpnConfiguration> {
        self.vpn_configuration.as_ref()
    }

    // ==============================================================================
    // 1. Connect / Disconnect
    // ==============================================================================

    pub async fn connect_to_vpn(
        &mut self,
        server_index: usize,
        credentials: &ServerCredentials,
        container: DockerContainer,
        container_config: &ContainerConfig,
    ) -> Result<()> {
        info!(server_index, %container, "connecting");

        if let Some(daemon) = self.daemon.clone() {
            if let Err(err) = daemon.ensure_ready().await {
                error!(error = %err, "daemon is not available");
                self.emit(ConnectionEvent::ServiceNotReady);
                self.set_state(ConnectionState::Error);
                return Err(err);
            }
        }

        self.remote_address = credentials.host.clone();
        self.set_state(ConnectionState::Connecting);
        self.teardown_tunnel().await;

        let mut configuration = match self
            .create_vpn_configuration(server_index, credentials, container, container_config)
            .await
        {
            Ok(configuration) => configuration,
            Err(err) => {
                error!(error = %err, "could not assemble the connection config");
                self.set_state(ConnectionState::Error);
                return Err(err);
            }
        };

        let mode = self.settings.route_mode();
        let sites = plan_sites(&self.settings.vpn_sites(mode)).addresses;
        configuration.append_split_tunnel(mode, sites);
        self.route_mode = configuration.split_tunnel_type;

        let mut tunnel = match self.factory.create(&configuration) {
            Ok(tunnel) => tunnel,
            Err(err) => {
                error!(error = %err, "no tunnel for this configuration");
                self.set_state(ConnectionState::Error);
                return Err(err);
            }
        };

        let (tx, rx) = mpsc::unbounded_channel();
        self.tunnel_events = Some(rx);
        self.vpn_configuration = Some(configuration);
        if let Err(err) = tunnel.start(tx).await {
            error!(error = %err, "tunnel failed to start");
            tunnel.stop().await;
            self.tunnel_events = None;
            self.set_state(ConnectionState::Error);
            return Err(err);
        }
        self.tunnel = Some(tunnel);
        Ok(())
    }

    /// Tears the connection down. With no tunnel running this only reports
    /// Disconnected.
    pub async fn disconnect_from_vpn(&mut self) {
        let Some(mut tunnel) = self.tunnel.take() else {
            self.set_state(ConnectionState::Disconnected);
            return;
        };
        info!("disconnecting");
        self.set_state(ConnectionState::Disconnecting);

        self.daemon_send(DaemonRequest::Deactivate).await;
        self.daemon_send(DaemonRequest::FlushDns).await;
        self.daemon_send(DaemonRequest::ClearSavedRoutes).await;

        tunnel.stop().await;
        self.tunnel_events = None;
        self.next_generation();
        self.set_state(ConnectionState::Disconnected);
    }

    /// Stops the previous tunnel before anything new is started.
    async fn teardown_tunnel(&mut self) {
        if let Some(mut previous) = self.tunnel.take() {
            debug!("stopping the previous tunnel");
            previous.stop().await;
        }
        self.tunnel_events = None;
        self.vpn_configuration = None;
        self.gateways = Gateways::default();
        self.next_generation();
    }

    fn next_generation(&mut self) {
        self.generation += 1;
        self.routed.clear();
        self.site_gateway.clear();
    }

    async fn create_vpn_configuration(
        &self,
        server_index: usize,
        credentials: &ServerCredentials,
        container: DockerContainer,
        container_config: &ContainerConfig,
    ) -> Result<VpnConfiguration> {
        let server = self.settings.server(server_index).unwrap_or_default();
        let dns = self.settings.dns_servers(server_index);
        let host_name = if server.host_name.is_empty() {
            credentials.host.clone()
        } else {
            server.host_name.clone()
        };

        let mut configuration = VpnConfiguration::new(container.default_protocol(), host_name, dns.clone());
        configuration.description = server.description.clone();
        configuration.config_version = server.config_version;

        for &proto in container.protocols() {
            // Imported Cloak configs carry no ShadowSocks layer.
            if server.config_version == ConfigVersion::Native
                && container == DockerContainer::Cloak
                && proto == Protocol::ShadowSocks
            {
                continue;
            }
            let raw = self
                .protocol_config_text(server_index, credentials, container, container_config, proto)
                .await?;
            let processed = VpnConfigurator::process_config_with_local_settings(&raw, &dns.0, &dns.1);
            configuration.set_protocol_data(proto, &processed)?;
        }
        Ok(configuration)
    }

    /// A cached config younger than the TTL, or a freshly generated one that
    /// is then cached unprocessed.
    async fn protocol_config_text(
        &self,
        server_index: usize,
        credentials: &ServerCredentials,
        container: DockerContainer,
        container_config: &ContainerConfig,
        proto: Protocol,
    ) -> Result<String> {
        let ttl = chrono::Duration::from_std(self.config.config_ttl).unwrap_or(chrono::Duration::MAX);
        let stored = self.settings.protocol_config(server_index, container, proto);
        let cached = stored
            .last_config
            .clone()
            .or_else(|| container_config.protocol(proto).last_config);

        if let Some(cached) = cached.filter(|c| c.is_fresh(ttl, Utc::now())) {
            debug!(%container, %proto, "reusing cached client config");
            return Ok(cached.config);
        }

        let generated = self
            .configurator
            .gen_vpn_protocol_config(credentials, container, container_config, proto)
            .await?;

        let mut block = stored;
        block.last_config = Some(CachedConfig::new(generated.text.clone()));
        self.settings.set_protocol_config(server_index, container, proto, block);
        Ok(generated.text)
    }

    // ==============================================================================
    // 2. Route control
    // ==============================================================================

    /// Routes `ips` the way the current mode routes sites. A no-op unless Connected.
    pub async fn add_routes(&self, ips: Vec<String>) -> Result<()> {
        match self.route_target() {
            Some((daemon, gateway)) => daemon.send(DaemonRequest::RouteAdd { gateway, ips }).await,
            None => Ok(()),
        }
    }

    pub async fn delete_routes(&self, ips: Vec<String>) -> Result<()> {
        match self.route_target() {
            Some((daemon, gateway)) => daemon.send(DaemonRequest::RouteDelete { gateway, ips }).await,
            None => Ok(()),
        }
    }

    pub async fn flush_dns(&self) {
        self.daemon_send(DaemonRequest::FlushDns).await;
    }

    fn route_target(&self) -> Option<(&Arc<dyn DaemonControl>, String)> {
        if self.state != ConnectionState::Connected {
            debug!(state = %self.state, "route change ignored while not connected");
            return None;
        }
        let daemon = self.daemon.as_ref()?;
        let gateway = match self.route_mode {
            RouteMode::OnlyForwardSites => self.gateways.vpn_gateway.clone(),
            RouteMode::AllExceptSites => self.gateways.route_gateway.clone(),
            RouteMode::AllSites => return None,
        };
        Some((daemon, gateway))
    }

    async fn daemon_send(&self, request: DaemonRequest) {
        let Some(daemon) = &self.daemon else {
            return;
        };
        let kind = request.kind();
        if let Err(err) = daemon.send(request).await {
            warn!(kind, error = %err, "daemon request failed");
        }
    }

    async fn route_add(&self, gateway: &str, ips: Vec<String>) {
        let ips: Vec<String> = ips.into_iter().filter(|ip| !ip.is_empty()).collect();
        if ips.is_empty() {
            return;
        }
        self.daemon_send(DaemonRequest::RouteAdd {
            gateway: gateway.to_string(),
            ips,
        })
        .await;
    }

    // ==============================================================================
    // 3. Control loop
    // ==============================================================================

    /// Waits for and handles one queued message.
    pub async fn handle_next(&mut self) {
        let msg = loop {
            tokio::select! {
                biased;
                event = recv_tunnel(&mut self.tunnel_events) => match event {
                    Some(event) => break ControlMsg::Tunnel(event),
                    None => self.tunnel_events = None,
                },
                Some(msg) = self.control_rx.recv() => break msg,
            }
        };
        self.handle(msg).await;
    }

    /// Drives the connection until `cancel` fires.
    pub async fn run_until(&mut self, cancel: &CancellationToken) {
        loop {
            tokio::select! {
                _ = cancel.cancelled() => return,
                _ = self.handle_next() => {}
            }
        }
    }

    async fn handle(&mut self, msg: ControlMsg) {
        match msg {
            ControlMsg::Tunnel(TunnelEvent::StateChanged(state)) => self.on_tunnel_state(state).await,
            ControlMsg::Tunnel(TunnelEvent::Bytes { received, sent }) => {
                self.emit(ConnectionEvent::Bytes { received, sent });
            }
            ControlMsg::Tunnel(TunnelEvent::Gateways(gateways)) => {
                debug!(vpn = %gateways.vpn_gateway, route = %gateways.route_gateway, "gateways learned");
                self.gateways = gateways;
            }
            ControlMsg::ExpandSites { generation } => {
                if generation == self.generation && self.state == ConnectionState::Connected {
                    let gateway = self.gateways.vpn_gateway.clone();
                    self.add_sites_routes(gateway).await;
                }
            }
            ControlMsg::Site(resolved) => self.on_site_resolved(resolved).await,
        }
    }

    async fn on_tunnel_state(&mut self, state: ConnectionState) {
        if state == self.state {
            return;
        }
        self.state = state;
        match state {
            ConnectionState::Connected => self.on_connected().await,
            ConnectionState::Error => {
                self.daemon_send(DaemonRequest::FlushDns).await;
                if self.route_mode == RouteMode::OnlyForwardSites {
                    self.daemon_send(DaemonRequest::ClearSavedRoutes).await;
                }
            }
            _ => {}
        }
        self.emit(ConnectionEvent::StateChanged(state));
    }

    async fn on_connected(&mut self) {
        if self.daemon.is_none() {
            return;
        }
        if self.gateways == Gateways::default() {
            if let Some(tunnel) = &self.tunnel {
                self.gateways = tunnel.gateways();
            }
        }
        self.daemon_send(DaemonRequest::FlushDns).await;

        let Some(configuration) = &self.vpn_configuration else {
            return;
        };
        // Imported configs bring their own routing.
        if configuration.config_version != ConfigVersion::Managed {
            return;
        }
        let dns = vec![configuration.dns1.clone(), configuration.dns2.clone()];
        let vpn_gateway = self.gateways.vpn_gateway.clone();
        let route_gateway = self.gateways.route_gateway.clone();

        if self.route_mode != RouteMode::AllSites {
            self.daemon_send(DaemonRequest::RouteDelete {
                gateway: vpn_gateway.clone(),
                ips: vec![CATCH_ALL.to_string()],
            })
            .await;
        }
        // DNS goes through the tunnel in every mode.
        self.route_add(&vpn_gateway, dns).await;

        match self.route_mode {
            RouteMode::OnlyForwardSites => {
                let generation = self.generation;
                let delay = self.config.site_expansion_delay;
                let tx = self.control_tx.clone();
                tokio::spawn(async move {
                    tokio::time::sleep(delay).await;
                    let _ = tx.send(ControlMsg::ExpandSites { generation });
                });
            }
            RouteMode::AllExceptSites => {
                self.route_add(&vpn_gateway, vec![LOWER_HALF.to_string()]).await;
                self.route_add(&vpn_gateway, vec![UPPER_HALF.to_string()]).await;
                self.route_add(&route_gateway, vec![self.remote_address.clone()]).await;
                self.add_sites_routes(route_gateway).await;
            }
            RouteMode::AllSites => {}
        }
    }

    /// Routes literal sites at once and starts resolving the hostnames.
    async fn add_sites_routes(&mut self, gateway: String) {
        let plan = plan_sites(&self.settings.vpn_sites(self.route_mode));
        for ip in &plan.addresses {
            if let Ok(addr) = ip.parse::<Ipv4Addr>() {
                self.routed.insert(addr);
            }
        }
        self.route_add(&gateway, plan.addresses).await;
        self.site_gateway = gateway;

        if !plan.hosts.is_empty() {
            debug!(count = plan.hosts.len(), "resolving split tunnel sites");
            resolve_sites(self.resolver.clone(), plan.hosts, self.generation, self.control_tx.clone());
        }
    }

    async fn on_site_resolved(&mut self, resolved: SiteResolved) {
        if resolved.generation != self.generation || self.state != ConnectionState::Connected {
            debug!(site = %resolved.site, "stale lookup dropped");
            return;
        }
        let Some(address) = resolved.address else {
            return;
        };
        if !self.routed.insert(address) {
            debug!(site = %resolved.site, %address, "already routed");
            return;
        }

        let gateway = self.site_gateway.clone();
        self.route_add(&gateway, vec![address.to_string()]).await;
        self.settings
            .add_vpn_site(self.route_mode, &resolved.site, &address.to_string());
        self.daemon_send(DaemonRequest::FlushDns).await;
    }

    fn set_state(&mut self, state: ConnectionState) {
        self.state = state;
        self.emit(ConnectionEvent::StateChanged(state));
    }

    fn emit(&self, event: ConnectionEvent) {
        let _ = self.events.send(event);
    }
}
