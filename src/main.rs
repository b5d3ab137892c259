// src/main.rs

use std::io::{BufRead, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{bail, Context};
use clap::{Args, Parser, Subcommand};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;
use zeroize::Zeroizing;

use vpn_orchestrator::config::OrchestratorConfig;
use vpn_orchestrator::configurators::VpnConfigurator;
use vpn_orchestrator::containers::{ContainerConfig, DockerContainer, TransportProto};
use vpn_orchestrator::credentials::{ServerCredentials, ServerSecret};
use vpn_orchestrator::daemon::{DaemonControl, DaemonHandle};
use vpn_orchestrator::provision::{ProvisionProgress, ServerController};
use vpn_orchestrator::sys::secrets::SecretText;
use vpn_orchestrator::sys::ssh::OpenSshShell;
use vpn_orchestrator::sys::traits::SystemResolver;
use vpn_orchestrator::vpn::{
    ConnectionEvent, DefaultTunnelFactory, MemorySettings, RouteMode, Settings, VpnConnection,
};

const PASSPHRASE_ENV: &str = "VPNORCH_KEY_PASSPHRASE";

#[derive(Parser)]
#[command(name = "vpn-orchestrator", version, about = "Provision VPN containers over SSH and connect to them")]
struct Cli {
    /// Emit logs as JSON lines.
    #[arg(long, global = true)]
    json: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Args)]
struct Target {
    /// JSON file with host, port, login and either password or private_key.
    #[arg(long, short = 'c', env = "VPNORCH_CREDENTIALS")]
    credentials: PathBuf,
}

#[derive(Subcommand)]
enum Command {
    /// Verify SSH access and sudo rights on the host.
    Check(Target),
    /// Install a container.
    Install {
        #[command(flatten)]
        target: Target,
        #[arg(long)]
        container: DockerContainer,
        #[arg(long)]
        port: Option<u16>,
        #[arg(long)]
        transport: Option<TransportProto>,
    },
    /// Change port or transport of an installed container.
    Update {
        #[command(flatten)]
        target: Target,
        #[arg(long)]
        container: DockerContainer,
        #[arg(long)]
        port: Option<u16>,
        #[arg(long)]
        transport: Option<TransportProto>,
    },
    /// Remove one container, or all of them.
    Remove {
        #[command(flatten)]
        target: Target,
        #[arg(long, required_unless_present = "all", conflicts_with = "all")]
        container: Option<DockerContainer>,
        #[arg(long)]
        all: bool,
    },
    /// Print the containers installed on the host.
    List(Target),
    /// Connect and stay connected until interrupted.
    Connect {
        #[command(flatten)]
        target: Target,
        /// Defaults to the server's default container.
        #[arg(long)]
        container: Option<DockerContainer>,
        /// all, include or exclude.
        #[arg(long)]
        route_mode: Option<RouteMode>,
        /// Site added to the list of the chosen route mode. Repeatable.
        #[arg(long = "site")]
        sites: Vec<String>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // ==============================================================================
    // 1. Configuration & Environment
    // ==============================================================================

    let cli = Cli::parse();
    init_tracing(cli.json);
    let config = OrchestratorConfig::load().context("invalid VPNORCH_* environment")?;
    let settings = Arc::new(
        MemorySettings::load(&config.settings_path)
            .with_context(|| format!("cannot read settings at {}", config.settings_path.display()))?,
    );

    let cancel = CancellationToken::new();
    {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                tracing::info!("interrupt received, stopping");
                cancel.cancel();
            }
        });
    }

    // ==============================================================================
    // 2. Remote Shell & Credentials
    // ==============================================================================

    let shell = Arc::new(OpenSshShell::new(config.ssh.clone()));
    let (progress_tx, progress_rx) = mpsc::unbounded_channel();
    tokio::spawn(report_progress(progress_rx));
    let controller = Arc::new(ServerController::new(shell.clone()).with_progress(progress_tx));

    // ==============================================================================
    // 3. Commands
    // ==============================================================================

    match cli.command {
        Command::Check(target) => {
            let creds = load_credentials(&target.credentials, &controller, &shell).await?;
            let banner = controller.check_ssh_connection(&creds).await?;
            controller.is_user_in_sudo(&creds).await?;
            println!("{}", banner.trim());
        }
        Command::Install {
            target,
            container,
            port,
            transport,
        } => {
            let creds = load_credentials(&target.credentials, &controller, &shell).await?;
            let container_config = ContainerConfig::create_initial(container, port, transport);
            controller
                .setup_container(&creds, container, &container_config, false, &cancel)
                .await
                .with_context(|| format!("installing {container} on {}", creds.host))?;
            let server = settings.server_for_host(&creds.host);
            settings.set_container(server, container_config);
            tracing::info!(%container, host = %creds.host, "✅ container installed");
        }
        Command::Update {
            target,
            container,
            port,
            transport,
        } => {
            let creds = load_credentials(&target.credentials, &controller, &shell).await?;
            let installed = controller.get_already_installed_containers(&creds).await?;
            let Some(old) = installed.get(&container) else {
                bail!("{container} is not installed on {}", creds.host);
            };
            let mut new = old.clone();
            let block = new.protocol_mut(container.default_protocol());
            if port.is_some() {
                block.port = port;
            }
            if transport.is_some() {
                block.transport_proto = transport;
            }
            controller
                .update_container(&creds, container, old, &new, &cancel)
                .await
                .with_context(|| format!("updating {container} on {}", creds.host))?;
            let server = settings.server_for_host(&creds.host);
            settings.set_container(server, new);
        }
        Command::Remove {
            target,
            container,
            all,
        } => {
            let creds = load_credentials(&target.credentials, &controller, &shell).await?;
            let server = settings.server_for_host(&creds.host);
            match container {
                Some(container) if !all => {
                    controller.remove_container(&creds, container).await?;
                    settings.remove_container(server, Some(container));
                }
                _ => {
                    controller.remove_all_containers(&creds).await?;
                    settings.remove_container(server, None);
                }
            }
        }
        Command::List(target) => {
            let creds = load_credentials(&target.credentials, &controller, &shell).await?;
            let installed = controller.get_already_installed_containers(&creds).await?;
            println!("{}", serde_json::to_string_pretty(&installed)?);
        }
        Command::Connect {
            target,
            container,
            route_mode,
            sites,
        } => {
            let creds = load_credentials(&target.credentials, &controller, &shell).await?;
            let server = settings.server_for_host(&creds.host);
            if let Some(mode) = route_mode {
                settings.set_route_mode(mode);
            }
            for site in &sites {
                settings.add_vpn_site(settings.route_mode(), site, "");
            }

            let Some(container) = container.or_else(|| settings.default_container(server)) else {
                bail!("no container known for {}; install one or pass --container", creds.host);
            };
            let container_config = match settings.server(server).and_then(|s| s.containers.get(&container).cloned()) {
                Some(config) => config,
                None => {
                    let installed = controller.get_already_installed_containers(&creds).await?;
                    let Some(config) = installed.get(&container).cloned() else {
                        bail!("{container} is not installed on {}", creds.host);
                    };
                    settings.set_container(server, config.clone());
                    config
                }
            };

            let daemon = DaemonHandle::spawn(config.daemon.clone());
            let mut connection = VpnConnection::new(
                settings.clone(),
                Arc::new(VpnConfigurator::new(controller.clone())),
                Arc::new(DefaultTunnelFactory::new(daemon.clone(), config.tunnel_binaries.clone())),
                Some(Arc::new(daemon.clone()) as Arc<dyn DaemonControl>),
                Arc::new(SystemResolver),
                config.connection.clone(),
            );
            tokio::spawn(report_connection(connection.subscribe()));

            connection
                .connect_to_vpn(server, &creds, container, &container_config)
                .await
                .with_context(|| format!("connecting to {container} on {}", creds.host))?;
            connection.run_until(&cancel).await;
            connection.disconnect_from_vpn().await;
        }
    }

    Ok(())
}

fn init_tracing(json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);
    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}

/// Reads the credentials file. Private keys are decrypted up front so the
/// shell never sees a passphrase-protected key.
async fn load_credentials(
    path: &Path,
    controller: &ServerController,
    shell: &OpenSshShell,
) -> anyhow::Result<ServerCredentials> {
    let text = std::fs::read_to_string(path).with_context(|| format!("cannot read {}", path.display()))?;
    let creds: ServerCredentials =
        serde_json::from_str(&text).with_context(|| format!("{} is not a credentials document", path.display()))?;

    if !matches!(creds.secret, ServerSecret::PrivateKey(_)) {
        return Ok(creds);
    }
    let key = controller
        .get_decrypted_private_key(shell, &creds, Box::new(ask_passphrase))
        .await?;
    Ok(creds.with_secret(ServerSecret::PrivateKey(key)))
}

fn ask_passphrase() -> Option<SecretText> {
    if let Ok(passphrase) = std::env::var(PASSPHRASE_ENV) {
        return Some(SecretText::new(passphrase));
    }
    eprint!("Private key passphrase: ");
    std::io::stderr().flush().ok()?;
    let mut line = Zeroizing::new(String::new());
    std::io::stdin().lock().read_line(&mut line).ok()?;
    let passphrase = line.trim_end_matches(['\r', '\n']).to_string();
    (!passphrase.is_empty()).then(|| SecretText::new(passphrase))
}

async fn report_progress(mut progress: mpsc::UnboundedReceiver<ProvisionProgress>) {
    while let Some(event) = progress.recv().await {
        match event {
            ProvisionProgress::StageStarted { container, stage } => {
                tracing::info!(%container, %stage, "▶️ stage started");
            }
            ProvisionProgress::StageFinished { container, stage } => {
                tracing::info!(%container, %stage, "stage finished");
            }
        }
    }
}

async fn report_connection(mut events: tokio::sync::broadcast::Receiver<ConnectionEvent>) {
    loop {
        match events.recv().await {
            Ok(ConnectionEvent::StateChanged(state)) => tracing::info!(%state, "connection state"),
            Ok(ConnectionEvent::Bytes { received, sent }) => tracing::debug!(received, sent, "traffic"),
            Ok(ConnectionEvent::ServiceNotReady) => tracing::error!("VPN daemon is not running"),
            Err(tokio::sync::broadcast::error::RecvError::Lagged(skipped)) => {
                tracing::warn!(skipped, "connection events dropped");
            }
            Err(tokio::sync::broadcast::error::RecvError::Closed) => return,
        }
    }
}
