// src/provision/mod.rs
//
// Remote provisioning: installs, updates and removes VPN containers on a host
// through a RemoteShell, one stage at a time.

pub mod checks;
pub mod clients;
pub mod mapping;
pub mod reinstall;

use std::collections::{BTreeMap, HashSet};
use std::fmt;
use std::sync::Arc;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::containers::{ContainerConfig, DockerContainer, REMOTE_ROOT};
use crate::credentials::{ServerCredentials, ServerSecret};
use crate::error::{Error, Result};
use crate::scripts::{gen_vars_for_script, script_data, substitute, ScriptKind, VarsList};
use crate::sys::firewall;
use crate::sys::secrets::SecretText;
use crate::sys::traits::{OutputSink, OverwriteMode, RemoteShell};

pub use reinstall::is_reinstall_required;

// ==============================================================================
// 1. Stages & Progress
// ==============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Stage {
    Preflight,
    PrepareHost,
    InstallRuntime,
    BuildContainer,
    ConfigureContainer,
    RunContainer,
    StartupWorker,
    RemoveContainer,
    FileTransfer,
    Query,
}

impl Stage {
    /// Install pipeline, in execution order.
    pub const PIPELINE: [Stage; 6] = [
        Stage::PrepareHost,
        Stage::InstallRuntime,
        Stage::BuildContainer,
        Stage::ConfigureContainer,
        Stage::RunContainer,
        Stage::StartupWorker,
    ];

    /// Stages a live update goes through when no reinstall is needed.
    pub const LIVE_UPDATE: [Stage; 2] = [Stage::ConfigureContainer, Stage::StartupWorker];

    pub fn as_str(self) -> &'static str {
        match self {
            Stage::Preflight => "preflight",
            Stage::PrepareHost => "prepareHost",
            Stage::InstallRuntime => "installRuntime",
            Stage::BuildContainer => "buildContainer",
            Stage::ConfigureContainer => "configureContainer",
            Stage::RunContainer => "runContainer",
            Stage::StartupWorker => "startupWorker",
            Stage::RemoveContainer => "removeContainer",
            Stage::FileTransfer => "fileTransfer",
            Stage::Query => "query",
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProvisionProgress {
    StageStarted { container: DockerContainer, stage: Stage },
    StageFinished { container: DockerContainer, stage: Stage },
}

// ==============================================================================
// 2. Output Sinks
// ==============================================================================

/// Logs every line of a stage at debug level. Recognises the one fatal message
/// the host scripts print instead of failing loudly.
pub struct LogSink {
    stage: Stage,
}

impl LogSink {
    pub fn new(stage: Stage) -> Self {
        Self { stage }
    }
}

impl OutputSink for LogSink {
    fn on_stdout(&mut self, line: &str) -> Result<()> {
        debug!(stage = %self.stage, "{line}");
        if line.contains("Packet manager not found") {
            return Err(Error::command(self.stage, "unsupported package manager on the server"));
        }
        Ok(())
    }

    fn on_stderr(&mut self, line: &str) -> Result<()> {
        debug!(stage = %self.stage, stderr = true, "{line}");
        Ok(())
    }
}

/// Collects output for callers that parse it.
#[derive(Debug, Default)]
pub struct CollectSink {
    pub stdout: Vec<String>,
    pub stderr: Vec<String>,
}

impl CollectSink {
    pub fn stdout_text(&self) -> String {
        self.stdout.join("\n")
    }
}

impl OutputSink for CollectSink {
    fn on_stdout(&mut self, line: &str) -> Result<()> {
        self.stdout.push(line.to_string());
        Ok(())
    }

    fn on_stderr(&mut self, line: &str) -> Result<()> {
        self.stderr.push(line.to_string());
        Ok(())
    }
}

/// Forwards to another sink while remembering the last stderr line for error messages.
struct TailSink<'a> {
    inner: &'a mut dyn OutputSink,
    last_stderr: Option<String>,
}

impl OutputSink for TailSink<'_> {
    fn on_stdout(&mut self, line: &str) -> Result<()> {
        self.inner.on_stdout(line)
    }

    fn on_stderr(&mut self, line: &str) -> Result<()> {
        if !line.trim().is_empty() {
            self.last_stderr = Some(line.trim().to_string());
        }
        self.inner.on_stderr(line)
    }
}

/// Re-tags file transfer failures with the pipeline stage they happened in.
fn in_stage(stage: Stage) -> impl FnOnce(Error) -> Error {
    move |err| match err {
        Error::Command {
            stage: Stage::FileTransfer,
            exit_code,
            message,
        } => Error::Command {
            stage,
            exit_code,
            message,
        },
        other => other,
    }
}

/// Lazily asks the user for a key passphrase.
pub type PassphrasePrompt<'a> = Box<dyn FnOnce() -> Option<SecretText> + Send + 'a>;

/// Decrypts private keys on behalf of the controller. The OpenSSH shell implements it.
#[async_trait::async_trait]
pub trait KeyDecryptor: Send + Sync {
    async fn decrypt(&self, key: &SecretText, prompt: PassphrasePrompt<'_>) -> Result<SecretText>;
}

#[async_trait::async_trait]
impl KeyDecryptor for crate::sys::ssh::OpenSshShell {
    async fn decrypt(&self, key: &SecretText, prompt: PassphrasePrompt<'_>) -> Result<SecretText> {
        self.decrypt_private_key(key, prompt).await
    }
}

// ==============================================================================
// 3. Controller
// ==============================================================================

pub struct ServerController {
    shell: Arc<dyn RemoteShell>,
    progress: Option<mpsc::UnboundedSender<ProvisionProgress>>,
}

impl ServerController {
    pub fn new(shell: Arc<dyn RemoteShell>) -> Self {
        Self {
            shell,
            progress: None,
        }
    }

    /// Reports stage transitions on `progress`.
    pub fn with_progress(mut self, progress: mpsc::UnboundedSender<ProvisionProgress>) -> Self {
        self.progress = Some(progress);
        self
    }

    fn report(&self, event: ProvisionProgress) {
        if let Some(progress) = &self.progress {
            let _ = progress.send(event);
        }
    }

    /// Runs an already substituted script; a non-zero exit becomes a `Command` error for `stage`.
    pub async fn run_script(
        &self,
        credentials: &ServerCredentials,
        script: &str,
        stage: Stage,
        sink: &mut dyn OutputSink,
    ) -> Result<()> {
        let mut tail = TailSink {
            inner: sink,
            last_stderr: None,
        };
        let code = self.shell.exec(credentials, script, &mut tail).await?;
        if code != 0 {
            return Err(Error::Command {
                stage,
                exit_code: Some(code),
                message: tail
                    .last_stderr
                    .unwrap_or_else(|| format!("script exited with status {code}")),
            });
        }
        Ok(())
    }

    /// Looks a script up in the registry, substitutes `vars` into it and runs it.
    pub async fn run_registry_script(
        &self,
        credentials: &ServerCredentials,
        kind: ScriptKind,
        container: Option<DockerContainer>,
        vars: &VarsList,
        stage: Stage,
        sink: &mut dyn OutputSink,
    ) -> Result<()> {
        let script = substitute(script_data(kind, container)?, vars);
        self.run_script(credentials, &script, stage, sink).await
    }

    /// Authenticates and returns the host's kernel banner.
    pub async fn check_ssh_connection(&self, credentials: &ServerCredentials) -> Result<String> {
        let vars = gen_vars_for_script(credentials, None, None);
        let mut sink = CollectSink::default();
        self.run_registry_script(
            credentials,
            ScriptKind::CheckConnection,
            None,
            &vars,
            Stage::Query,
            &mut sink,
        )
        .await?;
        Ok(sink.stdout_text())
    }

    /// Returns the private key in plain form, prompting for a passphrase only when
    /// the key is protected. The passphrase is dropped before this returns.
    pub async fn get_decrypted_private_key(
        &self,
        decryptor: &dyn KeyDecryptor,
        credentials: &ServerCredentials,
        prompt: PassphrasePrompt<'_>,
    ) -> Result<SecretText> {
        match &credentials.secret {
            ServerSecret::PrivateKey(key) => decryptor.decrypt(key, prompt).await,
            ServerSecret::Password(_) => Err(Error::PrivateKey(
                "credentials carry a password, not a private key".into(),
            )),
        }
    }

    // --------------------------------------------------------------------------
    // File transfer
    // --------------------------------------------------------------------------

    pub async fn upload_file_to_host(
        &self,
        credentials: &ServerCredentials,
        data: &[u8],
        remote_path: &str,
        mode: OverwriteMode,
    ) -> Result<()> {
        self.shell.upload(credentials, data, remote_path, mode).await
    }

    /// Writes `data` at `container_path` inside the container's mounted volume.
    pub async fn upload_text_file_to_container(
        &self,
        credentials: &ServerCredentials,
        container: DockerContainer,
        data: &str,
        container_path: &str,
        mode: OverwriteMode,
    ) -> Result<()> {
        let host_path = container.host_path_for(container_path).ok_or_else(|| {
            Error::InvalidConfig(format!("{container_path} is not under {REMOTE_ROOT}"))
        })?;
        self.shell
            .upload(credentials, data.as_bytes(), &host_path, mode)
            .await
    }

    pub async fn get_text_file_from_container(
        &self,
        credentials: &ServerCredentials,
        container: DockerContainer,
        container_path: &str,
    ) -> Result<String> {
        let host_path = container.host_path_for(container_path).ok_or_else(|| {
            Error::InvalidConfig(format!("{container_path} is not under {REMOTE_ROOT}"))
        })?;
        let bytes = self.shell.download(credentials, &host_path).await?;
        String::from_utf8(bytes).map_err(|_| {
            Error::command(Stage::FileTransfer, format!("{container_path} is not valid UTF-8"))
        })
    }

    // --------------------------------------------------------------------------
    // Install / update / remove
    // --------------------------------------------------------------------------

    /// Installs `container` configured by `config`.
    ///
    /// Pre-flight checks run first (the port check only for fresh installs), then
    /// the six pipeline stages in order. `cancel` is polled before every stage.
    /// On success the config is recorded in the host mapping.
    pub async fn setup_container(
        &self,
        credentials: &ServerCredentials,
        container: DockerContainer,
        config: &ContainerConfig,
        is_update: bool,
        cancel: &CancellationToken,
    ) -> Result<()> {
        info!(%container, is_update, host = %credentials.host, "setting up container");

        self.is_user_in_sudo(credentials).await?;
        self.is_server_dpkg_busy(credentials).await?;
        if !is_update {
            self.is_server_port_busy(credentials, container, config).await?;
        }

        let vars = gen_vars_for_script(credentials, Some(container), Some(config));
        self.run_stages(credentials, container, config, &vars, &Stage::PIPELINE, cancel)
            .await?;

        self.update_mapping(credentials, |mapping| mapping.upsert(config))
            .await?;
        info!(%container, "container is up");
        Ok(())
    }

    /// Moves an installed container from `old` to `new`. Changes the reinstall
    /// predicate flags rebuild the container; anything else is reconfigured in place.
    pub async fn update_container(
        &self,
        credentials: &ServerCredentials,
        container: DockerContainer,
        old: &ContainerConfig,
        new: &ContainerConfig,
        cancel: &CancellationToken,
    ) -> Result<()> {
        if is_reinstall_required(container, old, new) {
            info!(%container, "settings change requires a reinstall");
            self.remove_container(credentials, container).await?;
            return self
                .setup_container(credentials, container, new, true, cancel)
                .await;
        }

        info!(%container, "applying settings in place");
        self.is_user_in_sudo(credentials).await?;
        let vars = gen_vars_for_script(credentials, Some(container), Some(new));
        self.run_stages(credentials, container, new, &vars, &Stage::LIVE_UPDATE, cancel)
            .await?;
        self.update_mapping(credentials, |mapping| mapping.upsert(new))
            .await
    }

    /// Stops and deletes a container and its image. Removing an absent container succeeds.
    pub async fn remove_container(
        &self,
        credentials: &ServerCredentials,
        container: DockerContainer,
    ) -> Result<()> {
        info!(%container, host = %credentials.host, "removing container");
        let vars = gen_vars_for_script(credentials, Some(container), None);
        self.run_registry_script(
            credentials,
            ScriptKind::RemoveContainer,
            Some(container),
            &vars,
            Stage::RemoveContainer,
            &mut LogSink::new(Stage::RemoveContainer),
        )
        .await?;
        self.update_mapping(credentials, |mapping| {
            mapping.remove(container);
        })
        .await
    }

    /// Removes every orchestrator container and the whole remote state directory.
    pub async fn remove_all_containers(&self, credentials: &ServerCredentials) -> Result<()> {
        info!(host = %credentials.host, "removing all containers");
        let vars = gen_vars_for_script(credentials, None, None);
        self.run_registry_script(
            credentials,
            ScriptKind::RemoveAllContainers,
            None,
            &vars,
            Stage::RemoveContainer,
            &mut LogSink::new(Stage::RemoveContainer),
        )
        .await
    }

    /// Installed containers according to the host mapping, minus entries whose
    /// container is no longer running. Stale entries are dropped from the mapping.
    pub async fn get_already_installed_containers(
        &self,
        credentials: &ServerCredentials,
    ) -> Result<BTreeMap<DockerContainer, ContainerConfig>> {
        let (mut mapping, before) = self.load_mapping(credentials).await?;

        let vars = gen_vars_for_script(credentials, None, None);
        let mut sink = CollectSink::default();
        self.run_registry_script(
            credentials,
            ScriptKind::ListContainers,
            None,
            &vars,
            Stage::Query,
            &mut sink,
        )
        .await?;
        let running: HashSet<&str> = sink.stdout.iter().map(|l| l.trim()).collect();

        for stale in mapping.retain(|c| running.contains(c.remote_name().as_str())) {
            warn!(container = %stale, "container is gone from the host, dropping it from the mapping");
        }
        self.store_mapping(credentials, &mapping, &before).await?;

        Ok(mapping.into_containers())
    }

    async fn run_stages(
        &self,
        credentials: &ServerCredentials,
        container: DockerContainer,
        config: &ContainerConfig,
        vars: &VarsList,
        stages: &[Stage],
        cancel: &CancellationToken,
    ) -> Result<()> {
        for &stage in stages {
            if cancel.is_cancelled() {
                warn!(%container, %stage, "installation cancelled");
                return Err(Error::Cancelled);
            }
            self.report(ProvisionProgress::StageStarted { container, stage });
            self.run_stage(credentials, container, config, vars, stage)
                .await?;
            self.report(ProvisionProgress::StageFinished { container, stage });
        }
        Ok(())
    }

    async fn run_stage(
        &self,
        credentials: &ServerCredentials,
        container: DockerContainer,
        config: &ContainerConfig,
        vars: &VarsList,
        stage: Stage,
    ) -> Result<()> {
        debug!(%container, %stage, "stage started");
        let mut sink = LogSink::new(stage);

        match stage {
            Stage::PrepareHost => {
                self.run_registry_script(credentials, ScriptKind::PrepareHost, Some(container), vars, stage, &mut sink)
                    .await
            }
            Stage::InstallRuntime => {
                self.run_registry_script(credentials, ScriptKind::InstallDocker, Some(container), vars, stage, &mut sink)
                    .await
            }
            Stage::BuildContainer => {
                let dockerfile = substitute(script_data(ScriptKind::Dockerfile, Some(container))?, vars);
                self.upload_file_to_host(
                    credentials,
                    dockerfile.as_bytes(),
                    &format!("{}/Dockerfile", container.host_folder()),
                    OverwriteMode::OverwriteExisting,
                )
                .await
                .map_err(in_stage(stage))?;
                self.run_registry_script(credentials, ScriptKind::BuildContainer, Some(container), vars, stage, &mut sink)
                    .await
            }
            Stage::ConfigureContainer => {
                self.configure_container_worker(credentials, container, vars)
                    .await
            }
            Stage::RunContainer => {
                self.run_registry_script(credentials, ScriptKind::RunContainer, Some(container), vars, stage, &mut sink)
                    .await?;
                self.setup_server_firewall(credentials, config, vars).await
            }
            Stage::StartupWorker => {
                self.startup_container_worker(credentials, container, vars)
                    .await
            }
            other => Err(Error::command(other, "not a pipeline stage")),
        }
    }

    /// Generates keys and server config inside a one-shot container writing into the host volume.
    pub async fn configure_container_worker(
        &self,
        credentials: &ServerCredentials,
        container: DockerContainer,
        vars: &VarsList,
    ) -> Result<()> {
        let stage = Stage::ConfigureContainer;
        let script = substitute(script_data(ScriptKind::ConfigureContainer, Some(container))?, vars);
        self.upload_file_to_host(
            credentials,
            script.as_bytes(),
            &format!("{}/configure_container.sh", container.host_folder()),
            OverwriteMode::OverwriteExisting,
        )
        .await
        .map_err(in_stage(stage))?;

        self.run_registry_script(
            credentials,
            ScriptKind::ConfigureContainerRunner,
            Some(container),
            vars,
            stage,
            &mut LogSink::new(stage),
        )
        .await
    }

    /// Places the start script in the volume and restarts the container so its entrypoint runs it.
    pub async fn startup_container_worker(
        &self,
        credentials: &ServerCredentials,
        container: DockerContainer,
        vars: &VarsList,
    ) -> Result<()> {
        let stage = Stage::StartupWorker;
        let script = substitute(script_data(ScriptKind::ContainerStartup, Some(container))?, vars);
        self.upload_text_file_to_container(
            credentials,
            container,
            &script,
            &format!("{REMOTE_ROOT}/start.sh"),
            OverwriteMode::OverwriteExisting,
        )
        .await
        .map_err(in_stage(stage))?;

        self.run_registry_script(
            credentials,
            ScriptKind::RestartContainer,
            Some(container),
            vars,
            stage,
            &mut LogSink::new(stage),
        )
        .await
    }

    async fn setup_server_firewall(
        &self,
        credentials: &ServerCredentials,
        config: &ContainerConfig,
        vars: &VarsList,
    ) -> Result<()> {
        let stage = Stage::RunContainer;
        let mut script = substitute(script_data(ScriptKind::SetupHostFirewall, None)?, vars);
        script.push_str(&firewall::render_script(&firewall::policies_for(config))?);
        self.run_script(credentials, &script, stage, &mut LogSink::new(stage))
            .await
    }
}
