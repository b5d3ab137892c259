// src/testing.rs
//
// In-memory stand-ins for the remote host, tunnels and DNS, shared by unit tests.

use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::credentials::{ServerCredentials, ServerSecret};
use crate::daemon::{DaemonControl, DaemonRequest};
use crate::error::{Error, Result};
use crate::provision::Stage;
use crate::sys::secrets::SecretText;
use crate::sys::traits::{
    Gateways, OutputSink, OverwriteMode, RemoteShell, SiteResolver, TunnelBackend, TunnelEvent,
};
use crate::vpn::ConnectionState;

pub fn creds() -> ServerCredentials {
    ServerCredentials {
        host: "203.0.113.7".into(),
        port: 22,
        login: "root".into(),
        secret: ServerSecret::Password(SecretText::new("hunter2".into())),
    }
}

// ==============================================================================
// Remote shell
// ==============================================================================

#[derive(Debug, Clone, Default)]
pub struct Reply {
    pub code: i32,
    pub stdout: Vec<String>,
    pub stderr: Vec<String>,
}

impl Reply {
    pub fn stdout(lines: &[&str]) -> Self {
        Self {
            code: 0,
            stdout: lines.iter().map(|l| l.to_string()).collect(),
            stderr: Vec::new(),
        }
    }

    pub fn failure(code: i32, stderr: &str) -> Self {
        Self {
            code,
            stdout: Vec::new(),
            stderr: vec![stderr.to_string()],
        }
    }
}

type ExecHook = Box<dyn Fn() + Send + Sync>;

/// Answers scripts by substring rules (latest rule wins) and keeps uploaded
/// files in memory so later downloads see them.
pub struct FakeShell {
    rules: Mutex<Vec<(String, Reply)>>,
    hooks: Mutex<Vec<(String, ExecHook)>>,
    files: Mutex<HashMap<String, Vec<u8>>>,
    uploads: Mutex<Vec<(String, String)>>,
    executed: Mutex<Vec<String>>,
}

impl FakeShell {
    pub fn new() -> Self {
        Self {
            rules: Mutex::new(vec![("sudo -n true".into(), Reply::stdout(&["root"]))]),
            hooks: Mutex::new(Vec::new()),
            files: Mutex::new(HashMap::new()),
            uploads: Mutex::new(Vec::new()),
            executed: Mutex::new(Vec::new()),
        }
    }

    pub fn reply_to(&self, pattern: &str, reply: Reply) {
        self.rules.lock().unwrap().push((pattern.to_string(), reply));
    }

    /// Runs `hook` every time a script containing `pattern` is executed.
    pub fn on_exec(&self, pattern: &str, hook: impl Fn() + Send + Sync + 'static) {
        self.hooks
            .lock()
            .unwrap()
            .push((pattern.to_string(), Box::new(hook)));
    }

    pub fn put_file(&self, path: &str, text: &str) {
        self.files
            .lock()
            .unwrap()
            .insert(path.to_string(), text.as_bytes().to_vec());
    }

    pub fn file(&self, path: &str) -> Option<String> {
        self.files
            .lock()
            .unwrap()
            .get(path)
            .map(|b| String::from_utf8_lossy(b).into_owned())
    }

    pub fn executed(&self) -> Vec<String> {
        self.executed.lock().unwrap().clone()
    }

    pub fn uploads(&self) -> Vec<(String, String)> {
        self.uploads.lock().unwrap().clone()
    }

    /// Latest text uploaded to `path`.
    pub fn uploaded(&self, path: &str) -> Option<String> {
        self.uploads
            .lock()
            .unwrap()
            .iter()
            .rev()
            .find(|(p, _)| p == path)
            .map(|(_, text)| text.clone())
    }

    pub fn clear_uploads(&self) {
        self.uploads.lock().unwrap().clear();
    }
}

#[async_trait]
impl RemoteShell for FakeShell {
    async fn exec(
        &self,
        _credentials: &ServerCredentials,
        script: &str,
        sink: &mut dyn OutputSink,
    ) -> Result<i32> {
        self.executed.lock().unwrap().push(script.to_string());
        for (pattern, hook) in self.hooks.lock().unwrap().iter() {
            if script.contains(pattern.as_str()) {
                hook();
            }
        }
        let reply = self
            .rules
            .lock()
            .unwrap()
            .iter()
            .rev()
            .find(|(pattern, _)| script.contains(pattern.as_str()))
            .map(|(_, reply)| reply.clone())
            .unwrap_or_default();

        for line in &reply.stdout {
            sink.on_stdout(line)?;
        }
        for line in &reply.stderr {
            sink.on_stderr(line)?;
        }
        Ok(reply.code)
    }

    async fn upload(
        &self,
        _credentials: &ServerCredentials,
        data: &[u8],
        remote_path: &str,
        mode: OverwriteMode,
    ) -> Result<()> {
        let mut files = self.files.lock().unwrap();
        if mode == OverwriteMode::FailIfExists && files.contains_key(remote_path) {
            return Err(Error::Command {
                stage: Stage::FileTransfer,
                exit_code: Some(17),
                message: format!("{remote_path} already exists"),
            });
        }
        files.insert(remote_path.to_string(), data.to_vec());
        self.uploads.lock().unwrap().push((
            remote_path.to_string(),
            String::from_utf8_lossy(data).into_owned(),
        ));
        Ok(())
    }

    async fn download(&self, _credentials: &ServerCredentials, remote_path: &str) -> Result<Vec<u8>> {
        self.files
            .lock()
            .unwrap()
            .get(remote_path)
            .cloned()
            .ok_or_else(|| {
                Error::command(Stage::FileTransfer, format!("cat: {remote_path}: No such file or directory"))
            })
    }
}

// ==============================================================================
// Tunnels
// ==============================================================================

/// Shared record of what fake tunnels went through.
#[derive(Debug, Default)]
pub struct TunnelLog {
    pub started: usize,
    pub stopped: usize,
    pub configs: Vec<String>,
}

/// Tunnel that emits a fixed list of events when started.
pub struct FakeTunnel {
    pub log: Arc<Mutex<TunnelLog>>,
    pub config: String,
    pub script: Vec<TunnelEvent>,
    pub gateways: Gateways,
}

impl FakeTunnel {
    /// A tunnel that connects straight away and reports `gateways`.
    pub fn connecting(log: Arc<Mutex<TunnelLog>>, config: String, gateways: Gateways) -> Self {
        Self {
            log,
            config,
            script: vec![
                TunnelEvent::StateChanged(ConnectionState::Connecting),
                TunnelEvent::Gateways(gateways.clone()),
                TunnelEvent::StateChanged(ConnectionState::Connected),
            ],
            gateways,
        }
    }
}

#[async_trait]
impl TunnelBackend for FakeTunnel {
    async fn start(&mut self, events: mpsc::UnboundedSender<TunnelEvent>) -> Result<()> {
        {
            let mut log = self.log.lock().unwrap();
            log.started += 1;
            log.configs.push(self.config.clone());
        }
        for event in self.script.drain(..) {
            let _ = events.send(event);
        }
        Ok(())
    }

    async fn stop(&mut self) {
        self.log.lock().unwrap().stopped += 1;
    }

    fn gateways(&self) -> Gateways {
        self.gateways.clone()
    }
}

// ==============================================================================
// Daemon
// ==============================================================================

/// Records requests instead of writing them to a socket.
#[derive(Default)]
pub struct FakeDaemon {
    pub unreachable: bool,
    sent: Mutex<Vec<DaemonRequest>>,
}

impl FakeDaemon {
    pub fn unreachable() -> Self {
        Self {
            unreachable: true,
            ..Self::default()
        }
    }

    pub fn sent(&self) -> Vec<DaemonRequest> {
        self.sent.lock().unwrap().clone()
    }

    pub fn clear(&self) {
        self.sent.lock().unwrap().clear();
    }
}

#[async_trait]
impl DaemonControl for FakeDaemon {
    async fn ensure_ready(&self) -> Result<()> {
        if self.unreachable {
            return Err(Error::DaemonInitTimeout { attempts: 11 });
        }
        Ok(())
    }

    async fn send(&self, request: DaemonRequest) -> Result<()> {
        self.sent.lock().unwrap().push(request);
        Ok(())
    }
}

// ==============================================================================
// DNS
// ==============================================================================

#[derive(Default)]
pub struct FakeResolver {
    answers: HashMap<String, Vec<IpAddr>>,
}

impl FakeResolver {
    pub fn with(mut self, host: &str, ips: &[&str]) -> Self {
        self.answers.insert(
            host.to_string(),
            ips.iter().map(|ip| ip.parse().unwrap()).collect(),
        );
        self
    }
}

#[async_trait]
impl SiteResolver for FakeResolver {
    async fn resolve(&self, host: &str) -> std::io::Result<Vec<IpAddr>> {
        self.answers.get(host).cloned().ok_or_else(|| {
            std::io::Error::new(std::io::ErrorKind::NotFound, format!("{host} does not resolve"))
        })
    }
}
