// src/daemon/channel.rs
//
// One actor task owns the daemon socket. Callers talk to it through a cloneable
// DaemonHandle; everything the daemon says comes back as DaemonEvents on a
// broadcast channel.

use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::UnixStream;
use tokio::net::unix::{OwnedReadHalf, OwnedWriteHalf};
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::time::{Instant, sleep_until};
use tracing::{debug, error, info, warn};

use crate::error::{Error, Result};

use super::protocol::DaemonRequest;
use super::session::{DaemonEvent, DaemonSession, DaemonState, RetryDecision};

const READ_CHUNK: usize = 4096;
const EVENT_CAPACITY: usize = 64;

#[derive(Debug, Clone)]
pub struct DaemonConfig {
    pub socket_path: PathBuf,
    /// Used when `socket_path` does not exist, e.g. a daemon started by hand.
    pub fallback_socket_path: PathBuf,
    pub retry_delay: Duration,
    pub max_retries: u32,
    pub max_line_length: usize,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            socket_path: PathBuf::from("/var/run/vpn-orchestrator/daemon.socket"),
            fallback_socket_path: PathBuf::from("/tmp/vpn-orchestrator.socket"),
            retry_delay: Duration::from_millis(500),
            max_retries: 10,
            max_line_length: 64 * 1024,
        }
    }
}

impl DaemonConfig {
    pub fn resolve_socket_path(&self) -> &Path {
        if self.socket_path.exists() {
            &self.socket_path
        } else {
            &self.fallback_socket_path
        }
    }
}

enum Command {
    Connect,
    Send(DaemonRequest, oneshot::Sender<Result<()>>),
    Logs(oneshot::Sender<String>),
    CleanLogs,
}

#[derive(Clone)]
pub struct DaemonHandle {
    commands: mpsc::UnboundedSender<Command>,
    state: watch::Receiver<DaemonState>,
    events: broadcast::Sender<DaemonEvent>,
}

impl DaemonHandle {
    /// Starts the actor. No connection is attempted until `connect` or
    /// `ensure_ready` is called.
    pub fn spawn(config: DaemonConfig) -> Self {
        let (commands, rx) = mpsc::unbounded_channel();
        let (state_tx, state) = watch::channel(DaemonState::Unknown);
        let (events, _) = broadcast::channel(EVENT_CAPACITY);

        let actor = DaemonActor {
            session: DaemonSession::new(config.max_retries, config.max_line_length),
            config,
            commands: rx,
            state: state_tx,
            events: events.clone(),
            reader: None,
            writer: None,
            retry_at: None,
            pending_logs: None,
        };
        tokio::spawn(actor.run());

        Self { commands, state, events }
    }

    pub fn state(&self) -> DaemonState {
        *self.state.borrow()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<DaemonEvent> {
        self.events.subscribe()
    }

    pub fn connect(&self) {
        let _ = self.commands.send(Command::Connect);
    }

    /// Connects if needed and waits until the daemon answered its first status.
    pub async fn ensure_ready(&self) -> Result<()> {
        // Subscribe before looking at the state: the actor publishes Ready
        // before it emits Initialized, so one of the two is always seen.
        let mut events = self.subscribe();
        if self.state() == DaemonState::Ready {
            return Ok(());
        }
        self.connect();

        loop {
            match events.recv().await {
                Ok(DaemonEvent::Initialized { .. }) => return Ok(()),
                Ok(DaemonEvent::InitializationFailed { attempts }) => {
                    return Err(Error::DaemonInitTimeout { attempts });
                }
                Ok(_) => {}
                Err(broadcast::error::RecvError::Lagged(_)) => {
                    if self.state() == DaemonState::Ready {
                        return Ok(());
                    }
                }
                Err(broadcast::error::RecvError::Closed) => {
                    return Err(Error::daemon("daemon channel shut down"));
                }
            }
        }
    }

    /// Writes one request. Fails unless the session is Ready.
    pub async fn send(&self, request: DaemonRequest) -> Result<()> {
        let (tx, rx) = oneshot::channel();
        self.commands
            .send(Command::Send(request, tx))
            .map_err(|_| Error::daemon("daemon channel shut down"))?;
        rx.await.map_err(|_| Error::daemon("daemon channel shut down"))?
    }

    /// Backend log text, or an empty string when the daemon is unavailable.
    pub async fn backend_logs(&self) -> String {
        let (tx, rx) = oneshot::channel();
        if self.commands.send(Command::Logs(tx)).is_err() {
            return String::new();
        }
        rx.await.unwrap_or_default()
    }

    pub fn clean_logs(&self) {
        let _ = self.commands.send(Command::CleanLogs);
    }
}

/// What the connection orchestrator needs from the daemon.
#[async_trait]
pub trait DaemonControl: Send + Sync {
    async fn ensure_ready(&self) -> Result<()>;

    async fn send(&self, request: DaemonRequest) -> Result<()>;
}

#[async_trait]
impl DaemonControl for DaemonHandle {
    async fn ensure_ready(&self) -> Result<()> {
        DaemonHandle::ensure_ready(self).await
    }

    async fn send(&self, request: DaemonRequest) -> Result<()> {
        DaemonHandle::send(self, request).await
    }
}

struct DaemonActor {
    config: DaemonConfig,
    session: DaemonSession,
    commands: mpsc::UnboundedReceiver<Command>,
    state: watch::Sender<DaemonState>,
    events: broadcast::Sender<DaemonEvent>,
    reader: Option<OwnedReadHalf>,
    writer: Option<OwnedWriteHalf>,
    retry_at: Option<Instant>,
    pending_logs: Option<oneshot::Sender<String>>,
}

async fn read_some(reader: &mut Option<OwnedReadHalf>, buf: &mut [u8]) -> std::io::Result<usize> {
    match reader {
        Some(reader) => reader.read(buf).await,
        None => std::future::pending().await,
    }
}

async fn wait_until(at: Option<Instant>) {
    match at {
        Some(at) => sleep_until(at).await,
        None => std::future::pending().await,
    }
}

impl DaemonActor {
    async fn run(mut self) {
        let mut buf = vec![0u8; READ_CHUNK];
        loop {
            tokio::select! {
                command = self.commands.recv() => match command {
                    Some(command) => self.handle_command(command).await,
                    None => break,
                },
                read = read_some(&mut self.reader, &mut buf) => match read {
                    Ok(0) => self.on_closed(),
                    Ok(n) => self.on_bytes(&buf[..n]),
                    Err(err) => {
                        warn!(%err, "daemon socket read failed");
                        self.on_closed();
                    }
                },
                _ = wait_until(self.retry_at) => {
                    self.retry_at = None;
                    self.attempt_connect().await;
                }
            }
        }
        debug!("daemon channel stopped");
    }

    async fn handle_command(&mut self, command: Command) {
        match command {
            Command::Connect => {
                if self.session.begin_connect() {
                    self.publish_state();
                    self.attempt_connect().await;
                } else {
                    debug!(state = ?self.session.state(), "connect ignored");
                }
            }
            Command::Send(request, reply) => {
                let result = if self.session.state() == DaemonState::Ready {
                    self.write(&request).await
                } else {
                    Err(Error::daemon(format!(
                        "cannot send {}: daemon session is {:?}",
                        request.kind(),
                        self.session.state()
                    )))
                };
                let _ = reply.send(result);
            }
            Command::Logs(reply) => {
                // Only one caller waits for logs at a time.
                if let Some(previous) = self.pending_logs.take() {
                    let _ = previous.send(String::new());
                }
                if self.session.state() != DaemonState::Ready {
                    let _ = reply.send(String::new());
                    return;
                }
                match self.write(&DaemonRequest::Logs).await {
                    Ok(()) => self.pending_logs = Some(reply),
                    Err(_) => {
                        let _ = reply.send(String::new());
                    }
                }
            }
            Command::CleanLogs => {
                if let Some(previous) = self.pending_logs.take() {
                    let _ = previous.send(String::new());
                }
                if self.session.state() == DaemonState::Ready {
                    let _ = self.write(&DaemonRequest::CleanLogs).await;
                }
            }
        }
    }

    async fn attempt_connect(&mut self) {
        let path = self.config.resolve_socket_path().to_path_buf();
        debug!(path = %path.display(), "connecting to daemon");

        match UnixStream::connect(&path).await {
            Ok(stream) => {
                let (reader, writer) = stream.into_split();
                self.reader = Some(reader);
                self.writer = Some(writer);
                info!(path = %path.display(), "daemon socket connected");
                if self.write(&DaemonRequest::Status).await.is_err() {
                    self.drop_transport();
                    self.on_connect_failed();
                }
            }
            Err(err) => {
                warn!(%err, path = %path.display(), "daemon connection failed");
                self.on_connect_failed();
            }
        }
    }

    fn on_connect_failed(&mut self) {
        match self.session.on_connect_failed() {
            RetryDecision::Retry => {
                self.retry_at = Some(Instant::now() + self.config.retry_delay);
            }
            RetryDecision::GiveUp { attempts } => {
                error!(attempts, "daemon did not become ready");
                self.publish_state();
                self.emit(DaemonEvent::InitializationFailed { attempts });
            }
        }
    }

    fn on_bytes(&mut self, bytes: &[u8]) {
        for event in self.session.feed(bytes) {
            match event {
                DaemonEvent::Logs(text) => {
                    if let Some(reply) = self.pending_logs.take() {
                        let _ = reply.send(text);
                    }
                }
                DaemonEvent::Initialized { .. } => {
                    info!("daemon ready");
                    self.publish_state();
                    self.emit(event);
                }
                other => self.emit(other),
            }
        }
    }

    fn on_closed(&mut self) {
        self.drop_transport();
        if let Some(reply) = self.pending_logs.take() {
            let _ = reply.send(String::new());
        }
        match self.session.on_transport_closed() {
            DaemonState::Ready => {
                warn!("daemon closed the connection");
                self.publish_state();
                self.emit(DaemonEvent::TransportClosed);
            }
            // Gone before the first status; counts as a failed attempt.
            DaemonState::Initializing => self.on_connect_failed(),
            DaemonState::Unknown | DaemonState::Detached => {}
        }
    }

    fn drop_transport(&mut self) {
        self.reader = None;
        self.writer = None;
    }

    async fn write(&mut self, request: &DaemonRequest) -> Result<()> {
        let line = request.to_line()?;
        let writer = self
            .writer
            .as_mut()
            .ok_or_else(|| Error::daemon("daemon socket is not connected"))?;
        writer
            .write_all(line.as_bytes())
            .await
            .map_err(|e| Error::daemon(format!("write to daemon failed: {e}")))?;
        debug!(kind = request.kind(), "sent daemon request");
        Ok(())
    }

    fn publish_state(&self) {
        let state = self.session.state();
        if *self.state.borrow() != state {
            self.state.send_replace(state);
            self.emit(DaemonEvent::StateChanged(state));
        }
    }

    fn emit(&self, event: DaemonEvent) {
        // No subscribers is fine.
        let _ = self.events.send(event);
    }
}
