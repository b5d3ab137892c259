// src/error.rs

use thiserror::Error;

use crate::containers::{Protocol, TransportProto};
use crate::provision::Stage;

/// Every failure the orchestrator can report.
///
/// The provisioning controller and the configurators return these to their
/// caller instead of deciding what to do with them. `ServerBusy` in particular
/// is not fatal: the caller is expected to offer a retry.
#[derive(Debug, Error)]
pub enum Error {
    /// Network or authentication failure talking to the remote host or the daemon.
    #[error("connection to {target} failed: {message}")]
    Connection { target: String, message: String },

    /// A remote script exited non-zero or produced output its consumer rejected.
    #[error("{stage} failed{}: {message}", exit_code.map(|c| format!(" (exit code {c})")).unwrap_or_default())]
    Command {
        stage: Stage,
        exit_code: Option<i32>,
        message: String,
    },

    /// The package manager lock is held on the server.
    #[error("server is busy: the package manager is locked by another process")]
    ServerBusy,

    #[error("port {port}/{transport} is already in use on the server")]
    PortUnavailable { port: u16, transport: TransportProto },

    #[error("user '{login}' is not allowed to run commands with sudo")]
    Privilege { login: String },

    #[error("installation was cancelled")]
    Cancelled,

    /// A configurator fetched something it could not use.
    #[error("{protocol} client configuration could not be generated: {message}")]
    ConfigGeneration { protocol: Protocol, message: String },

    #[error("daemon did not become ready after {attempts} connection attempts")]
    DaemonInitTimeout { attempts: u32 },

    #[error("tunnel failed to start: {0}")]
    ProtocolStart(String),

    #[error("no script '{name}' registered{}", container.map(|c| format!(" for {c}")).unwrap_or_default())]
    ScriptNotFound {
        name: &'static str,
        container: Option<crate::containers::DockerContainer>,
    },

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("private key could not be decrypted: {0}")]
    PrivateKey(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

impl Error {
    pub(crate) fn command(stage: Stage, message: impl Into<String>) -> Self {
        Error::Command {
            stage,
            exit_code: None,
            message: message.into(),
        }
    }

    pub(crate) fn daemon(message: impl Into<String>) -> Self {
        Error::Connection {
            target: "daemon".to_string(),
            message: message.into(),
        }
    }

    /// Conditions the caller may simply retry later.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Error::ServerBusy)
    }

    /// The stage a command error was raised in, if any.
    pub fn stage(&self) -> Option<Stage> {
        match self {
            Error::Command { stage, .. } => Some(*stage),
            _ => None,
        }
    }
}
