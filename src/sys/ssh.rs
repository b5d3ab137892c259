// src/sys/ssh.rs
//
// RemoteShell backed by the OpenSSH client binaries.

use std::io::Write;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use rand::Rng;
use tempfile::{NamedTempFile, TempPath};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, Command};
use tracing::{debug, warn};
use zeroize::Zeroizing;

use crate::credentials::{ServerCredentials, ServerSecret};
use crate::error::{Error, Result};
use crate::provision::Stage;
use crate::sys::secrets::SecretText;
use crate::sys::traits::{OutputSink, OverwriteMode, RemoteShell};

/// Exit status the ssh client reserves for its own failures.
const TRANSPORT_FAILURE: i32 = 255;
/// Exit status of an upload refused by `OverwriteMode::FailIfExists`.
const TARGET_EXISTS: i32 = 17;
const SECRET_ENV: &str = "VPNORCH_SSH_SECRET";
const ATTEMPTS: u32 = 2;

#[derive(Debug, Clone)]
pub struct SshConfig {
    pub ssh_binary: PathBuf,
    pub keygen_binary: PathBuf,
    pub connect_timeout: Duration,
}

impl Default for SshConfig {
    fn default() -> Self {
        Self {
            ssh_binary: PathBuf::from("ssh"),
            keygen_binary: PathBuf::from("ssh-keygen"),
            connect_timeout: Duration::from_secs(10),
        }
    }
}

/// Transient identity material. Dropping it deletes the file from disk.
enum Identity {
    Key(TempPath),
    Askpass(TempPath),
}

struct Attempt {
    code: i32,
    saw_stdout: bool,
    last_stderr: Option<String>,
}

pub struct OpenSshShell {
    config: SshConfig,
}

impl OpenSshShell {
    pub fn new(config: SshConfig) -> Self {
        Self { config }
    }

    /// 🛡️ Argument injection guard: a host or login starting with '-' would be read as an ssh option.
    fn guard(credentials: &ServerCredentials) -> Result<()> {
        if credentials.host.is_empty()
            || credentials.host.starts_with('-')
            || credentials.login.starts_with('-')
        {
            return Err(Error::InvalidConfig(format!(
                "refusing suspicious ssh destination '{}'",
                credentials.destination()
            )));
        }
        Ok(())
    }

    fn identity(credentials: &ServerCredentials) -> Result<Identity> {
        match &credentials.secret {
            ServerSecret::PrivateKey(key) => {
                // NamedTempFile is created 0600, which ssh insists on for identities.
                let mut temp = NamedTempFile::new()?;
                key.use_secret(|k| {
                    temp.write_all(k.as_bytes())?;
                    if !k.ends_with('\n') {
                        temp.write_all(b"\n")?;
                    }
                    temp.flush()
                })?;
                Ok(Identity::Key(temp.into_temp_path()))
            }
            ServerSecret::Password(_) => Ok(Identity::Askpass(askpass_helper()?)),
        }
    }

    fn command(
        &self,
        credentials: &ServerCredentials,
        identity: &Identity,
        remote_command: &str,
    ) -> Command {
        let mut cmd = Command::new(&self.config.ssh_binary);
        cmd.arg("-T")
            .arg("-p")
            .arg(credentials.port.to_string())
            .arg("-o")
            .arg("StrictHostKeyChecking=accept-new")
            .arg("-o")
            .arg(format!(
                "ConnectTimeout={}",
                self.config.connect_timeout.as_secs().max(1)
            ))
            .arg("-o")
            .arg("ServerAliveInterval=15");

        match identity {
            Identity::Key(path) => {
                cmd.arg("-o")
                    .arg("BatchMode=yes")
                    .arg("-o")
                    .arg("IdentitiesOnly=yes")
                    .arg("-o")
                    .arg("PreferredAuthentications=publickey")
                    .arg("-i")
                    .arg(path.as_os_str());
            }
            Identity::Askpass(path) => {
                cmd.arg("-o")
                    .arg("PreferredAuthentications=password,keyboard-interactive")
                    .arg("-o")
                    .arg("NumberOfPasswordPrompts=1")
                    .env("SSH_ASKPASS", path.as_os_str())
                    .env("SSH_ASKPASS_REQUIRE", "force")
                    .env("DISPLAY", ":0");
                if let ServerSecret::Password(password) = &credentials.secret {
                    password.use_secret(|p| {
                        cmd.env(SECRET_ENV, p);
                    });
                }
            }
        }

        cmd.arg("--")
            .arg(credentials.destination())
            .arg(remote_command)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        cmd
    }

    fn spawn(
        &self,
        credentials: &ServerCredentials,
        identity: &Identity,
        remote_command: &str,
    ) -> Result<Child> {
        self.command(credentials, identity, remote_command)
            .spawn()
            .map_err(|e| Error::Connection {
                target: credentials.host.clone(),
                message: format!("failed to spawn {}: {e}", self.config.ssh_binary.display()),
            })
    }

    /// One ssh session: feeds `input` on stdin and streams both output pipes into `sink`.
    async fn run_once(
        &self,
        credentials: &ServerCredentials,
        remote_command: &str,
        input: &[u8],
        sink: &mut dyn OutputSink,
    ) -> Result<Attempt> {
        let identity = Self::identity(credentials)?;
        let mut child = self.spawn(credentials, &identity, remote_command)?;

        let (Some(mut stdin), Some(stdout), Some(stderr)) =
            (child.stdin.take(), child.stdout.take(), child.stderr.take())
        else {
            return Err(Error::Io(std::io::Error::other("ssh pipes were not captured")));
        };

        // Written from its own task so a chatty remote cannot deadlock us on a full pipe.
        let payload = input.to_vec();
        let writer = tokio::spawn(async move {
            stdin.write_all(&payload).await?;
            stdin.shutdown().await
        });

        let mut out_lines = BufReader::new(stdout).lines();
        let mut err_lines = BufReader::new(stderr).lines();
        let (mut out_done, mut err_done) = (false, false);
        let mut saw_stdout = false;
        let mut last_stderr = None;

        while !(out_done && err_done) {
            let delivered = tokio::select! {
                line = out_lines.next_line(), if !out_done => match line? {
                    Some(line) => {
                        saw_stdout = true;
                        sink.on_stdout(&line)
                    }
                    None => {
                        out_done = true;
                        Ok(())
                    }
                },
                line = err_lines.next_line(), if !err_done => match line? {
                    Some(line) => {
                        let result = sink.on_stderr(&line);
                        last_stderr = Some(line);
                        result
                    }
                    None => {
                        err_done = true;
                        Ok(())
                    }
                },
            };

            if let Err(e) = delivered {
                // The sink asked us to stop; tear the session down and hand its error back.
                let _ = child.kill().await;
                writer.abort();
                return Err(e);
            }
        }

        let status = child.wait().await?;
        let _ = writer.await;

        Ok(Attempt {
            code: status.code().unwrap_or(-1),
            saw_stdout,
            last_stderr,
        })
    }

    /// Runs `remote_command`, retrying once when the transport itself failed.
    async fn run(
        &self,
        credentials: &ServerCredentials,
        remote_command: &str,
        input: &[u8],
        sink: &mut dyn OutputSink,
    ) -> Result<i32> {
        Self::guard(credentials)?;

        for attempt in 1..=ATTEMPTS {
            let outcome = self.run_once(credentials, remote_command, input, sink).await?;
            if outcome.code != TRANSPORT_FAILURE || outcome.saw_stdout {
                return Ok(outcome.code);
            }

            let reason = scrub(
                outcome.last_stderr.as_deref().unwrap_or("ssh exited with status 255"),
                credentials,
            );
            if attempt < ATTEMPTS {
                warn!(host = %credentials.host, %reason, "ssh transport failed, reconnecting");
                continue;
            }
            return Err(Error::Connection {
                target: credentials.host.clone(),
                message: reason,
            });
        }

        Err(Error::Connection {
            target: credentials.host.clone(),
            message: "ssh transport failed".into(),
        })
    }

    /// Decrypts a passphrase-protected private key.
    ///
    /// `prompt` is only called when the key turns out to be protected, and at
    /// most once. An unprotected key is returned as is.
    pub async fn decrypt_private_key<F>(&self, key: &SecretText, prompt: F) -> Result<SecretText>
    where
        F: FnOnce() -> Option<SecretText>,
    {
        let mut temp = NamedTempFile::new()?;
        key.use_secret(|k| {
            temp.write_all(k.as_bytes())?;
            if !k.ends_with('\n') {
                temp.write_all(b"\n")?;
            }
            temp.flush()
        })?;
        let path = temp.into_temp_path();

        if self.keygen(&path, &["-y", "-P", ""]).await? {
            return Ok(key.clone());
        }

        let passphrase = prompt()
            .ok_or_else(|| Error::PrivateKey("the key is protected and no passphrase was given".into()))?;

        let helper = askpass_helper()?;
        let decrypted = self
            .passphrase_removal(&path, &helper, &passphrase)
            .status()
            .await?;

        if !decrypted.success() {
            return Err(Error::PrivateKey("wrong passphrase".into()));
        }

        let plain = Zeroizing::new(tokio::fs::read_to_string(&path).await?);
        debug!("private key decrypted");
        Ok(SecretText::new(plain.as_str().to_owned()))
    }

    /// `ssh-keygen -p` rewriting `key` without a passphrase. The old passphrase
    /// reaches ssh-keygen through the askpass helper, never through argv.
    fn passphrase_removal(&self, key: &Path, helper: &Path, passphrase: &SecretText) -> Command {
        let mut cmd = Command::new(&self.config.keygen_binary);
        cmd.arg("-p")
            .arg("-N")
            .arg("")
            .arg("-f")
            .arg(key)
            .env("SSH_ASKPASS", helper)
            .env("SSH_ASKPASS_REQUIRE", "force")
            .env("DISPLAY", ":0")
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null());
        passphrase.use_secret(|p| {
            cmd.env(SECRET_ENV, p);
        });
        cmd
    }

    async fn keygen(&self, path: &Path, args: &[&str]) -> Result<bool> {
        let status = Command::new(&self.config.keygen_binary)
            .args(args)
            .arg("-f")
            .arg(path)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .await?;
        Ok(status.success())
    }
}

#[async_trait]
impl RemoteShell for OpenSshShell {
    async fn exec(
        &self,
        credentials: &ServerCredentials,
        script: &str,
        sink: &mut dyn OutputSink,
    ) -> Result<i32> {
        let script = prepare_script(credentials, script);
        debug!(host = %credentials.host, lines = script.lines().count(), "running remote script");
        self.run(credentials, "bash -s", script.as_bytes(), sink).await
    }

    async fn upload(
        &self,
        credentials: &ServerCredentials,
        data: &[u8],
        remote_path: &str,
        mode: OverwriteMode,
    ) -> Result<()> {
        let staging = format!("/tmp/vpnorch-upload-{:016x}", rand::thread_rng().r#gen::<u64>());
        let dest = shell_quote(remote_path);
        let dir = shell_quote(parent_dir(remote_path));

        let mut command = format!("umask 077 && cat > {staging}");
        if mode == OverwriteMode::FailIfExists {
            command.push_str(&format!(
                " && if sudo test -e {dest}; then rm -f {staging}; exit {TARGET_EXISTS}; fi"
            ));
        }
        command.push_str(&format!(
            " && sudo mkdir -p {dir} && sudo install -m 600 {staging} {dest}; rc=$?; rm -f {staging}; exit $rc"
        ));
        let command = prepare_script(credentials, &command);

        debug!(host = %credentials.host, path = remote_path, bytes = data.len(), "uploading file");
        let mut tail = StderrTail::default();
        let code = self.run(credentials, &command, data, &mut tail).await?;

        match code {
            0 => Ok(()),
            TARGET_EXISTS => Err(Error::Command {
                stage: Stage::FileTransfer,
                exit_code: Some(code),
                message: format!("{remote_path} already exists"),
            }),
            _ => Err(Error::Command {
                stage: Stage::FileTransfer,
                exit_code: Some(code),
                message: tail
                    .last
                    .unwrap_or_else(|| format!("upload of {remote_path} failed")),
            }),
        }
    }

    async fn download(&self, credentials: &ServerCredentials, remote_path: &str) -> Result<Vec<u8>> {
        Self::guard(credentials)?;
        let command = prepare_script(credentials, &format!("sudo cat -- {}", shell_quote(remote_path)));

        for attempt in 1..=ATTEMPTS {
            let identity = Self::identity(credentials)?;
            let child = self.spawn(credentials, &identity, &command)?;
            let output = child.wait_with_output().await?;
            let code = output.status.code().unwrap_or(-1);
            let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();

            if code == 0 {
                return Ok(output.stdout);
            }
            if code == TRANSPORT_FAILURE && attempt < ATTEMPTS {
                warn!(host = %credentials.host, "ssh transport failed, reconnecting");
                continue;
            }
            if code == TRANSPORT_FAILURE {
                return Err(Error::Connection {
                    target: credentials.host.clone(),
                    message: scrub(&stderr, credentials),
                });
            }
            return Err(Error::Command {
                stage: Stage::FileTransfer,
                exit_code: Some(code),
                message: if stderr.is_empty() {
                    format!("could not read {remote_path}")
                } else {
                    stderr
                },
            });
        }

        Err(Error::Connection {
            target: credentials.host.clone(),
            message: "ssh transport failed".into(),
        })
    }
}

#[derive(Default)]
struct StderrTail {
    last: Option<String>,
}

impl OutputSink for StderrTail {
    fn on_stderr(&mut self, line: &str) -> Result<()> {
        if !line.trim().is_empty() {
            self.last = Some(line.to_string());
        }
        Ok(())
    }
}

fn parent_dir(path: &str) -> &str {
    match path.rfind('/') {
        Some(0) | None => "/",
        Some(idx) => &path[..idx],
    }
}

/// Writes an SSH_ASKPASS helper that echoes the secret from the child's
/// environment, so the secret itself never touches disk.
fn askpass_helper() -> Result<TempPath> {
    let mut temp = tempfile::Builder::new()
        .prefix("vpnorch-askpass-")
        .tempfile()?;
    temp.write_all(format!("#!/bin/sh\nprintf '%s\\n' \"${}\"\n", SECRET_ENV).as_bytes())?;
    temp.flush()?;
    let path = temp.into_temp_path();
    std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o700))?;
    Ok(path)
}

/// Single-quotes `value` for a POSIX shell.
pub fn shell_quote(value: &str) -> String {
    format!("'{}'", value.replace('\'', r"'\''"))
}

/// Root needs no escalation, and minimal images often ship without sudo at all.
pub fn prepare_script(credentials: &ServerCredentials, script: &str) -> String {
    if credentials.is_root() {
        strip_sudo(script)
    } else {
        script.to_string()
    }
}

fn strip_sudo(script: &str) -> String {
    let mut out = String::with_capacity(script.len());
    let mut rest = script;
    while let Some(pos) = rest.find("sudo ") {
        let at_word_start = rest[..pos]
            .chars()
            .next_back()
            .is_none_or(|c| !(c.is_ascii_alphanumeric() || c == '_' || c == '-'));
        out.push_str(&rest[..pos]);
        if !at_word_start {
            out.push_str("sudo ");
        }
        rest = &rest[pos + "sudo ".len()..];
    }
    out.push_str(rest);
    out
}

/// 🛡️ Redacts the credential secret should a remote echo it back into an error message.
fn scrub(message: &str, credentials: &ServerCredentials) -> String {
    let secret = match &credentials.secret {
        ServerSecret::Password(p) | ServerSecret::PrivateKey(p) => p,
    };
    secret.use_secret(|s| {
        if s.len() >= 4 && message.contains(s) {
            message.replace(s, "[REDACTED]")
        } else {
            message.to_string()
        }
    })
}
