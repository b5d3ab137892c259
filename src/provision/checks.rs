// src/provision/checks.rs
//
// Pre-flight checks run before an install touches the host.

use tracing::{debug, warn};

use crate::containers::{ContainerConfig, DockerContainer, TransportProto};
use crate::credentials::ServerCredentials;
use crate::error::{Error, Result};
use crate::scripts::{gen_vars_for_script, ScriptKind};

use super::{CollectSink, ServerController, Stage};

impl ServerController {
    /// The login must be root or allowed to run sudo without a password.
    pub async fn is_user_in_sudo(&self, credentials: &ServerCredentials) -> Result<()> {
        let vars = gen_vars_for_script(credentials, None, None);
        let mut sink = CollectSink::default();
        self.run_registry_script(
            credentials,
            ScriptKind::CheckUserInSudo,
            None,
            &vars,
            Stage::Preflight,
            &mut sink,
        )
        .await?;

        match sink.stdout.iter().map(|l| l.trim()).find(|l| !l.is_empty()) {
            Some("root") | Some("sudo") => Ok(()),
            answer => {
                warn!(login = %credentials.login, ?answer, "login cannot escalate privileges");
                Err(Error::Privilege {
                    login: credentials.login.clone(),
                })
            }
        }
    }

    /// Fails with `ServerBusy` while another package manager holds the host's locks.
    pub async fn is_server_dpkg_busy(&self, credentials: &ServerCredentials) -> Result<()> {
        let vars = gen_vars_for_script(credentials, None, None);
        let mut sink = CollectSink::default();
        self.run_registry_script(
            credentials,
            ScriptKind::CheckServerIsBusy,
            None,
            &vars,
            Stage::Preflight,
            &mut sink,
        )
        .await?;

        if sink.stdout.iter().any(|l| l.trim() == "busy") {
            return Err(Error::ServerBusy);
        }
        Ok(())
    }

    /// Fails with `PortUnavailable` when something already listens on the
    /// container's published port.
    pub async fn is_server_port_busy(
        &self,
        credentials: &ServerCredentials,
        container: DockerContainer,
        config: &ContainerConfig,
    ) -> Result<()> {
        let (port, transport) = config.published_endpoint();
        let mut vars = gen_vars_for_script(credentials, Some(container), Some(config));
        vars.push(
            "PORT_CHECK_FLAG",
            match transport {
                TransportProto::Tcp => "t",
                TransportProto::Udp => "u",
            },
        )
        .push("PORT_CHECK_PORT", port.to_string());

        let mut sink = CollectSink::default();
        self.run_registry_script(
            credentials,
            ScriptKind::CheckPortInUse,
            None,
            &vars,
            Stage::Preflight,
            &mut sink,
        )
        .await?;

        if sink.stdout.iter().any(|l| !l.trim().is_empty()) {
            return Err(Error::PortUnavailable { port, transport });
        }
        debug!(port, %transport, "port is free");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::testing::{creds, FakeShell, Reply};

    #[tokio::test]
    async fn root_and_sudo_pass_the_privilege_check() {
        for answer in ["root", "sudo"] {
            let shell = Arc::new(FakeShell::new());
            shell.reply_to("sudo -n true", Reply::stdout(&[answer]));
            let ctl = ServerController::new(shell);
            ctl.is_user_in_sudo(&creds()).await.unwrap();
        }
    }

    #[tokio::test]
    async fn login_without_sudo_is_refused() {
        let shell = Arc::new(FakeShell::new());
        shell.reply_to("sudo -n true", Reply::stdout(&["nosudo"]));
        let ctl = ServerController::new(shell);
        let err = ctl.is_user_in_sudo(&creds()).await.unwrap_err();
        assert!(matches!(err, Error::Privilege { login } if login == "root"));
    }

    #[tokio::test]
    async fn busy_package_manager_is_retryable() {
        let shell = Arc::new(FakeShell::new());
        shell.reply_to("dpkg/lock-frontend", Reply::stdout(&["busy"]));
        let ctl = ServerController::new(shell);
        let err = ctl.is_server_dpkg_busy(&creds()).await.unwrap_err();
        assert!(err.is_retryable());
    }

    #[tokio::test]
    async fn port_check_uses_the_published_transport() {
        let shell = Arc::new(FakeShell::new());
        let ctl = ServerController::new(shell.clone());
        let config = ContainerConfig::create_initial(DockerContainer::Cloak, None, None);

        ctl.is_server_port_busy(&creds(), DockerContainer::Cloak, &config)
            .await
            .unwrap();

        let scripts = shell.executed();
        let check = scripts.last().unwrap();
        assert!(check.contains("-t \"sport = :443\""));
    }
}
