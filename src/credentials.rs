// src/credentials.rs

use serde::Deserialize;

use crate::sys::secrets::SecretText;

fn default_ssh_port() -> u16 {
    22
}

/// How the controller authenticates against a server.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ServerSecret {
    Password(SecretText),
    /// PEM/OpenSSH encoded private key, possibly passphrase protected.
    PrivateKey(SecretText),
}

/// Where and as whom to reach a server.
#[derive(Debug, Clone, Deserialize)]
pub struct ServerCredentials {
    pub host: String,
    #[serde(default = "default_ssh_port")]
    pub port: u16,
    pub login: String,
    #[serde(flatten)]
    pub secret: ServerSecret,
}

impl ServerCredentials {
    pub fn is_root(&self) -> bool {
        self.login == "root"
    }

    /// `login@host`, the destination handed to the ssh client.
    pub fn destination(&self) -> String {
        format!("{}@{}", self.login, self.host)
    }

    /// Same credentials with the secret replaced, e.g. by a decrypted key.
    pub fn with_secret(&self, secret: ServerSecret) -> Self {
        Self {
            secret,
            ..self.clone()
        }
    }
}
