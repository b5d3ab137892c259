// src/sys/secrets.rs

use std::fmt;

use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Deserializer};

/// SecretText is an ephemeral, memory-safe wrapper for SSH passwords, private keys
/// and key passphrases.
///
/// 1. It cannot be accidentally logged (`{:?}` prints `[REDACTED]`).
/// 2. When the last clone goes out of scope the heap allocation is zeroized.
#[derive(Clone)]
pub struct SecretText {
    inner: SecretString,
}

impl SecretText {
    pub fn new(raw: String) -> Self {
        // 🛡️ Taking `raw` by value moves the allocation straight into the wrapper,
        // no plaintext copy is left behind for the allocator.
        Self {
            inner: SecretString::new(raw),
        }
    }

    /// Exposes the secret to `action` only. The borrowed `&str` cannot escape the closure.
    pub fn use_secret<F, R>(&self, action: F) -> R
    where
        F: FnOnce(&str) -> R,
    {
        action(self.inner.expose_secret())
    }

    pub fn is_empty(&self) -> bool {
        self.use_secret(str::is_empty)
    }
}

impl fmt::Debug for SecretText {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("[REDACTED]")
    }
}

impl<'de> Deserialize<'de> for SecretText {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        String::deserialize(deserializer).map(SecretText::new)
    }
}
