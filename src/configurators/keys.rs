// src/configurators/keys.rs
//
// Client-side WireGuard key material.

use std::fmt;

use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use rand::rngs::OsRng;
use x25519_dalek::{PublicKey, StaticSecret};

/// Base64 encoded X25519 key pair for a new client.
pub struct ClientKeyPair {
    secret: StaticSecret,
    public: PublicKey,
}

impl ClientKeyPair {
    pub fn generate() -> Self {
        let secret = StaticSecret::random_from_rng(OsRng);
        let public = PublicKey::from(&secret);
        Self { secret, public }
    }

    pub fn private_base64(&self) -> String {
        BASE64.encode(self.secret.to_bytes())
    }

    pub fn public_base64(&self) -> String {
        BASE64.encode(self.public.as_bytes())
    }
}

impl fmt::Debug for ClientKeyPair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClientKeyPair")
            .field("public", &self.public_base64())
            .finish_non_exhaustive()
    }
}

/// True when `encoded` is a base64 encoded 32 byte key.
pub fn is_valid_key(encoded: &str) -> bool {
    BASE64
        .decode(encoded.trim())
        .is_ok_and(|bytes| bytes.len() == 32)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generated_keys_are_valid_and_distinct() {
        let a = ClientKeyPair::generate();
        let b = ClientKeyPair::generate();
        assert!(is_valid_key(&a.private_base64()));
        assert!(is_valid_key(&a.public_base64()));
        assert_ne!(a.public_base64(), b.public_base64());
    }

    #[test]
    fn public_key_matches_the_private_key() {
        let pair = ClientKeyPair::generate();
        let bytes: [u8; 32] = BASE64
            .decode(pair.private_base64())
            .unwrap()
            .try_into()
            .unwrap();
        let derived = PublicKey::from(&StaticSecret::from(bytes));
        assert_eq!(BASE64.encode(derived.as_bytes()), pair.public_base64());
    }

    #[test]
    fn debug_output_hides_the_private_key() {
        let pair = ClientKeyPair::generate();
        let debug = format!("{pair:?}");
        assert!(!debug.contains(&pair.private_base64()));
    }

    #[test]
    fn garbage_is_not_a_key() {
        assert!(!is_valid_key("not-valid-base64!!!"));
        assert!(!is_valid_key("c2hvcnQ="));
    }
}
