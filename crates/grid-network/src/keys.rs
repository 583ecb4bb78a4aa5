//! Wireguard keys: x25519, base64 encoded.

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use rand_core::OsRng;
use x25519_dalek::{PublicKey, StaticSecret};

use crate::error::{NetworkError, NetworkResult};

#[derive(Clone, PartialEq, Eq)]
pub struct WgKeyPair {
    pub private_key: String,
    pub public_key: String,
}

impl std::fmt::Debug for WgKeyPair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WgKeyPair")
            .field("public_key", &self.public_key)
            .finish_non_exhaustive()
    }
}

impl WgKeyPair {
    pub fn generate() -> Self {
        let secret = StaticSecret::random_from_rng(OsRng);
        Self {
            private_key: STANDARD.encode(secret.to_bytes()),
            public_key: STANDARD.encode(PublicKey::from(&secret).as_bytes()),
        }
    }

    pub fn from_private(private_key: &str) -> NetworkResult<Self> {
        Ok(Self {
            private_key: private_key.to_string(),
            public_key: public_key(private_key)?,
        })
    }
}

/// Derive the base64 public key of a base64 private key.
pub fn public_key(private_key: &str) -> NetworkResult<String> {
    let bytes = STANDARD
        .decode(private_key.trim())
        .map_err(|e| NetworkError::InvalidKey(e.to_string()))?;
    let bytes: [u8; 32] = bytes
        .try_into()
        .map_err(|b: Vec<u8>| NetworkError::InvalidKey(format!("expected 32 bytes, got {}", b.len())))?;
    let secret = StaticSecret::from(bytes);
    Ok(STANDARD.encode(PublicKey::from(&secret).as_bytes()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generated_pair_is_consistent() {
        let pair = WgKeyPair::generate();
        assert_eq!(public_key(&pair.private_key).unwrap(), pair.public_key);
        assert_eq!(STANDARD.decode(&pair.public_key).unwrap().len(), 32);
        assert_ne!(WgKeyPair::generate(), pair);
    }

    #[test]
    fn derivation_is_deterministic() {
        let private = STANDARD.encode([7u8; 32]);
        let pair = WgKeyPair::from_private(&private).unwrap();
        assert_eq!(pair.public_key, public_key(&private).unwrap());
    }

    #[test]
    fn bad_keys_rejected() {
        assert!(matches!(public_key("!!!"), Err(NetworkError::InvalidKey(_))));
        assert!(matches!(
            public_key(&STANDARD.encode([1u8; 16])),
            Err(NetworkError::InvalidKey(_))
        ));
    }

    #[test]
    fn debug_omits_private_key() {
        let pair = WgKeyPair::generate();
        assert!(!format!("{pair:?}").contains(&pair.private_key));
    }
}
