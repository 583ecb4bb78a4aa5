//! Signing identities.

use ed25519_dalek::{Signer, SigningKey, Verifier, VerifyingKey};
use rand_core::OsRng;

/// Something that can sign deployment challenges on behalf of a twin.
pub trait Identity: Send + Sync {
    fn sign(&self, message: &[u8]) -> anyhow::Result<Vec<u8>>;

    /// Scheme name recorded next to each signature.
    fn signature_type(&self) -> &'static str;

    /// Hex-encoded public key.
    fn public_key_hex(&self) -> String;
}

/// An in-process ed25519 keypair.
#[derive(Clone)]
pub struct Ed25519Identity {
    key: SigningKey,
}

impl Ed25519Identity {
    pub fn from_seed(seed: [u8; 32]) -> Self {
        Self {
            key: SigningKey::from_bytes(&seed),
        }
    }

    pub fn generate() -> Self {
        Self {
            key: SigningKey::generate(&mut OsRng),
        }
    }

    pub fn verifying_key(&self) -> VerifyingKey {
        self.key.verifying_key()
    }

    /// Check a raw signature against this identity's public key.
    pub fn verify(&self, message: &[u8], signature: &[u8]) -> bool {
        let Ok(signature) = ed25519_dalek::Signature::from_slice(signature) else {
            return false;
        };
        self.key.verifying_key().verify(message, &signature).is_ok()
    }
}

impl std::fmt::Debug for Ed25519Identity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Ed25519Identity")
            .field("public_key", &self.public_key_hex())
            .finish()
    }
}

impl Identity for Ed25519Identity {
    fn sign(&self, message: &[u8]) -> anyhow::Result<Vec<u8>> {
        Ok(self.key.sign(message).to_bytes().to_vec())
    }

    fn signature_type(&self) -> &'static str {
        "ed25519"
    }

    fn public_key_hex(&self) -> String {
        hex::encode(self.key.verifying_key().as_bytes())
    }
}
