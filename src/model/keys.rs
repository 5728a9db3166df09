//! System identity, process identifiers and digests
//!
//! A system is identified by its public key. Each writing instance of a system
//! picks a random `Process` once and numbers its events with its own clock.
//! The signing side lives in `Identity`, which persists its secret key as a
//! JSON keystore the same way device identities do.

use std::fmt;
use std::path::Path;

use ed25519_dalek::{Signer, SigningKey, Verifier, VerifyingKey};
use rand::rngs::OsRng;
use serde::{Deserialize, Serialize};
use sha2::{Digest as _, Sha256};
use uuid::Uuid;
use zeroize::Zeroize;

use super::ModelError;

/// Key type tag for Ed25519 keys.
pub const KEY_TYPE_ED25519: u8 = 1;

/// A system's public key: key-type tag plus raw key material.
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PublicKey {
    key_type: u8,
    key: Vec<u8>,
}

impl PublicKey {
    pub fn new(key_type: u8, key: Vec<u8>) -> Self {
        Self { key_type, key }
    }

    pub fn from_verifying_key(key: &VerifyingKey) -> Self {
        Self {
            key_type: KEY_TYPE_ED25519,
            key: key.to_bytes().to_vec(),
        }
    }

    pub fn key_type(&self) -> u8 {
        self.key_type
    }

    pub fn key(&self) -> &[u8] {
        &self.key
    }

    /// Verify `signature` over `data` with this key.
    pub fn verify(&self, data: &[u8], signature: &[u8]) -> Result<(), ModelError> {
        if self.key_type != KEY_TYPE_ED25519 {
            return Err(ModelError::InvalidKeyMaterial(format!(
                "unsupported key type {}",
                self.key_type
            )));
        }
        let bytes: [u8; 32] = self.key.as_slice().try_into().map_err(|_| {
            ModelError::InvalidKeyMaterial(format!("expected 32 key bytes, got {}", self.key.len()))
        })?;
        let key = VerifyingKey::from_bytes(&bytes)
            .map_err(|e| ModelError::InvalidKeyMaterial(e.to_string()))?;
        let signature =
            ed25519_dalek::Signature::from_slice(signature).map_err(|_| ModelError::InvalidSignature)?;
        key.verify(data, &signature)
            .map_err(|_| ModelError::InvalidSignature)
    }
}

impl fmt::Debug for PublicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PublicKey({}:{})", self.key_type, hex::encode(&self.key))
    }
}

impl fmt::Display for PublicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let short = &self.key[..self.key.len().min(8)];
        write!(f, "{}", hex::encode(short))
    }
}

/// Random identifier of one writing instance of a system.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Process([u8; 16]);

impl Process {
    pub fn generate() -> Self {
        Self(*Uuid::new_v4().as_bytes())
    }

    pub fn from_bytes(bytes: [u8; 16]) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; 16] {
        &self.0
    }
}

impl fmt::Debug for Process {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Process({})", hex::encode(self.0))
    }
}

impl fmt::Display for Process {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", hex::encode(&self.0[..4]))
    }
}

/// SHA-256 digest of an encoded event.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Digest([u8; 32]);

impl Digest {
    pub fn of(data: &[u8]) -> Self {
        Self(Sha256::digest(data).into())
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }
}

impl fmt::Debug for Digest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Digest({})", hex::encode(&self.0[..8]))
    }
}

/// Serializable form of an Identity. Zeroized on drop.
#[derive(Serialize, Deserialize)]
struct IdentityStore {
    signing_key_bytes: [u8; 32],
}

impl Drop for IdentityStore {
    fn drop(&mut self) {
        self.signing_key_bytes.zeroize();
    }
}

/// The signing half of a system.
pub struct Identity {
    signing_key: SigningKey,
}

impl Identity {
    pub fn generate() -> Self {
        Self {
            signing_key: SigningKey::generate(&mut OsRng),
        }
    }

    pub fn from_secret_bytes(bytes: &[u8; 32]) -> Self {
        Self {
            signing_key: SigningKey::from_bytes(bytes),
        }
    }

    pub fn public_key(&self) -> PublicKey {
        PublicKey::from_verifying_key(&self.signing_key.verifying_key())
    }

    pub fn sign(&self, data: &[u8]) -> Vec<u8> {
        self.signing_key.sign(data).to_bytes().to_vec()
    }

    /// Load from a JSON keystore file.
    pub fn load(path: &Path) -> Result<Self, ModelError> {
        let data = std::fs::read(path).map_err(|e| ModelError::IoError(e.to_string()))?;
        let store: IdentityStore =
            serde_json::from_slice(&data).map_err(|e| ModelError::DecodeError(e.to_string()))?;
        Ok(Self::from_secret_bytes(&store.signing_key_bytes))
    }

    /// Persist to a JSON keystore file.
    pub fn save(&self, path: &Path) -> Result<(), ModelError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| ModelError::IoError(e.to_string()))?;
        }
        let store = IdentityStore {
            signing_key_bytes: self.signing_key.to_bytes(),
        };
        let json = serde_json::to_string_pretty(&store)
            .map_err(|e| ModelError::EncodeError(e.to_string()))?;
        std::fs::write(path, json).map_err(|e| ModelError::IoError(e.to_string()))
    }

    /// Load from path if it exists, otherwise generate and save.
    pub fn load_or_generate(path: &Path) -> Result<Self, ModelError> {
        if path.exists() {
            Self::load(path)
        } else {
            let identity = Self::generate();
            identity.save(path)?;
            Ok(identity)
        }
    }
}

impl fmt::Debug for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Identity")
            .field("public_key", &self.public_key())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sign_and_verify() {
        let id = Identity::generate();
        let sig = id.sign(b"hello");
        assert!(id.public_key().verify(b"hello", &sig).is_ok());
        assert!(matches!(
            id.public_key().verify(b"hellp", &sig),
            Err(ModelError::InvalidSignature)
        ));
    }

    #[test]
    fn test_public_key_equality_includes_type() {
        let id = Identity::generate();
        let pk = id.public_key();
        let other_type = PublicKey::new(2, pk.key().to_vec());
        assert_ne!(pk, other_type);
        assert_eq!(pk, PublicKey::new(KEY_TYPE_ED25519, pk.key().to_vec()));
    }

    #[test]
    fn test_unsupported_key_type() {
        let pk = PublicKey::new(9, vec![0; 32]);
        assert!(matches!(
            pk.verify(b"x", &[0; 64]),
            Err(ModelError::InvalidKeyMaterial(_))
        ));
    }

    #[test]
    fn test_save_and_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("keys").join("identity.json");

        let original = Identity::generate();
        original.save(&path).unwrap();
        let loaded = Identity::load(&path).unwrap();
        assert_eq!(original.public_key(), loaded.public_key());

        let again = Identity::load_or_generate(&path).unwrap();
        assert_eq!(again.public_key(), original.public_key());
    }

    #[test]
    fn test_processes_are_random() {
        assert_ne!(Process::generate(), Process::generate());
    }
}
