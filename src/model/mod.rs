//! Event model: identities, events, signatures and pointers
//!
//! Everything that crosses the wire or lands in storage is encoded as CBOR
//! (`ciborium`) through `encode`/`decode`. Encoded structures are structs and
//! sequences only, so the encoding of a value is canonical and its digest is
//! stable.

pub mod event;
pub mod keys;
pub mod signed;

pub use event::{
    ContentType, DeleteBody, Event, LwwElement, LwwElementSetDelta, LwwSetOperation, Reference,
    SystemProcessesBody,
};
pub use keys::{Digest, Identity, Process, PublicKey, KEY_TYPE_ED25519};
pub use signed::{Pointer, SignedEvent};

use serde::{de::DeserializeOwned, Serialize};
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ModelError {
    #[error("Decode error: {0}")]
    DecodeError(String),

    #[error("Encode error: {0}")]
    EncodeError(String),

    #[error("Invalid signature")]
    InvalidSignature,

    #[error("Invalid key material: {0}")]
    InvalidKeyMaterial(String),

    #[error("IO error: {0}")]
    IoError(String),
}

/// Serialize a value to CBOR bytes.
pub fn encode<T: Serialize>(value: &T) -> Result<Vec<u8>, ModelError> {
    let mut buf = Vec::new();
    ciborium::into_writer(value, &mut buf).map_err(|e| ModelError::EncodeError(e.to_string()))?;
    Ok(buf)
}

/// Deserialize a value from CBOR bytes.
pub fn decode<T: DeserializeOwned>(data: &[u8]) -> Result<T, ModelError> {
    ciborium::from_reader(data).map_err(|e| ModelError::DecodeError(e.to_string()))
}
