//! Signed events and content-addressed pointers

use serde::{Deserialize, Serialize};

use super::event::Event;
use super::keys::{Digest, Identity, Process, PublicKey};
use super::{decode, encode, ModelError};

/// Location plus digest of an event. Locates and authenticates it.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Pointer {
    pub system: PublicKey,
    pub process: Process,
    pub logical_clock: u64,
    pub digest: Digest,
}

/// Encoded event bytes, their signature, and the signing key.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignedEvent {
    system: PublicKey,
    event: Vec<u8>,
    signature: Vec<u8>,
}

impl SignedEvent {
    /// Assemble from parts without checking anything; use `verify` before trusting it.
    pub fn from_parts(system: PublicKey, event: Vec<u8>, signature: Vec<u8>) -> Self {
        Self {
            system,
            event,
            signature,
        }
    }

    /// Encode and sign `event` with `identity`.
    pub fn sign(identity: &Identity, event: &Event) -> Result<Self, ModelError> {
        let bytes = encode(event)?;
        let signature = identity.sign(&bytes);
        Ok(Self {
            system: identity.public_key(),
            event: bytes,
            signature,
        })
    }

    pub fn system(&self) -> &PublicKey {
        &self.system
    }

    pub fn event_bytes(&self) -> &[u8] {
        &self.event
    }

    pub fn signature(&self) -> &[u8] {
        &self.signature
    }

    /// Check the signature and decode the event.
    pub fn verify(&self) -> Result<Event, ModelError> {
        self.system.verify(&self.event, &self.signature)?;
        let event: Event = decode(&self.event)?;
        if event.system != self.system {
            return Err(ModelError::InvalidSignature);
        }
        Ok(event)
    }

    /// Decode without checking the signature. Only for events read back from
    /// the local store, which verified them on the way in.
    pub fn decode_trusted(&self) -> Result<Event, ModelError> {
        decode(&self.event)
    }

    pub fn digest(&self) -> Digest {
        Digest::of(&self.event)
    }

    /// Pointer for an event that is already known to decode.
    pub fn pointer_for(&self, event: &Event) -> Pointer {
        Pointer {
            system: event.system.clone(),
            process: event.process,
            logical_clock: event.logical_clock,
            digest: self.digest(),
        }
    }

    /// Decode the location and digest of this event.
    pub fn to_pointer(&self) -> Result<Pointer, ModelError> {
        let event = self.decode_trusted()?;
        Ok(self.pointer_for(&event))
    }
}
