//! Event store over an ordered key-value engine
//!
//! Tables (see `keys`):
//! - events by `(system, process, clock)`
//! - process state and system state
//! - tombstones by target location
//! - content-type index, newest first
//! - reference index by target pointer or raw bytes
//! - per-server acknowledgement ranges and address hints
//!
//! Reads go straight to the engine. Writes for one event are built as a list
//! of `KvOp`s by the ingest pipeline and committed with a single `apply`.

pub mod keys;
pub mod state;

pub use state::{LwwElementSet, LwwSetEntry, ProcessState, SystemState, Tombstone};

use std::collections::BTreeSet;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::model::{decode, encode, ContentType, Digest, ModelError, Pointer, Process, PublicKey, SignedEvent};
use crate::ranges::{RangesForProcess, RangesForSystem};
use crate::storage::{KvOp, KvStore, StorageError};

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("Model error: {0}")]
    Model(#[from] ModelError),
}

/// Row of the content-type index.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexEntry {
    pub process: Process,
    pub logical_clock: u64,
    /// Absent when the row was announced by a Delete before the event arrived.
    pub digest: Option<Digest>,
}

/// Tombstone-aware view of one event location.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum EventState {
    /// Nothing stored and nothing deleted.
    Absent,
    Present(SignedEvent),
    /// Deleted by the event at `mutation`.
    Deleted { mutation: Pointer },
}

impl EventState {
    pub fn event(&self) -> Option<&SignedEvent> {
        match self {
            EventState::Present(signed) => Some(signed),
            _ => None,
        }
    }

    pub fn is_deleted(&self) -> bool {
        matches!(self, EventState::Deleted { .. })
    }
}

#[derive(Clone)]
pub struct Store {
    kv: Arc<dyn KvStore>,
}

impl Store {
    pub fn new(kv: Arc<dyn KvStore>) -> Self {
        Self { kv }
    }

    async fn get_decoded<T: serde::de::DeserializeOwned>(
        &self,
        key: &[u8],
    ) -> Result<Option<T>, StoreError> {
        match self.kv.get(key).await? {
            Some(bytes) => Ok(Some(decode(&bytes)?)),
            None => Ok(None),
        }
    }

    /// Commit a list of mutations atomically.
    pub async fn apply(&self, ops: Vec<KvOp>) -> Result<(), StoreError> {
        self.kv.batch(ops).await?;
        Ok(())
    }

    // ---------------------------------------------------------------------
    // Events
    // ---------------------------------------------------------------------

    pub fn event_op(&self, signed: &SignedEvent, process: &Process, clock: u64) -> Result<KvOp, StoreError> {
        Ok(KvOp::put(
            keys::event(signed.system(), process, clock),
            encode(signed)?,
        ))
    }

    /// Write the event row alone. The ingest pipeline writes it together with
    /// the derived rows instead.
    pub async fn put_event(&self, signed: &SignedEvent) -> Result<Pointer, StoreError> {
        let pointer = signed.to_pointer()?;
        let op = self.event_op(signed, &pointer.process, pointer.logical_clock)?;
        self.apply(vec![op]).await?;
        Ok(pointer)
    }

    /// Raw stored event, whether or not it has been deleted.
    pub async fn get_event(
        &self,
        system: &PublicKey,
        process: &Process,
        clock: u64,
    ) -> Result<Option<SignedEvent>, StoreError> {
        self.get_decoded(&keys::event(system, process, clock)).await
    }

    pub async fn tombstone(
        &self,
        system: &PublicKey,
        process: &Process,
        clock: u64,
    ) -> Result<Option<Pointer>, StoreError> {
        Ok(self
            .tombstone_record(system, process, clock)
            .await?
            .map(|tombstone| tombstone.mutation))
    }

    pub async fn tombstone_record(
        &self,
        system: &PublicKey,
        process: &Process,
        clock: u64,
    ) -> Result<Option<Tombstone>, StoreError> {
        self.get_decoded(&keys::tombstone(system, process, clock)).await
    }

    pub fn tombstone_op(
        &self,
        system: &PublicKey,
        process: &Process,
        clock: u64,
        tombstone: &Tombstone,
    ) -> Result<KvOp, StoreError> {
        Ok(KvOp::put(keys::tombstone(system, process, clock), encode(tombstone)?))
    }

    pub async fn event_state(
        &self,
        system: &PublicKey,
        process: &Process,
        clock: u64,
    ) -> Result<EventState, StoreError> {
        if let Some(mutation) = self.tombstone(system, process, clock).await? {
            return Ok(EventState::Deleted { mutation });
        }
        Ok(match self.get_event(system, process, clock).await? {
            Some(signed) => EventState::Present(signed),
            None => EventState::Absent,
        })
    }

    /// The event unless it is missing or deleted.
    pub async fn get_live_event(
        &self,
        system: &PublicKey,
        process: &Process,
        clock: u64,
    ) -> Result<Option<SignedEvent>, StoreError> {
        Ok(match self.event_state(system, process, clock).await? {
            EventState::Present(signed) => Some(signed),
            _ => None,
        })
    }

    /// Raw events for every clock in `ranges`, skipping holes.
    pub async fn events_in_ranges(
        &self,
        system: &PublicKey,
        ranges: &RangesForSystem,
    ) -> Result<Vec<SignedEvent>, StoreError> {
        let mut out = Vec::with_capacity(ranges.len().min(4096) as usize);
        for (process, process_ranges) in ranges.iter() {
            for clock in process_ranges.clocks() {
                if let Some(signed) = self.get_event(system, process, clock).await? {
                    out.push(signed);
                }
            }
        }
        Ok(out)
    }

    // ---------------------------------------------------------------------
    // Process and system state
    // ---------------------------------------------------------------------

    pub async fn get_process_state(
        &self,
        system: &PublicKey,
        process: &Process,
    ) -> Result<ProcessState, StoreError> {
        Ok(self
            .get_decoded(&keys::process_state(system, process))
            .await?
            .unwrap_or_default())
    }

    pub fn process_state_op(
        &self,
        system: &PublicKey,
        process: &Process,
        state: &ProcessState,
    ) -> Result<KvOp, StoreError> {
        Ok(KvOp::put(keys::process_state(system, process), encode(state)?))
    }

    pub async fn put_process_state(
        &self,
        system: &PublicKey,
        process: &Process,
        state: &ProcessState,
    ) -> Result<(), StoreError> {
        let op = self.process_state_op(system, process, state)?;
        self.apply(vec![op]).await
    }

    pub async fn get_system_state(&self, system: &PublicKey) -> Result<SystemState, StoreError> {
        Ok(self
            .get_decoded(&keys::system_state(system))
            .await?
            .unwrap_or_default())
    }

    pub fn system_state_op(&self, system: &PublicKey, state: &SystemState) -> Result<KvOp, StoreError> {
        Ok(KvOp::put(keys::system_state(system), encode(state)?))
    }

    pub async fn put_system_state(&self, system: &PublicKey, state: &SystemState) -> Result<(), StoreError> {
        let op = self.system_state_op(system, state)?;
        self.apply(vec![op]).await
    }

    /// Stored ranges for every process of `system`.
    pub async fn ranges_for_system(&self, system: &PublicKey) -> Result<RangesForSystem, StoreError> {
        let prefix = keys::process_state_prefix(system);
        let mut out = RangesForSystem::new();
        for (key, value) in self.kv.iterate(&prefix).await? {
            let process_bytes: [u8; 16] = key[prefix.len()..].try_into().map_err(|_| {
                StorageError::Corrupt(format!("process state key of length {}", key.len()))
            })?;
            let state: ProcessState = decode(&value)?;
            out.insert(Process::from_bytes(process_bytes), state.ranges);
        }
        Ok(out)
    }

    /// Merged register value for a content type.
    pub async fn crdt_value(
        &self,
        system: &PublicKey,
        content_type: ContentType,
    ) -> Result<Option<Vec<u8>>, StoreError> {
        let state = self.get_system_state(system).await?;
        Ok(state.register(content_type).map(|e| e.value.clone()))
    }

    /// Members of a merged element set.
    pub async fn crdt_set(
        &self,
        system: &PublicKey,
        content_type: ContentType,
    ) -> Result<BTreeSet<Vec<u8>>, StoreError> {
        Ok(self.get_system_state(system).await?.set_members(content_type))
    }

    // ---------------------------------------------------------------------
    // Secondary indices
    // ---------------------------------------------------------------------

    /// Page through the content-type index, newest first. `after` is the
    /// index key of the last row already seen.
    pub async fn events_by_content_type(
        &self,
        system: &PublicKey,
        content_type: ContentType,
        after: Option<&[u8]>,
        limit: usize,
    ) -> Result<Vec<(Vec<u8>, IndexEntry)>, StoreError> {
        let prefix = keys::content_index_prefix(system, content_type);
        let rows = self.kv.iterate_after(&prefix, after, limit).await?;
        rows.into_iter()
            .map(|(key, value)| Ok((key, decode(&value)?)))
            .collect()
    }

    /// Index row of one location, placeholder or not.
    pub async fn index_entry(
        &self,
        system: &PublicKey,
        content_type: ContentType,
        process: &Process,
        clock: u64,
    ) -> Result<Option<IndexEntry>, StoreError> {
        self.get_decoded(&keys::content_index(system, content_type, process, clock))
            .await
    }

    /// Pointers of every stored event that references `target`.
    pub async fn events_referencing(&self, target: &Pointer) -> Result<Vec<Pointer>, StoreError> {
        let prefix = keys::reference_pointer_prefix(&target.system, &target.process, target.logical_clock);
        self.kv
            .iterate(&prefix)
            .await?
            .into_iter()
            .map(|(_, value)| Ok(decode(&value)?))
            .collect()
    }

    /// Pointers of every stored event carrying a raw-bytes reference equal to `bytes`.
    pub async fn events_referencing_bytes(&self, bytes: &[u8]) -> Result<Vec<Pointer>, StoreError> {
        let prefix = keys::reference_bytes_prefix(bytes);
        self.kv
            .iterate(&prefix)
            .await?
            .into_iter()
            .map(|(_, value)| Ok(decode(&value)?))
            .collect()
    }

    // ---------------------------------------------------------------------
    // Servers
    // ---------------------------------------------------------------------

    /// Ranges `server` is known to hold for one process.
    pub async fn server_acks(
        &self,
        server: &str,
        system: &PublicKey,
        process: &Process,
    ) -> Result<RangesForProcess, StoreError> {
        Ok(self
            .get_decoded(&keys::server_ack(server, system, process))
            .await?
            .unwrap_or_default())
    }

    /// Mark `ranges` as held by `server`.
    pub async fn record_server_ack(
        &self,
        server: &str,
        system: &PublicKey,
        ranges: &RangesForSystem,
    ) -> Result<(), StoreError> {
        let mut ops = Vec::new();
        for (process, acked) in ranges.iter() {
            let merged = self.server_acks(server, system, process).await?.union(acked);
            ops.push(KvOp::put(keys::server_ack(server, system, process), encode(&merged)?));
        }
        self.apply(ops).await
    }

    pub async fn put_address_hint(&self, system: &PublicKey, server: &str) -> Result<(), StoreError> {
        self.kv
            .put(keys::address_hint(system, server), server.as_bytes().to_vec())
            .await?;
        Ok(())
    }

    pub async fn address_hints(&self, system: &PublicKey) -> Result<BTreeSet<String>, StoreError> {
        let prefix = keys::address_hint_prefix(system);
        Ok(self
            .kv
            .iterate(&prefix)
            .await?
            .into_iter()
            .filter_map(|(_, value)| String::from_utf8(value).ok())
            .collect())
    }

    /// Address hints plus the system's merged server list.
    pub async fn servers_for_system(&self, system: &PublicKey) -> Result<BTreeSet<String>, StoreError> {
        let mut servers = self.address_hints(system).await?;
        for raw in self.crdt_set(system, ContentType::Server).await? {
            match String::from_utf8(raw) {
                Ok(server) => {
                    servers.insert(server);
                }
                Err(e) => log::debug!("skipping non-utf8 server entry for {}: {}", system, e),
            }
        }
        Ok(servers)
    }
}
