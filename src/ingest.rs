//! Ingest pipeline
//!
//! Turns a signed event into the set of storage mutations it implies, commits
//! them as one batch and tells the query layer what changed. Ingestion is
//! serialized per system, so the read-modify-write of process and system
//! state is never interleaved for the same system.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};

use thiserror::Error;
use tokio::sync::broadcast;

use crate::model::{
    decode, encode, ContentType, DeleteBody, Event, ModelError, Pointer, Process, PublicKey,
    Reference, SignedEvent, SystemProcessesBody,
};
use crate::storage::KvOp;
use crate::store::{keys, IndexEntry, Store, StoreError, Tombstone};

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum IngestError {
    #[error("Model error: {0}")]
    Model(#[from] ModelError),

    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("Conflicting event at {process}:{logical_clock}")]
    ConflictingEvent { process: Process, logical_clock: u64 },

    #[error("Invalid delete: {0}")]
    InvalidDelete(String),
}

impl IngestError {
    /// Permanent failures are properties of the event itself and must not be retried.
    pub fn is_permanent(&self) -> bool {
        !matches!(self, IngestError::Store(_))
    }
}

/// Change published after a successful ingest.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Notification {
    EventStored {
        system: PublicKey,
        process: Process,
        logical_clock: u64,
        content_type: ContentType,
    },
    /// A delete landed for this location. The target may not have arrived yet.
    Tombstoned {
        system: PublicKey,
        process: Process,
        logical_clock: u64,
        content_type: ContentType,
    },
    CrdtChanged {
        system: PublicKey,
        content_type: ContentType,
    },
    HintsChanged {
        system: PublicKey,
    },
}

impl Notification {
    pub fn system(&self) -> &PublicKey {
        match self {
            Notification::EventStored { system, .. }
            | Notification::Tombstoned { system, .. }
            | Notification::CrdtChanged { system, .. }
            | Notification::HintsChanged { system } => system,
        }
    }

    /// True if this change can alter what is stored at `(process, clock)`.
    pub fn touches(&self, process: &Process, clock: u64) -> bool {
        match self {
            Notification::EventStored {
                process: p,
                logical_clock,
                ..
            }
            | Notification::Tombstoned {
                process: p,
                logical_clock,
                ..
            } => p == process && *logical_clock == clock,
            _ => false,
        }
    }

    /// Content type whose index or register this change affects, if any.
    pub fn content_type(&self) -> Option<ContentType> {
        match self {
            Notification::EventStored { content_type, .. }
            | Notification::Tombstoned { content_type, .. }
            | Notification::CrdtChanged { content_type, .. } => Some(*content_type),
            Notification::HintsChanged { .. } => None,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum IngestOutcome {
    Stored,
    /// Already covered with an identical digest; nothing was written.
    Duplicate,
}

/// Everything one event will change, computed before anything is written.
#[derive(Clone, Debug)]
pub struct Prepared {
    pub pointer: Pointer,
    pub outcome: IngestOutcome,
    pub mutations: Vec<KvOp>,
    pub notifications: Vec<Notification>,
}

pub struct Ingester {
    store: Store,
    notifications: broadcast::Sender<Notification>,
    system_locks: Mutex<HashMap<PublicKey, Arc<tokio::sync::Mutex<()>>>>,
}

impl Ingester {
    pub fn new(store: Store, notification_capacity: usize) -> Self {
        let (notifications, _) = broadcast::channel(notification_capacity.max(1));
        Self {
            store,
            notifications,
            system_locks: Mutex::new(HashMap::new()),
        }
    }

    pub fn store(&self) -> &Store {
        &self.store
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Notification> {
        self.notifications.subscribe()
    }

    /// Publish a change that did not come from an event, such as a new
    /// address hint.
    pub fn publish(&self, notification: Notification) {
        // No receivers is fine.
        let _ = self.notifications.send(notification);
    }

    fn system_lock(&self, system: &PublicKey) -> Arc<tokio::sync::Mutex<()>> {
        let mut locks = self
            .system_locks
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        locks.entry(system.clone()).or_default().clone()
    }

    /// Verify, store and announce one event.
    pub async fn ingest(&self, signed: &SignedEvent) -> Result<IngestOutcome, IngestError> {
        let lock = self.system_lock(signed.system());
        let _guard = lock.lock().await;

        let prepared = self.prepare(signed).await?;
        if prepared.outcome == IngestOutcome::Duplicate {
            log::debug!(
                "duplicate {}:{} for {}",
                prepared.pointer.process,
                prepared.pointer.logical_clock,
                prepared.pointer.system
            );
            return Ok(IngestOutcome::Duplicate);
        }

        self.store.apply(prepared.mutations).await?;
        log::debug!(
            "stored {}:{} for {}",
            prepared.pointer.process,
            prepared.pointer.logical_clock,
            prepared.pointer.system
        );
        for notification in prepared.notifications {
            self.publish(notification);
        }
        Ok(IngestOutcome::Stored)
    }

    /// Ingest a sequence, stopping at the first failure.
    pub async fn ingest_all(&self, events: &[SignedEvent]) -> Result<usize, IngestError> {
        let mut stored = 0;
        for signed in events {
            if self.ingest(signed).await? == IngestOutcome::Stored {
                stored += 1;
            }
        }
        Ok(stored)
    }

    /// Compute the mutations and notifications for `signed` without writing.
    /// Callers other than `ingest` must hold off concurrent ingestion for the
    /// same system themselves.
    pub async fn prepare(&self, signed: &SignedEvent) -> Result<Prepared, IngestError> {
        let event = signed.verify()?;
        let pointer = signed.pointer_for(&event);
        let system = &event.system;
        let process = event.process;
        let clock = event.logical_clock;

        let mut process_state = self.store.get_process_state(system, &process).await?;
        if process_state.ranges.contains(clock) {
            if let Some(stored) = self.store.get_event(system, &process, clock).await? {
                if stored.digest() != pointer.digest {
                    log::warn!("conflicting event at {}:{} for {}", process, clock, system);
                    return Err(IngestError::ConflictingEvent {
                        process,
                        logical_clock: clock,
                    });
                }
            }
            return Ok(Prepared {
                pointer,
                outcome: IngestOutcome::Duplicate,
                mutations: Vec::new(),
                notifications: Vec::new(),
            });
        }

        self.check_previous(&event).await?;

        let mut mutations = Vec::new();
        let mut notifications = Vec::new();

        mutations.push(self.store.event_op(signed, &process, clock)?);
        process_state.record(clock);
        mutations.push(self.store.process_state_op(system, &process, &process_state)?);

        let mut system_state = self.store.get_system_state(system).await?;
        let mut system_changed = system_state.add_process(process);

        // A delete that arrived first announced this location under the type
        // it named; drop those rows now that the real type is known.
        if let Some(mut tombstone) = self.store.tombstone_record(system, &process, clock).await? {
            if !tombstone.announced.is_empty() {
                for named in std::mem::take(&mut tombstone.announced) {
                    if named == event.content_type {
                        continue;
                    }
                    mutations.push(KvOp::Delete {
                        key: keys::content_index(system, named, &process, clock),
                    });
                    notifications.push(Notification::Tombstoned {
                        system: system.clone(),
                        process,
                        logical_clock: clock,
                        content_type: named,
                    });
                }
                mutations.push(self.store.tombstone_op(system, &process, clock, &tombstone)?);
            }
        }

        match event.content_type.canonical() {
            ContentType::Delete => {
                let body: DeleteBody = decode(&event.content)?;
                check_delete(&event, &body)?;
                let target = self
                    .store
                    .get_event(system, &body.process, body.logical_clock)
                    .await?;
                let announced = target.is_none().then_some(body.content_type);
                let tombstone = match self
                    .store
                    .tombstone_record(system, &body.process, body.logical_clock)
                    .await?
                {
                    Some(mut existing) => {
                        existing.merge(pointer.clone(), announced);
                        existing
                    }
                    None => Tombstone::new(pointer.clone(), announced),
                };
                mutations.push(self.store.tombstone_op(
                    system,
                    &body.process,
                    body.logical_clock,
                    &tombstone,
                )?);

                let indexed_as = match target {
                    Some(target) => target.decode_trusted()?.content_type,
                    None => {
                        // Announce the slot so index readers show a placeholder.
                        let placeholder = IndexEntry {
                            process: body.process,
                            logical_clock: body.logical_clock,
                            digest: None,
                        };
                        mutations.push(KvOp::put(
                            keys::content_index(system, body.content_type, &body.process, body.logical_clock),
                            encode(&placeholder)?,
                        ));
                        body.content_type
                    }
                };
                notifications.push(Notification::Tombstoned {
                    system: system.clone(),
                    process: body.process,
                    logical_clock: body.logical_clock,
                    content_type: indexed_as,
                });
            }
            ContentType::SystemProcesses => {
                let body: SystemProcessesBody = decode(&event.content)?;
                for announced in body.processes {
                    system_changed |= system_state.add_process(announced);
                }
            }
            _ => {}
        }

        let mut crdt_changed = false;
        if let Some(element) = &event.lww_element {
            crdt_changed |= system_state.merge_register(event.content_type, element);
        }
        if let Some(delta) = &event.lww_element_set {
            crdt_changed |= system_state.merge_set(event.content_type, delta);
        }
        if system_changed || crdt_changed {
            mutations.push(self.store.system_state_op(system, &system_state)?);
        }

        // Replaces a placeholder left by an earlier delete; the tombstone still hides it.
        let entry = IndexEntry {
            process,
            logical_clock: clock,
            digest: Some(pointer.digest),
        };
        mutations.push(KvOp::put(
            keys::content_index(system, event.content_type, &process, clock),
            encode(&entry)?,
        ));

        let referrer = (system, &process, clock);
        for reference in &event.references {
            let key = match reference {
                Reference::Pointer(target) => keys::reference_pointer(
                    (&target.system, &target.process, target.logical_clock),
                    referrer,
                ),
                Reference::Bytes(bytes) => keys::reference_bytes(bytes, referrer),
            };
            mutations.push(KvOp::put(key, encode(&pointer)?));
        }

        notifications.push(Notification::EventStored {
            system: system.clone(),
            process,
            logical_clock: clock,
            content_type: event.content_type,
        });
        if crdt_changed {
            notifications.push(Notification::CrdtChanged {
                system: system.clone(),
                content_type: event.content_type,
            });
        }

        Ok(Prepared {
            pointer,
            outcome: IngestOutcome::Stored,
            mutations,
            notifications,
        })
    }

    /// The back-pointer must agree with the previous event if we hold it.
    async fn check_previous(&self, event: &Event) -> Result<(), IngestError> {
        let Some(previous) = &event.previous else {
            return Ok(());
        };
        if previous.system != event.system
            || previous.process != event.process
            || previous.logical_clock >= event.logical_clock
        {
            return Err(IngestError::ConflictingEvent {
                process: event.process,
                logical_clock: event.logical_clock,
            });
        }
        if let Some(stored) = self
            .store
            .get_event(&event.system, &previous.process, previous.logical_clock)
            .await?
        {
            if stored.digest() != previous.digest {
                log::warn!(
                    "previous pointer of {}:{} disagrees with stored event",
                    event.process,
                    event.logical_clock
                );
                return Err(IngestError::ConflictingEvent {
                    process: event.process,
                    logical_clock: event.logical_clock,
                });
            }
        }
        Ok(())
    }
}

/// Checks that depend only on the delete itself, so the verdict is the same
/// whichever of the delete and its target arrives first.
fn check_delete(event: &Event, body: &DeleteBody) -> Result<(), IngestError> {
    if body.process == event.process && body.logical_clock == event.logical_clock {
        return Err(IngestError::InvalidDelete("delete targets itself".to_string()));
    }
    if body.content_type == ContentType::Delete {
        return Err(IngestError::InvalidDelete("cannot delete a delete".to_string()));
    }
    Ok(())
}
