//! Authoring side of one process
//!
//! A `ProcessHandle` signs new events for its own process, feeds them through
//! the same ingest pipeline as remote events and exposes the query caches.

use std::path::Path;
use std::sync::Arc;

use thiserror::Error;
use tokio::sync::Mutex;

use crate::config::CoreConfig;
use crate::ingest::{IngestError, Ingester};
use crate::model::{
    encode, ContentType, DeleteBody, Event, Identity, LwwElement, LwwElementSetDelta,
    LwwSetOperation, ModelError, Pointer, Process, PublicKey, Reference, SignedEvent,
    SystemProcessesBody,
};
use crate::queries::QueryManager;
use crate::ranges::{Range, RangesForProcess};
use crate::storage::{FileKv, KvStore, StorageError};
use crate::store::{Store, StoreError};
use crate::sync::{SyncEngine, Transport};

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum HandleError {
    #[error("Model error: {0}")]
    Model(#[from] ModelError),

    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("Ingest error: {0}")]
    Ingest(#[from] IngestError),
}

fn now_millis() -> u64 {
    chrono::Utc::now().timestamp_millis().max(0) as u64
}

pub struct ProcessHandle {
    identity: Identity,
    process: Process,
    ingester: Arc<Ingester>,
    queries: QueryManager,
    config: CoreConfig,
    /// Authoring is serialized so clocks are handed out without gaps.
    authoring: Mutex<()>,
}

impl ProcessHandle {
    pub fn new(identity: Identity, process: Process, kv: Arc<dyn KvStore>, config: CoreConfig) -> Self {
        let ingester = Arc::new(Ingester::new(
            Store::new(kv),
            config.query.notification_capacity,
        ));
        let queries = QueryManager::new(ingester.clone(), &config.query);
        Self {
            identity,
            process,
            ingester,
            queries,
            config,
            authoring: Mutex::new(()),
        }
    }

    /// Open or create a handle whose identity, process id and store live in `dir`.
    pub async fn open(dir: &Path, config: CoreConfig) -> Result<Self, HandleError> {
        let identity = Identity::load_or_generate(&dir.join("identity.json"))?;
        let process = load_or_create_process(&dir.join("process.json"))?;
        let kv = FileKv::open(dir.join("store.cbor")).await?;
        log::info!("opened process {} of {}", process, identity.public_key());
        Ok(Self::new(identity, process, Arc::new(kv), config))
    }

    pub fn system(&self) -> PublicKey {
        self.identity.public_key()
    }

    pub fn process(&self) -> Process {
        self.process
    }

    pub fn store(&self) -> &Store {
        self.ingester.store()
    }

    pub fn ingester(&self) -> &Arc<Ingester> {
        &self.ingester
    }

    pub fn queries(&self) -> &QueryManager {
        &self.queries
    }

    pub fn config(&self) -> &CoreConfig {
        &self.config
    }

    /// Sync engine over `transport`, configured from this handle.
    pub fn sync_engine(&self, transport: Arc<dyn Transport>) -> SyncEngine {
        SyncEngine::new(self.ingester.clone(), transport, self.config.sync.clone())
            .with_default_servers(self.config.default_servers.clone())
    }

    async fn author(
        &self,
        content_type: ContentType,
        content: Vec<u8>,
        build: impl FnOnce(Event) -> Event,
    ) -> Result<Pointer, HandleError> {
        let _guard = self.authoring.lock().await;
        let system = self.system();
        let store = self.store();

        let state = store.get_process_state(&system, &self.process).await?;
        let previous = match state.frontier {
            Some(frontier) => store
                .get_event(&system, &self.process, frontier)
                .await?
                .map(|signed| signed.to_pointer())
                .transpose()?,
            None => None,
        };

        let event = build(Event::new(
            system,
            self.process,
            state.next_clock(),
            content_type,
            content,
        ))
        .with_previous(previous);
        let signed = SignedEvent::sign(&self.identity, &event)?;
        self.ingester.ingest(&signed).await?;
        Ok(signed.pointer_for(&event))
    }

    pub async fn post(&self, content_type: ContentType, content: Vec<u8>) -> Result<Pointer, HandleError> {
        self.author(content_type, content, |event| event).await
    }

    /// Post `content` with references to other events or raw bytes.
    pub async fn post_with_references(
        &self,
        content_type: ContentType,
        content: Vec<u8>,
        references: Vec<Reference>,
    ) -> Result<Pointer, HandleError> {
        self.author(content_type, content, |event| {
            references
                .into_iter()
                .fold(event, |event, reference| event.with_reference(reference))
        })
        .await
    }

    /// Write the register of `content_type`, e.g. username or avatar.
    pub async fn set_crdt(&self, content_type: ContentType, value: Vec<u8>) -> Result<Pointer, HandleError> {
        let element = LwwElement {
            value,
            unix_milliseconds: now_millis(),
        };
        self.author(content_type, Vec::new(), |event| event.with_lww_element(element))
            .await
    }

    async fn set_member(
        &self,
        content_type: ContentType,
        operation: LwwSetOperation,
        value: Vec<u8>,
    ) -> Result<Pointer, HandleError> {
        let delta = LwwElementSetDelta {
            operation,
            value,
            unix_milliseconds: now_millis(),
        };
        self.author(content_type, Vec::new(), |event| event.with_lww_element_set(delta))
            .await
    }

    pub async fn add_server(&self, server: &str) -> Result<Pointer, HandleError> {
        self.set_member(ContentType::Server, LwwSetOperation::Add, server.as_bytes().to_vec())
            .await
    }

    pub async fn remove_server(&self, server: &str) -> Result<Pointer, HandleError> {
        self.set_member(ContentType::Server, LwwSetOperation::Remove, server.as_bytes().to_vec())
            .await
    }

    /// Delete an event of this system.
    pub async fn delete(
        &self,
        process: Process,
        logical_clock: u64,
        content_type: ContentType,
    ) -> Result<Pointer, HandleError> {
        let body = DeleteBody {
            process,
            logical_clock,
            content_type,
        };
        self.post(ContentType::Delete, encode(&body)?).await
    }

    pub async fn vouch(&self, target: Pointer) -> Result<Pointer, HandleError> {
        self.post_with_references(ContentType::Vouch, Vec::new(), vec![Reference::Pointer(target)])
            .await
    }

    /// Announce other processes of this system.
    pub async fn announce_processes(&self, processes: Vec<Process>) -> Result<Pointer, HandleError> {
        let body = SystemProcessesBody { processes };
        self.post(ContentType::SystemProcesses, encode(&body)?).await
    }

    /// Split `bytes` into `BlobSection` events of at most `section_size` bytes.
    /// The returned ranges are the key for `QueryBlob`.
    pub async fn publish_blob(&self, bytes: &[u8], section_size: usize) -> Result<RangesForProcess, HandleError> {
        let mut sections = Vec::new();
        for chunk in bytes.chunks(section_size.max(1)) {
            let pointer = self.post(ContentType::BlobSection, chunk.to_vec()).await?;
            sections.push(Range::single(pointer.logical_clock));
        }
        Ok(RangesForProcess::from_ranges(sections))
    }
}

fn load_or_create_process(path: &Path) -> Result<Process, ModelError> {
    if path.exists() {
        let data = std::fs::read(path).map_err(|e| ModelError::IoError(e.to_string()))?;
        return serde_json::from_slice(&data).map_err(|e| ModelError::DecodeError(e.to_string()));
    }
    let process = Process::generate();
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).map_err(|e| ModelError::IoError(e.to_string()))?;
    }
    let json = serde_json::to_string_pretty(&process).map_err(|e| ModelError::EncodeError(e.to_string()))?;
    std::fs::write(path, json).map_err(|e| ModelError::IoError(e.to_string()))?;
    Ok(process)
}
