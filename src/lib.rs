// Polycentric Core - Signed event replication, sync and live queries

pub mod config;
pub mod handle;
pub mod ingest;
pub mod model;
pub mod queries;
pub mod ranges;
pub mod storage;
pub mod store;
pub mod sync;

pub use config::{ConfigError, CoreConfig, QueryConfig, SyncConfig};
pub use handle::{HandleError, ProcessHandle};
pub use ingest::{IngestError, IngestOutcome, Ingester, Notification};
pub use model::{ContentType, Event, Identity, ModelError, Pointer, Process, PublicKey, SignedEvent};
pub use queries::{Callback, QueryError, QueryManager, Registration};
pub use ranges::{Range, RangeError, RangesForProcess, RangesForSystem};
pub use storage::{FileKv, KvStore, MemoryKv, StorageError};
pub use store::{EventState, Store, StoreError};
pub use sync::{RoundReport, SyncEngine, SyncError, Transport};
