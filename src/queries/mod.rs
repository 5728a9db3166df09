//! Query cache layer
//!
//! The consumer-facing read side. Each cache maps a key to one live
//! computation that reads the store and follows ingest notifications:
//!
//! - `QueryCrdt`: merged register value of a system's content type
//! - `QueryIndex`: paginated, live list of events of a content type
//! - `QueryEvent`: one event location, tombstone aware
//! - `QueryBlob`: content concatenated over a range of one process
//! - `QueryServers`: servers known for a system
//!
//! All of them share `SubscriptionMap` for dedup, warm delivery and teardown.

pub mod blob;
pub mod crdt;
pub mod event;
pub mod index;
pub mod servers;
pub mod subscription;

pub use blob::QueryBlob;
pub use crdt::QueryCrdt;
pub use event::QueryEvent;
pub use index::{Cell, CellKey, IndexDelta, IndexView, QueryIndex};
pub use servers::QueryServers;
pub use subscription::{Callback, Registration, SubscriptionMap};

use std::sync::Arc;

use thiserror::Error;

use crate::config::QueryConfig;
use crate::ingest::Ingester;
use crate::store::StoreError;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum QueryError {
    #[error("Callback is already registered for this key")]
    DuplicatedCallbackError,

    #[error("Callback is not registered for this key")]
    NotRegistered,

    #[error("Store error: {0}")]
    Store(#[from] StoreError),
}

/// All query caches over one ingester.
#[derive(Clone)]
pub struct QueryManager {
    crdt: QueryCrdt,
    index: QueryIndex,
    event: QueryEvent,
    blob: QueryBlob,
    servers: QueryServers,
}

impl QueryManager {
    pub fn new(ingester: Arc<Ingester>, config: &QueryConfig) -> Self {
        let event = QueryEvent::new(ingester.clone());
        Self {
            crdt: QueryCrdt::new(ingester.clone()),
            index: QueryIndex::new(ingester.clone(), config.default_page_size),
            blob: QueryBlob::new(event.clone()),
            event,
            servers: QueryServers::new(ingester),
        }
    }

    pub fn crdt(&self) -> &QueryCrdt {
        &self.crdt
    }

    pub fn index(&self) -> &QueryIndex {
        &self.index
    }

    pub fn event(&self) -> &QueryEvent {
        &self.event
    }

    pub fn blob(&self) -> &QueryBlob {
        &self.blob
    }

    pub fn servers(&self) -> &QueryServers {
        &self.servers
    }

    /// No live subscriptions in any cache.
    pub fn is_clean(&self) -> bool {
        self.crdt.is_clean()
            && self.index.is_clean()
            && self.event.is_clean()
            && self.blob.is_clean()
            && self.servers.is_clean()
    }
}
