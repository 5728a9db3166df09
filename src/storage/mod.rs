//! Ordered binary key-value storage
//!
//! The store is written purely against `KvStore`. Engines only need ordered
//! keys, prefix iteration and an atomic multi-key batch.

pub mod file;
pub mod memory;

pub use file::FileKv;
pub use memory::MemoryKv;

use async_trait::async_trait;
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StorageError {
    #[error("IO error: {0}")]
    IoError(String),

    #[error("Storage is closed")]
    Closed,

    #[error("Corrupt storage: {0}")]
    Corrupt(String),
}

/// One write inside an atomic batch.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum KvOp {
    Put { key: Vec<u8>, value: Vec<u8> },
    Delete { key: Vec<u8> },
}

impl KvOp {
    pub fn put(key: Vec<u8>, value: Vec<u8>) -> Self {
        KvOp::Put { key, value }
    }
}

/// Ordered key-value store consumed by `Store`.
#[async_trait]
pub trait KvStore: Send + Sync {
    async fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>, StorageError>;

    async fn put(&self, key: Vec<u8>, value: Vec<u8>) -> Result<(), StorageError>;

    /// Apply every op or none of them.
    async fn batch(&self, ops: Vec<KvOp>) -> Result<(), StorageError>;

    /// All entries whose key starts with `prefix`, in ascending key order.
    async fn iterate(&self, prefix: &[u8]) -> Result<Vec<(Vec<u8>, Vec<u8>)>, StorageError>;

    /// Up to `limit` entries under `prefix` with keys strictly greater than `after`.
    async fn iterate_after(
        &self,
        prefix: &[u8],
        after: Option<&[u8]>,
        limit: usize,
    ) -> Result<Vec<(Vec<u8>, Vec<u8>)>, StorageError> {
        let entries = self.iterate(prefix).await?;
        Ok(entries
            .into_iter()
            .filter(|(key, _)| after.map_or(true, |after| key.as_slice() > after))
            .take(limit)
            .collect())
    }

    async fn close(&self) -> Result<(), StorageError>;
}
