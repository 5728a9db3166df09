//! In-memory `KvStore` backed by a `BTreeMap`

use std::collections::BTreeMap;
use std::ops::Bound;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;

use super::{KvOp, KvStore, StorageError};

pub(crate) fn apply_ops(entries: &mut BTreeMap<Vec<u8>, Vec<u8>>, ops: Vec<KvOp>) {
    for op in ops {
        match op {
            KvOp::Put { key, value } => {
                entries.insert(key, value);
            }
            KvOp::Delete { key } => {
                entries.remove(&key);
            }
        }
    }
}

#[derive(Debug, Default)]
pub struct MemoryKv {
    entries: Mutex<BTreeMap<Vec<u8>, Vec<u8>>>,
    closed: AtomicBool,
}

impl MemoryKv {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build from a snapshot of entries (used by the file engine on open).
    pub(crate) fn from_entries(entries: BTreeMap<Vec<u8>, Vec<u8>>) -> Self {
        Self {
            entries: Mutex::new(entries),
            closed: AtomicBool::new(false),
        }
    }

    pub(crate) fn snapshot(&self) -> BTreeMap<Vec<u8>, Vec<u8>> {
        self.lock().clone()
    }

    /// Apply ops without touching the closed flag. Callers hold no other lock.
    pub(crate) fn apply(&self, ops: Vec<KvOp>) {
        apply_ops(&mut self.lock(), ops);
    }

    /// Swap in a whole new keyspace at once.
    pub(crate) fn replace(&self, entries: BTreeMap<Vec<u8>, Vec<u8>>) {
        *self.lock() = entries;
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    fn lock(&self) -> MutexGuard<'_, BTreeMap<Vec<u8>, Vec<u8>>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn check_open(&self) -> Result<(), StorageError> {
        if self.closed.load(Ordering::Acquire) {
            Err(StorageError::Closed)
        } else {
            Ok(())
        }
    }

    fn scan(
        &self,
        prefix: &[u8],
        after: Option<&[u8]>,
        limit: usize,
    ) -> Vec<(Vec<u8>, Vec<u8>)> {
        let entries = self.lock();
        let start = match after {
            Some(after) if after >= prefix => Bound::Excluded(after.to_vec()),
            _ => Bound::Included(prefix.to_vec()),
        };
        entries
            .range((start, Bound::Unbounded))
            .take_while(|(key, _)| key.starts_with(prefix))
            .take(limit)
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect()
    }
}

#[async_trait]
impl KvStore for MemoryKv {
    async fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>, StorageError> {
        self.check_open()?;
        Ok(self.lock().get(key).cloned())
    }

    async fn put(&self, key: Vec<u8>, value: Vec<u8>) -> Result<(), StorageError> {
        self.check_open()?;
        self.lock().insert(key, value);
        Ok(())
    }

    async fn batch(&self, ops: Vec<KvOp>) -> Result<(), StorageError> {
        self.check_open()?;
        self.apply(ops);
        Ok(())
    }

    async fn iterate(&self, prefix: &[u8]) -> Result<Vec<(Vec<u8>, Vec<u8>)>, StorageError> {
        self.check_open()?;
        Ok(self.scan(prefix, None, usize::MAX))
    }

    async fn iterate_after(
        &self,
        prefix: &[u8],
        after: Option<&[u8]>,
        limit: usize,
    ) -> Result<Vec<(Vec<u8>, Vec<u8>)>, StorageError> {
        self.check_open()?;
        Ok(self.scan(prefix, after, limit))
    }

    async fn close(&self) -> Result<(), StorageError> {
        self.closed.store(true, Ordering::Release);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_prefix_iteration_is_ordered() {
        let kv = MemoryKv::new();
        kv.put(vec![1, 3], b"c".to_vec()).await.unwrap();
        kv.put(vec![1, 1], b"a".to_vec()).await.unwrap();
        kv.put(vec![2, 0], b"z".to_vec()).await.unwrap();
        kv.put(vec![1, 2], b"b".to_vec()).await.unwrap();

        let keys: Vec<Vec<u8>> = kv
            .iterate(&[1])
            .await
            .unwrap()
            .into_iter()
            .map(|(k, _)| k)
            .collect();
        assert_eq!(keys, vec![vec![1, 1], vec![1, 2], vec![1, 3]]);

        let page = kv.iterate_after(&[1], Some(&[1, 1]), 1).await.unwrap();
        assert_eq!(page, vec![(vec![1, 2], b"b".to_vec())]);
    }

    #[tokio::test]
    async fn test_batch_applies_puts_and_deletes() {
        let kv = MemoryKv::new();
        kv.put(vec![9], vec![9]).await.unwrap();
        kv.batch(vec![
            KvOp::put(vec![1], vec![1]),
            KvOp::Delete { key: vec![9] },
        ])
        .await
        .unwrap();
        assert_eq!(kv.get(&[1]).await.unwrap(), Some(vec![1]));
        assert_eq!(kv.get(&[9]).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_closed_store_rejects_access() {
        let kv = MemoryKv::new();
        kv.close().await.unwrap();
        assert_eq!(kv.get(&[1]).await, Err(StorageError::Closed));
    }
}
