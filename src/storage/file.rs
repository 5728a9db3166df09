//! Snapshot-file `KvStore`
//!
//! Keeps the whole keyspace in memory and rewrites a CBOR snapshot after each
//! write. The snapshot is written to a temporary file and renamed over the old
//! one, so a crash leaves either the previous or the new state on disk. Reads
//! only see a batch once its snapshot is on disk.
//! Suitable for tests and small single-user deployments.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tokio::sync::Mutex;

use super::memory::{apply_ops, MemoryKv};
use super::{KvOp, KvStore, StorageError};

pub struct FileKv {
    path: PathBuf,
    inner: MemoryKv,
    /// Serializes apply-and-persist so snapshots land in write order.
    write_lock: Mutex<()>,
}

impl FileKv {
    /// Open the snapshot at `path`, creating an empty store if it is missing.
    pub async fn open(path: impl AsRef<Path>) -> Result<Self, StorageError> {
        let path = path.as_ref().to_path_buf();
        let entries = if tokio::fs::try_exists(&path)
            .await
            .map_err(|e| StorageError::IoError(e.to_string()))?
        {
            let data = tokio::fs::read(&path)
                .await
                .map_err(|e| StorageError::IoError(e.to_string()))?;
            let pairs: Vec<(Vec<u8>, Vec<u8>)> = ciborium::from_reader(&data[..])
                .map_err(|e| StorageError::Corrupt(e.to_string()))?;
            pairs.into_iter().collect()
        } else {
            if let Some(parent) = path.parent() {
                tokio::fs::create_dir_all(parent)
                    .await
                    .map_err(|e| StorageError::IoError(e.to_string()))?;
            }
            BTreeMap::new()
        };
        log::debug!("opened {} with {} entries", path.display(), entries.len());
        Ok(Self {
            path,
            inner: MemoryKv::from_entries(entries),
            write_lock: Mutex::new(()),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    async fn persist(&self, entries: &BTreeMap<Vec<u8>, Vec<u8>>) -> Result<(), StorageError> {
        let pairs: Vec<(&Vec<u8>, &Vec<u8>)> = entries.iter().collect();
        let mut buf = Vec::new();
        ciborium::into_writer(&pairs, &mut buf).map_err(|e| StorageError::IoError(e.to_string()))?;

        let tmp = self.path.with_extension("tmp");
        tokio::fs::write(&tmp, buf)
            .await
            .map_err(|e| StorageError::IoError(e.to_string()))?;
        tokio::fs::rename(&tmp, &self.path)
            .await
            .map_err(|e| StorageError::IoError(e.to_string()))
    }
}

#[async_trait]
impl KvStore for FileKv {
    async fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>, StorageError> {
        self.inner.get(key).await
    }

    async fn put(&self, key: Vec<u8>, value: Vec<u8>) -> Result<(), StorageError> {
        self.batch(vec![KvOp::put(key, value)]).await
    }

    async fn batch(&self, ops: Vec<KvOp>) -> Result<(), StorageError> {
        let _guard = self.write_lock.lock().await;
        // Surfaces Closed before anything is applied.
        self.inner.get(&[]).await?;
        let mut next = self.inner.snapshot();
        apply_ops(&mut next, ops);
        self.persist(&next).await?;
        self.inner.replace(next);
        Ok(())
    }

    async fn iterate(&self, prefix: &[u8]) -> Result<Vec<(Vec<u8>, Vec<u8>)>, StorageError> {
        self.inner.iterate(prefix).await
    }

    async fn iterate_after(
        &self,
        prefix: &[u8],
        after: Option<&[u8]>,
        limit: usize,
    ) -> Result<Vec<(Vec<u8>, Vec<u8>)>, StorageError> {
        self.inner.iterate_after(prefix, after, limit).await
    }

    async fn close(&self) -> Result<(), StorageError> {
        self.inner.close().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_reopen_keeps_entries() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("db").join("store.cbor");

        {
            let kv = FileKv::open(&path).await.unwrap();
            kv.batch(vec![
                KvOp::put(b"a".to_vec(), b"1".to_vec()),
                KvOp::put(b"b".to_vec(), b"2".to_vec()),
            ])
            .await
            .unwrap();
            kv.put(b"c".to_vec(), b"3".to_vec()).await.unwrap();
            kv.close().await.unwrap();
        }

        let kv = FileKv::open(&path).await.unwrap();
        assert_eq!(kv.get(b"b").await.unwrap(), Some(b"2".to_vec()));
        assert_eq!(kv.iterate(b"").await.unwrap().len(), 3);
    }

    #[tokio::test]
    async fn test_failed_write_is_never_visible() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("store.cbor");
        let kv = FileKv::open(&path).await.unwrap();
        kv.put(b"a".to_vec(), b"1".to_vec()).await.unwrap();
        // The rename onto a directory fails after the temp file is written.
        std::fs::remove_file(&path).unwrap();
        std::fs::create_dir(&path).unwrap();

        let reader = async {
            let mut seen = false;
            for _ in 0..50 {
                seen |= kv.get(b"b").await.unwrap().is_some();
                tokio::task::yield_now().await;
            }
            seen
        };
        let (written, seen) = tokio::join!(
            kv.batch(vec![
                KvOp::put(b"b".to_vec(), b"2".to_vec()),
                KvOp::Delete { key: b"a".to_vec() },
            ]),
            reader
        );
        assert!(matches!(written, Err(StorageError::IoError(_))));
        assert!(!seen);
        assert_eq!(kv.get(b"b").await.unwrap(), None);
        assert_eq!(kv.get(b"a").await.unwrap(), Some(b"1".to_vec()));
    }

    #[tokio::test]
    async fn test_corrupt_snapshot_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("store.cbor");
        std::fs::write(&path, [0xff, 0xff]).unwrap();
        assert!(matches!(
            FileKv::open(&path).await,
            Err(StorageError::Corrupt(_))
        ));
    }
}
