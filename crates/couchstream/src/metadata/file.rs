//! File-backed metadata store
//!
//! One JSON file holds the whole group state: the checkpoint map plus the
//! raw documents. Every write rewrites the file through a temp file and an
//! atomic rename, so a crash mid-flush leaves the previous generation
//! intact. Suited to single-host deployments and tests; the bucket-backed
//! store is the distributed option.
//!
//! TTLs are recorded but not enforced: liveness filtering of instance
//! documents happens at read time from `heartbeatTime`, so an expired
//! document that lingers is indistinguishable from a dead instance.

use super::{MetadataKeys, MetadataStore};
use crate::error::{DcpError, Result};
use crate::offset::{Offset, VbId};
use async_trait::async_trait;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;
use tokio::sync::RwLock;
use tracing::{debug, info};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct FileDocument {
    #[serde(default)]
    checkpoints: HashMap<VbId, Offset>,
    #[serde(default)]
    raw: HashMap<String, serde_json::Value>,
}

pub struct FileMetadataStore {
    path: PathBuf,
    #[allow(dead_code)]
    keys: MetadataKeys,
    cache: RwLock<FileDocument>,
}

impl FileMetadataStore {
    /// Open the store, reading any existing state from `path`
    pub fn new(path: PathBuf, keys: MetadataKeys) -> Result<Self> {
        let document = match std::fs::read(&path) {
            Ok(raw) => serde_json::from_slice(&raw)?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => FileDocument::default(),
            Err(e) => return Err(e.into()),
        };
        if !document.checkpoints.is_empty() {
            info!(
                "loaded {} checkpoints from {}",
                document.checkpoints.len(),
                path.display()
            );
        }
        Ok(Self {
            path,
            keys,
            cache: RwLock::new(document),
        })
    }

    /// Serialize the cache and swap it into place with write-rename
    async fn persist(&self, document: &FileDocument) -> Result<()> {
        let json = serde_json::to_vec_pretty(document)?;
        let temp_path = self.path.with_extension("tmp");
        tokio::fs::write(&temp_path, &json).await?;
        tokio::fs::rename(&temp_path, &self.path).await?;
        debug!("persisted metadata to {}", self.path.display());
        Ok(())
    }
}

#[async_trait]
impl MetadataStore for FileMetadataStore {
    async fn load(&self, vb_ids: &[VbId]) -> Result<HashMap<VbId, Offset>> {
        let cache = self.cache.read().await;
        Ok(vb_ids
            .iter()
            .filter_map(|vb| cache.checkpoints.get(vb).map(|o| (*vb, *o)))
            .collect())
    }

    async fn save(&self, offsets: &HashMap<VbId, Offset>) -> Result<()> {
        let mut cache = self.cache.write().await;
        for (&vb_id, offset) in offsets {
            cache.checkpoints.insert(vb_id, *offset);
        }
        self.persist(&cache).await
    }

    async fn clear(&self, vb_ids: &[VbId]) -> Result<()> {
        let mut cache = self.cache.write().await;
        for vb_id in vb_ids {
            cache.checkpoints.remove(vb_id);
        }
        self.persist(&cache).await
    }

    async fn get_raw(&self, key: &str) -> Result<Bytes> {
        let cache = self.cache.read().await;
        match cache.raw.get(key) {
            Some(value) => Ok(Bytes::from(serde_json::to_vec(value)?)),
            None => Err(DcpError::not_found(key)),
        }
    }

    async fn set_raw(&self, key: &str, value: Bytes, _ttl_secs: u32) -> Result<()> {
        let parsed: serde_json::Value = serde_json::from_slice(&value)?;
        let mut cache = self.cache.write().await;
        cache.raw.insert(key.to_string(), parsed);
        self.persist(&cache).await
    }

    async fn delete_raw(&self, key: &str) -> Result<()> {
        let mut cache = self.cache.write().await;
        if cache.raw.remove(key).is_some() {
            self.persist(&cache).await?;
        }
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        let cache = self.cache.read().await;
        self.persist(&cache).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::offset::Snapshot;
    use tempfile::tempdir;

    fn open(dir: &tempfile::TempDir) -> FileMetadataStore {
        FileMetadataStore::new(dir.path().join("meta.json"), MetadataKeys::new("g")).unwrap()
    }

    #[tokio::test]
    async fn test_survives_reopen() {
        let dir = tempdir().unwrap();

        let store = open(&dir);
        let mut offsets = HashMap::new();
        offsets.insert(17u16, Offset::new(3, 150, Snapshot::new(100, 200)));
        store.save(&offsets).await.unwrap();
        store
            .set_raw("idx", Bytes::from(r#"{"a":1}"#), 0)
            .await
            .unwrap();

        // Reopen simulates a restart
        let store2 = open(&dir);
        let loaded = store2.load(&[17]).await.unwrap();
        assert_eq!(loaded[&17], offsets[&17]);
        let raw = store2.get_raw("idx").await.unwrap();
        let value: serde_json::Value = serde_json::from_slice(&raw).unwrap();
        assert_eq!(value["a"], 1);
    }

    #[tokio::test]
    async fn test_missing_file_starts_empty() {
        let dir = tempdir().unwrap();
        let store = open(&dir);
        assert!(store.load(&[0, 1, 2]).await.unwrap().is_empty());
        assert!(store.get_raw("none").await.unwrap_err().is_not_found());
    }

    #[tokio::test]
    async fn test_save_load_save_is_value_equal() {
        let dir = tempdir().unwrap();
        let store = open(&dir);

        let mut offsets = HashMap::new();
        offsets.insert(9u16, Offset::new(1, 5, Snapshot::new(5, 5)));
        store.save(&offsets).await.unwrap();

        let loaded = store.load(&[9]).await.unwrap();
        store.save(&loaded).await.unwrap();
        assert_eq!(store.load(&[9]).await.unwrap(), loaded);
    }

    #[tokio::test]
    async fn test_clear_removes_only_requested() {
        let dir = tempdir().unwrap();
        let store = open(&dir);

        let mut offsets = HashMap::new();
        offsets.insert(1u16, Offset::default());
        offsets.insert(2u16, Offset::default());
        store.save(&offsets).await.unwrap();

        store.clear(&[1]).await.unwrap();
        let remaining = store.load(&[1, 2]).await.unwrap();
        assert!(!remaining.contains_key(&1));
        assert!(remaining.contains_key(&2));
    }

    #[tokio::test]
    async fn test_no_temp_file_left_behind() {
        let dir = tempdir().unwrap();
        let store = open(&dir);

        let mut offsets = HashMap::new();
        offsets.insert(0u16, Offset::default());
        store.save(&offsets).await.unwrap();

        assert!(dir.path().join("meta.json").exists());
        assert!(!dir.path().join("meta.tmp").exists());
    }
}
