//! Bucket-backed metadata store
//!
//! Stores group documents in the streamed bucket (or a neighbor) through
//! the client's K/V surface, under the configured scope/collection and the
//! group prefix. Each document is written with a single upsert, so
//! atomicity is per key exactly as the contract requires.

use super::{MetadataKeys, MetadataStore, METADATA_TIMEOUT};
use crate::couchbase::SharedClient;
use crate::error::Result;
use crate::offset::{Offset, VbId};
use async_trait::async_trait;
use bytes::Bytes;
use std::collections::HashMap;
use tracing::debug;

pub struct CouchbaseMetadataStore {
    client: SharedClient,
    keys: MetadataKeys,
}

impl CouchbaseMetadataStore {
    pub fn new(client: SharedClient, keys: MetadataKeys) -> Self {
        Self { client, keys }
    }
}

#[async_trait]
impl MetadataStore for CouchbaseMetadataStore {
    async fn load(&self, vb_ids: &[VbId]) -> Result<HashMap<VbId, Offset>> {
        let mut offsets = HashMap::with_capacity(vb_ids.len());
        for &vb_id in vb_ids {
            let key = self.keys.checkpoint(vb_id);
            match tokio::time::timeout(METADATA_TIMEOUT, self.client.get_document(&key)).await? {
                Ok(raw) => {
                    let offset: Offset = serde_json::from_slice(&raw)?;
                    offsets.insert(vb_id, offset);
                }
                Err(e) if e.is_not_found() => {}
                Err(e) => return Err(e),
            }
        }
        debug!(
            "loaded {} checkpoints for {} vbuckets",
            offsets.len(),
            vb_ids.len()
        );
        Ok(offsets)
    }

    async fn save(&self, offsets: &HashMap<VbId, Offset>) -> Result<()> {
        for (&vb_id, offset) in offsets {
            let key = self.keys.checkpoint(vb_id);
            let payload = Bytes::from(serde_json::to_vec(offset)?);
            tokio::time::timeout(
                METADATA_TIMEOUT,
                self.client.upsert_document(&key, payload, 0),
            )
            .await??;
        }
        Ok(())
    }

    async fn clear(&self, vb_ids: &[VbId]) -> Result<()> {
        for &vb_id in vb_ids {
            let key = self.keys.checkpoint(vb_id);
            tokio::time::timeout(METADATA_TIMEOUT, self.client.delete_document(&key)).await??;
        }
        Ok(())
    }

    async fn get_raw(&self, key: &str) -> Result<Bytes> {
        tokio::time::timeout(METADATA_TIMEOUT, self.client.get_document(key)).await?
    }

    async fn set_raw(&self, key: &str, value: Bytes, ttl_secs: u32) -> Result<()> {
        tokio::time::timeout(
            METADATA_TIMEOUT,
            self.client.upsert_document(key, value, ttl_secs),
        )
        .await??;
        Ok(())
    }

    async fn delete_raw(&self, key: &str) -> Result<()> {
        match tokio::time::timeout(METADATA_TIMEOUT, self.client.delete_document(key)).await? {
            Ok(()) => Ok(()),
            Err(e) if e.is_not_found() => Ok(()),
            Err(e) => Err(e),
        }
    }

    async fn close(&self) -> Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::couchbase::mock::MockCluster;
    use crate::offset::Snapshot;

    fn store() -> CouchbaseMetadataStore {
        let cluster = MockCluster::new(8);
        CouchbaseMetadataStore::new(cluster, MetadataKeys::new("g"))
    }

    #[tokio::test]
    async fn test_load_missing_is_empty_not_error() {
        let store = store();
        let offsets = store.load(&[0, 1, 2]).await.unwrap();
        assert!(offsets.is_empty());
    }

    #[tokio::test]
    async fn test_save_then_load_roundtrip() {
        let store = store();

        let mut offsets = HashMap::new();
        offsets.insert(0u16, Offset::new(10, 100, Snapshot::new(90, 110)));
        offsets.insert(5u16, Offset::new(11, 7, Snapshot::new(0, 7)));
        store.save(&offsets).await.unwrap();

        let loaded = store.load(&[0, 1, 5]).await.unwrap();
        assert_eq!(loaded.len(), 2);
        assert_eq!(loaded[&0], offsets[&0]);
        assert_eq!(loaded[&5], offsets[&5]);
    }

    #[tokio::test]
    async fn test_save_is_idempotent() {
        let store = store();

        let mut offsets = HashMap::new();
        offsets.insert(3u16, Offset::new(1, 42, Snapshot::new(42, 42)));
        store.save(&offsets).await.unwrap();
        store.save(&offsets).await.unwrap();

        assert_eq!(store.load(&[3]).await.unwrap()[&3], offsets[&3]);
    }

    #[tokio::test]
    async fn test_clear_removes_checkpoints() {
        let store = store();

        let mut offsets = HashMap::new();
        offsets.insert(1u16, Offset::default());
        store.save(&offsets).await.unwrap();

        store.clear(&[1]).await.unwrap();
        assert!(store.load(&[1]).await.unwrap().is_empty());
    }
}
