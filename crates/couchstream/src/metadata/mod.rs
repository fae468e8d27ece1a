//! Durable metadata: checkpoints and the instance registry
//!
//! Everything the group persists lives behind [`MetadataStore`]: per-vbucket
//! checkpoint documents plus the raw K/V surface the self-organizing
//! membership uses for instance and index documents. Backends: the bucket
//! itself (or a neighbor bucket) via the client's K/V ops, or a single
//! local file rewritten atomically. `metadata.readOnly` short-circuits all
//! writes, for draining an instance without letting it move offsets.
//!
//! Key layout:
//!
//! ```text
//! _couchstream:<group>:checkpoint:<vbid>     -> {"vbUuid","seqNo","snapshot"}
//! _couchstream:<group>:instance:<uuid>       -> {"type","heartbeatTime","clusterJoinTime"}   (TTL 10s)
//! _couchstream:<group>:instance:all          -> {"<uuid>": clusterJoinTime, ...}
//! ```

mod couchbase;
mod file;
mod memory;

pub use couchbase::CouchbaseMetadataStore;
pub use file::FileMetadataStore;
pub use memory::MemoryMetadataStore;

use crate::config::{DcpConfig, MetadataType};
use crate::couchbase::SharedClient;
use crate::error::{DcpError, Result};
use crate::offset::{Offset, VbId};
use async_trait::async_trait;
use bytes::Bytes;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

/// Deadline for a single metadata round trip
pub(crate) const METADATA_TIMEOUT: Duration = Duration::from_secs(5);

/// Common key prefix; keeps group documents clearly separated from
/// application data when the metadata bucket is the streamed bucket itself
pub const PREFIX: &str = "_couchstream:";

/// Key builder for one group's documents
#[derive(Debug, Clone)]
pub struct MetadataKeys {
    group: String,
}

impl MetadataKeys {
    pub fn new(group: impl Into<String>) -> Self {
        Self { group: group.into() }
    }

    pub fn checkpoint(&self, vb_id: VbId) -> String {
        format!("{PREFIX}{}:checkpoint:{vb_id}", self.group)
    }

    pub fn instance(&self, instance_id: &str) -> String {
        format!("{PREFIX}{}:instance:{instance_id}", self.group)
    }

    pub fn instance_index(&self) -> String {
        format!("{PREFIX}{}:instance:all", self.group)
    }
}

/// Durable K/V for checkpoints and membership documents.
///
/// `save` is atomic per key, never across keys. Absent keys surface as
/// `DcpError::NotFound`, which every caller treats as "start fresh".
#[async_trait]
pub trait MetadataStore: Send + Sync {
    /// Bulk-read checkpoints; vbuckets with no record are absent from the map
    async fn load(&self, vb_ids: &[VbId]) -> Result<HashMap<VbId, Offset>>;

    /// Bulk-upsert checkpoints
    async fn save(&self, offsets: &HashMap<VbId, Offset>) -> Result<()>;

    /// Bulk-delete checkpoints
    async fn clear(&self, vb_ids: &[VbId]) -> Result<()>;

    /// Read a raw document
    async fn get_raw(&self, key: &str) -> Result<Bytes>;

    /// Write a raw document; `ttl_secs == 0` means no expiry
    async fn set_raw(&self, key: &str, value: Bytes, ttl_secs: u32) -> Result<()>;

    /// Delete a raw document; absent keys are not an error
    async fn delete_raw(&self, key: &str) -> Result<()>;

    async fn close(&self) -> Result<()>;
}

/// Shared metadata store handle
pub type SharedMetadataStore = Arc<dyn MetadataStore>;

/// Write-dropping wrapper for `metadata.readOnly`
pub struct ReadOnlyMetadataStore {
    inner: SharedMetadataStore,
}

impl ReadOnlyMetadataStore {
    pub fn new(inner: SharedMetadataStore) -> Self {
        Self { inner }
    }
}

#[async_trait]
impl MetadataStore for ReadOnlyMetadataStore {
    async fn load(&self, vb_ids: &[VbId]) -> Result<HashMap<VbId, Offset>> {
        self.inner.load(vb_ids).await
    }

    async fn save(&self, _offsets: &HashMap<VbId, Offset>) -> Result<()> {
        Ok(())
    }

    async fn clear(&self, _vb_ids: &[VbId]) -> Result<()> {
        Ok(())
    }

    async fn get_raw(&self, key: &str) -> Result<Bytes> {
        self.inner.get_raw(key).await
    }

    async fn set_raw(&self, _key: &str, _value: Bytes, _ttl_secs: u32) -> Result<()> {
        Ok(())
    }

    async fn delete_raw(&self, _key: &str) -> Result<()> {
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        self.inner.close().await
    }
}

/// Build the configured backend, applying the read-only wrapper when asked
pub fn new_metadata_store(config: &DcpConfig, client: SharedClient) -> Result<SharedMetadataStore> {
    let keys = MetadataKeys::new(config.group_name());
    let store: SharedMetadataStore = match config.metadata.metadata_type {
        MetadataType::Couchbase => Arc::new(CouchbaseMetadataStore::new(client, keys)),
        MetadataType::File => {
            let path = config
                .metadata
                .file_path
                .as_ref()
                .ok_or_else(|| DcpError::config("metadata.filePath is required"))?;
            Arc::new(FileMetadataStore::new(path.clone(), keys)?)
        }
    };
    if config.metadata.read_only {
        Ok(Arc::new(ReadOnlyMetadataStore::new(store)))
    } else {
        Ok(store)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::offset::Snapshot;

    #[test]
    fn test_key_layout() {
        let keys = MetadataKeys::new("order-indexer");
        assert_eq!(
            keys.checkpoint(42),
            "_couchstream:order-indexer:checkpoint:42"
        );
        assert_eq!(
            keys.instance("ab-12"),
            "_couchstream:order-indexer:instance:ab-12"
        );
        assert_eq!(
            keys.instance_index(),
            "_couchstream:order-indexer:instance:all"
        );
    }

    #[tokio::test]
    async fn test_read_only_drops_writes() {
        let inner: SharedMetadataStore = Arc::new(MemoryMetadataStore::new());
        let store = ReadOnlyMetadataStore::new(inner.clone());

        let mut offsets = HashMap::new();
        offsets.insert(3u16, Offset::new(1, 10, Snapshot::new(0, 10)));
        store.save(&offsets).await.unwrap();
        store.set_raw("k", Bytes::from("v"), 0).await.unwrap();

        assert!(store.load(&[3]).await.unwrap().is_empty());
        assert!(inner.get_raw("k").await.unwrap_err().is_not_found());

        // Reads pass through
        inner.set_raw("k2", Bytes::from("v2"), 0).await.unwrap();
        assert_eq!(store.get_raw("k2").await.unwrap(), Bytes::from("v2"));
    }
}
