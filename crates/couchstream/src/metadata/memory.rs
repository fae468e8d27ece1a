//! In-memory metadata store (tests and ephemeral runs)

use super::MetadataStore;
use crate::error::{DcpError, Result};
use crate::offset::{Offset, VbId};
use async_trait::async_trait;
use bytes::Bytes;
use dashmap::DashMap;
use std::collections::HashMap;

#[derive(Default)]
pub struct MemoryMetadataStore {
    checkpoints: DashMap<VbId, Offset>,
    raw: DashMap<String, Bytes>,
}

impl MemoryMetadataStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl MetadataStore for MemoryMetadataStore {
    async fn load(&self, vb_ids: &[VbId]) -> Result<HashMap<VbId, Offset>> {
        Ok(vb_ids
            .iter()
            .filter_map(|vb| self.checkpoints.get(vb).map(|r| (*vb, *r.value())))
            .collect())
    }

    async fn save(&self, offsets: &HashMap<VbId, Offset>) -> Result<()> {
        for (&vb_id, offset) in offsets {
            self.checkpoints.insert(vb_id, *offset);
        }
        Ok(())
    }

    async fn clear(&self, vb_ids: &[VbId]) -> Result<()> {
        for vb_id in vb_ids {
            self.checkpoints.remove(vb_id);
        }
        Ok(())
    }

    async fn get_raw(&self, key: &str) -> Result<Bytes> {
        self.raw
            .get(key)
            .map(|r| r.value().clone())
            .ok_or_else(|| DcpError::not_found(key))
    }

    async fn set_raw(&self, key: &str, value: Bytes, _ttl_secs: u32) -> Result<()> {
        self.raw.insert(key.to_string(), value);
        Ok(())
    }

    async fn delete_raw(&self, key: &str) -> Result<()> {
        self.raw.remove(key);
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        Ok(())
    }
}
