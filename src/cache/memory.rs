use std::collections::hash_map::Entry;
use std::collections::HashMap;

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::RwLock;

use crate::cache::{Artifact, CacheEntry, CacheKey, ContentHash, ResultCache, StoreOutcome};
use crate::error::Result;
use crate::identity::ClientId;

/// In-process cache backed by a locked map.
#[derive(Debug, Default)]
pub struct MemoryResultCache {
    entries: RwLock<HashMap<CacheKey, CacheEntry>>,
}

impl MemoryResultCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn len(&self) -> usize {
        self.entries.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.entries.read().await.is_empty()
    }

    pub async fn entry(&self, client_id: &ClientId, content_hash: &ContentHash) -> Option<CacheEntry> {
        self.entries
            .read()
            .await
            .get(&CacheKey::new(client_id, content_hash))
            .cloned()
    }
}

#[async_trait]
impl ResultCache for MemoryResultCache {
    async fn lookup(&self, client_id: &ClientId, content_hash: &ContentHash) -> Result<Option<Artifact>> {
        Ok(self
            .entry(client_id, content_hash)
            .await
            .map(|entry| entry.artifact))
    }

    async fn store(
        &self,
        client_id: &ClientId,
        content_hash: &ContentHash,
        artifact: Artifact,
    ) -> Result<StoreOutcome> {
        let mut entries = self.entries.write().await;
        match entries.entry(CacheKey::new(client_id, content_hash)) {
            Entry::Occupied(existing) => {
                if existing.get().artifact != artifact {
                    tracing::warn!(
                        client_id = %client_id,
                        content_hash = %content_hash,
                        "Different artifact stored for an existing key, keeping the first"
                    );
                }
                Ok(StoreOutcome::AlreadyPresent)
            }
            Entry::Vacant(slot) => {
                slot.insert(CacheEntry {
                    artifact,
                    created_at: Utc::now(),
                });
                tracing::debug!(client_id = %client_id, content_hash = %content_hash, "Result cached");
                Ok(StoreOutcome::Inserted)
            }
        }
    }
}
