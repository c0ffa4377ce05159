//! Per-client result cache.
//!
//! Entries are keyed by (client identifier, content hash) and written at
//! most once; a second store for the same key is a no-op.

pub mod memory;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha512};

use crate::error::Result;
use crate::identity::ClientId;

pub use memory::MemoryResultCache;

/// Opaque computed result.
pub type Artifact = Vec<u8>;

/// SHA-512 digest of raw input bytes, as 128 lowercase hex characters.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ContentHash(String);

impl ContentHash {
    pub fn of(data: &[u8]) -> Self {
        let digest = Sha512::digest(data);
        Self(format!("{digest:x}"))
    }

    /// Hash a sequence of byte slices as if they were concatenated.
    pub fn of_parts(parts: &[&[u8]]) -> Self {
        let mut hasher = Sha512::new();
        for part in parts {
            hasher.update(part);
        }
        Self(format!("{:x}", hasher.finalize()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for ContentHash {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheKey {
    pub client_id: ClientId,
    pub content_hash: ContentHash,
}

impl CacheKey {
    pub fn new(client_id: &ClientId, content_hash: &ContentHash) -> Self {
        Self {
            client_id: client_id.clone(),
            content_hash: content_hash.clone(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct CacheEntry {
    pub artifact: Artifact,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreOutcome {
    Inserted,
    AlreadyPresent,
}

#[async_trait]
pub trait ResultCache: Send + Sync {
    async fn lookup(&self, client_id: &ClientId, content_hash: &ContentHash) -> Result<Option<Artifact>>;

    /// Put-if-absent. An existing entry is never modified.
    async fn store(
        &self,
        client_id: &ClientId,
        content_hash: &ContentHash,
        artifact: Artifact,
    ) -> Result<StoreOutcome>;
}
