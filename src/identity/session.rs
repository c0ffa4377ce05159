use std::collections::{HashMap, HashSet};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;

use crate::cache::ContentHash;
use crate::error::Result;
use crate::identity::ClientId;

/// Per-session document kept by the session store.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ClientSession {
    pub token: String,
    pub client_id: Option<ClientId>,
    /// Hashes this session believes are cached. Never authoritative.
    #[serde(default)]
    pub cached_hashes: HashSet<ContentHash>,
}

impl ClientSession {
    pub fn new(token: impl Into<String>) -> Self {
        Self {
            token: token.into(),
            ..Default::default()
        }
    }
}

/// Storage for session documents, keyed by session token.
///
/// TTL and persistence belong to the implementation.
#[async_trait]
pub trait SessionStore: Send + Sync {
    /// Load the session for `token`, or a fresh empty one.
    async fn load(&self, token: &str) -> Result<ClientSession>;

    async fn save(&self, session: &ClientSession) -> Result<()>;
}

/// In-process session store.
#[derive(Debug, Default)]
pub struct MemorySessionStore {
    sessions: RwLock<HashMap<String, ClientSession>>,
}

impl MemorySessionStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn len(&self) -> usize {
        self.sessions.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.sessions.read().await.is_empty()
    }
}

#[async_trait]
impl SessionStore for MemorySessionStore {
    async fn load(&self, token: &str) -> Result<ClientSession> {
        Ok(self
            .sessions
            .read()
            .await
            .get(token)
            .cloned()
            .unwrap_or_else(|| ClientSession::new(token)))
    }

    async fn save(&self, session: &ClientSession) -> Result<()> {
        self.sessions
            .write()
            .await
            .insert(session.token.clone(), session.clone());
        Ok(())
    }
}
