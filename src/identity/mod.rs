//! Client identity: a stable pseudo-identity per browser session.
//!
//! - [`ClientRegistry`]: known identifiers with TTL and capacity eviction
//! - [`SessionStore`]: the external session collaborator
//! - [`IdentityResolver`]: session → client identifier

pub mod registry;
pub mod session;

use std::sync::Arc;

use rand::distributions::Alphanumeric;
use rand::Rng;
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;

pub use registry::ClientRegistry;
pub use session::{ClientSession, MemorySessionStore, SessionStore};

const CLIENT_ID_LEN: usize = 32;

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ClientId(String);

impl ClientId {
    /// Mint a random alphanumeric identifier.
    pub fn generate() -> Self {
        let id: String = rand::thread_rng()
            .sample_iter(&Alphanumeric)
            .take(CLIENT_ID_LEN)
            .map(char::from)
            .collect();
        Self(id)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for ClientId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for ClientId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl std::fmt::Display for ClientId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Maps sessions to registered client identifiers.
#[derive(Debug, Clone)]
pub struct IdentityResolver {
    registry: Arc<RwLock<ClientRegistry>>,
}

impl IdentityResolver {
    pub fn new(registry: Arc<RwLock<ClientRegistry>>) -> Self {
        Self { registry }
    }

    pub fn registry(&self) -> Arc<RwLock<ClientRegistry>> {
        self.registry.clone()
    }

    /// Return the session's client id if it is registered, otherwise mint,
    /// register and attach a new one.
    pub async fn resolve(&self, session: &mut ClientSession) -> ClientId {
        let mut registry = self.registry.write().await;

        if let Some(existing) = &session.client_id {
            if registry.touch(existing) {
                return existing.clone();
            }
            tracing::debug!(client_id = %existing, "Session carries an unknown client id, minting a new one");
        }

        let client_id = loop {
            let candidate = ClientId::generate();
            if registry.register(candidate.clone()) {
                break candidate;
            }
        };

        tracing::info!(client_id = %client_id, "New client registered");
        session.client_id = Some(client_id.clone());
        client_id
    }
}

impl Default for IdentityResolver {
    fn default() -> Self {
        Self::new(Arc::new(RwLock::new(ClientRegistry::default())))
    }
}
