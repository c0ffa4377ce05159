use std::collections::HashMap;
use std::time::{Duration, Instant};

use crate::config::RegistryConfig;
use crate::identity::ClientId;

/// Process-wide set of known client identifiers.
///
/// Created at startup and shared behind a lock. Each entry remembers when the
/// client was last seen so that idle clients expire after `idle_ttl` and the
/// least-recently-seen client is dropped when the registry is full.
#[derive(Debug)]
pub struct ClientRegistry {
    clients: HashMap<ClientId, Instant>,
    capacity: usize,
    idle_ttl: Duration,
}

impl Default for ClientRegistry {
    fn default() -> Self {
        Self::new(&RegistryConfig::default())
    }
}

impl ClientRegistry {
    pub fn new(config: &RegistryConfig) -> Self {
        Self {
            clients: HashMap::new(),
            capacity: config.capacity.max(1),
            idle_ttl: config.idle_ttl(),
        }
    }

    pub fn contains(&self, client_id: &ClientId) -> bool {
        self.clients
            .get(client_id)
            .map(|seen| seen.elapsed() < self.idle_ttl)
            .unwrap_or(false)
    }

    /// Refresh the last-seen time of a known client. Returns false if unknown or expired.
    pub fn touch(&mut self, client_id: &ClientId) -> bool {
        if !self.contains(client_id) {
            return false;
        }
        self.clients.insert(client_id.clone(), Instant::now());
        true
    }

    /// Register a client id. Returns false if it was already present.
    pub fn register(&mut self, client_id: ClientId) -> bool {
        if self.contains(&client_id) {
            return false;
        }
        self.evict_expired();
        if self.clients.len() >= self.capacity {
            self.evict_least_recent();
        }
        self.clients.insert(client_id, Instant::now());
        true
    }

    /// Drop every entry idle for longer than the TTL. Returns how many were removed.
    pub fn evict_expired(&mut self) -> usize {
        let before = self.clients.len();
        let ttl = self.idle_ttl;
        self.clients.retain(|_, seen| seen.elapsed() < ttl);
        let evicted = before - self.clients.len();
        if evicted > 0 {
            tracing::debug!(evicted, "Expired client identifiers evicted");
        }
        evicted
    }

    fn evict_least_recent(&mut self) {
        let oldest = self
            .clients
            .iter()
            .min_by_key(|(_, seen)| **seen)
            .map(|(id, _)| id.clone());
        if let Some(id) = oldest {
            self.clients.remove(&id);
            tracing::debug!(client_id = %id, "Registry full, least recent client evicted");
        }
    }

    pub fn len(&self) -> usize {
        self.clients.len()
    }

    pub fn is_empty(&self) -> bool {
        self.clients.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn registry(capacity: usize, idle_ttl_secs: u64) -> ClientRegistry {
        ClientRegistry::new(&RegistryConfig {
            capacity,
            idle_ttl_secs,
        })
    }

    #[test]
    fn register_is_idempotent() {
        let mut reg = registry(10, 60);
        assert!(reg.register(ClientId::from("a")));
        assert!(!reg.register(ClientId::from("a")));
        assert_eq!(reg.len(), 1);
        assert!(reg.touch(&ClientId::from("a")));
        assert!(!reg.touch(&ClientId::from("b")));
    }

    #[test]
    fn full_registry_evicts_least_recent() {
        let mut reg = registry(2, 60);
        reg.register(ClientId::from("a"));
        std::thread::sleep(Duration::from_millis(5));
        reg.register(ClientId::from("b"));
        std::thread::sleep(Duration::from_millis(5));
        reg.touch(&ClientId::from("a"));
        reg.register(ClientId::from("c"));

        assert_eq!(reg.len(), 2);
        assert!(reg.contains(&ClientId::from("a")));
        assert!(!reg.contains(&ClientId::from("b")));
        assert!(reg.contains(&ClientId::from("c")));
    }

    #[test]
    fn zero_ttl_expires_everything() {
        let mut reg = registry(10, 0);
        reg.register(ClientId::from("a"));
        assert!(!reg.contains(&ClientId::from("a")));
        assert_eq!(reg.evict_expired(), 1);
        assert!(reg.is_empty());
    }
}
