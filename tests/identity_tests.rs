//! Client identity tests.
//!
//! Run with: cargo test --test identity_tests

use std::sync::Arc;

use tokio::sync::RwLock;

use geo_broker::config::RegistryConfig;
use geo_broker::identity::{
    ClientId, ClientRegistry, ClientSession, IdentityResolver, MemorySessionStore, SessionStore,
};

fn resolver(capacity: usize, idle_ttl_secs: u64) -> IdentityResolver {
    IdentityResolver::new(Arc::new(RwLock::new(ClientRegistry::new(&RegistryConfig {
        capacity,
        idle_ttl_secs,
    }))))
}

#[test]
fn test_generated_ids_are_alphanumeric() {
    let id = ClientId::generate();
    assert_eq!(id.as_str().len(), 32);
    assert!(id.as_str().chars().all(|c| c.is_ascii_alphanumeric()));
    assert_ne!(id, ClientId::generate());
}

#[tokio::test]
async fn test_session_keeps_its_client_id() {
    let resolver = resolver(10, 3600);
    let mut session = ClientSession::new("token-1");

    let first = resolver.resolve(&mut session).await;
    let second = resolver.resolve(&mut session).await;

    assert_eq!(first, second);
    assert_eq!(session.client_id, Some(first));
    assert_eq!(resolver.registry().read().await.len(), 1);
}

#[tokio::test]
async fn test_distinct_sessions_get_distinct_ids() {
    let resolver = resolver(10, 3600);
    let a = resolver.resolve(&mut ClientSession::new("a")).await;
    let b = resolver.resolve(&mut ClientSession::new("b")).await;
    assert_ne!(a, b);
}

#[tokio::test]
async fn test_unknown_client_id_is_replaced() {
    let resolver = resolver(10, 3600);
    let mut session = ClientSession::new("token-1");
    session.client_id = Some(ClientId::from("forged-or-expired"));

    let id = resolver.resolve(&mut session).await;
    assert_ne!(id, ClientId::from("forged-or-expired"));
    assert_eq!(session.client_id, Some(id));
}

#[tokio::test]
async fn test_evicted_client_gets_fresh_id() {
    let resolver = resolver(1, 3600);
    let mut first = ClientSession::new("first");
    let mut second = ClientSession::new("second");

    let original = resolver.resolve(&mut first).await;
    resolver.resolve(&mut second).await;

    // Registry holds one client; `first` was evicted
    let renewed = resolver.resolve(&mut first).await;
    assert_ne!(original, renewed);
    assert_eq!(resolver.registry().read().await.len(), 1);
}

#[tokio::test]
async fn test_session_store_round_trip() {
    let store = MemorySessionStore::new();
    let fresh = store.load("token-1").await.unwrap();
    assert_eq!(fresh.token, "token-1");
    assert!(fresh.client_id.is_none());
    assert!(store.is_empty().await);

    let mut session = fresh;
    session.client_id = Some(ClientId::from("abc"));
    store.save(&session).await.unwrap();

    assert_eq!(store.load("token-1").await.unwrap(), session);
    assert_eq!(store.len().await, 1);
}
