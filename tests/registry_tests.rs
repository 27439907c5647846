//! Integration tests for the session registry
//!
//! Covers lifecycle no-ops on unknown ids, surface exclusivity, config
//! fallback, status fan-out and restart from the JSON store.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use chatvisor::bridge::{BridgeError, BridgeHost, ChatBackend, ChatMessage};
use chatvisor::logs::LogAggregator;
use chatvisor::session::{
    AiConfig, BotStatus, JsonSessionStore, MemorySessionStore, Session, SessionConfig, SessionId,
    SessionRegistry, SessionState, SessionStore,
};
use chatvisor::surface::memory::DEFAULT_INBOX_URL;
use chatvisor::surface::{MemorySurfaceFactory, SurfaceError, SurfaceFactory, SurfaceManager};

struct Unreachable;

#[async_trait]
impl ChatBackend for Unreachable {
    async fn complete(
        &self,
        _: &[ChatMessage],
        _: &AiConfig,
        _: Duration,
    ) -> Result<String, BridgeError> {
        Err(BridgeError::Transport("connection refused".to_string()))
    }
}

fn registry_on(store: Arc<dyn SessionStore>) -> SessionRegistry {
    SessionRegistry::new(
        store,
        Arc::new(MemorySurfaceFactory::default()),
        Arc::new(BridgeHost::new(Arc::new(Unreachable))),
        Arc::new(LogAggregator::new()),
    )
}

fn inbox_config() -> SessionConfig {
    SessionConfig {
        entry_url: DEFAULT_INBOX_URL.to_string(),
        ..SessionConfig::default()
    }
}

/// Test that every operation on an unknown id is a no-op
#[tokio::test]
async fn test_missing_id_operations_are_noops() {
    let registry = registry_on(Arc::new(MemorySessionStore::new()));
    let missing = SessionId::from("session-missing");

    assert!(registry.get(&missing).await.unwrap().is_none());
    assert!(registry.activate(&missing).await.unwrap().is_none());
    assert!(registry.duplicate(&missing).await.unwrap().is_none());
    assert!(registry.rename(&missing, "x").await.unwrap().is_none());
    assert!(registry.hibernate(&missing).await.unwrap().is_none());
    assert!(registry.detach(&missing).await.unwrap().is_none());
    assert!(registry.reattach(&missing).await.unwrap().is_none());
    assert!(registry
        .update_config(&missing, SessionConfig::default())
        .await
        .unwrap()
        .is_none());
    assert!(registry
        .update_bot_status(&missing, BotStatus::Active)
        .await
        .unwrap()
        .is_none());
    assert!(!registry.delete(&missing).await.unwrap());
    assert!(registry.list().await.unwrap().is_empty());
}

/// Test that two concurrent attaches for one session produce one surface
#[tokio::test]
async fn test_concurrent_attach_rejected() {
    let factory: Arc<dyn SurfaceFactory> = Arc::new(MemorySurfaceFactory::default());
    let manager = Arc::new(SurfaceManager::new(factory, Arc::new(LogAggregator::new())));
    let session = Session::new("Main", None, None);

    let (a, b) = tokio::join!(
        manager.attach_surface(&session, DEFAULT_INBOX_URL),
        manager.attach_surface(&session, DEFAULT_INBOX_URL),
    );
    let results = [a.is_ok(), b.is_ok()];
    assert_eq!(results.iter().filter(|ok| **ok).count(), 1);

    let rejected = if a.is_err() { a.err() } else { b.err() };
    assert!(matches!(rejected, Some(SurfaceError::AlreadyAttached(_))));
    assert_eq!(manager.live_sessions().await, vec![session.id.clone()]);
    manager.shutdown().await;
}

/// Test that a session without its own config uses the default
#[tokio::test]
async fn test_config_falls_back_to_default() {
    let registry = registry_on(Arc::new(MemorySessionStore::new()));
    let session = registry.create("Main", None, None).await.unwrap();
    assert!(session.config.is_none());

    let effective = registry.config(&session.id).await.unwrap().unwrap();
    assert_eq!(&effective, registry.default_config());

    let custom = SessionConfig {
        skip_probability: 0.25,
        ..inbox_config()
    };
    registry
        .update_config(&session.id, custom.clone())
        .await
        .unwrap();
    assert_eq!(registry.config(&session.id).await.unwrap(), Some(custom));
}

/// Test that every subscriber sees a bot status change
#[tokio::test]
async fn test_bot_status_reaches_all_observers() {
    let registry = registry_on(Arc::new(MemorySessionStore::new()));
    let session = registry
        .create("Main", None, Some(inbox_config()))
        .await
        .unwrap();

    let mut first = registry.subscribe_bot_status();
    let mut second = registry.subscribe_bot_status();
    registry
        .update_bot_status(&session.id, BotStatus::Active)
        .await
        .unwrap();

    for rx in [&mut first, &mut second] {
        let change = rx.recv().await.unwrap();
        assert_eq!(change.session_id, session.id);
        assert_eq!(change.status, BotStatus::Active);
    }
    registry.shutdown().await;
}

/// Test that rename and hibernate keep identity and config
#[tokio::test]
async fn test_rename_and_hibernate_keep_identity() {
    let registry = registry_on(Arc::new(MemorySessionStore::new()));
    let session = registry
        .create("Main", None, Some(inbox_config()))
        .await
        .unwrap();

    let renamed = registry
        .rename(&session.id, "Storefront")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(renamed.name, "Storefront");

    let hibernated = registry.hibernate(&session.id).await.unwrap().unwrap();
    assert_eq!(hibernated.state, SessionState::Hibernated);
    assert_eq!(hibernated.partition, session.partition);
    assert_eq!(hibernated.config, session.config);
    assert!(!registry.local_host().owns(&session.id).await);
}

/// Test that a restarted registry brings active sessions and their bots back
#[tokio::test]
async fn test_bootstrap_restores_from_json_store() {
    let dir = tempfile::tempdir().unwrap();

    let first = registry_on(Arc::new(JsonSessionStore::new(dir.path()).unwrap()));
    let live = first
        .create("Live", None, Some(inbox_config()))
        .await
        .unwrap();
    let parked = first
        .create("Parked", None, Some(inbox_config()))
        .await
        .unwrap();
    first
        .update_bot_status(&live.id, BotStatus::Active)
        .await
        .unwrap();
    first.hibernate(&parked.id).await.unwrap();
    first.shutdown().await;

    let second = registry_on(Arc::new(JsonSessionStore::new(dir.path()).unwrap()));
    let sessions = second.bootstrap().await.unwrap();
    assert_eq!(sessions.len(), 2);

    let live_again = sessions.iter().find(|s| s.id == live.id).unwrap();
    assert_eq!(live_again.state, SessionState::Active);
    assert_eq!(live_again.bot_status, BotStatus::Active);
    assert!(second.local_host().is_bot_running(&live.id).await);

    let parked_again = sessions.iter().find(|s| s.id == parked.id).unwrap();
    assert_eq!(parked_again.state, SessionState::Hibernated);
    assert!(!second.local_host().owns(&parked.id).await);

    second.shutdown().await;
}
