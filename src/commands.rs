//! Control commands surfaced to the host UI
//!
//! Thin facade over [`SessionRegistry`]: each command maps onto one
//! registry or collaborator call and records what it did in the session's
//! log stream.

use std::sync::Arc;

use crate::logs::LogEntry;
use crate::session::{
    BotStatus, ProxyEntry, ProxyRef, RegistryError, Session, SessionConfig, SessionId,
    SessionRegistry, SessionSummary,
};

#[derive(Clone)]
pub struct ControlApi {
    registry: Arc<SessionRegistry>,
}

impl ControlApi {
    pub fn new(registry: Arc<SessionRegistry>) -> Self {
        Self { registry }
    }

    pub fn registry(&self) -> &Arc<SessionRegistry> {
        &self.registry
    }

    pub async fn start_bot(&self, id: &SessionId) -> Result<Option<Session>, RegistryError> {
        tracing::debug!(session_id = %id, "start_bot");
        self.registry.update_bot_status(id, BotStatus::Active).await
    }

    pub async fn stop_bot(&self, id: &SessionId) -> Result<Option<Session>, RegistryError> {
        tracing::debug!(session_id = %id, "stop_bot");
        self.registry.update_bot_status(id, BotStatus::Inactive).await
    }

    /// Persist a config; the running agent picks it up on its next cycle
    pub async fn save_config(
        &self,
        id: &SessionId,
        config: SessionConfig,
    ) -> Result<Option<Session>, RegistryError> {
        self.registry.update_config(id, config).await
    }

    /// The config in effect, which is the default when none was saved
    pub async fn read_config(&self, id: &SessionId) -> Result<Option<SessionConfig>, RegistryError> {
        self.registry.config(id).await
    }

    pub fn read_logs(&self, id: &SessionId) -> Vec<LogEntry> {
        self.registry.logs().entries(id)
    }

    /// Switch the live log view to `id` and return its buffered entries
    pub fn view_logs(&self, id: &SessionId) -> Vec<LogEntry> {
        self.registry.logs().switch_view(id)
    }

    pub fn read_proxies(&self) -> Vec<ProxyEntry> {
        self.registry.proxies().list()
    }

    /// Replace the proxy pool. Sessions keep the binding they were created with.
    pub fn write_proxies(&self, proxies: Vec<ProxyRef>) -> Vec<ProxyEntry> {
        let count = proxies.len();
        self.registry.proxies().replace(proxies);
        tracing::info!(count, "proxy pool replaced");
        self.registry.proxies().list()
    }

    pub async fn list_sessions(&self) -> Result<Vec<SessionSummary>, RegistryError> {
        self.registry.list().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bridge::{BridgeError, BridgeHost, ChatBackend, ChatMessage};
    use crate::logs::LogAggregator;
    use crate::session::{AiConfig, MemorySessionStore, ProxyStatus};
    use crate::surface::MemorySurfaceFactory;
    use async_trait::async_trait;
    use std::time::Duration;

    struct Silent;

    #[async_trait]
    impl ChatBackend for Silent {
        async fn complete(
            &self,
            _: &[ChatMessage],
            _: &AiConfig,
            _: Duration,
        ) -> Result<String, BridgeError> {
            Err(BridgeError::EmptyContent)
        }
    }

    fn api() -> ControlApi {
        let registry = SessionRegistry::new(
            Arc::new(MemorySessionStore::new()),
            Arc::new(MemorySurfaceFactory::default()),
            Arc::new(BridgeHost::new(Arc::new(Silent))),
            Arc::new(LogAggregator::new()),
        );
        ControlApi::new(Arc::new(registry))
    }

    #[tokio::test]
    async fn test_start_and_stop_bot() {
        let api = api();
        let session = api.registry().create("Main", None, None).await.unwrap();

        let started = api.start_bot(&session.id).await.unwrap().unwrap();
        assert_eq!(started.bot_status, BotStatus::Active);
        let stopped = api.stop_bot(&session.id).await.unwrap().unwrap();
        assert_eq!(stopped.bot_status, BotStatus::Inactive);

        let listed = api.list_sessions().await.unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].bot_status, BotStatus::Inactive);
    }

    #[tokio::test]
    async fn test_read_config_falls_back_to_default() {
        let api = api();
        let session = api.registry().create("Main", None, None).await.unwrap();
        let config = api.read_config(&session.id).await.unwrap().unwrap();
        assert_eq!(&config, api.registry().default_config());

        let mut custom = SessionConfig::default();
        custom.skip_probability = 0.0;
        api.save_config(&session.id, custom.clone()).await.unwrap();
        assert_eq!(api.read_config(&session.id).await.unwrap(), Some(custom));
    }

    #[tokio::test]
    async fn test_unknown_session_commands_are_noops() {
        let api = api();
        let missing = SessionId::from("session-missing");
        assert!(api.start_bot(&missing).await.unwrap().is_none());
        assert!(api.read_config(&missing).await.unwrap().is_none());
        assert!(api.read_logs(&missing).is_empty());
    }

    #[test]
    fn test_write_proxies_replaces_pool() {
        let api = api();
        let entries = api.write_proxies(vec![ProxyRef {
            id: "px-1".to_string(),
            host: "10.0.0.1".to_string(),
            port: 3128,
        }]);
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].status, ProxyStatus::Unknown);
        assert_eq!(api.read_proxies().len(), 1);
    }
}
