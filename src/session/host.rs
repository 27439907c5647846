//! Execution hosts
//!
//! A host owns a set of surfaces and the agents driving them. Detaching a
//! session moves its surface from one host to another; at no point do two
//! hosts both hold a live surface for the same session.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::{watch, Mutex};

use super::config::SessionConfig;
use super::model::{Session, SessionId};
use crate::agent::{Agent, PlatformRegistry};
use crate::bridge::{BridgeClient, BridgeHost};
use crate::logs::LogAggregator;
use crate::surface::{
    DetachMode, Detached, Surface, SurfaceError, SurfaceFactory, SurfaceManager, SurfaceSnapshot,
};

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct HostId(String);

impl HostId {
    pub fn generate() -> Self {
        Self(format!("host-{}", uuid::Uuid::now_v7()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for HostId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

pub struct ExecutionHost {
    id: HostId,
    surfaces: SurfaceManager,
    agents: Mutex<HashMap<SessionId, Arc<Agent>>>,
    bridge: Arc<BridgeHost>,
    logs: Arc<LogAggregator>,
    platforms: Arc<PlatformRegistry>,
}

impl ExecutionHost {
    pub fn new(
        factory: Arc<dyn SurfaceFactory>,
        bridge: Arc<BridgeHost>,
        logs: Arc<LogAggregator>,
        platforms: Arc<PlatformRegistry>,
    ) -> Self {
        Self {
            id: HostId::generate(),
            surfaces: SurfaceManager::new(factory, Arc::clone(&logs)),
            agents: Mutex::new(HashMap::new()),
            bridge,
            logs,
            platforms,
        }
    }

    pub fn id(&self) -> &HostId {
        &self.id
    }

    pub fn surfaces(&self) -> &SurfaceManager {
        &self.surfaces
    }

    /// Attach a fresh surface for `session`
    pub async fn attach(
        &self,
        session: &Session,
        entry_url: &str,
    ) -> Result<Arc<dyn Surface>, SurfaceError> {
        self.surfaces.attach_surface(session, entry_url).await
    }

    /// Take ownership of a surface transferred from another host
    pub async fn adopt(
        &self,
        session: &Session,
        snapshot: SurfaceSnapshot,
    ) -> Result<Arc<dyn Surface>, SurfaceError> {
        self.surfaces.restore_surface(session, snapshot).await
    }

    /// Start the session's agent. The surface must already be live here.
    pub async fn launch(
        &self,
        session_id: &SessionId,
        config: watch::Receiver<SessionConfig>,
    ) -> Result<Arc<Agent>, SurfaceError> {
        let mut agents = self.agents.lock().await;
        if let Some(agent) = agents.get(session_id) {
            agent.start();
            return Ok(Arc::clone(agent));
        }

        let surface = self
            .surfaces
            .surface(session_id)
            .await
            .ok_or_else(|| SurfaceError::NotAttached(session_id.clone()))?;
        let agent = Arc::new(
            Agent::new(
                session_id.clone(),
                surface,
                config,
                BridgeClient::new(self.bridge.slot_for(session_id)),
                Arc::clone(&self.logs),
            )
            .with_platforms(Arc::clone(&self.platforms)),
        );
        agent.start();
        agents.insert(session_id.clone(), Arc::clone(&agent));
        tracing::info!(host = %self.id, session_id = %session_id, "agent launched");
        Ok(agent)
    }

    /// Stop the session's agent; the surface stays. True if it was running.
    pub async fn quiesce(&self, session_id: &SessionId) -> bool {
        match self.agents.lock().await.get(session_id) {
            Some(agent) => {
                let was_running = agent.is_running();
                agent.stop();
                was_running
            }
            None => false,
        }
    }

    /// Stop and forget the agent, then destroy or transfer the surface
    pub async fn release(
        &self,
        session_id: &SessionId,
        mode: DetachMode,
    ) -> Result<Detached, SurfaceError> {
        if let Some(agent) = self.agents.lock().await.remove(session_id) {
            agent.stop();
        }
        self.surfaces.detach_surface(session_id, mode).await
    }

    /// Whether a live surface for the session is held here
    pub async fn owns(&self, session_id: &SessionId) -> bool {
        self.surfaces.is_attached(session_id).await
    }

    pub async fn agent(&self, session_id: &SessionId) -> Option<Arc<Agent>> {
        self.agents.lock().await.get(session_id).cloned()
    }

    pub async fn is_bot_running(&self, session_id: &SessionId) -> bool {
        self.agent(session_id)
            .await
            .map_or(false, |agent| agent.is_running())
    }

    /// Stop every agent and destroy every surface
    pub async fn shutdown(&self) {
        for (_, agent) in self.agents.lock().await.drain() {
            agent.stop();
        }
        self.surfaces.shutdown().await;
    }
}

impl fmt::Debug for ExecutionHost {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExecutionHost").field("id", &self.id).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bridge::{BridgeError, ChatBackend, ChatMessage};
    use crate::session::AiConfig;
    use crate::surface::memory::DEFAULT_INBOX_URL;
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

    fn host() -> ExecutionHost {
        ExecutionHost::new(
            Arc::new(MemorySurfaceFactory::default()),
            Arc::new(BridgeHost::new(Arc::new(Silent))),
            Arc::new(LogAggregator::new()),
            Arc::new(PlatformRegistry::default()),
        )
    }

    #[tokio::test]
    async fn test_launch_requires_surface() {
        let host = host();
        let session = Session::new("Main", None, None);
        let (_tx, rx) = watch::channel(SessionConfig::default());
        assert!(matches!(
            host.launch(&session.id, rx).await,
            Err(SurfaceError::NotAttached(_))
        ));
    }

    #[tokio::test]
    async fn test_quiesce_then_release() {
        let host = host();
        let session = Session::new("Main", None, None);
        host.attach(&session, DEFAULT_INBOX_URL).await.unwrap();
        let (_tx, rx) = watch::channel(SessionConfig::default());
        let agent = host.launch(&session.id, rx).await.unwrap();
        assert!(host.is_bot_running(&session.id).await);

        assert!(host.quiesce(&session.id).await);
        assert!(!agent.is_running());
        assert!(host.owns(&session.id).await);

        let detached = host
            .release(&session.id, DetachMode::Destroy)
            .await
            .unwrap();
        assert!(matches!(detached, Detached::Destroyed));
        assert!(!host.owns(&session.id).await);
        assert!(host.agent(&session.id).await.is_none());
    }
}
