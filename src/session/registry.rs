//! Session Registry - the single writer of session state
//!
//! Every lifecycle transition goes through here. The registry persists the
//! record, moves surfaces between hosts, starts and stops agents, and tells
//! every observer when a session's bot status changes.
//!
//! ```text
//!             create/activate            detach
//! Inactive ─────────────────► Active ─────────────► Detached
//!    ▲                        │   ▲                     │
//!    │ surface failure        │   └──── reattach ───────┘
//!    │                        ▼
//!    └──────────────────── Hibernated ──activate──► Active
//! ```
//!
//! Lifecycle operations are serialized. Every operation except `create`
//! is a no-op returning `Ok(None)` / `Ok(false)` for an unknown id.

use std::collections::HashMap;
use std::sync::{Arc, Mutex as StdMutex};

use chrono::{DateTime, Utc};
use tokio::sync::{broadcast, watch, Mutex};

use super::config::SessionConfig;
use super::host::{ExecutionHost, HostId};
use super::model::{BotStatus, Session, SessionId, SessionState, SessionSummary};
use super::proxy::ProxyPool;
use super::store::{SessionStore, StoreError};
use crate::agent::{Agent, PlatformRegistry};
use crate::bridge::BridgeHost;
use crate::logs::{LogAggregator, Severity};
use crate::surface::{DetachMode, Detached, SurfaceError, SurfaceFactory};

/// Name given to the session created on first run
pub const DEFAULT_SESSION_NAME: &str = "Session 1";

#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Surface(#[from] SurfaceError),
    #[error("unknown proxy {0}")]
    UnknownProxy(String),
    #[error("session {id} is {state:?}, cannot {operation}")]
    InvalidState {
        id: SessionId,
        state: SessionState,
        operation: &'static str,
    },
}

/// Notification fanned out to every observer of session state
#[derive(Debug, Clone, PartialEq)]
pub struct BotStatusChanged {
    pub session_id: SessionId,
    pub status: BotStatus,
}

/// Receipt for a surface moved to another execution host
#[derive(Debug, Clone, PartialEq)]
pub struct HandoffToken {
    pub session_id: SessionId,
    pub from: HostId,
    pub to: HostId,
    pub issued_at: DateTime<Utc>,
}

pub struct SessionRegistry {
    store: Arc<dyn SessionStore>,
    factory: Arc<dyn SurfaceFactory>,
    bridge: Arc<BridgeHost>,
    logs: Arc<LogAggregator>,
    proxies: Arc<ProxyPool>,
    platforms: Arc<PlatformRegistry>,
    default_config: SessionConfig,
    local: Arc<ExecutionHost>,
    /// Sessions whose surface lives on another host
    detached: Mutex<HashMap<SessionId, Arc<ExecutionHost>>>,
    configs: StdMutex<HashMap<SessionId, watch::Sender<SessionConfig>>>,
    status_tx: broadcast::Sender<BotStatusChanged>,
    lifecycle: Mutex<()>,
}

impl SessionRegistry {
    pub fn new(
        store: Arc<dyn SessionStore>,
        factory: Arc<dyn SurfaceFactory>,
        bridge: Arc<BridgeHost>,
        logs: Arc<LogAggregator>,
    ) -> Self {
        Self::with_parts(
            store,
            factory,
            bridge,
            logs,
            Arc::new(ProxyPool::new()),
            Arc::new(PlatformRegistry::default()),
            SessionConfig::default(),
        )
    }

    pub fn with_parts(
        store: Arc<dyn SessionStore>,
        factory: Arc<dyn SurfaceFactory>,
        bridge: Arc<BridgeHost>,
        logs: Arc<LogAggregator>,
        proxies: Arc<ProxyPool>,
        platforms: Arc<PlatformRegistry>,
        default_config: SessionConfig,
    ) -> Self {
        let local = Arc::new(ExecutionHost::new(
            Arc::clone(&factory),
            Arc::clone(&bridge),
            Arc::clone(&logs),
            Arc::clone(&platforms),
        ));
        let (status_tx, _) = broadcast::channel(64);
        Self {
            store,
            factory,
            bridge,
            logs,
            proxies,
            platforms,
            default_config: default_config.normalized(),
            local,
            detached: Mutex::new(HashMap::new()),
            configs: StdMutex::new(HashMap::new()),
            status_tx,
            lifecycle: Mutex::new(()),
        }
    }

    pub fn local_host(&self) -> &Arc<ExecutionHost> {
        &self.local
    }

    pub fn proxies(&self) -> &Arc<ProxyPool> {
        &self.proxies
    }

    pub fn logs(&self) -> &Arc<LogAggregator> {
        &self.logs
    }

    pub fn default_config(&self) -> &SessionConfig {
        &self.default_config
    }

    /// Observe bot status changes of every session
    pub fn subscribe_bot_status(&self) -> broadcast::Receiver<BotStatusChanged> {
        self.status_tx.subscribe()
    }

    pub async fn get(&self, id: &SessionId) -> Result<Option<Session>, RegistryError> {
        Ok(self.store.get_session(id).await?)
    }

    pub async fn list(&self) -> Result<Vec<SessionSummary>, RegistryError> {
        Ok(self
            .store
            .get_all_sessions()
            .await?
            .iter()
            .map(SessionSummary::from)
            .collect())
    }

    /// Config in effect for a session
    pub async fn config(&self, id: &SessionId) -> Result<Option<SessionConfig>, RegistryError> {
        Ok(self
            .store
            .get_session(id)
            .await?
            .map(|s| s.effective_config(&self.default_config)))
    }

    /// The host currently holding the session's surface
    pub async fn host_of(&self, id: &SessionId) -> Option<Arc<ExecutionHost>> {
        if let Some(host) = self.detached.lock().await.get(id) {
            return Some(Arc::clone(host));
        }
        if self.local.owns(id).await {
            return Some(Arc::clone(&self.local));
        }
        None
    }

    pub async fn agent(&self, id: &SessionId) -> Option<Arc<Agent>> {
        self.host_of(id).await?.agent(id).await
    }

    // ─── lifecycle ────────────────────────────────────────────────────────

    /// Persist a new session and bring its surface up
    ///
    /// A surface failure is logged to the session and leaves it Inactive.
    pub async fn create(
        &self,
        name: &str,
        proxy_id: Option<&str>,
        config_seed: Option<SessionConfig>,
    ) -> Result<Session, RegistryError> {
        let _op = self.lifecycle.lock().await;
        self.create_locked(name, proxy_id, config_seed).await
    }

    async fn create_locked(
        &self,
        name: &str,
        proxy_id: Option<&str>,
        config_seed: Option<SessionConfig>,
    ) -> Result<Session, RegistryError> {
        let proxy = match proxy_id {
            Some(id) => Some(
                self.proxies
                    .get(id)
                    .ok_or_else(|| RegistryError::UnknownProxy(id.to_string()))?,
            ),
            None => None,
        };
        let session = self.store.create_session(name, proxy, config_seed).await?;
        self.logs.global(
            format!("Session \"{}\" created ({})", session.name, session.id),
            Severity::Info,
        );
        tracing::info!(session_id = %session.id, name = %session.name, "session created");
        self.bring_up(session).await
    }

    /// Load every session; on first run create the default one
    pub async fn bootstrap(&self) -> Result<Vec<Session>, RegistryError> {
        let _op = self.lifecycle.lock().await;
        let stored = self.store.get_all_sessions().await?;
        if stored.is_empty() {
            let session = self.create_locked(DEFAULT_SESSION_NAME, None, None).await?;
            self.logs.switch_view(&session.id);
            return Ok(vec![session]);
        }

        let mut sessions = Vec::with_capacity(stored.len());
        for session in stored {
            // Surfaces do not outlive the process; anything that was live comes back local
            let session = match session.state {
                SessionState::Active | SessionState::Detached => self.bring_up(session).await?,
                _ => session,
            };
            sessions.push(session);
        }
        if let Some(first) = sessions.first() {
            self.logs.switch_view(&first.id);
        }
        tracing::info!(count = sessions.len(), "sessions loaded");
        Ok(sessions)
    }

    /// Attach a surface for an Inactive or Hibernated session
    pub async fn activate(&self, id: &SessionId) -> Result<Option<Session>, RegistryError> {
        let _op = self.lifecycle.lock().await;
        let Some(session) = self.store.get_session(id).await? else {
            return Ok(None);
        };
        match session.state {
            SessionState::Detached => Ok(Some(session)),
            SessionState::Active if self.local.owns(id).await => Ok(Some(session)),
            _ => Ok(Some(self.bring_up(session).await?)),
        }
    }

    /// Copy a session: deep-cloned config, fresh partition, new id
    pub async fn duplicate(&self, id: &SessionId) -> Result<Option<Session>, RegistryError> {
        let _op = self.lifecycle.lock().await;
        let Some(copy) = self.store.duplicate_session(id).await? else {
            return Ok(None);
        };
        self.logs.global(
            format!("Session {} duplicated as \"{}\"", id, copy.name),
            Severity::Info,
        );
        Ok(Some(self.bring_up(copy).await?))
    }

    pub async fn rename(&self, id: &SessionId, name: &str) -> Result<Option<Session>, RegistryError> {
        let _op = self.lifecycle.lock().await;
        let renamed = self.store.rename_session(id, name).await?;
        if renamed.is_some() {
            self.logs.info(id, format!("Renamed to \"{}\"", name));
        }
        Ok(renamed)
    }

    /// Tear down the surface, keep identity and config
    pub async fn hibernate(&self, id: &SessionId) -> Result<Option<Session>, RegistryError> {
        let _op = self.lifecycle.lock().await;
        if self.store.get_session(id).await?.is_none() {
            return Ok(None);
        }
        self.tear_down(id).await?;
        let session = self.store.hibernate_session(id).await?;
        self.logs.info(id, "Session hibernated");
        Ok(session)
    }

    /// Irreversibly remove a session, its surface and its config
    pub async fn delete(&self, id: &SessionId) -> Result<bool, RegistryError> {
        let _op = self.lifecycle.lock().await;
        if self.store.get_session(id).await?.is_none() {
            return Ok(false);
        }
        self.tear_down(id).await?;
        let deleted = self.store.delete_session(id).await?;
        self.configs_lock().remove(id);
        self.bridge.unregister(id);
        self.logs.forget(id);
        self.logs
            .global(format!("Session {} deleted", id), Severity::Info);
        Ok(deleted)
    }

    /// Move the session's surface to a new execution host
    ///
    /// The local agent is stopped and the surface snapshotted and closed
    /// before the new host restores it; the agent restarts there only once
    /// the restored surface is live.
    pub async fn detach(&self, id: &SessionId) -> Result<Option<HandoffToken>, RegistryError> {
        let _op = self.lifecycle.lock().await;
        let Some(mut session) = self.store.get_session(id).await? else {
            return Ok(None);
        };
        if session.state != SessionState::Active || !self.local.owns(id).await {
            return Err(RegistryError::InvalidState {
                id: id.clone(),
                state: session.state,
                operation: "detach",
            });
        }

        let target = Arc::new(ExecutionHost::new(
            Arc::clone(&self.factory),
            Arc::clone(&self.bridge),
            Arc::clone(&self.logs),
            Arc::clone(&self.platforms),
        ));
        self.transfer(&session, &self.local, &target).await?;
        self.detached
            .lock()
            .await
            .insert(id.clone(), Arc::clone(&target));

        session.state = SessionState::Detached;
        session.touch();
        self.store.save_session(&session).await?;

        let token = HandoffToken {
            session_id: id.clone(),
            from: self.local.id().clone(),
            to: target.id().clone(),
            issued_at: Utc::now(),
        };
        self.logs
            .highlight(id, format!("Session moved to {}", token.to));
        Ok(Some(token))
    }

    /// Bring a detached session's surface back to the local host
    pub async fn reattach(&self, id: &SessionId) -> Result<Option<Session>, RegistryError> {
        let _op = self.lifecycle.lock().await;
        let Some(mut session) = self.store.get_session(id).await? else {
            return Ok(None);
        };
        let Some(remote) = self.detached.lock().await.get(id).cloned() else {
            return Err(RegistryError::InvalidState {
                id: id.clone(),
                state: session.state,
                operation: "reattach",
            });
        };

        self.transfer(&session, &remote, &self.local).await?;
        self.detached.lock().await.remove(id);
        remote.shutdown().await;

        session.state = SessionState::Active;
        session.touch();
        self.store.save_session(&session).await?;
        self.logs
            .highlight(id, format!("Session back on {}", self.local.id()));
        Ok(Some(session))
    }

    /// Persist a config and hand it to the running agent
    pub async fn update_config(
        &self,
        id: &SessionId,
        config: SessionConfig,
    ) -> Result<Option<Session>, RegistryError> {
        let _op = self.lifecycle.lock().await;
        let Some(session) = self.store.update_session_config(id, config).await? else {
            return Ok(None);
        };
        let effective = session.effective_config(&self.default_config);
        if let Some(sender) = self.configs_lock().get(id) {
            sender.send_replace(effective);
        }
        self.logs.info(id, "Settings saved");
        Ok(Some(session))
    }

    /// Persist the requested bot status, start or stop the agent wherever
    /// the surface lives, and notify every observer
    pub async fn update_bot_status(
        &self,
        id: &SessionId,
        status: BotStatus,
    ) -> Result<Option<Session>, RegistryError> {
        let _op = self.lifecycle.lock().await;
        let Some(mut session) = self.store.get_session(id).await? else {
            return Ok(None);
        };
        session.bot_status = status;
        session.touch();
        self.store.save_session(&session).await?;

        match (status, self.host_of(id).await) {
            (BotStatus::Active, Some(host)) => {
                let config = self.config_channel(&session);
                if let Err(e) = host.launch(id, config).await {
                    self.logs
                        .error(id, format!("Could not start the bot: {}", e));
                }
            }
            (BotStatus::Active, None) => {
                self.logs
                    .info(id, "Bot will start once the session is active");
            }
            (BotStatus::Inactive, Some(host)) => {
                host.quiesce(id).await;
            }
            (BotStatus::Inactive, None) => {}
        }

        // No subscribers is fine
        let _ = self.status_tx.send(BotStatusChanged {
            session_id: id.clone(),
            status,
        });
        self.logs
            .highlight(id, format!("Bot status changed to {}", status));
        Ok(Some(session))
    }

    /// Stop every agent and surface on every host
    pub async fn shutdown(&self) {
        let _op = self.lifecycle.lock().await;
        for (_, host) in self.detached.lock().await.drain() {
            host.shutdown().await;
        }
        self.local.shutdown().await;
    }

    // ─── internals ────────────────────────────────────────────────────────

    fn configs_lock(
        &self,
    ) -> std::sync::MutexGuard<'_, HashMap<SessionId, watch::Sender<SessionConfig>>> {
        self.configs
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Receiver of the session's live config, creating the channel on first use
    fn config_channel(&self, session: &Session) -> watch::Receiver<SessionConfig> {
        let effective = session.effective_config(&self.default_config);
        let mut configs = self.configs_lock();
        match configs.get(&session.id) {
            Some(sender) => {
                sender.send_replace(effective);
                sender.subscribe()
            }
            None => {
                let (sender, receiver) = watch::channel(effective);
                configs.insert(session.id.clone(), sender);
                receiver
            }
        }
    }

    /// Attach a local surface and mark the session Active, starting the bot
    /// if requested. On failure the session keeps its prior state.
    async fn bring_up(&self, mut session: Session) -> Result<Session, RegistryError> {
        let config = session.effective_config(&self.default_config);
        match self.local.attach(&session, &config.entry_url).await {
            Ok(_) => {}
            Err(SurfaceError::AlreadyAttached(_)) => {}
            Err(e) => {
                self.logs.error(
                    &session.id,
                    format!(
                        "Could not open the session ({}). Check the entry URL and proxy, then activate it again.",
                        e
                    ),
                );
                tracing::warn!(session_id = %session.id, error = %e, "surface attach failed");
                return Ok(session);
            }
        }

        session.state = SessionState::Active;
        if config.auto_start {
            session.bot_status = BotStatus::Active;
        }
        session.touch();
        self.store.save_session(&session).await?;
        self.logs.success(&session.id, "Session active");

        if session.bot_status == BotStatus::Active {
            let receiver = self.config_channel(&session);
            match self.local.launch(&session.id, receiver).await {
                Ok(_) => {
                    let _ = self.status_tx.send(BotStatusChanged {
                        session_id: session.id.clone(),
                        status: BotStatus::Active,
                    });
                }
                Err(e) => self
                    .logs
                    .error(&session.id, format!("Could not start the bot: {}", e)),
            }
        }
        Ok(session)
    }

    /// Release whatever host holds the session's surface
    async fn tear_down(&self, id: &SessionId) -> Result<(), RegistryError> {
        if let Some(remote) = self.detached.lock().await.remove(id) {
            remote.shutdown().await;
        }
        self.local.release(id, DetachMode::Destroy).await?;
        Ok(())
    }

    /// Move a live surface from `from` to `to`, restarting the agent on `to`
    /// if it was running on `from`. On failure the surface ends up back on `from`.
    async fn transfer(
        &self,
        session: &Session,
        from: &Arc<ExecutionHost>,
        to: &Arc<ExecutionHost>,
    ) -> Result<(), RegistryError> {
        let id = &session.id;
        let was_running = from.quiesce(id).await || session.bot_status == BotStatus::Active;

        let snapshot = match from.release(id, DetachMode::Transfer).await {
            Ok(Detached::Transferred(snapshot)) => snapshot,
            Ok(_) => {
                return Err(SurfaceError::NotAttached(id.clone()).into());
            }
            Err(e) => {
                // Snapshot failed; the surface is still live on `from`
                if was_running {
                    from.launch(id, self.config_channel(session)).await?;
                }
                return Err(e.into());
            }
        };

        if let Err(e) = to.adopt(session, snapshot.clone()).await {
            self.logs
                .error(id, format!("Handoff failed, keeping the session here: {}", e));
            from.adopt(session, snapshot).await?;
            if was_running {
                from.launch(id, self.config_channel(session)).await?;
            }
            return Err(e.into());
        }

        if was_running {
            to.launch(id, self.config_channel(session)).await?;
        }
        tracing::info!(session_id = %id, from = %from.id(), to = %to.id(), "surface transferred");
        Ok(())
    }
}
