//! Surface Manager - binds each session to exactly one surface
//!
//! The SurfaceManager is responsible for:
//! - Reserving the session id before creation so concurrent attaches race safely
//! - Creating the surface with the session's partition, proxy and fingerprint
//! - Loading the entry URL
//! - Wiring surface events into the log aggregator
//! - Destroying or transferring surfaces on detach
//!
//! ```text
//! attach(s) ──reserve(s)──► factory.create ──navigate(entry)──► Live(s)
//!     │            │
//!     │            └─ already reserved/live ─► AlreadyAttached
//!     └─ create/navigate fails ─► release reservation, error to registry
//! ```

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use tokio::sync::{mpsc, Mutex};

use super::driver::{Surface, SurfaceError, SurfaceEvent, SurfaceFactory, SurfaceSnapshot, SurfaceSpec};
use super::handle::SurfaceHandle;
use crate::logs::{LogAggregator, Severity};
use crate::metrics::{SURFACES_LIVE, SURFACE_ATTACH_DURATION};
use crate::session::{Session, SessionId};

/// What to do with a surface on detach
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DetachMode {
    /// Close and discard
    Destroy,
    /// Snapshot, then close; the snapshot moves to another host
    Transfer,
}

/// Result of a detach
#[derive(Debug)]
pub enum Detached {
    /// No surface was attached
    Missing,
    Destroyed,
    Transferred(SurfaceSnapshot),
}

enum Slot {
    /// Creation in progress
    Reserved,
    Live(SurfaceHandle),
}

/// One surface per session id
pub struct SurfaceManager {
    factory: Arc<dyn SurfaceFactory>,
    logs: Arc<LogAggregator>,
    slots: Mutex<HashMap<SessionId, Slot>>,
}

impl SurfaceManager {
    pub fn new(factory: Arc<dyn SurfaceFactory>, logs: Arc<LogAggregator>) -> Self {
        Self {
            factory,
            logs,
            slots: Mutex::new(HashMap::new()),
        }
    }

    /// Create a surface for `session` and load `entry_url`
    pub async fn attach_surface(
        &self,
        session: &Session,
        entry_url: &str,
    ) -> Result<Arc<dyn Surface>, SurfaceError> {
        let start = Instant::now();
        self.reserve(&session.id).await?;

        let spec = spec_for(session, entry_url);
        let (tx, observer) = self.spawn_observer(&session.id);

        let surface = match self.factory.create(&spec, tx).await {
            Ok(surface) => surface,
            Err(e) => {
                observer.abort();
                self.release_reservation(&session.id).await;
                return Err(e);
            }
        };

        if let Err(e) = surface.navigate(entry_url).await {
            if let Err(close_err) = surface.close().await {
                tracing::warn!(session_id = %session.id, error = %close_err, "failed to close surface after load failure");
            }
            observer.abort();
            self.release_reservation(&session.id).await;
            return Err(SurfaceError::Navigation {
                url: entry_url.to_string(),
                reason: e.to_string(),
            });
        }

        self.install(&session.id, Arc::clone(&surface), observer).await;
        SURFACE_ATTACH_DURATION.observe(start.elapsed().as_secs_f64());
        tracing::info!(
            session_id = %session.id,
            partition = %session.partition,
            took_ms = start.elapsed().as_millis() as u64,
            "surface attached"
        );
        Ok(surface)
    }

    /// Rebuild a surface from a snapshot taken on another host
    pub async fn restore_surface(
        &self,
        session: &Session,
        snapshot: SurfaceSnapshot,
    ) -> Result<Arc<dyn Surface>, SurfaceError> {
        self.reserve(&session.id).await?;

        let spec = spec_for(session, &snapshot.url);
        let (tx, observer) = self.spawn_observer(&session.id);

        let surface = match self.factory.restore(&spec, snapshot, tx).await {
            Ok(surface) if surface.is_live() => surface,
            Ok(_) => {
                observer.abort();
                self.release_reservation(&session.id).await;
                return Err(SurfaceError::CreateFailed(
                    "restored surface is not live".to_string(),
                ));
            }
            Err(e) => {
                observer.abort();
                self.release_reservation(&session.id).await;
                return Err(e);
            }
        };

        self.install(&session.id, Arc::clone(&surface), observer).await;
        tracing::info!(session_id = %session.id, "surface restored");
        Ok(surface)
    }

    /// Tear down a session's surface
    ///
    /// In `Transfer` mode the snapshot is returned; if taking it fails the
    /// surface stays live.
    pub async fn detach_surface(
        &self,
        session_id: &SessionId,
        mode: DetachMode,
    ) -> Result<Detached, SurfaceError> {
        let mut handle = {
            let mut slots = self.slots.lock().await;
            match slots.remove(session_id) {
                Some(Slot::Live(handle)) => handle,
                Some(Slot::Reserved) => {
                    slots.insert(session_id.clone(), Slot::Reserved);
                    return Err(SurfaceError::NotAttached(session_id.clone()));
                }
                None => return Ok(Detached::Missing),
            }
        };

        let outcome = match mode {
            DetachMode::Destroy => Detached::Destroyed,
            DetachMode::Transfer => match handle.surface.snapshot().await {
                Ok(snapshot) => Detached::Transferred(snapshot),
                Err(e) => {
                    self.slots
                        .lock()
                        .await
                        .insert(session_id.clone(), Slot::Live(handle));
                    return Err(e);
                }
            },
        };

        handle.shutdown().await;
        SURFACES_LIVE.dec();
        tracing::info!(session_id = %session_id, ?mode, "surface detached");
        Ok(outcome)
    }

    /// The live surface for a session, if any
    pub async fn surface(&self, session_id: &SessionId) -> Option<Arc<dyn Surface>> {
        match self.slots.lock().await.get(session_id) {
            Some(Slot::Live(handle)) if handle.is_live() => Some(Arc::clone(&handle.surface)),
            _ => None,
        }
    }

    pub async fn is_attached(&self, session_id: &SessionId) -> bool {
        self.surface(session_id).await.is_some()
    }

    /// Ids with a live surface
    pub async fn live_sessions(&self) -> Vec<SessionId> {
        self.slots
            .lock()
            .await
            .iter()
            .filter_map(|(id, slot)| match slot {
                Slot::Live(handle) if handle.is_live() => Some(id.clone()),
                _ => None,
            })
            .collect()
    }

    /// Destroy every surface
    pub async fn shutdown(&self) {
        let handles: Vec<SurfaceHandle> = {
            let mut slots = self.slots.lock().await;
            slots
                .drain()
                .filter_map(|(_, slot)| match slot {
                    Slot::Live(handle) => Some(handle),
                    Slot::Reserved => None,
                })
                .collect()
        };
        for mut handle in handles {
            handle.shutdown().await;
            SURFACES_LIVE.dec();
        }
    }

    async fn reserve(&self, session_id: &SessionId) -> Result<(), SurfaceError> {
        let mut slots = self.slots.lock().await;
        if slots.contains_key(session_id) {
            return Err(SurfaceError::AlreadyAttached(session_id.clone()));
        }
        slots.insert(session_id.clone(), Slot::Reserved);
        Ok(())
    }

    async fn release_reservation(&self, session_id: &SessionId) {
        let mut slots = self.slots.lock().await;
        if matches!(slots.get(session_id), Some(Slot::Reserved)) {
            slots.remove(session_id);
        }
    }

    async fn install(
        &self,
        session_id: &SessionId,
        surface: Arc<dyn Surface>,
        observer: tokio::task::JoinHandle<()>,
    ) {
        let mut handle = SurfaceHandle::new(session_id.clone(), surface, observer);
        handle.mark_ready();
        self.slots
            .lock()
            .await
            .insert(session_id.clone(), Slot::Live(handle));
        SURFACES_LIVE.inc();
    }

    fn spawn_observer(
        &self,
        session_id: &SessionId,
    ) -> (mpsc::UnboundedSender<SurfaceEvent>, tokio::task::JoinHandle<()>) {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let logs = Arc::clone(&self.logs);
        let session_id = session_id.clone();
        let observer = tokio::spawn(async move {
            while let Some(event) = rx.recv().await {
                match event {
                    SurfaceEvent::ContentReady { url } => {
                        logs.info(&session_id, format!("Page ready: {}", url));
                    }
                    SurfaceEvent::LoadFailed { url, reason } => {
                        logs.error(&session_id, format!("Failed to load {}: {}", url, reason));
                    }
                    SurfaceEvent::Console { level, message } => {
                        let severity = if level == "error" {
                            Severity::Error
                        } else {
                            Severity::Info
                        };
                        logs.record(&session_id, message, severity);
                    }
                }
            }
        });
        (tx, observer)
    }
}

fn spec_for(session: &Session, entry_url: &str) -> SurfaceSpec {
    SurfaceSpec {
        session_id: session.id.clone(),
        partition: session.partition.clone(),
        proxy: session.proxy.clone(),
        fingerprint: session.fingerprint.clone(),
        entry_url: entry_url.to_string(),
    }
}
