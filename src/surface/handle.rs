//! Surface Handle - one live surface and its bookkeeping
//!
//! Each SurfaceHandle tracks one session's surface throughout its lifecycle:
//! Starting -> Ready -> Detaching

use std::sync::Arc;
use std::time::Instant;

use tokio::task::JoinHandle;

use super::driver::Surface;
use crate::session::SessionId;

/// Status of a surface
#[derive(Debug, Clone, PartialEq)]
pub enum SurfaceStatus {
    /// Created, entry URL still loading
    Starting,
    /// Entry URL loaded, agent may run
    Ready,
    /// Being destroyed or transferred
    Detaching,
    /// Loading failed
    Failed(String),
}

pub struct SurfaceHandle {
    pub session_id: SessionId,
    pub surface: Arc<dyn Surface>,
    pub status: SurfaceStatus,
    pub created_at: Instant,
    /// Task forwarding surface events into the log aggregator
    observer: Option<JoinHandle<()>>,
}

impl SurfaceHandle {
    pub fn new(session_id: SessionId, surface: Arc<dyn Surface>, observer: JoinHandle<()>) -> Self {
        Self {
            session_id,
            surface,
            status: SurfaceStatus::Starting,
            created_at: Instant::now(),
            observer: Some(observer),
        }
    }

    pub fn mark_ready(&mut self) {
        self.status = SurfaceStatus::Ready;
    }

    pub fn mark_failed(&mut self, error: String) {
        self.status = SurfaceStatus::Failed(error);
    }

    /// Ready and still accepting commands
    pub fn is_live(&self) -> bool {
        matches!(self.status, SurfaceStatus::Ready) && self.surface.is_live()
    }

    pub fn age(&self) -> std::time::Duration {
        self.created_at.elapsed()
    }

    /// Close the surface and stop its observer
    pub async fn shutdown(&mut self) {
        self.status = SurfaceStatus::Detaching;
        if let Err(e) = self.surface.close().await {
            tracing::warn!(session_id = %self.session_id, error = %e, "failed to close surface");
        }
        if let Some(observer) = self.observer.take() {
            observer.abort();
        }
    }
}

impl std::fmt::Debug for SurfaceHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SurfaceHandle")
            .field("session_id", &self.session_id)
            .field("partition", self.surface.partition())
            .field("status", &self.status)
            .field("age", &self.age())
            .finish()
    }
}
