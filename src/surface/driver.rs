//! Browsing surface driver contract
//!
//! A surface is one isolated, credential-scoped browsing context. The real
//! browser driver lives outside this crate; the agent and manager only see
//! these traits.

use std::collections::HashMap;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::session::{Fingerprint, Partition, ProxyRef, SessionId};

/// Handle to an element within the current page
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ElementRef(pub String);

impl ElementRef {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

/// One node of the page's accessibility-style snapshot
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PageElement {
    pub element: ElementRef,
    /// ARIA role or tag-like kind (`listitem`, `textbox`, `button`, ...)
    pub role: String,
    /// Visible text
    pub text: String,
    #[serde(default)]
    pub attrs: HashMap<String, String>,
}

impl PageElement {
    pub fn attr(&self, name: &str) -> Option<&str> {
        self.attrs.get(name).map(String::as_str)
    }

    pub fn has_flag(&self, name: &str) -> bool {
        matches!(self.attr(name), Some("true"))
    }
}

/// Structured view of the page at one instant, in document order
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PageSnapshot {
    pub url: String,
    pub elements: Vec<PageElement>,
}

impl PageSnapshot {
    pub fn by_role<'a>(&'a self, role: &'a str) -> impl Iterator<Item = &'a PageElement> + 'a {
        self.elements.iter().filter(move |e| e.role == role)
    }

    pub fn find(&self, element: &ElementRef) -> Option<&PageElement> {
        self.elements.iter().find(|e| &e.element == element)
    }
}

/// Serialized surface state handed across an execution-host boundary
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SurfaceSnapshot {
    pub url: String,
    /// Partition-scoped persistent storage
    pub storage: HashMap<String, String>,
    /// Driver-specific state (cookies, page state)
    #[serde(default)]
    pub driver_state: serde_json::Value,
}

/// Everything needed to build a session's surface
#[derive(Debug, Clone)]
pub struct SurfaceSpec {
    pub session_id: SessionId,
    pub partition: Partition,
    pub proxy: Option<ProxyRef>,
    pub fingerprint: Fingerprint,
    pub entry_url: String,
}

/// Surface-level notifications wired to the log aggregator
#[derive(Debug, Clone, PartialEq)]
pub enum SurfaceEvent {
    ContentReady { url: String },
    LoadFailed { url: String, reason: String },
    Console { level: String, message: String },
}

pub type SurfaceEvents = mpsc::UnboundedSender<SurfaceEvent>;

/// Error type for surface operations
#[derive(Debug, thiserror::Error)]
pub enum SurfaceError {
    #[error("session {0} already has a live surface")]
    AlreadyAttached(SessionId),
    #[error("session {0} has no live surface")]
    NotAttached(SessionId),
    #[error("failed to create surface: {0}")]
    CreateFailed(String),
    #[error("navigation to {url} failed: {reason}")]
    Navigation { url: String, reason: String },
    #[error("element {0} not found")]
    ElementNotFound(String),
    #[error("surface is closed")]
    Closed,
    #[error("driver error: {0}")]
    Driver(String),
}

/// One live, isolated browsing context
#[async_trait]
pub trait Surface: Send + Sync {
    fn session_id(&self) -> &SessionId;

    fn partition(&self) -> &Partition;

    async fn current_url(&self) -> Result<String, SurfaceError>;

    async fn navigate(&self, url: &str) -> Result<(), SurfaceError>;

    /// Structured snapshot of the current page
    async fn read_page(&self) -> Result<PageSnapshot, SurfaceError>;

    async fn click(&self, element: &ElementRef) -> Result<(), SurfaceError>;

    /// Empty an input, dropping anything left from an interrupted submission
    async fn clear_input(&self, element: &ElementRef) -> Result<(), SurfaceError>;

    /// Type one character into an input, firing its native input/change notifications
    async fn type_char(&self, element: &ElementRef, ch: char) -> Result<(), SurfaceError>;

    /// Simulated confirm keystroke on an element
    async fn press_enter(&self, element: &ElementRef) -> Result<(), SurfaceError>;

    /// Read from partition-scoped persistent storage
    async fn storage_get(&self, key: &str) -> Result<Option<String>, SurfaceError>;

    async fn storage_set(&self, key: &str, value: String) -> Result<(), SurfaceError>;

    /// Capture state for transfer to another host
    async fn snapshot(&self) -> Result<SurfaceSnapshot, SurfaceError>;

    /// Whether the surface can still take commands
    fn is_live(&self) -> bool;

    async fn close(&self) -> Result<(), SurfaceError>;
}

/// Builds surfaces for sessions
#[async_trait]
pub trait SurfaceFactory: Send + Sync {
    /// Create a fresh surface. The caller loads the entry URL.
    async fn create(
        &self,
        spec: &SurfaceSpec,
        events: SurfaceEvents,
    ) -> Result<std::sync::Arc<dyn Surface>, SurfaceError>;

    /// Rebuild a surface from a transferred snapshot
    async fn restore(
        &self,
        spec: &SurfaceSpec,
        snapshot: SurfaceSnapshot,
        events: SurfaceEvents,
    ) -> Result<std::sync::Arc<dyn Surface>, SurfaceError>;
}
