//! In-process surface
//!
//! Simulates a messaging inbox well enough to drive the agent without a
//! browser: conversation threads with unread markers, a priority channel,
//! a composer and a send button. Used by the demo binary and by tests.
//!
//! Page layout produced by `read_page` (document order):
//!
//! ```text
//! link     nav:inbox            rel=inbox href=<inbox url>
//! listitem thread:<i>           counterpart, unread, channel (priority|inbox)   [inbox only]
//! heading  header               counterpart                                    [thread open]
//! article  msg:<i>:<j>          author, direction (incoming|outgoing)           [thread open]
//! textbox  composer                                                            [thread open]
//! button   send                                                                [thread open, if enabled]
//! ```

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use super::driver::{
    ElementRef, PageElement, PageSnapshot, Surface, SurfaceError, SurfaceEvent, SurfaceEvents,
    SurfaceFactory, SurfaceSnapshot, SurfaceSpec,
};
use crate::session::{Partition, SessionId};

pub const DEFAULT_INBOX_URL: &str = "https://chat.example.com/inbox";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MemoryMessage {
    pub author: String,
    pub text: String,
    pub from_self: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MemoryThread {
    pub counterpart: String,
    pub unread: bool,
    pub priority: bool,
    pub messages: Vec<MemoryMessage>,
}

/// A message that went out through the composer
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SentMessage {
    pub counterpart: String,
    pub text: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct PageState {
    url: String,
    inbox_url: String,
    own_handle: String,
    threads: Vec<MemoryThread>,
    open: Option<usize>,
    input: String,
    has_submit_button: bool,
}

impl PageState {
    fn on_inbox(&self) -> bool {
        self.url.starts_with(&self.inbox_url)
    }
}

/// Simulated browsing surface
pub struct MemorySurface {
    session_id: SessionId,
    partition: Partition,
    state: Mutex<PageState>,
    storage: Mutex<HashMap<String, String>>,
    sent: Mutex<Vec<SentMessage>>,
    change_events: AtomicUsize,
    failing_urls: Mutex<Vec<String>>,
    live: AtomicBool,
    events: SurfaceEvents,
}

fn guard<T>(m: &Mutex<T>) -> Result<MutexGuard<'_, T>, SurfaceError> {
    m.lock()
        .map_err(|_| SurfaceError::Driver("surface state poisoned".to_string()))
}

impl MemorySurface {
    fn build(
        spec: &SurfaceSpec,
        state: PageState,
        storage: HashMap<String, String>,
        events: SurfaceEvents,
    ) -> Self {
        Self {
            session_id: spec.session_id.clone(),
            partition: spec.partition.clone(),
            state: Mutex::new(state),
            storage: Mutex::new(storage),
            sent: Mutex::new(Vec::new()),
            change_events: AtomicUsize::new(0),
            failing_urls: Mutex::new(Vec::new()),
            live: AtomicBool::new(true),
            events,
        }
    }

    fn ensure_live(&self) -> Result<(), SurfaceError> {
        if self.live.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(SurfaceError::Closed)
        }
    }

    /// Deliver an incoming message from `counterpart`
    ///
    /// Marks the thread unread unless it is the one currently open.
    pub fn push_incoming(&self, counterpart: &str, text: &str) {
        let Ok(mut state) = self.state.lock() else {
            return;
        };
        let open = state.open;
        let index = match state
            .threads
            .iter()
            .position(|t| t.counterpart == counterpart)
        {
            Some(i) => i,
            None => {
                state.threads.push(MemoryThread {
                    counterpart: counterpart.to_string(),
                    unread: false,
                    priority: false,
                    messages: Vec::new(),
                });
                state.threads.len() - 1
            }
        };
        let thread = &mut state.threads[index];
        thread.messages.push(MemoryMessage {
            author: counterpart.to_string(),
            text: text.to_string(),
            from_self: false,
        });
        thread.unread = open != Some(index);
    }

    /// Deliver an outgoing message typed elsewhere (another device)
    pub fn push_outgoing(&self, counterpart: &str, text: &str) {
        let Ok(mut state) = self.state.lock() else {
            return;
        };
        let own = state.own_handle.clone();
        if let Some(thread) = state
            .threads
            .iter_mut()
            .find(|t| t.counterpart == counterpart)
        {
            thread.messages.push(MemoryMessage {
                author: own,
                text: text.to_string(),
                from_self: true,
            });
        }
    }

    /// Put a counterpart's thread in the priority channel
    pub fn set_priority(&self, counterpart: &str, priority: bool) {
        if let Ok(mut state) = self.state.lock() {
            if let Some(thread) = state
                .threads
                .iter_mut()
                .find(|t| t.counterpart == counterpart)
            {
                thread.priority = priority;
            }
        }
    }

    /// Remove the send button so submission falls back to Enter
    pub fn set_submit_button(&self, present: bool) {
        if let Ok(mut state) = self.state.lock() {
            state.has_submit_button = present;
        }
    }

    /// Make navigation to `url` fail
    pub fn fail_navigation_to(&self, url: &str) {
        if let Ok(mut failing) = self.failing_urls.lock() {
            failing.push(url.to_string());
        }
    }

    /// Open a thread as if the user clicked it
    pub fn open_thread(&self, counterpart: &str) {
        if let Ok(mut state) = self.state.lock() {
            if let Some(i) = state
                .threads
                .iter()
                .position(|t| t.counterpart == counterpart)
            {
                state.open = Some(i);
                state.threads[i].unread = false;
            }
        }
    }

    pub fn sent(&self) -> Vec<SentMessage> {
        self.sent.lock().map(|s| s.clone()).unwrap_or_default()
    }

    /// Number of native input notifications fired by typing
    pub fn change_events(&self) -> usize {
        self.change_events.load(Ordering::SeqCst)
    }

    /// Text sitting in the composer, not yet submitted
    pub fn pending_input(&self) -> String {
        self.state
            .lock()
            .map(|s| s.input.clone())
            .unwrap_or_default()
    }

    pub fn open_counterpart(&self) -> Option<String> {
        let state = self.state.lock().ok()?;
        state.open.map(|i| state.threads[i].counterpart.clone())
    }

    fn submit(&self) -> Result<(), SurfaceError> {
        let mut state = guard(&self.state)?;
        let index = state
            .open
            .ok_or_else(|| SurfaceError::Driver("no conversation open".to_string()))?;
        if state.input.trim().is_empty() {
            return Ok(());
        }
        let text = std::mem::take(&mut state.input);
        let own = state.own_handle.clone();
        let thread = &mut state.threads[index];
        thread.messages.push(MemoryMessage {
            author: own,
            text: text.clone(),
            from_self: true,
        });
        let counterpart = thread.counterpart.clone();
        guard(&self.sent)?.push(SentMessage { counterpart, text });
        Ok(())
    }

    fn render(state: &PageState) -> PageSnapshot {
        let mut elements = Vec::new();
        elements.push(PageElement {
            element: ElementRef::new("nav:inbox"),
            role: "link".to_string(),
            text: "Messages".to_string(),
            attrs: HashMap::from([
                ("rel".to_string(), "inbox".to_string()),
                ("href".to_string(), state.inbox_url.clone()),
            ]),
        });

        if state.on_inbox() {
            for (i, thread) in state.threads.iter().enumerate() {
                elements.push(PageElement {
                    element: ElementRef::new(format!("thread:{}", i)),
                    role: "listitem".to_string(),
                    text: thread.counterpart.clone(),
                    attrs: HashMap::from([
                        ("counterpart".to_string(), thread.counterpart.clone()),
                        ("unread".to_string(), thread.unread.to_string()),
                        (
                            "channel".to_string(),
                            if thread.priority { "priority" } else { "inbox" }.to_string(),
                        ),
                    ]),
                });
            }

            if let Some(open) = state.open {
                let thread = &state.threads[open];
                elements.push(PageElement {
                    element: ElementRef::new("header"),
                    role: "heading".to_string(),
                    text: thread.counterpart.clone(),
                    attrs: HashMap::from([(
                        "counterpart".to_string(),
                        thread.counterpart.clone(),
                    )]),
                });
                for (j, message) in thread.messages.iter().enumerate() {
                    elements.push(PageElement {
                        element: ElementRef::new(format!("msg:{}:{}", open, j)),
                        role: "article".to_string(),
                        text: message.text.clone(),
                        attrs: HashMap::from([
                            ("author".to_string(), message.author.clone()),
                            (
                                "direction".to_string(),
                                if message.from_self { "outgoing" } else { "incoming" }
                                    .to_string(),
                            ),
                        ]),
                    });
                }
                elements.push(PageElement {
                    element: ElementRef::new("composer"),
                    role: "textbox".to_string(),
                    text: state.input.clone(),
                    attrs: HashMap::from([(
                        "placeholder".to_string(),
                        "Message...".to_string(),
                    )]),
                });
                if state.has_submit_button {
                    elements.push(PageElement {
                        element: ElementRef::new("send"),
                        role: "button".to_string(),
                        text: "Send".to_string(),
                        attrs: HashMap::new(),
                    });
                }
            }
        }

        PageSnapshot {
            url: state.url.clone(),
            elements,
        }
    }
}

#[async_trait]
impl Surface for MemorySurface {
    fn session_id(&self) -> &SessionId {
        &self.session_id
    }

    fn partition(&self) -> &Partition {
        &self.partition
    }

    async fn current_url(&self) -> Result<String, SurfaceError> {
        self.ensure_live()?;
        Ok(guard(&self.state)?.url.clone())
    }

    async fn navigate(&self, url: &str) -> Result<(), SurfaceError> {
        self.ensure_live()?;
        let failing = guard(&self.failing_urls)?.iter().any(|u| u == url);
        if failing {
            let reason = "net::ERR_CONNECTION_REFUSED".to_string();
            let _ = self.events.send(SurfaceEvent::LoadFailed {
                url: url.to_string(),
                reason: reason.clone(),
            });
            return Err(SurfaceError::Navigation {
                url: url.to_string(),
                reason,
            });
        }
        {
            let mut state = guard(&self.state)?;
            state.url = url.to_string();
            state.open = None;
            state.input.clear();
        }
        let _ = self.events.send(SurfaceEvent::ContentReady {
            url: url.to_string(),
        });
        Ok(())
    }

    async fn read_page(&self) -> Result<PageSnapshot, SurfaceError> {
        self.ensure_live()?;
        Ok(Self::render(&*guard(&self.state)?))
    }

    async fn click(&self, element: &ElementRef) -> Result<(), SurfaceError> {
        self.ensure_live()?;
        let id = element.as_str();
        if id == "send" {
            if !guard(&self.state)?.has_submit_button {
                return Err(SurfaceError::ElementNotFound(id.to_string()));
            }
            return self.submit();
        }
        if id == "nav:inbox" {
            let url = guard(&self.state)?.inbox_url.clone();
            return self.navigate(&url).await;
        }
        if let Some(index) = id.strip_prefix("thread:").and_then(|i| i.parse::<usize>().ok()) {
            let mut state = guard(&self.state)?;
            if !state.on_inbox() || index >= state.threads.len() {
                return Err(SurfaceError::ElementNotFound(id.to_string()));
            }
            if state.open != Some(index) {
                state.input.clear();
            }
            state.open = Some(index);
            state.threads[index].unread = false;
            return Ok(());
        }
        Err(SurfaceError::ElementNotFound(id.to_string()))
    }

    async fn clear_input(&self, element: &ElementRef) -> Result<(), SurfaceError> {
        self.ensure_live()?;
        if element.as_str() != "composer" {
            return Err(SurfaceError::ElementNotFound(element.0.clone()));
        }
        let mut state = guard(&self.state)?;
        if !state.input.is_empty() {
            state.input.clear();
            self.change_events.fetch_add(1, Ordering::SeqCst);
        }
        Ok(())
    }

    async fn type_char(&self, element: &ElementRef, ch: char) -> Result<(), SurfaceError> {
        self.ensure_live()?;
        if element.as_str() != "composer" {
            return Err(SurfaceError::ElementNotFound(element.0.clone()));
        }
        let mut state = guard(&self.state)?;
        if state.open.is_none() {
            return Err(SurfaceError::ElementNotFound(element.0.clone()));
        }
        state.input.push(ch);
        self.change_events.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn press_enter(&self, element: &ElementRef) -> Result<(), SurfaceError> {
        self.ensure_live()?;
        if element.as_str() != "composer" {
            return Err(SurfaceError::ElementNotFound(element.0.clone()));
        }
        self.submit()
    }

    async fn storage_get(&self, key: &str) -> Result<Option<String>, SurfaceError> {
        self.ensure_live()?;
        Ok(guard(&self.storage)?.get(key).cloned())
    }

    async fn storage_set(&self, key: &str, value: String) -> Result<(), SurfaceError> {
        self.ensure_live()?;
        guard(&self.storage)?.insert(key.to_string(), value);
        Ok(())
    }

    async fn snapshot(&self) -> Result<SurfaceSnapshot, SurfaceError> {
        self.ensure_live()?;
        let state = guard(&self.state)?.clone();
        let driver_state = serde_json::to_value(&state)
            .map_err(|e| SurfaceError::Driver(format!("failed to serialize page state: {}", e)))?;
        Ok(SurfaceSnapshot {
            url: state.url,
            storage: guard(&self.storage)?.clone(),
            driver_state,
        })
    }

    fn is_live(&self) -> bool {
        self.live.load(Ordering::SeqCst)
    }

    async fn close(&self) -> Result<(), SurfaceError> {
        self.live.store(false, Ordering::SeqCst);
        Ok(())
    }
}

/// Builds [`MemorySurface`]s and keeps them reachable for inspection
pub struct MemorySurfaceFactory {
    inbox_url: String,
    own_handle: String,
    surfaces: Mutex<HashMap<SessionId, Arc<MemorySurface>>>,
    fail_create: AtomicBool,
}

impl Default for MemorySurfaceFactory {
    fn default() -> Self {
        Self::new(DEFAULT_INBOX_URL, "me")
    }
}

impl MemorySurfaceFactory {
    pub fn new(inbox_url: impl Into<String>, own_handle: impl Into<String>) -> Self {
        Self {
            inbox_url: inbox_url.into(),
            own_handle: own_handle.into(),
            surfaces: Mutex::new(HashMap::new()),
            fail_create: AtomicBool::new(false),
        }
    }

    /// Make subsequent `create` calls fail
    pub fn set_fail_create(&self, fail: bool) {
        self.fail_create.store(fail, Ordering::SeqCst);
    }

    /// Most recent surface built for a session
    pub fn surface(&self, session_id: &SessionId) -> Option<Arc<MemorySurface>> {
        self.surfaces
            .lock()
            .ok()
            .and_then(|s| s.get(session_id).cloned())
    }

    fn keep(&self, surface: &Arc<MemorySurface>) {
        if let Ok(mut surfaces) = self.surfaces.lock() {
            surfaces.insert(surface.session_id.clone(), Arc::clone(surface));
        }
    }
}

#[async_trait]
impl SurfaceFactory for MemorySurfaceFactory {
    async fn create(
        &self,
        spec: &SurfaceSpec,
        events: SurfaceEvents,
    ) -> Result<Arc<dyn Surface>, SurfaceError> {
        if self.fail_create.load(Ordering::SeqCst) {
            return Err(SurfaceError::CreateFailed(format!(
                "could not open context for partition {}",
                spec.partition
            )));
        }
        let state = PageState {
            url: "about:blank".to_string(),
            inbox_url: self.inbox_url.clone(),
            own_handle: self.own_handle.clone(),
            has_submit_button: true,
            ..PageState::default()
        };
        let surface = Arc::new(MemorySurface::build(spec, state, HashMap::new(), events));
        self.keep(&surface);
        Ok(surface)
    }

    async fn restore(
        &self,
        spec: &SurfaceSpec,
        snapshot: SurfaceSnapshot,
        events: SurfaceEvents,
    ) -> Result<Arc<dyn Surface>, SurfaceError> {
        let mut state: PageState = serde_json::from_value(snapshot.driver_state)
            .map_err(|e| SurfaceError::CreateFailed(format!("bad snapshot: {}", e)))?;
        state.url = snapshot.url;
        let surface = Arc::new(MemorySurface::build(spec, state, snapshot.storage, events));
        self.keep(&surface);
        Ok(surface)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::{Fingerprint, Partition};
    use tokio::sync::mpsc;

    fn spec() -> SurfaceSpec {
        SurfaceSpec {
            session_id: SessionId::from("s1"),
            partition: Partition::fresh(),
            proxy: None,
            fingerprint: Fingerprint::random(),
            entry_url: DEFAULT_INBOX_URL.to_string(),
        }
    }

    async fn inbox_surface() -> (Arc<dyn Surface>, Arc<MemorySurface>, MemorySurfaceFactory) {
        let factory = MemorySurfaceFactory::default();
        let (tx, _rx) = mpsc::unbounded_channel();
        let surface = factory.create(&spec(), tx).await.unwrap();
        surface.navigate(DEFAULT_INBOX_URL).await.unwrap();
        let concrete = factory.surface(&SessionId::from("s1")).unwrap();
        (surface, concrete, factory)
    }

    #[tokio::test]
    async fn test_threads_render_only_on_inbox() {
        let (surface, concrete, _factory) = inbox_surface().await;
        concrete.push_incoming("alice", "hi");

        let page = surface.read_page().await.unwrap();
        assert_eq!(page.by_role("listitem").count(), 1);

        surface.navigate("https://chat.example.com/home").await.unwrap();
        let page = surface.read_page().await.unwrap();
        assert_eq!(page.by_role("listitem").count(), 0);
    }

    #[tokio::test]
    async fn test_typing_and_submit() {
        let (surface, concrete, _factory) = inbox_surface().await;
        concrete.push_incoming("alice", "hi");
        surface.click(&ElementRef::new("thread:0")).await.unwrap();

        for ch in "yo".chars() {
            surface.type_char(&ElementRef::new("composer"), ch).await.unwrap();
        }
        surface.click(&ElementRef::new("send")).await.unwrap();

        assert_eq!(concrete.change_events(), 2);
        assert_eq!(
            concrete.sent(),
            vec![SentMessage {
                counterpart: "alice".to_string(),
                text: "yo".to_string()
            }]
        );
    }

    #[tokio::test]
    async fn test_clear_input_drops_partial_text() {
        let (surface, concrete, _factory) = inbox_surface().await;
        concrete.push_incoming("alice", "hi");
        surface.click(&ElementRef::new("thread:0")).await.unwrap();
        let composer = ElementRef::new("composer");

        surface.type_char(&composer, 'H').await.unwrap();
        assert_eq!(concrete.pending_input(), "H");
        surface.clear_input(&composer).await.unwrap();
        assert_eq!(concrete.pending_input(), "");

        for ch in "ok".chars() {
            surface.type_char(&composer, ch).await.unwrap();
        }
        surface.press_enter(&composer).await.unwrap();
        assert_eq!(concrete.sent()[0].text, "ok");
        assert!(surface
            .clear_input(&ElementRef::new("nav:inbox"))
            .await
            .is_err());
    }

    #[tokio::test]
    async fn test_snapshot_restore_keeps_storage_and_threads() {
        let (surface, concrete, factory) = inbox_surface().await;
        concrete.push_incoming("bob", "hello");
        surface.storage_set("k", "v".to_string()).await.unwrap();

        let snapshot = surface.snapshot().await.unwrap();
        surface.close().await.unwrap();
        assert!(surface.read_page().await.is_err());

        let (tx, _rx) = mpsc::unbounded_channel();
        let restored = factory.restore(&spec(), snapshot, tx).await.unwrap();
        assert_eq!(restored.storage_get("k").await.unwrap().as_deref(), Some("v"));
        let page = restored.read_page().await.unwrap();
        assert_eq!(page.by_role("listitem").next().unwrap().text, "bob");
    }
}
