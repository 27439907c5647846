//! Per-session activity log
//!
//! Every agent action lands here. Each session gets a ring buffer of the
//! last [`LOG_CAPACITY`] entries; the UI views one session at a time and
//! receives live entries for that session only.
//!
//! ```text
//! Agent A ──record──► [ring A] ─┐
//! Agent B ──record──► [ring B] ─┼─► broadcast ──filter(viewed)──► UI
//! Registry ─global──► [ring *] ─┘
//! ```

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, RwLock};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

use crate::session::SessionId;

/// Entries kept per session
pub const LOG_CAPACITY: usize = 100;

/// Severity shown in the UI
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Info,
    Success,
    Error,
    Highlight,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogEntry {
    pub message: String,
    pub severity: Severity,
    pub timestamp: DateTime<Utc>,
}

/// An entry tagged with its owning session, as sent to live subscribers
#[derive(Debug, Clone)]
pub struct TaggedEntry {
    pub session_id: SessionId,
    pub entry: LogEntry,
}

/// Shared log store for every session on this process
pub struct LogAggregator {
    buffers: Mutex<HashMap<SessionId, VecDeque<LogEntry>>>,
    viewed: Arc<RwLock<Option<SessionId>>>,
    live: broadcast::Sender<TaggedEntry>,
}

impl Default for LogAggregator {
    fn default() -> Self {
        Self::new()
    }
}

impl LogAggregator {
    pub fn new() -> Self {
        let (live, _) = broadcast::channel(256);
        Self {
            buffers: Mutex::new(HashMap::new()),
            viewed: Arc::new(RwLock::new(None)),
            live,
        }
    }

    /// Append an entry to a session's ring, evicting the oldest at capacity
    pub fn record(&self, session_id: &SessionId, message: impl Into<String>, severity: Severity) {
        let entry = LogEntry {
            message: message.into(),
            severity,
            timestamp: Utc::now(),
        };

        match severity {
            Severity::Error => {
                tracing::warn!(session_id = %session_id, "{}", entry.message)
            }
            _ => tracing::info!(session_id = %session_id, ?severity, "{}", entry.message),
        }

        if let Ok(mut buffers) = self.buffers.lock() {
            let ring = buffers
                .entry(session_id.clone())
                .or_insert_with(|| VecDeque::with_capacity(LOG_CAPACITY));
            if ring.len() == LOG_CAPACITY {
                ring.pop_front();
            }
            ring.push_back(entry.clone());
        }

        // No subscribers is fine
        let _ = self.live.send(TaggedEntry {
            session_id: session_id.clone(),
            entry,
        });
    }

    pub fn info(&self, session_id: &SessionId, message: impl Into<String>) {
        self.record(session_id, message, Severity::Info);
    }

    pub fn success(&self, session_id: &SessionId, message: impl Into<String>) {
        self.record(session_id, message, Severity::Success);
    }

    pub fn error(&self, session_id: &SessionId, message: impl Into<String>) {
        self.record(session_id, message, Severity::Error);
    }

    pub fn highlight(&self, session_id: &SessionId, message: impl Into<String>) {
        self.record(session_id, message, Severity::Highlight);
    }

    /// Record an event that has no single owning session
    pub fn global(&self, message: impl Into<String>, severity: Severity) {
        self.record(&SessionId::global(), message, severity);
    }

    /// Snapshot of a session's buffer, oldest first
    pub fn entries(&self, session_id: &SessionId) -> Vec<LogEntry> {
        self.buffers
            .lock()
            .ok()
            .and_then(|buffers| buffers.get(session_id).map(|r| r.iter().cloned().collect()))
            .unwrap_or_default()
    }

    /// Select which session the UI is looking at and return its buffer for re-render
    pub fn switch_view(&self, session_id: &SessionId) -> Vec<LogEntry> {
        if let Ok(mut viewed) = self.viewed.write() {
            *viewed = Some(session_id.clone());
        }
        self.entries(session_id)
    }

    pub fn viewed(&self) -> Option<SessionId> {
        self.viewed.read().ok().and_then(|v| v.clone())
    }

    /// Live entries for whichever session is viewed at the time each entry arrives
    pub fn subscribe_viewed(&self) -> ViewedLogStream {
        ViewedLogStream {
            rx: self.live.subscribe(),
            viewed: Arc::clone(&self.viewed),
        }
    }

    /// Drop a deleted session's buffer
    pub fn forget(&self, session_id: &SessionId) {
        if let Ok(mut buffers) = self.buffers.lock() {
            buffers.remove(session_id);
        }
    }
}

/// Receiver that only yields entries for the currently viewed session
pub struct ViewedLogStream {
    rx: broadcast::Receiver<TaggedEntry>,
    viewed: Arc<RwLock<Option<SessionId>>>,
}

impl ViewedLogStream {
    /// Next entry for the viewed session; `None` once the aggregator is gone
    pub async fn next(&mut self) -> Option<TaggedEntry> {
        loop {
            match self.rx.recv().await {
                Ok(tagged) => {
                    let is_viewed = self
                        .viewed
                        .read()
                        .map(|v| v.as_ref() == Some(&tagged.session_id))
                        .unwrap_or(false);
                    if is_viewed {
                        return Some(tagged);
                    }
                }
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    tracing::debug!(skipped, "log view lagged");
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ring_evicts_oldest() {
        let logs = LogAggregator::new();
        let id = SessionId::from("s1");
        for i in 0..(LOG_CAPACITY + 5) {
            logs.info(&id, format!("entry {}", i));
        }
        let entries = logs.entries(&id);
        assert_eq!(entries.len(), LOG_CAPACITY);
        assert_eq!(entries[0].message, "entry 5");
        assert_eq!(entries[LOG_CAPACITY - 1].message, format!("entry {}", LOG_CAPACITY + 4));
    }

    #[test]
    fn test_eviction_ignores_severity() {
        let logs = LogAggregator::new();
        let id = SessionId::from("s1");
        logs.error(&id, "important");
        for _ in 0..LOG_CAPACITY {
            logs.info(&id, "noise");
        }
        assert!(logs.entries(&id).iter().all(|e| e.message == "noise"));
    }

    #[test]
    fn test_sessions_are_isolated() {
        let logs = LogAggregator::new();
        logs.info(&SessionId::from("a"), "for a");
        logs.success(&SessionId::from("b"), "for b");
        logs.global("boot", Severity::Highlight);

        assert_eq!(logs.entries(&SessionId::from("a")).len(), 1);
        assert_eq!(logs.entries(&SessionId::from("b"))[0].severity, Severity::Success);
        assert_eq!(logs.entries(&SessionId::global())[0].message, "boot");
    }

    #[test]
    fn test_switch_view_does_not_mutate() {
        let logs = LogAggregator::new();
        let a = SessionId::from("a");
        logs.info(&a, "one");
        logs.info(&a, "two");

        let first = logs.switch_view(&a);
        let second = logs.switch_view(&a);
        assert_eq!(first, second);
        assert_eq!(logs.viewed(), Some(a));
    }

    #[tokio::test]
    async fn test_subscribe_viewed_filters() {
        let logs = LogAggregator::new();
        let a = SessionId::from("a");
        let b = SessionId::from("b");
        logs.switch_view(&b);

        let mut stream = logs.subscribe_viewed();
        logs.info(&a, "hidden");
        logs.info(&b, "shown");

        let tagged = stream.next().await.unwrap();
        assert_eq!(tagged.session_id, b);
        assert_eq!(tagged.entry.message, "shown");
    }

    #[test]
    fn test_forget() {
        let logs = LogAggregator::new();
        let a = SessionId::from("a");
        logs.info(&a, "x");
        logs.forget(&a);
        assert!(logs.entries(&a).is_empty());
    }
}
