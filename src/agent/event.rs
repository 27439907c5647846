//! Conversational events and their derived identity
//!
//! Platforms expose no stable message id, so an event's identity is a
//! fingerprint of who it came from and what it says.

use std::fmt;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::surface::ElementRef;

/// Longest text payload kept on an event, in characters
pub const MAX_EVENT_TEXT: usize = 1000;

/// SHA-256 over `(counterpart, normalized text)`, hex encoded
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EventId(String);

impl EventId {
    pub fn derive(counterpart: &str, text: &str) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(counterpart.trim().to_lowercase().as_bytes());
        // Unit separator keeps ("ab", "c") and ("a", "bc") apart
        hasher.update([0x1f]);
        hasher.update(normalize(text).as_bytes());
        Self(hex::encode(hasher.finalize()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for EventId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // Short form is plenty for logs
        f.write_str(&self.0[..self.0.len().min(12)])
    }
}

/// Collapse whitespace runs and bound the length
fn normalize(text: &str) -> String {
    let collapsed = text.split_whitespace().collect::<Vec<_>>().join(" ");
    bound(&collapsed)
}

fn bound(text: &str) -> String {
    text.chars().take(MAX_EVENT_TEXT).collect()
}

/// One detected unit of incoming activity
#[derive(Debug, Clone, PartialEq)]
pub struct ConversationalEvent {
    pub id: EventId,
    /// Whose conversation this event belongs to
    pub counterpart: String,
    /// Handle shown on the message
    pub author: String,
    pub text: String,
    /// The message element on the page
    pub element: ElementRef,
    /// Authored by the session's own identity
    pub from_self: bool,
}

impl ConversationalEvent {
    pub fn new(
        counterpart: impl Into<String>,
        author: impl Into<String>,
        text: &str,
        element: ElementRef,
        from_self: bool,
    ) -> Self {
        let counterpart = counterpart.into();
        let text = bound(text.trim());
        Self {
            id: EventId::derive(&counterpart, &text),
            counterpart,
            author: author.into(),
            text,
            element,
            from_self,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_same_counterpart_and_text_same_id() {
        assert_eq!(
            EventId::derive("alice", "hi there"),
            EventId::derive("alice", "hi   there ")
        );
    }

    #[test]
    fn test_same_text_different_counterpart_differs() {
        assert_ne!(EventId::derive("alice", "hi"), EventId::derive("bob", "hi"));
    }

    #[test]
    fn test_separator_prevents_concatenation_collision() {
        assert_ne!(EventId::derive("ab", "c"), EventId::derive("a", "bc"));
    }

    #[test]
    fn test_text_is_bounded() {
        let long = "x".repeat(MAX_EVENT_TEXT * 2);
        let event = ConversationalEvent::new("alice", "alice", &long, ElementRef::new("m"), false);
        assert_eq!(event.text.chars().count(), MAX_EVENT_TEXT);
        assert_eq!(event.id.as_str().len(), 64);
    }
}
