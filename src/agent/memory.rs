//! Per-counterpart exchange history
//!
//! Stored in the surface's partition-scoped storage, one key per
//! counterpart, so it travels with the surface on detach and never leaks
//! into another session. The last decided event per counterpart is kept
//! alongside, so a fresh agent on the same surface does not decide it again.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::controller::AgentError;
use super::event::EventId;
use crate::surface::Surface;

/// Most recent entries kept per counterpart
pub const MEMORY_CAPACITY: usize = 100;

const KEY_PREFIX: &str = "chatvisor.memory.";
const HANDLED_PREFIX: &str = "chatvisor.handled.";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Direction {
    Theirs,
    Mine,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MemoryEntry {
    pub direction: Direction,
    pub text: String,
    pub timestamp: DateTime<Utc>,
}

pub struct AgentMemory {
    surface: Arc<dyn Surface>,
}

impl AgentMemory {
    pub fn new(surface: Arc<dyn Surface>) -> Self {
        Self { surface }
    }

    fn key(counterpart: &str) -> String {
        format!("{}{}", KEY_PREFIX, counterpart)
    }

    /// All stored entries for `counterpart`, oldest first
    pub async fn entries(&self, counterpart: &str) -> Result<Vec<MemoryEntry>, AgentError> {
        match self.surface.storage_get(&Self::key(counterpart)).await? {
            Some(raw) => Ok(serde_json::from_str(&raw)?),
            None => Ok(Vec::new()),
        }
    }

    pub async fn append(
        &self,
        counterpart: &str,
        direction: Direction,
        text: &str,
    ) -> Result<(), AgentError> {
        let mut entries = self.entries(counterpart).await?;
        entries.push(MemoryEntry {
            direction,
            text: text.to_string(),
            timestamp: Utc::now(),
        });
        if entries.len() > MEMORY_CAPACITY {
            let excess = entries.len() - MEMORY_CAPACITY;
            entries.drain(..excess);
        }
        let raw = serde_json::to_string(&entries)?;
        self.surface
            .storage_set(&Self::key(counterpart), raw)
            .await?;
        Ok(())
    }

    /// The `depth` most recent entries, oldest first
    pub async fn history(
        &self,
        counterpart: &str,
        depth: usize,
    ) -> Result<Vec<MemoryEntry>, AgentError> {
        let entries = self.entries(counterpart).await?;
        let skip = entries.len().saturating_sub(depth);
        Ok(entries.into_iter().skip(skip).collect())
    }

    /// Remember that the event was decided, whatever the decision was
    pub async fn record_handled(
        &self,
        counterpart: &str,
        id: &EventId,
    ) -> Result<(), AgentError> {
        let raw = serde_json::to_string(id)?;
        self.surface
            .storage_set(&format!("{}{}", HANDLED_PREFIX, counterpart), raw)
            .await?;
        Ok(())
    }

    pub async fn last_handled(&self, counterpart: &str) -> Result<Option<EventId>, AgentError> {
        let key = format!("{}{}", HANDLED_PREFIX, counterpart);
        match self.surface.storage_get(&key).await? {
            Some(raw) => Ok(Some(serde_json::from_str(&raw)?)),
            None => Ok(None),
        }
    }

    pub async fn last_incoming(&self, counterpart: &str) -> Result<Option<String>, AgentError> {
        Ok(self
            .entries(counterpart)
            .await?
            .into_iter()
            .rev()
            .find(|e| e.direction == Direction::Theirs)
            .map(|e| e.text))
    }
}
