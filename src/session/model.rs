//! Session identity and lifecycle records
//!
//! A `Session` is the authoritative record for one isolated automated
//! identity. Only the registry writes these records; everything else reads
//! clones.

use std::fmt;

use chrono::{DateTime, Utc};
use rand::seq::SliceRandom;
use serde::{Deserialize, Serialize};

use super::config::SessionConfig;
use super::proxy::ProxyRef;

/// Opaque session identifier
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SessionId(String);

impl SessionId {
    /// Synthetic id for log entries with no single owning session
    pub const GLOBAL: &'static str = "global";

    /// Generate a fresh, time-sortable id
    pub fn generate() -> Self {
        Self(format!("session-{}", uuid::Uuid::now_v7()))
    }

    pub fn global() -> Self {
        Self(Self::GLOBAL.to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for SessionId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for SessionId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Storage partition key. Cookies and storage never cross partitions.
///
/// Assigned once at creation; there is deliberately no setter.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Partition(String);

impl Partition {
    pub fn fresh() -> Self {
        Self(format!("persist:session-{}", uuid::Uuid::now_v7()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Partition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

const USER_AGENTS: &[&str] = &[
    "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/124.0.0.0 Safari/537.36",
    "Mozilla/5.0 (Macintosh; Intel Mac OS X 10_15_7) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/124.0.0.0 Safari/537.36",
    "Mozilla/5.0 (X11; Linux x86_64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/123.0.0.0 Safari/537.36",
    "Mozilla/5.0 (Macintosh; Intel Mac OS X 14_4) AppleWebKit/605.1.15 (KHTML, like Gecko) Version/17.4 Safari/605.1.15",
    "Mozilla/5.0 (Windows NT 10.0; Win64; x64; rv:125.0) Gecko/20100101 Firefox/125.0",
];

/// Outbound client signature presented by a session's surface
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Fingerprint {
    pub user_agent: String,
}

impl Fingerprint {
    /// Pick a signature from the built-in pool
    pub fn random() -> Self {
        let user_agent = USER_AGENTS
            .choose(&mut rand::thread_rng())
            .copied()
            .unwrap_or(USER_AGENTS[0]);
        Self {
            user_agent: user_agent.to_string(),
        }
    }
}

/// Lifecycle state of a session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    /// Surface is live on the local host
    Active,
    /// Record exists but no surface is attached (never attached, or attach failed)
    Inactive,
    /// Surface torn down, identity and config retained
    Hibernated,
    /// Surface owned by a separate execution host
    Detached,
}

/// Whether the user asked for the bot to run in this session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BotStatus {
    Active,
    Inactive,
}

impl fmt::Display for BotStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BotStatus::Active => f.write_str("active"),
            BotStatus::Inactive => f.write_str("inactive"),
        }
    }
}

/// The authoritative session record
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Session {
    pub id: SessionId,
    pub name: String,
    pub partition: Partition,
    /// Network egress binding, `None` means direct
    pub proxy: Option<ProxyRef>,
    pub fingerprint: Fingerprint,
    /// `None` falls back to the process-wide default config
    pub config: Option<SessionConfig>,
    pub state: SessionState,
    pub bot_status: BotStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Session {
    /// Create a new, not-yet-attached session record
    pub fn new(
        name: impl Into<String>,
        proxy: Option<ProxyRef>,
        config: Option<SessionConfig>,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: SessionId::generate(),
            name: name.into(),
            partition: Partition::fresh(),
            proxy,
            fingerprint: Fingerprint::random(),
            config,
            state: SessionState::Inactive,
            bot_status: BotStatus::Inactive,
            created_at: now,
            updated_at: now,
        }
    }

    /// Clone this session under a new id and a fresh partition
    ///
    /// Config is deep-cloned; the surface, bot status and lifecycle state are not.
    pub fn duplicate(&self) -> Self {
        let mut copy = Session::new(
            format!("{} (copy)", self.name),
            self.proxy.clone(),
            self.config.clone(),
        );
        copy.fingerprint = self.fingerprint.clone();
        copy
    }

    /// Config in effect, falling back to `default`
    pub fn effective_config(&self, default: &SessionConfig) -> SessionConfig {
        self.config.clone().unwrap_or_else(|| default.clone())
    }

    pub fn touch(&mut self) {
        self.updated_at = Utc::now();
    }
}

/// Summary of a session for listing
#[derive(Debug, Clone, Serialize)]
pub struct SessionSummary {
    pub id: SessionId,
    pub name: String,
    pub state: SessionState,
    pub bot_status: BotStatus,
    pub proxy: Option<String>,
}

impl From<&Session> for SessionSummary {
    fn from(session: &Session) -> Self {
        Self {
            id: session.id.clone(),
            name: session.name.clone(),
            state: session.state,
            bot_status: session.bot_status,
            proxy: session.proxy.as_ref().map(|p| p.id.clone()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_session_creation() {
        let session = Session::new("Main", None, None);
        assert!(session.id.as_str().starts_with("session-"));
        assert!(session.partition.as_str().starts_with("persist:session-"));
        assert_eq!(session.state, SessionState::Inactive);
        assert_eq!(session.bot_status, BotStatus::Inactive);
        assert!(!session.fingerprint.user_agent.is_empty());
    }

    #[test]
    fn test_duplicate_gets_fresh_partition() {
        let mut config = SessionConfig::default();
        config.entry_url = "https://example.com/inbox".to_string();
        let original = Session::new("Main", None, Some(config));
        let copy = original.duplicate();

        assert_ne!(copy.id, original.id);
        assert_ne!(copy.partition, original.partition);
        assert_eq!(copy.name, "Main (copy)");
        assert_eq!(
            copy.config.as_ref().map(|c| c.entry_url.as_str()),
            Some("https://example.com/inbox")
        );
    }

    #[test]
    fn test_effective_config_falls_back() {
        let session = Session::new("Main", None, None);
        let mut default = SessionConfig::default();
        default.skip_probability = 0.25;
        assert_eq!(session.effective_config(&default).skip_probability, 0.25);
    }
}
