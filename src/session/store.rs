//! Session persistence
//!
//! The registry owns lifecycle; the store only keeps records. Backends
//! implement the four primitive operations and inherit the rest.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tokio::sync::RwLock;

use super::config::SessionConfig;
use super::model::{Session, SessionId, SessionState};
use super::proxy::ProxyRef;

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("session storage I/O failed: {0}")]
    Io(#[from] std::io::Error),
    #[error("session record is malformed: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("invalid session id: {0}")]
    InvalidId(String),
}

/// Persistence collaborator for session records
///
/// Every operation on a missing id returns `Ok(None)` / `Ok(false)`.
#[async_trait]
pub trait SessionStore: Send + Sync {
    /// All sessions, oldest first
    async fn get_all_sessions(&self) -> Result<Vec<Session>, StoreError>;

    async fn get_session(&self, id: &SessionId) -> Result<Option<Session>, StoreError>;

    /// Insert or overwrite a record
    async fn save_session(&self, session: &Session) -> Result<(), StoreError>;

    async fn delete_session(&self, id: &SessionId) -> Result<bool, StoreError>;

    async fn create_session(
        &self,
        name: &str,
        proxy: Option<ProxyRef>,
        config_seed: Option<SessionConfig>,
    ) -> Result<Session, StoreError> {
        let session = Session::new(name, proxy, config_seed.map(SessionConfig::normalized));
        self.save_session(&session).await?;
        Ok(session)
    }

    async fn update_session_config(
        &self,
        id: &SessionId,
        config: SessionConfig,
    ) -> Result<Option<Session>, StoreError> {
        self.modify(id, Box::new(move |s| s.config = Some(config.normalized())))
            .await
    }

    async fn rename_session(
        &self,
        id: &SessionId,
        name: &str,
    ) -> Result<Option<Session>, StoreError> {
        let name = name.to_string();
        self.modify(id, Box::new(move |s| s.name = name)).await
    }

    /// Store a copy under a new id with a fresh partition
    async fn duplicate_session(&self, id: &SessionId) -> Result<Option<Session>, StoreError> {
        let Some(original) = self.get_session(id).await? else {
            return Ok(None);
        };
        let copy = original.duplicate();
        self.save_session(&copy).await?;
        Ok(Some(copy))
    }

    async fn hibernate_session(&self, id: &SessionId) -> Result<Option<Session>, StoreError> {
        self.modify(id, Box::new(|s| s.state = SessionState::Hibernated))
            .await
    }

    /// Load, apply `f`, touch, save
    async fn modify(
        &self,
        id: &SessionId,
        f: Box<dyn for<'s> FnOnce(&'s mut Session) + Send>,
    ) -> Result<Option<Session>, StoreError> {
        let Some(mut session) = self.get_session(id).await? else {
            return Ok(None);
        };
        f(&mut session);
        session.touch();
        self.save_session(&session).await?;
        Ok(Some(session))
    }
}

/// Volatile store for tests and throwaway runs
#[derive(Default)]
pub struct MemorySessionStore {
    sessions: RwLock<HashMap<SessionId, Session>>,
}

impl MemorySessionStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl SessionStore for MemorySessionStore {
    async fn get_all_sessions(&self) -> Result<Vec<Session>, StoreError> {
        let mut all: Vec<Session> = self.sessions.read().await.values().cloned().collect();
        all.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        Ok(all)
    }

    async fn get_session(&self, id: &SessionId) -> Result<Option<Session>, StoreError> {
        Ok(self.sessions.read().await.get(id).cloned())
    }

    async fn save_session(&self, session: &Session) -> Result<(), StoreError> {
        self.sessions
            .write()
            .await
            .insert(session.id.clone(), session.clone());
        Ok(())
    }

    async fn delete_session(&self, id: &SessionId) -> Result<bool, StoreError> {
        Ok(self.sessions.write().await.remove(id).is_some())
    }
}

/// One pretty-printed JSON file per session
pub struct JsonSessionStore {
    /// Base directory for session files
    base_dir: PathBuf,
}

impl JsonSessionStore {
    /// Create a store rooted at `base_dir`, creating the directory
    pub fn new(base_dir: impl Into<PathBuf>) -> std::io::Result<Self> {
        let base_dir = base_dir.into();
        std::fs::create_dir_all(&base_dir)?;
        Ok(Self { base_dir })
    }

    /// Store under ~/.chatvisor/sessions
    pub fn default_store() -> std::io::Result<Self> {
        let home = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
        Self::new(PathBuf::from(home).join(".chatvisor").join("sessions"))
    }

    pub fn base_dir(&self) -> &Path {
        &self.base_dir
    }

    /// Get the file path for a session
    fn session_path(&self, id: &SessionId) -> Result<PathBuf, StoreError> {
        let raw = id.as_str();
        let safe = !raw.is_empty()
            && raw
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_');
        if !safe {
            return Err(StoreError::InvalidId(raw.to_string()));
        }
        Ok(self.base_dir.join(format!("{}.json", raw)))
    }

    async fn load_from_path(path: &Path) -> Result<Session, StoreError> {
        let json = tokio::fs::read_to_string(path).await?;
        Ok(serde_json::from_str(&json)?)
    }
}

#[async_trait]
impl SessionStore for JsonSessionStore {
    async fn get_all_sessions(&self) -> Result<Vec<Session>, StoreError> {
        let mut sessions = Vec::new();
        let mut entries = tokio::fs::read_dir(&self.base_dir).await?;
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().map(|e| e == "json").unwrap_or(false) {
                match Self::load_from_path(&path).await {
                    Ok(session) => sessions.push(session),
                    Err(e) => {
                        tracing::warn!(path = %path.display(), error = %e, "skipping unreadable session file")
                    }
                }
            }
        }
        sessions.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        Ok(sessions)
    }

    async fn get_session(&self, id: &SessionId) -> Result<Option<Session>, StoreError> {
        let path = self.session_path(id)?;
        match Self::load_from_path(&path).await {
            Ok(session) => Ok(Some(session)),
            Err(StoreError::Io(e)) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e),
        }
    }

    async fn save_session(&self, session: &Session) -> Result<(), StoreError> {
        let path = self.session_path(&session.id)?;
        let json = serde_json::to_string_pretty(session)?;
        // Atomic replace
        let tmp = path.with_extension("json.tmp");
        tokio::fs::write(&tmp, json).await?;
        tokio::fs::rename(&tmp, &path).await?;
        Ok(())
    }

    async fn delete_session(&self, id: &SessionId) -> Result<bool, StoreError> {
        let path = self.session_path(id)?;
        match tokio::fs::remove_file(path).await {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::ReplyRule;

    #[tokio::test]
    async fn test_memory_store_crud() {
        let store = MemorySessionStore::new();
        let created = store.create_session("Main", None, None).await.unwrap();

        let renamed = store
            .rename_session(&created.id, "Renamed")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(renamed.name, "Renamed");
        assert_eq!(renamed.partition, created.partition);

        assert!(store.delete_session(&created.id).await.unwrap());
        assert!(!store.delete_session(&created.id).await.unwrap());
        assert!(store.get_session(&created.id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_modify_applies_closure_and_saves() {
        let store = MemorySessionStore::new();
        let created = store.create_session("Main", None, None).await.unwrap();

        let modified = store
            .modify(&created.id, Box::new(|s| s.name = "Edited".to_string()))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(modified.name, "Edited");
        assert!(modified.updated_at >= created.updated_at);

        let stored = store.get_session(&created.id).await.unwrap().unwrap();
        assert_eq!(stored.name, "Edited");
        assert_eq!(stored.partition, created.partition);
    }

    #[tokio::test]
    async fn test_missing_id_is_noop() {
        let store = MemorySessionStore::new();
        let missing = SessionId::from("session-missing");
        assert!(store.rename_session(&missing, "x").await.unwrap().is_none());
        assert!(store.hibernate_session(&missing).await.unwrap().is_none());
        assert!(store.duplicate_session(&missing).await.unwrap().is_none());
        assert!(store
            .update_session_config(&missing, SessionConfig::default())
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn test_update_config_is_normalized() {
        let store = MemorySessionStore::new();
        let created = store.create_session("Main", None, None).await.unwrap();
        let mut config = SessionConfig::default();
        config.skip_probability = 7.0;
        let updated = store
            .update_session_config(&created.id, config)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(updated.config.unwrap().skip_probability, 1.0);
    }

    #[tokio::test]
    async fn test_json_store_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let store = JsonSessionStore::new(dir.path()).unwrap();

        let mut config = SessionConfig::default();
        config.rules.push(ReplyRule::new("hi", "Hey!"));
        let created = store
            .create_session("Main", None, Some(config.clone()))
            .await
            .unwrap();

        let copy = store.duplicate_session(&created.id).await.unwrap().unwrap();
        assert_ne!(copy.id, created.id);
        assert_ne!(copy.partition, created.partition);
        assert_eq!(copy.config, Some(config));

        let all = store.get_all_sessions().await.unwrap();
        assert_eq!(all.len(), 2);
        assert_eq!(all[0].id, created.id);

        let hibernated = store.hibernate_session(&created.id).await.unwrap().unwrap();
        assert_eq!(hibernated.state, SessionState::Hibernated);
        let reloaded = store.get_session(&created.id).await.unwrap().unwrap();
        assert_eq!(reloaded.state, SessionState::Hibernated);
    }

    #[tokio::test]
    async fn test_json_store_rejects_path_ids() {
        let dir = tempfile::tempdir().unwrap();
        let store = JsonSessionStore::new(dir.path()).unwrap();
        let result = store.get_session(&SessionId::from("../etc/passwd")).await;
        assert!(matches!(result, Err(StoreError::InvalidId(_))));
    }

    #[tokio::test]
    async fn test_json_store_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        let store = JsonSessionStore::new(dir.path()).unwrap();
        let missing = SessionId::from("session-nope");
        assert!(store.get_session(&missing).await.unwrap().is_none());
        assert!(!store.delete_session(&missing).await.unwrap());
    }
}
