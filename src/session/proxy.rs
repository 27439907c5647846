//! Proxy pool
//!
//! Importing and displaying proxies belongs to the settings UI; this is the
//! in-process pool that sessions bind to and the UI reads/writes.

use std::collections::HashMap;
use std::sync::RwLock;

use serde::{Deserialize, Serialize};

/// A proxy a session's surface egresses through
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProxyRef {
    pub id: String,
    pub host: String,
    pub port: u16,
}

impl ProxyRef {
    /// `host:port` form used by surface drivers
    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

/// Last known connectivity of a proxy
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProxyStatus {
    Unknown,
    Online,
    Offline,
}

/// A pool entry with its status
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProxyEntry {
    #[serde(flatten)]
    pub proxy: ProxyRef,
    pub status: ProxyStatus,
}

/// Shared proxy pool
#[derive(Debug, Default)]
pub struct ProxyPool {
    entries: RwLock<Vec<ProxyEntry>>,
}

impl ProxyPool {
    pub fn new() -> Self {
        Self::default()
    }

    /// All entries in insertion order
    pub fn list(&self) -> Vec<ProxyEntry> {
        self.entries
            .read()
            .map(|entries| entries.clone())
            .unwrap_or_default()
    }

    /// Replace the whole pool, keeping known statuses for ids that survive
    pub fn replace(&self, proxies: Vec<ProxyRef>) {
        let Ok(mut entries) = self.entries.write() else {
            return;
        };
        let previous: HashMap<String, ProxyStatus> = entries
            .iter()
            .map(|e| (e.proxy.id.clone(), e.status))
            .collect();
        *entries = proxies
            .into_iter()
            .map(|proxy| {
                let status = previous
                    .get(&proxy.id)
                    .copied()
                    .unwrap_or(ProxyStatus::Unknown);
                ProxyEntry { proxy, status }
            })
            .collect();
    }

    pub fn get(&self, id: &str) -> Option<ProxyRef> {
        self.entries.read().ok().and_then(|entries| {
            entries
                .iter()
                .find(|e| e.proxy.id == id)
                .map(|e| e.proxy.clone())
        })
    }

    /// Record a connectivity probe result. Returns false for an unknown id.
    pub fn set_status(&self, id: &str, status: ProxyStatus) -> bool {
        let Ok(mut entries) = self.entries.write() else {
            return false;
        };
        match entries.iter_mut().find(|e| e.proxy.id == id) {
            Some(entry) => {
                entry.status = status;
                true
            }
            None => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn proxy(id: &str) -> ProxyRef {
        ProxyRef {
            id: id.to_string(),
            host: "10.0.0.1".to_string(),
            port: 8080,
        }
    }

    #[test]
    fn test_replace_keeps_status() {
        let pool = ProxyPool::new();
        pool.replace(vec![proxy("a"), proxy("b")]);
        assert!(pool.set_status("a", ProxyStatus::Online));

        pool.replace(vec![proxy("a"), proxy("c")]);
        let entries = pool.list();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].status, ProxyStatus::Online);
        assert_eq!(entries[1].status, ProxyStatus::Unknown);
        assert!(pool.get("b").is_none());
    }

    #[test]
    fn test_address() {
        assert_eq!(proxy("a").address(), "10.0.0.1:8080");
    }
}
