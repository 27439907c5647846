//! Host process settings
//!
//! Resolution order: built-in defaults, then an optional JSON file, then
//! `CHATVISOR_*` environment variables. Per-session behaviour lives in
//! [`SessionConfig`](crate::session::SessionConfig), not here.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::bridge::host::{DEFAULT_CALL_TIMEOUT, DEFAULT_POLL_INTERVAL};

#[derive(Debug, thiserror::Error)]
pub enum SettingsError {
    #[error("failed to read settings file {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("settings file {path} is malformed: {source}")]
    Parse {
        path: PathBuf,
        source: serde_json::Error,
    },
    #[error("environment variable {name} has invalid value {value:?}")]
    Env { name: &'static str, value: String },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HostSettings {
    /// Session records are kept under `<state_dir>/sessions`
    pub state_dir: PathBuf,
    /// Chat-completions URL used when a session's AI config leaves it empty
    pub ai_endpoint: String,
    pub bridge_poll_interval_ms: u64,
    pub bridge_timeout_ms: u64,
    /// `None` disables trace export
    pub otlp_endpoint: Option<String>,
    pub json_logs: bool,
}

impl Default for HostSettings {
    fn default() -> Self {
        let home = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
        Self {
            state_dir: PathBuf::from(home).join(".chatvisor"),
            ai_endpoint: "http://localhost:11434/v1/chat/completions".to_string(),
            bridge_poll_interval_ms: DEFAULT_POLL_INTERVAL.as_millis() as u64,
            bridge_timeout_ms: DEFAULT_CALL_TIMEOUT.as_millis() as u64,
            otlp_endpoint: None,
            json_logs: false,
        }
    }
}

impl HostSettings {
    /// Load from a JSON file; missing keys keep their defaults
    pub fn load(path: impl AsRef<Path>) -> Result<Self, SettingsError> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path).map_err(|source| SettingsError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        serde_json::from_str(&raw).map_err(|source| SettingsError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Override from `CHATVISOR_*` variables
    pub fn apply_env(self) -> Result<Self, SettingsError> {
        self.apply_vars(|name| std::env::var(name).ok())
    }

    fn apply_vars(
        mut self,
        lookup: impl Fn(&str) -> Option<String>,
    ) -> Result<Self, SettingsError> {
        if let Some(dir) = lookup("CHATVISOR_STATE_DIR") {
            self.state_dir = PathBuf::from(dir);
        }
        if let Some(endpoint) = lookup("CHATVISOR_AI_ENDPOINT") {
            self.ai_endpoint = endpoint;
        }
        if let Some(value) = lookup("CHATVISOR_BRIDGE_POLL_MS") {
            self.bridge_poll_interval_ms = parse_u64("CHATVISOR_BRIDGE_POLL_MS", value)?;
        }
        if let Some(value) = lookup("CHATVISOR_BRIDGE_TIMEOUT_MS") {
            self.bridge_timeout_ms = parse_u64("CHATVISOR_BRIDGE_TIMEOUT_MS", value)?;
        }
        if let Some(endpoint) = lookup("CHATVISOR_OTLP_ENDPOINT") {
            self.otlp_endpoint = (!endpoint.is_empty()).then_some(endpoint);
        }
        if let Some(value) = lookup("CHATVISOR_JSON_LOGS") {
            self.json_logs = match value.to_ascii_lowercase().as_str() {
                "1" | "true" | "yes" => true,
                "0" | "false" | "no" | "" => false,
                _ => {
                    return Err(SettingsError::Env {
                        name: "CHATVISOR_JSON_LOGS",
                        value,
                    })
                }
            };
        }
        Ok(self)
    }

    pub fn sessions_dir(&self) -> PathBuf {
        self.state_dir.join("sessions")
    }

    pub fn bridge_poll_interval(&self) -> Duration {
        Duration::from_millis(self.bridge_poll_interval_ms.max(10))
    }

    pub fn bridge_timeout(&self) -> Duration {
        Duration::from_millis(self.bridge_timeout_ms.max(100))
    }
}

fn parse_u64(name: &'static str, value: String) -> Result<u64, SettingsError> {
    value
        .trim()
        .parse()
        .map_err(|_| SettingsError::Env { name, value })
}
