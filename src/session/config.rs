//! Per-session bot configuration
//!
//! Saved explicitly through the registry; a running agent captures a copy at
//! the start of every poll cycle and never mutates it.

use serde::{Deserialize, Serialize};

/// A keyword rule: if `pattern` occurs in an incoming message, reply with `reply`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReplyRule {
    pub pattern: String,
    pub reply: String,
    /// Display ordering hint for the settings UI. Evaluation uses list order.
    #[serde(default)]
    pub priority: i32,
    #[serde(default)]
    pub case_sensitive: bool,
}

impl ReplyRule {
    pub fn new(pattern: impl Into<String>, reply: impl Into<String>) -> Self {
        Self {
            pattern: pattern.into(),
            reply: reply.into(),
            priority: 0,
            case_sensitive: false,
        }
    }

    pub fn case_sensitive(mut self) -> Self {
        self.case_sensitive = true;
        self
    }
}

/// Inclusive millisecond range
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DelayRange {
    pub min_ms: u64,
    pub max_ms: u64,
}

impl DelayRange {
    pub const fn new(min_ms: u64, max_ms: u64) -> Self {
        Self { min_ms, max_ms }
    }

    pub const fn zero() -> Self {
        Self::new(0, 0)
    }
}

/// Human-like pacing
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimingConfig {
    /// Delay between typed characters
    pub typing_delay_ms: DelayRange,
    /// Delay between deciding to reply and starting to type
    pub pre_reply_delay_ms: DelayRange,
}

impl Default for TimingConfig {
    fn default() -> Self {
        Self {
            typing_delay_ms: DelayRange::new(50, 150),
            pre_reply_delay_ms: DelayRange::new(2_000, 6_000),
        }
    }
}

/// Reply ceilings. Zero disables a ceiling.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RateLimits {
    pub per_minute: u32,
    pub per_hour: u32,
}

impl Default for RateLimits {
    fn default() -> Self {
        Self {
            per_minute: 4,
            per_hour: 60,
        }
    }
}

/// Chat-completion settings for AI replies
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AiConfig {
    pub enabled: bool,
    /// Chat-completions endpoint, e.g. `http://localhost:11434/v1/chat/completions`
    pub endpoint: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,
    pub model: String,
    pub system_prompt: String,
    pub temperature: f32,
    pub max_tokens: u32,
    pub include_history: bool,
    pub history_depth: usize,
}

impl Default for AiConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            endpoint: "http://localhost:11434/v1/chat/completions".to_string(),
            api_key: None,
            model: "llama3.2".to_string(),
            system_prompt: "You are replying to direct messages on behalf of the account owner. \
                Keep replies short, friendly and natural. Never mention that you are automated."
                .to_string(),
            temperature: 0.7,
            max_tokens: 150,
            include_history: true,
            history_depth: 10,
        }
    }
}

/// Per-session configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionConfig {
    /// Page loaded when the surface attaches
    pub entry_url: String,
    /// Start the bot as soon as the session's surface is live
    #[serde(default)]
    pub auto_start: bool,
    /// The session's own handle on the platform, used to reject self-authored messages
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub own_handle: Option<String>,
    #[serde(default)]
    pub rules: Vec<ReplyRule>,
    #[serde(default)]
    pub timing: TimingConfig,
    #[serde(default)]
    pub limits: RateLimits,
    /// Probability in [0, 1] of deliberately not answering
    #[serde(default)]
    pub skip_probability: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ai: Option<AiConfig>,
    /// Full-scan poll interval
    pub poll_interval_ms: u64,
    /// Open-conversation monitor interval
    pub monitor_interval_ms: u64,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            entry_url: "https://www.instagram.com/direct/inbox/".to_string(),
            auto_start: false,
            own_handle: None,
            rules: Vec::new(),
            timing: TimingConfig::default(),
            limits: RateLimits::default(),
            skip_probability: 0.1,
            ai: None,
            poll_interval_ms: 8_000,
            monitor_interval_ms: 2_000,
        }
    }
}

impl SessionConfig {
    /// Clamp out-of-range values. Applied on every save.
    pub fn normalized(mut self) -> Self {
        self.skip_probability = if self.skip_probability.is_nan() {
            0.0
        } else {
            self.skip_probability.clamp(0.0, 1.0)
        };
        self.poll_interval_ms = self.poll_interval_ms.max(250);
        self.monitor_interval_ms = self.monitor_interval_ms.max(100);
        if let Some(ai) = self.ai.as_mut() {
            ai.temperature = ai.temperature.clamp(0.0, 2.0);
        }
        self
    }

    /// AI settings if present and switched on
    pub fn active_ai(&self) -> Option<&AiConfig> {
        self.ai.as_ref().filter(|ai| ai.enabled)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalized_clamps_skip_probability() {
        let mut config = SessionConfig::default();
        config.skip_probability = 3.5;
        assert_eq!(config.normalized().skip_probability, 1.0);

        let mut config = SessionConfig::default();
        config.skip_probability = -1.0;
        assert_eq!(config.normalized().skip_probability, 0.0);

        let mut config = SessionConfig::default();
        config.skip_probability = f64::NAN;
        assert_eq!(config.normalized().skip_probability, 0.0);
    }

    #[test]
    fn test_active_ai_requires_enabled() {
        let mut config = SessionConfig::default();
        assert!(config.active_ai().is_none());

        config.ai = Some(AiConfig::default());
        assert!(config.active_ai().is_none());

        if let Some(ai) = config.ai.as_mut() {
            ai.enabled = true;
        }
        assert!(config.active_ai().is_some());
    }

    #[test]
    fn test_config_deserializes_with_defaults() {
        let json = r#"{
            "entry_url": "https://example.com/messages",
            "rules": [{"pattern": "hi", "reply": "Hey!"}],
            "poll_interval_ms": 5000,
            "monitor_interval_ms": 1000
        }"#;
        let config: SessionConfig = serde_json::from_str(json).unwrap();
        assert_eq!(config.rules.len(), 1);
        assert!(!config.rules[0].case_sensitive);
        assert_eq!(config.limits, RateLimits::default());
        assert_eq!(config.skip_probability, 0.0);
    }
}
