//! Chat-completion client
//!
//! Speaks the OpenAI-style `/chat/completions` contract, which Ollama,
//! llama.cpp and hosted providers all accept:
//!
//! ```text
//! POST {endpoint}
//! { "model", "messages": [{role, content}], "temperature", "max_tokens" }
//!   → { "choices": [ { "message": { "content": "..." } } ] }
//! ```

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::session::AiConfig;

/// A message in a chat conversation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: String, // "system", "user", "assistant"
    pub content: String,
}

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: "system".to_string(),
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: "user".to_string(),
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: "assistant".to_string(),
            content: content.into(),
        }
    }
}

/// Why an AI call produced no reply
///
/// The agent treats every variant the same way: no AI reply this time.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum BridgeError {
    #[error("request timed out")]
    Timeout,
    #[error("transport failure: {0}")]
    Transport(String),
    #[error("endpoint returned status {0}")]
    Status(u16),
    #[error("response had no content")]
    EmptyContent,
}

impl BridgeError {
    /// Metric label
    pub fn outcome(&self) -> &'static str {
        match self {
            BridgeError::Timeout => "timeout",
            BridgeError::Transport(_) => "transport",
            BridgeError::Status(_) => "status",
            BridgeError::EmptyContent => "empty",
        }
    }
}

/// Anything that can turn a conversation into a reply
#[async_trait]
pub trait ChatBackend: Send + Sync {
    async fn complete(
        &self,
        messages: &[ChatMessage],
        config: &AiConfig,
        timeout: Duration,
    ) -> Result<String, BridgeError>;
}

#[derive(Debug, Serialize)]
struct CompletionRequest<'a> {
    model: &'a str,
    messages: &'a [ChatMessage],
    temperature: f32,
    max_tokens: u32,
}

#[derive(Debug, Deserialize)]
struct CompletionResponse {
    #[serde(default)]
    choices: Vec<Choice>,
}

#[derive(Debug, Deserialize)]
struct Choice {
    message: ChoiceMessage,
}

#[derive(Debug, Deserialize)]
struct ChoiceMessage {
    #[serde(default)]
    content: Option<String>,
}

/// HTTP client for chat-completion endpoints
#[derive(Clone)]
pub struct OpenAiChatClient {
    client: reqwest::Client,
    /// Used when a session's AI config has no endpoint
    fallback_endpoint: Option<String>,
}

impl Default for OpenAiChatClient {
    fn default() -> Self {
        Self::new()
    }
}

impl OpenAiChatClient {
    pub fn new() -> Self {
        Self {
            client: reqwest::Client::new(),
            fallback_endpoint: None,
        }
    }

    pub fn with_fallback_endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.fallback_endpoint = Some(endpoint.into());
        self
    }

    fn endpoint_for<'a>(&'a self, config: &'a AiConfig) -> Result<&'a str, BridgeError> {
        let configured = config.endpoint.trim();
        if !configured.is_empty() {
            return Ok(configured);
        }
        self.fallback_endpoint
            .as_deref()
            .ok_or_else(|| BridgeError::Transport("no AI endpoint configured".to_string()))
    }

    /// Pull the first choice's content out of a response body
    fn extract_content(body: &str) -> Result<String, BridgeError> {
        let parsed: CompletionResponse = serde_json::from_str(body)
            .map_err(|e| BridgeError::Transport(format!("invalid response body: {}", e)))?;
        parsed
            .choices
            .into_iter()
            .next()
            .and_then(|c| c.message.content)
            .map(|c| c.trim().to_string())
            .filter(|c| !c.is_empty())
            .ok_or(BridgeError::EmptyContent)
    }
}

#[async_trait]
impl ChatBackend for OpenAiChatClient {
    async fn complete(
        &self,
        messages: &[ChatMessage],
        config: &AiConfig,
        timeout: Duration,
    ) -> Result<String, BridgeError> {
        let body = CompletionRequest {
            model: &config.model,
            messages,
            temperature: config.temperature,
            max_tokens: config.max_tokens,
        };

        let mut request = self
            .client
            .post(self.endpoint_for(config)?)
            .timeout(timeout)
            .json(&body);
        if let Some(key) = &config.api_key {
            request = request.bearer_auth(key);
        }

        let map_err = |e: reqwest::Error| {
            if e.is_timeout() {
                BridgeError::Timeout
            } else {
                BridgeError::Transport(e.to_string())
            }
        };

        let response = request.send().await.map_err(map_err)?;
        let status = response.status();
        if !status.is_success() {
            return Err(BridgeError::Status(status.as_u16()));
        }
        let text = response.text().await.map_err(map_err)?;
        if text.is_empty() {
            return Err(BridgeError::EmptyContent);
        }
        Self::extract_content(&text)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_chat_message_construction() {
        assert_eq!(ChatMessage::system("s").role, "system");
        assert_eq!(ChatMessage::user("u").role, "user");
        assert_eq!(ChatMessage::assistant("a").content, "a");
    }

    #[test]
    fn test_request_serialization() {
        let messages = vec![ChatMessage::user("hi")];
        let body = CompletionRequest {
            model: "llama3.2",
            messages: &messages,
            temperature: 0.5,
            max_tokens: 64,
        };
        let json = serde_json::to_value(&body).unwrap();
        assert_eq!(json["model"], "llama3.2");
        assert_eq!(json["messages"][0]["role"], "user");
        assert_eq!(json["max_tokens"], 64);
    }

    #[test]
    fn test_endpoint_fallback() {
        let mut config = AiConfig::default();
        config.endpoint = String::new();
        assert!(matches!(
            OpenAiChatClient::new().endpoint_for(&config),
            Err(BridgeError::Transport(_))
        ));

        let client = OpenAiChatClient::new().with_fallback_endpoint("http://ai.local/v1/chat");
        assert_eq!(client.endpoint_for(&config).unwrap(), "http://ai.local/v1/chat");

        config.endpoint = "http://own/v1/chat".to_string();
        assert_eq!(client.endpoint_for(&config).unwrap(), "http://own/v1/chat");
    }

    #[test]
    fn test_extract_content() {
        let body = r#"{"choices":[{"message":{"role":"assistant","content":"  Hey there! "}}]}"#;
        assert_eq!(OpenAiChatClient::extract_content(body).unwrap(), "Hey there!");
    }

    #[test]
    fn test_extract_content_empty() {
        let body = r#"{"choices":[{"message":{"role":"assistant","content":"   "}}]}"#;
        assert_eq!(
            OpenAiChatClient::extract_content(body),
            Err(BridgeError::EmptyContent)
        );
        assert_eq!(
            OpenAiChatClient::extract_content(r#"{"choices":[]}"#),
            Err(BridgeError::EmptyContent)
        );
        assert!(matches!(
            OpenAiChatClient::extract_content("not json"),
            Err(BridgeError::Transport(_))
        ));
    }
}
