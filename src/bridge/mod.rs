//! AI bridge between sandboxed agents and the network-capable host
//!
//! This module provides:
//! - The single-slot request/response mailbox and its agent-side client
//! - The host poller that performs endpoint calls
//! - The chat-completion client speaking the endpoint contract

pub mod chat;
pub mod host;
pub mod slot;

pub use chat::{BridgeError, ChatBackend, ChatMessage, OpenAiChatClient};
pub use host::BridgeHost;
pub use slot::{AiRequest, AiResponse, BridgeClient, BridgeOutcome, BridgeSlot};
