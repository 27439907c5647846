//! Sessions: identity, configuration, persistence and lifecycle
//!
//! This module provides:
//! - Session records and per-session configuration
//! - The persistence collaborator (`SessionStore`) with memory and JSON backends
//! - The proxy pool sessions bind egress to
//! - Execution hosts that own surfaces and agents
//! - The registry that drives every lifecycle transition

pub mod config;
pub mod host;
pub mod model;
pub mod proxy;
pub mod registry;
pub mod store;

pub use config::{AiConfig, DelayRange, RateLimits, ReplyRule, SessionConfig, TimingConfig};
pub use host::{ExecutionHost, HostId};
pub use model::{
    BotStatus, Fingerprint, Partition, Session, SessionId, SessionState, SessionSummary,
};
pub use proxy::{ProxyEntry, ProxyPool, ProxyRef, ProxyStatus};
pub use registry::{BotStatusChanged, HandoffToken, RegistryError, SessionRegistry};
pub use store::{JsonSessionStore, MemorySessionStore, SessionStore, StoreError};
