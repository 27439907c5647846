//! Chatvisor - multi-session conversational automation host
//!
//! Runs any number of isolated browsing sessions side by side. Each session
//! has its own storage partition, proxy binding and client fingerprint, and
//! optionally an agent that watches the session's inbox and answers
//! incoming messages from rules, an AI endpoint, or a small heuristic set.
//!
//! # Modules
//!
//! - `session` - session records, persistence, execution hosts and the registry
//! - `surface` - surface lifecycle (one surface per session) and the in-memory driver
//! - `agent` - per-session polling agent, event dedup and conversation memory
//! - `bridge` - request/response mailbox between agents and the AI endpoint
//! - `governor` - human-like delays and reply rate ceilings
//! - `logs` - per-session log ring buffers with a live view
//! - `commands` - control surface used by the host UI
//! - `settings` - host process settings
//! - `metrics` - Prometheus metrics for observability
//! - `tracing` - subscriber and OpenTelemetry setup
//!
//! # Quick Start
//!
//! ```ignore
//! use chatvisor::{BridgeHost, LogAggregator, MemorySessionStore, MemorySurfaceFactory,
//!     OpenAiChatClient, SessionRegistry};
//!
//! let registry = SessionRegistry::new(
//!     Arc::new(MemorySessionStore::new()),
//!     Arc::new(MemorySurfaceFactory::default()),
//!     Arc::new(BridgeHost::new(Arc::new(OpenAiChatClient::new()))),
//!     Arc::new(LogAggregator::new()),
//! );
//! registry.bootstrap().await?;
//! ```

pub mod agent;
pub mod bridge;
pub mod commands;
pub mod governor;
pub mod logs;
pub mod metrics;
pub mod session;
pub mod settings;
pub mod surface;
pub mod tracing;

// Re-export commonly used types at crate root for convenience
pub use agent::{Agent, CycleOutcome};
pub use bridge::{BridgeClient, BridgeHost, ChatBackend, OpenAiChatClient};
pub use commands::ControlApi;
pub use logs::{LogAggregator, LogEntry, Severity};
pub use session::{
    JsonSessionStore, MemorySessionStore, Session, SessionConfig, SessionId, SessionRegistry,
};
pub use settings::HostSettings;
pub use surface::{MemorySurfaceFactory, SurfaceManager};
