//! Automation agent: one polling state machine per active session
//!
//! # Architecture
//!
//! ```text
//! poll tick → PlatformStrategy.find_unread_conversations(page)
//!                  ↓
//!           open conversation, extract latest event
//!                  ↓
//!           dedup (seen set, last replied per counterpart)
//!                  ↓
//!           rule → AI bridge → heuristic → none
//!                  ↓
//!           skip gate → rate ceilings → delay → type → submit
//!                  ↓
//!           AgentMemory (surface storage) + log aggregator
//! ```

pub mod controller;
pub mod event;
pub mod memory;
pub mod platform;
pub mod reply;

pub use controller::{Agent, AgentError, CycleOutcome};
pub use event::{ConversationalEvent, EventId, MAX_EVENT_TEXT};
pub use memory::{AgentMemory, Direction, MemoryEntry, MEMORY_CAPACITY};
pub use platform::{AriaInboxStrategy, Conversation, PlatformRegistry, PlatformStrategy};
pub use reply::{heuristic_reply, match_rule, ReplySource};
