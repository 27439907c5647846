//! Browsing surface management
//!
//! This module provides:
//! - The surface driver contract (`Surface`, `SurfaceFactory`)
//! - Surface handles and the 1:1 session → surface manager
//! - An in-process surface for tests and demos

pub mod driver;
pub mod handle;
pub mod manager;
pub mod memory;

pub use driver::{
    ElementRef, PageElement, PageSnapshot, Surface, SurfaceError, SurfaceEvent, SurfaceEvents,
    SurfaceFactory, SurfaceSnapshot, SurfaceSpec,
};
pub use handle::{SurfaceHandle, SurfaceStatus};
pub use manager::{DetachMode, Detached, SurfaceManager};
pub use memory::{MemorySurface, MemorySurfaceFactory, SentMessage};
