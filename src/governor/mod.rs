//! Rate and timing governor
//!
//! Decides how long to wait, whether to answer at all, and whether the
//! session's reply ceilings allow another message.

pub mod rate_limit;
pub mod timing;

pub use rate_limit::{ReplyRateLimiter, TokenBucket};
pub use timing::{pre_reply_delay, sample_delay, should_skip, typing_delay};
