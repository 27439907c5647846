//! Randomized pacing decisions
//!
//! Pure functions of a config and an RNG so callers decide where randomness
//! comes from (thread RNG in the agent, seeded RNG in tests).

use std::time::Duration;

use rand::Rng;

use crate::session::{DelayRange, TimingConfig};

/// Uniform sample in `[min, max]`. An inverted range is read as `[max, min]`.
pub fn sample_delay<R: Rng + ?Sized>(range: DelayRange, rng: &mut R) -> Duration {
    let (lo, hi) = if range.min_ms <= range.max_ms {
        (range.min_ms, range.max_ms)
    } else {
        (range.max_ms, range.min_ms)
    };
    Duration::from_millis(rng.gen_range(lo..=hi))
}

/// Pause between deciding to reply and starting to type
pub fn pre_reply_delay<R: Rng + ?Sized>(timing: &TimingConfig, rng: &mut R) -> Duration {
    sample_delay(timing.pre_reply_delay_ms, rng)
}

/// Pause after each typed character
pub fn typing_delay<R: Rng + ?Sized>(timing: &TimingConfig, rng: &mut R) -> Duration {
    sample_delay(timing.typing_delay_ms, rng)
}

/// Whether to deliberately leave a message unanswered
///
/// Draws uniformly from `[0, 1)`, so a probability of 0 never skips and 1
/// always does.
pub fn should_skip<R: Rng + ?Sized>(probability: f64, rng: &mut R) -> bool {
    let p = if probability.is_nan() {
        0.0
    } else {
        probability.clamp(0.0, 1.0)
    };
    rng.gen::<f64>() < p
}
