//! Reply ceilings
//!
//! A session may only send so many replies per minute and per hour. Each
//! ceiling is a token bucket; a reply needs a token from both.
//!
//! ```text
//! ┌───────────────────────────────────────────────────────────────────┐
//! │  REPLY CEILINGS                                                   │
//! │                                                                   │
//! │  minute bucket (cap = per_minute, refill per_minute / 60 s)       │
//! │  hour bucket   (cap = per_hour,   refill per_hour / 3600 s)       │
//! │                                                                   │
//! │  try_acquire():                                                   │
//! │    - both have ≥1 token → take one from each, ALLOW               │
//! │    - either empty       → take nothing, DENY                      │
//! └───────────────────────────────────────────────────────────────────┘
//! ```

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::{Duration, Instant};

use crate::session::RateLimits;

// Tokens are stored * 1000 so fractional refills are not lost
const SCALE: u64 = 1000;

// ═══════════════════════════════════════════════════════════════════════════
// TokenBucket
// ═══════════════════════════════════════════════════════════════════════════
// Lock-free count, mutex only around the refill timestamp.
// ═══════════════════════════════════════════════════════════════════════════

pub struct TokenBucket {
    capacity: u64,
    /// Tokens added per second
    refill_rate: f64,
    tokens_scaled: AtomicU64,
    last_refill: Mutex<Instant>,
}

impl TokenBucket {
    /// Full bucket holding `capacity` tokens, refilled evenly over `period`
    pub fn per_period(capacity: u64, period: Duration) -> Self {
        let refill_rate = if period.is_zero() {
            0.0
        } else {
            capacity as f64 / period.as_secs_f64()
        };
        Self {
            capacity,
            refill_rate,
            tokens_scaled: AtomicU64::new(capacity * SCALE),
            last_refill: Mutex::new(Instant::now()),
        }
    }

    fn refill(&self) {
        let now = Instant::now();
        let Ok(mut last) = self.last_refill.lock() else {
            return;
        };
        let elapsed = now.duration_since(*last);
        let tokens_to_add = (elapsed.as_secs_f64() * self.refill_rate * SCALE as f64) as u64;

        if tokens_to_add > 0 {
            *last = now;
            let max_scaled = self.capacity * SCALE;
            let _ = self
                .tokens_scaled
                .fetch_update(Ordering::SeqCst, Ordering::Relaxed, |current| {
                    Some(std::cmp::min(current + tokens_to_add, max_scaled))
                });
        }
    }

    fn has_token(&self) -> bool {
        self.refill();
        self.tokens_scaled.load(Ordering::Relaxed) >= SCALE
    }

    fn try_take(&self) -> bool {
        self.refill();
        self.tokens_scaled
            .fetch_update(Ordering::SeqCst, Ordering::Relaxed, |current| {
                current.checked_sub(SCALE)
            })
            .is_ok()
    }

    /// Put back a token taken by a failed combined acquire
    fn give_back(&self) {
        let max_scaled = self.capacity * SCALE;
        let _ = self
            .tokens_scaled
            .fetch_update(Ordering::SeqCst, Ordering::Relaxed, |current| {
                Some(std::cmp::min(current + SCALE, max_scaled))
            });
    }

    pub fn available_tokens(&self) -> u64 {
        self.refill();
        self.tokens_scaled.load(Ordering::Relaxed) / SCALE
    }

    pub fn capacity(&self) -> u64 {
        self.capacity
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// ReplyRateLimiter
// ═══════════════════════════════════════════════════════════════════════════
// A ceiling of 0 means "no ceiling" and has no bucket.
// ═══════════════════════════════════════════════════════════════════════════

pub struct ReplyRateLimiter {
    per_minute: Option<TokenBucket>,
    per_hour: Option<TokenBucket>,
    limits: RateLimits,
}

impl ReplyRateLimiter {
    pub fn new(limits: RateLimits) -> Self {
        let bucket = |cap: u32, period: Duration| {
            (cap > 0).then(|| TokenBucket::per_period(cap as u64, period))
        };
        Self {
            per_minute: bucket(limits.per_minute, Duration::from_secs(60)),
            per_hour: bucket(limits.per_hour, Duration::from_secs(3600)),
            limits,
        }
    }

    /// Limits this limiter was built from
    pub fn limits(&self) -> RateLimits {
        self.limits
    }

    /// Take one reply slot if both ceilings allow it
    pub fn try_acquire(&self) -> bool {
        let minute_ok = self.per_minute.as_ref().map_or(true, |b| b.has_token());
        let hour_ok = self.per_hour.as_ref().map_or(true, |b| b.has_token());
        if !(minute_ok && hour_ok) {
            return false;
        }

        if let Some(minute) = &self.per_minute {
            if !minute.try_take() {
                return false;
            }
        }
        if let Some(hour) = &self.per_hour {
            if !hour.try_take() {
                if let Some(minute) = &self.per_minute {
                    minute.give_back();
                }
                return false;
            }
        }
        true
    }

    /// Return a slot taken by `try_acquire` for a reply that never went out
    pub fn release(&self) {
        if let Some(minute) = &self.per_minute {
            minute.give_back();
        }
        if let Some(hour) = &self.per_hour {
            hour.give_back();
        }
    }

    /// Check if currently rate limited
    pub fn is_rate_limited(&self) -> bool {
        let minute_empty = self.per_minute.as_ref().map_or(false, |b| !b.has_token());
        let hour_empty = self.per_hour.as_ref().map_or(false, |b| !b.has_token());
        minute_empty || hour_empty
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_minute_ceiling() {
        let limiter = ReplyRateLimiter::new(RateLimits {
            per_minute: 2,
            per_hour: 100,
        });
        assert!(limiter.try_acquire());
        assert!(limiter.try_acquire());
        assert!(!limiter.try_acquire());
        assert!(limiter.is_rate_limited());
    }

    #[test]
    fn test_hour_ceiling_does_not_leak_minute_tokens() {
        let limiter = ReplyRateLimiter::new(RateLimits {
            per_minute: 5,
            per_hour: 1,
        });
        assert!(limiter.try_acquire());
        assert!(!limiter.try_acquire());
        let minute = limiter.per_minute.as_ref().unwrap();
        assert_eq!(minute.available_tokens(), 4);
    }

    #[test]
    fn test_zero_disables_ceiling() {
        let limiter = ReplyRateLimiter::new(RateLimits {
            per_minute: 0,
            per_hour: 0,
        });
        for _ in 0..1000 {
            assert!(limiter.try_acquire());
        }
        assert!(!limiter.is_rate_limited());
    }

    #[test]
    fn test_bucket_refill() {
        // 2 tokens per 20ms → one token every 10ms
        let bucket = TokenBucket::per_period(2, Duration::from_millis(20));
        assert!(bucket.try_take());
        assert!(bucket.try_take());
        assert!(!bucket.try_take());

        std::thread::sleep(Duration::from_millis(15));
        assert!(bucket.try_take());
    }
}
