//! Token-bucket (by byte history) and null rate limiter variants.
//!
//! `when()` answers "how many seconds until one more send is legal",
//! computed from a sliding window of recent send sizes rather than a fixed
//! token quota. See DESIGN.md for why this isn't built on `governor`.

use std::collections::VecDeque;
use std::time::{Duration, Instant};

use snowflake_config::MIN_RATE_LIMIT_BYTES_PER_SEC;

/// Shared rate-limiting capability. A single instance is owned by the
/// scheduler and handed to every session by reference.
pub trait RateLimit: Send + Sync {
    /// True once cumulative bytes sent in the trailing window reach
    /// capacity; sessions must stop sending until this clears.
    fn is_limited(&self) -> bool;

    /// Record `bytes` having just been sent.
    fn update(&self, bytes: u32);

    /// Seconds until enough history will have aged out of the window for
    /// one more send to be legal. Only meaningful while `is_limited()`.
    fn when(&self) -> f64;
}

/// Always-open limiter used when no `rate_limit_bytes_per_sec` is
/// configured.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullRateLimit;

impl RateLimit for NullRateLimit {
    fn is_limited(&self) -> bool {
        false
    }

    fn update(&self, _bytes: u32) {}

    fn when(&self) -> f64 {
        0.0
    }
}

/// Sliding-window byte-history limiter.
///
/// `capacity = rate_limit_bytes_per_sec * window`; `is_limited()` is true
/// once the sum of bytes recorded in the trailing `window` seconds reaches
/// `capacity`. Entries older than `window` are pruned lazily on access.
pub struct TokenBucketRateLimit {
    capacity: f64,
    window: Duration,
    history: parking_lot::Mutex<VecDeque<(Instant, u32)>>,
}

impl TokenBucketRateLimit {
    /// `bytes_per_sec` must be at least [`MIN_RATE_LIMIT_BYTES_PER_SEC`];
    /// configuration validation is expected to have already rejected
    /// anything below that floor, so this only asserts it.
    pub fn new(bytes_per_sec: u32, window_secs: f64) -> Self {
        debug_assert!(
            bytes_per_sec >= MIN_RATE_LIMIT_BYTES_PER_SEC,
            "rate limit below configured floor must be rejected before construction"
        );
        Self {
            capacity: bytes_per_sec as f64 * window_secs,
            window: Duration::from_secs_f64(window_secs),
            history: parking_lot::Mutex::new(VecDeque::new()),
        }
    }

    fn prune_and_sum(&self, history: &mut VecDeque<(Instant, u32)>, now: Instant) -> f64 {
        while let Some(&(ts, _)) = history.front() {
            if now.duration_since(ts) > self.window {
                history.pop_front();
            } else {
                break;
            }
        }
        history.iter().map(|&(_, n)| n as f64).sum()
    }
}

impl RateLimit for TokenBucketRateLimit {
    fn is_limited(&self) -> bool {
        let now = Instant::now();
        let mut history = self.history.lock();
        self.prune_and_sum(&mut history, now) >= self.capacity
    }

    fn update(&self, bytes: u32) {
        let mut history = self.history.lock();
        history.push_back((Instant::now(), bytes));
    }

    fn when(&self) -> f64 {
        let now = Instant::now();
        let history = self.history.lock();
        let Some(&(oldest_ts, _)) = history.front() else {
            return 0.0;
        };
        let age = now.duration_since(oldest_ts).as_secs_f64();
        (self.window.as_secs_f64() - age).max(0.0)
    }
}
