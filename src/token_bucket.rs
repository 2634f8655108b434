use std::time::Duration;

use tokio::time::Instant;

/// Lower clamp for a bucket's safety factor.
pub(crate) const SAFETY_MIN: f64 = 0.3;
/// Upper clamp for a bucket's safety factor.
pub(crate) const SAFETY_MAX: f64 = 1.0;

/// A monotonic-clock token bucket with a soft capacity.
///
/// The declared per-minute limit is derated by an adjustable safety factor:
/// the effective capacity is `floor(limit * safety_factor)` (at least 1) and
/// tokens refill continuously at `limit * safety_factor / 60` per second.
/// Every operation refills first, so observers always see current state.
#[derive(Debug, Clone)]
pub(crate) struct TokenBucket {
    limit_per_minute: u32,
    safety_factor: f64,
    tokens: f64,
    last_refill: Instant,
}

impl TokenBucket {
    /// Create a full bucket for the given per-minute limit.
    pub(crate) fn new(limit_per_minute: u32, safety_factor: f64) -> Self {
        let safety_factor = safety_factor.clamp(SAFETY_MIN, SAFETY_MAX);
        let mut bucket = Self {
            limit_per_minute: limit_per_minute.max(1),
            safety_factor,
            tokens: 0.0,
            last_refill: Instant::now(),
        };
        bucket.tokens = bucket.effective_capacity();
        bucket
    }

    /// Effective capacity after the safety factor, never below one token.
    pub(crate) fn effective_capacity(&self) -> f64 {
        (f64::from(self.limit_per_minute) * self.safety_factor)
            .floor()
            .max(1.0)
    }

    /// Refill rate in tokens per second.
    pub(crate) fn refill_rate(&self) -> f64 {
        f64::from(self.limit_per_minute) * self.safety_factor / 60.0
    }

    /// Add the tokens accrued since the last refill, capped at capacity.
    pub(crate) fn refill(&mut self) {
        let now = Instant::now();
        let elapsed = now.duration_since(self.last_refill).as_secs_f64();
        self.last_refill = now;
        self.tokens = (self.tokens + elapsed * self.refill_rate()).min(self.effective_capacity());
    }

    /// Take one token if available. Non-blocking.
    pub(crate) fn try_take(&mut self) -> bool {
        self.refill();
        if self.tokens >= 1.0 {
            self.tokens -= 1.0;
            true
        } else {
            false
        }
    }

    /// Time until one token becomes available.
    pub(crate) fn time_until_available(&mut self) -> Duration {
        self.refill();
        if self.tokens >= 1.0 {
            Duration::ZERO
        } else {
            Duration::from_secs_f64((1.0 - self.tokens) / self.refill_rate())
        }
    }

    /// Shift the safety factor by `delta`, clamped to [`SAFETY_MIN`, `SAFETY_MAX`].
    ///
    /// Tokens above the new effective capacity are discarded, never scaled up.
    pub(crate) fn adjust_safety(&mut self, delta: f64) {
        self.refill();
        self.safety_factor = (self.safety_factor + delta).clamp(SAFETY_MIN, SAFETY_MAX);
        self.tokens = self.tokens.min(self.effective_capacity());
    }

    pub(crate) fn tokens(&self) -> f64 {
        self.tokens
    }

    pub(crate) fn safety_factor(&self) -> f64 {
        self.safety_factor
    }

    pub(crate) fn limit_per_minute(&self) -> u32 {
        self.limit_per_minute
    }
}
