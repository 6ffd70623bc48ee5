//! Token bucket implementation.

use std::time::{Duration, Instant};

use super::rules::Rule;

/// Slack used when comparing the fractional balance against a cost, so that
/// waiting exactly the advertised retry hint is always enough.
const TOKEN_EPSILON: f64 = 1e-9;

/// A shortfall that would be refilled within this many seconds is admitted.
///
/// Callers rounding a retry hint to whole seconds may drop up to this much
/// from the exact hint and still be admitted after waiting the rounded value.
pub const RETRY_SLACK_SECS: f64 = 1e-6;

/// Outcome of a single admission check.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Decision {
    /// Whether the operation may proceed
    pub allowed: bool,
    /// Seconds until enough tokens accrue; zero when allowed
    pub retry_after_secs: f64,
}

impl Decision {
    /// An admitted decision.
    pub fn allow() -> Self {
        Self {
            allowed: true,
            retry_after_secs: 0.0,
        }
    }

    /// A denied decision carrying a retry hint.
    pub fn deny(retry_after_secs: f64) -> Self {
        Self {
            allowed: false,
            retry_after_secs,
        }
    }

    /// The retry hint as a `Duration`.
    pub fn retry_after(&self) -> Duration {
        Duration::from_secs_f64(self.retry_after_secs.max(0.0))
    }
}

/// A continuously refilling token bucket.
///
/// The balance is fractional so that sub-second refill is exact. Callers are
/// responsible for exclusion; the limiter only touches a bucket while holding
/// its map entry.
#[derive(Debug, Clone)]
pub struct TokenBucket {
    /// Maximum balance
    capacity: f64,
    /// Tokens added per second
    refill_rate: f64,
    /// Current balance, always within `0..=capacity`
    tokens: f64,
    /// When the balance was last brought up to date
    last_refill: Instant,
}

impl TokenBucket {
    /// Create a full bucket for a rule.
    pub fn new(rule: &Rule, now: Instant) -> Self {
        Self::with_rate(rule.limit, rule.refill_rate(), now)
    }

    /// Create a full bucket with an explicit capacity and refill rate.
    pub fn with_rate(capacity: u32, refill_rate: f64, now: Instant) -> Self {
        let capacity = f64::from(capacity);
        Self {
            capacity,
            refill_rate,
            tokens: capacity,
            last_refill: now,
        }
    }

    /// Bring the balance up to date with `now`.
    pub fn refill(&mut self, now: Instant) {
        let elapsed = now.saturating_duration_since(self.last_refill).as_secs_f64();
        self.tokens = (self.tokens + elapsed * self.refill_rate).min(self.capacity);
        if now > self.last_refill {
            self.last_refill = now;
        }
    }

    /// Refill, then try to take `cost` tokens.
    pub fn consume(&mut self, cost: u32, now: Instant) -> Decision {
        self.refill(now);

        let cost = f64::from(cost);
        let tolerance = TOKEN_EPSILON.max(RETRY_SLACK_SECS * self.refill_rate);
        if self.tokens + tolerance >= cost {
            self.tokens = (self.tokens - cost).max(0.0);
            return Decision::allow();
        }

        Decision::deny((cost - self.tokens) / self.refill_rate)
    }

    /// Whether nothing has touched this bucket for at least `ttl`.
    pub fn is_idle(&self, now: Instant, ttl: Duration) -> bool {
        now.saturating_duration_since(self.last_refill) >= ttl
    }

    /// Current balance as of the last refill.
    pub fn tokens(&self) -> f64 {
        self.tokens
    }

    /// Maximum balance.
    pub fn capacity(&self) -> f64 {
        self.capacity
    }

    /// Tokens added per second.
    pub fn refill_rate(&self) -> f64 {
        self.refill_rate
    }

    /// When the balance was last brought up to date.
    pub fn last_refill(&self) -> Instant {
        self.last_refill
    }
}
