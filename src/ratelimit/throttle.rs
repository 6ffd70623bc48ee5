//! Per-user throttle for conversational bot commands.
//!
//! Unlike the token buckets used for the API surface, commands are limited
//! with a sliding log: a user may issue at most `max_calls` commands in any
//! `period`. Denied attempts are not recorded.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use tracing::debug;

use super::clock::{Clock, SystemClock};
use super::reclaim::Reclaim;

/// Sliding-window command throttle keyed by user id.
pub struct CommandThrottle {
    /// Timestamps of admitted calls per user, oldest first
    calls: DashMap<String, VecDeque<Instant>>,
    /// Calls allowed per period
    max_calls: usize,
    /// Window length
    period: Duration,
    /// When false every call is admitted (development mode)
    enabled: bool,
    clock: Arc<dyn Clock>,
}

impl CommandThrottle {
    /// Create a throttle on the system clock.
    pub fn new(max_calls: usize, period: Duration) -> Self {
        Self::with_clock(max_calls, period, Arc::new(SystemClock::new()))
    }

    /// Create a throttle on an explicit clock.
    pub fn with_clock(max_calls: usize, period: Duration, clock: Arc<dyn Clock>) -> Self {
        Self {
            calls: DashMap::new(),
            max_calls,
            period,
            enabled: true,
            clock,
        }
    }

    /// Turn throttling on or off.
    pub fn enabled(mut self, enabled: bool) -> Self {
        self.enabled = enabled;
        self
    }

    /// Record a command by `user_id` if it is within the limit.
    ///
    /// Returns `false` when the user has already issued `max_calls` commands
    /// within the current period.
    pub fn try_acquire(&self, user_id: &str) -> bool {
        if !self.enabled {
            return true;
        }

        let now = self.clock.now();
        let mut log = self.calls.entry(user_id.to_string()).or_default();
        Self::expire(&mut log, now, self.period);

        if log.len() >= self.max_calls {
            debug!(user_id = %user_id, calls = log.len(), "Command throttled");
            return false;
        }

        log.push_back(now);
        true
    }

    /// Number of users with tracked calls.
    pub fn tracked_users(&self) -> usize {
        self.calls.len()
    }

    fn expire(log: &mut VecDeque<Instant>, now: Instant, period: Duration) {
        while let Some(oldest) = log.front() {
            if now.saturating_duration_since(*oldest) < period {
                break;
            }
            log.pop_front();
        }
    }
}

impl Reclaim for CommandThrottle {
    fn name(&self) -> &'static str {
        "command_logs"
    }

    fn reclaim(&self) -> usize {
        let now = self.clock.now();
        let period = self.period;
        let mut removed = 0;

        self.calls.retain(|_, log| {
            Self::expire(log, now, period);
            let keep = !log.is_empty();
            if !keep {
                removed += 1;
            }
            keep
        });

        removed
    }
}
