//! Resilience utilities: per-peer exponential backoff and flood rate limiting.
//!
//! - [`ExponentialBackoff`]: gates full-sync retries per peer. Every failed
//!   send doubles the wait up to a ceiling; a success resets it.
//! - [`FloodLimiter`]: token bucket over outbound flood sends. Strictly
//!   non-blocking; a depleted bucket means the publication gets buffered,
//!   never that the event loop stalls.

use std::num::NonZeroU32;
use std::time::{Duration, Instant};

use governor::clock::DefaultClock;
use governor::middleware::NoOpMiddleware;
use governor::state::{InMemoryState, NotKeyed};
use governor::{Quota, RateLimiter};

use crate::config::FloodRate;

/// First retry delay after a failed full-sync send.
pub const INITIAL_BACKOFF: Duration = Duration::from_millis(64);

/// Ceiling for the full-sync retry delay.
pub const MAX_BACKOFF: Duration = Duration::from_millis(8_192);

/// Classic doubling backoff with a ceiling.
///
/// The window only arms on [`report_error`](Self::report_error); a fresh
/// backoff can try immediately.
#[derive(Debug, Clone)]
pub struct ExponentialBackoff {
    initial: Duration,
    max: Duration,
    current: Duration,
    not_before: Option<Instant>,
}

impl ExponentialBackoff {
    pub fn new(initial: Duration, max: Duration) -> Self {
        Self {
            initial,
            max,
            current: initial,
            not_before: None,
        }
    }

    /// Backoff with the full-sync defaults.
    pub fn for_full_sync() -> Self {
        Self::new(INITIAL_BACKOFF, MAX_BACKOFF)
    }

    pub fn can_try_now(&self, now: Instant) -> bool {
        match self.not_before {
            Some(t) => now >= t,
            None => true,
        }
    }

    /// Time until the next attempt is allowed; zero when ready.
    pub fn time_remaining(&self, now: Instant) -> Duration {
        match self.not_before {
            Some(t) => t.saturating_duration_since(now),
            None => Duration::ZERO,
        }
    }

    /// Record a failed attempt: arm the window and double the next one.
    pub fn report_error(&mut self, now: Instant) {
        self.not_before = Some(now + self.current);
        self.current = (self.current * 2).min(self.max);
    }

    /// Record a success: reset to the initial delay, ready immediately.
    pub fn report_success(&mut self) {
        self.current = self.initial;
        self.not_before = None;
    }
}

/// Token bucket gating outbound flood sends.
///
/// Owned by the event loop; `try_consume` never blocks and never sleeps.
pub struct FloodLimiter {
    limiter: RateLimiter<NotKeyed, InMemoryState, DefaultClock, NoOpMiddleware>,
    rate: FloodRate,
}

impl FloodLimiter {
    pub fn new(rate: FloodRate) -> Self {
        let quota = Quota::per_second(
            NonZeroU32::new(rate.messages_per_sec).unwrap_or(NonZeroU32::MIN),
        )
        .allow_burst(NonZeroU32::new(rate.burst_size).unwrap_or(NonZeroU32::MIN));

        Self {
            limiter: RateLimiter::direct(quota),
            rate,
        }
    }

    /// Take one token if available.
    pub fn try_consume(&self) -> bool {
        self.limiter.check().is_ok()
    }

    pub fn rate(&self) -> &FloodRate {
        &self.rate
    }
}

impl std::fmt::Debug for FloodLimiter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FloodLimiter").field("rate", &self.rate).finish()
    }
}
