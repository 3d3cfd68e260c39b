//! Connection attempt accounting and connect backoff

use std::time::Duration;

use tokio::time::Instant;

/// Per-host attempt counter over a fixed window
#[derive(Debug, Clone)]
pub struct AttemptCounter {
    pub count: u32,
    pub window_start: Instant,
    pub last_attempt: Instant,
}

impl AttemptCounter {
    pub fn new(now: Instant) -> Self {
        Self {
            count: 0,
            window_start: now,
            last_attempt: now,
        }
    }

    pub fn is_expired(&self, now: Instant, window: Duration) -> bool {
        now.saturating_duration_since(self.window_start) >= window
    }

    /// Register one attempt. Returns the attempt number within the window, or
    /// `None` when the host already used up `max` attempts.
    pub fn try_register(&mut self, now: Instant, window: Duration, max: u32) -> Option<u32> {
        if self.is_expired(now, window) {
            self.count = 0;
            self.window_start = now;
        }
        if self.count >= max {
            return None;
        }
        self.count += 1;
        self.last_attempt = now;
        Some(self.count)
    }
}

/// Delay before attempt number `attempt` (1-based).
///
/// The first attempt is immediate; later ones wait
/// `min(max, base * 2^(attempt-2) + jitter)`.
pub fn connect_backoff_delay(
    attempt: u32,
    base: Duration,
    max: Duration,
    jitter: Duration,
) -> Duration {
    if attempt <= 1 {
        return Duration::ZERO;
    }
    let exp = (attempt - 2).min(20);
    base.saturating_mul(1u32 << exp)
        .saturating_add(jitter)
        .min(max)
}
