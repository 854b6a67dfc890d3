//! Adaptive per-endpoint rate limiting.
//!
//! A token bucket whose permitted rate adapts to observed throttle/success
//! feedback from the remote: 429/503 responses reduce the rate (enabling
//! the limiter at a conservative rate if it was disabled), runs of
//! successes raise it back, and the limiter starts disabled (unlimited)
//! until the first throttle is observed.

use std::sync::Mutex;
use std::time::{Duration, Instant};
use tokio::sync::Notify;

#[derive(Debug, Clone, Copy)]
pub struct RateLimiterConfig {
    /// Rate (requests/sec) the limiter adopts the first time it is enabled.
    pub initial_rate: f64,
    /// Never throttle below this rate once enabled.
    pub floor_rate: f64,
    /// Never accelerate above this rate.
    pub ceiling_rate: f64,
    /// Multiplicative factor applied on throttle.
    pub backoff_factor: f64,
    /// Multiplicative factor applied on sustained success.
    pub recovery_factor: f64,
    /// Consecutive successes required before the rate is allowed to climb.
    pub rate_recovery_after: u32,
}

impl Default for RateLimiterConfig {
    fn default() -> Self {
        Self {
            initial_rate: 5.0,
            floor_rate: 0.5,
            ceiling_rate: 200.0,
            backoff_factor: 0.5,
            recovery_factor: 1.5,
            rate_recovery_after: 10,
        }
    }
}

struct State {
    /// `None` means unlimited (disabled).
    rate: Option<f64>,
    consecutive_successes: u32,
    last_refill: Instant,
    tokens: f64,
}

/// An adaptive token bucket. Cloning shares the same underlying state.
pub struct RateLimiter {
    config: RateLimiterConfig,
    state: Mutex<State>,
    notify: Notify,
}

impl RateLimiter {
    pub fn new(config: RateLimiterConfig) -> Self {
        Self {
            config,
            state: Mutex::new(State {
                rate: None,
                consecutive_successes: 0,
                last_refill: Instant::now(),
                tokens: 0.0,
            }),
            notify: Notify::new(),
        }
    }

    /// Returns the current rate, or `None` if the limiter is disabled
    /// (unlimited).
    pub fn current_rate(&self) -> Option<f64> {
        self.state.lock().unwrap().rate
    }

    /// Wait for a token to become available. Cancellation-safe: dropping
    /// the returned future aborts the wait without consuming a token.
    pub async fn acquire(&self) {
        loop {
            let wait = {
                let mut state = self.state.lock().unwrap();
                let Some(rate) = state.rate else {
                    return;
                };

                self.refill(&mut state, rate);

                if state.tokens >= 1.0 {
                    state.tokens -= 1.0;
                    return;
                }

                let deficit = 1.0 - state.tokens;
                Duration::from_secs_f64(deficit / rate)
            };

            tokio::select! {
                _ = tokio::time::sleep(wait) => {}
                _ = self.notify.notified() => {}
            }
        }
    }

    fn refill(&self, state: &mut State, rate: f64) {
        let now = Instant::now();
        let elapsed = now.duration_since(state.last_refill).as_secs_f64();
        state.tokens = (state.tokens + elapsed * rate).min(rate.max(1.0));
        state.last_refill = now;
    }

    /// Record a 429/503-class response: enable the limiter at a
    /// conservative rate if it was disabled, otherwise reduce the current
    /// rate multiplicatively toward the floor.
    pub fn record_throttle(&self) {
        let mut state = self.state.lock().unwrap();
        state.consecutive_successes = 0;
        state.rate = Some(match state.rate {
            None => self.config.initial_rate,
            Some(rate) => (rate * self.config.backoff_factor).max(self.config.floor_rate),
        });
        self.notify.notify_waiters();
    }

    /// Record a 2xx response. After `rate_recovery_after` consecutive
    /// successes, increase the rate multiplicatively toward the ceiling. A
    /// disabled limiter stays disabled.
    pub fn record_success(&self) {
        let mut state = self.state.lock().unwrap();
        let Some(rate) = state.rate else {
            return;
        };

        state.consecutive_successes += 1;
        if state.consecutive_successes >= self.config.rate_recovery_after {
            state.consecutive_successes = 0;
            state.rate = Some((rate * self.config.recovery_factor).min(self.config.ceiling_rate));
            self.notify.notify_waiters();
        }
    }

    /// Other status codes (e.g. 4xx client errors other than 429): no rate
    /// change, but resets the success streak since it wasn't a clean
    /// success either.
    pub fn record_neutral(&self) {
        let mut state = self.state.lock().unwrap();
        state.consecutive_successes = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn starts_disabled() {
        let limiter = RateLimiter::new(RateLimiterConfig::default());
        assert_eq!(limiter.current_rate(), None);
    }

    #[test]
    fn throttle_enables_then_reduces() {
        let limiter = RateLimiter::new(RateLimiterConfig::default());
        limiter.record_throttle();
        let first = limiter.current_rate().unwrap();
        assert_eq!(first, RateLimiterConfig::default().initial_rate);

        limiter.record_throttle();
        let second = limiter.current_rate().unwrap();
        assert!(second <= first, "rate must not increase after a throttle");
    }

    #[test]
    fn success_streak_raises_rate_after_recovery_threshold() {
        let config = RateLimiterConfig { rate_recovery_after: 3, ..RateLimiterConfig::default() };
        let limiter = RateLimiter::new(config);
        limiter.record_throttle();
        let throttled_rate = limiter.current_rate().unwrap();

        limiter.record_success();
        limiter.record_success();
        assert_eq!(limiter.current_rate().unwrap(), throttled_rate, "no increase before threshold");

        limiter.record_success();
        assert!(limiter.current_rate().unwrap() >= throttled_rate);
    }

    #[test]
    fn disabled_limiter_ignores_success() {
        let limiter = RateLimiter::new(RateLimiterConfig::default());
        for _ in 0..50 {
            limiter.record_success();
        }
        assert_eq!(limiter.current_rate(), None);
    }

    #[test]
    fn neutral_does_not_change_rate() {
        let limiter = RateLimiter::new(RateLimiterConfig::default());
        limiter.record_throttle();
        let rate = limiter.current_rate().unwrap();
        limiter.record_neutral();
        assert_eq!(limiter.current_rate().unwrap(), rate);
    }
}
