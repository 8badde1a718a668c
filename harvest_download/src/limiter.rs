//! Adaptive token-bucket rate limiter shared by downloader instances.
//!
//! The refill rate drifts with observed server behavior: sustained success
//! nudges it up every 30 seconds, a throttled response (429/503) cuts it
//! immediately. The bucket is thread-safe so callers may later fan out
//! without changing the rate-control contract.

use std::sync::{Mutex, PoisonError};
use std::time::{Duration, Instant};

const SUCCESS_ADJUST_INTERVAL: Duration = Duration::from_secs(30);
const SUCCESS_RATE_FACTOR: f64 = 1.10;
const THROTTLE_RATE_FACTOR: f64 = 0.70;

#[derive(Debug)]
struct LimiterState {
    tokens: f64,
    current_rate: f64,
    refilled_at: Instant,
    adjusted_at: Instant,
}

#[derive(Debug)]
pub struct AdaptiveLimiter {
    burst: f64,
    min_rate: f64,
    max_rate: f64,
    state: Mutex<LimiterState>,
}

impl AdaptiveLimiter {
    pub fn new(base_rate: f64, burst: u32) -> Self {
        let now = Instant::now();
        AdaptiveLimiter {
            burst: burst as f64,
            min_rate: base_rate.min(1.0),
            max_rate: base_rate * 2.0,
            state: Mutex::new(LimiterState {
                tokens: burst as f64,
                current_rate: base_rate,
                refilled_at: now,
                adjusted_at: now,
            }),
        }
    }

    /// Take one token, sleeping `shortage / current_rate` while the bucket
    /// is empty.
    pub async fn acquire(&self) {
        loop {
            let wait = {
                let mut state = self.lock();
                self.refill(&mut state);
                if state.tokens >= 1.0 {
                    state.tokens -= 1.0;
                    None
                } else {
                    let shortage = 1.0 - state.tokens;
                    Some(Duration::from_secs_f64(shortage / state.current_rate))
                }
            };
            match wait {
                None => return,
                Some(duration) => tokio::time::sleep(duration).await,
            }
        }
    }

    pub fn report_success(&self) {
        let mut state = self.lock();
        let now = Instant::now();
        if now.duration_since(state.adjusted_at) >= SUCCESS_ADJUST_INTERVAL {
            self.refill(&mut state);
            let raised = (state.current_rate * SUCCESS_RATE_FACTOR).min(self.max_rate);
            tracing::debug!("Raising download rate from {:.2} to {:.2}", state.current_rate, raised);
            state.current_rate = raised;
            state.adjusted_at = now;
        }
    }

    pub fn report_throttled(&self) {
        let mut state = self.lock();
        self.refill(&mut state);
        let lowered = (state.current_rate * THROTTLE_RATE_FACTOR).max(self.min_rate);
        tracing::warn!("Throttled; lowering download rate from {:.2} to {:.2}", state.current_rate, lowered);
        state.current_rate = lowered;
        state.adjusted_at = Instant::now();
    }

    pub fn current_rate(&self) -> f64 {
        self.lock().current_rate
    }

    fn refill(&self, state: &mut LimiterState) {
        let now = Instant::now();
        let elapsed = now.duration_since(state.refilled_at).as_secs_f64();
        state.tokens = (state.tokens + elapsed * state.current_rate).min(self.burst);
        state.refilled_at = now;
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, LimiterState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    #[cfg(test)]
    fn rewind_adjust_window(&self) {
        let mut state = self.lock();
        if let Some(past) = Instant::now().checked_sub(SUCCESS_ADJUST_INTERVAL + Duration::from_secs(1)) {
            state.adjusted_at = past;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn throttle_lowers_rate_toward_floor() {
        let limiter = AdaptiveLimiter::new(10.0, 5);
        limiter.report_throttled();
        assert!((limiter.current_rate() - 7.0).abs() < 1e-9);
        for _ in 0..20 {
            limiter.report_throttled();
        }
        // Floor is min(1.0, base).
        assert!((limiter.current_rate() - 1.0).abs() < 1e-9);
    }

    #[test]
    fn success_raises_rate_only_after_the_interval() {
        let limiter = AdaptiveLimiter::new(10.0, 5);
        limiter.report_success();
        assert!((limiter.current_rate() - 10.0).abs() < 1e-9);

        limiter.rewind_adjust_window();
        limiter.report_success();
        assert!((limiter.current_rate() - 11.0).abs() < 1e-9);
    }

    #[test]
    fn rate_caps_at_twice_the_base() {
        let limiter = AdaptiveLimiter::new(10.0, 5);
        for _ in 0..50 {
            limiter.rewind_adjust_window();
            limiter.report_success();
        }
        assert!((limiter.current_rate() - 20.0).abs() < 1e-9);
    }

    #[test]
    fn low_base_keeps_its_own_floor() {
        let limiter = AdaptiveLimiter::new(0.5, 1);
        for _ in 0..20 {
            limiter.report_throttled();
        }
        assert!((limiter.current_rate() - 0.5).abs() < 1e-9);
    }

    #[tokio::test]
    async fn acquire_drains_the_burst_without_blocking() {
        let limiter = AdaptiveLimiter::new(1000.0, 3);
        for _ in 0..3 {
            limiter.acquire().await;
        }
        // At 1000 req/s the refill sleep is negligible even when drained.
        limiter.acquire().await;
    }
}
