//! Token-bucket admission control
//!
//! Tokens refill continuously at the configured rate, capped at the burst
//! size. All accounting happens inside one async mutex, so concurrent
//! acquirers can never overdraft or double-spend.

use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::debug;

/// Rate limiter configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateLimiterConfig {
    #[serde(default = "default_requests_per_second")]
    pub requests_per_second: f64,
    /// Token cap; also the number of requests admissible back-to-back
    #[serde(default = "default_burst_size")]
    pub burst_size: f64,
}

fn default_requests_per_second() -> f64 {
    10.0
}
fn default_burst_size() -> f64 {
    20.0
}

impl Default for RateLimiterConfig {
    fn default() -> Self {
        Self {
            requests_per_second: default_requests_per_second(),
            burst_size: default_burst_size(),
        }
    }
}

/// Usage metrics and live bucket state, for dashboards
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateLimiterStats {
    pub total_requests: u64,
    pub throttled_requests: u64,
    pub average_wait_ms: f64,
    pub available_tokens: f64,
    pub burst_size: f64,
    pub requests_per_second: f64,
    /// Time until the bucket is full again
    pub ms_until_full: u64,
}

struct BucketState {
    tokens: f64,
    last_refill: Instant,
    total_requests: u64,
    throttled_requests: u64,
    total_wait: Duration,
}

/// Token-bucket rate limiter, one critical section per instance
pub struct RateLimiter {
    config: RateLimiterConfig,
    state: Mutex<BucketState>,
}

impl RateLimiter {
    pub fn new(config: RateLimiterConfig) -> Self {
        let tokens = config.burst_size;
        Self {
            config,
            state: Mutex::new(BucketState {
                tokens,
                last_refill: Instant::now(),
                total_requests: 0,
                throttled_requests: 0,
                total_wait: Duration::ZERO,
            }),
        }
    }

    fn refill(&self, state: &mut BucketState) {
        let now = Instant::now();
        let elapsed = now.saturating_duration_since(state.last_refill);
        state.tokens = (state.tokens + elapsed.as_secs_f64() * self.config.requests_per_second)
            .min(self.config.burst_size);
        state.last_refill = now;
    }

    /// Suspend until `cost` tokens are available, then deduct them
    pub async fn acquire(&self, cost: f64) {
        let started = Instant::now();
        let mut counted = false;
        let mut throttled = false;

        loop {
            let wait = {
                let mut state = self.state.lock().await;
                self.refill(&mut state);
                if !counted {
                    state.total_requests += 1;
                    counted = true;
                }
                if state.tokens >= cost {
                    state.tokens -= cost;
                    if throttled {
                        state.throttled_requests += 1;
                        state.total_wait += started.elapsed();
                    }
                    return;
                }
                if !throttled {
                    throttled = true;
                    debug!(cost, available = state.tokens, "Rate limit throttling request");
                }
                let deficit = cost - state.tokens;
                Duration::from_secs_f64(deficit / self.config.requests_per_second)
            };
            tokio::time::sleep(wait).await;
        }
    }

    /// Non-blocking check: would an acquire of `cost` have to wait?
    pub async fn would_throttle(&self, cost: f64) -> bool {
        let mut state = self.state.lock().await;
        self.refill(&mut state);
        state.tokens < cost
    }

    /// Restore a full bucket and zero the metrics
    pub async fn reset(&self) {
        let mut state = self.state.lock().await;
        state.tokens = self.config.burst_size;
        state.last_refill = Instant::now();
        state.total_requests = 0;
        state.throttled_requests = 0;
        state.total_wait = Duration::ZERO;
    }

    pub async fn get_stats(&self) -> RateLimiterStats {
        let mut state = self.state.lock().await;
        self.refill(&mut state);
        let average_wait_ms = if state.throttled_requests > 0 {
            state.total_wait.as_millis() as f64 / state.throttled_requests as f64
        } else {
            0.0
        };
        let missing = self.config.burst_size - state.tokens;
        RateLimiterStats {
            total_requests: state.total_requests,
            throttled_requests: state.throttled_requests,
            average_wait_ms,
            available_tokens: state.tokens,
            burst_size: self.config.burst_size,
            requests_per_second: self.config.requests_per_second,
            ms_until_full: ((missing / self.config.requests_per_second) * 1000.0) as u64,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn limiter(rps: f64, burst: f64) -> RateLimiter {
        RateLimiter::new(RateLimiterConfig {
            requests_per_second: rps,
            burst_size: burst,
        })
    }

    #[tokio::test(start_paused = true)]
    async fn test_burst_admitted_without_waiting() {
        let l = limiter(10.0, 5.0);
        let start = Instant::now();
        for _ in 0..5 {
            l.acquire(1.0).await;
        }
        assert_eq!(Instant::now(), start, "burst acquires must not sleep");
    }

    #[tokio::test(start_paused = true)]
    async fn test_next_acquire_waits_one_period() {
        let l = limiter(10.0, 5.0);
        for _ in 0..5 {
            l.acquire(1.0).await;
        }

        let start = Instant::now();
        l.acquire(1.0).await;
        let waited = start.elapsed();
        // ~1/rps = 100ms
        assert!(waited >= Duration::from_millis(90), "waited {:?}", waited);
        assert!(waited <= Duration::from_millis(250), "waited {:?}", waited);
    }

    #[tokio::test(start_paused = true)]
    async fn test_would_throttle() {
        let l = limiter(10.0, 2.0);
        assert!(!l.would_throttle(1.0).await);
        l.acquire(2.0).await;
        assert!(l.would_throttle(1.0).await);
    }

    #[tokio::test(start_paused = true)]
    async fn test_tokens_capped_at_burst() {
        let l = limiter(100.0, 3.0);
        tokio::time::sleep(Duration::from_secs(10)).await;
        let stats = l.get_stats().await;
        assert!(stats.available_tokens <= 3.0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_reset_restores_tokens_and_zeroes_metrics() {
        let l = limiter(10.0, 2.0);
        l.acquire(2.0).await;
        l.acquire(1.0).await; // throttled

        let stats = l.get_stats().await;
        assert_eq!(stats.total_requests, 2);
        assert_eq!(stats.throttled_requests, 1);

        l.reset().await;
        let stats = l.get_stats().await;
        assert_eq!(stats.total_requests, 0);
        assert_eq!(stats.throttled_requests, 0);
        assert!((stats.available_tokens - 2.0).abs() < f64::EPSILON);
    }

    #[tokio::test(start_paused = true)]
    async fn test_no_overdraft_under_concurrency() {
        let l = Arc::new(limiter(1_000.0, 5.0));

        let mut handles = Vec::new();
        for _ in 0..20 {
            let l = l.clone();
            handles.push(tokio::spawn(async move {
                l.acquire(1.0).await;
            }));
        }
        futures::future::join_all(handles).await;

        let stats = l.get_stats().await;
        assert_eq!(stats.total_requests, 20);
        assert!(stats.available_tokens >= 0.0);
        assert!(stats.available_tokens <= 5.0);
    }
}
