//! Classification-driven retry with backoff
//!
//! Wraps arbitrary fallible async operations. Terminal errors abort on the
//! first attempt, unknown errors abort unless explicitly permitted, and
//! retriable errors back off (exponential / linear / constant, jittered)
//! up to the configured attempt budget.

use rand::prelude::*;
use rand::rngs::StdRng;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::{debug, warn};

use crate::error::{Error, ErrorClass, Result};

const MIN_BACKOFF: Duration = Duration::from_millis(100);

/// Delay growth curve between attempts
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackoffStrategy {
    /// base * 2^n
    Exponential,
    /// base * (n + 1)
    Linear,
    /// base
    Constant,
}

/// Retry behavior configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
    #[serde(default = "default_strategy")]
    pub strategy: BackoffStrategy,
    /// Retry errors that classify as unknown
    #[serde(default)]
    pub retry_unknown: bool,
}

fn default_max_retries() -> u32 {
    3
}
fn default_base_delay_ms() -> u64 {
    1_000
}
fn default_max_delay_ms() -> u64 {
    30_000
}
fn default_strategy() -> BackoffStrategy {
    BackoffStrategy::Exponential
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            base_delay_ms: default_base_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
            strategy: default_strategy(),
            retry_unknown: false,
        }
    }
}

/// Details handed to the per-attempt observer before each backoff wait
#[derive(Debug, Clone)]
pub struct RetryAttempt {
    pub attempt: u32,
    pub max_attempts: u32,
    pub delay: Duration,
    pub class: ErrorClass,
    pub error: String,
}

/// Observer invoked before each backoff wait; must not block
pub type AttemptCallback = Arc<dyn Fn(&RetryAttempt) + Send + Sync>;

/// Verdict from a caller-supplied retry handler.
///
/// The handler owns the error while deciding; aborting hands it back so the
/// caller still receives the original failure.
#[derive(Debug)]
pub enum RetryDecision {
    Retry(Duration),
    Abort(Error),
}

#[derive(Default)]
struct MetricsInner {
    operations: AtomicU64,
    attempts: AtomicU64,
    retries: AtomicU64,
    successes: AtomicU64,
    failures: AtomicU64,
    successes_after_retry: AtomicU64,
    retriable_errors: AtomicU64,
    terminal_errors: AtomicU64,
    unknown_errors: AtomicU64,
}

/// Point-in-time metrics snapshot (observability only, never control flow)
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RetryStats {
    pub operations: u64,
    pub attempts: u64,
    pub retries: u64,
    pub successes: u64,
    pub failures: u64,
    pub successes_after_retry: u64,
    pub retriable_errors: u64,
    pub terminal_errors: u64,
    pub unknown_errors: u64,
}

/// Executes operations with classification-driven recovery
pub struct RetryManager {
    config: RetryConfig,
    metrics: MetricsInner,
    rng: Mutex<StdRng>,
}

impl RetryManager {
    pub fn new(config: RetryConfig) -> Self {
        Self::with_seed(config, None)
    }

    pub fn with_seed(config: RetryConfig, seed: Option<u64>) -> Self {
        let rng = match seed {
            Some(s) => StdRng::seed_from_u64(s),
            None => StdRng::from_entropy(),
        };
        Self {
            config,
            metrics: MetricsInner::default(),
            rng: Mutex::new(rng),
        }
    }

    pub fn config(&self) -> &RetryConfig {
        &self.config
    }

    /// Total attempt budget (initial call plus retries)
    pub fn max_attempts(&self) -> u32 {
        self.config.max_retries + 1
    }

    /// Backoff for a 1-based attempt number, jittered ±25% and clamped to
    /// [100ms, max_delay]
    pub fn calculate_backoff(&self, attempt: u32) -> Duration {
        let n = attempt.saturating_sub(1).min(20);
        let base = self.config.base_delay_ms as f64;
        let raw = match self.config.strategy {
            BackoffStrategy::Exponential => base * (1u64 << n) as f64,
            BackoffStrategy::Linear => base * (n + 1) as f64,
            BackoffStrategy::Constant => base,
        };

        let factor = {
            let mut rng = self.rng.lock().unwrap_or_else(|e| e.into_inner());
            rng.gen_range(0.75..=1.25)
        };
        let jittered = (raw * factor) as u64;

        Duration::from_millis(jittered)
            .max(MIN_BACKOFF)
            .min(Duration::from_millis(self.config.max_delay_ms))
    }

    /// Run `op` with classification-driven retry
    pub async fn execute_with_retry<T, F, Fut>(&self, op: F) -> Result<T>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        self.execute_observed(op, None).await
    }

    /// Like [`execute_with_retry`](Self::execute_with_retry), invoking
    /// `on_attempt` before each backoff wait
    pub async fn execute_observed<T, F, Fut>(
        &self,
        mut op: F,
        on_attempt: Option<AttemptCallback>,
    ) -> Result<T>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        self.metrics.operations.fetch_add(1, Ordering::Relaxed);
        let max_attempts = self.config.max_retries + 1;
        let mut attempt = 0u32;

        loop {
            attempt += 1;
            self.metrics.attempts.fetch_add(1, Ordering::Relaxed);

            match op(attempt).await {
                Ok(value) => {
                    self.metrics.successes.fetch_add(1, Ordering::Relaxed);
                    if attempt > 1 {
                        self.metrics
                            .successes_after_retry
                            .fetch_add(1, Ordering::Relaxed);
                    }
                    return Ok(value);
                }
                Err(e) => {
                    let class = e.classify();
                    self.count_class(class);

                    let retriable = class == ErrorClass::Retriable
                        || (class == ErrorClass::Unknown && self.config.retry_unknown);

                    if !retriable {
                        debug!(attempt, class = %class, error = %e, "Aborting, error not retriable");
                        self.metrics.failures.fetch_add(1, Ordering::Relaxed);
                        return Err(e);
                    }
                    if attempt >= max_attempts {
                        warn!(attempt, error = %e, "Retries exhausted");
                        self.metrics.failures.fetch_add(1, Ordering::Relaxed);
                        return Err(Error::RetriesExhausted {
                            attempts: attempt,
                            source: Box::new(e),
                        });
                    }

                    let delay = self.calculate_backoff(attempt);
                    self.metrics.retries.fetch_add(1, Ordering::Relaxed);
                    debug!(attempt, delay_ms = delay.as_millis() as u64, error = %e, "Retrying after backoff");

                    if let Some(cb) = &on_attempt {
                        cb(&RetryAttempt {
                            attempt,
                            max_attempts,
                            delay,
                            class,
                            error: e.to_string(),
                        });
                    }
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }

    /// Delegate the retry/abort decision and the delay to the caller.
    ///
    /// For call sites needing domain-specific policy, e.g. nonce-aware
    /// retries that re-sync before the next attempt. The attempt budget
    /// still applies.
    pub async fn execute_with_custom_retry<T, F, Fut, H, HFut>(
        &self,
        mut op: F,
        mut handler: H,
    ) -> Result<T>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T>>,
        H: FnMut(Error, u32) -> HFut,
        HFut: Future<Output = RetryDecision>,
    {
        self.metrics.operations.fetch_add(1, Ordering::Relaxed);
        let max_attempts = self.config.max_retries + 1;
        let mut attempt = 0u32;

        loop {
            attempt += 1;
            self.metrics.attempts.fetch_add(1, Ordering::Relaxed);

            match op(attempt).await {
                Ok(value) => {
                    self.metrics.successes.fetch_add(1, Ordering::Relaxed);
                    if attempt > 1 {
                        self.metrics
                            .successes_after_retry
                            .fetch_add(1, Ordering::Relaxed);
                    }
                    return Ok(value);
                }
                Err(e) => {
                    self.count_class(e.classify());

                    if attempt >= max_attempts {
                        self.metrics.failures.fetch_add(1, Ordering::Relaxed);
                        return Err(Error::RetriesExhausted {
                            attempts: attempt,
                            source: Box::new(e),
                        });
                    }

                    match handler(e, attempt).await {
                        RetryDecision::Abort(e) => {
                            self.metrics.failures.fetch_add(1, Ordering::Relaxed);
                            return Err(e);
                        }
                        RetryDecision::Retry(delay) => {
                            self.metrics.retries.fetch_add(1, Ordering::Relaxed);
                            tokio::time::sleep(delay).await;
                        }
                    }
                }
            }
        }
    }

    fn count_class(&self, class: ErrorClass) {
        let counter = match class {
            ErrorClass::Retriable => &self.metrics.retriable_errors,
            ErrorClass::Terminal => &self.metrics.terminal_errors,
            ErrorClass::Unknown => &self.metrics.unknown_errors,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn get_stats(&self) -> RetryStats {
        RetryStats {
            operations: self.metrics.operations.load(Ordering::Relaxed),
            attempts: self.metrics.attempts.load(Ordering::Relaxed),
            retries: self.metrics.retries.load(Ordering::Relaxed),
            successes: self.metrics.successes.load(Ordering::Relaxed),
            failures: self.metrics.failures.load(Ordering::Relaxed),
            successes_after_retry: self.metrics.successes_after_retry.load(Ordering::Relaxed),
            retriable_errors: self.metrics.retriable_errors.load(Ordering::Relaxed),
            terminal_errors: self.metrics.terminal_errors.load(Ordering::Relaxed),
            unknown_errors: self.metrics.unknown_errors.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU32;

    fn manager(config: RetryConfig) -> RetryManager {
        RetryManager::with_seed(config, Some(42))
    }

    #[tokio::test(start_paused = true)]
    async fn test_terminal_aborts_after_one_call() {
        let m = manager(RetryConfig::default());
        let calls = AtomicU32::new(0);

        let result: Result<()> = m
            .execute_with_retry(|_| {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err(Error::Provider("insufficient funds".to_string())) }
            })
            .await;

        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_retriable_bounded_by_budget() {
        let m = manager(RetryConfig {
            max_retries: 3,
            ..Default::default()
        });
        let calls = AtomicU32::new(0);

        let result: Result<()> = m
            .execute_with_retry(|_| {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err(Error::Provider("request timeout".to_string())) }
            })
            .await;

        assert!(matches!(result, Err(Error::RetriesExhausted { attempts: 4, .. })));
        assert_eq!(calls.load(Ordering::SeqCst), 4);
    }

    #[tokio::test(start_paused = true)]
    async fn test_unknown_aborts_unless_permitted() {
        let m = manager(RetryConfig::default());
        let calls = AtomicU32::new(0);
        let result: Result<()> = m
            .execute_with_retry(|_| {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err(Error::Provider("mystery failure".to_string())) }
            })
            .await;
        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        let m = manager(RetryConfig {
            max_retries: 2,
            retry_unknown: true,
            ..Default::default()
        });
        let calls = AtomicU32::new(0);
        let _: Result<()> = m
            .execute_with_retry(|_| {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err(Error::Provider("mystery failure".to_string())) }
            })
            .await;
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_success_after_retry_counted() {
        let m = manager(RetryConfig::default());
        let calls = AtomicU32::new(0);

        let result = m
            .execute_with_retry(|attempt| {
                calls.fetch_add(1, Ordering::SeqCst);
                async move {
                    if attempt < 3 {
                        Err(Error::Provider("network glitch".to_string()))
                    } else {
                        Ok(attempt)
                    }
                }
            })
            .await
            .unwrap();

        assert_eq!(result, 3);
        let stats = m.get_stats();
        assert_eq!(stats.successes, 1);
        assert_eq!(stats.successes_after_retry, 1);
        assert_eq!(stats.retries, 2);
        assert_eq!(stats.retriable_errors, 2);
    }

    #[test]
    fn test_backoff_exponential_range() {
        let m = manager(RetryConfig {
            base_delay_ms: 1_000,
            strategy: BackoffStrategy::Exponential,
            ..Default::default()
        });
        // attempt 3 -> 4000ms nominal, ±25%
        for _ in 0..50 {
            let d = m.calculate_backoff(3).as_millis() as u64;
            assert!((3_000..=5_000).contains(&d), "got {d}");
        }
    }

    #[test]
    fn test_backoff_linear_and_constant() {
        let linear = manager(RetryConfig {
            base_delay_ms: 1_000,
            strategy: BackoffStrategy::Linear,
            ..Default::default()
        });
        for _ in 0..50 {
            let d = linear.calculate_backoff(2).as_millis() as u64;
            assert!((1_500..=2_500).contains(&d), "got {d}");
        }

        let constant = manager(RetryConfig {
            base_delay_ms: 1_000,
            strategy: BackoffStrategy::Constant,
            ..Default::default()
        });
        for _ in 0..50 {
            let d = constant.calculate_backoff(5).as_millis() as u64;
            assert!((750..=1_250).contains(&d), "got {d}");
        }
    }

    #[test]
    fn test_backoff_clamped() {
        let tiny = manager(RetryConfig {
            base_delay_ms: 10,
            strategy: BackoffStrategy::Constant,
            ..Default::default()
        });
        assert_eq!(tiny.calculate_backoff(1), Duration::from_millis(100));

        let huge = manager(RetryConfig {
            base_delay_ms: 10_000,
            max_delay_ms: 5_000,
            strategy: BackoffStrategy::Exponential,
            ..Default::default()
        });
        assert_eq!(huge.calculate_backoff(6), Duration::from_millis(5_000));
    }

    #[tokio::test(start_paused = true)]
    async fn test_attempt_callback_observes_each_wait() {
        let m = manager(RetryConfig {
            max_retries: 2,
            ..Default::default()
        });
        let seen: Arc<Mutex<Vec<u32>>> = Arc::new(Mutex::new(Vec::new()));
        let seen_cb = seen.clone();

        let _: Result<()> = m
            .execute_observed(
                |_| async { Err(Error::Provider("connection dropped".to_string())) },
                Some(Arc::new(move |a: &RetryAttempt| {
                    seen_cb.lock().unwrap().push(a.attempt);
                })),
            )
            .await;

        assert_eq!(*seen.lock().unwrap(), vec![1, 2]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_custom_handler_decides() {
        let m = manager(RetryConfig {
            max_retries: 5,
            ..Default::default()
        });
        let calls = AtomicU32::new(0);

        // Handler aborts on terminal, retries fast otherwise
        let result: Result<()> = m
            .execute_with_custom_retry(
                |attempt| {
                    calls.fetch_add(1, Ordering::SeqCst);
                    async move {
                        if attempt == 1 {
                            Err(Error::Provider("nonce too low".to_string()))
                        } else {
                            Err(Error::Provider("execution reverted".to_string()))
                        }
                    }
                },
                |e: Error, _attempt| async move {
                    if e.classify() == ErrorClass::Terminal {
                        RetryDecision::Abort(e)
                    } else {
                        RetryDecision::Retry(Duration::from_millis(1))
                    }
                },
            )
            .await;

        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }
}
