//! Circuit breaker guarding the submission path
//!
//! Closed passes traffic, open blocks it, half-open lets a limited number of
//! probes through. Recovery is a stored deadline checked on access rather
//! than a spawned timer, so `close()`/`reset()` cancel it by clearing state.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Mutex;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{info, warn};

use crate::error::{Error, Result};

const MAX_TRANSITION_HISTORY: usize = 50;

/// Breaker state machine positions
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

impl std::fmt::Display for CircuitState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CircuitState::Closed => write!(f, "closed"),
            CircuitState::Open => write!(f, "open"),
            CircuitState::HalfOpen => write!(f, "half-open"),
        }
    }
}

/// Circuit breaker configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CircuitBreakerConfig {
    /// Consecutive failures before the circuit opens
    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: u32,
    /// How long the circuit stays open before probing recovery
    #[serde(default = "default_recovery_timeout_ms")]
    pub recovery_timeout_ms: u64,
    /// Probes allowed while half-open
    #[serde(default = "default_half_open_attempts")]
    pub half_open_attempts: u32,
}

fn default_failure_threshold() -> u32 {
    5
}
fn default_recovery_timeout_ms() -> u64 {
    30_000
}
fn default_half_open_attempts() -> u32 {
    2
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: default_failure_threshold(),
            recovery_timeout_ms: default_recovery_timeout_ms(),
            half_open_attempts: default_half_open_attempts(),
        }
    }
}

/// One recorded state transition
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransitionRecord {
    pub from: CircuitState,
    pub to: CircuitState,
    pub at: DateTime<Utc>,
}

/// Counters and history, for observability only
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BreakerStats {
    pub total_successes: u64,
    pub total_failures: u64,
    pub times_opened: u64,
    pub transitions: Vec<TransitionRecord>,
}

/// Exportable operational snapshot; re-importable via
/// [`CircuitBreaker::from_snapshot`]
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BreakerSnapshot {
    pub state: CircuitState,
    pub consecutive_failures: u32,
    pub half_open_trials: u32,
    pub open_remaining_ms: Option<u64>,
    pub last_failure_ms_ago: Option<u64>,
    pub stats: BreakerStats,
}

/// Human-readable operational summary (display-only)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FailureStatus {
    pub status: String,
    pub healthy: bool,
    pub recommendation: String,
    pub consecutive_failures: u32,
    pub seconds_until_probe: Option<u64>,
}

struct BreakerInner {
    state: CircuitState,
    consecutive_failures: u32,
    half_open_trials: u32,
    last_failure_at: Option<Instant>,
    open_until: Option<Instant>,
    stats: BreakerStats,
}

impl BreakerInner {
    fn change_state(&mut self, to: CircuitState) {
        if self.state == to {
            return;
        }
        let from = self.state;
        self.state = to;
        self.stats.transitions.push(TransitionRecord {
            from,
            to,
            at: Utc::now(),
        });
        if self.stats.transitions.len() > MAX_TRANSITION_HISTORY {
            self.stats.transitions.remove(0);
        }
        info!(from = %from, to = %to, "Circuit breaker transition");
    }

    /// open -> half-open once the recovery deadline has passed
    fn refresh(&mut self) {
        if self.state == CircuitState::Open {
            if let Some(until) = self.open_until {
                if Instant::now() >= until {
                    self.change_state(CircuitState::HalfOpen);
                    self.half_open_trials = 0;
                    self.open_until = None;
                }
            }
        }
    }

    fn schedule_recovery(&mut self, timeout: Duration) {
        self.open_until = Some(Instant::now() + timeout);
    }
}

/// Failure-history state machine gating the submission path
pub struct CircuitBreaker {
    config: CircuitBreakerConfig,
    inner: Mutex<BreakerInner>,
}

impl CircuitBreaker {
    pub fn new(config: CircuitBreakerConfig) -> Self {
        Self {
            config,
            inner: Mutex::new(BreakerInner {
                state: CircuitState::Closed,
                consecutive_failures: 0,
                half_open_trials: 0,
                last_failure_at: None,
                open_until: None,
                stats: BreakerStats::default(),
            }),
        }
    }

    /// Rebuild a breaker from an exported snapshot
    pub fn from_snapshot(config: CircuitBreakerConfig, snapshot: BreakerSnapshot) -> Self {
        let now = Instant::now();
        Self {
            config,
            inner: Mutex::new(BreakerInner {
                state: snapshot.state,
                consecutive_failures: snapshot.consecutive_failures,
                half_open_trials: snapshot.half_open_trials,
                last_failure_at: snapshot
                    .last_failure_ms_ago
                    .map(|ms| now - Duration::from_millis(ms)),
                open_until: snapshot
                    .open_remaining_ms
                    .map(|ms| now + Duration::from_millis(ms)),
                stats: snapshot.stats,
            }),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, BreakerInner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Whether a request may proceed right now
    pub fn should_allow(&self) -> bool {
        let mut inner = self.lock();
        inner.refresh();
        match inner.state {
            CircuitState::Closed => true,
            CircuitState::Open => false,
            CircuitState::HalfOpen => inner.half_open_trials < self.config.half_open_attempts,
        }
    }

    /// Gate check returning the typed blocked error when the circuit is open
    pub fn check(&self) -> Result<()> {
        let mut inner = self.lock();
        inner.refresh();
        let allowed = match inner.state {
            CircuitState::Closed => true,
            CircuitState::Open => false,
            CircuitState::HalfOpen => inner.half_open_trials < self.config.half_open_attempts,
        };
        if allowed {
            if inner.state == CircuitState::HalfOpen {
                inner.half_open_trials += 1;
            }
            Ok(())
        } else {
            let retry_after_ms = inner
                .open_until
                .map(|u| u.saturating_duration_since(Instant::now()).as_millis() as u64)
                .unwrap_or(self.config.recovery_timeout_ms);
            Err(Error::CircuitOpen { retry_after_ms })
        }
    }

    /// Gate and run an operation, feeding the outcome back into the breaker
    pub async fn execute<T, F, Fut>(&self, op: F) -> Result<T>
    where
        F: FnOnce() -> Fut,
        Fut: std::future::Future<Output = Result<T>>,
    {
        self.check()?;

        match op().await {
            Ok(value) => {
                self.record_success();
                Ok(value)
            }
            Err(e) => {
                self.record_failure();
                Err(e)
            }
        }
    }

    pub fn record_success(&self) {
        let mut inner = self.lock();
        inner.refresh();
        inner.stats.total_successes += 1;
        match inner.state {
            CircuitState::HalfOpen => {
                inner.change_state(CircuitState::Closed);
                inner.consecutive_failures = 0;
                inner.open_until = None;
            }
            CircuitState::Closed => {
                inner.consecutive_failures = 0;
            }
            CircuitState::Open => {}
        }
    }

    pub fn record_failure(&self) {
        let mut inner = self.lock();
        inner.refresh();
        inner.stats.total_failures += 1;
        inner.last_failure_at = Some(Instant::now());
        match inner.state {
            CircuitState::Closed => {
                inner.consecutive_failures += 1;
                if inner.consecutive_failures >= self.config.failure_threshold {
                    warn!(
                        failures = inner.consecutive_failures,
                        "Failure threshold breached, opening circuit"
                    );
                    inner.change_state(CircuitState::Open);
                    inner.stats.times_opened += 1;
                    inner.schedule_recovery(Duration::from_millis(self.config.recovery_timeout_ms));
                }
            }
            CircuitState::HalfOpen => {
                warn!("Probe failed, reopening circuit");
                inner.change_state(CircuitState::Open);
                inner.stats.times_opened += 1;
                inner.schedule_recovery(Duration::from_millis(self.config.recovery_timeout_ms));
            }
            CircuitState::Open => {
                inner.consecutive_failures += 1;
            }
        }
    }

    /// Operator override: force the circuit open
    pub fn open(&self) {
        let mut inner = self.lock();
        inner.change_state(CircuitState::Open);
        inner.stats.times_opened += 1;
        inner.schedule_recovery(Duration::from_millis(self.config.recovery_timeout_ms));
    }

    /// Operator override: force the circuit closed
    pub fn close(&self) {
        let mut inner = self.lock();
        inner.change_state(CircuitState::Closed);
        inner.consecutive_failures = 0;
        inner.half_open_trials = 0;
        inner.open_until = None;
    }

    /// Clear counters without emitting a transition record
    pub fn reset(&self) {
        let mut inner = self.lock();
        inner.state = CircuitState::Closed;
        inner.consecutive_failures = 0;
        inner.half_open_trials = 0;
        inner.open_until = None;
        inner.last_failure_at = None;
        inner.stats = BreakerStats::default();
    }

    pub fn get_state(&self) -> CircuitState {
        let mut inner = self.lock();
        inner.refresh();
        inner.state
    }

    pub fn get_stats(&self) -> BreakerStats {
        self.lock().stats.clone()
    }

    /// Exportable snapshot of the full operational state
    pub fn export_snapshot(&self) -> BreakerSnapshot {
        let mut inner = self.lock();
        inner.refresh();
        let now = Instant::now();
        BreakerSnapshot {
            state: inner.state,
            consecutive_failures: inner.consecutive_failures,
            half_open_trials: inner.half_open_trials,
            open_remaining_ms: inner
                .open_until
                .map(|u| u.saturating_duration_since(now).as_millis() as u64),
            last_failure_ms_ago: inner
                .last_failure_at
                .map(|t| now.saturating_duration_since(t).as_millis() as u64),
            stats: inner.stats.clone(),
        }
    }

    /// Display-only operational summary; never consulted by control logic
    pub fn get_failure_status(&self) -> FailureStatus {
        let mut inner = self.lock();
        inner.refresh();
        let seconds_until_probe = inner
            .open_until
            .map(|u| u.saturating_duration_since(Instant::now()).as_secs());
        let (status, healthy, recommendation) = match inner.state {
            CircuitState::Closed => (
                "operational",
                true,
                "No action needed".to_string(),
            ),
            CircuitState::Open => (
                "blocking",
                false,
                format!(
                    "Submissions paused after {} consecutive failures; probe in ~{}s",
                    inner.consecutive_failures,
                    seconds_until_probe.unwrap_or(0)
                ),
            ),
            CircuitState::HalfOpen => (
                "probing",
                false,
                "Recovery probes in flight; avoid manual intervention".to_string(),
            ),
        };
        FailureStatus {
            status: status.to_string(),
            healthy,
            recommendation,
            consecutive_failures: inner.consecutive_failures,
            seconds_until_probe,
        }
    }
}
