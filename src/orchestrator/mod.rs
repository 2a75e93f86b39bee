//! Execution orchestrator
//!
//! Composes the full tick for one wallet: the archetype decides whether to
//! act, the timing engine decides when, the rate limiter admits the attempt,
//! the circuit breaker gates it, the nonce manager allocates a sequence
//! number, and the retry manager drives submission with nonce-aware recovery.
//! Outcomes feed back into the breaker and the wallet's history.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::behavior::{ArchetypeRegistry, DelaySpec, TimingEngine};
use crate::breaker::{BreakerSnapshot, CircuitBreaker, FailureStatus};
use crate::error::{Error, ErrorClass, FailureReport, Result};
use crate::limiter::{RateLimiter, RateLimiterStats};
use crate::nonce::{NonceManager, NonceSlotDebug};
use crate::provider::{ChainProvider, SignedTransaction};
use crate::retry::{RetryDecision, RetryManager, RetryStats};
use crate::wallet::{TransactionRecord, WalletFarm};

/// Ordered lifecycle phases of one transaction
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum TxPhase {
    Preparing,
    Validating,
    EstimatingGas,
    Signing,
    Broadcasting,
    Pending,
    Confirming,
    Confirmed,
    Failed,
}

/// Mutable record of one transaction's journey through the pipeline
#[derive(Debug, Clone, Serialize)]
pub struct TransactionLifecycle {
    pub id: String,
    pub wallet: u32,
    pub chain: String,
    pub archetype: String,
    pub operation: String,
    pub phase: TxPhase,
    pub attempt: u32,
    pub max_attempts: u32,
    pub nonce: Option<u64>,
    pub error: Option<FailureReport>,
    pub started_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl TransactionLifecycle {
    fn new(wallet: u32, chain: &str, archetype: &str, operation: &str, max_attempts: u32) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4().to_string(),
            wallet,
            chain: chain.to_string(),
            archetype: archetype.to_string(),
            operation: operation.to_string(),
            phase: TxPhase::Preparing,
            attempt: 0,
            max_attempts,
            nonce: None,
            error: None,
            started_at: now,
            updated_at: now,
        }
    }
}

/// Stream of progress events for the UI/store/transport layer
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "kind", rename_all = "kebab-case")]
pub enum ExecutionEvent {
    Skipped {
        wallet: u32,
        archetype: String,
    },
    PhaseChanged {
        id: String,
        wallet: u32,
        chain: String,
        phase: TxPhase,
        attempt: u32,
    },
    Retrying {
        id: String,
        attempt: u32,
        delay_ms: u64,
        error: String,
    },
    Completed {
        lifecycle: TransactionLifecycle,
        tx_hash: String,
    },
    Failed {
        lifecycle: TransactionLifecycle,
    },
}

/// Result of one wallet tick (a burst yields several)
#[derive(Debug, Clone)]
pub enum TickOutcome {
    Skipped,
    Completed(TransactionLifecycle),
    Failed(TransactionLifecycle),
}

/// Which wallet plays which archetype on which chain
#[derive(Debug, Clone)]
pub struct TickAssignment {
    pub wallet: u32,
    pub chain: String,
    pub archetype: String,
}

/// Aggregate operational state for dashboards
#[derive(Debug, Clone, Serialize)]
pub struct StatusSnapshot {
    pub breaker: BreakerSnapshot,
    pub breaker_status: FailureStatus,
    pub limiter: RateLimiterStats,
    pub nonces: HashMap<String, NonceSlotDebug>,
    pub retry: RetryStats,
    pub recorded_transactions: usize,
    pub generated_at: DateTime<Utc>,
}

/// Composition layer driving wallet ticks through all components
pub struct Orchestrator {
    farm: Arc<WalletFarm>,
    nonce: Arc<NonceManager>,
    limiter: Arc<RateLimiter>,
    breaker: Arc<CircuitBreaker>,
    retry: Arc<RetryManager>,
    archetypes: Arc<ArchetypeRegistry>,
    timing: Arc<TimingEngine>,
    provider: Arc<dyn ChainProvider>,
    operations: Vec<String>,
    events: Option<mpsc::UnboundedSender<ExecutionEvent>>,
}

impl Orchestrator {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        farm: Arc<WalletFarm>,
        nonce: Arc<NonceManager>,
        limiter: Arc<RateLimiter>,
        breaker: Arc<CircuitBreaker>,
        retry: Arc<RetryManager>,
        archetypes: Arc<ArchetypeRegistry>,
        timing: Arc<TimingEngine>,
        provider: Arc<dyn ChainProvider>,
        operations: Vec<String>,
        events: Option<mpsc::UnboundedSender<ExecutionEvent>>,
    ) -> Self {
        Self {
            farm,
            nonce,
            limiter,
            breaker,
            retry,
            archetypes,
            timing,
            provider,
            operations,
            events,
        }
    }

    fn emit(&self, event: ExecutionEvent) {
        if let Some(tx) = &self.events {
            let _ = tx.send(event);
        }
    }

    fn advance(&self, lifecycle: &Mutex<TransactionLifecycle>, phase: TxPhase) {
        let mut lc = lifecycle.lock().unwrap_or_else(|e| e.into_inner());
        lc.phase = phase;
        lc.updated_at = Utc::now();
        self.emit(ExecutionEvent::PhaseChanged {
            id: lc.id.clone(),
            wallet: lc.wallet,
            chain: lc.chain.clone(),
            phase,
            attempt: lc.attempt,
        });
    }

    /// One behavioral tick for a wallet: maybe skip, pace like a human, then
    /// run one transaction (or a burst of them)
    pub async fn run_tick(
        &self,
        wallet: u32,
        chain: &str,
        archetype: &str,
    ) -> Result<Vec<TickOutcome>> {
        let delay_range = self.archetypes.get(archetype)?.delay_range;
        let skip = self.archetypes.should_skip_interaction(archetype)?;

        // Think time passes whether or not the wallet ends up acting
        self.timing.human_delay(DelaySpec::from(delay_range)).await?;

        if skip {
            debug!(wallet, archetype, "Tick skipped");
            self.emit(ExecutionEvent::Skipped {
                wallet,
                archetype: archetype.to_string(),
            });
            return Ok(vec![TickOutcome::Skipped]);
        }

        let burst = if self.archetypes.should_burst(archetype)? {
            self.archetypes.burst_size(archetype)?.max(1)
        } else {
            1
        };

        let mut outcomes = Vec::with_capacity(burst as usize);
        for i in 0..burst {
            outcomes.push(self.execute_once(wallet, chain, archetype).await?);
            if i + 1 < burst {
                self.timing.human_delay("burst-gap").await?;
            }
        }
        Ok(outcomes)
    }

    /// Drive a single transaction through the full pipeline
    async fn execute_once(
        &self,
        wallet: u32,
        chain: &str,
        archetype: &str,
    ) -> Result<TickOutcome> {
        let operation = match self.archetypes.pick_operation(archetype, &self.operations)? {
            Some(op) => op,
            None => {
                debug!(wallet, archetype, "No suitable operation available");
                return Ok(TickOutcome::Skipped);
            }
        };
        let params = self.archetypes.generate_parameters(archetype)?;
        let address = self.farm.address(wallet)?;

        let lifecycle = Mutex::new(TransactionLifecycle::new(
            wallet,
            chain,
            archetype,
            &operation,
            self.retry.max_attempts(),
        ));
        let lc = &lifecycle;
        self.advance(lc, TxPhase::Validating);

        self.limiter.acquire(1.0).await;

        let tx_params = params.clone();
        let result = self
            .retry
            .execute_with_custom_retry(
                move |attempt: u32| {
                    let address = address.clone();
                    let operation = operation.clone();
                    let params = tx_params.clone();
                    async move {
                        {
                            let mut state = lc.lock().unwrap_or_else(|e| e.into_inner());
                            state.attempt = attempt;
                        }
                        // Gate every attempt; an open circuit fails fast
                        self.breaker.check()?;

                        self.advance(lc, TxPhase::EstimatingGas);
                        self.advance(lc, TxPhase::Signing);

                        let lease = self.nonce.acquire(wallet, chain).await?;
                        {
                            let mut state = lc.lock().unwrap_or_else(|e| e.into_inner());
                            state.nonce = Some(lease.nonce());
                        }
                        self.advance(lc, TxPhase::Broadcasting);

                        let tx = SignedTransaction {
                            from: address,
                            chain: chain.to_string(),
                            nonce: lease.nonce(),
                            operation,
                            value: params.value,
                            gas_multiplier: params.gas_multiplier,
                        };
                        match self.provider.submit(&tx).await {
                            Ok(receipt) => {
                                lease.release();
                                self.breaker.record_success();
                                Ok(receipt)
                            }
                            Err(e) => {
                                drop(lease);
                                self.breaker.record_failure();
                                Err(e)
                            }
                        }
                    }
                },
                move |error: Error, attempt: u32| async move {
                    if matches!(error, Error::CircuitOpen { .. }) {
                        return RetryDecision::Abort(error);
                    }
                    let class = error.classify();
                    let retriable = class == ErrorClass::Retriable
                        || (class == ErrorClass::Unknown && self.retry.config().retry_unknown);
                    if !retriable {
                        return RetryDecision::Abort(error);
                    }
                    // Stale-nonce recovery before the next attempt
                    if let Err(e) = self.nonce.handle_nonce_error(wallet, chain, &error).await {
                        warn!(wallet, chain, error = %e, "Nonce recovery failed");
                        return RetryDecision::Abort(error);
                    }
                    let delay = self.retry.calculate_backoff(attempt);
                    {
                        let state = lc.lock().unwrap_or_else(|e| e.into_inner());
                        self.emit(ExecutionEvent::Retrying {
                            id: state.id.clone(),
                            attempt,
                            delay_ms: delay.as_millis() as u64,
                            error: error.to_string(),
                        });
                    }
                    RetryDecision::Retry(delay)
                },
            )
            .await;

        match result {
            Ok(receipt) => {
                self.advance(lc, TxPhase::Pending);
                self.advance(lc, TxPhase::Confirming);
                self.advance(lc, TxPhase::Confirmed);
                let state = lifecycle.into_inner().unwrap_or_else(|e| e.into_inner());
                self.farm.record_transaction(
                    wallet,
                    TransactionRecord {
                        chain: chain.to_string(),
                        nonce: receipt.nonce,
                        operation: state.operation.clone(),
                        value: params.value,
                        success: true,
                        tx_hash: Some(receipt.tx_hash.clone()),
                        error: None,
                        timestamp: Utc::now(),
                    },
                )?;
                info!(wallet, chain, nonce = receipt.nonce, tx = %receipt.tx_hash, "Transaction confirmed");
                self.emit(ExecutionEvent::Completed {
                    lifecycle: state.clone(),
                    tx_hash: receipt.tx_hash,
                });
                Ok(TickOutcome::Completed(state))
            }
            Err(e) => {
                let report = e.failure_report();
                let mut state = lifecycle.into_inner().unwrap_or_else(|e| e.into_inner());
                state.phase = TxPhase::Failed;
                state.error = Some(report);
                state.updated_at = Utc::now();
                self.farm.record_transaction(
                    wallet,
                    TransactionRecord {
                        chain: chain.to_string(),
                        nonce: state.nonce.unwrap_or(0),
                        operation: state.operation.clone(),
                        value: params.value,
                        success: false,
                        tx_hash: None,
                        error: Some(e.to_string()),
                        timestamp: Utc::now(),
                    },
                )?;
                warn!(wallet, chain, error = %e, "Transaction failed terminally");
                self.emit(ExecutionEvent::Failed {
                    lifecycle: state.clone(),
                });
                Ok(TickOutcome::Failed(state))
            }
        }
    }

    /// Run tick loops for all assignments until cancelled
    pub async fn run(self: Arc<Self>, assignments: Vec<TickAssignment>, cancel: CancellationToken) {
        info!(tasks = assignments.len(), "Starting wallet tick loops");
        let mut handles = Vec::with_capacity(assignments.len());
        for assignment in assignments {
            let orch = Arc::clone(&self);
            let cancel = cancel.clone();
            handles.push(tokio::spawn(async move {
                loop {
                    tokio::select! {
                        _ = cancel.cancelled() => break,
                        result = orch.run_tick(
                            assignment.wallet,
                            &assignment.chain,
                            &assignment.archetype,
                        ) => {
                            if let Err(e) = result {
                                warn!(wallet = assignment.wallet, error = %e, "Tick aborted");
                            }
                        }
                    }
                }
            }));
        }
        futures::future::join_all(handles).await;
        info!("All wallet tick loops stopped");
    }

    /// Aggregate snapshot for dashboards
    pub async fn status_snapshot(&self) -> StatusSnapshot {
        StatusSnapshot {
            breaker: self.breaker.export_snapshot(),
            breaker_status: self.breaker.get_failure_status(),
            limiter: self.limiter.get_stats().await,
            nonces: self.nonce.debug_state(),
            retry: self.retry.get_stats(),
            recorded_transactions: self.farm.total_recorded(),
            generated_at: Utc::now(),
        }
    }

    pub fn farm(&self) -> &Arc<WalletFarm> {
        &self.farm
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::behavior::archetypes::{ArchetypeProfile, FrequencyClass, VolumeClass};
    use crate::behavior::TimingEngineConfig;
    use crate::breaker::{CircuitBreakerConfig, CircuitState};
    use crate::limiter::RateLimiterConfig;
    use crate::provider::{MockProvider, MockProviderConfig};
    use crate::retry::RetryConfig;
    use crate::wallet::DeterministicKeySource;
    use std::time::Duration;

    fn eager_profile(burst: bool) -> ArchetypeProfile {
        ArchetypeProfile {
            frequency: FrequencyClass::Frequent,
            volume: VolumeClass::Low,
            delay_range: (1, 2),
            skip_probability: 0.0,
            burst_enabled: burst,
            burst_probability: if burst { 1.0 } else { 0.0 },
            burst_size_range: (2, 2),
            preferred_operations: Vec::new(),
            transaction_size_range: (0.1, 0.2),
        }
    }

    fn lazy_profile() -> ArchetypeProfile {
        ArchetypeProfile {
            skip_probability: 1.0,
            ..eager_profile(false)
        }
    }

    struct Harness {
        orchestrator: Arc<Orchestrator>,
        provider: Arc<MockProvider>,
        breaker: Arc<CircuitBreaker>,
        events: mpsc::UnboundedReceiver<ExecutionEvent>,
    }

    fn harness(failure_threshold: u32, retry: RetryConfig) -> Harness {
        let provider = Arc::new(MockProvider::new(
            MockProviderConfig {
                failure_rate: 0.0,
                min_latency_ms: 0,
                max_latency_ms: 0,
            },
            Some(5),
        ));
        let farm = Arc::new(WalletFarm::new(
            4,
            Arc::new(DeterministicKeySource::new("orchestrator tests")),
        ));
        let nonce = Arc::new(NonceManager::new(farm.clone(), provider.clone()));
        let limiter = Arc::new(RateLimiter::new(RateLimiterConfig {
            requests_per_second: 1_000.0,
            burst_size: 100.0,
        }));
        let breaker = Arc::new(CircuitBreaker::new(CircuitBreakerConfig {
            failure_threshold,
            recovery_timeout_ms: 60_000,
            half_open_attempts: 1,
        }));
        let retry = Arc::new(RetryManager::with_seed(retry, Some(5)));

        let mut archetypes = ArchetypeRegistry::new(Some(5));
        archetypes.register("eager", eager_profile(false)).unwrap();
        archetypes.register("bursty", eager_profile(true)).unwrap();
        archetypes.register("lazy", lazy_profile()).unwrap();
        let archetypes = Arc::new(archetypes);

        let timing = Arc::new(TimingEngine::new(
            TimingEngineConfig {
                multiplier: 1.0,
                jitter_pct: 0.0,
            },
            Some(5),
        ));

        let (tx, rx) = mpsc::unbounded_channel();
        let orchestrator = Arc::new(Orchestrator::new(
            farm,
            nonce,
            limiter,
            breaker.clone(),
            retry,
            archetypes,
            timing,
            provider.clone(),
            vec!["transfer".to_string(), "swap".to_string()],
            Some(tx),
        ));

        Harness {
            orchestrator,
            provider,
            breaker,
            events: rx,
        }
    }

    fn drain(events: &mut mpsc::UnboundedReceiver<ExecutionEvent>) -> Vec<ExecutionEvent> {
        let mut out = Vec::new();
        while let Ok(e) = events.try_recv() {
            out.push(e);
        }
        out
    }

    #[tokio::test(start_paused = true)]
    async fn test_happy_path_tick() {
        let mut h = harness(5, RetryConfig::default());
        let outcomes = h
            .orchestrator
            .run_tick(0, "devnet", "eager")
            .await
            .unwrap();

        assert_eq!(outcomes.len(), 1);
        let lc = match &outcomes[0] {
            TickOutcome::Completed(lc) => lc,
            other => panic!("expected Completed, got {:?}", other),
        };
        assert_eq!(lc.phase, TxPhase::Confirmed);
        assert_eq!(lc.attempt, 1);
        assert_eq!(lc.nonce, Some(0));

        let history = h.orchestrator.farm().history(0, "devnet");
        assert_eq!(history.len(), 1);
        assert!(history[0].success);

        let events = drain(&mut h.events);
        assert!(matches!(events.last(), Some(ExecutionEvent::Completed { .. })));
    }

    #[tokio::test(start_paused = true)]
    async fn test_skip_produces_no_transaction() {
        let mut h = harness(5, RetryConfig::default());
        let outcomes = h.orchestrator.run_tick(0, "devnet", "lazy").await.unwrap();
        assert!(matches!(outcomes[0], TickOutcome::Skipped));
        assert_eq!(h.orchestrator.farm().history(0, "devnet").len(), 0);

        let events = drain(&mut h.events);
        assert!(matches!(events.first(), Some(ExecutionEvent::Skipped { .. })));
    }

    #[tokio::test(start_paused = true)]
    async fn test_burst_runs_multiple_transactions() {
        let h = harness(5, RetryConfig::default());
        let outcomes = h
            .orchestrator
            .run_tick(1, "devnet", "bursty")
            .await
            .unwrap();
        assert_eq!(outcomes.len(), 2);
        assert_eq!(h.orchestrator.farm().history(1, "devnet").len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_transient_failure_retried_to_success() {
        let mut h = harness(10, RetryConfig::default());
        h.provider.fail_next("request timeout");

        let outcomes = h
            .orchestrator
            .run_tick(0, "devnet", "eager")
            .await
            .unwrap();
        let lc = match &outcomes[0] {
            TickOutcome::Completed(lc) => lc,
            other => panic!("expected Completed, got {:?}", other),
        };
        assert_eq!(lc.attempt, 2);

        let events = drain(&mut h.events);
        assert!(events
            .iter()
            .any(|e| matches!(e, ExecutionEvent::Retrying { attempt: 1, .. })));
    }

    #[tokio::test(start_paused = true)]
    async fn test_nonce_conflict_resyncs_and_recovers() {
        let h = harness(10, RetryConfig::default());
        // Chain state is ahead of what the first submission will carry
        let address = h.orchestrator.farm().address(0).unwrap();
        h.provider.fail_next("nonce too low: expected 4, got 0");
        h.provider.set_pending_nonce("devnet", &address, 4);

        let outcomes = h
            .orchestrator
            .run_tick(0, "devnet", "eager")
            .await
            .unwrap();
        let lc = match &outcomes[0] {
            TickOutcome::Completed(lc) => lc,
            other => panic!("expected Completed, got {:?}", other),
        };
        assert_eq!(lc.attempt, 2);
        assert_eq!(lc.nonce, Some(4));
    }

    #[tokio::test(start_paused = true)]
    async fn test_terminal_failure_not_retried() {
        let mut h = harness(10, RetryConfig::default());
        h.provider.fail_next("insufficient funds");

        let outcomes = h
            .orchestrator
            .run_tick(0, "devnet", "eager")
            .await
            .unwrap();
        let lc = match &outcomes[0] {
            TickOutcome::Failed(lc) => lc,
            other => panic!("expected Failed, got {:?}", other),
        };
        assert_eq!(lc.phase, TxPhase::Failed);
        assert_eq!(lc.attempt, 1);
        let report = lc.error.as_ref().unwrap();
        assert!(!report.can_retry);

        let events = drain(&mut h.events);
        assert!(matches!(events.last(), Some(ExecutionEvent::Failed { .. })));
    }

    #[tokio::test(start_paused = true)]
    async fn test_breaker_trips_and_fails_fast() {
        let h = harness(2, RetryConfig::default());
        h.provider.fail_next("execution reverted: bad state");
        h.provider.fail_next("execution reverted: bad state");

        let _ = h.orchestrator.run_tick(0, "devnet", "eager").await.unwrap();
        let _ = h.orchestrator.run_tick(0, "devnet", "eager").await.unwrap();
        assert_eq!(h.breaker.get_state(), CircuitState::Open);

        // Third tick is blocked before reaching the provider
        let outcomes = h.orchestrator.run_tick(0, "devnet", "eager").await.unwrap();
        let lc = match &outcomes[0] {
            TickOutcome::Failed(lc) => lc,
            other => panic!("expected Failed, got {:?}", other),
        };
        let report = lc.error.as_ref().unwrap();
        assert_eq!(report.reason, "circuit-open");
    }

    #[tokio::test(start_paused = true)]
    async fn test_status_snapshot_aggregates() {
        let h = harness(5, RetryConfig::default());
        let _ = h.orchestrator.run_tick(0, "devnet", "eager").await.unwrap();

        let snapshot = h.orchestrator.status_snapshot().await;
        assert!(snapshot.breaker_status.healthy);
        assert_eq!(snapshot.retry.operations, 1);
        assert_eq!(snapshot.recorded_transactions, 1);
        assert!(snapshot.nonces.contains_key("wallet0:devnet"));
        assert!(snapshot.limiter.total_requests >= 1);
        // Snapshot must serialize for the transport layer
        serde_json::to_string(&snapshot).unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_loop_stops_on_cancel() {
        let h = harness(5, RetryConfig::default());
        let cancel = CancellationToken::new();
        let assignments = vec![
            TickAssignment {
                wallet: 0,
                chain: "devnet".to_string(),
                archetype: "eager".to_string(),
            },
            TickAssignment {
                wallet: 1,
                chain: "devnet".to_string(),
                archetype: "eager".to_string(),
            },
        ];

        let orch = h.orchestrator.clone();
        let runner = tokio::spawn({
            let cancel = cancel.clone();
            async move { orch.run(assignments, cancel).await }
        });

        tokio::time::sleep(Duration::from_millis(200)).await;
        cancel.cancel();
        tokio::time::timeout(Duration::from_secs(5), runner)
            .await
            .expect("run loop must stop after cancellation")
            .unwrap();

        assert!(h.orchestrator.farm().total_recorded() > 0);
    }
}
