//! CLI command implementations

use anyhow::Result;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::behavior::{ArchetypeRegistry, TimingEngine};
use crate::breaker::CircuitBreaker;
use crate::config::Config;
use crate::limiter::RateLimiter;
use crate::nonce::NonceManager;
use crate::orchestrator::{ExecutionEvent, Orchestrator, TickAssignment};
use crate::provider::MockProvider;
use crate::retry::RetryManager;
use crate::wallet::{DeterministicKeySource, WalletFarm};

/// Derive a component-specific seed from the base simulation seed, so sibling
/// components never consume each other's random streams
fn component_seed(base: Option<u64>, offset: u64) -> Option<u64> {
    base.map(|s| s.wrapping_add(offset))
}

/// Run the load simulation until the configured duration elapses or Ctrl-C
pub async fn run(config: &Config) -> Result<()> {
    let seed = config.simulation.seed;
    match seed {
        Some(s) => info!(seed = s, "Starting seeded simulation run"),
        None => info!("Starting entropy-seeded simulation run"),
    }

    let farm = Arc::new(WalletFarm::new(
        config.farm.wallet_count,
        Arc::new(DeterministicKeySource::new(&config.farm.seed_phrase)),
    ));
    let provider = Arc::new(MockProvider::new(
        config.mock_provider.clone(),
        component_seed(seed, 0),
    ));
    let nonce = Arc::new(NonceManager::with_cooldown(
        farm.clone(),
        provider.clone(),
        Duration::from_millis(config.nonce.sync_cooldown_ms),
    ));
    let limiter = Arc::new(RateLimiter::new(config.rate_limiter.clone()));
    let breaker = Arc::new(CircuitBreaker::new(config.circuit_breaker.clone()));
    let retry = Arc::new(RetryManager::with_seed(
        config.retry.clone(),
        component_seed(seed, 1),
    ));
    let archetypes = Arc::new(ArchetypeRegistry::new(component_seed(seed, 2)));
    let timing = Arc::new(TimingEngine::new(
        config.timing.clone(),
        component_seed(seed, 3),
    ));

    // Archetypes and chains are dealt round-robin across the farm
    let assignments: Vec<TickAssignment> = (0..config.farm.wallet_count)
        .map(|wallet| TickAssignment {
            wallet,
            chain: config.simulation.chains[wallet as usize % config.simulation.chains.len()]
                .clone(),
            archetype: config.simulation.archetypes
                [wallet as usize % config.simulation.archetypes.len()]
            .clone(),
        })
        .collect();
    for name in &config.simulation.archetypes {
        // Fail before spawning anything if a configured archetype is unknown
        archetypes.get(name)?;
    }

    let (event_tx, mut event_rx) = mpsc::unbounded_channel();
    let tally = tokio::spawn(async move {
        let (mut completed, mut failed, mut skipped, mut retried) = (0u64, 0u64, 0u64, 0u64);
        while let Some(event) = event_rx.recv().await {
            match event {
                ExecutionEvent::Completed { .. } => completed += 1,
                ExecutionEvent::Failed { .. } => failed += 1,
                ExecutionEvent::Skipped { .. } => skipped += 1,
                ExecutionEvent::Retrying { .. } => retried += 1,
                ExecutionEvent::PhaseChanged { .. } => {}
            }
        }
        (completed, failed, skipped, retried)
    });

    let orchestrator = Arc::new(Orchestrator::new(
        farm,
        nonce,
        limiter,
        breaker,
        retry,
        archetypes,
        timing,
        provider,
        config.simulation.operations.clone(),
        Some(event_tx),
    ));

    let cancel = CancellationToken::new();
    let runner = tokio::spawn(orchestrator.clone().run(assignments, cancel.clone()));

    let duration = config.simulation.duration_secs;
    if duration > 0 {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("Ctrl-C received, shutting down");
            }
            _ = tokio::time::sleep(Duration::from_secs(duration)) => {
                info!(duration_secs = duration, "Configured duration elapsed, shutting down");
            }
        }
    } else {
        tokio::signal::ctrl_c().await?;
        info!("Ctrl-C received, shutting down");
    }
    cancel.cancel();
    runner.await?;

    let snapshot = orchestrator.status_snapshot().await;
    drop(orchestrator);
    let (completed, failed, skipped, retried) = tally.await?;

    println!("\n=== SIMULATION SUMMARY ===\n");
    println!("Confirmed:  {}", completed);
    println!("Failed:     {}", failed);
    println!("Skipped:    {}", skipped);
    println!("Retries:    {}", retried);
    println!("\n=== COMPONENT STATE ===\n");
    println!("{}", serde_json::to_string_pretty(&snapshot)?);

    if failed > completed {
        warn!(completed, failed, "Run ended with more failures than confirmations");
    }
    Ok(())
}

/// Show the effective configuration after file and environment layering
pub fn show_config(config: &Config) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(config)?);
    Ok(())
}

/// List the available archetypes and timing profiles
pub fn archetypes() -> Result<()> {
    let registry = ArchetypeRegistry::new(None);

    println!("\n=== ARCHETYPES ===\n");
    for name in registry.names() {
        let profile = registry.get(&name)?;
        let operations = if profile.preferred_operations.is_empty() {
            "any".to_string()
        } else {
            profile.preferred_operations.join(", ")
        };
        println!("{}", name);
        println!("  frequency:  {:?}", profile.frequency);
        println!("  volume:     {:?}", profile.volume);
        println!(
            "  think time: {}-{}ms, skips {:.0}% of ticks",
            profile.delay_range.0,
            profile.delay_range.1,
            profile.skip_probability * 100.0
        );
        if profile.burst_enabled {
            println!(
                "  bursts:     {:.0}% chance of {}-{} transactions",
                profile.burst_probability * 100.0,
                profile.burst_size_range.0,
                profile.burst_size_range.1
            );
        }
        println!("  operations: {}", operations);
        println!(
            "  value:      {}-{}",
            profile.transaction_size_range.0, profile.transaction_size_range.1
        );
        println!();
    }

    let timing = TimingEngine::new(Default::default(), None);
    println!("=== TIMING PROFILES ===\n");
    for name in timing.profile_names() {
        println!("  {}", name);
    }
    println!();
    Ok(())
}
