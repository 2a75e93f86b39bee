//! Configuration loading and validation

use serde::{Deserialize, Serialize};
use std::path::Path;

use crate::error::{Error, Result};

// Re-export component configs so callers configure everything from one place
pub use crate::behavior::TimingEngineConfig;
pub use crate::breaker::CircuitBreakerConfig;
pub use crate::limiter::RateLimiterConfig;
pub use crate::provider::MockProviderConfig;
pub use crate::retry::RetryConfig;

/// Main configuration structure
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub farm: FarmConfig,
    #[serde(default)]
    pub simulation: SimulationConfig,
    #[serde(default)]
    pub rate_limiter: RateLimiterConfig,
    #[serde(default)]
    pub circuit_breaker: CircuitBreakerConfig,
    #[serde(default)]
    pub retry: RetryConfig,
    #[serde(default)]
    pub nonce: NonceConfig,
    #[serde(default)]
    pub timing: TimingEngineConfig,
    #[serde(default)]
    pub mock_provider: MockProviderConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FarmConfig {
    #[serde(default = "default_wallet_count")]
    pub wallet_count: u32,
    /// Seed phrase for deterministic address derivation
    #[serde(default = "default_seed_phrase")]
    pub seed_phrase: String,
}

fn default_wallet_count() -> u32 {
    25
}
fn default_seed_phrase() -> String {
    "txswarm dev farm".to_string()
}

impl Default for FarmConfig {
    fn default() -> Self {
        Self {
            wallet_count: default_wallet_count(),
            seed_phrase: default_seed_phrase(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SimulationConfig {
    #[serde(default = "default_chains")]
    pub chains: Vec<String>,
    /// Archetypes assigned round-robin across the farm
    #[serde(default = "default_archetypes")]
    pub archetypes: Vec<String>,
    /// Contract operations the target exposes
    #[serde(default = "default_operations")]
    pub operations: Vec<String>,
    /// RNG seed; omit for entropy-seeded runs
    #[serde(default)]
    pub seed: Option<u64>,
    #[serde(default = "default_duration_secs")]
    pub duration_secs: u64,
}

fn default_chains() -> Vec<String> {
    vec!["devnet".to_string()]
}
fn default_archetypes() -> Vec<String> {
    vec![
        "casual".to_string(),
        "regular".to_string(),
        "power_user".to_string(),
        "whale".to_string(),
        "bot".to_string(),
        "newcomer".to_string(),
    ]
}
fn default_operations() -> Vec<String> {
    vec![
        "transfer".to_string(),
        "swap".to_string(),
        "mint".to_string(),
        "stake".to_string(),
    ]
}
fn default_duration_secs() -> u64 {
    30
}

impl Default for SimulationConfig {
    fn default() -> Self {
        Self {
            chains: default_chains(),
            archetypes: default_archetypes(),
            operations: default_operations(),
            seed: None,
            duration_secs: default_duration_secs(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NonceConfig {
    /// Cooldown between unforced on-chain nonce syncs
    #[serde(default = "default_sync_cooldown_ms")]
    pub sync_cooldown_ms: u64,
}

fn default_sync_cooldown_ms() -> u64 {
    5_000
}

impl Default for NonceConfig {
    fn default() -> Self {
        Self {
            sync_cooldown_ms: default_sync_cooldown_ms(),
        }
    }
}

impl Config {
    /// Load from a TOML file (optional) layered with TXSWARM__* env vars
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let config = config::Config::builder()
            .add_source(config::File::from(path).required(false))
            .add_source(
                config::Environment::with_prefix("TXSWARM")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()
            .map_err(|e| Error::Config(e.to_string()))?;

        let config: Config = config
            .try_deserialize()
            .map_err(|e| Error::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.farm.wallet_count == 0 {
            return Err(Error::Config("farm.wallet_count must be > 0".to_string()));
        }
        if self.simulation.chains.is_empty() {
            return Err(Error::Config("simulation.chains must not be empty".to_string()));
        }
        if self.simulation.archetypes.is_empty() {
            return Err(Error::Config(
                "simulation.archetypes must not be empty".to_string(),
            ));
        }
        if self.simulation.operations.is_empty() {
            return Err(Error::Config(
                "simulation.operations must not be empty".to_string(),
            ));
        }
        if self.rate_limiter.requests_per_second <= 0.0 {
            return Err(Error::Config(
                "rate_limiter.requests_per_second must be > 0".to_string(),
            ));
        }
        if self.rate_limiter.burst_size < 1.0 {
            return Err(Error::Config(
                "rate_limiter.burst_size must be >= 1".to_string(),
            ));
        }
        if self.circuit_breaker.failure_threshold == 0 {
            return Err(Error::Config(
                "circuit_breaker.failure_threshold must be > 0".to_string(),
            ));
        }
        if !(0.0..=1.0).contains(&self.mock_provider.failure_rate) {
            return Err(Error::Config(
                "mock_provider.failure_rate must be in [0, 1]".to_string(),
            ));
        }
        Ok(())
    }
}
