//! Chain provider abstraction
//!
//! The engine treats the blockchain client as an opaque async surface: it can
//! return a pending nonce, and it can accept a signed transaction which either
//! succeeds, rejects with a classifiable error message, or times out. The real
//! RPC client lives outside this crate; `MockProvider` stands in for it in
//! tests and demo runs.

use async_trait::async_trait;
use dashmap::DashMap;
use rand::prelude::*;
use rand::rngs::StdRng;
use sha2::{Digest, Sha256};
use std::collections::VecDeque;
use std::sync::Mutex;
use std::time::Duration;
use tracing::debug;

use crate::error::{Error, Result};

/// A transaction ready for submission
#[derive(Debug, Clone)]
pub struct SignedTransaction {
    pub from: String,
    pub chain: String,
    pub nonce: u64,
    /// Target contract operation name (e.g. "swap", "mint")
    pub operation: String,
    /// Native-denominated value attached to the call
    pub value: f64,
    pub gas_multiplier: f64,
}

/// Acknowledgement returned by a successful submission
#[derive(Debug, Clone)]
pub struct SubmitReceipt {
    pub tx_hash: String,
    pub chain: String,
    pub nonce: u64,
}

/// Opaque async chain surface consumed by the engine
#[async_trait]
pub trait ChainProvider: Send + Sync {
    /// Authoritative pending nonce for an address
    async fn pending_nonce(&self, chain: &str, address: &str) -> Result<u64>;

    /// Submit a signed transaction
    async fn submit(&self, tx: &SignedTransaction) -> Result<SubmitReceipt>;
}

/// Mock provider configuration
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct MockProviderConfig {
    /// Probability that a submission fails with a random transient error
    #[serde(default = "default_failure_rate")]
    pub failure_rate: f64,
    #[serde(default = "default_min_latency_ms")]
    pub min_latency_ms: u64,
    #[serde(default = "default_max_latency_ms")]
    pub max_latency_ms: u64,
}

fn default_failure_rate() -> f64 {
    0.05
}
fn default_min_latency_ms() -> u64 {
    10
}
fn default_max_latency_ms() -> u64 {
    80
}

impl Default for MockProviderConfig {
    fn default() -> Self {
        Self {
            failure_rate: default_failure_rate(),
            min_latency_ms: default_min_latency_ms(),
            max_latency_ms: default_max_latency_ms(),
        }
    }
}

/// Deterministic in-process provider with scripted failure injection.
///
/// Tracks expected nonces per (chain, address) so stale submissions are
/// rejected with "nonce too low", the same shape a real node produces.
pub struct MockProvider {
    config: MockProviderConfig,
    nonces: DashMap<(String, String), u64>,
    rng: Mutex<StdRng>,
    scripted_failures: Mutex<VecDeque<String>>,
}

const INJECTED_FAILURES: &[&str] = &[
    "network error: connection reset",
    "request timeout",
    "rate limit exceeded (429)",
    "service unavailable (503)",
];

impl MockProvider {
    pub fn new(config: MockProviderConfig, seed: Option<u64>) -> Self {
        let rng = match seed {
            Some(s) => StdRng::seed_from_u64(s),
            None => StdRng::from_entropy(),
        };
        Self {
            config,
            nonces: DashMap::new(),
            rng: Mutex::new(rng),
            scripted_failures: Mutex::new(VecDeque::new()),
        }
    }

    /// Queue an exact error message for the next submission(s)
    pub fn fail_next(&self, message: impl Into<String>) {
        self.scripted_failures
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push_back(message.into());
    }

    /// Seed the expected nonce for an address (defaults to 0 on first touch)
    pub fn set_pending_nonce(&self, chain: &str, address: &str, nonce: u64) {
        self.nonces
            .insert((chain.to_string(), address.to_string()), nonce);
    }

    fn next_latency(&self) -> Duration {
        let mut rng = self.rng.lock().unwrap_or_else(|e| e.into_inner());
        let ms = rng.gen_range(self.config.min_latency_ms..=self.config.max_latency_ms);
        Duration::from_millis(ms)
    }

    fn roll_injected_failure(&self) -> Option<String> {
        {
            let mut scripted = self
                .scripted_failures
                .lock()
                .unwrap_or_else(|e| e.into_inner());
            if let Some(msg) = scripted.pop_front() {
                return Some(msg);
            }
        }

        let mut rng = self.rng.lock().unwrap_or_else(|e| e.into_inner());
        if rng.gen::<f64>() < self.config.failure_rate {
            Some(INJECTED_FAILURES.choose(&mut *rng).unwrap().to_string())
        } else {
            None
        }
    }
}

#[async_trait]
impl ChainProvider for MockProvider {
    async fn pending_nonce(&self, chain: &str, address: &str) -> Result<u64> {
        tokio::time::sleep(self.next_latency()).await;
        let key = (chain.to_string(), address.to_string());
        Ok(*self.nonces.entry(key).or_insert(0))
    }

    async fn submit(&self, tx: &SignedTransaction) -> Result<SubmitReceipt> {
        tokio::time::sleep(self.next_latency()).await;

        if let Some(msg) = self.roll_injected_failure() {
            debug!(chain = %tx.chain, from = %tx.from, nonce = tx.nonce, error = %msg, "Mock submission failed");
            return Err(Error::Provider(msg));
        }

        let key = (tx.chain.clone(), tx.from.clone());
        let mut expected = self.nonces.entry(key).or_insert(0);
        if tx.nonce < *expected {
            return Err(Error::Provider(format!(
                "nonce too low: expected {}, got {}",
                *expected, tx.nonce
            )));
        }
        // Future nonces are accepted and become the new frontier, matching
        // mempool queueing behavior closely enough for load testing.
        *expected = tx.nonce + 1;

        let mut hasher = Sha256::new();
        hasher.update(tx.chain.as_bytes());
        hasher.update(tx.from.as_bytes());
        hasher.update(tx.nonce.to_le_bytes());
        let tx_hash = format!("0x{:x}", hasher.finalize());

        Ok(SubmitReceipt {
            tx_hash,
            chain: tx.chain.clone(),
            nonce: tx.nonce,
        })
    }
}
