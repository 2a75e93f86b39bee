//! Transaction Swarm Library
//!
//! Synthetic, behaviorally-realistic transaction load for smart contract
//! deployments: a wallet farm driven by user archetypes through a nonce-safe,
//! rate-limited, circuit-broken submission pipeline.

pub mod behavior;
pub mod breaker;
pub mod cli;
pub mod config;
pub mod error;
pub mod limiter;
pub mod nonce;
pub mod orchestrator;
pub mod provider;
pub mod retry;
pub mod wallet;

// Re-export commonly used types
pub use config::Config;
pub use error::{Error, Result};
