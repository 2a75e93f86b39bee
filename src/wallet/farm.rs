//! Wallet farm: owns wallet identities and chain-scoped history
//!
//! Addresses are derived once at construction and immutable afterwards.
//! History is append-only; readers get snapshots.

use dashmap::DashMap;
use std::sync::Arc;
use tracing::info;

use super::types::{KeySource, TransactionRecord, Wallet};
use crate::error::{Error, Result};

/// Pool of independently-keyed simulated wallets
pub struct WalletFarm {
    wallets: Vec<Wallet>,
    /// (wallet index, chain) -> append-only record list
    history: DashMap<(u32, String), Vec<TransactionRecord>>,
}

impl WalletFarm {
    /// Derive `count` wallets from the key source
    pub fn new(count: u32, key_source: Arc<dyn KeySource>) -> Self {
        let wallets: Vec<Wallet> = (0..count)
            .map(|index| Wallet {
                index,
                address: key_source.derive_address(index),
            })
            .collect();

        info!(wallets = wallets.len(), "Wallet farm initialized");

        Self {
            wallets,
            history: DashMap::new(),
        }
    }

    pub fn wallet_count(&self) -> usize {
        self.wallets.len()
    }

    pub fn wallets(&self) -> &[Wallet] {
        &self.wallets
    }

    pub fn wallet(&self, index: u32) -> Result<&Wallet> {
        self.wallets
            .get(index as usize)
            .ok_or(Error::WalletNotFound(index))
    }

    pub fn address(&self, index: u32) -> Result<String> {
        Ok(self.wallet(index)?.address.clone())
    }

    /// Append a transaction outcome to a wallet's chain history
    pub fn record_transaction(&self, index: u32, record: TransactionRecord) -> Result<()> {
        // Validate the wallet exists before touching the map
        self.wallet(index)?;
        self.history
            .entry((index, record.chain.clone()))
            .or_default()
            .push(record);
        Ok(())
    }

    /// Snapshot of a wallet's history on one chain, oldest first
    pub fn history(&self, index: u32, chain: &str) -> Vec<TransactionRecord> {
        self.history
            .get(&(index, chain.to_string()))
            .map(|h| h.clone())
            .unwrap_or_default()
    }

    /// Total recorded transactions across all wallets and chains
    pub fn total_recorded(&self) -> usize {
        self.history.iter().map(|e| e.value().len()).sum()
    }
}
