//! Wallet farm: identities and per-chain transaction history

pub mod farm;
pub mod types;

pub use farm::WalletFarm;
pub use types::{DeterministicKeySource, KeySource, TransactionRecord, Wallet};
