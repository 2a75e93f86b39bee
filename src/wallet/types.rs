//! Wallet identity types and deterministic key derivation

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// Source of deterministic wallet addresses.
///
/// The real signer/keystore lives outside this crate; the engine only needs
/// "give me wallet N's address". Derivation must be stable across runs so a
/// farm can be rebuilt against the same chain state.
pub trait KeySource: Send + Sync {
    fn derive_address(&self, index: u32) -> String;
}

/// Hash-based derivation from a farm seed phrase
#[derive(Debug, Clone)]
pub struct DeterministicKeySource {
    seed: String,
}

impl DeterministicKeySource {
    pub fn new(seed: impl Into<String>) -> Self {
        Self { seed: seed.into() }
    }
}

impl KeySource for DeterministicKeySource {
    fn derive_address(&self, index: u32) -> String {
        let mut hasher = Sha256::new();
        hasher.update(self.seed.as_bytes());
        hasher.update(index.to_le_bytes());
        let digest = hasher.finalize();
        // 20-byte address, Ethereum style
        let mut addr = String::with_capacity(42);
        addr.push_str("0x");
        for byte in &digest[..20] {
            addr.push_str(&format!("{:02x}", byte));
        }
        addr
    }
}

/// A simulated wallet identity
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Wallet {
    pub index: u32,
    pub address: String,
}

/// One completed (or terminally failed) submission attempt
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransactionRecord {
    pub chain: String,
    pub nonce: u64,
    pub operation: String,
    pub value: f64,
    pub success: bool,
    pub tx_hash: Option<String>,
    pub error: Option<String>,
    pub timestamp: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_derivation_deterministic() {
        let a = DeterministicKeySource::new("test seed");
        let b = DeterministicKeySource::new("test seed");
        assert_eq!(a.derive_address(0), b.derive_address(0));
        assert_eq!(a.derive_address(7), b.derive_address(7));
    }

    #[test]
    fn test_derivation_unique_per_index() {
        let source = DeterministicKeySource::new("test seed");
        let addrs: Vec<String> = (0..100).map(|i| source.derive_address(i)).collect();
        let mut deduped = addrs.clone();
        deduped.sort();
        deduped.dedup();
        assert_eq!(deduped.len(), addrs.len());
    }

    #[test]
    fn test_address_format() {
        let source = DeterministicKeySource::new("seed");
        let addr = source.derive_address(0);
        assert!(addr.starts_with("0x"));
        assert_eq!(addr.len(), 42);
    }
}
