//! User archetype registry
//!
//! Named behavioral profiles controlling how often a simulated wallet acts,
//! what it does, and how much it moves. All randomness flows through one
//! seedable RNG so simulation runs can be reproduced exactly.

use rand::prelude::*;
use rand::rngs::StdRng;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Mutex;
use tracing::info;

use crate::error::{Error, Result};

/// How often this archetype shows up
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FrequencyClass {
    Rare,
    Occasional,
    Regular,
    Frequent,
}

/// How much value this archetype moves
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VolumeClass {
    Low,
    Medium,
    High,
    Whale,
}

/// Behavioral profile for one archetype
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ArchetypeProfile {
    pub frequency: FrequencyClass,
    pub volume: VolumeClass,
    /// Pre-action think time in milliseconds (min, max)
    pub delay_range: (u64, u64),
    /// Probability of sitting a tick out entirely
    pub skip_probability: f64,
    pub burst_enabled: bool,
    /// Probability of a burst on a non-skipped tick (ignored when bursts are
    /// disabled)
    pub burst_probability: f64,
    pub burst_size_range: (u32, u32),
    /// Contract operations this archetype touches; empty means accepts all
    pub preferred_operations: Vec<String>,
    /// Native-denominated value range per transaction (min, max)
    pub transaction_size_range: (f64, f64),
}

/// Randomized-but-bounded call parameters for one transaction
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransactionParams {
    pub value: f64,
    pub gas_multiplier: f64,
    pub slippage_bps: u32,
}

fn builtin_profiles() -> HashMap<String, ArchetypeProfile> {
    let mut profiles = HashMap::new();
    profiles.insert(
        "newcomer".to_string(),
        ArchetypeProfile {
            frequency: FrequencyClass::Rare,
            volume: VolumeClass::Low,
            delay_range: (2_000, 15_000),
            skip_probability: 0.6,
            burst_enabled: false,
            burst_probability: 0.0,
            burst_size_range: (0, 0),
            preferred_operations: vec!["transfer".to_string()],
            transaction_size_range: (0.001, 0.05),
        },
    );
    profiles.insert(
        "casual".to_string(),
        ArchetypeProfile {
            frequency: FrequencyClass::Occasional,
            volume: VolumeClass::Low,
            delay_range: (1_500, 8_000),
            skip_probability: 0.5,
            burst_enabled: false,
            burst_probability: 0.0,
            burst_size_range: (0, 0),
            preferred_operations: vec!["transfer".to_string(), "swap".to_string()],
            transaction_size_range: (0.01, 0.1),
        },
    );
    profiles.insert(
        "regular".to_string(),
        ArchetypeProfile {
            frequency: FrequencyClass::Regular,
            volume: VolumeClass::Medium,
            delay_range: (800, 4_000),
            skip_probability: 0.3,
            burst_enabled: true,
            burst_probability: 0.1,
            burst_size_range: (2, 4),
            preferred_operations: Vec::new(),
            transaction_size_range: (0.05, 0.5),
        },
    );
    profiles.insert(
        "power_user".to_string(),
        ArchetypeProfile {
            frequency: FrequencyClass::Frequent,
            volume: VolumeClass::High,
            delay_range: (300, 1_500),
            skip_probability: 0.1,
            burst_enabled: true,
            burst_probability: 0.25,
            burst_size_range: (3, 6),
            preferred_operations: Vec::new(),
            transaction_size_range: (0.1, 1.0),
        },
    );
    profiles.insert(
        "whale".to_string(),
        ArchetypeProfile {
            frequency: FrequencyClass::Rare,
            volume: VolumeClass::Whale,
            delay_range: (5_000, 30_000),
            skip_probability: 0.85,
            burst_enabled: false,
            burst_probability: 0.0,
            burst_size_range: (0, 0),
            preferred_operations: vec![
                "swap".to_string(),
                "add_liquidity".to_string(),
                "remove_liquidity".to_string(),
            ],
            transaction_size_range: (10.0, 100.0),
        },
    );
    profiles.insert(
        "bot".to_string(),
        ArchetypeProfile {
            frequency: FrequencyClass::Frequent,
            volume: VolumeClass::Low,
            delay_range: (50, 250),
            skip_probability: 0.05,
            burst_enabled: true,
            burst_probability: 0.4,
            burst_size_range: (5, 10),
            preferred_operations: Vec::new(),
            transaction_size_range: (0.01, 0.2),
        },
    );
    profiles
}

/// Registry of built-in and caller-supplied archetypes
pub struct ArchetypeRegistry {
    profiles: HashMap<String, ArchetypeProfile>,
    rng: Mutex<StdRng>,
}

impl ArchetypeRegistry {
    pub fn new(seed: Option<u64>) -> Self {
        let rng = match seed {
            Some(s) => StdRng::seed_from_u64(s),
            None => StdRng::from_entropy(),
        };
        Self {
            profiles: builtin_profiles(),
            rng: Mutex::new(rng),
        }
    }

    /// Register a custom archetype, validating the profile first
    pub fn register(&mut self, name: impl Into<String>, profile: ArchetypeProfile) -> Result<()> {
        let name = name.into();
        if name.trim().is_empty() {
            return Err(Error::InvalidArchetype("name must not be empty".to_string()));
        }
        if !(0.0..=1.0).contains(&profile.skip_probability) {
            return Err(Error::InvalidArchetype(format!(
                "skip_probability {} outside [0, 1]",
                profile.skip_probability
            )));
        }
        if !(0.0..=1.0).contains(&profile.burst_probability) {
            return Err(Error::InvalidArchetype(format!(
                "burst_probability {} outside [0, 1]",
                profile.burst_probability
            )));
        }
        if profile.delay_range.0 > profile.delay_range.1 {
            return Err(Error::InvalidArchetype("delay_range min > max".to_string()));
        }
        if profile.transaction_size_range.0 > profile.transaction_size_range.1
            || profile.transaction_size_range.0 < 0.0
        {
            return Err(Error::InvalidArchetype(
                "transaction_size_range invalid".to_string(),
            ));
        }
        if profile.burst_enabled && profile.burst_size_range.0 > profile.burst_size_range.1 {
            return Err(Error::InvalidArchetype(
                "burst_size_range min > max".to_string(),
            ));
        }
        info!(archetype = %name, "Registered custom archetype");
        self.profiles.insert(name, profile);
        Ok(())
    }

    pub fn get(&self, name: &str) -> Result<&ArchetypeProfile> {
        self.profiles
            .get(name)
            .ok_or_else(|| Error::UnknownArchetype(name.to_string()))
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.profiles.keys().cloned().collect();
        names.sort();
        names
    }

    /// True with the profile's skip probability
    pub fn should_skip_interaction(&self, name: &str) -> Result<bool> {
        let p = self.get(name)?.skip_probability;
        let mut rng = self.rng.lock().unwrap_or_else(|e| e.into_inner());
        Ok(rng.gen::<f64>() < p)
    }

    /// True with the profile's burst probability; always false for
    /// non-bursting archetypes
    pub fn should_burst(&self, name: &str) -> Result<bool> {
        let profile = self.get(name)?;
        if !profile.burst_enabled {
            return Ok(false);
        }
        let p = profile.burst_probability;
        let mut rng = self.rng.lock().unwrap_or_else(|e| e.into_inner());
        Ok(rng.gen::<f64>() < p)
    }

    /// Number of transactions in a burst, within the profile's range
    pub fn burst_size(&self, name: &str) -> Result<u32> {
        let (min, max) = self.get(name)?.burst_size_range;
        if max == 0 {
            return Ok(0);
        }
        let mut rng = self.rng.lock().unwrap_or_else(|e| e.into_inner());
        Ok(rng.gen_range(min..=max))
    }

    /// Bounded random transaction value
    pub fn generate_transaction_size(&self, name: &str) -> Result<f64> {
        let (min, max) = self.get(name)?.transaction_size_range;
        let mut rng = self.rng.lock().unwrap_or_else(|e| e.into_inner());
        Ok(rng.gen_range(min..=max))
    }

    /// Full randomized-but-bounded call parameters
    pub fn generate_parameters(&self, name: &str) -> Result<TransactionParams> {
        let (min, max) = self.get(name)?.transaction_size_range;
        let mut rng = self.rng.lock().unwrap_or_else(|e| e.into_inner());
        Ok(TransactionParams {
            value: rng.gen_range(min..=max),
            gas_multiplier: rng.gen_range(0.9..=1.3),
            slippage_bps: rng.gen_range(10..=300),
        })
    }

    /// Does this archetype touch the given contract operation?
    pub fn is_function_suitable(&self, name: &str, function: &str) -> Result<bool> {
        let profile = self.get(name)?;
        if profile.preferred_operations.is_empty() {
            return Ok(true);
        }
        Ok(profile.preferred_operations.iter().any(|op| op == function))
    }

    /// Pick an operation for this archetype from the available set
    pub fn pick_operation(&self, name: &str, available: &[String]) -> Result<Option<String>> {
        let suitable: Vec<&String> = available
            .iter()
            .filter(|f| self.is_function_suitable(name, f).unwrap_or(false))
            .collect();
        if suitable.is_empty() {
            return Ok(None);
        }
        let mut rng = self.rng.lock().unwrap_or_else(|e| e.into_inner());
        Ok(suitable.choose(&mut *rng).map(|s| (*s).clone()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn registry(seed: u64) -> ArchetypeRegistry {
        ArchetypeRegistry::new(Some(seed))
    }

    fn valid_profile() -> ArchetypeProfile {
        ArchetypeProfile {
            frequency: FrequencyClass::Regular,
            volume: VolumeClass::Medium,
            delay_range: (100, 500),
            skip_probability: 0.2,
            burst_enabled: true,
            burst_probability: 0.3,
            burst_size_range: (2, 5),
            preferred_operations: vec!["stake".to_string()],
            transaction_size_range: (0.1, 0.5),
        }
    }

    #[test]
    fn test_whale_skip_band_over_1000_trials() {
        let r = registry(7);
        let skips = (0..1000)
            .filter(|_| r.should_skip_interaction("whale").unwrap())
            .count();
        // skip_probability 0.85; tolerance band, not exact
        assert!((800..=900).contains(&skips), "skips = {skips}");
    }

    #[test]
    fn test_seeded_runs_reproducible() {
        let a = registry(11);
        let b = registry(11);
        for _ in 0..100 {
            assert_eq!(
                a.should_skip_interaction("regular").unwrap(),
                b.should_skip_interaction("regular").unwrap()
            );
            assert_eq!(
                a.generate_transaction_size("regular").unwrap(),
                b.generate_transaction_size("regular").unwrap()
            );
        }
    }

    #[test]
    fn test_non_bursting_never_bursts() {
        let r = registry(3);
        for _ in 0..200 {
            assert!(!r.should_burst("whale").unwrap());
        }
    }

    #[test]
    fn test_transaction_size_bounded() {
        let r = registry(5);
        for _ in 0..200 {
            let size = r.generate_transaction_size("whale").unwrap();
            assert!((10.0..=100.0).contains(&size));
        }
    }

    #[test]
    fn test_parameters_bounded() {
        let r = registry(5);
        for _ in 0..100 {
            let params = r.generate_parameters("regular").unwrap();
            assert!((0.05..=0.5).contains(&params.value));
            assert!((0.9..=1.3).contains(&params.gas_multiplier));
            assert!((10..=300).contains(&params.slippage_bps));
        }
    }

    #[test]
    fn test_operation_filtering() {
        let r = registry(1);
        assert!(r.is_function_suitable("whale", "swap").unwrap());
        assert!(!r.is_function_suitable("whale", "mint").unwrap());
        // Empty preferred set accepts all
        assert!(r.is_function_suitable("bot", "anything").unwrap());
    }

    #[test]
    fn test_unknown_archetype_rejected() {
        let r = registry(1);
        assert!(matches!(
            r.should_skip_interaction("ghost"),
            Err(Error::UnknownArchetype(_))
        ));
    }

    #[test]
    fn test_register_custom_and_validation() {
        let mut r = registry(1);
        r.register("staker", valid_profile()).unwrap();
        assert!(r.is_function_suitable("staker", "stake").unwrap());

        assert!(r.register("", valid_profile()).is_err());

        let mut bad = valid_profile();
        bad.skip_probability = 1.5;
        assert!(r.register("bad", bad).is_err());

        let mut bad = valid_profile();
        bad.transaction_size_range = (5.0, 1.0);
        assert!(r.register("bad", bad).is_err());
    }

    #[test]
    fn test_pick_operation_respects_preferences() {
        let r = registry(9);
        let available = vec![
            "mint".to_string(),
            "swap".to_string(),
            "burn".to_string(),
        ];
        for _ in 0..50 {
            let op = r.pick_operation("whale", &available).unwrap();
            assert_eq!(op.as_deref(), Some("swap"));
        }
        let none = r.pick_operation("whale", &["mint".to_string()]).unwrap();
        assert!(none.is_none());
    }
}
