//! Timing engine
//!
//! Converts named timing profiles into actual suspensions with human-like
//! variance: a global multiplier stretches or compresses every delay, and
//! per-delay jitter keeps repeated actions from looking mechanical.

use rand::prelude::*;
use rand::rngs::StdRng;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use crate::error::{Error, Result};

/// A delay range in milliseconds
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimingProfile {
    pub min_ms: u64,
    pub max_ms: u64,
}

impl TimingProfile {
    pub fn new(min_ms: u64, max_ms: u64) -> Self {
        Self { min_ms, max_ms }
    }
}

/// A named profile or an ad-hoc range
#[derive(Debug, Clone)]
pub enum DelaySpec {
    Named(String),
    Range(TimingProfile),
}

impl From<&str> for DelaySpec {
    fn from(name: &str) -> Self {
        DelaySpec::Named(name.to_string())
    }
}

impl From<TimingProfile> for DelaySpec {
    fn from(profile: TimingProfile) -> Self {
        DelaySpec::Range(profile)
    }
}

impl From<(u64, u64)> for DelaySpec {
    fn from((min_ms, max_ms): (u64, u64)) -> Self {
        DelaySpec::Range(TimingProfile { min_ms, max_ms })
    }
}

/// Timing engine configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TimingEngineConfig {
    /// Global scale applied to every delay (0.5 = twice as fast)
    #[serde(default = "default_multiplier")]
    pub multiplier: f64,
    /// Per-delay jitter, ± percent
    #[serde(default = "default_jitter_pct")]
    pub jitter_pct: f64,
}

fn default_multiplier() -> f64 {
    1.0
}
fn default_jitter_pct() -> f64 {
    25.0
}

impl Default for TimingEngineConfig {
    fn default() -> Self {
        Self {
            multiplier: default_multiplier(),
            jitter_pct: default_jitter_pct(),
        }
    }
}

fn builtin_profiles() -> HashMap<String, TimingProfile> {
    let mut profiles = HashMap::new();
    profiles.insert("snap".to_string(), TimingProfile::new(50, 200));
    profiles.insert("quick".to_string(), TimingProfile::new(300, 800));
    profiles.insert("normal".to_string(), TimingProfile::new(1_000, 3_000));
    profiles.insert("deliberate".to_string(), TimingProfile::new(3_000, 8_000));
    profiles.insert("distracted".to_string(), TimingProfile::new(10_000, 30_000));
    profiles.insert("burst-gap".to_string(), TimingProfile::new(100, 400));
    profiles.insert("burst-pause".to_string(), TimingProfile::new(2_000, 6_000));
    profiles
}

/// Produces human-like delays from named or ad-hoc profiles
pub struct TimingEngine {
    profiles: HashMap<String, TimingProfile>,
    config: TimingEngineConfig,
    rng: Mutex<StdRng>,
}

impl TimingEngine {
    pub fn new(config: TimingEngineConfig, seed: Option<u64>) -> Self {
        let rng = match seed {
            Some(s) => StdRng::seed_from_u64(s),
            None => StdRng::from_entropy(),
        };
        Self {
            profiles: builtin_profiles(),
            config,
            rng: Mutex::new(rng),
        }
    }

    pub fn profile_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.profiles.keys().cloned().collect();
        names.sort();
        names
    }

    fn resolve(&self, spec: &DelaySpec) -> Result<TimingProfile> {
        let profile = match spec {
            DelaySpec::Named(name) => *self
                .profiles
                .get(name.as_str())
                .ok_or_else(|| Error::UnknownTimingProfile(name.clone()))?,
            DelaySpec::Range(profile) => *profile,
        };
        if profile.min_ms > profile.max_ms {
            return Err(Error::InvalidTimingRange {
                min_ms: profile.min_ms,
                max_ms: profile.max_ms,
            });
        }
        Ok(profile)
    }

    /// Choose a concrete delay: uniform in range, scaled, jittered
    fn pick_delay(&self, profile: TimingProfile) -> Duration {
        let mut rng = self.rng.lock().unwrap_or_else(|e| e.into_inner());
        let base = rng.gen_range(profile.min_ms..=profile.max_ms) as f64;
        let jitter = self.config.jitter_pct / 100.0;
        let factor = rng.gen_range((1.0 - jitter)..=(1.0 + jitter));
        Duration::from_millis((base * self.config.multiplier * factor).max(0.0) as u64)
    }

    /// Suspend for a human-like delay, returning the actual duration chosen
    pub async fn human_delay(&self, spec: impl Into<DelaySpec>) -> Result<Duration> {
        let profile = self.resolve(&spec.into())?;
        let delay = self.pick_delay(profile);
        tokio::time::sleep(delay).await;
        Ok(delay)
    }

    /// Suspend for a uniform delay in [min_ms, max_ms], unscaled
    pub async fn random_delay(&self, min_ms: u64, max_ms: u64) -> Duration {
        let ms = {
            let mut rng = self.rng.lock().unwrap_or_else(|e| e.into_inner());
            rng.gen_range(min_ms..=max_ms.max(min_ms))
        };
        let delay = Duration::from_millis(ms);
        tokio::time::sleep(delay).await;
        delay
    }

    /// Short delays within bursts, a longer pause between bursts.
    ///
    /// Returns every delay performed, in order.
    pub async fn burst_pattern(
        &self,
        size: u32,
        quick: impl Into<DelaySpec>,
        pause: impl Into<DelaySpec>,
        repetitions: u32,
    ) -> Result<Vec<Duration>> {
        let quick = self.resolve(&quick.into())?;
        let pause = self.resolve(&pause.into())?;
        let mut delays = Vec::new();

        for rep in 0..repetitions {
            for _ in 0..size {
                let d = self.pick_delay(quick);
                tokio::time::sleep(d).await;
                delays.push(d);
            }
            if rep + 1 < repetitions {
                let d = self.pick_delay(pause);
                tokio::time::sleep(d).await;
                delays.push(d);
            }
        }
        Ok(delays)
    }

    /// Chain several profiles, optionally separated by an inter-step delay.
    ///
    /// Returns every delay performed, in order.
    pub async fn timing_sequence(
        &self,
        steps: &[DelaySpec],
        between: Option<DelaySpec>,
    ) -> Result<Vec<Duration>> {
        // Validate everything up front so a bad name cannot fail mid-sequence
        let resolved: Vec<TimingProfile> = steps
            .iter()
            .map(|s| self.resolve(s))
            .collect::<Result<_>>()?;
        let between = match &between {
            Some(spec) => Some(self.resolve(spec)?),
            None => None,
        };

        let mut delays = Vec::new();
        for (i, profile) in resolved.iter().enumerate() {
            let d = self.pick_delay(*profile);
            tokio::time::sleep(d).await;
            delays.push(d);
            if i + 1 < resolved.len() {
                if let Some(gap) = between {
                    let d = self.pick_delay(gap);
                    tokio::time::sleep(d).await;
                    delays.push(d);
                }
            }
        }
        Ok(delays)
    }
}
