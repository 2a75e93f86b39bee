//! Behavioral realism: who acts, and when

pub mod archetypes;
pub mod timing;

pub use archetypes::{ArchetypeProfile, ArchetypeRegistry, TransactionParams};
pub use timing::{DelaySpec, TimingEngine, TimingEngineConfig, TimingProfile};
