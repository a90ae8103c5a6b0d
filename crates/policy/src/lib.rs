//! Adaptive remediation policy engine.
//!
//! Learns by tabular Q-learning which remediation action fits a discretized
//! incident context. Training signal comes from a stochastic outcome
//! simulator and a shaped reward; the learned table persists as snapshots.

pub mod action;
pub mod config;
pub mod context;
pub mod encoder;
/// Error type shared by the engine modules.
pub mod error;
pub mod engine;
pub mod reward;
pub mod selector;
pub mod simulator;
pub mod table;
pub mod trainer;
pub mod training;
/// Event log and snapshot persistence.
pub mod utils;

pub use action::{normalize_action, Action, ActionSet, FALLBACK_ACTION};
pub use config::{load_config, EngineConfig, Hyperparameters, Profile};
pub use context::{AttackCategory, Context, Severity};
pub use encoder::{StateEncoder, StateKey};
pub use engine::{Decision, EngineStatistics, PolicyEngine};
pub use error::{PolicyError, Result};
pub use reward::{RewardFeedback, RewardShaper};
pub use simulator::{Outcome, OutcomeSimulator};
pub use training::{ScenarioSampler, TrainingLoop, TrainingReport};
pub use utils::policy_store::{FileStore, PolicySnapshot, SnapshotStore, SqliteStore};
