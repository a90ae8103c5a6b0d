#![allow(dead_code)]

use remedy_policy::{
    ActionSet, AttackCategory, Context, EngineConfig, Hyperparameters, PolicyEngine, Severity,
};

pub fn hyperparameters(epsilon: f64, epsilon_decay: f64, min_epsilon: f64) -> Hyperparameters {
    Hyperparameters {
        alpha: 0.1,
        epsilon,
        epsilon_decay,
        min_epsilon,
        gamma: 0.95,
        q_init: 0.0,
    }
}

pub fn seeded_config(seed: u64, hp: Hyperparameters) -> EngineConfig {
    EngineConfig {
        hyperparameters: Some(hp),
        seed: Some(seed),
        ..EngineConfig::default()
    }
}

pub fn engine(config: &EngineConfig) -> PolicyEngine {
    PolicyEngine::new(config, ActionSet::all()).expect("engine construction failed")
}

pub fn context(severity: Severity, category: AttackCategory, confidence: f64, assets: u32) -> Context {
    Context::new(severity, category, confidence, assets).expect("valid context")
}
