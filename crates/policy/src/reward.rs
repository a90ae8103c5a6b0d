//! Turns an [`Outcome`] into the scalar training signal.

use std::fmt;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::simulator::Outcome;

const fn default_success() -> f64 {
    1.0
}

const fn default_failure() -> f64 {
    -1.0
}

const fn default_false_positive() -> f64 {
    -0.5
}

const fn default_collateral() -> f64 {
    -0.3
}

const fn default_time_penalty_factor() -> f64 {
    0.01
}

const fn default_speed_threshold() -> f64 {
    10.0
}

const fn default_speed_bonus_fraction() -> f64 {
    0.2
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RewardConfig {
    #[serde(default = "default_success")]
    pub success: f64,
    #[serde(default = "default_failure")]
    pub failure: f64,
    #[serde(default = "default_false_positive")]
    pub false_positive: f64,
    #[serde(default = "default_collateral")]
    pub collateral_damage: f64,
    #[serde(default)]
    pub uncertainty: f64,
    /// Penalty per minute of remediation time.
    #[serde(default = "default_time_penalty_factor")]
    pub time_penalty_factor: f64,
    /// Minutes under which a success earns a speed bonus.
    #[serde(default = "default_speed_threshold")]
    pub speed_threshold_minutes: f64,
    #[serde(default = "default_speed_bonus_fraction")]
    pub speed_bonus_fraction: f64,
}

impl Default for RewardConfig {
    fn default() -> Self {
        Self {
            success: default_success(),
            failure: default_failure(),
            false_positive: default_false_positive(),
            collateral_damage: default_collateral(),
            uncertainty: 0.0,
            time_penalty_factor: default_time_penalty_factor(),
            speed_threshold_minutes: default_speed_threshold(),
            speed_bonus_fraction: default_speed_bonus_fraction(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct RewardComponent {
    pub name: &'static str,
    pub value: f64,
}

/// Reward with its named parts; `total` is the in-order sum of `components`.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RewardFeedback {
    pub outcome: Outcome,
    pub total: f64,
    pub components: Vec<RewardComponent>,
}

impl RewardFeedback {
    fn from_components(outcome: Outcome, components: Vec<RewardComponent>) -> Self {
        let total = components.iter().fold(0.0, |acc, c| acc + c.value);
        Self {
            outcome,
            total,
            components,
        }
    }

    pub fn component(&self, name: &str) -> Option<f64> {
        self.components
            .iter()
            .find(|c| c.name == name)
            .map(|c| c.value)
    }
}

impl fmt::Display for RewardFeedback {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "total reward: {:.3}", self.total)?;
        for component in &self.components {
            writeln!(f, "  {:<18} {:+.3}", component.name, component.value)?;
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct RewardShaper {
    config: RewardConfig,
}

impl RewardShaper {
    pub fn new(config: RewardConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &RewardConfig {
        &self.config
    }

    pub fn shape(&self, outcome: &Outcome) -> RewardFeedback {
        let cfg = &self.config;
        let minutes = outcome.time_to_remediate;
        let mut components = Vec::with_capacity(4);
        let mut push = |name, value| components.push(RewardComponent { name, value });

        if outcome.false_positive {
            push("false_positive", cfg.false_positive);
        } else if outcome.success && outcome.attack_contained {
            push("success", cfg.success);
            if minutes < cfg.speed_threshold_minutes {
                let bonus = cfg.success
                    * cfg.speed_bonus_fraction
                    * (1.0 - minutes / cfg.speed_threshold_minutes);
                push("speed_bonus", bonus);
            }
        } else if !outcome.success {
            push("failure", cfg.failure);
        } else {
            push("uncertainty", cfg.uncertainty);
        }

        if outcome.collateral_damage {
            push("collateral_damage", cfg.collateral_damage);
        }
        push("time_penalty", -cfg.time_penalty_factor * minutes);

        let feedback = RewardFeedback::from_components(*outcome, components);
        debug!(
            total = feedback.total,
            success = outcome.success,
            false_positive = outcome.false_positive,
            collateral = outcome.collateral_damage,
            "reward shaped"
        );
        feedback
    }

    /// Expected reward of an action with the given outcome probabilities.
    pub fn expected_reward(
        &self,
        success_p: f64,
        false_positive_p: f64,
        collateral_p: f64,
        avg_minutes: f64,
    ) -> f64 {
        let cfg = &self.config;
        let failure_p = (1.0 - success_p - false_positive_p).max(0.0);
        success_p * cfg.success
            + failure_p * cfg.failure
            + false_positive_p * cfg.false_positive
            + collateral_p * cfg.collateral_damage
            - cfg.time_penalty_factor * avg_minutes
    }
}
