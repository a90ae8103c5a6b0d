//! Stochastic stand-in for "what really happens" when an action is executed.
//!
//! Two calibrations exist and they disagree on constants: the measured
//! effectiveness model (per category/action table) and the tiered model
//! (fast vs. slow actions, flat probabilities per severity tier). Both are
//! selectable through [`SimulatorConfig`]; every constant is configuration.

use std::collections::BTreeMap;

use rand::{Rng, RngCore};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::action::{Action, SpeedClass};
use crate::context::{AttackCategory, Context, Severity};
use crate::error::{PolicyError, Result};

/// Observed result of executing an action.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Outcome {
    pub success: bool,
    pub false_positive: bool,
    pub collateral_damage: bool,
    pub attack_contained: bool,
    /// Minutes, always > 0.
    pub time_to_remediate: f64,
}

pub trait OutcomeSimulator: Send + Sync {
    fn simulate(&self, action: Action, context: &Context, rng: &mut dyn RngCore) -> Outcome;

    /// Probability of success before the Bernoulli draw.
    fn success_probability(&self, action: Action, context: &Context) -> f64;
}

/// Probability band that keeps outcomes from ever being certain.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ProbabilityBand {
    pub min: f64,
    pub max: f64,
}

impl ProbabilityBand {
    /// Callers validate first: `f64::clamp` panics on an inverted band.
    fn clamp(&self, p: f64) -> f64 {
        p.clamp(self.min, self.max)
    }

    fn validate(&self, name: &str) -> Result<()> {
        probability(&format!("{name}.min"), self.min)?;
        probability(&format!("{name}.max"), self.max)?;
        if self.min > self.max {
            return Err(PolicyError::Config(format!(
                "{name}: min {} exceeds max {}",
                self.min, self.max
            )));
        }
        Ok(())
    }
}

fn probability(name: &str, p: f64) -> Result<()> {
    if (0.0..=1.0).contains(&p) {
        Ok(())
    } else {
        Err(PolicyError::Config(format!(
            "{name} must be a probability in [0, 1], got {p}"
        )))
    }
}

fn non_negative(name: &str, v: f64) -> Result<()> {
    if v.is_finite() && v >= 0.0 {
        Ok(())
    } else {
        Err(PolicyError::Config(format!(
            "{name} must be finite and >= 0, got {v}"
        )))
    }
}

/// Uniform range of remediation minutes.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct MinuteRange {
    pub low: f64,
    pub high: f64,
}

impl MinuteRange {
    fn validate(&self, name: &str) -> Result<()> {
        non_negative(&format!("{name}.low"), self.low)?;
        non_negative(&format!("{name}.high"), self.high)
    }

    fn sample(&self, rng: &mut dyn RngCore) -> f64 {
        if self.high > self.low {
            rng.gen_range(self.low..self.high)
        } else {
            self.low
        }
    }
}

// ---------- measured effectiveness model ----------

/// Base success probability per attack category and action.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EffectivenessTable(BTreeMap<AttackCategory, BTreeMap<Action, f64>>);

impl EffectivenessTable {
    const FALLBACK: f64 = 0.60;

    pub fn get(&self, category: AttackCategory, action: Action) -> f64 {
        self.0
            .get(&category)
            .and_then(|row| row.get(&action))
            .copied()
            .unwrap_or(Self::FALLBACK)
    }
}

impl Default for EffectivenessTable {
    fn default() -> Self {
        use Action::*;
        use AttackCategory::*;

        // columns: block, lock, terminate, isolate, notify, scan, reset, quarantine
        let rows: [(AttackCategory, [f64; 8]); 6] = [
            (Phishing, [0.85, 0.80, 0.45, 0.75, 0.60, 0.50, 0.70, 0.55]),
            (CredentialMisuse, [0.70, 0.90, 0.40, 0.75, 0.65, 0.50, 0.85, 0.45]),
            (LateralMovement, [0.85, 0.80, 0.60, 0.90, 0.65, 0.70, 0.50, 0.55]),
            (DataExfiltration, [0.90, 0.70, 0.50, 0.85, 0.65, 0.55, 0.65, 0.60]),
            (MalwareExecution, [0.70, 0.50, 0.85, 0.80, 0.60, 0.75, 0.45, 0.90]),
            (PrivilegeEscalation, [0.70, 0.90, 0.75, 0.85, 0.60, 0.65, 0.80, 0.50]),
        ];
        let columns = [
            BlockTraffic,
            LockAccount,
            TerminateProcess,
            IsolateHost,
            NotifyTeam,
            ScanSystem,
            ResetCredentials,
            QuarantineArtifact,
        ];

        Self(
            rows.into_iter()
                .map(|(category, values)| (category, columns.into_iter().zip(values).collect()))
                .collect(),
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SeverityMultipliers {
    pub low: f64,
    pub medium: f64,
    pub high: f64,
    pub critical: f64,
}

impl SeverityMultipliers {
    fn get(&self, severity: Severity) -> f64 {
        match severity {
            Severity::Low => self.low,
            Severity::Medium => self.medium,
            Severity::High => self.high,
            Severity::Critical => self.critical,
        }
    }
}

impl Default for SeverityMultipliers {
    fn default() -> Self {
        Self {
            low: 1.0,
            medium: 0.95,
            high: 0.85,
            critical: 0.75,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct EffectivenessModel {
    pub table: EffectivenessTable,
    pub severity: SeverityMultipliers,
    pub band: ProbabilityBand,
    /// Disruptive actions cause collateral damage with this probability on success.
    pub collateral_disruptive: f64,
    pub collateral_conservative: f64,
    pub base_minutes_fast: f64,
    pub base_minutes_slow: f64,
    /// Base effectiveness at or below which the action counts as a poor fit.
    pub poor_fit_threshold: f64,
    pub poor_fit_time_factor: f64,
    pub success_time_factor: f64,
}

impl Default for EffectivenessModel {
    fn default() -> Self {
        Self {
            table: EffectivenessTable::default(),
            severity: SeverityMultipliers::default(),
            band: ProbabilityBand {
                min: 0.30,
                max: 0.95,
            },
            collateral_disruptive: 0.15,
            collateral_conservative: 0.05,
            base_minutes_fast: 10.0,
            base_minutes_slow: 15.0,
            poor_fit_threshold: 0.75,
            poor_fit_time_factor: 1.5,
            success_time_factor: 0.8,
        }
    }
}

impl EffectivenessModel {
    pub fn validate(&self) -> Result<()> {
        for (category, row) in &self.table.0 {
            for (action, p) in row {
                probability(&format!("table.{category}.{action}"), *p)?;
            }
        }
        for severity in Severity::ALL {
            non_negative(&format!("severity.{severity}"), self.severity.get(severity))?;
        }
        self.band.validate("band")?;
        probability("collateral_disruptive", self.collateral_disruptive)?;
        probability("collateral_conservative", self.collateral_conservative)?;
        probability("poor_fit_threshold", self.poor_fit_threshold)?;
        non_negative("base_minutes_fast", self.base_minutes_fast)?;
        non_negative("base_minutes_slow", self.base_minutes_slow)?;
        non_negative("poor_fit_time_factor", self.poor_fit_time_factor)?;
        non_negative("success_time_factor", self.success_time_factor)
    }
}

impl OutcomeSimulator for EffectivenessModel {
    fn success_probability(&self, action: Action, context: &Context) -> f64 {
        let base = self.table.get(context.category(), action);
        let confidence_factor = 0.5 + 0.5 * context.confidence();
        self.band
            .clamp(base * self.severity.get(context.severity()) * confidence_factor)
    }

    fn simulate(&self, action: Action, context: &Context, rng: &mut dyn RngCore) -> Outcome {
        let p = self.success_probability(action, context);
        let success = rng.gen_bool(p);

        let confidence = context.confidence();
        let false_positive = !success && confidence < 0.5 && rng.gen_bool(0.5 - confidence);

        let collateral_p = if action.is_disruptive() {
            self.collateral_disruptive
        } else {
            self.collateral_conservative
        };
        let collateral_damage = success && rng.gen_bool(collateral_p);

        let base_minutes = match action.speed() {
            SpeedClass::Fast => self.base_minutes_fast,
            SpeedClass::Slow => self.base_minutes_slow,
        };
        let fit_factor = if self.table.get(context.category(), action) > self.poor_fit_threshold {
            1.0
        } else {
            self.poor_fit_time_factor
        };
        let center = base_minutes * fit_factor;
        let mut minutes = MinuteRange {
            low: center * 0.7,
            high: center * 1.5,
        }
        .sample(rng);
        if success {
            minutes *= self.success_time_factor;
        }

        let outcome = Outcome {
            success,
            false_positive,
            collateral_damage,
            attack_contained: success,
            time_to_remediate: minutes.max(f64::MIN_POSITIVE),
        };
        debug!(
            %action,
            category = %context.category(),
            severity = %context.severity(),
            p,
            success,
            "simulated outcome"
        );
        outcome
    }
}

// ---------- tiered fast-learning model ----------

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TierProbabilities {
    pub fast: f64,
    pub slow: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct TieredModel {
    /// High and critical severity.
    pub elevated: TierProbabilities,
    /// Low and medium severity.
    pub routine: TierProbabilities,
    pub low_confidence_factor: f64,
    pub high_confidence_factor: f64,
    pub band: ProbabilityBand,
    pub false_positive_p: f64,
    pub collateral_p: f64,
    pub fast_minutes: MinuteRange,
    pub slow_minutes: MinuteRange,
    pub success_time_factor: f64,
}

impl Default for TieredModel {
    fn default() -> Self {
        Self {
            elevated: TierProbabilities {
                fast: 0.85,
                slow: 0.20,
            },
            routine: TierProbabilities {
                fast: 0.80,
                slow: 0.75,
            },
            low_confidence_factor: 0.9,
            high_confidence_factor: 1.05,
            band: ProbabilityBand {
                min: 0.15,
                max: 0.95,
            },
            false_positive_p: 0.10,
            collateral_p: 0.05,
            fast_minutes: MinuteRange {
                low: 3.0,
                high: 12.0,
            },
            slow_minutes: MinuteRange {
                low: 15.0,
                high: 30.0,
            },
            success_time_factor: 0.8,
        }
    }
}

impl TieredModel {
    pub fn validate(&self) -> Result<()> {
        for (tier, probs) in [("elevated", self.elevated), ("routine", self.routine)] {
            probability(&format!("{tier}.fast"), probs.fast)?;
            probability(&format!("{tier}.slow"), probs.slow)?;
        }
        non_negative("low_confidence_factor", self.low_confidence_factor)?;
        non_negative("high_confidence_factor", self.high_confidence_factor)?;
        self.band.validate("band")?;
        probability("false_positive_p", self.false_positive_p)?;
        probability("collateral_p", self.collateral_p)?;
        self.fast_minutes.validate("fast_minutes")?;
        self.slow_minutes.validate("slow_minutes")?;
        non_negative("success_time_factor", self.success_time_factor)
    }
}

impl OutcomeSimulator for TieredModel {
    fn success_probability(&self, action: Action, context: &Context) -> f64 {
        let tier = if context.severity().is_elevated() {
            self.elevated
        } else {
            self.routine
        };
        let base = match action.speed() {
            SpeedClass::Fast => tier.fast,
            SpeedClass::Slow => tier.slow,
        };
        let factor = if context.confidence() < 0.5 {
            self.low_confidence_factor
        } else {
            self.high_confidence_factor
        };
        self.band.clamp(base * factor)
    }

    fn simulate(&self, action: Action, context: &Context, rng: &mut dyn RngCore) -> Outcome {
        let p = self.success_probability(action, context);
        let success = rng.gen_bool(p);
        let false_positive =
            !success && context.confidence() < 0.5 && rng.gen_bool(self.false_positive_p);
        let collateral_damage = success && rng.gen_bool(self.collateral_p);

        let range = match action.speed() {
            SpeedClass::Fast => self.fast_minutes,
            SpeedClass::Slow => self.slow_minutes,
        };
        let mut minutes = range.sample(rng);
        if success {
            minutes *= self.success_time_factor;
        }

        debug!(%action, p, success, "simulated outcome (tiered)");
        Outcome {
            success,
            false_positive,
            collateral_damage,
            attack_contained: success,
            time_to_remediate: minutes.max(f64::MIN_POSITIVE),
        }
    }
}

/// Config-level choice of outcome model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "model", rename_all = "snake_case")]
pub enum SimulatorConfig {
    Effectiveness(EffectivenessModel),
    Tiered(TieredModel),
}

impl Default for SimulatorConfig {
    fn default() -> Self {
        SimulatorConfig::Effectiveness(EffectivenessModel::default())
    }
}

impl SimulatorConfig {
    /// Rejects constants that would make `simulate` panic or produce
    /// probabilities outside [0, 1].
    pub fn validate(&self) -> Result<()> {
        match self {
            SimulatorConfig::Effectiveness(model) => model.validate(),
            SimulatorConfig::Tiered(model) => model.validate(),
        }
    }

    pub fn build(&self) -> Result<Box<dyn OutcomeSimulator>> {
        self.validate()?;
        Ok(match self {
            SimulatorConfig::Effectiveness(model) => Box::new(model.clone()),
            SimulatorConfig::Tiered(model) => Box::new(model.clone()),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    fn ctx(severity: Severity, category: AttackCategory, confidence: f64) -> Context {
        Context::new(severity, category, confidence, 4).unwrap()
    }

    fn assert_outcome_invariants(outcome: &Outcome, context: &Context) {
        assert!(outcome.time_to_remediate > 0.0);
        assert_eq!(outcome.attack_contained, outcome.success);
        if outcome.false_positive {
            assert!(!outcome.success);
            assert!(context.confidence() < 0.5);
        }
        if outcome.collateral_damage {
            assert!(outcome.success);
        }
    }

    #[test]
    fn effectiveness_probability_is_clamped() {
        let model = EffectivenessModel::default();
        for severity in Severity::ALL {
            for category in AttackCategory::ALL {
                for confidence in [0.0, 0.3, 0.7, 1.0] {
                    for action in Action::ALL {
                        let p = model.success_probability(action, &ctx(severity, category, confidence));
                        assert!((0.30..=0.95).contains(&p), "{p}");
                    }
                }
            }
        }
    }

    #[test]
    fn effectiveness_applies_severity_and_confidence() {
        let model = EffectivenessModel::default();
        let low = model.success_probability(
            Action::IsolateHost,
            &ctx(Severity::Low, AttackCategory::LateralMovement, 1.0),
        );
        let critical = model.success_probability(
            Action::IsolateHost,
            &ctx(Severity::Critical, AttackCategory::LateralMovement, 1.0),
        );
        assert!((low - 0.90).abs() < 1e-12);
        assert!((critical - 0.90 * 0.75).abs() < 1e-12);

        let unsure = model.success_probability(
            Action::IsolateHost,
            &ctx(Severity::Low, AttackCategory::LateralMovement, 0.5),
        );
        assert!((unsure - 0.90 * 0.75).abs() < 1e-12);
    }

    #[test]
    fn outcome_invariants_hold_for_both_models() {
        let models: [Box<dyn OutcomeSimulator>; 2] = [
            Box::new(EffectivenessModel::default()),
            Box::new(TieredModel::default()),
        ];
        let mut rng = StdRng::seed_from_u64(2024);
        for model in &models {
            for confidence in [0.05, 0.3, 0.49, 0.5, 0.95] {
                let context = ctx(Severity::High, AttackCategory::Phishing, confidence);
                for action in Action::ALL {
                    for _ in 0..50 {
                        let outcome = model.simulate(action, &context, &mut rng);
                        assert_outcome_invariants(&outcome, &context);
                    }
                }
            }
        }
    }

    #[test]
    fn well_matched_actions_succeed_more_often() {
        let model = EffectivenessModel::default();
        let context = ctx(Severity::Medium, AttackCategory::MalwareExecution, 0.9);
        let mut rng = StdRng::seed_from_u64(99);
        let rate = |action: Action, rng: &mut StdRng| {
            (0..4000)
                .filter(|_| model.simulate(action, &context, rng).success)
                .count()
        };
        let good = rate(Action::QuarantineArtifact, &mut rng);
        let poor = rate(Action::ResetCredentials, &mut rng);
        assert!(good > poor + 400, "good {good} poor {poor}");
    }

    #[test]
    fn tiered_model_penalizes_slow_actions_on_elevated_incidents() {
        let model = TieredModel::default();
        let elevated = ctx(Severity::Critical, AttackCategory::DataExfiltration, 0.8);
        assert!((model.success_probability(Action::NotifyTeam, &elevated) - 0.21).abs() < 1e-12);
        assert!((model.success_probability(Action::BlockTraffic, &elevated) - 0.8925).abs() < 1e-12);
        let unsure = ctx(Severity::Low, AttackCategory::DataExfiltration, 0.2);
        assert!((model.success_probability(Action::ScanSystem, &unsure) - 0.675).abs() < 1e-12);
    }

    #[test]
    fn tiered_times_follow_speed_class() {
        let model = TieredModel::default();
        let context = ctx(Severity::Low, AttackCategory::Phishing, 0.9);
        let mut rng = StdRng::seed_from_u64(5);
        for _ in 0..200 {
            let slow = model.simulate(Action::ScanSystem, &context, &mut rng);
            assert!(slow.time_to_remediate >= 15.0 * 0.8 && slow.time_to_remediate < 30.0);
            let fast = model.simulate(Action::LockAccount, &context, &mut rng);
            assert!(fast.time_to_remediate >= 3.0 * 0.8 && fast.time_to_remediate < 12.0);
        }
    }

    #[test]
    fn simulator_config_from_yaml() {
        let cfg: SimulatorConfig = serde_yaml_ng::from_str("model: tiered\ncollateral_p: 0.2\n").unwrap();
        match cfg {
            SimulatorConfig::Tiered(model) => {
                assert_eq!(model.collateral_p, 0.2);
                assert_eq!(model.elevated.slow, 0.20);
            }
            other => panic!("unexpected {other:?}"),
        }
        let default: SimulatorConfig = serde_yaml_ng::from_str("model: effectiveness").unwrap();
        assert_eq!(default, SimulatorConfig::default());
    }

    #[test]
    fn default_models_validate() {
        SimulatorConfig::default().validate().unwrap();
        SimulatorConfig::Tiered(TieredModel::default())
            .validate()
            .unwrap();
    }

    #[test]
    fn invalid_constants_are_rejected() {
        let inverted: SimulatorConfig =
            serde_yaml_ng::from_str("model: effectiveness\nband:\n  min: 0.9\n  max: 0.3\n")
                .unwrap();
        assert!(matches!(inverted.validate(), Err(PolicyError::Config(_))));
        assert!(inverted.build().is_err());

        let nan: SimulatorConfig =
            serde_yaml_ng::from_str("model: tiered\nfalse_positive_p: .nan\n").unwrap();
        assert!(nan.validate().is_err());

        let negative_minutes = SimulatorConfig::Tiered(TieredModel {
            slow_minutes: MinuteRange {
                low: -5.0,
                high: 30.0,
            },
            ..TieredModel::default()
        });
        assert!(negative_minutes.validate().is_err());

        let table: EffectivenessTable =
            serde_yaml_ng::from_str("phishing:\n  notify_team: 1.5\n").unwrap();
        let bad_cell = SimulatorConfig::Effectiveness(EffectivenessModel {
            table,
            ..EffectivenessModel::default()
        });
        assert!(bad_cell.validate().is_err());
    }

    #[test]
    fn effectiveness_table_override_falls_back_for_missing_cells() {
        let table: EffectivenessTable =
            serde_yaml_ng::from_str("phishing:\n  notify_team: 0.99\n").unwrap();
        assert_eq!(table.get(AttackCategory::Phishing, Action::NotifyTeam), 0.99);
        assert_eq!(table.get(AttackCategory::Phishing, Action::BlockTraffic), 0.60);
    }
}
