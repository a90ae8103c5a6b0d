//! Repeated simulated trials: encode, select, simulate, shape, update, decay.

use std::collections::BTreeMap;
use std::time::{Duration, Instant};

use rand::seq::SliceRandom;
use rand::{Rng, RngCore};
use serde::Serialize;
use serde_json::json;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::action::Action;
use crate::context::{AttackCategory, Context, Severity};
use crate::engine::{Decision, PolicyEngine};
use crate::error::Result;
use crate::reward::{RewardFeedback, RewardShaper};
use crate::simulator::OutcomeSimulator;
use crate::utils::events;

/// Synthetic incident contexts for training.
///
/// Categories are visited round-robin so every category gets the same share
/// of trials; everything else is drawn at random.
#[derive(Debug, Clone)]
pub struct ScenarioSampler {
    categories: Vec<AttackCategory>,
    next: usize,
    min_confidence: f64,
    max_assets: u32,
}

impl Default for ScenarioSampler {
    fn default() -> Self {
        Self::new(AttackCategory::ALL.to_vec())
    }
}

impl ScenarioSampler {
    /// Falls back to all categories when `categories` is empty.
    pub fn new(categories: Vec<AttackCategory>) -> Self {
        let categories = if categories.is_empty() {
            AttackCategory::ALL.to_vec()
        } else {
            categories
        };
        Self {
            categories,
            next: 0,
            min_confidence: 0.3,
            max_assets: 30,
        }
    }

    pub fn sample(&mut self, rng: &mut dyn RngCore) -> Result<Context> {
        let category = self.categories[self.next % self.categories.len()];
        self.next = self.next.wrapping_add(1);

        let severity = Severity::ALL
            .choose(rng)
            .copied()
            .unwrap_or(Severity::Medium);
        let confidence = rng.gen_range(self.min_confidence..=1.0);
        let assets = rng.gen_range(0..=self.max_assets);

        Ok(Context::new(severity, category, confidence, assets)?
            .with_techniques(category.typical_techniques().iter().copied()))
    }
}

/// Result of one completed trial.
#[derive(Debug, Clone)]
pub struct Trial {
    pub decision: Decision,
    pub feedback: RewardFeedback,
    pub td_error: f64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct TrainingReport {
    pub episodes: u64,
    pub cancelled: bool,
    pub successes: u64,
    pub failures: u64,
    pub false_positives: u64,
    pub collateral_incidents: u64,
    pub explorations: u64,
    pub average_reward: f64,
    pub average_time_to_remediate: f64,
    pub action_distribution: BTreeMap<Action, u64>,
    pub final_epsilon: f64,
    pub states: usize,
    #[serde(with = "duration_ms")]
    pub elapsed: Duration,
}

impl TrainingReport {
    pub fn success_rate(&self) -> f64 {
        if self.episodes == 0 {
            0.0
        } else {
            self.successes as f64 / self.episodes as f64
        }
    }

    fn record(&mut self, trial: &Trial) {
        let outcome = &trial.feedback.outcome;
        self.episodes += 1;
        if outcome.success {
            self.successes += 1;
        } else {
            self.failures += 1;
        }
        self.false_positives += u64::from(outcome.false_positive);
        self.collateral_incidents += u64::from(outcome.collateral_damage);
        self.explorations += u64::from(trial.decision.is_exploration);
        *self
            .action_distribution
            .entry(trial.decision.action)
            .or_default() += 1;

        // running means
        let n = self.episodes as f64;
        self.average_reward += (trial.feedback.total - self.average_reward) / n;
        self.average_time_to_remediate +=
            (outcome.time_to_remediate - self.average_time_to_remediate) / n;
    }
}

mod duration_ms {
    use serde::Serializer;
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(u64::try_from(d.as_millis()).unwrap_or(u64::MAX))
    }
}

pub struct TrainingLoop<'a> {
    engine: &'a PolicyEngine,
    simulator: &'a dyn OutcomeSimulator,
    shaper: RewardShaper,
    progress_every: u64,
}

impl<'a> TrainingLoop<'a> {
    pub fn new(
        engine: &'a PolicyEngine,
        simulator: &'a dyn OutcomeSimulator,
        shaper: RewardShaper,
    ) -> Self {
        Self {
            engine,
            simulator,
            shaper,
            progress_every: 100,
        }
    }

    /// Episodes between progress log lines; 0 disables them.
    pub fn progress_every(mut self, episodes: u64) -> Self {
        self.progress_every = episodes;
        self
    }

    /// One full cycle for `context`. The scheduler advances once at the end.
    pub fn run_trial(&self, context: &Context, rng: &mut dyn RngCore) -> Result<Trial> {
        let decision = self.engine.decide(context);
        let outcome = self.simulator.simulate(decision.action, context, rng);
        let feedback = self.shaper.shape(&outcome);
        let td_error =
            self.engine
                .update(&decision.state_key, decision.action, feedback.total, None)?;
        self.engine.decay();
        Ok(Trial {
            decision,
            feedback,
            td_error,
        })
    }

    /// Runs up to `episodes` trials. `cancel` is checked before each trial,
    /// so a cancelled run always ends on a completed update.
    pub fn run(
        &self,
        sampler: &mut ScenarioSampler,
        episodes: u64,
        cancel: &CancellationToken,
        rng: &mut dyn RngCore,
    ) -> Result<TrainingReport> {
        let started = Instant::now();
        let mut report = TrainingReport::default();
        info!(episodes, epsilon = self.engine.epsilon(), "training started");

        for episode in 1..=episodes {
            if cancel.is_cancelled() {
                info!(completed = report.episodes, "training cancelled");
                report.cancelled = true;
                break;
            }

            let context = sampler.sample(rng)?;
            let trial = self.run_trial(&context, rng)?;
            report.record(&trial);

            if self.progress_every > 0 && episode % self.progress_every == 0 {
                let stats = self.engine.statistics();
                info!(
                    episode,
                    of = episodes,
                    success_rate = report.success_rate(),
                    avg_reward = report.average_reward,
                    epsilon = stats.epsilon,
                    states = stats.states,
                    "training progress"
                );
            }
        }

        let stats = self.engine.statistics();
        report.final_epsilon = stats.epsilon;
        report.states = stats.states;
        report.elapsed = started.elapsed();

        info!(
            episodes = report.episodes,
            cancelled = report.cancelled,
            success_rate = report.success_rate(),
            avg_reward = report.average_reward,
            states = report.states,
            "training finished"
        );
        self.engine.audit(
            events::TRAINING_FINISHED,
            &json!({
                "episodes": report.episodes,
                "cancelled": report.cancelled,
                "success_rate": report.success_rate(),
                "average_reward": report.average_reward,
                "states": report.states,
            }),
        );
        Ok(report)
    }
}
