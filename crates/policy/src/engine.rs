//! [`PolicyEngine`]: the one place the Q-table lives.
//!
//! Table, epsilon scheduler and exploration RNG sit behind a single
//! `RwLock`. Selection and update are one write critical section each;
//! snapshots hold the read lock until the store has written them.

use std::collections::BTreeMap;
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

use chrono::Utc;
use rand::rngs::StdRng;
use rand::SeedableRng;
use serde::Serialize;
use serde_json::json;
use tracing::{debug, info, warn};

use crate::action::{Action, ActionSet};
use crate::config::{EngineConfig, Hyperparameters};
use crate::context::Context;
use crate::encoder::{StateEncoder, StateKey};
use crate::error::{PolicyError, Result};
use crate::selector::{self, SelectionStrategy};
use crate::table::PolicyTable;
use crate::trainer::{DecayEvent, EpsilonScheduler, Trainer};
use crate::utils::events::{self, EventLog};
use crate::utils::policy_store::{Counters, PolicySnapshot, SnapshotStore, SNAPSHOT_VERSION};

/// What the engine chose for one context.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Decision {
    pub action: Action,
    pub is_exploration: bool,
    pub epsilon: f64,
    pub state_key: StateKey,
    /// Q-values before the decision, in action-set order.
    pub q_values: Vec<(Action, f64)>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EngineStatistics {
    pub episodes: u64,
    pub updates: u64,
    pub epsilon: f64,
    pub min_epsilon: f64,
    pub states: usize,
    pub action_distribution: BTreeMap<Action, u64>,
    pub mean_q: Option<f64>,
    pub max_q: Option<f64>,
}

#[derive(Debug)]
struct EngineState {
    table: PolicyTable,
    scheduler: EpsilonScheduler,
    rng: StdRng,
    action_counts: BTreeMap<Action, u64>,
    update_count: u64,
}

#[derive(Debug)]
pub struct PolicyEngine {
    actions: ActionSet,
    encoder: StateEncoder,
    strategy: SelectionStrategy,
    trainer: Trainer,
    state: RwLock<EngineState>,
    events: Option<EventLog>,
}

impl PolicyEngine {
    /// Fresh engine with an empty table.
    pub fn new(config: &EngineConfig, actions: ActionSet) -> Result<Self> {
        config.validate()?;
        let hp = config.hyperparameters();
        let scheduler = EpsilonScheduler::new(hp.epsilon, hp.epsilon_decay, hp.min_epsilon);
        let state = EngineState {
            table: PolicyTable::new(),
            scheduler,
            rng: rng_for(config.seed),
            action_counts: zero_counts(&actions),
            update_count: 0,
        };
        info!(
            profile = ?config.profile,
            actions = actions.len(),
            epsilon = hp.epsilon,
            alpha = hp.alpha,
            "policy engine initialized"
        );
        Ok(Self::assemble(config, actions, Trainer::from(&hp), state))
    }

    /// Resumes from `snapshot`.
    ///
    /// Learning rate, discount, `q_init` and decay come from the snapshot.
    /// Only the exploration floor is reconciled: it is the larger of the
    /// stored and the configured one, and a stored epsilon below it is
    /// raised. A snapshot trained over a different action set is rejected.
    pub fn from_snapshot(
        snapshot: PolicySnapshot,
        config: &EngineConfig,
        actions: ActionSet,
    ) -> Result<Self> {
        config.validate()?;
        if snapshot.actions != actions {
            return Err(PolicyError::ActionSetMismatch {
                stored: snapshot.actions.into(),
                configured: actions.into(),
            });
        }

        let runtime = config.hyperparameters();
        let stored = snapshot.hyperparameters;
        let differs = stored.alpha != runtime.alpha
            || stored.gamma != runtime.gamma
            || stored.q_init != runtime.q_init
            || stored.epsilon_decay != runtime.epsilon_decay;
        if differs {
            info!(
                alpha = stored.alpha,
                gamma = stored.gamma,
                q_init = stored.q_init,
                epsilon_decay = stored.epsilon_decay,
                "configured learning parameters differ, keeping the stored ones"
            );
        }
        let min_epsilon = stored.min_epsilon.max(runtime.min_epsilon);
        let mut epsilon = stored.epsilon;
        if epsilon < min_epsilon {
            info!(
                stored = epsilon,
                floor = min_epsilon,
                "raising restored epsilon to exploration floor"
            );
            epsilon = min_epsilon;
        }

        let scheduler = EpsilonScheduler::new(epsilon, stored.epsilon_decay, min_epsilon)
            .with_episodes(snapshot.counters.episode_count);
        let mut action_counts = zero_counts(&actions);
        action_counts.extend(snapshot.counters.action_counts);

        let states = snapshot.table.len();
        let state = EngineState {
            table: snapshot.table,
            scheduler,
            rng: rng_for(config.seed),
            action_counts,
            update_count: snapshot.counters.update_count,
        };
        info!(
            states,
            epsilon,
            min_epsilon,
            episodes = snapshot.counters.episode_count,
            saved_at = %snapshot.saved_at,
            "policy restored"
        );

        let engine = Self::assemble(config, actions, Trainer::from(&stored), state);
        engine.audit(
            events::RESTORE,
            &json!({
                "states": states,
                "epsilon": epsilon,
                "min_epsilon": min_epsilon,
                "saved_at": snapshot.saved_at,
            }),
        );
        Ok(engine)
    }

    /// Loads the latest snapshot from `store`.
    ///
    /// An empty store gives a fresh engine, and so does an unreadable one
    /// (with a warning). An action-set mismatch is an error.
    pub fn restore(
        store: &dyn SnapshotStore,
        config: &EngineConfig,
        actions: ActionSet,
    ) -> Result<Self> {
        match store.load_latest() {
            Ok(Some(snapshot)) => Self::from_snapshot(snapshot, config, actions),
            Ok(None) => {
                info!(store = %store.location(), "no snapshot found, starting fresh");
                Self::new(config, actions)
            }
            Err(err) => {
                warn!(
                    store = %store.location(),
                    error = %format!("{err:#}"),
                    "snapshot unreadable, starting with an empty table"
                );
                Self::new(config, actions)
            }
        }
    }

    fn assemble(
        config: &EngineConfig,
        actions: ActionSet,
        trainer: Trainer,
        state: EngineState,
    ) -> Self {
        Self {
            actions,
            encoder: config.encoder,
            strategy: config.selection,
            trainer,
            state: RwLock::new(state),
            events: config.audit_events.then(EventLog::in_data_dir),
        }
    }

    /// Routes audit events to `log` instead of the data directory.
    pub fn with_event_log(mut self, log: EventLog) -> Self {
        self.events = Some(log);
        self
    }

    pub fn actions(&self) -> &ActionSet {
        &self.actions
    }

    pub fn encoder(&self) -> &StateEncoder {
        &self.encoder
    }

    pub fn encode(&self, context: &Context) -> StateKey {
        self.encoder.encode(context)
    }

    pub fn decide(&self, context: &Context) -> Decision {
        let key = self.encode(context);
        self.select_for_key(key)
    }

    pub fn select_for_key(&self, key: StateKey) -> Decision {
        let decision = {
            let mut guard = self.write();
            let st = &mut *guard;
            let epsilon = st.scheduler.epsilon();
            let entry = st.table.entry_mut(&key, &self.actions, self.trainer.q_init);
            let selection =
                selector::select_action(entry, &self.actions, epsilon, &self.strategy, &mut st.rng);
            *st.action_counts.entry(selection.action).or_default() += 1;
            Decision {
                action: selection.action,
                is_exploration: selection.is_exploration,
                epsilon,
                state_key: key,
                q_values: selection.q_snapshot,
            }
        };

        debug!(
            state = %decision.state_key,
            action = %decision.action,
            exploration = decision.is_exploration,
            epsilon = decision.epsilon,
            "decision"
        );
        self.audit(
            events::DECIDE,
            &json!({
                "state": decision.state_key,
                "action": decision.action,
                "exploration": decision.is_exploration,
                "epsilon": decision.epsilon,
            }),
        );
        decision
    }

    /// Greedy choice for `key` without exploration or bookkeeping.
    pub fn best_action(&self, key: &StateKey) -> Action {
        let mut guard = self.write();
        let entry = guard.table.entry_mut(key, &self.actions, self.trainer.q_init);
        selector::best_action(entry, &self.actions)
    }

    /// Applies one TD update and returns the TD error.
    pub fn update(
        &self,
        key: &StateKey,
        action: Action,
        reward: f64,
        next: Option<&StateKey>,
    ) -> Result<f64> {
        if !self.actions.contains(action) {
            return Err(PolicyError::UnknownAction(format!(
                "{action} is not in the configured action set"
            )));
        }
        let td_error = {
            let mut guard = self.write();
            let st = &mut *guard;
            let td = self
                .trainer
                .update(&mut st.table, &self.actions, key, action, reward, next);
            st.update_count += 1;
            td
        };
        self.audit(
            events::UPDATE,
            &json!({
                "state": key,
                "action": action,
                "reward": reward,
                "td_error": td_error,
            }),
        );
        Ok(td_error)
    }

    /// Advances the exploration schedule by one completed trial.
    pub fn decay(&self) -> DecayEvent {
        let (event, episodes) = {
            let mut guard = self.write();
            let event = guard.scheduler.decay();
            (event, guard.scheduler.episodes())
        };
        if let DecayEvent::FloorReached { epsilon } = event {
            self.audit(
                events::EPSILON_FLOOR,
                &json!({ "epsilon": epsilon, "episodes": episodes }),
            );
        }
        event
    }

    pub fn epsilon(&self) -> f64 {
        self.read().scheduler.epsilon()
    }

    pub fn min_epsilon(&self) -> f64 {
        self.read().scheduler.min_epsilon()
    }

    /// Copy of the learned table, for inspection.
    pub fn table(&self) -> PolicyTable {
        self.read().table.clone()
    }

    pub fn q_values(&self, key: &StateKey) -> Option<Vec<(Action, f64)>> {
        let guard = self.read();
        let entry = guard.table.get(key)?;
        Some(self.actions.iter().map(|a| (a, entry.q(a))).collect())
    }

    pub fn statistics(&self) -> EngineStatistics {
        let guard = self.read();
        EngineStatistics {
            episodes: guard.scheduler.episodes(),
            updates: guard.update_count,
            epsilon: guard.scheduler.epsilon(),
            min_epsilon: guard.scheduler.min_epsilon(),
            states: guard.table.len(),
            action_distribution: guard.action_counts.clone(),
            mean_q: guard.table.mean_q(),
            max_q: guard.table.max_q(),
        }
    }

    pub fn snapshot(&self) -> PolicySnapshot {
        self.snapshot_from(&self.read())
    }

    fn snapshot_from(&self, st: &EngineState) -> PolicySnapshot {
        let sched = &st.scheduler;
        PolicySnapshot {
            version: SNAPSHOT_VERSION,
            actions: self.actions.clone(),
            hyperparameters: Hyperparameters {
                alpha: self.trainer.alpha,
                epsilon: sched.epsilon(),
                epsilon_decay: sched.epsilon_decay(),
                min_epsilon: sched.min_epsilon(),
                gamma: self.trainer.gamma,
                q_init: self.trainer.q_init,
            },
            counters: Counters {
                episode_count: sched.episodes(),
                update_count: st.update_count,
                action_counts: st.action_counts.clone(),
            },
            table: st.table.clone(),
            saved_at: Utc::now(),
        }
    }

    /// Saves a snapshot while holding the read lock.
    pub fn save_to(&self, store: &dyn SnapshotStore) -> Result<()> {
        let guard = self.read();
        let snapshot = self.snapshot_from(&guard);
        store.save(&snapshot)?;
        Ok(())
    }

    pub(crate) fn audit(&self, event: &str, payload: &serde_json::Value) {
        if let Some(log) = &self.events {
            log.write(event, payload);
        }
    }

    fn read(&self) -> RwLockReadGuard<'_, EngineState> {
        match self.state.read() {
            Ok(guard) => guard,
            Err(poisoned) => {
                warn!(error = "lock poisoned", "policy engine recovering lock (read)");
                poisoned.into_inner()
            }
        }
    }

    fn write(&self) -> RwLockWriteGuard<'_, EngineState> {
        match self.state.write() {
            Ok(guard) => guard,
            Err(poisoned) => {
                warn!(error = "lock poisoned", "policy engine recovering lock (write)");
                poisoned.into_inner()
            }
        }
    }
}

fn rng_for(seed: Option<u64>) -> StdRng {
    match seed {
        Some(seed) => StdRng::seed_from_u64(seed),
        None => StdRng::from_entropy(),
    }
}

fn zero_counts(actions: &ActionSet) -> BTreeMap<Action, u64> {
    actions.iter().map(|a| (a, 0)).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::{AttackCategory, Severity};
    use crate::utils::policy_store::FileStore;
    use std::sync::Arc;
    use std::thread;

    fn config(epsilon: f64, min_epsilon: f64) -> EngineConfig {
        EngineConfig {
            hyperparameters: Some(Hyperparameters {
                alpha: 0.1,
                epsilon,
                epsilon_decay: 0.99,
                min_epsilon,
                gamma: 0.95,
                q_init: 0.0,
            }),
            seed: Some(17),
            ..EngineConfig::default()
        }
    }

    fn ctx(severity: Severity, category: AttackCategory) -> Context {
        Context::new(severity, category, 0.9, 5).unwrap()
    }

    #[test]
    fn learns_the_only_rewarded_action() {
        let engine = PolicyEngine::new(&config(0.3, 0.05), ActionSet::all()).unwrap();
        let context = ctx(Severity::Critical, AttackCategory::LateralMovement);
        for _ in 0..500 {
            let d = engine.decide(&context);
            let reward = if d.action == Action::IsolateHost { 1.0 } else { -1.0 };
            engine.update(&d.state_key, d.action, reward, None).unwrap();
            engine.decay();
        }

        let key = engine.encode(&context);
        assert_eq!(key.as_str(), "critical_lateral_movement_c18_a3-5");
        assert_eq!(engine.best_action(&key), Action::IsolateHost);
        for _ in 0..100 {
            let d = engine.decide(&context);
            if !d.is_exploration {
                assert_eq!(d.action, Action::IsolateHost);
            }
        }
    }

    #[test]
    fn same_seed_same_decisions() {
        let run = || {
            let engine = PolicyEngine::new(&config(0.5, 0.05), ActionSet::all()).unwrap();
            let context = ctx(Severity::High, AttackCategory::Phishing);
            (0..50)
                .map(|i| {
                    let d = engine.decide(&context);
                    let reward = if i % 3 == 0 { 1.0 } else { -0.5 };
                    engine.update(&d.state_key, d.action, reward, None).unwrap();
                    d.action
                })
                .collect::<Vec<_>>()
        };
        assert_eq!(run(), run());
    }

    #[test]
    fn update_rejects_actions_outside_the_set() {
        let actions = ActionSet::new(vec![Action::NotifyTeam, Action::ScanSystem]).unwrap();
        let engine = PolicyEngine::new(&config(0.1, 0.01), actions).unwrap();
        let key = engine.encode(&ctx(Severity::Low, AttackCategory::Phishing));
        let err = engine.update(&key, Action::IsolateHost, 1.0, None);
        assert!(matches!(err, Err(PolicyError::UnknownAction(_))));
        assert_eq!(engine.statistics().updates, 0);
    }

    #[test]
    fn restore_raises_epsilon_to_the_stricter_floor() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileStore::new(dir.path());
        let engine = PolicyEngine::new(&config(0.06, 0.05), ActionSet::all()).unwrap();
        for category in [
            AttackCategory::Phishing,
            AttackCategory::DataExfiltration,
            AttackCategory::MalwareExecution,
        ] {
            let d = engine.decide(&ctx(Severity::Medium, category));
            engine.update(&d.state_key, d.action, 0.5, None).unwrap();
        }
        for _ in 0..50 {
            engine.decay();
        }
        assert_eq!(engine.epsilon(), 0.05);
        engine.save_to(&store).unwrap();

        let restored = PolicyEngine::restore(&store, &config(0.3, 0.2), ActionSet::all()).unwrap();
        assert!(restored.epsilon() >= 0.2);
        assert_eq!(restored.min_epsilon(), 0.2);
        let stats = restored.statistics();
        assert_eq!(stats.states, 3);
        assert_eq!(stats.updates, 3);
        assert_eq!(stats.episodes, 50);
        assert_eq!(restored.table(), engine.table());
    }

    #[test]
    fn restore_keeps_stored_learning_parameters() {
        let mut saved = config(0.3, 0.05);
        if let Some(hp) = saved.hyperparameters.as_mut() {
            hp.epsilon_decay = 0.9;
        }
        let engine = PolicyEngine::new(&saved, ActionSet::all()).unwrap();
        let d = engine.decide(&ctx(Severity::Low, AttackCategory::Phishing));
        engine.update(&d.state_key, d.action, 1.0, None).unwrap();
        let before = engine.snapshot().hyperparameters;

        let runtime = EngineConfig {
            seed: Some(3),
            ..EngineConfig::fast_learning()
        };
        let restored = PolicyEngine::from_snapshot(engine.snapshot(), &runtime, ActionSet::all())
            .unwrap();
        let after = restored.snapshot().hyperparameters;

        assert_eq!(
            after,
            Hyperparameters {
                epsilon: before.epsilon.max(0.15),
                min_epsilon: 0.15,
                ..before
            }
        );
        assert_eq!(after.alpha, 0.1);
        assert_eq!(after.epsilon_decay, 0.9);

        // new states start at the stored q_init, not the runtime 0.7
        let fresh = restored.decide(&ctx(Severity::Critical, AttackCategory::DataExfiltration));
        assert!(fresh.q_values.iter().all(|(_, q)| *q == 0.0));
    }

    #[test]
    fn restore_rejects_a_different_action_set() {
        let engine = PolicyEngine::new(&config(0.1, 0.01), ActionSet::all()).unwrap();
        let snapshot = engine.snapshot();
        let narrower = ActionSet::new(vec![Action::NotifyTeam]).unwrap();
        let err = PolicyEngine::from_snapshot(snapshot, &config(0.1, 0.01), narrower);
        assert!(matches!(err, Err(PolicyError::ActionSetMismatch { .. })));
    }

    #[test]
    fn corrupt_store_starts_fresh() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join("snapshot-00000000000000000001-000.json"),
            b"\0\0garbage",
        )
        .unwrap();
        let engine =
            PolicyEngine::restore(&FileStore::new(dir.path()), &config(0.1, 0.01), ActionSet::all())
                .unwrap();
        assert!(engine.table().is_empty());
        assert_eq!(engine.epsilon(), 0.1);
    }

    #[test]
    fn concurrent_decisions_and_updates_are_all_counted() {
        let engine = Arc::new(PolicyEngine::new(&config(0.2, 0.05), ActionSet::all()).unwrap());
        let workers: Vec<_> = AttackCategory::ALL
            .into_iter()
            .map(|category| {
                let engine = Arc::clone(&engine);
                thread::spawn(move || {
                    for _ in 0..200 {
                        let d = engine.decide(&ctx(Severity::High, category));
                        engine.update(&d.state_key, d.action, 0.1, None).unwrap();
                        engine.decay();
                    }
                })
            })
            .collect();
        for worker in workers {
            worker.join().unwrap();
        }

        let stats = engine.statistics();
        let total = 200 * AttackCategory::ALL.len() as u64;
        assert_eq!(stats.updates, total);
        assert_eq!(stats.episodes, total);
        assert_eq!(stats.action_distribution.values().sum::<u64>(), total);
        let visits: u64 = engine.table().iter().map(|(_, e)| e.visits).sum();
        assert_eq!(visits, total);
    }

    #[test]
    fn floor_event_is_audited_once() {
        let dir = tempfile::tempdir().unwrap();
        let engine = PolicyEngine::new(&config(0.5, 0.4), ActionSet::all())
            .unwrap()
            .with_event_log(EventLog::new(dir.path()));
        for _ in 0..100 {
            engine.decay();
        }
        let content: String = std::fs::read_dir(dir.path())
            .unwrap()
            .map(|f| std::fs::read_to_string(f.unwrap().path()).unwrap())
            .collect();
        assert_eq!(content.matches(events::EPSILON_FLOOR).count(), 1);
    }
}
