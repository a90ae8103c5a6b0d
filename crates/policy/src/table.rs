//! The learned state of the policy.

use std::collections::{BTreeMap, HashMap};

use serde::{Deserialize, Serialize};
use tracing::info;

use crate::action::{Action, ActionSet};
use crate::encoder::StateKey;

/// Q-values and visit counters for one discretized state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PolicyEntry {
    pub q_values: BTreeMap<Action, f64>,
    #[serde(default)]
    pub action_visits: BTreeMap<Action, u64>,
    #[serde(default)]
    pub visits: u64,
}

impl PolicyEntry {
    fn fresh(actions: &ActionSet, q_init: f64) -> Self {
        Self {
            q_values: actions.iter().map(|a| (a, q_init)).collect(),
            action_visits: actions.iter().map(|a| (a, 0)).collect(),
            visits: 0,
        }
    }

    pub fn q(&self, action: Action) -> f64 {
        self.q_values.get(&action).copied().unwrap_or_default()
    }

    pub fn action_visits(&self, action: Action) -> u64 {
        self.action_visits.get(&action).copied().unwrap_or_default()
    }

    pub fn max_q(&self) -> f64 {
        self.q_values
            .values()
            .copied()
            .fold(f64::NEG_INFINITY, f64::max)
    }

    pub(crate) fn record_visit(&mut self, action: Action) {
        self.visits = self.visits.saturating_add(1);
        let count = self.action_visits.entry(action).or_default();
        *count = count.saturating_add(1);
    }
}

/// StateKey → [`PolicyEntry`], grown lazily and never shrunk.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PolicyTable {
    entries: HashMap<StateKey, PolicyEntry>,
}

impl PolicyTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the entry for `key`, initializing every action to `q_init`
    /// the first time the key is seen.
    pub fn entry_mut(
        &mut self,
        key: &StateKey,
        actions: &ActionSet,
        q_init: f64,
    ) -> &mut PolicyEntry {
        self.entries.entry(key.clone()).or_insert_with(|| {
            info!(state = %key, q_init, "new state");
            PolicyEntry::fresh(actions, q_init)
        })
    }

    pub fn get(&self, key: &StateKey) -> Option<&PolicyEntry> {
        self.entries.get(key)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&StateKey, &PolicyEntry)> {
        self.entries.iter()
    }

    /// Mean over all Q-values of every state, `None` for an empty table.
    pub fn mean_q(&self) -> Option<f64> {
        let (sum, n) = self
            .entries
            .values()
            .flat_map(|e| e.q_values.values())
            .fold((0.0, 0usize), |(s, n), q| (s + q, n + 1));
        (n > 0).then(|| sum / n as f64)
    }

    pub fn max_q(&self) -> Option<f64> {
        self.entries
            .values()
            .map(PolicyEntry::max_q)
            .reduce(f64::max)
    }

    /// True when every entry has a Q-value for exactly the actions in `actions`.
    pub(crate) fn covers_exactly(&self, actions: &ActionSet) -> bool {
        self.entries.values().all(|entry| {
            entry.q_values.len() == actions.len()
                && actions.iter().all(|a| entry.q_values.contains_key(&a))
        })
    }
}
