//! Epsilon-greedy action selection with two exploitation rules.

use rand::distributions::{Distribution, WeightedIndex};
use rand::seq::SliceRandom;
use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::action::{Action, ActionSet};
use crate::table::PolicyEntry;

const fn default_tie_tolerance() -> f64 {
    0.1
}

const fn default_softmax_ties() -> bool {
    true
}

const fn default_ucb_c() -> f64 {
    0.3
}

/// Rule used on the exploitation branch.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case", deny_unknown_fields)]
pub enum SelectionStrategy {
    /// Highest Q-value. With `softmax_ties`, every action within
    /// `tie_tolerance` of the maximum is drawn by softmax over its Q-value.
    Greedy {
        #[serde(default = "default_tie_tolerance")]
        tie_tolerance: f64,
        #[serde(default = "default_softmax_ties")]
        softmax_ties: bool,
    },
    /// `Q + c * sqrt(ln(state_visits + 1) / (action_visits + 1))`, argmax.
    Ucb {
        #[serde(default = "default_ucb_c")]
        c: f64,
    },
}

impl Default for SelectionStrategy {
    fn default() -> Self {
        SelectionStrategy::Greedy {
            tie_tolerance: default_tie_tolerance(),
            softmax_ties: default_softmax_ties(),
        }
    }
}

impl SelectionStrategy {
    pub fn ucb() -> Self {
        SelectionStrategy::Ucb { c: default_ucb_c() }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Selection {
    pub action: Action,
    pub is_exploration: bool,
    /// Q-values in action-set order, as seen before the selection.
    pub q_snapshot: Vec<(Action, f64)>,
}

/// Picks an action for `entry` and records the visit on it.
///
/// `entry` must have been initialized for `actions`.
pub fn select_action<R: Rng + ?Sized>(
    entry: &mut PolicyEntry,
    actions: &ActionSet,
    epsilon: f64,
    strategy: &SelectionStrategy,
    rng: &mut R,
) -> Selection {
    let q_snapshot: Vec<(Action, f64)> = actions.iter().map(|a| (a, entry.q(a))).collect();

    let is_exploration = rng.gen::<f64>() < epsilon;
    let action = if is_exploration {
        actions
            .as_slice()
            .choose(rng)
            .copied()
            .unwrap_or_else(|| actions.first())
    } else {
        match *strategy {
            SelectionStrategy::Greedy {
                tie_tolerance,
                softmax_ties,
            } => greedy(&q_snapshot, tie_tolerance, softmax_ties, rng),
            SelectionStrategy::Ucb { c } => ucb(entry, &q_snapshot, c),
        }
        .unwrap_or_else(|| actions.first())
    };

    debug_assert!(actions.contains(action));
    entry.record_visit(action);

    Selection {
        action,
        is_exploration,
        q_snapshot,
    }
}

/// Pure exploitation: first maximal Q-value in set order, no counters touched.
pub fn best_action(entry: &PolicyEntry, actions: &ActionSet) -> Action {
    argmax(actions.iter().map(|a| (a, entry.q(a))))
        .map(|(action, _)| action)
        .unwrap_or_else(|| actions.first())
}

fn greedy<R: Rng + ?Sized>(
    q_values: &[(Action, f64)],
    tie_tolerance: f64,
    softmax_ties: bool,
    rng: &mut R,
) -> Option<Action> {
    let best = argmax(q_values.iter().copied())?;
    if !softmax_ties {
        return Some(best.0);
    }

    let close: Vec<(Action, f64)> = q_values
        .iter()
        .copied()
        .filter(|(_, q)| *q >= best.1 - tie_tolerance)
        .collect();
    if close.len() < 2 {
        return Some(best.0);
    }

    // exp(q - max) keeps weights in (0, 1]
    let weights = close.iter().map(|(_, q)| (q - best.1).exp());
    match WeightedIndex::new(weights) {
        Ok(dist) => Some(close[dist.sample(rng)].0),
        Err(_) => Some(best.0),
    }
}

fn ucb(entry: &PolicyEntry, q_values: &[(Action, f64)], c: f64) -> Option<Action> {
    let state_visits = entry.visits as f64;
    let scored = q_values.iter().map(|&(action, q)| {
        let action_visits = entry.action_visits(action) as f64;
        let bonus = c * ((state_visits + 1.0).ln() / (action_visits + 1.0)).sqrt();
        (action, q + bonus)
    });
    argmax(scored).map(|(action, _)| action)
}

/// First maximal element; a NaN score never displaces an earlier one.
fn argmax(scores: impl Iterator<Item = (Action, f64)>) -> Option<(Action, f64)> {
    scores.fold(None, |best, (action, score)| match best {
        Some((_, top)) if score.is_nan() || score <= top => best,
        _ => Some((action, score)),
    })
}
