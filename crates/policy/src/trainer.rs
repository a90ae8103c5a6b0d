//! Temporal-difference updates and the exploration schedule.

use tracing::{debug, warn};

use crate::action::{Action, ActionSet};
use crate::config::Hyperparameters;
use crate::encoder::StateKey;
use crate::table::PolicyTable;

/// One-step TD learner over a [`PolicyTable`].
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Trainer {
    pub alpha: f64,
    pub gamma: f64,
    pub q_init: f64,
}

impl From<&Hyperparameters> for Trainer {
    fn from(hp: &Hyperparameters) -> Self {
        Self {
            alpha: hp.alpha,
            gamma: hp.gamma,
            q_init: hp.q_init,
        }
    }
}

impl Trainer {
    /// Moves `Q[state][action]` toward the observed target and returns the TD error.
    ///
    /// Without a successor the target is the reward itself (bandit update);
    /// with one it is `reward + gamma * max Q[next]`.
    pub fn update(
        &self,
        table: &mut PolicyTable,
        actions: &ActionSet,
        state: &StateKey,
        action: Action,
        reward: f64,
        next_state: Option<&StateKey>,
    ) -> f64 {
        let target = match next_state {
            None => reward,
            Some(next) => {
                let next_max = table.entry_mut(next, actions, self.q_init).max_q();
                reward + self.gamma * next_max
            }
        };

        let entry = table.entry_mut(state, actions, self.q_init);
        let current = entry.q(action);
        let td_error = target - current;
        let new_q = current + self.alpha * td_error;
        entry.q_values.insert(action, new_q);

        debug!(
            state = %state,
            %action,
            reward,
            current,
            new_q,
            td_error,
            "q update"
        );
        td_error
    }
}

/// Emitted by [`EpsilonScheduler::decay`].
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum DecayEvent {
    Decayed { epsilon: f64 },
    /// The decay that first lands on the floor.
    FloorReached { epsilon: f64 },
    AtFloor,
}

/// Multiplicative epsilon decay, floored at `min_epsilon`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct EpsilonScheduler {
    epsilon: f64,
    epsilon_decay: f64,
    min_epsilon: f64,
    episodes: u64,
}

impl EpsilonScheduler {
    /// A starting `epsilon` below the floor is raised to it.
    pub fn new(epsilon: f64, epsilon_decay: f64, min_epsilon: f64) -> Self {
        Self {
            epsilon: epsilon.max(min_epsilon),
            epsilon_decay,
            min_epsilon,
            episodes: 0,
        }
    }

    pub(crate) fn with_episodes(mut self, episodes: u64) -> Self {
        self.episodes = episodes;
        self
    }

    pub fn epsilon(&self) -> f64 {
        self.epsilon
    }

    pub fn epsilon_decay(&self) -> f64 {
        self.epsilon_decay
    }

    pub fn min_epsilon(&self) -> f64 {
        self.min_epsilon
    }

    pub fn episodes(&self) -> u64 {
        self.episodes
    }

    pub fn at_floor(&self) -> bool {
        self.epsilon <= self.min_epsilon
    }

    /// Called once per completed trial.
    pub fn decay(&mut self) -> DecayEvent {
        self.episodes = self.episodes.saturating_add(1);
        if self.at_floor() {
            return DecayEvent::AtFloor;
        }

        self.epsilon = (self.epsilon * self.epsilon_decay).max(self.min_epsilon);
        if self.at_floor() {
            warn!(
                min_epsilon = self.min_epsilon,
                episodes = self.episodes,
                "epsilon reached its floor; raise min_epsilon for continued exploration"
            );
            DecayEvent::FloorReached {
                epsilon: self.epsilon,
            }
        } else {
            if self.episodes % 10 == 0 {
                debug!(episodes = self.episodes, epsilon = self.epsilon, "epsilon decayed");
            }
            DecayEvent::Decayed {
                epsilon: self.epsilon,
            }
        }
    }
}
