//! Closed set of remediation actions and the normalization of external names.
//!
//! Recommendation engines and operators refer to actions by loose strings
//! ("Block IP", "kill-process", "ISOLATE_HOST"). Everything that enters the
//! engine goes through [`normalize_action`] exactly once; no other call site
//! does string matching.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::error::{PolicyError, Result};

/// A remediation action the policy can choose.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Action {
    BlockTraffic,
    LockAccount,
    TerminateProcess,
    IsolateHost,
    NotifyTeam,
    ScanSystem,
    ResetCredentials,
    QuarantineArtifact,
}

/// Speed class used by the outcome models to center remediation time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SpeedClass {
    Fast,
    Slow,
}

/// Fallback for external action names that match nothing in the closed set.
///
/// Notifying the team is the only action without side effects on hosts,
/// accounts or traffic, so an unrecognized plan never triggers enforcement.
pub const FALLBACK_ACTION: Action = Action::NotifyTeam;

impl Action {
    pub const ALL: [Action; 8] = [
        Action::BlockTraffic,
        Action::LockAccount,
        Action::TerminateProcess,
        Action::IsolateHost,
        Action::NotifyTeam,
        Action::ScanSystem,
        Action::ResetCredentials,
        Action::QuarantineArtifact,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Action::BlockTraffic => "block_traffic",
            Action::LockAccount => "lock_account",
            Action::TerminateProcess => "terminate_process",
            Action::IsolateHost => "isolate_host",
            Action::NotifyTeam => "notify_team",
            Action::ScanSystem => "scan_system",
            Action::ResetCredentials => "reset_credentials",
            Action::QuarantineArtifact => "quarantine_artifact",
        }
    }

    /// Names used by older plans and snapshots for the same actions.
    fn aliases(self) -> &'static [&'static str] {
        match self {
            Action::BlockTraffic => &["block_ip", "block"],
            Action::TerminateProcess => &["kill_process", "kill"],
            Action::IsolateHost => &["isolate"],
            Action::QuarantineArtifact => &["quarantine_file", "quarantine"],
            Action::NotifyTeam => &["notify"],
            Action::ScanSystem => &["scan"],
            Action::LockAccount | Action::ResetCredentials => &[],
        }
    }

    pub fn speed(self) -> SpeedClass {
        match self {
            Action::NotifyTeam | Action::ScanSystem => SpeedClass::Slow,
            _ => SpeedClass::Fast,
        }
    }

    /// Actions that interrupt legitimate service when they hit the wrong target.
    pub fn is_disruptive(self) -> bool {
        matches!(
            self,
            Action::IsolateHost | Action::TerminateProcess | Action::BlockTraffic
        )
    }
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

fn canonical(raw: &str) -> String {
    raw.trim()
        .chars()
        .map(|c| match c {
            ' ' | '-' | '.' => '_',
            other => other.to_ascii_lowercase(),
        })
        .collect()
}

/// Strict parse: canonical names and aliases only, error otherwise.
impl FromStr for Action {
    type Err = PolicyError;

    fn from_str(s: &str) -> Result<Self> {
        let key = canonical(s);
        Action::ALL
            .into_iter()
            .find(|action| action.as_str() == key || action.aliases().contains(&key.as_str()))
            .ok_or_else(|| PolicyError::UnknownAction(s.to_string()))
    }
}

/// Maps an externally supplied action name onto the closed set.
///
/// Matching ignores case and treats spaces, hyphens and underscores alike.
/// Unknown names resolve to [`FALLBACK_ACTION`].
pub fn normalize_action(raw: &str) -> Action {
    match raw.parse() {
        Ok(action) => action,
        Err(_) => {
            warn!(
                raw,
                fallback = %FALLBACK_ACTION,
                "unknown action name, using fallback"
            );
            FALLBACK_ACTION
        }
    }
}

/// The ordered, duplicate-free list of actions an engine decides over.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "Vec<Action>", into = "Vec<Action>")]
pub struct ActionSet(Vec<Action>);

impl ActionSet {
    pub fn new(actions: Vec<Action>) -> Result<Self> {
        if actions.is_empty() {
            return Err(PolicyError::InvalidActionSet("action set is empty".into()));
        }
        for (idx, action) in actions.iter().enumerate() {
            if actions[..idx].contains(action) {
                return Err(PolicyError::InvalidActionSet(format!(
                    "duplicate action {action}"
                )));
            }
        }
        Ok(Self(actions))
    }

    pub fn all() -> Self {
        Self(Action::ALL.to_vec())
    }

    /// First action in set order; sets are never empty.
    pub fn first(&self) -> Action {
        self.0[0]
    }

    pub fn as_slice(&self) -> &[Action] {
        &self.0
    }

    pub fn iter(&self) -> impl Iterator<Item = Action> + '_ {
        self.0.iter().copied()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn contains(&self, action: Action) -> bool {
        self.0.contains(&action)
    }
}

impl Default for ActionSet {
    fn default() -> Self {
        Self::all()
    }
}

impl TryFrom<Vec<Action>> for ActionSet {
    type Error = PolicyError;

    fn try_from(actions: Vec<Action>) -> Result<Self> {
        Self::new(actions)
    }
}

impl From<ActionSet> for Vec<Action> {
    fn from(set: ActionSet) -> Self {
        set.0
    }
}
