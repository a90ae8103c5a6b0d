use chrono::{DateTime, Datelike, SecondsFormat, Utc};
use serde_json::{json, Value};
use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;
use tracing::warn;

use crate::config::data_dir;

pub const DECIDE: &str = "policy.decide";
pub const UPDATE: &str = "policy.update";
pub const EPSILON_FLOOR: &str = "policy.epsilon_floor";
pub const RESTORE: &str = "policy.restore";
pub const TRAINING_FINISHED: &str = "training.finished";

/// Append-only audit trail, one `YYYY-MM.jsonl` file per month.
///
/// The directory is created on the first write. If that fails the log stays
/// disabled; auditing never fails a decision.
#[derive(Debug, Clone)]
pub struct EventLog {
    dir: PathBuf,
    ready: OnceLock<bool>,
}

impl EventLog {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            ready: OnceLock::new(),
        }
    }

    /// `<data_dir>/events`.
    pub fn in_data_dir() -> Self {
        Self::new(data_dir().join("events"))
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn month_file(&self, at: DateTime<Utc>) -> PathBuf {
        self.dir
            .join(format!("{:04}-{:02}.jsonl", at.year(), at.month()))
    }

    fn ensure_dir(&self) -> bool {
        *self.ready.get_or_init(|| match std::fs::create_dir_all(&self.dir) {
            Ok(()) => true,
            Err(err) => {
                warn!(
                    dir = %self.dir.display(),
                    error = %err,
                    "cannot create events directory, audit log disabled"
                );
                false
            }
        })
    }

    pub fn write(&self, event_type: &str, payload: &Value) {
        if !self.ensure_dir() {
            return;
        }
        let now = Utc::now();
        let record = json!({
            "ts": now.to_rfc3339_opts(SecondsFormat::Millis, true),
            "event": event_type,
            "payload": payload,
        });
        let path = self.month_file(now);
        // one write_all per record keeps concurrent appends line-atomic
        let mut line = record.to_string();
        line.push('\n');
        let appended = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .and_then(|mut file| file.write_all(line.as_bytes()));
        if let Err(err) = appended {
            warn!(path = %path.display(), event = event_type, error = %err, "failed to append event");
        }
    }
}
