use anyhow::{bail, Context, Result};
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use tempfile::NamedTempFile;
use tracing::{debug, info};

use crate::action::{Action, ActionSet};
use crate::config::Hyperparameters;
use crate::table::PolicyTable;

pub const SNAPSHOT_VERSION: u32 = 1;

const FILE_PREFIX: &str = "snapshot-";
const FILE_SUFFIX: &str = ".json";

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Counters {
    pub episode_count: u64,
    pub update_count: u64,
    #[serde(default)]
    pub action_counts: BTreeMap<Action, u64>,
}

/// Everything needed to resume a policy.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PolicySnapshot {
    pub version: u32,
    pub actions: ActionSet,
    /// `epsilon` holds the value at save time, not the initial one.
    pub hyperparameters: Hyperparameters,
    pub counters: Counters,
    pub table: PolicyTable,
    pub saved_at: DateTime<Utc>,
}

impl PolicySnapshot {
    fn check(self) -> Result<Self> {
        if self.version > SNAPSHOT_VERSION {
            bail!(
                "snapshot version {} is newer than supported version {}",
                self.version,
                SNAPSHOT_VERSION
            );
        }
        if let Err(err) = self.hyperparameters.check_ranges() {
            bail!("snapshot hyperparameters are invalid: {err}");
        }
        if !self.table.covers_exactly(&self.actions) {
            bail!("snapshot table does not match its own action set");
        }
        Ok(self)
    }
}

/// Persistence backend for policy snapshots.
pub trait SnapshotStore: Send + Sync {
    fn save(&self, snapshot: &PolicySnapshot) -> Result<()>;

    /// Most recently saved snapshot, `None` when nothing was saved yet.
    fn load_latest(&self) -> Result<Option<PolicySnapshot>>;

    /// Human-readable location, for logs.
    fn location(&self) -> String;
}

/// Writes `snapshot` to `path` via a uniquely named temporary file in the
/// same directory, then renames it into place.
pub fn save_to_path(path: &Path, snapshot: &PolicySnapshot) -> Result<()> {
    let dir = match path.parent() {
        Some(dir) if !dir.as_os_str().is_empty() => dir,
        _ => Path::new("."),
    };
    fs::create_dir_all(dir)
        .with_context(|| format!("failed to create snapshot directory {}", dir.display()))?;
    let json = serde_json::to_vec_pretty(snapshot).context("failed to serialize snapshot")?;

    let mut tmp = NamedTempFile::new_in(dir)
        .with_context(|| format!("failed to create temporary file in {}", dir.display()))?;
    tmp.write_all(&json)
        .with_context(|| format!("failed to write {}", tmp.path().display()))?;
    tmp.persist(path)
        .with_context(|| format!("failed to move snapshot into place at {}", path.display()))?;

    info!(
        path = %path.display(),
        states = snapshot.table.len(),
        "policy snapshot saved"
    );
    Ok(())
}

pub fn load_from_path(path: &Path) -> Result<PolicySnapshot> {
    let raw = fs::read_to_string(path)
        .with_context(|| format!("failed to read snapshot {}", path.display()))?;
    let snapshot: PolicySnapshot = serde_json::from_str(&raw)
        .with_context(|| format!("failed to deserialize snapshot {}", path.display()))?;
    snapshot.check()
}

/// Directory of timestamped JSON snapshots; the newest file wins.
#[derive(Debug, Clone)]
pub struct FileStore {
    dir: PathBuf,
}

impl FileStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Snapshot files, oldest first.
    pub fn list(&self) -> Result<Vec<PathBuf>> {
        let entries = match fs::read_dir(&self.dir) {
            Ok(entries) => entries,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(err) => {
                return Err(err)
                    .with_context(|| format!("failed to list {}", self.dir.display()))
            }
        };

        let mut files = Vec::new();
        for entry in entries {
            let path = entry?.path();
            let is_snapshot = path
                .file_name()
                .and_then(|n| n.to_str())
                .is_some_and(|n| n.starts_with(FILE_PREFIX) && n.ends_with(FILE_SUFFIX));
            if is_snapshot {
                files.push(path);
            }
        }
        // zero-padded timestamps sort chronologically
        files.sort();
        Ok(files)
    }

    fn next_path(&self, saved_at: DateTime<Utc>) -> PathBuf {
        let nanos = saved_at.timestamp_nanos_opt().unwrap_or_default().max(0);
        let mut seq = 0u32;
        loop {
            let name = format!("{FILE_PREFIX}{nanos:020}-{seq:03}{FILE_SUFFIX}");
            let path = self.dir.join(name);
            if !path.exists() {
                return path;
            }
            seq += 1;
        }
    }
}

impl SnapshotStore for FileStore {
    fn save(&self, snapshot: &PolicySnapshot) -> Result<()> {
        save_to_path(&self.next_path(snapshot.saved_at), snapshot)
    }

    fn load_latest(&self) -> Result<Option<PolicySnapshot>> {
        match self.list()?.pop() {
            Some(path) => {
                debug!(path = %path.display(), "loading latest snapshot");
                load_from_path(&path).map(Some)
            }
            None => Ok(None),
        }
    }

    fn location(&self) -> String {
        self.dir.display().to_string()
    }
}

/// Append-only snapshot history in SQLite; the last inserted row wins.
#[derive(Debug, Clone)]
pub struct SqliteStore {
    path: PathBuf,
}

impl SqliteStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// `<dir>/policy.db`.
    pub fn in_dir(dir: &Path) -> Self {
        Self::new(dir.join("policy.db"))
    }

    // Connections are opened per call so the store stays Sync.
    fn conn(&self) -> Result<Connection> {
        if let Some(dir) = self.path.parent() {
            fs::create_dir_all(dir).ok();
        }
        let c = Connection::open(&self.path)
            .with_context(|| format!("failed to open {}", self.path.display()))?;
        c.execute_batch(
            r"
            CREATE TABLE IF NOT EXISTS policy_snapshot (
              id INTEGER PRIMARY KEY AUTOINCREMENT,
              saved_at INTEGER NOT NULL,
              states INTEGER NOT NULL,
              snapshot_json TEXT NOT NULL
            );
        ",
        )?;
        Ok(c)
    }

    pub fn count(&self) -> Result<u64> {
        let c = self.conn()?;
        let n: i64 = c.query_row("SELECT COUNT(*) FROM policy_snapshot", [], |row| row.get(0))?;
        Ok(u64::try_from(n).unwrap_or_default())
    }
}

impl SnapshotStore for SqliteStore {
    fn save(&self, snapshot: &PolicySnapshot) -> Result<()> {
        let c = self.conn()?;
        let js = serde_json::to_string(snapshot).context("failed to serialize snapshot")?;
        let states = i64::try_from(snapshot.table.len()).unwrap_or(i64::MAX);
        c.execute(
            "INSERT INTO policy_snapshot(saved_at, states, snapshot_json) VALUES (?1, ?2, ?3)",
            params![snapshot.saved_at.timestamp_millis(), states, js],
        )?;
        info!(
            path = %self.path.display(),
            states,
            "policy snapshot saved"
        );
        Ok(())
    }

    fn load_latest(&self) -> Result<Option<PolicySnapshot>> {
        let c = self.conn()?;
        let mut stmt =
            c.prepare("SELECT id, snapshot_json FROM policy_snapshot ORDER BY id DESC LIMIT 1")?;
        let mut rows = stmt.query([])?;
        if let Some(row) = rows.next()? {
            let id: i64 = row.get(0)?;
            let s: String = row.get(1)?;
            let snapshot: PolicySnapshot = serde_json::from_str(&s)
                .with_context(|| format!("failed to deserialize stored snapshot row {id}"))?;
            snapshot.check().map(Some)
        } else {
            Ok(None)
        }
    }

    fn location(&self) -> String {
        self.path.display().to_string()
    }
}
