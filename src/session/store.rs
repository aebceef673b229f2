//! Durable thread → session map.
//!
//! The whole map lives in one JSON file, loaded fully at startup and
//! rewritten in full on every mutation. Writes go through a temp file and
//! rename so a crash mid-write never corrupts the map. Logical mutations
//! are serialized per thread by the coordinator; the lock here only
//! serializes the physical write across threads.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

/// Transient per-thread execution state. Never persisted: after a restart
/// nothing is running, so every record comes back `Idle`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SessionStatus {
    #[default]
    Idle,
    Running,
    Cancelling,
}

impl SessionStatus {
    pub fn display_name(self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Running => "running",
            Self::Cancelling => "cancelling",
        }
    }
}

/// One persisted session record per Discord thread.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SessionRecord {
    /// Discord thread id; primary key, immutable.
    pub thread_id: String,

    /// Derived worker session id. Recomputable from `thread_id` (+ salt),
    /// persisted for auditability.
    pub session_id: String,

    /// Per-thread model override; `None` means the configured default.
    #[serde(default)]
    pub model: Option<String>,

    /// Whether the first request for this `session_id` already reached the
    /// worker. Governs new-vs-resume invocation and must survive restarts.
    #[serde(default)]
    pub has_started: bool,

    pub created_at: String,
    pub last_used_at: String,

    #[serde(skip)]
    pub status: SessionStatus,
}

impl SessionRecord {
    pub fn new(thread_id: impl Into<String>, session_id: impl Into<String>) -> Self {
        let now = timestamp();
        Self {
            thread_id: thread_id.into(),
            session_id: session_id.into(),
            model: None,
            has_started: false,
            created_at: now.clone(),
            last_used_at: now,
            status: SessionStatus::Idle,
        }
    }

    pub fn touch(&mut self) {
        self.last_used_at = timestamp();
    }
}

/// Returns an RFC3339 UTC timestamp string.
fn timestamp() -> String {
    chrono::Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Secs, true)
}

/// The persisted session map is unreadable.
///
/// Fatal at startup: refusing to run beats silently dropping every thread's
/// session. The operator should move the file aside and restart.
#[derive(Debug)]
pub struct StoreCorrupt {
    pub path: PathBuf,
}

impl std::fmt::Display for StoreCorrupt {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "Session map at {} is unreadable; move it aside (e.g. append .bak) and restart",
            self.path.display()
        )
    }
}

impl std::error::Error for StoreCorrupt {}

/// In-memory session map with write-through persistence.
#[derive(Debug)]
pub struct SessionStore {
    path: PathBuf,
    records: Mutex<HashMap<String, SessionRecord>>,
}

impl SessionStore {
    /// Loads the store from a file, or starts empty if the file is absent.
    ///
    /// A present-but-unparseable file is a [`StoreCorrupt`] error, never an
    /// empty store.
    pub fn load(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let records = if path.exists() {
            let contents = fs::read_to_string(&path)
                .with_context(|| format!("Failed to read session map from {}", path.display()))?;
            serde_json::from_str::<HashMap<String, SessionRecord>>(&contents)
                .map_err(|_| StoreCorrupt { path: path.clone() })?
        } else {
            HashMap::new()
        };

        Ok(Self {
            path,
            records: Mutex::new(records),
        })
    }

    /// Returns a copy of the record for a thread, if any.
    pub fn get(&self, thread_id: &str) -> Option<SessionRecord> {
        self.records
            .lock()
            .expect("session map lock poisoned")
            .get(thread_id)
            .cloned()
    }

    /// Inserts or replaces a record and rewrites the file.
    pub fn upsert(&self, record: SessionRecord) -> Result<()> {
        let mut records = self.records.lock().expect("session map lock poisoned");
        records.insert(record.thread_id.clone(), record);
        Self::save(&self.path, &records)
    }

    /// Returns copies of all records.
    pub fn all(&self) -> Vec<SessionRecord> {
        self.records
            .lock()
            .expect("session map lock poisoned")
            .values()
            .cloned()
            .collect()
    }

    pub fn len(&self) -> usize {
        self.records
            .lock()
            .expect("session map lock poisoned")
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Rewrites the whole map atomically (temp file + rename).
    ///
    /// Called with the record lock held, which also serializes the physical
    /// write across concurrently-finishing threads.
    fn save(path: &Path, records: &HashMap<String, SessionRecord>) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create directory {}", parent.display()))?;
        }

        let contents =
            serde_json::to_string_pretty(records).context("Failed to serialize session map")?;

        let tmp_path = path.with_extension("json.tmp");
        fs::write(&tmp_path, contents)
            .with_context(|| format!("Failed to write session map to {}", tmp_path.display()))?;
        fs::rename(&tmp_path, path).with_context(|| {
            format!(
                "Failed to rename {} to {}",
                tmp_path.display(),
                path.display()
            )
        })?;

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use tempfile::tempdir;

    use super::*;

    #[test]
    fn missing_file_starts_empty() {
        let dir = tempdir().unwrap();
        let store = SessionStore::load(dir.path().join("sessions.json")).unwrap();
        assert!(store.is_empty());
        assert_eq!(store.get("1"), None);
    }

    #[test]
    fn upsert_then_reload_round_trips() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("sessions.json");

        let mut record = SessionRecord::new("42", "abc-def");
        record.model = Some("opus".to_string());
        record.has_started = true;

        let store = SessionStore::load(&path).unwrap();
        store.upsert(record.clone()).unwrap();
        drop(store); // simulated crash/restart

        let reloaded = SessionStore::load(&path).unwrap();
        let got = reloaded.get("42").unwrap();
        assert_eq!(got, record);
        // Transient state never survives a restart.
        assert_eq!(got.status, SessionStatus::Idle);
    }

    #[test]
    fn upsert_creates_parent_directories() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("nested").join("sessions.json");

        let store = SessionStore::load(&path).unwrap();
        store.upsert(SessionRecord::new("1", "sid")).unwrap();
        assert!(path.exists());
    }

    #[test]
    fn write_is_atomic_no_temp_file_left() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("sessions.json");

        let store = SessionStore::load(&path).unwrap();
        store.upsert(SessionRecord::new("1", "sid")).unwrap();
        store.upsert(SessionRecord::new("2", "sid2")).unwrap();

        assert!(path.exists());
        assert!(!path.with_extension("json.tmp").exists());
        assert_eq!(store.all().len(), 2);
    }

    #[test]
    fn corrupt_file_refuses_to_load() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("sessions.json");
        fs::write(&path, "{ this is not json").unwrap();

        let err = SessionStore::load(&path).unwrap_err();
        assert!(err.downcast_ref::<StoreCorrupt>().is_some());
        // The corrupt file is left in place for the operator.
        assert!(path.exists());
    }

    #[test]
    fn upsert_replaces_existing_record() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("sessions.json");
        let store = SessionStore::load(&path).unwrap();

        let mut record = SessionRecord::new("7", "first");
        store.upsert(record.clone()).unwrap();

        record.session_id = "second".to_string();
        record.has_started = false;
        store.upsert(record).unwrap();

        assert_eq!(store.len(), 1);
        assert_eq!(store.get("7").unwrap().session_id, "second");
    }
}
