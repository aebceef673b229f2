//! Session map durability across restarts.

use dgate::config::paths;
use dgate::session::{SessionRecord, SessionStore, StoreCorrupt};
use tempfile::TempDir;

#[test]
fn sessions_survive_a_reload() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("sessions.json");

    {
        let store = SessionStore::load(&path).unwrap();
        let mut record = SessionRecord::new("111", "sid-a");
        record.has_started = true;
        store.upsert(record).unwrap();
        store
            .upsert(SessionRecord::new("222", "sid-b"))
            .unwrap();
    }

    let store = SessionStore::load(&path).unwrap();
    assert_eq!(store.len(), 2);

    let record = store.get("111").unwrap();
    assert_eq!(record.session_id, "sid-a");
    assert!(record.has_started);
    assert!(!store.get("222").unwrap().has_started);
}

#[test]
fn corrupt_map_refuses_to_load() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("sessions.json");
    std::fs::write(&path, "{ not json").unwrap();

    let err = SessionStore::load(&path).unwrap_err();
    let corrupt = err
        .downcast_ref::<StoreCorrupt>()
        .expect("corruption should carry a StoreCorrupt");
    assert_eq!(corrupt.path, path);
}

#[test]
fn missing_map_starts_empty() {
    let dir = TempDir::new().unwrap();
    let store = SessionStore::load(dir.path().join("sessions.json")).unwrap();
    assert!(store.is_empty());
}

#[test]
fn dgate_home_controls_state_paths() {
    let dir = TempDir::new().unwrap();
    // SAFETY: the only env mutation in this test binary.
    unsafe { std::env::set_var("DGATE_HOME", dir.path()) };

    assert_eq!(paths::session_map_path(), dir.path().join("sessions.json"));
    assert_eq!(paths::transcripts_dir(), dir.path().join("transcripts"));
    assert_eq!(paths::config_path(), dir.path().join("config.toml"));

    unsafe { std::env::remove_var("DGATE_HOME") };
}
