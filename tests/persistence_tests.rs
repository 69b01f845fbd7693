use chrono::{TimeZone, Utc};
use dealscope::alerts::{AlertCandidate, AlertKind, AlertOptions, Urgency};
use dealscope::changes::{ChangeDetector, ChangeEvent};
use dealscope::learning::LearningOptions;
use dealscope::store::{load_state, save_state, MemoryStore, OrgState, StateStore, STATE_VERSION};
use dealscope::workflow::Workflow;
use serde_json::json;
use std::fs;

fn populated_store() -> MemoryStore {
    let t = Utc.with_ymd_and_hms(2024, 4, 2, 10, 0, 0).unwrap();
    let mut state = OrgState::default();
    let mut wf = Workflow::new("d1");
    wf.value = Some(100.0);
    state.snapshot = Some(ChangeDetector::default().capture(&[wf], t));
    state.learning.observe(&ChangeEvent::manual("acme", "seed", t), true, t, &LearningOptions::default());
    state.alerts.submit(
        "acme",
        AlertCandidate { kind: AlertKind::CriticalHealth, urgency: Urgency::Critical, payload: json!({}) },
        t,
        &AlertOptions::default(),
    );
    let store = MemoryStore::new();
    store.put("acme", state);
    store
}

#[test]
fn state_survives_a_restart() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("nested").join("state.json");
    let store = populated_store();
    let exported = store.export(Utc::now());
    save_state(&path, &exported).unwrap();
    assert!(!path.with_extension("tmp").exists());

    let loaded = load_state(&path).expect("state");
    assert_eq!(loaded.version, STATE_VERSION);
    assert_eq!(loaded.saved_at, exported.saved_at);
    assert_eq!(loaded.organizations.len(), 1);

    let fresh = MemoryStore::new();
    fresh.import(loaded);
    assert_eq!(fresh.organizations(), vec!["acme".to_string()]);
    assert_eq!(fresh.learned_patterns(), 1);
    let acme = fresh.get("acme").unwrap();
    assert_eq!(acme.alerts.records().len(), 1);
    assert!(acme.snapshot.unwrap().workflows.contains_key("d1"));
}

#[test]
fn missing_file_is_a_cold_start() {
    let dir = tempfile::tempdir().unwrap();
    assert!(load_state(&dir.path().join("absent.json")).is_none());
}

#[test]
fn corrupt_file_is_a_cold_start() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("state.json");
    fs::write(&path, b"{ not json").unwrap();
    assert!(load_state(&path).is_none());
    fs::write(&path, br#"{"version": 1}"#).unwrap();
    assert!(load_state(&path).is_none());
}

#[test]
fn other_version_is_a_cold_start() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("state.json");
    let mut state = populated_store().export(Utc::now());
    state.version = 99;
    save_state(&path, &state).unwrap();
    assert!(load_state(&path).is_none());

    state.version = STATE_VERSION;
    save_state(&path, &state).unwrap();
    assert_eq!(load_state(&path).map(|s| s.organizations.len()), Some(1));
}
