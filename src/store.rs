//! Organization state and its persistence.
//!
//! Snapshots, learning records and alert history are the only state that
//! outlives an analysis pass. They live behind [`StateStore`] so the engine
//! never touches module-level globals.

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::io::Write;
use std::path::Path;
use thiserror::Error;
use tracing::{info, warn};

use crate::alerts::AlertLog;
use crate::changes::Snapshot;
use crate::learning::LearningBook;

pub const STATE_VERSION: u32 = 1;

#[derive(Debug, Error)]
pub enum PersistError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct OrgState {
    #[serde(default)]
    pub snapshot: Option<Snapshot>,
    #[serde(default)]
    pub learning: LearningBook,
    #[serde(default)]
    pub alerts: AlertLog,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PersistedState {
    pub version: u32,
    pub saved_at: DateTime<Utc>,
    pub organizations: BTreeMap<String, OrgState>,
}

/// Keyed organization state. `get`/`put` are each atomic; callers serialize
/// read-modify-write per organization themselves.
pub trait StateStore: Send + Sync {
    fn get(&self, organization_id: &str) -> Option<OrgState>;
    fn put(&self, organization_id: &str, state: OrgState);
    fn organizations(&self) -> Vec<String>;
    /// Learning records across all organizations.
    fn learned_patterns(&self) -> usize;
    fn export(&self, now: DateTime<Utc>) -> PersistedState;
    fn import(&self, state: PersistedState);
}

#[derive(Debug, Default)]
pub struct MemoryStore {
    orgs: RwLock<BTreeMap<String, OrgState>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl StateStore for MemoryStore {
    fn get(&self, organization_id: &str) -> Option<OrgState> {
        self.orgs.read().get(organization_id).cloned()
    }

    fn put(&self, organization_id: &str, state: OrgState) {
        self.orgs.write().insert(organization_id.to_string(), state);
    }

    fn organizations(&self) -> Vec<String> {
        self.orgs.read().keys().cloned().collect()
    }

    fn learned_patterns(&self) -> usize {
        self.orgs.read().values().map(|s| s.learning.len()).sum()
    }

    fn export(&self, now: DateTime<Utc>) -> PersistedState {
        PersistedState { version: STATE_VERSION, saved_at: now, organizations: self.orgs.read().clone() }
    }

    fn import(&self, state: PersistedState) {
        let mut orgs = self.orgs.write();
        for (org, s) in state.organizations {
            orgs.insert(org, s);
        }
    }
}

/// Write state next to `path` and rename it into place.
pub fn save_state(path: &Path, state: &PersistedState) -> Result<(), PersistError> {
    if let Some(dir) = path.parent() {
        if !dir.as_os_str().is_empty() {
            fs::create_dir_all(dir)?;
        }
    }
    let tmp = path.with_extension("tmp");
    {
        let mut f = fs::File::create(&tmp)?;
        let bytes = serde_json::to_vec_pretty(state)?;
        f.write_all(&bytes)?;
        f.sync_all()?;
    }
    fs::rename(&tmp, path)?;
    info!(path = %path.display(), organizations = state.organizations.len(), "learning state saved");
    Ok(())
}

/// Load persisted state. A missing or unreadable file means a cold start.
pub fn load_state(path: &Path) -> Option<PersistedState> {
    let raw = match fs::read(path) {
        Ok(raw) => raw,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            info!(path = %path.display(), "no persisted state; cold start");
            return None;
        }
        Err(e) => {
            warn!(path = %path.display(), error = %e, "cannot read persisted state; cold start");
            return None;
        }
    };
    match serde_json::from_slice::<PersistedState>(&raw) {
        Ok(state) if state.version != STATE_VERSION => {
            warn!(
                path = %path.display(),
                found = state.version,
                expected = STATE_VERSION,
                "persisted state has another version; cold start"
            );
            None
        }
        Ok(state) => {
            info!(path = %path.display(), organizations = state.organizations.len(), "learning state restored");
            Some(state)
        }
        Err(e) => {
            warn!(path = %path.display(), error = %e, "persisted state is corrupt; cold start");
            None
        }
    }
}
