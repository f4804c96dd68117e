// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! Per-schedule state: `schedules/<agent>/<schedule>.yaml`.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::{atomic::write_atomic, StateError};

pub const SCHEDULE_STATE_VERSION: u32 = 1;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ScheduleState {
    #[serde(default)]
    pub version: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_run_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub next_run_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub consecutive_errors: u32,
    /// Set after repeated failures; a disabled schedule never fires until
    /// the operator clears the flag (or the state file).
    #[serde(default)]
    pub auto_disabled: bool,
}

impl ScheduleState {
    pub fn new() -> Self {
        Self {
            version: SCHEDULE_STATE_VERSION,
            ..Self::default()
        }
    }
}

pub struct ScheduleStateStore {
    dir: PathBuf,
    lock: Mutex<()>,
}

impl ScheduleStateStore {
    pub fn new(state_root: &Path) -> Self {
        Self {
            dir: state_root.join("schedules"),
            lock: Mutex::new(()),
        }
    }

    fn path_for(&self, agent: &str, schedule: &str) -> PathBuf {
        self.dir.join(agent).join(format!("{schedule}.yaml"))
    }

    /// Load schedule state; a missing or corrupt file yields fresh state.
    pub fn get(&self, agent: &str, schedule: &str) -> ScheduleState {
        let _guard = self.lock.lock().unwrap();
        let path = self.path_for(agent, schedule);
        let text = match fs::read_to_string(&path) {
            Ok(t) => t,
            Err(_) => return ScheduleState::new(),
        };
        match serde_yaml::from_str::<ScheduleState>(&text) {
            Ok(state) if state.version == SCHEDULE_STATE_VERSION => state,
            Ok(_) | Err(_) => {
                warn!(path = %path.display(), "schedule state unreadable, starting fresh");
                ScheduleState::new()
            }
        }
    }

    pub fn put(
        &self,
        agent: &str,
        schedule: &str,
        state: &ScheduleState,
    ) -> Result<(), StateError> {
        let _guard = self.lock.lock().unwrap();
        let path = self.path_for(agent, schedule);
        let yaml = serde_yaml::to_string(state).map_err(|e| StateError::corrupt(&path, e))?;
        write_atomic(&path, yaml.as_bytes())
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_state_is_fresh() {
        let dir = tempfile::tempdir().unwrap();
        let store = ScheduleStateStore::new(dir.path());
        let state = store.get("coder", "nightly");
        assert_eq!(state.consecutive_errors, 0);
        assert!(state.last_run_at.is_none());
    }

    #[test]
    fn put_then_get_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let store = ScheduleStateStore::new(dir.path());
        let mut state = ScheduleState::new();
        state.last_run_at = Some(Utc::now());
        state.consecutive_errors = 2;
        store.put("coder", "nightly", &state).unwrap();
        assert_eq!(store.get("coder", "nightly"), state);
    }

    #[test]
    fn corrupt_state_starts_fresh() {
        let dir = tempfile::tempdir().unwrap();
        let store = ScheduleStateStore::new(dir.path());
        let path = dir.path().join("schedules/coder/nightly.yaml");
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(&path, "][").unwrap();
        assert_eq!(store.get("coder", "nightly"), ScheduleState::new());
    }
}
