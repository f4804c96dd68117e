// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! Agent-level session records: `sessions/<agent>.json`.
//!
//! One record per agent in persistent session mode. A record is reused only
//! when the caller's working directory and runtime context match what the
//! session was created with; anything else clears the record and starts a
//! fresh session.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::{atomic::write_atomic, StateError};

pub const SESSION_RECORD_VERSION: u32 = 1;

/// Backend identity a session is bound to. A session created by one
/// backend (or inside a container) cannot be resumed by another.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RuntimeContext {
    /// Runtime adapter discriminator (`RuntimeAdapter::name()`).
    pub backend: String,
    /// Whether the runtime executed inside a container.
    #[serde(default)]
    pub docker: bool,
}

impl RuntimeContext {
    pub fn new(backend: impl Into<String>) -> Self {
        Self {
            backend: backend.into(),
            docker: false,
        }
    }
}

/// Why a stored session cannot be reused.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InvalidReason {
    WorkingDirectoryChanged,
    RuntimeContextChanged,
    Expired,
}

impl std::fmt::Display for InvalidReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::WorkingDirectoryChanged => write!(f, "working directory changed"),
            Self::RuntimeContextChanged => write!(f, "runtime context changed"),
            Self::Expired => write!(f, "expired"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SessionRecord {
    pub version: u32,
    pub session_id: String,
    pub agent_name: String,
    pub created_at: DateTime<Utc>,
    pub last_used_at: DateTime<Utc>,
    #[serde(default)]
    pub job_count: u64,
    /// Absolute working directory the session ran in, for reuse validation.
    pub working_directory: PathBuf,
    pub runtime_context: RuntimeContext,
}

impl SessionRecord {
    pub fn new(
        session_id: impl Into<String>,
        agent_name: impl Into<String>,
        working_directory: impl Into<PathBuf>,
        runtime_context: RuntimeContext,
    ) -> Self {
        let now = Utc::now();
        Self {
            version: SESSION_RECORD_VERSION,
            session_id: session_id.into(),
            agent_name: agent_name.into(),
            created_at: now,
            last_used_at: now,
            job_count: 1,
            working_directory: working_directory.into(),
            runtime_context,
        }
    }

    /// Validate this record against the caller's current request.
    /// `ttl` is optional; when given, records idle longer than the TTL are
    /// reported expired.
    pub fn is_reusable(
        &self,
        working_directory: &Path,
        runtime_context: &RuntimeContext,
        ttl: Option<Duration>,
        now: DateTime<Utc>,
    ) -> Result<(), InvalidReason> {
        if self.working_directory != working_directory {
            return Err(InvalidReason::WorkingDirectoryChanged);
        }
        if &self.runtime_context != runtime_context {
            return Err(InvalidReason::RuntimeContextChanged);
        }
        if let Some(ttl) = ttl {
            if expired_at(self.last_used_at, ttl, now) {
                return Err(InvalidReason::Expired);
            }
        }
        Ok(())
    }
}

/// Whether `at + ttl` has passed. Unrepresentable expiries (overflow)
/// count as never-expiring.
pub(crate) fn expired_at(at: DateTime<Utc>, ttl: Duration, now: DateTime<Utc>) -> bool {
    let Ok(ttl) = chrono::Duration::from_std(ttl) else {
        return false;
    };
    at.checked_add_signed(ttl).is_some_and(|expiry| expiry < now)
}

// ─── Store ────────────────────────────────────────────────────────────────────

/// Process-wide store of agent session records.
///
/// One file per agent under `<state>/sessions/`. Reads go through an
/// in-memory cache behind a mutex; writes are temp-file-then-rename.
pub struct SessionStore {
    dir: PathBuf,
    cache: Mutex<HashMap<String, Option<SessionRecord>>>,
}

impl SessionStore {
    pub fn new(state_root: &Path) -> Self {
        Self {
            dir: state_root.join("sessions"),
            cache: Mutex::new(HashMap::new()),
        }
    }

    fn path_for(&self, agent: &str) -> PathBuf {
        self.dir.join(format!("{agent}.json"))
    }

    /// Fetch the record for an agent. A corrupt file is logged and treated
    /// as absent; the caller starts a fresh session.
    pub fn get(&self, agent: &str) -> Option<SessionRecord> {
        let mut cache = self.cache.lock().unwrap();
        if let Some(cached) = cache.get(agent) {
            return cached.clone();
        }
        let loaded = match self.load(agent) {
            Ok(record) => record,
            Err(e) => {
                warn!(agent = %agent, error = %e, "session record unreadable, starting fresh");
                None
            }
        };
        cache.insert(agent.to_string(), loaded.clone());
        loaded
    }

    /// Typed load without the start-fresh policy, for callers that need
    /// the error (and for tests).
    pub fn load(&self, agent: &str) -> Result<Option<SessionRecord>, StateError> {
        let path = self.path_for(agent);
        let text = match fs::read_to_string(&path) {
            Ok(t) => t,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(StateError::io(&path, e)),
        };
        let record: SessionRecord =
            serde_json::from_str(&text).map_err(|e| StateError::corrupt(&path, e))?;
        if record.version != SESSION_RECORD_VERSION {
            return Err(StateError::VersionMismatch {
                path,
                found: record.version,
                expected: SESSION_RECORD_VERSION,
            });
        }
        Ok(Some(record))
    }

    pub fn put(&self, agent: &str, record: SessionRecord) -> Result<(), StateError> {
        let path = self.path_for(agent);
        let json = serde_json::to_string_pretty(&record)
            .map_err(|e| StateError::corrupt(&path, e))?;
        write_atomic(&path, json.as_bytes())?;
        self.cache
            .lock()
            .unwrap()
            .insert(agent.to_string(), Some(record));
        Ok(())
    }

    /// Remove the record. Returns `true` when one existed.
    pub fn clear(&self, agent: &str) -> bool {
        let existed = self.path_for(agent).exists();
        let _ = fs::remove_file(self.path_for(agent));
        self.cache.lock().unwrap().insert(agent.to_string(), None);
        existed
    }

    /// Delete records idle longer than `ttl`. Returns the number removed.
    pub fn cleanup_expired(&self, now: DateTime<Utc>, ttl: Duration) -> usize {
        let Ok(entries) = fs::read_dir(&self.dir) else {
            return 0;
        };
        let mut removed = 0;
        for entry in entries.flatten() {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            let Some(agent) = path.file_stem().and_then(|s| s.to_str()).map(String::from) else {
                continue;
            };
            match self.load(&agent) {
                Ok(Some(record)) if expired_at(record.last_used_at, ttl, now) => {
                    if self.clear(&agent) {
                        removed += 1;
                    }
                }
                Ok(_) => {}
                Err(e) => {
                    warn!(agent = %agent, error = %e, "removing unreadable session record");
                    if self.clear(&agent) {
                        removed += 1;
                    }
                }
            }
        }
        removed
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn store() -> (tempfile::TempDir, SessionStore) {
        let dir = tempfile::tempdir().unwrap();
        let store = SessionStore::new(dir.path());
        (dir, store)
    }

    fn record(agent: &str) -> SessionRecord {
        SessionRecord::new("S1", agent, "/work/repo", RuntimeContext::new("subprocess"))
    }

    #[test]
    fn put_then_get_round_trips() {
        let (_dir, store) = store();
        let r = record("coder");
        store.put("coder", r.clone()).unwrap();
        assert_eq!(store.get("coder"), Some(r));
    }

    #[test]
    fn get_missing_is_none() {
        let (_dir, store) = store();
        assert_eq!(store.get("ghost"), None);
    }

    #[test]
    fn clear_removes_record_and_reports_existence() {
        let (_dir, store) = store();
        store.put("coder", record("coder")).unwrap();
        assert!(store.clear("coder"));
        assert!(!store.clear("coder"));
        assert_eq!(store.get("coder"), None);
    }

    #[test]
    fn corrupt_file_reads_as_absent() {
        let (dir, store) = store();
        let path = dir.path().join("sessions/coder.json");
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(&path, "not json at all {").unwrap();
        assert_eq!(store.get("coder"), None);
        assert!(store.load("coder").is_err(), "typed load surfaces the error");
    }

    #[test]
    fn unknown_fields_are_rejected() {
        let (dir, store) = store();
        let path = dir.path().join("sessions/coder.json");
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(
            &path,
            r#"{"version":1,"session_id":"S","agent_name":"coder",
                "created_at":"2026-01-01T00:00:00Z","last_used_at":"2026-01-01T00:00:00Z",
                "working_directory":"/w","runtime_context":{"backend":"subprocess"},
                "surprise":true}"#,
        )
        .unwrap();
        assert!(store.load("coder").is_err());
    }

    #[test]
    fn reuse_rejects_changed_working_directory() {
        let r = record("coder");
        let ctx = RuntimeContext::new("subprocess");
        let err = r
            .is_reusable(Path::new("/other/repo"), &ctx, None, Utc::now())
            .unwrap_err();
        assert_eq!(err, InvalidReason::WorkingDirectoryChanged);
    }

    #[test]
    fn reuse_rejects_changed_runtime_context() {
        let r = record("coder");
        let err = r
            .is_reusable(
                Path::new("/work/repo"),
                &RuntimeContext::new("in_process"),
                None,
                Utc::now(),
            )
            .unwrap_err();
        assert_eq!(err, InvalidReason::RuntimeContextChanged);
    }

    #[test]
    fn reuse_honours_ttl() {
        let r = record("coder");
        let ctx = RuntimeContext::new("subprocess");
        let much_later = Utc::now() + chrono::Duration::hours(48);
        let err = r
            .is_reusable(
                Path::new("/work/repo"),
                &ctx,
                Some(Duration::from_secs(3600)),
                much_later,
            )
            .unwrap_err();
        assert_eq!(err, InvalidReason::Expired);

        assert!(r
            .is_reusable(Path::new("/work/repo"), &ctx, None, much_later)
            .is_ok());
    }

    #[test]
    fn cleanup_removes_only_expired() {
        let (_dir, store) = store();
        let mut old = record("old");
        old.last_used_at = Utc::now() - chrono::Duration::hours(50);
        store.put("old", old).unwrap();
        store.put("fresh", record("fresh")).unwrap();

        let removed = store.cleanup_expired(Utc::now(), Duration::from_secs(24 * 3600));
        assert_eq!(removed, 1);
        assert!(store.get("old").is_none());
        assert!(store.get("fresh").is_some());
    }
}
