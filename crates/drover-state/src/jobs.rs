// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! Job records: `jobs/<job-id>.json` plus a companion ND-JSON output log
//! `jobs/<job-id>.log`.
//!
//! The record is written once at creation and patched on status changes;
//! the log is append-only and strictly ordered within a job.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{
    atomic::{append_line, write_atomic},
    StateError,
};

pub const JOB_RECORD_VERSION: u32 = 1;

// ─── Job record ───────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Cancelled,
    TimedOut,
}

impl JobStatus {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::Pending | Self::Running)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TriggerSource {
    Scheduler,
    Chat,
    Webhook,
    Manual,
    WorkSource,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenStats {
    /// Largest cumulative input-token count observed across the job.
    #[serde(default)]
    pub cumulative_input: u64,
    #[serde(default)]
    pub last_output: u64,
    #[serde(default)]
    pub handoff_count: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct JobRecord {
    pub version: u32,
    pub id: String,
    pub agent_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub schedule_name: Option<String>,
    pub trigger_source: TriggerSource,
    pub prompt: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resume_session_id: Option<String>,
    pub status: JobStatus,
    /// Most recent session id; reassigned on handoff.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    pub started_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub tokens: TokenStats,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub summary: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl JobRecord {
    pub fn new(
        id: impl Into<String>,
        agent_name: impl Into<String>,
        trigger_source: TriggerSource,
        prompt: impl Into<String>,
    ) -> Self {
        Self {
            version: JOB_RECORD_VERSION,
            id: id.into(),
            agent_name: agent_name.into(),
            schedule_name: None,
            trigger_source,
            prompt: prompt.into(),
            resume_session_id: None,
            status: JobStatus::Pending,
            session_id: None,
            started_at: Utc::now(),
            finished_at: None,
            tokens: TokenStats::default(),
            summary: None,
            error: None,
        }
    }
}

/// Fields patched alongside a status update. `None` leaves the stored
/// value untouched.
#[derive(Debug, Clone, Default)]
pub struct StatusPatch {
    pub session_id: Option<String>,
    pub tokens: Option<TokenStats>,
    pub summary: Option<String>,
    pub error: Option<String>,
}

// ─── Output entries ───────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutputKind {
    System,
    Assistant,
    ToolUse,
    ToolResult,
    Result,
}

/// One line of the per-job output log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutputEntry {
    pub at: DateTime<Utc>,
    #[serde(rename = "type")]
    pub kind: OutputKind,
    /// System subtype: `init`, `compact_boundary`, `status`,
    /// `handoff_document`, `context_handoff`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subtype: Option<String>,
    #[serde(default)]
    pub content: serde_json::Value,
}

impl OutputEntry {
    pub fn new(kind: OutputKind, content: serde_json::Value) -> Self {
        Self {
            at: Utc::now(),
            kind,
            subtype: None,
            content,
        }
    }

    pub fn system(subtype: impl Into<String>, content: serde_json::Value) -> Self {
        Self {
            at: Utc::now(),
            kind: OutputKind::System,
            subtype: Some(subtype.into()),
            content,
        }
    }
}

// ─── Store ────────────────────────────────────────────────────────────────────

/// Append-only job store under `<state>/jobs/`.
///
/// One writer per job is guaranteed by the executor; the mutex serialises
/// status patches against output appends from the same job's tasks.
pub struct JobRecordStore {
    dir: PathBuf,
    write_lock: Mutex<()>,
}

impl JobRecordStore {
    pub fn new(state_root: &Path) -> Self {
        Self {
            dir: state_root.join("jobs"),
            write_lock: Mutex::new(()),
        }
    }

    fn record_path(&self, id: &str) -> PathBuf {
        self.dir.join(format!("{id}.json"))
    }

    fn log_path(&self, id: &str) -> PathBuf {
        self.dir.join(format!("{id}.log"))
    }

    /// Write the pending record. Returns the job id for convenience.
    pub fn create(&self, record: &JobRecord) -> Result<String, StateError> {
        let _guard = self.write_lock.lock().unwrap();
        self.write_record(record)?;
        Ok(record.id.clone())
    }

    fn write_record(&self, record: &JobRecord) -> Result<(), StateError> {
        let path = self.record_path(&record.id);
        let json =
            serde_json::to_string_pretty(record).map_err(|e| StateError::corrupt(&path, e))?;
        write_atomic(&path, json.as_bytes())
    }

    /// Atomic read-modify-write of status plus patch fields. Terminal
    /// statuses stamp `finished_at`.
    pub fn update_status(
        &self,
        id: &str,
        status: JobStatus,
        patch: StatusPatch,
    ) -> Result<(), StateError> {
        let _guard = self.write_lock.lock().unwrap();
        let mut record = self
            .load(id)?
            .ok_or_else(|| StateError::corrupt(self.record_path(id), "job record missing"))?;
        record.status = status;
        if status.is_terminal() && record.finished_at.is_none() {
            record.finished_at = Some(Utc::now());
        }
        if let Some(session_id) = patch.session_id {
            record.session_id = Some(session_id);
        }
        if let Some(tokens) = patch.tokens {
            record.tokens = tokens;
        }
        if let Some(summary) = patch.summary {
            record.summary = Some(summary);
        }
        if let Some(error) = patch.error {
            record.error = Some(error);
        }
        self.write_record(&record)
    }

    pub fn append_output(&self, id: &str, entry: &OutputEntry) -> Result<(), StateError> {
        let path = self.log_path(id);
        let line = serde_json::to_string(entry).map_err(|e| StateError::corrupt(&path, e))?;
        append_line(&path, &line)
    }

    pub fn load(&self, id: &str) -> Result<Option<JobRecord>, StateError> {
        let path = self.record_path(id);
        let text = match fs::read_to_string(&path) {
            Ok(t) => t,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(StateError::io(&path, e)),
        };
        let record: JobRecord =
            serde_json::from_str(&text).map_err(|e| StateError::corrupt(&path, e))?;
        Ok(Some(record))
    }

    /// Read the full output log, oldest first. Torn trailing lines (crash
    /// mid-append) are dropped rather than failing the whole read.
    pub fn read_output(&self, id: &str) -> Result<Vec<OutputEntry>, StateError> {
        let path = self.log_path(id);
        let text = match fs::read_to_string(&path) {
            Ok(t) => t,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(StateError::io(&path, e)),
        };
        Ok(text
            .lines()
            .filter(|l| !l.trim().is_empty())
            .filter_map(|l| serde_json::from_str(l).ok())
            .collect())
    }

    /// All job records, most recent first.
    pub fn list(&self, limit: Option<usize>) -> Result<Vec<JobRecord>, StateError> {
        let entries = match fs::read_dir(&self.dir) {
            Ok(e) => e,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(StateError::io(&self.dir, e)),
        };
        let mut records = Vec::new();
        for entry in entries.flatten() {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            if let Some(id) = path.file_stem().and_then(|s| s.to_str()) {
                if let Ok(Some(record)) = self.load(id) {
                    records.push(record);
                }
            }
        }
        records.sort_by(|a, b| b.started_at.cmp(&a.started_at));
        if let Some(n) = limit {
            records.truncate(n);
        }
        Ok(records)
    }

    /// Ids of jobs that never reached a terminal status (for startup
    /// worktree pruning).
    pub fn non_terminal_ids(&self) -> Vec<String> {
        self.list(None)
            .unwrap_or_default()
            .into_iter()
            .filter(|r| !r.status.is_terminal())
            .map(|r| r.id)
            .collect()
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn store() -> (tempfile::TempDir, JobRecordStore) {
        let dir = tempfile::tempdir().unwrap();
        let store = JobRecordStore::new(dir.path());
        (dir, store)
    }

    fn job(id: &str) -> JobRecord {
        JobRecord::new(id, "coder", TriggerSource::Manual, "do work")
    }

    #[test]
    fn create_then_load_round_trips() {
        let (_dir, store) = store();
        let record = job("j1");
        store.create(&record).unwrap();
        assert_eq!(store.load("j1").unwrap(), Some(record));
    }

    #[test]
    fn update_status_stamps_finished_at_on_terminal() {
        let (_dir, store) = store();
        store.create(&job("j1")).unwrap();
        store
            .update_status("j1", JobStatus::Running, StatusPatch::default())
            .unwrap();
        let running = store.load("j1").unwrap().unwrap();
        assert!(running.finished_at.is_none());

        store
            .update_status(
                "j1",
                JobStatus::Completed,
                StatusPatch {
                    summary: Some("done".into()),
                    ..StatusPatch::default()
                },
            )
            .unwrap();
        let done = store.load("j1").unwrap().unwrap();
        assert!(done.finished_at.is_some());
        assert_eq!(done.summary.as_deref(), Some("done"));
    }

    #[test]
    fn patch_preserves_unset_fields() {
        let (_dir, store) = store();
        store.create(&job("j1")).unwrap();
        store
            .update_status(
                "j1",
                JobStatus::Running,
                StatusPatch {
                    session_id: Some("S1".into()),
                    ..StatusPatch::default()
                },
            )
            .unwrap();
        store
            .update_status("j1", JobStatus::Completed, StatusPatch::default())
            .unwrap();
        let record = store.load("j1").unwrap().unwrap();
        assert_eq!(record.session_id.as_deref(), Some("S1"));
    }

    #[test]
    fn output_appends_in_order() {
        let (_dir, store) = store();
        store.create(&job("j1")).unwrap();
        store
            .append_output("j1", &OutputEntry::system("init", serde_json::json!({"session_id":"S1"})))
            .unwrap();
        store
            .append_output(
                "j1",
                &OutputEntry::new(OutputKind::Assistant, serde_json::json!({"text":"hi"})),
            )
            .unwrap();
        let entries = store.read_output("j1").unwrap();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].subtype.as_deref(), Some("init"));
        assert_eq!(entries[1].kind, OutputKind::Assistant);
    }

    #[test]
    fn read_output_of_missing_job_is_empty() {
        let (_dir, store) = store();
        assert!(store.read_output("ghost").unwrap().is_empty());
    }

    #[test]
    fn list_is_most_recent_first_and_limited() {
        let (_dir, store) = store();
        let mut a = job("a");
        a.started_at = Utc::now() - chrono::Duration::minutes(10);
        let b = job("b");
        store.create(&a).unwrap();
        store.create(&b).unwrap();
        let all = store.list(None).unwrap();
        assert_eq!(all[0].id, "b");
        let one = store.list(Some(1)).unwrap();
        assert_eq!(one.len(), 1);
    }

    #[test]
    fn non_terminal_ids_skip_finished_jobs() {
        let (_dir, store) = store();
        store.create(&job("open")).unwrap();
        store.create(&job("done")).unwrap();
        store
            .update_status("done", JobStatus::Completed, StatusPatch::default())
            .unwrap();
        assert_eq!(store.non_terminal_ids(), vec!["open".to_string()]);
    }

    #[test]
    fn status_terminality() {
        assert!(!JobStatus::Pending.is_terminal());
        assert!(!JobStatus::Running.is_terminal());
        assert!(JobStatus::Completed.is_terminal());
        assert!(JobStatus::Failed.is_terminal());
        assert!(JobStatus::Cancelled.is_terminal());
        assert!(JobStatus::TimedOut.is_terminal());
    }
}
