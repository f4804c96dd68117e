// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! Conversation-key records: `chat-sessions/<platform>/<agent>.yaml`.
//!
//! One session per (agent, conversation key). The key is the channel id
//! for chat platforms and the issue id for issue trackers; threads are a
//! UI grouping, never a session key.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::{atomic::write_atomic, StateError};

pub const CONVERSATION_FILE_VERSION: u32 = 1;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ConversationRecord {
    pub session_id: String,
    pub last_activity_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub branch_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub issue_identifier: Option<String>,
}

impl ConversationRecord {
    pub fn new(session_id: impl Into<String>) -> Self {
        Self {
            session_id: session_id.into(),
            last_activity_at: Utc::now(),
            branch_name: None,
            issue_identifier: None,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
struct ConversationFile {
    version: u32,
    #[serde(default)]
    conversations: HashMap<String, ConversationRecord>,
}

/// Store of per-(platform, agent) conversation files.
///
/// Files are cached in memory behind one mutex; every mutation rewrites
/// the owning file atomically.
pub struct ConversationKeyStore {
    dir: PathBuf,
    cache: Mutex<HashMap<(String, String), HashMap<String, ConversationRecord>>>,
}

impl ConversationKeyStore {
    pub fn new(state_root: &Path) -> Self {
        Self {
            dir: state_root.join("chat-sessions"),
            cache: Mutex::new(HashMap::new()),
        }
    }

    fn path_for(&self, platform: &str, agent: &str) -> PathBuf {
        self.dir.join(platform).join(format!("{agent}.yaml"))
    }

    fn load_file(&self, platform: &str, agent: &str) -> HashMap<String, ConversationRecord> {
        let path = self.path_for(platform, agent);
        let text = match fs::read_to_string(&path) {
            Ok(t) => t,
            Err(_) => return HashMap::new(),
        };
        match serde_yaml::from_str::<ConversationFile>(&text) {
            Ok(file) if file.version == CONVERSATION_FILE_VERSION => file.conversations,
            Ok(file) => {
                warn!(
                    path = %path.display(),
                    found = file.version,
                    "conversation file version mismatch, starting fresh"
                );
                HashMap::new()
            }
            Err(e) => {
                warn!(path = %path.display(), error = %e, "conversation file corrupt, starting fresh");
                HashMap::new()
            }
        }
    }

    fn with_file<R>(
        &self,
        platform: &str,
        agent: &str,
        f: impl FnOnce(&mut HashMap<String, ConversationRecord>) -> R,
    ) -> Result<R, StateError> {
        let mut cache = self.cache.lock().unwrap();
        let key = (platform.to_string(), agent.to_string());
        let map = cache
            .entry(key)
            .or_insert_with(|| self.load_file(platform, agent));
        let result = f(map);

        let file = ConversationFile {
            version: CONVERSATION_FILE_VERSION,
            conversations: map.clone(),
        };
        let path = self.path_for(platform, agent);
        let yaml = serde_yaml::to_string(&file).map_err(|e| StateError::corrupt(&path, e))?;
        write_atomic(&path, yaml.as_bytes())?;
        Ok(result)
    }

    pub fn get(&self, platform: &str, agent: &str, key: &str) -> Option<ConversationRecord> {
        let mut cache = self.cache.lock().unwrap();
        let cache_key = (platform.to_string(), agent.to_string());
        let map = cache
            .entry(cache_key)
            .or_insert_with(|| self.load_file(platform, agent));
        map.get(key).cloned()
    }

    pub fn put(
        &self,
        platform: &str,
        agent: &str,
        key: &str,
        record: ConversationRecord,
    ) -> Result<(), StateError> {
        self.with_file(platform, agent, |map| {
            map.insert(key.to_string(), record);
        })
    }

    /// Remove a single conversation key. Returns `true` when it existed.
    pub fn clear(&self, platform: &str, agent: &str, key: &str) -> Result<bool, StateError> {
        self.with_file(platform, agent, |map| map.remove(key).is_some())
    }

    /// Drop records idle longer than `ttl` across one (platform, agent)
    /// file. Returns the number removed.
    pub fn cleanup_expired(
        &self,
        platform: &str,
        agent: &str,
        now: DateTime<Utc>,
        ttl: Duration,
    ) -> Result<usize, StateError> {
        self.with_file(platform, agent, |map| {
            let before = map.len();
            map.retain(|_, r| !crate::session::expired_at(r.last_activity_at, ttl, now));
            before - map.len()
        })
    }

    /// Platform directories currently on disk (for startup cleanup).
    pub fn platforms(&self) -> Vec<String> {
        let Ok(entries) = fs::read_dir(&self.dir) else {
            return Vec::new();
        };
        entries
            .flatten()
            .filter(|e| e.path().is_dir())
            .filter_map(|e| e.file_name().into_string().ok())
            .collect()
    }

    /// Agents with a conversation file under `platform`.
    pub fn agents_for(&self, platform: &str) -> Vec<String> {
        let Ok(entries) = fs::read_dir(self.dir.join(platform)) else {
            return Vec::new();
        };
        entries
            .flatten()
            .filter_map(|e| {
                let path = e.path();
                if path.extension().and_then(|x| x.to_str()) == Some("yaml") {
                    path.file_stem().and_then(|s| s.to_str()).map(String::from)
                } else {
                    None
                }
            })
            .collect()
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn store() -> (tempfile::TempDir, ConversationKeyStore) {
        let dir = tempfile::tempdir().unwrap();
        let store = ConversationKeyStore::new(dir.path());
        (dir, store)
    }

    #[test]
    fn put_then_get_round_trips() {
        let (_dir, store) = store();
        let rec = ConversationRecord::new("S1");
        store.put("slack", "coder", "C123", rec.clone()).unwrap();
        assert_eq!(store.get("slack", "coder", "C123"), Some(rec));
    }

    #[test]
    fn keys_are_scoped_per_platform_and_agent() {
        let (_dir, store) = store();
        store
            .put("slack", "coder", "C1", ConversationRecord::new("S1"))
            .unwrap();
        assert!(store.get("linear", "coder", "C1").is_none());
        assert!(store.get("slack", "reviewer", "C1").is_none());
    }

    #[test]
    fn clear_reports_existence() {
        let (_dir, store) = store();
        store
            .put("slack", "coder", "C1", ConversationRecord::new("S1"))
            .unwrap();
        assert!(store.clear("slack", "coder", "C1").unwrap());
        assert!(!store.clear("slack", "coder", "C1").unwrap());
    }

    #[test]
    fn cleanup_expires_idle_records() {
        let (_dir, store) = store();
        let mut old = ConversationRecord::new("S-old");
        old.last_activity_at = Utc::now() - chrono::Duration::hours(30);
        store.put("slack", "coder", "old", old).unwrap();
        store
            .put("slack", "coder", "fresh", ConversationRecord::new("S-fresh"))
            .unwrap();

        let removed = store
            .cleanup_expired("slack", "coder", Utc::now(), Duration::from_secs(24 * 3600))
            .unwrap();
        assert_eq!(removed, 1);
        assert!(store.get("slack", "coder", "old").is_none());
        assert!(store.get("slack", "coder", "fresh").is_some());
    }

    #[test]
    fn corrupt_file_starts_fresh() {
        let (dir, store) = store();
        let path = dir.path().join("chat-sessions/slack/coder.yaml");
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(&path, ":\n  - definitely not a conversation file").unwrap();
        assert!(store.get("slack", "coder", "C1").is_none());
    }

    #[test]
    fn platform_and_agent_listing() {
        let (_dir, store) = store();
        store
            .put("slack", "coder", "C1", ConversationRecord::new("S"))
            .unwrap();
        store
            .put("linear", "coder", "u1", ConversationRecord::new("S"))
            .unwrap();
        let mut platforms = store.platforms();
        platforms.sort();
        assert_eq!(platforms, vec!["linear", "slack"]);
        assert_eq!(store.agents_for("slack"), vec!["coder"]);
    }
}
