// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! Delivery-id idempotency: at most one downstream trigger per delivery id
//! within the TTL window.
//!
//! Process-wide singleton behind a mutex, with bounded growth (expired ids
//! are pruned on every insert). Optionally persisted across restarts.

use std::collections::HashMap;
use std::path::Path;
use std::sync::Mutex;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::warn;

#[derive(Debug, Serialize, Deserialize)]
struct IdempotencyFile {
    version: u32,
    seen: HashMap<String, DateTime<Utc>>,
}

pub struct IdempotencySet {
    ttl: Duration,
    seen: Mutex<HashMap<String, DateTime<Utc>>>,
}

/// Whether `at + ttl` has passed; unrepresentable expiries never expire.
fn expired_at(at: DateTime<Utc>, ttl: Duration, now: DateTime<Utc>) -> bool {
    let Ok(ttl) = chrono::Duration::from_std(ttl) else {
        return false;
    };
    at.checked_add_signed(ttl).is_some_and(|expiry| expiry < now)
}

impl IdempotencySet {
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            seen: Mutex::new(HashMap::new()),
        }
    }

    /// Record a delivery id. Returns `true` when the id is new (the caller
    /// should process the delivery) and `false` for a duplicate within the
    /// TTL window.
    pub fn check_and_insert(&self, delivery_id: &str, now: DateTime<Utc>) -> bool {
        let mut seen = self.seen.lock().unwrap();
        seen.retain(|_, at| !expired_at(*at, self.ttl, now));
        if seen.contains_key(delivery_id) {
            return false;
        }
        seen.insert(delivery_id.to_string(), now);
        true
    }

    pub fn len(&self) -> usize {
        self.seen.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Load persisted ids, pruning anything already expired.
    pub fn load(path: &Path, ttl: Duration) -> Self {
        let set = Self::new(ttl);
        let Ok(text) = std::fs::read_to_string(path) else {
            return set;
        };
        match serde_json::from_str::<IdempotencyFile>(&text) {
            Ok(file) if file.version == 1 => {
                let now = Utc::now();
                let mut seen = set.seen.lock().unwrap();
                *seen = file
                    .seen
                    .into_iter()
                    .filter(|(_, at)| !expired_at(*at, ttl, now))
                    .collect();
                drop(seen);
            }
            Ok(_) | Err(_) => {
                warn!(path = %path.display(), "idempotency file unreadable, starting empty");
            }
        }
        set
    }

    pub fn save(&self, path: &Path) -> anyhow::Result<()> {
        let file = IdempotencyFile {
            version: 1,
            seen: self.seen.lock().unwrap().clone(),
        };
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, serde_json::to_string(&file)?)?;
        Ok(())
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn first_insert_accepts_duplicate_rejects() {
        let set = IdempotencySet::new(Duration::from_secs(3600));
        let now = Utc::now();
        assert!(set.check_and_insert("d1", now));
        assert!(!set.check_and_insert("d1", now));
        assert!(set.check_and_insert("d2", now));
    }

    #[test]
    fn expired_ids_can_fire_again() {
        let set = IdempotencySet::new(Duration::from_secs(60));
        let early = Utc::now();
        assert!(set.check_and_insert("d1", early));
        let late = early + chrono::Duration::seconds(120);
        assert!(set.check_and_insert("d1", late), "expired id is new again");
    }

    #[test]
    fn growth_is_bounded_by_pruning() {
        let set = IdempotencySet::new(Duration::from_secs(60));
        let start = Utc::now();
        for i in 0..100 {
            set.check_and_insert(&format!("d{i}"), start);
        }
        // All of them expire; the next insert prunes the lot.
        set.check_and_insert("fresh", start + chrono::Duration::seconds(120));
        assert_eq!(set.len(), 1);
    }

    #[test]
    fn persistence_round_trip_prunes_expired() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("idempotency.json");
        let set = IdempotencySet::new(Duration::from_secs(3600));
        set.check_and_insert("keep", Utc::now());
        set.save(&path).unwrap();

        let loaded = IdempotencySet::load(&path, Duration::from_secs(3600));
        assert!(!loaded.check_and_insert("keep", Utc::now()), "persisted id still dedupes");
        assert!(loaded.check_and_insert("new", Utc::now()));
    }

    #[test]
    fn corrupt_persistence_starts_empty() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("idempotency.json");
        std::fs::write(&path, "{{{{").unwrap();
        let loaded = IdempotencySet::load(&path, Duration::from_secs(3600));
        assert!(loaded.is_empty());
    }
}
