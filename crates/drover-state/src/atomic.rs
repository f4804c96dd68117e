// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! Atomic file writes: write-to-temp + rename, with retry.
//!
//! The rename retry exists for Windows, where antivirus scanners briefly
//! hold the destination open and make the first rename fail spuriously.

use std::fs;
use std::path::Path;
use std::thread;
use std::time::Duration;

use crate::StateError;

const RENAME_ATTEMPTS: u32 = 4;
const RENAME_BACKOFF: Duration = Duration::from_millis(50);

/// Write `bytes` to `path` atomically. The parent directory is created
/// when missing; readers never observe a partially written file.
pub fn write_atomic(path: &Path, bytes: &[u8]) -> Result<(), StateError> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).map_err(|e| StateError::io(parent, e))?;
    }

    let tmp = path.with_extension("tmp");
    fs::write(&tmp, bytes).map_err(|e| StateError::io(&tmp, e))?;

    let mut last_err = None;
    for attempt in 0..RENAME_ATTEMPTS {
        match fs::rename(&tmp, path) {
            Ok(()) => return Ok(()),
            Err(e) => {
                last_err = Some(e);
                if attempt + 1 < RENAME_ATTEMPTS {
                    thread::sleep(RENAME_BACKOFF * (attempt + 1));
                }
            }
        }
    }
    let _ = fs::remove_file(&tmp);
    Err(StateError::io(
        path,
        last_err.unwrap_or_else(|| std::io::Error::other("rename failed")),
    ))
}

/// Append one line (plus newline) to `path`, creating it when missing.
/// Appends are monotonic; interleaved writers never tear a line because
/// each call issues a single `write` of the full line.
pub fn append_line(path: &Path, line: &str) -> Result<(), StateError> {
    use std::io::Write;

    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).map_err(|e| StateError::io(parent, e))?;
    }
    let mut file = fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .map_err(|e| StateError::io(path, e))?;
    let mut buf = Vec::with_capacity(line.len() + 1);
    buf.extend_from_slice(line.as_bytes());
    buf.push(b'\n');
    file.write_all(&buf).map_err(|e| StateError::io(path, e))
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn write_creates_parent_dirs() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("a/b/c.json");
        write_atomic(&path, b"{}").unwrap();
        assert_eq!(fs::read_to_string(&path).unwrap(), "{}");
    }

    #[test]
    fn write_replaces_existing_content() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("x.json");
        write_atomic(&path, b"one").unwrap();
        write_atomic(&path, b"two").unwrap();
        assert_eq!(fs::read_to_string(&path).unwrap(), "two");
    }

    #[test]
    fn no_tmp_file_left_behind() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("x.json");
        write_atomic(&path, b"data").unwrap();
        assert!(!path.with_extension("tmp").exists());
    }

    #[test]
    fn append_accumulates_lines() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out.log");
        append_line(&path, "first").unwrap();
        append_line(&path, "second").unwrap();
        let content = fs::read_to_string(&path).unwrap();
        assert_eq!(content, "first\nsecond\n");
    }
}
