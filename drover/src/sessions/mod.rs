//! Per-task session id files.
//!
//! A session file `<state>/sessions/<task>.session` holds the opaque id the
//! hosted backend uses to resume a conversation. Files older than 24 hours
//! are purged on next use. A stopped conversation invalidates its session by
//! rewriting the file as a JSON marker; freshness checks then fail closed.

use anyhow::{Context, Result};
use chrono::Duration;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::PathBuf;
use std::time::SystemTime;

use crate::fs::write_atomic;
use crate::validation::validate_task_name;

/// Session TTL: ids older than this are never reused.
pub const SESSION_TTL_HOURS: i64 = 24;

#[derive(Debug, Serialize, Deserialize)]
struct InvalidatedMarker {
    id: String,
    invalidated: bool,
}

#[derive(Debug, Clone)]
pub struct SessionStore {
    dir: PathBuf,
}

impl SessionStore {
    pub fn new(dir: PathBuf) -> Self {
        Self { dir }
    }

    pub fn path(&self, task: &str) -> PathBuf {
        self.dir.join(format!("{task}.session"))
    }

    /// Persist a session id for a task.
    pub fn save(&self, task: &str, session_id: &str) -> Result<()> {
        validate_task_name(task)?;
        write_atomic(&self.path(task), session_id)
    }

    /// Return the session id for a task if the file is fresh (≤24 h) and
    /// not invalidated. A stale file is purged on the way out.
    pub fn resolve_fresh(&self, task: &str) -> Option<String> {
        validate_task_name(task).ok()?;
        let path = self.path(task);
        let meta = fs::metadata(&path).ok()?;

        if is_expired(&meta) {
            let _ = fs::remove_file(&path);
            return None;
        }

        let body = fs::read_to_string(&path).ok()?;
        let body = body.trim();
        if body.is_empty() {
            return None;
        }

        // An invalidated session reads as absent.
        if let Ok(marker) = serde_json::from_str::<InvalidatedMarker>(body) {
            if marker.invalidated {
                return None;
            }
            return Some(marker.id);
        }

        Some(body.to_string())
    }

    /// Mark the task's session as invalidated (stop signal processing).
    /// A missing session file is a no-op.
    pub fn invalidate(&self, task: &str) -> Result<()> {
        validate_task_name(task)?;
        let path = self.path(task);
        let Ok(body) = fs::read_to_string(&path) else {
            return Ok(());
        };

        let id = match serde_json::from_str::<InvalidatedMarker>(body.trim()) {
            Ok(marker) => marker.id,
            Err(_) => body.trim().to_string(),
        };
        let marker = InvalidatedMarker {
            id,
            invalidated: true,
        };
        let json = serde_json::to_string(&marker).context("Failed to serialize session marker")?;
        write_atomic(&path, &json)
    }

    /// Delete session files older than the TTL. Returns how many went away.
    pub fn purge_expired(&self) -> usize {
        let Ok(entries) = fs::read_dir(&self.dir) else {
            return 0;
        };
        let mut purged = 0;
        for entry in entries.flatten() {
            let path = entry.path();
            if path.extension().and_then(|s| s.to_str()) != Some("session") {
                continue;
            }
            let Ok(meta) = entry.metadata() else { continue };
            if is_expired(&meta) && fs::remove_file(&path).is_ok() {
                purged += 1;
            }
        }
        purged
    }
}

fn is_expired(meta: &fs::Metadata) -> bool {
    let Ok(mtime) = meta.modified() else {
        return false;
    };
    let Ok(age) = SystemTime::now().duration_since(mtime) else {
        return false;
    };
    age > Duration::hours(SESSION_TTL_HOURS).to_std().unwrap_or_default()
}
