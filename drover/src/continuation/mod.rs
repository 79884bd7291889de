//! In-flight multi-round conversation records for auto-resume.
//!
//! When an invocation ends having spent its whole turn budget, the scheduler
//! records the session here and re-queues the response file. The record is
//! cleared on user edit, stop, or after five automatic continuations.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::PathBuf;

use crate::fs::write_atomic;
use crate::validation::validate_task_name;

/// Hard cap on automatic continuations per conversation.
pub const MAX_CONTINUATIONS: u32 = 5;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ContinuationRecord {
    pub task: String,
    pub session_id: String,
    pub turns_used: u32,
    pub max_turns: u32,
    pub file: String,
    pub continuation_count: u32,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct ContinuationStore {
    dir: PathBuf,
}

impl ContinuationStore {
    pub fn new(dir: PathBuf) -> Self {
        Self { dir }
    }

    fn path(&self, task: &str) -> PathBuf {
        self.dir.join(format!("{task}.json"))
    }

    /// Record (or extend) a continuation; the count increments every call.
    pub fn mark(
        &self,
        task: &str,
        session_id: &str,
        turns_used: u32,
        max_turns: u32,
        file: &str,
    ) -> Result<ContinuationRecord> {
        validate_task_name(task)?;

        let count = self.get(task).map(|r| r.continuation_count).unwrap_or(0);
        let record = ContinuationRecord {
            task: task.to_string(),
            session_id: session_id.to_string(),
            turns_used,
            max_turns,
            file: file.to_string(),
            continuation_count: count + 1,
            updated_at: Utc::now(),
        };

        let json = serde_json::to_string_pretty(&record)
            .context("Failed to serialize continuation record")?;
        write_atomic(&self.path(task), &json)?;
        Ok(record)
    }

    /// Remove the record; idempotent.
    pub fn clear(&self, task: &str) -> Result<()> {
        validate_task_name(task)?;
        match fs::remove_file(self.path(task)) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e).with_context(|| format!("Failed to clear continuation for '{task}'")),
        }
    }

    pub fn get(&self, task: &str) -> Option<ContinuationRecord> {
        let raw = fs::read_to_string(self.path(task)).ok()?;
        serde_json::from_str(&raw).ok()
    }

    pub fn session_id(&self, task: &str) -> Option<String> {
        self.get(task).map(|r| r.session_id)
    }

    pub fn turns_used(&self, task: &str) -> Option<u32> {
        self.get(task).map(|r| r.turns_used)
    }

    /// False once the continuation budget is spent.
    pub fn should_continue(&self, task: &str) -> bool {
        self.get(task)
            .map(|r| r.continuation_count < MAX_CONTINUATIONS)
            .unwrap_or(true)
    }

    /// Tasks with an active continuation record.
    pub fn pending(&self) -> Vec<ContinuationRecord> {
        let Ok(entries) = fs::read_dir(&self.dir) else {
            return Vec::new();
        };
        let mut records: Vec<ContinuationRecord> = entries
            .flatten()
            .filter(|e| e.path().extension().and_then(|s| s.to_str()) == Some("json"))
            .filter_map(|e| {
                let raw = fs::read_to_string(e.path()).ok()?;
                serde_json::from_str(&raw).ok()
            })
            .collect();
        records.sort_by(|a, b| a.task.cmp(&b.task));
        records
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn store(temp: &TempDir) -> ContinuationStore {
        ContinuationStore::new(temp.path().to_path_buf())
    }

    #[test]
    fn test_mark_increments_count() {
        let temp = TempDir::new().unwrap();
        let continuations = store(&temp);

        let first = continuations
            .mark("demo", "abc-1", 10, 10, "002_demo.md")
            .unwrap();
        assert_eq!(first.continuation_count, 1);

        let second = continuations
            .mark("demo", "abc-1", 10, 10, "003_demo.md")
            .unwrap();
        assert_eq!(second.continuation_count, 2);
        assert_eq!(continuations.turns_used("demo"), Some(10));
        assert_eq!(continuations.session_id("demo"), Some("abc-1".to_string()));
    }

    #[test]
    fn test_should_continue_caps_at_five() {
        let temp = TempDir::new().unwrap();
        let continuations = store(&temp);

        assert!(continuations.should_continue("demo"));
        for _ in 0..MAX_CONTINUATIONS {
            continuations
                .mark("demo", "abc-1", 10, 10, "002_demo.md")
                .unwrap();
        }
        assert!(!continuations.should_continue("demo"));
    }

    #[test]
    fn test_clear_resets_budget() {
        let temp = TempDir::new().unwrap();
        let continuations = store(&temp);

        for _ in 0..MAX_CONTINUATIONS {
            continuations
                .mark("demo", "abc-1", 10, 10, "002_demo.md")
                .unwrap();
        }
        continuations.clear("demo").unwrap();
        continuations.clear("demo").unwrap();

        assert!(continuations.get("demo").is_none());
        assert!(continuations.should_continue("demo"));
    }

    #[test]
    fn test_pending_lists_records() {
        let temp = TempDir::new().unwrap();
        let continuations = store(&temp);

        continuations.mark("beta", "s2", 10, 10, "002_beta.md").unwrap();
        continuations.mark("alpha", "s1", 10, 10, "004_alpha.md").unwrap();

        let tasks: Vec<String> = continuations.pending().into_iter().map(|r| r.task).collect();
        assert_eq!(tasks, vec!["alpha", "beta"]);
    }
}
