//! Per-file failure sentinels with exponential backoff.
//!
//! A sentinel `<state>/failures/<task>/<file>.failed` parks a `(task, file)`
//! pair after a failed invocation so the scheduler does not tight-loop on
//! the same deterministic failure. The sentinel carries a count and a
//! timestamp; re-admission waits out `60s * 2^(count-1)` capped at an hour,
//! and a later successful run of the pair removes it.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::PathBuf;
use std::time::Duration;

use crate::fs::write_atomic;

/// Base backoff after the first failure.
const BACKOFF_BASE_SECS: u64 = 60;
/// Backoff ceiling.
const BACKOFF_MAX_SECS: u64 = 3600;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct FailureSentinel {
    pub count: u32,
    pub last_failure: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct FailureSentinels {
    dir: PathBuf,
}

impl FailureSentinels {
    pub fn new(dir: PathBuf) -> Self {
        Self { dir }
    }

    fn path(&self, task: &str, file: &str) -> PathBuf {
        self.dir.join(task).join(format!("{file}.failed"))
    }

    /// Record one more failure for the pair. Returns the updated count.
    pub fn record(&self, task: &str, file: &str) -> Result<u32> {
        let count = self.get(task, file).map(|s| s.count).unwrap_or(0) + 1;
        let sentinel = FailureSentinel {
            count,
            last_failure: Utc::now(),
        };
        let json =
            serde_json::to_string(&sentinel).context("Failed to serialize failure sentinel")?;
        write_atomic(&self.path(task, file), &json)?;
        Ok(count)
    }

    /// Remove the sentinel (successful run of the pair); idempotent.
    pub fn clear(&self, task: &str, file: &str) -> Result<()> {
        match fs::remove_file(self.path(task, file)) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => {
                Err(e).with_context(|| format!("Failed to clear sentinel for {task}/{file}"))
            }
        }
    }

    pub fn get(&self, task: &str, file: &str) -> Option<FailureSentinel> {
        let raw = fs::read_to_string(self.path(task, file)).ok()?;
        // Legacy bare marker files (empty or non-JSON) still block once.
        serde_json::from_str(&raw).ok().or(Some(FailureSentinel {
            count: 1,
            last_failure: Utc::now(),
        }))
    }

    /// True while the pair is inside its backoff window.
    pub fn is_blocking(&self, task: &str, file: &str) -> bool {
        let Some(sentinel) = self.get(task, file) else {
            return false;
        };
        let backoff = calculate_backoff(sentinel.count);
        let elapsed = Utc::now().signed_duration_since(sentinel.last_failure);
        match chrono::Duration::from_std(backoff) {
            Ok(backoff) => elapsed < backoff,
            Err(_) => true,
        }
    }
}

/// `base * 2^(count-1)`, capped. Zero failures means zero backoff.
fn calculate_backoff(count: u32) -> Duration {
    if count == 0 {
        return Duration::from_secs(0);
    }
    let multiplier = 2u64.saturating_pow(count - 1);
    Duration::from_secs(BACKOFF_BASE_SECS.saturating_mul(multiplier).min(BACKOFF_MAX_SECS))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn sentinels(temp: &TempDir) -> FailureSentinels {
        FailureSentinels::new(temp.path().join("failures"))
    }

    #[test]
    fn test_backoff_schedule() {
        assert_eq!(calculate_backoff(0), Duration::from_secs(0));
        assert_eq!(calculate_backoff(1), Duration::from_secs(60));
        assert_eq!(calculate_backoff(2), Duration::from_secs(120));
        assert_eq!(calculate_backoff(3), Duration::from_secs(240));
        assert_eq!(calculate_backoff(7), Duration::from_secs(3600));
        assert_eq!(calculate_backoff(30), Duration::from_secs(3600));
    }

    #[test]
    fn test_record_blocks_and_clear_unblocks() {
        let temp = TempDir::new().unwrap();
        let failures = sentinels(&temp);

        assert!(!failures.is_blocking("demo", "001_demo.md"));
        assert_eq!(failures.record("demo", "001_demo.md").unwrap(), 1);
        assert!(failures.is_blocking("demo", "001_demo.md"));

        failures.clear("demo", "001_demo.md").unwrap();
        failures.clear("demo", "001_demo.md").unwrap();
        assert!(!failures.is_blocking("demo", "001_demo.md"));
    }

    #[test]
    fn test_count_increments_across_failures() {
        let temp = TempDir::new().unwrap();
        let failures = sentinels(&temp);

        assert_eq!(failures.record("demo", "001_demo.md").unwrap(), 1);
        assert_eq!(failures.record("demo", "001_demo.md").unwrap(), 2);
        assert_eq!(failures.get("demo", "001_demo.md").unwrap().count, 2);
    }

    #[test]
    fn test_elapsed_backoff_stops_blocking() {
        let temp = TempDir::new().unwrap();
        let failures = sentinels(&temp);

        // A first failure from twenty minutes ago is past its 60s window.
        let sentinel = FailureSentinel {
            count: 1,
            last_failure: Utc::now() - chrono::Duration::minutes(20),
        };
        let path = temp.path().join("failures/demo/001_demo.md.failed");
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(&path, serde_json::to_string(&sentinel).unwrap()).unwrap();

        assert!(!failures.is_blocking("demo", "001_demo.md"));
    }

    #[test]
    fn test_legacy_bare_marker_still_blocks() {
        let temp = TempDir::new().unwrap();
        let failures = sentinels(&temp);

        let path = temp.path().join("failures/demo/001_demo.md.failed");
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(&path, "").unwrap();

        assert!(failures.is_blocking("demo", "001_demo.md"));
    }
}
