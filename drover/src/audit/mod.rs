//! Invocation audit trail: START/END journal, per-invocation records, and
//! daily usage counters.
//!
//! The journal is a single append-only `journal.log`; START and END lines
//! pair by `(task, pid)`. Unmatched STARTs surface from `check_incomplete`
//! at startup as an operator signal, not a recovery trigger.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::PathBuf;

use crate::fs::{locked_append, write_atomic};

/// One per-invocation audit record, written under
/// `<state>/audit/<task>/<timestamp>.json`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditRecord {
    pub task: String,
    pub file: String,
    pub backend: String,
    pub session_id: Option<String>,
    pub turns: Option<u32>,
    pub exit_code: i32,
    pub interrupted: bool,
    pub timestamp: DateTime<Utc>,
    pub stderr_excerpt: Option<String>,
}

/// Daily per-backend counters.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct UsageCounters {
    pub total_turns: u64,
    pub task_count: u64,
    pub tasks: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct AuditJournal {
    journal: PathBuf,
    audit_dir: PathBuf,
    usage_dir: PathBuf,
}

impl AuditJournal {
    pub fn new(journal: PathBuf, audit_dir: PathBuf, usage_dir: PathBuf) -> Self {
        Self {
            journal,
            audit_dir,
            usage_dir,
        }
    }

    /// Append a START line for a spawned invocation.
    pub fn journal_start(
        &self,
        task: &str,
        file: &str,
        backend: &str,
        pid: u32,
        session: Option<&str>,
    ) -> Result<()> {
        let mut line = format!(
            "{} START {task} {file} {backend} pid={pid}",
            Utc::now().to_rfc3339()
        );
        if let Some(session) = session {
            line.push_str(&format!(" session={session}"));
        }
        locked_append(&self.journal, &line)
    }

    /// Append the matching END line.
    pub fn journal_end(
        &self,
        task: &str,
        file: &str,
        backend: &str,
        pid: u32,
        exit: i32,
        turns: Option<u32>,
    ) -> Result<()> {
        let mut line = format!(
            "{} END {task} {file} {backend} pid={pid} exit={exit}",
            Utc::now().to_rfc3339()
        );
        if let Some(turns) = turns {
            line.push_str(&format!(" turns={turns}"));
        }
        locked_append(&self.journal, &line)
    }

    /// Write the per-invocation JSON record.
    pub fn write_record(&self, record: &AuditRecord) -> Result<PathBuf> {
        let dir = self.audit_dir.join(&record.task);
        let path = dir.join(format!(
            "{}.json",
            record.timestamp.format("%Y%m%dT%H%M%S%.3f")
        ));
        let json =
            serde_json::to_string_pretty(record).context("Failed to serialize audit record")?;
        write_atomic(&path, &json)?;
        Ok(path)
    }

    /// Fold an invocation into today's usage counters.
    ///
    /// Read-modify-rewrite through a temp file; the scheduler's monitor
    /// threads are the only writers and each holds the invocation lock, so
    /// last-writer-wins granularity is per invocation, which is fine for
    /// operator-facing counters.
    pub fn update_usage(&self, backend: &str, turns: u32, task: &str) -> Result<()> {
        let path = self.usage_path(Utc::now());
        let mut by_backend: BTreeMap<String, UsageCounters> = match fs::read_to_string(&path) {
            Ok(raw) => serde_json::from_str(&raw).unwrap_or_default(),
            Err(_) => BTreeMap::new(),
        };

        let counters = by_backend.entry(backend.to_string()).or_default();
        counters.total_turns += u64::from(turns);
        if !counters.tasks.iter().any(|t| t == task) {
            counters.tasks.push(task.to_string());
            counters.task_count = counters.tasks.len() as u64;
        }

        let json =
            serde_json::to_string_pretty(&by_backend).context("Failed to serialize usage")?;
        write_atomic(&path, &json)
    }

    /// Usage counters for a given day, if any were recorded.
    pub fn usage_for(&self, day: DateTime<Utc>) -> Option<BTreeMap<String, UsageCounters>> {
        let raw = fs::read_to_string(self.usage_path(day)).ok()?;
        serde_json::from_str(&raw).ok()
    }

    /// Tasks with a START line and no matching END, keyed by `(task, pid)`.
    pub fn check_incomplete(&self) -> Result<Vec<String>> {
        let content = match fs::read_to_string(&self.journal) {
            Ok(c) => c,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => {
                return Err(e)
                    .with_context(|| format!("Failed to read journal: {}", self.journal.display()))
            }
        };

        let mut open: BTreeMap<(String, String), ()> = BTreeMap::new();
        for line in content.lines() {
            let mut fields = line.split_whitespace();
            let _timestamp = fields.next();
            let Some(kind) = fields.next() else { continue };
            let Some(task) = fields.next() else { continue };
            let _file = fields.next();
            let _backend = fields.next();
            let Some(pid) = fields.find(|f| f.starts_with("pid=")) else {
                continue;
            };
            let key = (task.to_string(), pid.to_string());
            match kind {
                "START" => {
                    open.insert(key, ());
                }
                "END" => {
                    open.remove(&key);
                }
                _ => {}
            }
        }

        let mut tasks: Vec<String> = open.into_keys().map(|(task, _)| task).collect();
        tasks.dedup();
        Ok(tasks)
    }

    fn usage_path(&self, day: DateTime<Utc>) -> PathBuf {
        self.usage_dir.join(format!("{}.json", day.format("%Y-%m-%d")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn journal_in(temp: &TempDir) -> AuditJournal {
        AuditJournal::new(
            temp.path().join("journal.log"),
            temp.path().join("audit"),
            temp.path().join("usage"),
        )
    }

    #[test]
    fn test_journal_pairing() {
        let temp = TempDir::new().unwrap();
        let audit = journal_in(&temp);

        audit
            .journal_start("demo", "001_demo.md", "claude", 4242, Some("abc-1"))
            .unwrap();
        audit
            .journal_end("demo", "001_demo.md", "claude", 4242, 0, Some(3))
            .unwrap();
        audit
            .journal_start("hung", "001_hung.md", "claude", 4343, None)
            .unwrap();

        assert_eq!(audit.check_incomplete().unwrap(), vec!["hung"]);

        let content = fs::read_to_string(temp.path().join("journal.log")).unwrap();
        assert!(content.contains("START demo 001_demo.md claude pid=4242 session=abc-1"));
        assert!(content.contains("END demo 001_demo.md claude pid=4242 exit=0 turns=3"));
    }

    #[test]
    fn test_check_incomplete_empty_journal() {
        let temp = TempDir::new().unwrap();
        let audit = journal_in(&temp);
        assert!(audit.check_incomplete().unwrap().is_empty());
    }

    #[test]
    fn test_same_task_different_pids_pair_independently() {
        let temp = TempDir::new().unwrap();
        let audit = journal_in(&temp);

        audit
            .journal_start("demo", "001_demo.md", "claude", 1000, None)
            .unwrap();
        audit
            .journal_start("demo", "003_demo.md", "claude", 2000, None)
            .unwrap();
        audit
            .journal_end("demo", "001_demo.md", "claude", 1000, 0, None)
            .unwrap();

        assert_eq!(audit.check_incomplete().unwrap(), vec!["demo"]);
    }

    #[test]
    fn test_write_record_lands_under_task_dir() {
        let temp = TempDir::new().unwrap();
        let audit = journal_in(&temp);

        let path = audit
            .write_record(&AuditRecord {
                task: "demo".to_string(),
                file: "001_demo.md".to_string(),
                backend: "claude".to_string(),
                session_id: Some("abc-1".to_string()),
                turns: Some(3),
                exit_code: 0,
                interrupted: false,
                timestamp: Utc::now(),
                stderr_excerpt: None,
            })
            .unwrap();

        assert!(path.starts_with(temp.path().join("audit/demo")));
        let parsed: AuditRecord =
            serde_json::from_str(&fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(parsed.turns, Some(3));
        assert!(!parsed.interrupted);
    }

    #[test]
    fn test_update_usage_accumulates() {
        let temp = TempDir::new().unwrap();
        let audit = journal_in(&temp);

        audit.update_usage("claude", 3, "demo").unwrap();
        audit.update_usage("claude", 2, "demo").unwrap();
        audit.update_usage("claude", 5, "other").unwrap();
        audit.update_usage("ollama", 1, "demo").unwrap();

        let usage = audit.usage_for(Utc::now()).unwrap();
        let claude = &usage["claude"];
        assert_eq!(claude.total_turns, 10);
        assert_eq!(claude.task_count, 2);
        assert_eq!(claude.tasks, vec!["demo", "other"]);
        assert_eq!(usage["ollama"].total_turns, 1);
    }
}
