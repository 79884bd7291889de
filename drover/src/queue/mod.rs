//! Durable append-only event queue with atomic drain.
//!
//! One line per event, `ISO8601|kind|task|file|metadata`, appended under an
//! exclusive advisory lock on a sibling lockfile. `drain()` reads and
//! truncates under the same lock, so no event is read twice and none is
//! lost short of the process being killed between read and truncate.

use anyhow::{bail, Context, Result};
use chrono::{DateTime, Utc};
use fs2::FileExt;
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::PathBuf;

use crate::validation::{validate_file_name, validate_task_name};

/// Queue event kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventKind {
    FileReady,
    StopSignal,
    HeartbeatTrigger,
    ComplexityAssessed,
}

impl EventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventKind::FileReady => "file_ready",
            EventKind::StopSignal => "stop_signal",
            EventKind::HeartbeatTrigger => "heartbeat_trigger",
            EventKind::ComplexityAssessed => "complexity_assessed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "file_ready" => Some(EventKind::FileReady),
            "stop_signal" => Some(EventKind::StopSignal),
            "heartbeat_trigger" => Some(EventKind::HeartbeatTrigger),
            "complexity_assessed" => Some(EventKind::ComplexityAssessed),
            _ => None,
        }
    }
}

impl std::fmt::Display for EventKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One queued event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueEvent {
    pub timestamp: DateTime<Utc>,
    pub kind: EventKind,
    pub task: String,
    pub file: String,
    pub metadata: String,
}

impl QueueEvent {
    fn to_line(&self) -> String {
        format!(
            "{}|{}|{}|{}|{}",
            self.timestamp.to_rfc3339(),
            self.kind,
            self.task,
            self.file,
            self.metadata
        )
    }

    fn parse_line(line: &str) -> Option<Self> {
        let mut parts = line.splitn(5, '|');
        let timestamp = DateTime::parse_from_rfc3339(parts.next()?)
            .ok()?
            .with_timezone(&Utc);
        let kind = EventKind::parse(parts.next()?)?;
        let task = parts.next()?.to_string();
        let file = parts.next()?.to_string();
        let metadata = parts.next().unwrap_or("").to_string();
        Some(Self {
            timestamp,
            kind,
            task,
            file,
            metadata,
        })
    }
}

/// Handle on the queue file pair.
#[derive(Debug, Clone)]
pub struct EventQueue {
    path: PathBuf,
    lock_path: PathBuf,
}

impl EventQueue {
    pub fn new(path: PathBuf, lock_path: PathBuf) -> Self {
        Self { path, lock_path }
    }

    /// Append one event.
    ///
    /// Task and file names are validated at this boundary so nothing
    /// traversal-shaped ever lands in the queue; metadata must not carry
    /// newlines (it would break the one-event-per-line invariant).
    pub fn write(&self, kind: EventKind, task: &str, file: &str, metadata: &str) -> Result<()> {
        validate_task_name(task)?;
        validate_file_name(file)?;
        if metadata.contains('\n') || metadata.contains('|') {
            bail!("Event metadata must not contain newlines or '|'");
        }

        let event = QueueEvent {
            timestamp: Utc::now(),
            kind,
            task: task.to_string(),
            file: file.to_string(),
            metadata: metadata.to_string(),
        };

        let _guard = self.exclusive_lock()?;
        let mut queue = OpenOptions::new()
            .append(true)
            .create(true)
            .open(&self.path)
            .with_context(|| format!("Failed to open queue: {}", self.path.display()))?;
        writeln!(queue, "{}", event.to_line())
            .with_context(|| format!("Failed to append to queue: {}", self.path.display()))?;
        Ok(())
    }

    /// Read all pending events and truncate the queue, atomically with
    /// respect to writers. Unparseable lines are skipped with a warning.
    pub fn drain(&self) -> Result<Vec<QueueEvent>> {
        let _guard = self.exclusive_lock()?;

        let mut queue = match OpenOptions::new().read(true).write(true).open(&self.path) {
            Ok(f) => f,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => {
                return Err(e)
                    .with_context(|| format!("Failed to open queue: {}", self.path.display()))
            }
        };

        let mut content = String::new();
        queue
            .read_to_string(&mut content)
            .with_context(|| format!("Failed to read queue: {}", self.path.display()))?;

        let mut events = Vec::new();
        for line in content.lines() {
            if line.trim().is_empty() {
                continue;
            }
            match QueueEvent::parse_line(line) {
                Some(event) => events.push(event),
                None => eprintln!("Skipping unparseable queue line: {line}"),
            }
        }

        queue
            .set_len(0)
            .with_context(|| format!("Failed to truncate queue: {}", self.path.display()))?;
        queue
            .seek(SeekFrom::Start(0))
            .with_context(|| format!("Failed to rewind queue: {}", self.path.display()))?;

        Ok(events)
    }

    /// Hold the sibling lockfile exclusively for the scope of the guard.
    fn exclusive_lock(&self) -> Result<File> {
        if let Some(dir) = self.lock_path.parent() {
            std::fs::create_dir_all(dir)
                .with_context(|| format!("Failed to create queue directory: {}", dir.display()))?;
        }
        let lock = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(false)
            .open(&self.lock_path)
            .with_context(|| format!("Failed to open queue lock: {}", self.lock_path.display()))?;
        lock.lock_exclusive().with_context(|| {
            format!("Failed to lock queue lock: {}", self.lock_path.display())
        })?;
        Ok(lock)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;
    use tempfile::TempDir;

    fn queue_in(temp: &TempDir) -> EventQueue {
        EventQueue::new(
            temp.path().join("events/queue"),
            temp.path().join("events/queue.lock"),
        )
    }

    #[test]
    fn test_write_then_drain() {
        let temp = TempDir::new().unwrap();
        let queue = queue_in(&temp);

        queue
            .write(EventKind::FileReady, "demo", "001_demo.md", "")
            .unwrap();
        queue
            .write(EventKind::StopSignal, "demo", "002_demo.md", "")
            .unwrap();

        let events = queue.drain().unwrap();
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].kind, EventKind::FileReady);
        assert_eq!(events[0].task, "demo");
        assert_eq!(events[0].file, "001_demo.md");
        assert_eq!(events[1].kind, EventKind::StopSignal);

        // Drained once, never twice.
        assert!(queue.drain().unwrap().is_empty());
    }

    #[test]
    fn test_drain_missing_queue_is_empty() {
        let temp = TempDir::new().unwrap();
        let queue = queue_in(&temp);
        assert!(queue.drain().unwrap().is_empty());
    }

    #[test]
    fn test_metadata_round_trip() {
        let temp = TempDir::new().unwrap();
        let queue = queue_in(&temp);

        queue
            .write(
                EventKind::FileReady,
                "demo",
                "003_demo.md",
                "continuation:abc-1",
            )
            .unwrap();

        let events = queue.drain().unwrap();
        assert_eq!(events[0].metadata, "continuation:abc-1");
    }

    #[test]
    fn test_rejects_traversal_task_names() {
        let temp = TempDir::new().unwrap();
        let queue = queue_in(&temp);

        assert!(queue
            .write(EventKind::FileReady, "../etc", "001_x.md", "")
            .is_err());
        assert!(queue
            .write(EventKind::FileReady, "a/b", "001_x.md", "")
            .is_err());
        assert!(queue
            .write(EventKind::FileReady, "demo", "../001_x.md", "")
            .is_err());
    }

    #[test]
    fn test_rejects_newline_metadata() {
        let temp = TempDir::new().unwrap();
        let queue = queue_in(&temp);

        assert!(queue
            .write(EventKind::FileReady, "demo", "001_demo.md", "a\nb")
            .is_err());
    }

    #[test]
    fn test_skips_garbage_lines() {
        let temp = TempDir::new().unwrap();
        let queue = queue_in(&temp);

        queue
            .write(EventKind::FileReady, "demo", "001_demo.md", "")
            .unwrap();
        // Simulate a torn or foreign line.
        std::fs::OpenOptions::new()
            .append(true)
            .open(temp.path().join("events/queue"))
            .unwrap()
            .write_all(b"not|a|valid\n")
            .unwrap();

        let events = queue.drain().unwrap();
        assert_eq!(events.len(), 1);
    }

    #[test]
    fn test_concurrent_writers_lose_nothing() {
        let temp = TempDir::new().unwrap();
        let queue = queue_in(&temp);

        let handles: Vec<_> = (0..8)
            .map(|i| {
                let queue = queue.clone();
                thread::spawn(move || {
                    for j in 0..25 {
                        queue
                            .write(
                                EventKind::FileReady,
                                &format!("task-{i}"),
                                &format!("{:03}_task-{i}.md", j + 1),
                                "",
                            )
                            .unwrap();
                    }
                })
            })
            .collect();

        for handle in handles {
            handle.join().unwrap();
        }

        assert_eq!(queue.drain().unwrap().len(), 200);
    }

    #[test]
    fn test_events_drain_in_write_order() {
        let temp = TempDir::new().unwrap();
        let queue = queue_in(&temp);

        for j in 1..=5 {
            queue
                .write(EventKind::FileReady, "demo", &format!("{j:03}_demo.md"), "")
                .unwrap();
        }

        let files: Vec<String> = queue.drain().unwrap().into_iter().map(|e| e.file).collect();
        assert_eq!(
            files,
            vec![
                "001_demo.md",
                "002_demo.md",
                "003_demo.md",
                "004_demo.md",
                "005_demo.md"
            ]
        );
    }
}
