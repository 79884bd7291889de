//! Per-(backend, task) PID-bearing lock files with staleness reaping.
//!
//! A lock is a file `<state>/locks/<backend>/<task>.lock` whose body is the
//! owning subprocess PID; it is live iff that PID exists. At most one live
//! lock per pair. Stale locks (dead PID) never block - the next acquirer
//! replaces them, and `reap_stale` sweeps them opportunistically.

use anyhow::{Context, Result};
use std::fs;
use std::path::{Path, PathBuf};

use crate::process::is_process_alive;
use crate::validation::validate_task_name;

/// Result of an acquire attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Acquire {
    Ok,
    Busy,
}

#[derive(Debug, Clone)]
pub struct LockRegistry {
    root: PathBuf,
}

impl LockRegistry {
    pub fn new(root: PathBuf) -> Self {
        Self { root }
    }

    pub fn lock_path(&self, backend: &str, task: &str) -> PathBuf {
        self.root.join(backend).join(format!("{task}.lock"))
    }

    /// Try to take the lock for `(backend, task)` on behalf of `pid`.
    ///
    /// If a live lock exists, returns `Busy`. Otherwise writes `pid` and
    /// re-reads as a cheap verify against a concurrent acquirer.
    pub fn acquire(&self, backend: &str, task: &str, pid: u32) -> Result<Acquire> {
        validate_names(backend, task)?;

        let path = self.lock_path(backend, task);
        if let Some(owner) = read_pid(&path) {
            if is_process_alive(owner) {
                return Ok(Acquire::Busy);
            }
        }

        let dir = path.parent().unwrap_or(Path::new("."));
        fs::create_dir_all(dir)
            .with_context(|| format!("Failed to create lock directory: {}", dir.display()))?;
        fs::write(&path, pid.to_string())
            .with_context(|| format!("Failed to write lock: {}", path.display()))?;

        // Verify against the check-then-write race: whoever's PID survived
        // the last write owns the lock.
        match read_pid(&path) {
            Some(owner) if owner == pid => Ok(Acquire::Ok),
            _ => Ok(Acquire::Busy),
        }
    }

    /// Rewrite the lock body with a new PID (scheduler PID → invoker PID
    /// after spawn, so external observers can identify the worker).
    pub fn rewrite(&self, backend: &str, task: &str, pid: u32) -> Result<()> {
        validate_names(backend, task)?;
        let path = self.lock_path(backend, task);
        fs::write(&path, pid.to_string())
            .with_context(|| format!("Failed to rewrite lock: {}", path.display()))
    }

    /// Remove the lock; idempotent.
    pub fn release(&self, backend: &str, task: &str) -> Result<()> {
        validate_names(backend, task)?;
        let path = self.lock_path(backend, task);
        match fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e).with_context(|| format!("Failed to remove lock: {}", path.display())),
        }
    }

    /// Is a live lock held for this pair?
    pub fn check(&self, backend: &str, task: &str) -> bool {
        self.pid_of(backend, task).is_some()
    }

    /// PID of the live lock holder, if any.
    pub fn pid_of(&self, backend: &str, task: &str) -> Option<u32> {
        if validate_names(backend, task).is_err() {
            return None;
        }
        let pid = read_pid(&self.lock_path(backend, task))?;
        is_process_alive(pid).then_some(pid)
    }

    /// Number of live locks held against one backend.
    pub fn count(&self, backend: &str) -> usize {
        let dir = self.root.join(backend);
        let Ok(entries) = fs::read_dir(&dir) else {
            return 0;
        };
        entries
            .flatten()
            .filter(|e| e.path().extension().and_then(|s| s.to_str()) == Some("lock"))
            .filter_map(|e| read_pid(&e.path()))
            .filter(|&pid| is_process_alive(pid))
            .count()
    }

    /// Tasks holding a live lock on `backend`.
    pub fn live_tasks(&self, backend: &str) -> Vec<String> {
        let dir = self.root.join(backend);
        let Ok(entries) = fs::read_dir(&dir) else {
            return Vec::new();
        };
        let mut tasks: Vec<String> = entries
            .flatten()
            .filter_map(|e| {
                let path = e.path();
                if path.extension().and_then(|s| s.to_str()) != Some("lock") {
                    return None;
                }
                let pid = read_pid(&path)?;
                if !is_process_alive(pid) {
                    return None;
                }
                path.file_stem()
                    .and_then(|s| s.to_str())
                    .map(String::from)
            })
            .collect();
        tasks.sort();
        tasks
    }

    /// All configured backend lock directories present on disk.
    pub fn backends_on_disk(&self) -> Vec<String> {
        let Ok(entries) = fs::read_dir(&self.root) else {
            return Vec::new();
        };
        let mut names: Vec<String> = entries
            .flatten()
            .filter(|e| e.path().is_dir())
            .filter_map(|e| e.file_name().to_str().map(String::from))
            .collect();
        names.sort();
        names
    }

    /// Sweep all backends, deleting locks whose PID is dead.
    /// Returns the number of locks reaped.
    pub fn reap_stale(&self) -> usize {
        let mut reaped = 0;
        for backend in self.backends_on_disk() {
            let dir = self.root.join(&backend);
            let Ok(entries) = fs::read_dir(&dir) else {
                continue;
            };
            for entry in entries.flatten() {
                let path = entry.path();
                if path.extension().and_then(|s| s.to_str()) != Some("lock") {
                    continue;
                }
                let stale = match read_pid(&path) {
                    Some(pid) => !is_process_alive(pid),
                    // Unreadable body counts as stale: it can never be live.
                    None => true,
                };
                if stale && fs::remove_file(&path).is_ok() {
                    reaped += 1;
                }
            }
        }
        reaped
    }
}

/// Parse a lock body as a PID. Non-numeric bodies read as absent.
fn read_pid(path: &Path) -> Option<u32> {
    fs::read_to_string(path).ok()?.trim().parse().ok()
}

fn validate_names(backend: &str, task: &str) -> Result<()> {
    validate_task_name(task)?;
    if backend.is_empty()
        || !backend
            .bytes()
            .all(|b| b.is_ascii_lowercase() || b.is_ascii_digit() || b == b'-')
    {
        anyhow::bail!("Invalid backend name: '{backend}'");
    }
    Ok(())
}
