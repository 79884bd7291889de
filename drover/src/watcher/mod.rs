//! File-change detection over the vault.
//!
//! Two strategies run concurrently: an inotify thread (Linux) that reports
//! close-after-write events per task directory, and a polling sweep every
//! `POLL_INTERVAL` that catches anything inotify missed - cloud-sync
//! filesystems are not above writing files behind the kernel's back.
//! Either way, candidates funnel through the same classification into
//! queue events.

use anyhow::Result;
use std::collections::HashMap;
use std::fs;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{Receiver, RecvTimeoutError};
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use crate::config::Config;
use crate::logging::ComponentLog;
use crate::queue::{EventKind, EventQueue};
use crate::turn::{self, TurnKind};
use crate::validation::validate_task_name;

/// Wake-ups delivered by the inotify thread.
#[derive(Debug, Clone, PartialEq, Eq)]
enum WatchSignal {
    /// Something changed under this task directory.
    TaskChanged(String),
    /// The vault itself changed (new task directory, renames).
    VaultChanged,
    /// The kernel dropped events; callers must rescan everything.
    Overflow,
    /// The watch thread died and will not come back.
    Unavailable(String),
}

pub struct Watcher {
    config: Config,
    queue: EventQueue,
    log: ComponentLog,
    /// Last `(file, mtime)` emitted per task, so an unchanged file is not
    /// re-announced every poll. The scheduler's lock and failure sentinel
    /// make duplicates safe; this just keeps the queue quiet.
    emitted: HashMap<String, (String, SystemTime)>,
}

impl Watcher {
    pub fn new(config: Config, queue: EventQueue, log: ComponentLog) -> Self {
        Self {
            config,
            queue,
            log,
            emitted: HashMap::new(),
        }
    }

    /// Run until `shutdown` flips. Never returns Ok while the flag is down.
    pub fn run(&mut self, shutdown: &Arc<AtomicBool>) -> Result<()> {
        let (signal_rx, inotify_alive) = spawn_inotify_thread(&self.config.vault_dir, &self.log);
        let mut reported_dead = false;

        let mut next_poll = SystemTime::now();
        while !shutdown.load(Ordering::Relaxed) {
            let wait = next_poll
                .duration_since(SystemTime::now())
                .unwrap_or(Duration::ZERO)
                .min(Duration::from_millis(500))
                .max(Duration::from_millis(10));

            match signal_rx.recv_timeout(wait) {
                Ok(WatchSignal::TaskChanged(task)) => {
                    // Settle delay absorbs bursty syncs before we classify.
                    std::thread::sleep(self.config.settle_delay);
                    drain_pending(&signal_rx);
                    self.scan_task(&task);
                }
                Ok(WatchSignal::VaultChanged) | Ok(WatchSignal::Overflow) => {
                    std::thread::sleep(self.config.settle_delay);
                    drain_pending(&signal_rx);
                    self.scan_all();
                }
                Ok(WatchSignal::Unavailable(reason)) => {
                    self.log
                        .warn(&format!("inotify unavailable, polling only: {reason}"));
                }
                Err(RecvTimeoutError::Timeout) => {}
                Err(RecvTimeoutError::Disconnected) => {
                    // A dead channel answers instantly; pace the loop by
                    // hand so polling-only mode does not spin.
                    if inotify_alive && !reported_dead {
                        self.log.warn("inotify channel closed, polling only");
                        reported_dead = true;
                    }
                    std::thread::sleep(wait);
                }
            }

            if SystemTime::now() >= next_poll {
                self.scan_all();
                next_poll = SystemTime::now() + self.config.poll_interval;
            }
        }
        Ok(())
    }

    /// One polling sweep over every task directory.
    pub fn scan_all(&mut self) {
        let entries = match fs::read_dir(&self.config.vault_dir) {
            Ok(entries) => entries,
            Err(e) => {
                self.log.warn(&format!(
                    "Cannot read vault {}: {e}",
                    self.config.vault_dir.display()
                ));
                return;
            }
        };

        for entry in entries.flatten() {
            let path = entry.path();
            if !path.is_dir() {
                // Files directly under the vault root are not tasks.
                continue;
            }
            let Some(name) = path.file_name().and_then(|s| s.to_str()) else {
                continue;
            };
            if name.starts_with('.') {
                continue;
            }
            if validate_task_name(name).is_err() {
                continue;
            }
            self.scan_task(name);
        }
    }

    /// Classify the latest turn file of one task and emit queue events.
    pub fn scan_task(&mut self, task: &str) {
        if validate_task_name(task).is_err() {
            return;
        }
        let task_dir = self.config.vault_dir.join(task);

        let latest = match turn::latest_file(&task_dir) {
            Ok(Some(file)) => file,
            Ok(None) => return,
            Err(e) => {
                self.log.warn(&format!("Cannot scan task '{task}': {e:#}"));
                return;
            }
        };
        if latest == "_status.md" {
            return;
        }

        let mtime = fs::metadata(task_dir.join(&latest))
            .and_then(|m| m.modified())
            .unwrap_or(SystemTime::UNIX_EPOCH);
        if self.emitted.get(task) == Some(&(latest.clone(), mtime)) {
            return;
        }

        match self.classify_candidate(&task_dir, task, &latest) {
            Ok(Some(kind)) => {
                if let Err(e) = self.queue.write(kind, task, &latest, "") {
                    self.log
                        .warn(&format!("Failed to queue {kind} for '{task}': {e:#}"));
                    return;
                }
                self.log.info(&format!("{kind}: {task}/{latest}"));
                self.emitted.insert(task.to_string(), (latest, mtime));
            }
            Ok(None) => {}
            Err(e) => self.log.warn(&format!("Cannot classify '{task}': {e:#}")),
        }
    }

    fn classify_candidate(
        &self,
        task_dir: &std::path::Path,
        _task: &str,
        file: &str,
    ) -> Result<Option<EventKind>> {
        if turn::detect_stop(task_dir, file)? {
            return Ok(Some(EventKind::StopSignal));
        }
        match turn::classify(task_dir, file)? {
            // Backend response awaiting the user: nothing to do.
            TurnKind::Backend => Ok(None),
            TurnKind::User | TurnKind::Edited => {
                if turn::is_ready(task_dir, file, self.config.stability_timeout)? {
                    Ok(Some(EventKind::FileReady))
                } else {
                    Ok(None)
                }
            }
        }
    }
}

fn drain_pending(rx: &Receiver<WatchSignal>) {
    while rx.try_recv().is_ok() {}
}

/// Start the inotify thread. Returns the signal channel and whether the
/// thread actually started (false means polling-only mode).
fn spawn_inotify_thread(
    vault: &PathBuf,
    log: &ComponentLog,
) -> (Receiver<WatchSignal>, bool) {
    let (tx, rx) = std::sync::mpsc::sync_channel(64);
    match inotify_impl::spawn(vault.clone(), tx) {
        Ok(()) => (rx, true),
        Err(reason) => {
            log.warn(&format!("inotify not started, polling only: {reason}"));
            (rx, false)
        }
    }
}

#[cfg(target_os = "linux")]
mod inotify_impl {
    use super::WatchSignal;
    use nix::sys::inotify::{AddWatchFlags, InitFlags, Inotify, WatchDescriptor};
    use std::collections::HashMap;
    use std::path::PathBuf;
    use std::sync::mpsc::SyncSender;

    /// Watch the vault root for new task directories and every task
    /// directory for markdown close-writes.
    pub fn spawn(vault: PathBuf, tx: SyncSender<WatchSignal>) -> Result<(), String> {
        let inotify =
            Inotify::init(InitFlags::IN_CLOEXEC).map_err(|e| format!("inotify init failed: {e}"))?;

        let dir_mask = AddWatchFlags::IN_CLOSE_WRITE
            | AddWatchFlags::IN_MOVED_TO
            | AddWatchFlags::IN_DELETE;
        let root_mask = AddWatchFlags::IN_CREATE | AddWatchFlags::IN_MOVED_TO;

        let root_wd = inotify
            .add_watch(&vault, root_mask)
            .map_err(|e| format!("inotify add watch failed for vault: {e}"))?;

        let mut by_wd: HashMap<WatchDescriptor, String> = HashMap::new();
        add_task_watches(&inotify, &vault, dir_mask, &mut by_wd);

        std::thread::Builder::new()
            .name("drover-inotify".to_string())
            .spawn(move || loop {
                let events = match inotify.read_events() {
                    Ok(events) => events,
                    Err(e) => {
                        let _ = tx.send(WatchSignal::Unavailable(format!(
                            "inotify read failed: {e}"
                        )));
                        return;
                    }
                };

                for event in events {
                    if event.mask.contains(AddWatchFlags::IN_Q_OVERFLOW) {
                        let _ = tx.send(WatchSignal::Overflow);
                        continue;
                    }
                    if event.wd == root_wd {
                        // New or renamed task directory: refresh watches.
                        add_task_watches(&inotify, &vault, dir_mask, &mut by_wd);
                        let _ = tx.try_send(WatchSignal::VaultChanged);
                        continue;
                    }
                    let Some(task) = by_wd.get(&event.wd) else {
                        continue;
                    };
                    let is_md = event
                        .name
                        .as_ref()
                        .map(|n| n.to_string_lossy().ends_with(".md"))
                        .unwrap_or(false);
                    if is_md {
                        let _ = tx.try_send(WatchSignal::TaskChanged(task.clone()));
                    }
                }
            })
            .map_err(|e| format!("failed to spawn inotify thread: {e}"))?;
        Ok(())
    }

    fn add_task_watches(
        inotify: &Inotify,
        vault: &PathBuf,
        mask: AddWatchFlags,
        by_wd: &mut HashMap<WatchDescriptor, String>,
    ) {
        let Ok(entries) = std::fs::read_dir(vault) else {
            return;
        };
        for entry in entries.flatten() {
            let path = entry.path();
            if !path.is_dir() {
                continue;
            }
            let Some(name) = path.file_name().and_then(|s| s.to_str()) else {
                continue;
            };
            if name.starts_with('.') {
                continue;
            }
            // Re-adding an existing watch is idempotent and returns the
            // same descriptor.
            if let Ok(wd) = inotify.add_watch(&path, mask) {
                by_wd.insert(wd, name.to_string());
            }
        }
    }
}

#[cfg(not(target_os = "linux"))]
mod inotify_impl {
    use super::WatchSignal;
    use std::path::PathBuf;
    use std::sync::mpsc::SyncSender;

    /// Event-driven detection is Linux-only; elsewhere the watcher runs in
    /// polling-only mode.
    pub fn spawn(_vault: PathBuf, _tx: SyncSender<WatchSignal>) -> Result<(), String> {
        Err("event-driven watch unavailable on this platform".to_string())
    }
}
