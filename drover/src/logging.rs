//! Timestamped component logging.
//!
//! Long-lived components (watcher, scheduler, supervisor) write
//! `<iso8601> <level> <component>: <msg>` lines to their own file under
//! `<state>/logs/` and mirror warnings to stderr so a foreground run stays
//! observable. Failures to write a log line are swallowed - logging is
//! best-effort and never takes a component down.

use chrono::Utc;
use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

/// A line-oriented log sink for one component.
pub struct ComponentLog {
    component: &'static str,
    file: Option<Mutex<std::fs::File>>,
}

impl ComponentLog {
    /// Open (append) the component's log file under `logs_dir`.
    ///
    /// If the file cannot be opened the log degrades to stderr-only.
    pub fn open(logs_dir: &Path, component: &'static str) -> Self {
        let _ = std::fs::create_dir_all(logs_dir);
        let path = Self::path(logs_dir, component);
        let file = OpenOptions::new()
            .append(true)
            .create(true)
            .open(&path)
            .map_err(|e| {
                eprintln!("Failed to open log file {}: {e}", path.display());
                e
            })
            .ok()
            .map(Mutex::new);
        Self { component, file }
    }

    /// A sink with no backing file (tests, one-shot CLI commands).
    pub fn stderr_only(component: &'static str) -> Self {
        Self {
            component,
            file: None,
        }
    }

    /// The log file path for a component.
    pub fn path(logs_dir: &Path, component: &str) -> PathBuf {
        logs_dir.join(format!("{component}.log"))
    }

    pub fn info(&self, msg: &str) {
        self.write("INFO", msg, false);
    }

    pub fn warn(&self, msg: &str) {
        self.write("WARN", msg, true);
    }

    pub fn error(&self, msg: &str) {
        self.write("ERROR", msg, true);
    }

    fn write(&self, level: &str, msg: &str, mirror_stderr: bool) {
        let line = format!(
            "{} {level} {}: {msg}",
            Utc::now().format("%Y-%m-%dT%H:%M:%S%.3fZ"),
            self.component
        );
        if mirror_stderr || self.file.is_none() {
            eprintln!("{line}");
        }
        if let Some(file) = &self.file {
            if let Ok(mut f) = file.lock() {
                let _ = writeln!(f, "{line}");
            }
        }
    }
}
