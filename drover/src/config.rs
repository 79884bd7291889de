//! Typed configuration for the daemon, the scheduler, and the invokers.
//!
//! Everything is driven by environment variables so the same table works for
//! the long-lived daemon and for each short-lived invoker subprocess, which
//! inherits the environment on spawn. Malformed numeric values fall back to
//! their defaults with a warning rather than refusing to start.

use std::collections::BTreeMap;
use std::env;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Default interval for the polling fallback of the watcher.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(30);
/// Default readiness fallback: a file unchanged this long counts as ready.
pub const DEFAULT_STABILITY_TIMEOUT: Duration = Duration::from_secs(300);
/// Default debounce after a filesystem event, absorbing bursty cloud syncs.
pub const DEFAULT_SETTLE_DELAY: Duration = Duration::from_secs(2);
/// Default scheduler loop period.
pub const DEFAULT_SCHEDULER_CYCLE: Duration = Duration::from_secs(2);
/// Default `--max-turns` passed to backends.
pub const DEFAULT_MAX_TURNS: u32 = 10;
/// Default complexity when neither the file nor the cache carries one.
pub const DEFAULT_COMPLEXITY: u8 = 3;

/// Whether a backend is a hosted API CLI or a local daemon.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackendKind {
    Api,
    Local,
}

impl BackendKind {
    pub fn parse(s: &str) -> Option<Self> {
        match s.to_ascii_lowercase().as_str() {
            "api" => Some(BackendKind::Api),
            "local" => Some(BackendKind::Local),
            _ => None,
        }
    }
}

/// One entry of the backend table. Immutable after init.
#[derive(Debug, Clone)]
pub struct BackendConfig {
    pub name: String,
    pub kind: BackendKind,
    pub command: String,
    pub max_parallel: u32,
    /// Extra flags appended to every invocation of the backend CLI.
    pub flags: Vec<String>,
    pub model: Option<String>,
    pub endpoint: Option<String>,
    /// Override for the invoker executable; defaults to re-invoking drover.
    pub invoker: Option<PathBuf>,
}

/// Process-wide configuration.
#[derive(Debug, Clone)]
pub struct Config {
    pub vault_dir: PathBuf,
    pub state_dir: PathBuf,
    pub poll_interval: Duration,
    pub stability_timeout: Duration,
    pub settle_delay: Duration,
    pub scheduler_cycle: Duration,
    pub default_max_turns: u32,
    pub default_complexity: u8,
    pub dry_run: bool,
    pub backends: Vec<BackendConfig>,
}

impl Config {
    /// Build the configuration from the environment.
    ///
    /// Recognized keys: `VAULT_TASKS_DIR`, `STATE_DIR`, `POLL_INTERVAL`,
    /// `STABILITY_TIMEOUT`, `DEFAULT_MAX_TURNS`, `INOTIFY_SETTLE_DELAY`,
    /// `SCHEDULER_CYCLE`, `DEFAULT_COMPLEXITY`, `DRY_RUN`, and the
    /// per-backend table `LLM_<NAME>_{TYPE,MAX_PARALLEL,COMMAND,FLAGS,MODEL,ENDPOINT,INVOKER}`.
    pub fn from_env() -> Self {
        let home = env::var("HOME").unwrap_or_else(|_| ".".to_string());
        let vault_dir = env::var("VAULT_TASKS_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|_| Path::new(&home).join("vault/tasks"));
        let state_dir = env::var("STATE_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|_| Path::new(&home).join(".claude-task-system"));

        let mut backends = parse_backend_table();
        if backends.is_empty() {
            backends = default_backends();
        }

        Self {
            vault_dir,
            state_dir,
            poll_interval: secs_var("POLL_INTERVAL", DEFAULT_POLL_INTERVAL),
            stability_timeout: secs_var("STABILITY_TIMEOUT", DEFAULT_STABILITY_TIMEOUT),
            settle_delay: secs_var("INOTIFY_SETTLE_DELAY", DEFAULT_SETTLE_DELAY),
            scheduler_cycle: secs_var("SCHEDULER_CYCLE", DEFAULT_SCHEDULER_CYCLE),
            default_max_turns: num_var("DEFAULT_MAX_TURNS", DEFAULT_MAX_TURNS),
            default_complexity: num_var("DEFAULT_COMPLEXITY", DEFAULT_COMPLEXITY).clamp(1, 3),
            dry_run: env::var("DRY_RUN").map(|v| !v.is_empty() && v != "0").unwrap_or(false),
            backends,
        }
    }

    pub fn backend(&self, name: &str) -> Option<&BackendConfig> {
        self.backends.iter().find(|b| b.name == name)
    }

    // State directory layout. Paths here are the external interface; other
    // tools (the progress writer, recovery scripts, humans) read them.

    pub fn locks_dir(&self) -> PathBuf {
        self.state_dir.join("locks")
    }

    pub fn events_file(&self) -> PathBuf {
        self.state_dir.join("events/queue")
    }

    pub fn events_lock(&self) -> PathBuf {
        self.state_dir.join("events/queue.lock")
    }

    pub fn sessions_dir(&self) -> PathBuf {
        self.state_dir.join("sessions")
    }

    pub fn continuations_dir(&self) -> PathBuf {
        self.state_dir.join("continuations")
    }

    pub fn token_state_file(&self) -> PathBuf {
        self.state_dir.join("token-state.json")
    }

    pub fn journal_file(&self) -> PathBuf {
        self.state_dir.join("journal.log")
    }

    pub fn audit_dir(&self) -> PathBuf {
        self.state_dir.join("audit")
    }

    pub fn usage_dir(&self) -> PathBuf {
        self.state_dir.join("usage")
    }

    pub fn partial_dir(&self) -> PathBuf {
        self.state_dir.join("partial")
    }

    pub fn failures_dir(&self) -> PathBuf {
        self.state_dir.join("failures")
    }

    pub fn logs_dir(&self) -> PathBuf {
        self.state_dir.join("logs")
    }

    pub fn complexity_dir(&self) -> PathBuf {
        self.state_dir.join("complexity")
    }

    /// Every state subdirectory, for supervisor bootstrap.
    pub fn state_subdirs(&self) -> Vec<PathBuf> {
        vec![
            self.locks_dir(),
            self.state_dir.join("events"),
            self.sessions_dir(),
            self.continuations_dir(),
            self.audit_dir(),
            self.usage_dir(),
            self.partial_dir(),
            self.failures_dir(),
            self.logs_dir(),
            self.complexity_dir(),
        ]
    }
}

fn secs_var(key: &str, default: Duration) -> Duration {
    match env::var(key) {
        Ok(raw) => match raw.trim().parse::<u64>() {
            Ok(secs) => Duration::from_secs(secs),
            Err(_) => {
                eprintln!("Ignoring malformed {key}={raw:?}, using default");
                default
            }
        },
        Err(_) => default,
    }
}

fn num_var<T: std::str::FromStr + Copy>(key: &str, default: T) -> T {
    match env::var(key) {
        Ok(raw) => match raw.trim().parse::<T>() {
            Ok(v) => v,
            Err(_) => {
                eprintln!("Ignoring malformed {key}={raw:?}, using default");
                default
            }
        },
        Err(_) => default,
    }
}

/// Collect `LLM_<NAME>_*` variables into backend entries.
///
/// The backend name is the lowercased `<NAME>` segment. Entries missing a
/// `COMMAND` are dropped with a warning since nothing could be spawned.
fn parse_backend_table() -> Vec<BackendConfig> {
    let mut by_name: BTreeMap<String, BTreeMap<String, String>> = BTreeMap::new();

    for (key, value) in env::vars() {
        let Some(rest) = key.strip_prefix("LLM_") else {
            continue;
        };
        // Field names carry underscores (MAX_PARALLEL), backend names don't:
        // the name is everything up to the first underscore.
        let Some((name, field)) = rest.split_once('_') else {
            continue;
        };
        if name.is_empty() || field.is_empty() {
            continue;
        }
        by_name
            .entry(name.to_ascii_lowercase())
            .or_default()
            .insert(field.to_string(), value);
    }

    let mut backends = Vec::new();
    for (name, fields) in by_name {
        let Some(command) = fields.get("COMMAND").cloned() else {
            eprintln!("Backend '{name}' has no LLM_{}_COMMAND, skipping", name.to_uppercase());
            continue;
        };
        let kind = fields
            .get("TYPE")
            .and_then(|v| BackendKind::parse(v))
            .unwrap_or(BackendKind::Api);
        let max_parallel = fields
            .get("MAX_PARALLEL")
            .and_then(|v| v.trim().parse().ok())
            .unwrap_or(1);
        backends.push(BackendConfig {
            name,
            kind,
            command,
            max_parallel,
            flags: fields
                .get("FLAGS")
                .map(|v| v.split_whitespace().map(String::from).collect())
                .unwrap_or_default(),
            model: fields.get("MODEL").cloned(),
            endpoint: fields.get("ENDPOINT").cloned(),
            invoker: fields.get("INVOKER").map(PathBuf::from),
        });
    }
    backends
}

/// The built-in table used when no `LLM_*` variables are set: one hosted
/// backend (`claude`) and one local backend (`ollama`).
fn default_backends() -> Vec<BackendConfig> {
    vec![
        BackendConfig {
            name: "claude".to_string(),
            kind: BackendKind::Api,
            command: "claude".to_string(),
            max_parallel: 2,
            flags: Vec::new(),
            model: None,
            endpoint: None,
            invoker: None,
        },
        BackendConfig {
            name: "ollama".to_string(),
            kind: BackendKind::Local,
            command: "ollama".to_string(),
            max_parallel: 1,
            flags: Vec::new(),
            model: Some("llama3".to_string()),
            endpoint: None,
            invoker: None,
        },
    ]
}
