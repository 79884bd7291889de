//! Adapter for the hosted API backend CLI.
//!
//! Spawns the backend with `-p <prompt> --max-turns N [flags] [--model M]
//! [--resume <sid>]`, captures stdout as the response body and stderr into
//! the invocation log, then mines the log for rate-limit signals, the turn
//! count, and the session id.

use anyhow::{Context, Result};
use std::fs::{self, File};
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::time::{Duration, SystemTime};

use crate::backends::stderr::{HostedParser, StderrParser};
use crate::config::{BackendConfig, Config};
use crate::sessions::SessionStore;

use super::{
    resolve_session, stderr_log_path, write_response, InvokeOutcome, InvokeRequest,
    EXIT_RATE_LIMITED, EXIT_USAGE,
};

/// How recent a project transcript must be to count as this invocation's
/// session during fallback discovery.
const PROJECT_SESSION_MAX_AGE: Duration = Duration::from_secs(600);

pub fn run(
    config: &Config,
    backend: &BackendConfig,
    request: &InvokeRequest,
    prompt: &str,
) -> InvokeOutcome {
    match run_inner(config, backend, request, prompt) {
        Ok(outcome) => outcome,
        Err(e) => {
            eprintln!("Hosted invocation failed: {e:#}");
            InvokeOutcome {
                exit_code: EXIT_USAGE,
                ..Default::default()
            }
        }
    }
}

fn run_inner(
    config: &Config,
    backend: &BackendConfig,
    request: &InvokeRequest,
    prompt: &str,
) -> Result<InvokeOutcome> {
    let resume = resolve_session(config, request);
    let log_path = stderr_log_path(config, request);
    if let Some(dir) = log_path.parent() {
        fs::create_dir_all(dir)
            .with_context(|| format!("Failed to create log directory: {}", dir.display()))?;
    }
    let log_file = File::create(&log_path)
        .with_context(|| format!("Failed to create stderr log: {}", log_path.display()))?;

    let mut command = Command::new(&backend.command);
    command
        .arg("-p")
        .arg(prompt)
        .arg("--max-turns")
        .arg(config.default_max_turns.to_string())
        .args(&backend.flags)
        .current_dir(&request.task_dir)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::from(log_file))
        // The backend CLI refuses to start inside one of its own sessions;
        // scrub the marker it checks.
        .env_remove("CLAUDECODE");
    if let Some(model) = &backend.model {
        command.arg("--model").arg(model);
    }
    if let Some(sid) = &resume {
        command.arg("--resume").arg(sid);
    }

    let output = command
        .output()
        .with_context(|| format!("Failed to spawn backend: {}", backend.command))?;

    let stderr_log = fs::read_to_string(&log_path).unwrap_or_default();
    let parser = HostedParser;

    if let Some(signal) = parser.detect_rate_limit(&stderr_log) {
        return Ok(InvokeOutcome {
            exit_code: EXIT_RATE_LIMITED,
            token_exhausted: Some(signal.raw),
            ..Default::default()
        });
    }

    let exit_code = output.status.code().unwrap_or(EXIT_USAGE);
    if exit_code != 0 {
        // Failure leaves no output file; the backend's code propagates.
        return Ok(InvokeOutcome {
            exit_code,
            turns_used: parser.parse_turns(&stderr_log),
            ..Default::default()
        });
    }

    let body = String::from_utf8_lossy(&output.stdout);
    write_response(request, &body)?;

    let session_id = parser
        .parse_session(&stderr_log)
        .or_else(|| resume.clone())
        .or_else(|| discover_project_session(&request.task_dir))
        .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
    SessionStore::new(config.sessions_dir()).save(&request.task, &session_id)?;

    Ok(InvokeOutcome {
        exit_code: 0,
        turns_used: parser.parse_turns(&stderr_log),
        session_id: Some(session_id),
        token_exhausted: None,
    })
}

/// Fallback session discovery: the backend CLI keeps one transcript file per
/// session under `~/.claude/projects/<munged-workdir>/`. The newest
/// recently-modified transcript for this task directory names the session.
fn discover_project_session(task_dir: &Path) -> Option<String> {
    let home = std::env::var("HOME").ok()?;
    let munged: String = task_dir
        .to_string_lossy()
        .chars()
        .map(|c| if c == '/' || c == '.' { '-' } else { c })
        .collect();
    let project_dir = PathBuf::from(home).join(".claude/projects").join(munged);

    let entries = fs::read_dir(&project_dir).ok()?;
    let now = SystemTime::now();
    let mut newest: Option<(SystemTime, String)> = None;
    for entry in entries.flatten() {
        let path = entry.path();
        if path.extension().and_then(|s| s.to_str()) != Some("jsonl") {
            continue;
        }
        let Ok(mtime) = entry.metadata().and_then(|m| m.modified()) else {
            continue;
        };
        let age = now.duration_since(mtime).unwrap_or(Duration::ZERO);
        if age > PROJECT_SESSION_MAX_AGE {
            continue;
        }
        let Some(stem) = path.file_stem().and_then(|s| s.to_str()) else {
            continue;
        };
        match &newest {
            Some((t, _)) if *t >= mtime => {}
            _ => newest = Some((mtime, stem.to_string())),
        }
    }
    newest.map(|(_, stem)| stem)
}
