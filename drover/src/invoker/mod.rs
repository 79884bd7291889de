//! Backend subprocess adapters.
//!
//! The scheduler runs each invocation as a `drover invoke` subprocess so the
//! lock file can carry a real worker PID and a stop signal has something to
//! kill. The adapter contract, shared by both backends:
//!
//! - on success the output file is written atomically with the response
//!   frame; on failure no output file is left behind
//! - discoveries are reported on stdout as `SESSION_ID:<id>`,
//!   `TURNS_USED:<n>`, `TOKEN_EXHAUSTED:<token>` lines
//! - exit codes: 0 success, 1 argument/env error, 2 local daemon down,
//!   10 rate limit, anything else propagated from the backend

pub mod hosted;
pub mod local;

use anyhow::{bail, Context, Result};
use std::fs;
use std::path::{Component, Path, PathBuf};

use crate::config::{BackendKind, Config};
use crate::fs::write_atomic;
use crate::sessions::SessionStore;
use crate::turn::{frame_response, strip_input};
use crate::validation::{sanitize_for_flat_name, validate_file_name, validate_task_name};

/// Exit code for argument or environment errors.
pub const EXIT_USAGE: i32 = 1;
/// Exit code when the local backend daemon is unreachable.
pub const EXIT_DAEMON_DOWN: i32 = 2;
/// Exit code for a detected rate limit.
pub const EXIT_RATE_LIMITED: i32 = 10;

/// One invocation request, as passed on the `drover invoke` command line.
#[derive(Debug, Clone)]
pub struct InvokeRequest {
    pub backend: String,
    pub task: String,
    pub task_dir: PathBuf,
    pub input: String,
    pub output: String,
    pub resume: Option<String>,
}

/// What an invocation reported; the CLI entry turns this into protocol
/// lines and the process exit code.
#[derive(Debug, Clone, Default)]
pub struct InvokeOutcome {
    pub exit_code: i32,
    pub session_id: Option<String>,
    pub turns_used: Option<u32>,
    /// Raw reset token when a rate limit was detected (exit 10).
    pub token_exhausted: Option<String>,
}

impl InvokeOutcome {
    fn usage_error() -> Self {
        Self {
            exit_code: EXIT_USAGE,
            ..Default::default()
        }
    }
}

/// Run one invocation and report the outcome. Never panics on bad input;
/// boundary errors map to exit 1 without touching any state.
pub fn run(config: &Config, request: &InvokeRequest) -> InvokeOutcome {
    let backend = match config.backend(&request.backend) {
        Some(b) => b.clone(),
        None => {
            eprintln!("Unknown backend: '{}'", request.backend);
            return InvokeOutcome::usage_error();
        }
    };

    if let Err(e) = validate_request(request) {
        eprintln!("Invalid invocation request: {e:#}");
        return InvokeOutcome::usage_error();
    }

    let prompt = match read_prompt(request) {
        Ok(p) => p,
        Err(e) => {
            eprintln!("Failed to read input: {e:#}");
            return InvokeOutcome::usage_error();
        }
    };

    match backend.kind {
        BackendKind::Api => hosted::run(config, &backend, request, &prompt),
        BackendKind::Local => local::run(config, &backend, request, &prompt),
    }
}

fn validate_request(request: &InvokeRequest) -> Result<()> {
    validate_task_name(&request.task)?;
    validate_file_name(&request.input)?;
    validate_file_name(&request.output)?;

    if request
        .task_dir
        .components()
        .any(|c| matches!(c, Component::ParentDir))
    {
        bail!(
            "Task directory must not traverse upward: {}",
            request.task_dir.display()
        );
    }
    if !request.task_dir.is_dir() {
        bail!("Task directory missing: {}", request.task_dir.display());
    }
    Ok(())
}

/// Read the input file and strip the response header and user sentinels,
/// leaving the bare prompt.
fn read_prompt(request: &InvokeRequest) -> Result<String> {
    let path = request.task_dir.join(&request.input);
    let content = fs::read_to_string(&path)
        .with_context(|| format!("Failed to read input file: {}", path.display()))?;
    let prompt = strip_input(&content);
    if prompt.trim().is_empty() {
        bail!("Input file is empty after stripping markers");
    }
    Ok(prompt)
}

/// Resolve the session to resume: an explicit request wins, otherwise a
/// fresh (≤24 h) session file for the task is reused.
pub(crate) fn resolve_session(config: &Config, request: &InvokeRequest) -> Option<String> {
    if let Some(sid) = &request.resume {
        return Some(sid.clone());
    }
    SessionStore::new(config.sessions_dir()).resolve_fresh(&request.task)
}

/// Write the framed response file atomically.
pub(crate) fn write_response(request: &InvokeRequest, body: &str) -> Result<()> {
    let path = request.task_dir.join(&request.output);
    write_atomic(&path, &frame_response(body))
}

/// Path of the stderr capture for one invocation:
/// `<state>/logs/<task>_<output>.log`.
pub fn stderr_log_file(config: &Config, task: &str, output: &str) -> PathBuf {
    let output_stem = output.strip_suffix(".md").unwrap_or(output);
    config
        .logs_dir()
        .join(format!("{task}_{}.log", sanitize_for_flat_name(output_stem)))
}

pub(crate) fn stderr_log_path(config: &Config, request: &InvokeRequest) -> PathBuf {
    stderr_log_file(config, &request.task, &request.output)
}

/// Last `max_bytes` of a stderr log, for audit records.
pub fn stderr_excerpt(path: &Path, max_bytes: usize) -> Option<String> {
    let content = fs::read_to_string(path).ok()?;
    if content.is_empty() {
        return None;
    }
    let start = content.len().saturating_sub(max_bytes);
    // Snap to a char boundary.
    let start = (start..content.len())
        .find(|&i| content.is_char_boundary(i))
        .unwrap_or(0);
    Some(content[start..].to_string())
}


#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::BackendConfig;
    use tempfile::TempDir;

    fn request_in(temp: &TempDir) -> InvokeRequest {
        let task_dir = temp.path().join("vault/demo");
        fs::create_dir_all(&task_dir).unwrap();
        fs::write(task_dir.join("001_demo.md"), "prompt\n<User>\n").unwrap();
        InvokeRequest {
            backend: "claude".to_string(),
            task: "demo".to_string(),
            task_dir,
            input: "001_demo.md".to_string(),
            output: "002_demo.md".to_string(),
            resume: None,
        }
    }

    fn hosted_backend(command: &str) -> BackendConfig {
        BackendConfig {
            name: "claude".to_string(),
            kind: BackendKind::Api,
            command: command.to_string(),
            max_parallel: 2,
            flags: Vec::new(),
            model: None,
            endpoint: None,
            invoker: None,
        }
    }

    #[test]
    fn test_unknown_backend_is_usage_error() {
        let temp = TempDir::new().unwrap();
        let request = request_in(&temp);
        let config = test_support::stub_config(
            &temp.path().join("state"),
            &temp.path().join("vault"),
            hosted_backend("true"),
        );

        let mut bad = request;
        bad.backend = "ghost".to_string();
        assert_eq!(run(&config, &bad).exit_code, EXIT_USAGE);
    }

    #[test]
    fn test_traversal_paths_are_usage_errors() {
        let temp = TempDir::new().unwrap();
        let request = request_in(&temp);
        let config = test_support::stub_config(
            &temp.path().join("state"),
            &temp.path().join("vault"),
            hosted_backend("true"),
        );

        let mut bad = request.clone();
        bad.input = "../001_demo.md".to_string();
        assert_eq!(run(&config, &bad).exit_code, EXIT_USAGE);

        let mut bad = request;
        bad.task_dir = PathBuf::from("/tmp/../tmp/x/..");
        assert_eq!(run(&config, &bad).exit_code, EXIT_USAGE);
    }

    #[test]
    fn test_empty_input_is_usage_error() {
        let temp = TempDir::new().unwrap();
        let request = request_in(&temp);
        fs::write(request.task_dir.join("001_demo.md"), "<User>\n").unwrap();
        let config = test_support::stub_config(
            &temp.path().join("state"),
            &temp.path().join("vault"),
            hosted_backend("true"),
        );

        assert_eq!(run(&config, &request).exit_code, EXIT_USAGE);
    }

    #[test]
    fn test_stderr_log_path_is_flat() {
        let temp = TempDir::new().unwrap();
        let request = request_in(&temp);
        let config = test_support::stub_config(
            &temp.path().join("state"),
            &temp.path().join("vault"),
            hosted_backend("true"),
        );

        let path = stderr_log_path(&config, &request);
        assert!(path.starts_with(config.logs_dir()));
        assert_eq!(
            path.file_name().unwrap().to_str().unwrap(),
            "demo_002_demo.log"
        );
    }

    #[test]
    fn test_stderr_excerpt_tails() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("x.log");
        fs::write(&path, "abcdefghij").unwrap();

        assert_eq!(stderr_excerpt(&path, 4).unwrap(), "ghij");
        assert_eq!(stderr_excerpt(&path, 100).unwrap(), "abcdefghij");
        assert!(stderr_excerpt(&temp.path().join("missing.log"), 4).is_none());
    }
}
