//! Adapter for the local daemon backend.
//!
//! No session concept: resume flags are ignored. The daemon is pinged with a
//! cheap `list` before anything else; an unreachable daemon is exit 2 so the
//! scheduler can tell "backend down" from a prompt failure. The prompt is
//! prefixed with a complexity-selected system prompt and piped on stdin.

use anyhow::{Context, Result};
use std::fs::{self, File};
use std::io::Write;
use std::process::{Command, Stdio};
use std::time::Duration;

use crate::backends::stderr::{LocalParser, StderrParser};
use crate::config::{BackendConfig, Config};

use super::{
    stderr_log_path, write_response, InvokeOutcome, InvokeRequest, EXIT_DAEMON_DOWN,
    EXIT_RATE_LIMITED, EXIT_USAGE,
};

/// System prompt for quick complexity-1 work.
const SYSTEM_PROMPT_TERSE: &str =
    "Answer directly and briefly. No preamble, no restating the question.";

/// System prompt for complexity-2 work: same model, more structure asked of it.
const SYSTEM_PROMPT_ELABORATED: &str = "Answer thoroughly. Think through the problem step by \
     step, structure the response with short sections, and state any assumptions you make.";

pub fn run(
    config: &Config,
    backend: &BackendConfig,
    request: &InvokeRequest,
    prompt: &str,
) -> InvokeOutcome {
    match run_inner(config, backend, request, prompt) {
        Ok(outcome) => outcome,
        Err(e) => {
            eprintln!("Local invocation failed: {e:#}");
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
    if !daemon_reachable(backend) {
        eprintln!("Local backend daemon unreachable: {}", backend.command);
        return Ok(InvokeOutcome {
            exit_code: EXIT_DAEMON_DOWN,
            ..Default::default()
        });
    }

    let model = backend.model.as_deref().unwrap_or("llama3");
    let full_prompt = format!("{}\n\n{prompt}", system_prompt());

    let log_path = stderr_log_path(config, request);
    if let Some(dir) = log_path.parent() {
        fs::create_dir_all(dir)
            .with_context(|| format!("Failed to create log directory: {}", dir.display()))?;
    }
    let log_file = File::create(&log_path)
        .with_context(|| format!("Failed to create stderr log: {}", log_path.display()))?;

    let mut command = Command::new(&backend.command);
    command
        .arg("run")
        .arg(model)
        .current_dir(&request.task_dir)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::from(log_file));
    if let Some(endpoint) = &backend.endpoint {
        command.env("OLLAMA_HOST", endpoint);
    }

    let mut child = command
        .spawn()
        .with_context(|| format!("Failed to spawn backend: {}", backend.command))?;
    child
        .stdin
        .take()
        .context("Backend child has no stdin")?
        .write_all(full_prompt.as_bytes())
        .context("Failed to pipe prompt to backend")?;

    let output = child
        .wait_with_output()
        .context("Failed to wait on backend")?;

    let stderr_log = fs::read_to_string(&log_path).unwrap_or_default();
    if let Some(signal) = LocalParser.detect_rate_limit(&stderr_log) {
        return Ok(InvokeOutcome {
            exit_code: EXIT_RATE_LIMITED,
            token_exhausted: Some(signal.raw),
            ..Default::default()
        });
    }

    let exit_code = output.status.code().unwrap_or(EXIT_USAGE);
    if exit_code != 0 {
        return Ok(InvokeOutcome {
            exit_code,
            ..Default::default()
        });
    }

    let body = String::from_utf8_lossy(&output.stdout);
    write_response(request, &body)?;

    Ok(InvokeOutcome {
        exit_code: 0,
        ..Default::default()
    })
}

/// Probe the daemon with its cheapest command. A hung daemon counts as
/// unreachable after a short wait.
fn daemon_reachable(backend: &BackendConfig) -> bool {
    use wait_timeout::ChildExt;

    let Ok(mut child) = Command::new(&backend.command)
        .arg("list")
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .spawn()
    else {
        return false;
    };

    match child.wait_timeout(Duration::from_secs(5)) {
        Ok(Some(status)) => status.success(),
        Ok(None) => {
            let _ = child.kill();
            let _ = child.wait();
            false
        }
        Err(_) => false,
    }
}

/// The `COMPLEXITY` env var (set by the scheduler) picks the system prompt:
/// 1 is terse, anything else gets the elaborated prompt.
fn system_prompt() -> &'static str {
    match std::env::var("COMPLEXITY").as_deref() {
        Ok("1") => SYSTEM_PROMPT_TERSE,
        _ => SYSTEM_PROMPT_ELABORATED,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::BackendKind;
    use crate::invoker::test_support::{stub_config, write_stub};
    use crate::turn::{classify_content, TurnKind};
    use serial_test::serial;
    use tempfile::TempDir;

    fn fixture(temp: &TempDir, script: &str) -> (Config, BackendConfig, InvokeRequest) {
        let stub = write_stub(temp.path(), "fake-ollama", script);
        let backend = BackendConfig {
            name: "ollama".to_string(),
            kind: BackendKind::Local,
            command: stub.to_string_lossy().into_owned(),
            max_parallel: 1,
            flags: Vec::new(),
            model: Some("llama3".to_string()),
            endpoint: None,
            invoker: None,
        };
        let config = stub_config(
            &temp.path().join("state"),
            &temp.path().join("vault"),
            backend.clone(),
        );
        let task_dir = temp.path().join("vault/demo");
        fs::create_dir_all(&task_dir).unwrap();
        fs::write(task_dir.join("001_demo.md"), "quick question\n<User>\n").unwrap();
        let request = InvokeRequest {
            backend: "ollama".to_string(),
            task: "demo".to_string(),
            task_dir,
            input: "001_demo.md".to_string(),
            output: "002_demo.md".to_string(),
            resume: None,
        };
        (config, backend, request)
    }

    #[test]
    #[serial]
    fn test_success_frames_stdout() {
        let temp = TempDir::new().unwrap();
        // `list` probe succeeds; `run <model>` echoes the piped prompt back.
        let (config, backend, request) = fixture(
            &temp,
            "#!/bin/sh\nif [ \"$1\" = list ]; then exit 0; fi\ncat >/dev/null\necho \"local answer\"\nexit 0\n",
        );

        let outcome = run(&config, &backend, &request, "quick question");
        assert_eq!(outcome.exit_code, 0);
        assert!(outcome.session_id.is_none());

        let response = fs::read_to_string(request.task_dir.join("002_demo.md")).unwrap();
        assert_eq!(classify_content(&response), TurnKind::Backend);
        assert!(response.contains("local answer"));
    }

    #[test]
    #[serial]
    fn test_daemon_down_is_exit_two() {
        let temp = TempDir::new().unwrap();
        let (config, backend, request) =
            fixture(&temp, "#!/bin/sh\nif [ \"$1\" = list ]; then exit 1; fi\nexit 0\n");

        let outcome = run(&config, &backend, &request, "p");
        assert_eq!(outcome.exit_code, EXIT_DAEMON_DOWN);
        assert!(!request.task_dir.join("002_demo.md").exists());
    }

    #[test]
    #[serial]
    fn test_complexity_env_selects_prompt() {
        std::env::set_var("COMPLEXITY", "1");
        assert_eq!(system_prompt(), SYSTEM_PROMPT_TERSE);
        std::env::set_var("COMPLEXITY", "2");
        assert_eq!(system_prompt(), SYSTEM_PROMPT_ELABORATED);
        std::env::remove_var("COMPLEXITY");
        assert_eq!(system_prompt(), SYSTEM_PROMPT_ELABORATED);
    }

    #[test]
    #[serial]
    fn test_rate_limit_from_proxy_layer() {
        let temp = TempDir::new().unwrap();
        let (config, backend, request) = fixture(
            &temp,
            "#!/bin/sh\nif [ \"$1\" = list ]; then exit 0; fi\ncat >/dev/null\necho \"upstream 429 too many requests\" >&2\nexit 1\n",
        );

        let outcome = run(&config, &backend, &request, "p");
        assert_eq!(outcome.exit_code, EXIT_RATE_LIMITED);
        assert!(outcome.token_exhausted.is_some());
    }
}
