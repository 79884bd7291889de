//! End-to-end conversation flow: watcher detection through scheduler
//! dispatch and invocation lifecycle, with a stub invoker standing in for
//! the backend CLI.

use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::Utc;
use drover::backends::TokenState;
use drover::config::{BackendConfig, BackendKind, Config};
use drover::logging::ComponentLog;
use drover::queue::{EventKind, EventQueue};
use drover::scheduler::Scheduler;
use drover::turn;
use drover::watcher::Watcher;
use tempfile::TempDir;

/// The scheduler invokes `<stub> invoke --backend B --task T --task-dir D
/// --input I --output O [...]`; the stub writes a framed response and
/// reports a session and turn count.
const STUB_INVOKER: &str = "#!/bin/sh\n\
    task_dir=$7; output=${11}\n\
    printf '<!-- CLAUDE-RESPONSE -->\\n\\nstub answer\\n\\n# <User>\\n' > \"$task_dir/$output\"\n\
    echo SESSION_ID:abc-1\n\
    echo TURNS_USED:3\n\
    exit 0\n";

fn write_stub(dir: &Path, script: &str) -> PathBuf {
    let path = dir.join("stub-invoker");
    fs::write(&path, script).unwrap();
    let mut perms = fs::metadata(&path).unwrap().permissions();
    perms.set_mode(0o755);
    fs::set_permissions(&path, perms).unwrap();
    path
}

fn test_config(temp: &TempDir, invoker: PathBuf) -> Config {
    let config = Config {
        vault_dir: temp.path().join("vault"),
        state_dir: temp.path().join("state"),
        poll_interval: Duration::from_secs(30),
        stability_timeout: Duration::from_secs(300),
        settle_delay: Duration::from_millis(10),
        scheduler_cycle: Duration::from_secs(2),
        default_max_turns: 10,
        default_complexity: 3,
        dry_run: false,
        backends: vec![BackendConfig {
            name: "claude".to_string(),
            kind: BackendKind::Api,
            command: "unused".to_string(),
            max_parallel: 2,
            flags: Vec::new(),
            model: None,
            endpoint: None,
            invoker: Some(invoker),
        }],
    };
    for dir in config.state_subdirs() {
        fs::create_dir_all(dir).unwrap();
    }
    fs::create_dir_all(&config.vault_dir).unwrap();
    config
}

fn queue_of(config: &Config) -> EventQueue {
    EventQueue::new(config.events_file(), config.events_lock())
}

fn seed_task(config: &Config, task: &str, file: &str, content: &str) {
    let dir = config.vault_dir.join(task);
    fs::create_dir_all(&dir).unwrap();
    fs::write(dir.join(file), content).unwrap();
}

#[test]
fn first_turn_flows_from_watcher_to_response() {
    let temp = TempDir::new().unwrap();
    let stub = write_stub(temp.path(), STUB_INVOKER);
    let config = test_config(&temp, stub);
    seed_task(&config, "demo", "001_demo.md", "please summarize foo\n<User>\n");

    let mut watcher = Watcher::new(
        config.clone(),
        queue_of(&config),
        ComponentLog::stderr_only("watcher"),
    );
    watcher.scan_all();

    let mut scheduler = Scheduler::new(config.clone(), ComponentLog::stderr_only("scheduler"));
    scheduler.cycle();
    scheduler.join_monitors(Duration::from_secs(10));

    // Scenario: response framed, session persisted, audit recorded.
    let response_path = config.vault_dir.join("demo/002_demo.md");
    let response = fs::read_to_string(&response_path).unwrap();
    assert_eq!(turn::classify_content(&response), turn::TurnKind::Backend);
    assert!(response.starts_with("<!-- CLAUDE-RESPONSE -->\n\n"));
    assert!(response.ends_with("\n\n# <User>\n"));

    let journal = fs::read_to_string(config.journal_file()).unwrap();
    assert!(journal.contains("START demo 001_demo.md claude"));
    assert!(journal.contains("END demo 001_demo.md claude"));
    assert!(journal.contains("exit=0"));

    // No continuation for an under-budget response.
    assert!(!config
        .continuations_dir()
        .join("demo.json")
        .exists());
}

#[test]
fn interactive_reply_advances_numbering() {
    let temp = TempDir::new().unwrap();
    let stub = write_stub(temp.path(), STUB_INVOKER);
    let config = test_config(&temp, stub);

    // A backend response the user has edited into a new question.
    seed_task(
        &config,
        "demo",
        "002_demo.md",
        "<!-- CLAUDE-RESPONSE -->\n\nanswer\n\nthanks, now list steps\n<User>\n",
    );

    let mut watcher = Watcher::new(
        config.clone(),
        queue_of(&config),
        ComponentLog::stderr_only("watcher"),
    );
    watcher.scan_all();

    let mut scheduler = Scheduler::new(config.clone(), ComponentLog::stderr_only("scheduler"));
    scheduler.cycle();
    scheduler.join_monitors(Duration::from_secs(10));

    assert!(config.vault_dir.join("demo/003_demo.md").is_file());
}

#[test]
fn stop_signal_without_active_invocation_invalidates_session() {
    let temp = TempDir::new().unwrap();
    let stub = write_stub(temp.path(), STUB_INVOKER);
    let config = test_config(&temp, stub);

    seed_task(
        &config,
        "demo",
        "002_demo.md",
        "<!-- CLAUDE-RESPONSE -->\n\nanswer\n\n<Stop>\n\n# <User>\n",
    );
    fs::write(config.sessions_dir().join("demo.session"), "abc-1").unwrap();

    let mut watcher = Watcher::new(
        config.clone(),
        queue_of(&config),
        ComponentLog::stderr_only("watcher"),
    );
    watcher.scan_all();

    let mut scheduler = Scheduler::new(config.clone(), ComponentLog::stderr_only("scheduler"));
    scheduler.cycle();
    scheduler.join_monitors(Duration::from_secs(5));

    let body = fs::read_to_string(config.sessions_dir().join("demo.session")).unwrap();
    assert!(body.contains("invalidated"));
}

#[test]
fn exhausted_backend_parks_work_until_reset() {
    let temp = TempDir::new().unwrap();
    let stub = write_stub(temp.path(), STUB_INVOKER);
    let config = test_config(&temp, stub);
    seed_task(&config, "demo", "001_demo.md", "prompt\n<User>\n");

    let tokens = TokenState::new(config.token_state_file());
    tokens
        .mark_exhausted("claude", Utc::now() + chrono::Duration::hours(1))
        .unwrap();

    queue_of(&config)
        .write(EventKind::FileReady, "demo", "001_demo.md", "")
        .unwrap();

    let mut scheduler = Scheduler::new(config.clone(), ComponentLog::stderr_only("scheduler"));
    scheduler.cycle();
    scheduler.join_monitors(Duration::from_secs(5));

    // Nothing ran and nothing was lost: no response, no lock, and the
    // journal never opened an invocation.
    assert!(!config.vault_dir.join("demo/002_demo.md").exists());
    assert!(!config.journal_file().exists() || {
        let journal = fs::read_to_string(config.journal_file()).unwrap();
        !journal.contains("START demo")
    });

    // Once the exhaustion clears, the held event goes through.
    tokens.clear("claude").unwrap();
    scheduler.cycle();
    scheduler.join_monitors(Duration::from_secs(10));
    assert!(config.vault_dir.join("demo/002_demo.md").is_file());
}

#[test]
fn dry_run_never_spawns() {
    let temp = TempDir::new().unwrap();
    let stub = write_stub(temp.path(), STUB_INVOKER);
    let mut config = test_config(&temp, stub);
    config.dry_run = true;
    seed_task(&config, "demo", "001_demo.md", "prompt\n<User>\n");

    queue_of(&config)
        .write(EventKind::FileReady, "demo", "001_demo.md", "")
        .unwrap();

    let mut scheduler = Scheduler::new(config.clone(), ComponentLog::stderr_only("scheduler"));
    scheduler.cycle();
    scheduler.join_monitors(Duration::from_secs(5));

    assert!(!config.vault_dir.join("demo/002_demo.md").exists());
    // The lock was taken for admission and released immediately.
    assert!(!config.locks_dir().join("claude/demo.lock").exists());
}
