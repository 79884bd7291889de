//! Turn detection on the numbered markdown files of a task directory.
//!
//! A task is a conversation advanced by files `NNN_<task>.md`; every
//! function here is a pure function of file contents plus mtime. The frame
//! markers are part of the external interface and must match byte-for-byte:
//! a backend-authored file starts with `<!-- CLAUDE-RESPONSE -->` and ends
//! with the `# <User>` placeholder the user is expected to replace.

use anyhow::{Context, Result};
use regex::Regex;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;
use std::time::{Duration, SystemTime};

/// First line of every backend-authored turn file.
pub const RESPONSE_HEADER: &str = "<!-- CLAUDE-RESPONSE -->";

/// How a turn file classifies.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TurnKind {
    /// Backend response still awaiting the user (placeholder intact).
    Backend,
    /// User-authored file.
    User,
    /// Backend response whose placeholder the user changed or removed -
    /// semantically a user turn.
    Edited,
}

fn placeholder_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?m)^\s*#\s*<User>\s*$").unwrap())
}

fn ready_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?m)^\s*<User>\s*$").unwrap())
}

fn stop_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?m)^\s*<Stop>\s*$").unwrap())
}

fn complexity_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"<!--\s*complexity:\s*([123])\s*-->").unwrap())
}

/// Numeric prefix of a turn file name (`003_demo.md` → 3).
pub fn numeric_prefix(filename: &str) -> Option<u64> {
    let (prefix, _) = filename.split_once('_')?;
    if prefix.is_empty() || !prefix.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    prefix.parse().ok()
}

/// Pick the `.md` file with the highest numeric prefix in a task directory.
///
/// Ties and ordering are numeric, not lexical, so `100_x.md` sorts after
/// `099_x.md`. Files without a numeric prefix are ignored. Returns `None`
/// for an empty or missing directory.
pub fn latest_file(task_dir: &Path) -> Result<Option<String>> {
    if !task_dir.is_dir() {
        return Ok(None);
    }

    let entries = fs::read_dir(task_dir)
        .with_context(|| format!("Failed to read task directory: {}", task_dir.display()))?;

    let mut best: Option<(u64, String)> = None;
    for entry in entries {
        let entry = entry?;
        let name = entry.file_name();
        let Some(name) = name.to_str() else { continue };
        if !name.ends_with(".md") {
            continue;
        }
        let Some(prefix) = numeric_prefix(name) else {
            continue;
        };
        match &best {
            Some((n, _)) if *n >= prefix => {}
            _ => best = Some((prefix, name.to_string())),
        }
    }

    Ok(best.map(|(_, name)| name))
}

/// Classify a turn file as backend / user / edited.
pub fn classify(task_dir: &Path, filename: &str) -> Result<TurnKind> {
    let content = read_turn(task_dir, filename)?;
    Ok(classify_content(&content))
}

/// Classification on already-read contents.
pub fn classify_content(content: &str) -> TurnKind {
    let first_line = content.lines().next().unwrap_or("");
    if first_line.trim_end() == RESPONSE_HEADER {
        if placeholder_re().is_match(content) {
            TurnKind::Backend
        } else {
            TurnKind::Edited
        }
    } else {
        TurnKind::User
    }
}

/// A file is ready when it carries a `<User>` line (without the leading `#`),
/// or as a fallback when it has been unchanged for `stability_timeout`.
pub fn is_ready(task_dir: &Path, filename: &str, stability_timeout: Duration) -> Result<bool> {
    let path = task_dir.join(filename);
    let content = read_turn(task_dir, filename)?;
    if ready_re().is_match(&content) {
        return Ok(true);
    }

    let mtime = fs::metadata(&path)
        .and_then(|m| m.modified())
        .with_context(|| format!("Failed to stat turn file: {}", path.display()))?;
    let age = SystemTime::now()
        .duration_since(mtime)
        .unwrap_or(Duration::ZERO);
    Ok(age >= stability_timeout)
}

/// `<Stop>` alone on a line signals conversation termination.
pub fn detect_stop(task_dir: &Path, filename: &str) -> Result<bool> {
    let content = read_turn(task_dir, filename)?;
    Ok(stop_re().is_match(&content))
}

/// Extract `<!-- complexity: N -->` from file contents, N in 1..=3.
pub fn extract_complexity(content: &str) -> Option<u8> {
    complexity_re()
        .captures(content)
        .and_then(|c| c.get(1))
        .and_then(|m| m.as_str().parse().ok())
}

/// Zero-padded successor of a turn file name: `003_foo.md` → `004_foo.md`.
///
/// Padding stays at three digits until the prefix outgrows it, then widens
/// naturally (`999` → `1000`).
pub fn next_filename(current: &str, task: &str) -> Result<String> {
    let prefix = numeric_prefix(current)
        .with_context(|| format!("Turn file '{current}' has no numeric prefix"))?;
    Ok(format!("{:03}_{task}.md", prefix + 1))
}

/// Build the framed contents of a backend response file.
pub fn frame_response(body: &str) -> String {
    format!("{RESPONSE_HEADER}\n\n{}\n\n# <User>\n", body.trim_end())
}

/// Strip the response header and any trailing user sentinel from an input
/// file, leaving the bare prompt to hand to a backend.
pub fn strip_input(content: &str) -> String {
    let mut lines: Vec<&str> = content.lines().collect();

    if lines.first().map(|l| l.trim_end()) == Some(RESPONSE_HEADER) {
        lines.remove(0);
    }

    while let Some(last) = lines.last() {
        let trimmed = last.trim();
        if trimmed.is_empty() || trimmed == "<User>" || placeholder_re().is_match(last) {
            lines.pop();
        } else {
            break;
        }
    }

    let mut out = lines.join("\n");
    while out.starts_with('\n') {
        out.remove(0);
    }
    out
}

/// Path of a turn file within its task directory.
pub fn turn_path(task_dir: &Path, filename: &str) -> PathBuf {
    task_dir.join(filename)
}

fn read_turn(task_dir: &Path, filename: &str) -> Result<String> {
    let path = task_dir.join(filename);
    fs::read_to_string(&path)
        .with_context(|| format!("Failed to read turn file: {}", path.display()))
}
