//! Input validation for task and file names before they reach path construction.
//!
//! Task names come from directory names in a cloud-synced vault and from
//! queue event lines; both are user-influenced, so everything is validated
//! here before being joined into state-directory paths.

use anyhow::{bail, Result};

/// Maximum allowed length for task names.
pub const MAX_TASK_NAME_LENGTH: usize = 128;

/// Maximum allowed length for turn file names.
pub const MAX_FILE_NAME_LENGTH: usize = 255;

/// Validates a task name for use in vault and state paths.
///
/// A task name is valid if it matches `[a-z0-9][a-z0-9-]*[a-z0-9]`
/// (a single `[a-z0-9]` character is also accepted) and is no longer
/// than [`MAX_TASK_NAME_LENGTH`].
pub fn validate_task_name(name: &str) -> Result<()> {
    if name.is_empty() {
        bail!("Task name cannot be empty");
    }

    if name.len() > MAX_TASK_NAME_LENGTH {
        bail!(
            "Task name too long: {} characters (max {})",
            name.len(),
            MAX_TASK_NAME_LENGTH
        );
    }

    let bytes = name.as_bytes();
    let edge_ok = |c: u8| c.is_ascii_lowercase() || c.is_ascii_digit();
    let inner_ok = |c: u8| edge_ok(c) || c == b'-';

    if !edge_ok(bytes[0]) || !edge_ok(bytes[bytes.len() - 1]) {
        bail!("Task name '{name}' must start and end with a lowercase letter or digit");
    }

    if !bytes.iter().all(|&c| inner_ok(c)) {
        bail!("Task name '{name}' contains invalid characters. Use only lowercase letters, digits, and dashes");
    }

    Ok(())
}

/// Validates a turn file name for use in queue events and state paths.
///
/// Rejects empty names, path separators, traversal components, and names
/// not ending in `.md`.
pub fn validate_file_name(name: &str) -> Result<()> {
    if name.is_empty() {
        bail!("File name cannot be empty");
    }

    if name.len() > MAX_FILE_NAME_LENGTH {
        bail!(
            "File name too long: {} characters (max {})",
            name.len(),
            MAX_FILE_NAME_LENGTH
        );
    }

    if name.contains('/') || name.contains('\\') || name.contains("..") {
        bail!("File name '{name}' must not contain path separators or traversal components");
    }

    if !name.ends_with(".md") {
        bail!("File name '{name}' is not a markdown turn file");
    }

    Ok(())
}

/// Replace every character outside `[A-Za-z0-9._-]` so a name can be embedded
/// in a flat state file name (partial rescues, stderr logs).
pub fn sanitize_for_flat_name(name: &str) -> String {
    name.chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '.' || c == '_' || c == '-' {
                c
            } else {
                '_'
            }
        })
        .collect()
}

/// Clap value parser for validating task name arguments.
pub fn clap_task_validator(s: &str) -> Result<String, String> {
    validate_task_name(s).map_err(|e| e.to_string())?;
    Ok(s.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validate_task_name_valid() {
        assert!(validate_task_name("demo").is_ok());
        assert!(validate_task_name("my-task-01").is_ok());
        assert!(validate_task_name("a").is_ok());
        assert!(validate_task_name("0").is_ok());
    }

    #[test]
    fn test_validate_task_name_rejects_edges() {
        assert!(validate_task_name("-demo").is_err());
        assert!(validate_task_name("demo-").is_err());
        assert!(validate_task_name("-").is_err());
    }

    #[test]
    fn test_validate_task_name_rejects_invalid_chars() {
        assert!(validate_task_name("Demo").is_err());
        assert!(validate_task_name("demo_task").is_err());
        assert!(validate_task_name("demo/task").is_err());
        assert!(validate_task_name("../task").is_err());
        assert!(validate_task_name("demo task").is_err());
        assert!(validate_task_name("").is_err());
    }

    #[test]
    fn test_validate_task_name_too_long() {
        let long = "a".repeat(MAX_TASK_NAME_LENGTH + 1);
        assert!(validate_task_name(&long).is_err());
    }

    #[test]
    fn test_validate_file_name() {
        assert!(validate_file_name("001_demo.md").is_ok());
        assert!(validate_file_name("002_demo_response.md").is_ok());
        assert!(validate_file_name("").is_err());
        assert!(validate_file_name("notes.txt").is_err());
        assert!(validate_file_name("../001_demo.md").is_err());
        assert!(validate_file_name("a/b.md").is_err());
    }

    #[test]
    fn test_sanitize_for_flat_name() {
        assert_eq!(sanitize_for_flat_name("001_demo.md"), "001_demo.md");
        assert_eq!(sanitize_for_flat_name("a/b c.md"), "a_b_c.md");
    }

    #[test]
    fn test_clap_task_validator() {
        assert!(clap_task_validator("valid-task").is_ok());
        assert!(clap_task_validator("../invalid").is_err());
    }
}
