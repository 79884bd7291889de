//! Desktop notification support for orchestrator events.
//!
//! Uses notify-send on Linux and osascript on macOS. Failures are logged
//! but never propagated - notifications are best-effort and must not block
//! or fail the caller.

use std::process::Command;

/// Notification urgency.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Priority {
    Normal,
    /// Rate limits, restart exhaustion, stop processing.
    High,
}

/// Send a desktop notification.
pub fn send(title: &str, body: &str, priority: Priority) {
    let result = if cfg!(target_os = "macos") {
        send_macos(title, body)
    } else {
        send_linux(title, body, priority)
    };

    if let Err(e) = result {
        eprintln!("Desktop notification failed: {e}");
    }
}

fn send_linux(title: &str, body: &str, priority: Priority) -> Result<(), String> {
    let urgency = match priority {
        Priority::Normal => "--urgency=normal",
        Priority::High => "--urgency=critical",
    };
    Command::new("notify-send")
        .arg(urgency)
        .arg("--app-name=drover")
        .arg(title)
        .arg(body)
        .output()
        .map_err(|e| format!("notify-send failed: {e}"))
        .and_then(|output| {
            if output.status.success() {
                Ok(())
            } else {
                Err(format!("notify-send exited with: {}", output.status))
            }
        })
}

fn send_macos(title: &str, body: &str) -> Result<(), String> {
    let script = format!(
        r#"display notification "{}" with title "{}""#,
        body.replace('"', r#"\""#),
        title.replace('"', r#"\""#)
    );

    Command::new("osascript")
        .arg("-e")
        .arg(&script)
        .output()
        .map_err(|e| format!("osascript failed: {e}"))
        .and_then(|output| {
            if output.status.success() {
                Ok(())
            } else {
                Err(format!("osascript exited with: {}", output.status))
            }
        })
}

/// Truncate a body string to max_len characters, adding ellipsis if needed.
pub fn truncate_body(body: &str, max_len: usize) -> String {
    if body.chars().count() <= max_len {
        body.to_string()
    } else {
        let kept: String = body.chars().take(max_len.saturating_sub(3)).collect();
        format!("{kept}...")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_truncate_body_short() {
        assert_eq!(truncate_body("short", 200), "short");
    }

    #[test]
    fn test_truncate_body_long() {
        let long = "a".repeat(300);
        let result = truncate_body(&long, 200);
        assert_eq!(result.chars().count(), 200);
        assert!(result.ends_with("..."));
    }

    #[test]
    fn test_truncate_body_exact() {
        let exact = "a".repeat(200);
        assert_eq!(truncate_body(&exact, 200), exact);
    }
}
