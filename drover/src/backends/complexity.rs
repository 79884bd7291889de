//! Complexity resolution for routing.
//!
//! The value comes from an HTML comment in the input file, falling back to
//! the last value cached under `<state>/complexity/<task>`, falling back to
//! the configured default. Whatever resolves is cached back so later turns
//! of the task route the same way without re-annotating every file.

use anyhow::Result;
use std::fs;
use std::path::Path;

use crate::config::Config;
use crate::turn::extract_complexity;

/// Resolve the complexity for one invocation and refresh the cache.
pub fn resolve_complexity(config: &Config, task: &str, input: &Path) -> u8 {
    let from_file = fs::read_to_string(input)
        .ok()
        .and_then(|content| extract_complexity(&content));

    let resolved = from_file
        .or_else(|| read_cached(config, task))
        .unwrap_or(config.default_complexity);

    if let Err(e) = write_cached(config, task, resolved) {
        eprintln!("Failed to cache complexity for '{task}': {e}");
    }
    resolved
}

fn cache_path(config: &Config, task: &str) -> std::path::PathBuf {
    config.complexity_dir().join(task)
}

fn read_cached(config: &Config, task: &str) -> Option<u8> {
    let value: u8 = fs::read_to_string(cache_path(config, task))
        .ok()?
        .trim()
        .parse()
        .ok()?;
    (1..=3).contains(&value).then_some(value)
}

fn write_cached(config: &Config, task: &str, value: u8) -> Result<()> {
    fs::create_dir_all(config.complexity_dir())?;
    fs::write(cache_path(config, task), value.to_string())?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use serial_test::serial;
    use tempfile::TempDir;

    fn config_in(temp: &TempDir) -> Config {
        std::env::set_var("STATE_DIR", temp.path().join("state"));
        std::env::set_var("VAULT_TASKS_DIR", temp.path().join("vault"));
        let cfg = Config::from_env();
        std::env::remove_var("STATE_DIR");
        std::env::remove_var("VAULT_TASKS_DIR");
        cfg
    }

    #[test]
    #[serial]
    fn test_file_annotation_wins_and_caches() {
        let temp = TempDir::new().unwrap();
        let cfg = config_in(&temp);
        let input = temp.path().join("001_demo.md");
        fs::write(&input, "<!-- complexity: 1 -->\ndo the thing\n<User>\n").unwrap();

        assert_eq!(resolve_complexity(&cfg, "demo", &input), 1);

        // Cache now answers even when the next file has no annotation.
        let next = temp.path().join("003_demo.md");
        fs::write(&next, "follow-up\n<User>\n").unwrap();
        assert_eq!(resolve_complexity(&cfg, "demo", &next), 1);
    }

    #[test]
    #[serial]
    fn test_default_when_nothing_known() {
        let temp = TempDir::new().unwrap();
        let cfg = config_in(&temp);
        let input = temp.path().join("001_demo.md");
        fs::write(&input, "no annotation\n<User>\n").unwrap();

        assert_eq!(resolve_complexity(&cfg, "demo", &input), cfg.default_complexity);
    }

    #[test]
    #[serial]
    fn test_garbage_cache_is_ignored() {
        let temp = TempDir::new().unwrap();
        let cfg = config_in(&temp);
        fs::create_dir_all(cfg.complexity_dir()).unwrap();
        fs::write(cfg.complexity_dir().join("demo"), "seven").unwrap();

        let input = temp.path().join("001_demo.md");
        fs::write(&input, "plain\n<User>\n").unwrap();
        assert_eq!(resolve_complexity(&cfg, "demo", &input), cfg.default_complexity);
    }
}
