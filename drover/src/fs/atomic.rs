//! Atomic file replacement via write-temp-then-rename.
//!
//! Every JSON state file (token state, continuations, usage counters,
//! failure sentinels) is replaced through this path so a crashed writer
//! never leaves a torn file behind.

use anyhow::{Context, Result};
use std::fs;
use std::io::Write;
use std::path::Path;

/// Write `content` to `path` atomically.
///
/// The temporary file is created in the same directory as the target so the
/// final rename never crosses a filesystem boundary.
pub fn write_atomic(path: &Path, content: &str) -> Result<()> {
    let dir = path
        .parent()
        .with_context(|| format!("No parent directory for: {}", path.display()))?;
    fs::create_dir_all(dir)
        .with_context(|| format!("Failed to create directory: {}", dir.display()))?;

    let mut tmp = tempfile::NamedTempFile::new_in(dir)
        .with_context(|| format!("Failed to create temp file in: {}", dir.display()))?;
    tmp.write_all(content.as_bytes())
        .with_context(|| format!("Failed to write temp file for: {}", path.display()))?;
    tmp.flush()
        .with_context(|| format!("Failed to flush temp file for: {}", path.display()))?;
    tmp.persist(path)
        .with_context(|| format!("Failed to rename temp file over: {}", path.display()))?;
    Ok(())
}
