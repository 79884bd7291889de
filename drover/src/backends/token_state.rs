//! Per-backend exhaustion state with a reset deadline.
//!
//! Persisted as `<state>/token-state.json`:
//! `{"exhausted":{"claude":true},"reset_time":{"claude":"2026-08-02T12:00:00Z"}}`.
//! Mutations rewrite the whole file via temp-then-rename; reads are
//! unlocked - the file is tiny and writers are serialized by the scheduler.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::PathBuf;

use crate::fs::write_atomic;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct TokenStateData {
    #[serde(default)]
    exhausted: BTreeMap<String, bool>,
    #[serde(default)]
    reset_time: BTreeMap<String, DateTime<Utc>>,
}

#[derive(Debug, Clone)]
pub struct TokenState {
    path: PathBuf,
}

impl TokenState {
    pub fn new(path: PathBuf) -> Self {
        Self { path }
    }

    /// Create the state file if absent.
    pub fn init(&self) -> Result<()> {
        if !self.path.exists() {
            self.save(&TokenStateData::default())?;
        }
        Ok(())
    }

    /// Flag a backend as exhausted until `reset_at`.
    pub fn mark_exhausted(&self, backend: &str, reset_at: DateTime<Utc>) -> Result<()> {
        let mut data = self.load();
        data.exhausted.insert(backend.to_string(), true);
        data.reset_time.insert(backend.to_string(), reset_at);
        self.save(&data)
    }

    /// Clear the exhaustion flag for a backend.
    pub fn clear(&self, backend: &str) -> Result<()> {
        let mut data = self.load();
        data.exhausted.insert(backend.to_string(), false);
        data.reset_time.remove(backend);
        self.save(&data)
    }

    /// Exhausted iff flagged AND now is before the reset deadline.
    pub fn is_exhausted(&self, backend: &str) -> bool {
        let data = self.load();
        if !data.exhausted.get(backend).copied().unwrap_or(false) {
            return false;
        }
        match data.reset_time.get(backend) {
            Some(reset_at) => Utc::now() < *reset_at,
            // Flagged with no deadline: treat as already reset.
            None => false,
        }
    }

    /// The reset deadline, if one is recorded.
    pub fn reset_at(&self, backend: &str) -> Option<DateTime<Utc>> {
        self.load().reset_time.get(backend).copied()
    }

    fn load(&self) -> TokenStateData {
        let Ok(raw) = fs::read_to_string(&self.path) else {
            return TokenStateData::default();
        };
        serde_json::from_str(&raw).unwrap_or_else(|e| {
            eprintln!("Unreadable token state {}: {e}", self.path.display());
            TokenStateData::default()
        })
    }

    fn save(&self, data: &TokenStateData) -> Result<()> {
        let json = serde_json::to_string_pretty(data).context("Failed to serialize token state")?;
        write_atomic(&self.path, &json)
    }
}
