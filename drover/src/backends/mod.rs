//! Backend registry: enumeration, slot accounting, exhaustion checks, and
//! complexity-based routing.
//!
//! The registry itself is immutable after init; slot counts come from the
//! lock registry and exhaustion from the persisted token state, so routing
//! always reflects what is actually on disk.

pub mod complexity;
pub mod stderr;
pub mod token_state;

pub use complexity::resolve_complexity;
pub use token_state::TokenState;

use crate::config::{BackendConfig, BackendKind, Config};
use crate::locks::LockRegistry;

/// Routing decision for one invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Route {
    /// Dispatch to this backend.
    To(String),
    /// No capable backend available; hold the event and retry later.
    Queued,
}

#[derive(Debug, Clone)]
pub struct BackendRegistry {
    backends: Vec<BackendConfig>,
}

impl BackendRegistry {
    pub fn from_config(config: &Config) -> Self {
        Self {
            backends: config.backends.clone(),
        }
    }

    pub fn list(&self) -> Vec<&str> {
        self.backends.iter().map(|b| b.name.as_str()).collect()
    }

    pub fn get(&self, name: &str) -> Option<&BackendConfig> {
        self.backends.iter().find(|b| b.name == name)
    }

    /// First local backend in the table (complexity-1 target).
    pub fn local(&self) -> Option<&BackendConfig> {
        self.backends.iter().find(|b| b.kind == BackendKind::Local)
    }

    /// First hosted backend in the table (complexity-3 target).
    pub fn hosted(&self) -> Option<&BackendConfig> {
        self.backends.iter().find(|b| b.kind == BackendKind::Api)
    }

    /// Free slots on a backend: `max_parallel` minus live locks, floored at 0.
    pub fn slots_available(&self, name: &str, locks: &LockRegistry) -> u32 {
        let Some(backend) = self.get(name) else {
            return 0;
        };
        let held = locks.count(name) as u32;
        backend.max_parallel.saturating_sub(held)
    }

    pub fn is_exhausted(&self, name: &str, tokens: &TokenState) -> bool {
        tokens.is_exhausted(name)
    }

    /// A backend is unavailable when exhausted or out of slots.
    fn available(&self, backend: &BackendConfig, locks: &LockRegistry, tokens: &TokenState) -> bool {
        !tokens.is_exhausted(&backend.name) && self.slots_available(&backend.name, locks) > 0
    }

    /// Map a complexity level to a backend.
    ///
    /// - 1: local only
    /// - 2: local preferred, overflow to hosted when local is busy or
    ///   exhausted
    /// - 3 (and anything else): hosted only
    ///
    /// Returns [`Route::Queued`] when every capable backend is unavailable.
    pub fn route(&self, complexity: u8, locks: &LockRegistry, tokens: &TokenState) -> Route {
        let local = self.local().filter(|b| self.available(b, locks, tokens));
        let hosted = self.hosted().filter(|b| self.available(b, locks, tokens));

        let chosen = match complexity {
            1 => local,
            2 => local.or(hosted),
            _ => hosted,
        };

        match chosen {
            Some(backend) => Route::To(backend.name.clone()),
            None => Route::Queued,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::BackendKind;
    use chrono::{Duration, Utc};
    use tempfile::TempDir;

    fn test_registry() -> BackendRegistry {
        BackendRegistry {
            backends: vec![
                BackendConfig {
                    name: "claude".to_string(),
                    kind: BackendKind::Api,
                    command: "claude".to_string(),
                    max_parallel: 2,
                    flags: Vec::new(),
                    model: None,
                    endpoint: None,
                    invoker: None,
                },
                BackendConfig {
                    name: "ollama".to_string(),
                    kind: BackendKind::Local,
                    command: "ollama".to_string(),
                    max_parallel: 1,
                    flags: Vec::new(),
                    model: Some("llama3".to_string()),
                    endpoint: None,
                    invoker: None,
                },
            ],
        }
    }

    fn fixtures(temp: &TempDir) -> (LockRegistry, TokenState) {
        (
            LockRegistry::new(temp.path().join("locks")),
            TokenState::new(temp.path().join("token-state.json")),
        )
    }

    #[test]
    fn test_slots_reflect_live_locks() {
        let temp = TempDir::new().unwrap();
        let (locks, _) = fixtures(&temp);
        let registry = test_registry();
        let me = std::process::id();

        assert_eq!(registry.slots_available("claude", &locks), 2);
        locks.acquire("claude", "alpha", me).unwrap();
        assert_eq!(registry.slots_available("claude", &locks), 1);
        locks.acquire("claude", "beta", me).unwrap();
        assert_eq!(registry.slots_available("claude", &locks), 0);
        assert_eq!(registry.slots_available("unknown", &locks), 0);
    }

    #[test]
    fn test_route_by_complexity() {
        let temp = TempDir::new().unwrap();
        let (locks, tokens) = fixtures(&temp);
        let registry = test_registry();

        assert_eq!(
            registry.route(1, &locks, &tokens),
            Route::To("ollama".to_string())
        );
        assert_eq!(
            registry.route(2, &locks, &tokens),
            Route::To("ollama".to_string())
        );
        assert_eq!(
            registry.route(3, &locks, &tokens),
            Route::To("claude".to_string())
        );
    }

    #[test]
    fn test_route_complexity_2_overflows_to_hosted() {
        let temp = TempDir::new().unwrap();
        let (locks, tokens) = fixtures(&temp);
        let registry = test_registry();
        let me = std::process::id();

        // Fill ollama's single slot.
        locks.acquire("ollama", "busy", me).unwrap();
        assert_eq!(
            registry.route(2, &locks, &tokens),
            Route::To("claude".to_string())
        );
        assert_eq!(registry.route(1, &locks, &tokens), Route::Queued);
    }

    #[test]
    fn test_route_never_picks_full_backend() {
        let temp = TempDir::new().unwrap();
        let (locks, tokens) = fixtures(&temp);
        let registry = test_registry();
        let me = std::process::id();

        locks.acquire("claude", "a", me).unwrap();
        locks.acquire("claude", "b", me).unwrap();

        assert_eq!(registry.route(3, &locks, &tokens), Route::Queued);
    }

    #[test]
    fn test_route_respects_exhaustion() {
        let temp = TempDir::new().unwrap();
        let (locks, tokens) = fixtures(&temp);
        let registry = test_registry();

        tokens
            .mark_exhausted("claude", Utc::now() + Duration::hours(1))
            .unwrap();
        assert_eq!(registry.route(3, &locks, &tokens), Route::Queued);

        tokens
            .mark_exhausted("ollama", Utc::now() + Duration::hours(1))
            .unwrap();
        assert_eq!(registry.route(2, &locks, &tokens), Route::Queued);
        assert_eq!(registry.route(1, &locks, &tokens), Route::Queued);
    }

    #[test]
    fn test_route_complexity_2_prefers_local_over_exhausted() {
        let temp = TempDir::new().unwrap();
        let (locks, tokens) = fixtures(&temp);
        let registry = test_registry();

        tokens
            .mark_exhausted("ollama", Utc::now() + Duration::hours(1))
            .unwrap();
        assert_eq!(
            registry.route(2, &locks, &tokens),
            Route::To("claude".to_string())
        );
    }

    #[test]
    fn test_registry_lookups() {
        let registry = test_registry();
        assert_eq!(registry.list(), vec!["claude", "ollama"]);
        assert_eq!(registry.local().unwrap().name, "ollama");
        assert_eq!(registry.hosted().unwrap().name, "claude");
        assert!(registry.get("missing").is_none());
    }
}
