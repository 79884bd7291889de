//! Stderr protocol extraction, one parser per backend kind.
//!
//! Backend CLIs report sessions, turn counts, and rate limits as free-form
//! human text; every brittle regex lives here behind a finite interface so
//! a backend upgrade breaks exactly one module.

use chrono::{DateTime, TimeZone, Utc};
use regex::Regex;
use std::sync::OnceLock;

/// How a raw reset token was interpreted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResetInterpretation {
    RelativeSeconds,
    EpochSeconds,
    DefaultFloor,
}

/// A detected rate-limit condition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RateLimitSignal {
    /// The raw token as it appeared in stderr (or in a
    /// `TOKEN_EXHAUSTED:` line), e.g. `+3600`.
    pub raw: String,
}

/// Extraction interface implemented per backend.
pub trait StderrParser {
    /// Session id, if the backend reported one.
    fn parse_session(&self, stderr: &str) -> Option<String>;
    /// Turns used, if the backend reported them.
    fn parse_turns(&self, stderr: &str) -> Option<u32>;
    /// Rate-limit condition with its raw reset token.
    fn detect_rate_limit(&self, stderr: &str) -> Option<RateLimitSignal>;
}

/// Parser for the hosted CLI backend.
pub struct HostedParser;

/// Parser for the local daemon backend. It has no session concept and its
/// failure mode is the daemon being down, but rate-limit style errors from
/// proxy layers are still recognized.
pub struct LocalParser;

fn rate_limit_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"(?i)rate.?limit|token.?exhaust|too.?many.?requests|\b429\b").unwrap()
    })
}

fn reset_token_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    // First duration/time-like token after (or near) the rate-limit phrase:
    // `+3600`, `retry after 120`, `resets at 1760000000`.
    RE.get_or_init(|| Regex::new(r"([+-]?\d{1,12})").unwrap())
}

fn turns_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"(?i)\bturns?(?:\s+used)?\s*[:=]\s*(\d+)(?:\s*/\s*\d+)?").unwrap()
    })
}

fn max_turns_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?i)max(?:imum)?\s+turns\s+reached\D{0,20}(\d+)").unwrap())
}

fn session_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"(?i)(?:\bSession:\s*|session[_-]?id\s*[=:]\s*)([0-9a-f][0-9a-f-]{7,})")
            .unwrap()
    })
}

impl StderrParser for HostedParser {
    fn parse_session(&self, stderr: &str) -> Option<String> {
        session_re()
            .captures(stderr)
            .and_then(|c| c.get(1))
            .map(|m| m.as_str().to_string())
    }

    fn parse_turns(&self, stderr: &str) -> Option<u32> {
        if let Some(c) = turns_re().captures(stderr) {
            return c.get(1).and_then(|m| m.as_str().parse().ok());
        }
        max_turns_re()
            .captures(stderr)
            .and_then(|c| c.get(1))
            .and_then(|m| m.as_str().parse().ok())
    }

    fn detect_rate_limit(&self, stderr: &str) -> Option<RateLimitSignal> {
        detect_rate_limit_common(stderr)
    }
}

impl StderrParser for LocalParser {
    fn parse_session(&self, _stderr: &str) -> Option<String> {
        None
    }

    fn parse_turns(&self, _stderr: &str) -> Option<u32> {
        None
    }

    fn detect_rate_limit(&self, stderr: &str) -> Option<RateLimitSignal> {
        detect_rate_limit_common(stderr)
    }
}

fn detect_rate_limit_common(stderr: &str) -> Option<RateLimitSignal> {
    let m = rate_limit_re().find(stderr)?;
    // Look for the first time-like token after the phrase; fall back to the
    // default floor when the message has none.
    let tail = &stderr[m.end()..];
    let raw = reset_token_re()
        .captures(tail)
        .and_then(|c| c.get(1))
        .map(|m| m.as_str().to_string())
        .unwrap_or_else(|| "60".to_string());
    Some(RateLimitSignal { raw })
}

/// Interpret a raw reset token into an absolute deadline.
///
/// `+N` is relative seconds. A bare number at or above one billion is an
/// epoch timestamp; anything smaller is relative seconds. Zero or negative
/// values become the 60-second floor. The interpretation is returned so the
/// caller can log it next to the raw token.
pub fn interpret_reset_token(raw: &str, now: DateTime<Utc>) -> (DateTime<Utc>, ResetInterpretation) {
    const EPOCH_THRESHOLD: i64 = 1_000_000_000;
    const FLOOR_SECS: i64 = 60;

    let trimmed = raw.trim();
    let explicit_relative = trimmed.starts_with('+');
    let value: i64 = trimmed
        .trim_start_matches('+')
        .parse()
        .unwrap_or(0);

    if value <= 0 {
        return (
            now + chrono::Duration::seconds(FLOOR_SECS),
            ResetInterpretation::DefaultFloor,
        );
    }

    if !explicit_relative && value >= EPOCH_THRESHOLD {
        match Utc.timestamp_opt(value, 0).single() {
            Some(at) if at > now => return (at, ResetInterpretation::EpochSeconds),
            _ => {
                // Epoch in the past (or invalid) cannot be a reset deadline.
                return (
                    now + chrono::Duration::seconds(FLOOR_SECS),
                    ResetInterpretation::DefaultFloor,
                );
            }
        }
    }

    (
        now + chrono::Duration::seconds(value),
        ResetInterpretation::RelativeSeconds,
    )
}
