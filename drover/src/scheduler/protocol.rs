//! The invoker stdout protocol, as parsed by the scheduler.
//!
//! Line-prefixed, newline-terminated, any order:
//! `SESSION_ID:<id>`, `TURNS_USED:<n>`, `TOKEN_EXHAUSTED:<token>`.

/// Parsed protocol lines from one invoker run.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProtocolReport {
    pub session_id: Option<String>,
    pub turns_used: Option<u32>,
    pub token_exhausted: Option<String>,
}

/// Parse the invoker's stdout. Unknown lines are ignored; the last
/// occurrence of a repeated prefix wins.
pub fn parse_protocol(stdout: &str) -> ProtocolReport {
    let mut report = ProtocolReport::default();
    for line in stdout.lines() {
        let line = line.trim();
        if let Some(id) = line.strip_prefix("SESSION_ID:") {
            if !id.is_empty() && !id.contains(char::is_whitespace) {
                report.session_id = Some(id.to_string());
            }
        } else if let Some(n) = line.strip_prefix("TURNS_USED:") {
            if let Ok(n) = n.parse() {
                report.turns_used = Some(n);
            }
        } else if let Some(token) = line.strip_prefix("TOKEN_EXHAUSTED:") {
            if !token.is_empty() {
                report.token_exhausted = Some(token.to_string());
            }
        }
    }
    report
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_all_lines_any_order() {
        let report = parse_protocol("TURNS_USED:3\nSESSION_ID:abc-1\n");
        assert_eq!(report.session_id.as_deref(), Some("abc-1"));
        assert_eq!(report.turns_used, Some(3));
        assert!(report.token_exhausted.is_none());
    }

    #[test]
    fn test_parse_token_exhausted() {
        let report = parse_protocol("TOKEN_EXHAUSTED:+3600\n");
        assert_eq!(report.token_exhausted.as_deref(), Some("+3600"));
    }

    #[test]
    fn test_unknown_lines_ignored() {
        let report = parse_protocol("chatter\nSESSION_ID:abc-1\nmore chatter\n");
        assert_eq!(report.session_id.as_deref(), Some("abc-1"));
    }

    #[test]
    fn test_malformed_values_ignored() {
        let report = parse_protocol("SESSION_ID:has space\nTURNS_USED:three\nTOKEN_EXHAUSTED:\n");
        assert_eq!(report, ProtocolReport::default());
    }
}
