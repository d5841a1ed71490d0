//! Generic regex parser for `<date> <time> LEVEL message` style lines

use crate::types::ParsedEntry;
use regex::Regex;

use super::LineParser;

const TIMESTAMPED: &str =
    r"(?i)^(?P<ts>\S+\s+\S+)\s+(?P<level>ERROR|CRITICAL|FATAL|Exception)\s+(?P<msg>.+)$";
const LEVEL_PREFIXED: &str = r"(?i)(?P<level>ERROR|FATAL|CRITICAL)\s*[:\-]\s*(?P<msg>.+)$";

/// Tries an ordered list of patterns; the first match wins.
///
/// Patterns may capture `ts`, `level` and `msg`.
#[derive(Debug, Clone)]
pub struct RegexLineParser {
    patterns: Vec<Regex>,
}

impl RegexLineParser {
    pub fn new() -> Self {
        let patterns = [TIMESTAMPED, LEVEL_PREFIXED]
            .iter()
            .map(|p| Regex::new(p).expect("built-in parser pattern is valid"))
            .collect();
        Self { patterns }
    }

    /// Use custom patterns instead of the built-in ones.
    pub fn with_patterns(patterns: Vec<Regex>) -> Self {
        Self { patterns }
    }
}

impl Default for RegexLineParser {
    fn default() -> Self {
        Self::new()
    }
}

impl LineParser for RegexLineParser {
    fn id(&self) -> &'static str {
        "regex"
    }

    fn parse(&self, line: &str) -> ParsedEntry {
        for pattern in &self.patterns {
            if let Some(caps) = pattern.captures(line) {
                let group = |name: &str| caps.name(name).map(|m| m.as_str().to_string());
                return ParsedEntry {
                    raw: line.to_string(),
                    timestamp: group("ts"),
                    level: group("level").map(|l| l.to_uppercase()),
                    message: group("msg"),
                };
            }
        }
        ParsedEntry::unclassified(line)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_timestamped_line() {
        let entry = RegexLineParser::new().parse("2025-08-13 10:00:00 ERROR Connection refused");
        assert_eq!(entry.timestamp.as_deref(), Some("2025-08-13 10:00:00"));
        assert_eq!(entry.level.as_deref(), Some("ERROR"));
        assert_eq!(entry.message.as_deref(), Some("Connection refused"));
    }

    #[test]
    fn test_level_prefixed_line() {
        let entry = RegexLineParser::new().parse("worker-3 fatal: out of memory");
        assert!(entry.timestamp.is_none());
        assert_eq!(entry.level.as_deref(), Some("FATAL"));
        assert_eq!(entry.message.as_deref(), Some("out of memory"));
    }

    #[test]
    fn test_exception_level_is_case_insensitive() {
        let entry = RegexLineParser::new().parse("2025-08-13T10:00:00Z +0000 exception NullPointer");
        assert_eq!(entry.level.as_deref(), Some("EXCEPTION"));
    }

    #[test]
    fn test_unmatched_line_degrades() {
        let entry = RegexLineParser::new().parse("something unusual happened");
        assert_eq!(entry.raw, "something unusual happened");
        assert_eq!(entry.message.as_deref(), Some("something unusual happened"));
        assert_eq!(entry.level.as_deref(), Some("ERROR"));
    }

    #[test]
    fn test_custom_patterns() {
        let parser =
            RegexLineParser::with_patterns(vec![Regex::new(r"^(?P<level>W\w+) (?P<msg>.*)$").unwrap()]);
        let entry = parser.parse("WARN slow query");
        assert_eq!(entry.level.as_deref(), Some("WARN"));
        assert_eq!(entry.message.as_deref(), Some("slow query"));
    }
}
