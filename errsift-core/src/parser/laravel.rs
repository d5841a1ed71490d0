//! Laravel log format
//!
//! ```text
//! [2025-08-17 10:12:34] production.ERROR: Undefined index: id {"exception":"..."}
//! [stacktrace]
//! #0 /var/www/app/Http/Controllers/OrderController.php(42): ...
//! ```

use crate::types::{ParsedEntry, DEFAULT_LEVEL};
use regex::Regex;

use super::LineParser;

const HEADER: &str = r"^\[(?P<ts>\d{4}-\d{2}-\d{2} \d{2}:\d{2}:\d{2})\]\s*(?:(?P<env>[\w-]+)\.(?P<level>[A-Za-z]+):\s*)?(?P<msg>.*)$";

/// Groups Laravel records; lines without a bracketed timestamp continue the
/// previous record.
#[derive(Debug, Clone)]
pub struct LaravelLineParser {
    header: Regex,
}

impl LaravelLineParser {
    pub fn new() -> Self {
        Self {
            header: Regex::new(HEADER).expect("laravel header pattern is valid"),
        }
    }
}

impl Default for LaravelLineParser {
    fn default() -> Self {
        Self::new()
    }
}

impl LineParser for LaravelLineParser {
    fn id(&self) -> &'static str {
        "laravel"
    }

    fn parse(&self, line: &str) -> ParsedEntry {
        let Some(caps) = self.header.captures(line) else {
            return ParsedEntry::unclassified(line);
        };

        ParsedEntry {
            raw: line.to_string(),
            timestamp: caps.name("ts").map(|m| m.as_str().to_string()),
            level: Some(
                caps.name("level")
                    .map_or(DEFAULT_LEVEL.to_string(), |m| m.as_str().to_uppercase()),
            ),
            message: caps.name("msg").map(|m| m.as_str().to_string()),
        }
    }

    fn is_continuation(&self, line: &str) -> bool {
        !self.header.is_match(line)
    }
}
