//! Line parsers
//!
//! A parser turns one tailed line into a [`ParsedEntry`]. Parsing never
//! fails: a line no pattern understands becomes a best-effort entry carrying
//! the raw text at [`DEFAULT_LEVEL`](crate::types::DEFAULT_LEVEL).
//!
//! | Identifier | Parser | Format |
//! |------------|--------|--------|
//! | `regex` (`regex_parser`) | [`RegexLineParser`] | `<date> <time> LEVEL msg` or `LEVEL: msg` |
//! | `laravel` | [`LaravelLineParser`] | `[YYYY-MM-DD HH:MM:SS] env.LEVEL: msg` + stack trace |

mod laravel;
mod pattern;

pub use self::laravel::LaravelLineParser;
pub use self::pattern::RegexLineParser;

use crate::types::ParsedEntry;

/// Identifier used when a stream does not name a parser.
pub const DEFAULT_PARSER: &str = "regex";

/// Classifies single log lines.
pub trait LineParser: Send + Sync {
    /// Identifier this parser is registered under
    fn id(&self) -> &'static str;

    /// Parse one line into an entry; never fails.
    fn parse(&self, line: &str) -> ParsedEntry;

    /// Whether `line` continues the previous entry (e.g. a stack frame).
    fn is_continuation(&self, _line: &str) -> bool {
        false
    }
}

/// Get a parser by identifier.
///
/// Returns `None` for unknown identifiers.
pub fn parser_for(id: &str) -> Option<Box<dyn LineParser>> {
    match id {
        "regex" | "regex_parser" => Some(Box::new(RegexLineParser::new())),
        "laravel" => Some(Box::new(LaravelLineParser::new())),
        _ => None,
    }
}

/// Parse a batch of lines, folding continuation lines into the entry before
/// them. A continuation with nothing before it starts its own entry.
pub fn parse_lines<'a, I>(parser: &dyn LineParser, lines: I) -> Vec<ParsedEntry>
where
    I: IntoIterator<Item = &'a str>,
{
    let mut entries: Vec<ParsedEntry> = Vec::new();
    for line in lines {
        match entries.last_mut() {
            Some(last) if parser.is_continuation(line) => last.append_continuation(line),
            _ => entries.push(parser.parse(line)),
        }
    }
    entries
}
