//! Include/exclude line filters

use crate::error::{Error, Result};
use regex::Regex;
use std::sync::OnceLock;

/// Built-in error-level pattern used by remote sources without an include filter.
pub fn error_level_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"(?i)(ERROR|EXCEPTION|FATAL|CRITICAL)").expect("error level pattern is valid")
    })
}

/// Compiled include/exclude pair applied to every tailed line.
#[derive(Debug, Clone, Default)]
pub struct LineFilter {
    include: Option<Regex>,
    exclude: Option<Regex>,
}

impl LineFilter {
    pub fn new(include: Option<Regex>, exclude: Option<Regex>) -> Self {
        Self { include, exclude }
    }

    /// Compile optional patterns; an invalid pattern is a configuration error.
    pub fn from_patterns(include: Option<&str>, exclude: Option<&str>) -> Result<Self> {
        Ok(Self {
            include: include.map(compile).transpose()?,
            exclude: exclude.map(compile).transpose()?,
        })
    }

    pub fn include(&self) -> Option<&Regex> {
        self.include.as_ref()
    }

    pub fn exclude(&self) -> Option<&Regex> {
        self.exclude.as_ref()
    }

    /// Emit iff (include absent or matches) and (exclude absent or does not match).
    pub fn accepts(&self, line: &str) -> bool {
        self.include.as_ref().map_or(true, |re| re.is_match(line))
            && self.exclude.as_ref().map_or(true, |re| !re.is_match(line))
    }

    /// Same filter, with `default` standing in for a missing include pattern.
    pub fn or_default_include(&self, default: &Regex) -> Self {
        Self {
            include: Some(self.include.clone().unwrap_or_else(|| default.clone())),
            exclude: self.exclude.clone(),
        }
    }
}

fn compile(pattern: &str) -> Result<Regex> {
    Regex::new(pattern)
        .map_err(|e| Error::Config(format!("invalid filter pattern {:?}: {}", pattern, e)))
}
