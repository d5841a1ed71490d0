//! Core domain types for errsift
//!
//! ## Terminology
//!
//! | Term | Definition |
//! |------|------------|
//! | **Source** | One configured log-producing environment (a cluster or host) |
//! | **Stream** | One category of log file within a source, with its own path and filters |
//! | **Offset** | Byte position marking how much of a file has been consumed |
//! | **Work unit** | One (source, stream) pair processed per scheduling cycle |
//!
//! Sources and streams are immutable once the inventory is loaded. Work units
//! borrow them for the duration of a single cycle.

use crate::source::LineFilter;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

// ============================================
// Sources and streams
// ============================================

/// How a source's files are reached.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceKind {
    /// Filesystem mounted into this host
    Local,
    /// Remote host reached over SFTP
    Remote,
}

impl SourceKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            SourceKind::Local => "local",
            SourceKind::Remote => "sftp",
        }
    }
}

impl std::fmt::Display for SourceKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for SourceKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "local" => Ok(SourceKind::Local),
            "sftp" | "remote" => Ok(SourceKind::Remote),
            _ => Err(format!("unknown source kind: {}", s)),
        }
    }
}

/// Connection parameters for a remote source.
#[derive(Clone, PartialEq, Eq)]
pub struct RemoteConnection {
    pub host: String,
    pub port: u16,
    pub username: String,
    /// Private key used for public-key authentication
    pub key_path: PathBuf,
    /// Passphrase for the private key, if it is encrypted
    pub key_passphrase: Option<String>,
    /// OpenSSH known_hosts file to verify the host key against
    pub known_hosts: Option<PathBuf>,
}

impl std::fmt::Debug for RemoteConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RemoteConnection")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("username", &self.username)
            .field("key_path", &self.key_path)
            .field("key_passphrase", &self.key_passphrase.as_ref().map(|_| "<redacted>"))
            .field("known_hosts", &self.known_hosts)
            .finish()
    }
}

impl RemoteConnection {
    /// `host:port` label used in logs and errors.
    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

/// One configured log-producing environment.
#[derive(Debug, Clone)]
pub struct LogSource {
    /// Unique source name
    pub name: String,
    pub enabled: bool,
    pub kind: SourceKind,
    /// Present iff `kind` is [`SourceKind::Remote`]
    pub remote: Option<RemoteConnection>,
    /// Streams in inventory order
    pub streams: Vec<LogStream>,
}

/// One category of log file within a source.
#[derive(Debug, Clone)]
pub struct LogStream {
    /// Name, unique within its source
    pub name: String,
    /// Directory holding the stream's files, as configured
    pub path: String,
    /// Glob matched against file names (default `*.log`)
    pub file_glob: String,
    /// Compiled include/exclude filters
    pub filter: LineFilter,
    /// Parser identifier, see [`crate::parser::parser_for`]
    pub parser: String,
}

/// A (source, stream) pairing with its resolved base path, valid for one cycle.
#[derive(Debug, Clone)]
pub struct WorkUnit<'a> {
    pub source: &'a LogSource,
    pub stream: &'a LogStream,
    /// Base path after mount-root resolution
    pub base_path: String,
}

impl WorkUnit<'_> {
    /// `source/stream` label used in logs and notifications.
    pub fn label(&self) -> String {
        format!("{}/{}", self.source.name, self.stream.name)
    }
}

// ============================================
// Offsets
// ============================================

/// Primary key of an offset record.
///
/// `file_key` is the file's base name, so a rotation to a new file name
/// always starts from offset 0.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct OffsetKey {
    pub source: String,
    pub stream: String,
    pub file_key: String,
}

impl OffsetKey {
    pub fn new(
        source: impl Into<String>,
        stream: impl Into<String>,
        file_key: impl Into<String>,
    ) -> Self {
        Self {
            source: source.into(),
            stream: stream.into(),
            file_key: file_key.into(),
        }
    }

    /// Build a key from a file identifier (local path or remote path).
    pub fn for_file(source: &str, stream: &str, file_id: &str) -> Self {
        Self::new(source, stream, file_key(file_id))
    }
}

/// Stored read position for one file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OffsetRecord {
    pub key: OffsetKey,
    pub offset: u64,
    pub updated_at: Option<DateTime<Utc>>,
}

/// Base name of a file identifier.
///
/// Remote identifiers always use `/`, so they are handled the same way as
/// local paths on Unix.
pub fn file_key(file_id: &str) -> String {
    Path::new(file_id)
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_else(|| file_id.to_string())
}

// ============================================
// Parsed entries
// ============================================

/// One log line (or grouped multi-line record) after classification.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ParsedEntry {
    /// Raw text as read from the file
    pub raw: String,
    pub timestamp: Option<String>,
    pub level: Option<String>,
    pub message: Option<String>,
}

impl ParsedEntry {
    /// Best-effort record for a line no pattern could classify.
    pub fn unclassified(raw: &str) -> Self {
        Self {
            raw: raw.to_string(),
            timestamp: None,
            level: Some(DEFAULT_LEVEL.to_string()),
            message: Some(raw.to_string()),
        }
    }

    /// Append a continuation line (e.g. a stack frame) to this entry.
    pub fn append_continuation(&mut self, line: &str) {
        self.raw.push('\n');
        self.raw.push_str(line);
    }

    /// Message text, falling back to the raw line.
    pub fn text(&self) -> &str {
        self.message.as_deref().unwrap_or(&self.raw)
    }
}

/// Severity assigned to lines that could not be classified.
pub const DEFAULT_LEVEL: &str = "ERROR";

// ============================================
// Execution history
// ============================================

/// Overall status of one scheduling cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    /// At least one unit analyzed new lines and none failed
    Success,
    /// No unit found new lines and none failed
    NoNewLogs,
    /// Some units failed, some did not
    PartialFailure,
    /// Every unit failed
    Failed,
}

impl RunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunStatus::Success => "success",
            RunStatus::NoNewLogs => "no_new_logs",
            RunStatus::PartialFailure => "partial_failure",
            RunStatus::Failed => "failed",
        }
    }
}

impl std::str::FromStr for RunStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "success" => Ok(RunStatus::Success),
            "no_new_logs" => Ok(RunStatus::NoNewLogs),
            "partial_failure" => Ok(RunStatus::PartialFailure),
            "failed" => Ok(RunStatus::Failed),
            _ => Err(format!("unknown run status: {}", s)),
        }
    }
}

/// Advisory record of one cycle. Never consulted for correctness.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionRecord {
    pub run_id: String,
    pub run_time: DateTime<Utc>,
    pub duration_ms: i64,
    pub status: RunStatus,
    /// What was dispatched (unit count, mode)
    pub payload: serde_json::Value,
    /// What came back (per-unit outcomes)
    pub response: serde_json::Value,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_source_kind_round_trip() {
        assert_eq!("local".parse::<SourceKind>(), Ok(SourceKind::Local));
        assert_eq!("sftp".parse::<SourceKind>(), Ok(SourceKind::Remote));
        assert_eq!("remote".parse::<SourceKind>(), Ok(SourceKind::Remote));
        assert!("http".parse::<SourceKind>().is_err());
        assert_eq!(SourceKind::Remote.to_string(), "sftp");
    }

    #[test]
    fn test_file_key_is_base_name() {
        assert_eq!(file_key("/var/log/app/error-2025-08-13.log"), "error-2025-08-13.log");
        assert_eq!(file_key("app/error.log"), "error.log");
        assert_eq!(file_key("error.log"), "error.log");
    }

    #[test]
    fn test_offset_key_for_file() {
        let key = OffsetKey::for_file("prod", "laravel", "/srv/logs/laravel-2025-08-17.log");
        assert_eq!(key, OffsetKey::new("prod", "laravel", "laravel-2025-08-17.log"));
    }

    #[test]
    fn test_unclassified_entry_defaults_to_error() {
        let entry = ParsedEntry::unclassified("something odd");
        assert_eq!(entry.level.as_deref(), Some("ERROR"));
        assert_eq!(entry.text(), "something odd");
    }

    #[test]
    fn test_append_continuation() {
        let mut entry = ParsedEntry::unclassified("Exception: boom");
        entry.append_continuation("#0 /var/www/app.php(12)");
        assert_eq!(entry.raw, "Exception: boom\n#0 /var/www/app.php(12)");
    }

    #[test]
    fn test_run_status_strings() {
        for status in [
            RunStatus::Success,
            RunStatus::NoNewLogs,
            RunStatus::PartialFailure,
            RunStatus::Failed,
        ] {
            assert_eq!(status.as_str().parse::<RunStatus>(), Ok(status));
        }
    }
}
