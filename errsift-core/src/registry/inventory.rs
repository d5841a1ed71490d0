//! Source inventory document (`sources.toml`)
//!
//! ```toml
//! [schedule]
//! every_minutes = 5
//! parallel = true
//!
//! [[sources]]
//! name = "prod"
//! kind = "sftp"
//! host = "10.0.0.12"
//! username = "logreader"
//! key_path = "/run/secrets/prod_key"
//!
//! [[sources.streams]]
//! name = "laravel"
//! path = "/var/www/app/storage/logs"
//! file_glob = "laravel-*.log"
//! parser = "laravel"
//! ```

use crate::error::{Error, Result};
use crate::parser;
use crate::source::LineFilter;
use crate::types::{LogSource, LogStream, RemoteConnection, SourceKind};
use serde::Deserialize;
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Longest accepted cycle interval (one week).
pub const MAX_EVERY_MINUTES: u64 = 7 * 24 * 60;

/// Kinds the inventory format names but no reader serves yet.
const UNSUPPORTED_KINDS: &[&str] = &["http", "syslog"];

/// Raw inventory as written on disk.
#[derive(Debug, Deserialize, Default)]
#[serde(deny_unknown_fields)]
pub struct Inventory {
    #[serde(default)]
    pub schedule: ScheduleConfig,

    #[serde(default)]
    pub sources: Vec<SourceSpec>,
}

/// Cycle timing and fan-out
#[derive(Debug, Deserialize, Clone)]
#[serde(deny_unknown_fields)]
pub struct ScheduleConfig {
    /// Minutes between cycle starts
    #[serde(default = "default_every_minutes")]
    pub every_minutes: u64,

    /// Run units on a worker pool instead of sequentially
    #[serde(default = "default_true")]
    pub parallel: bool,

    /// Upper bound on the worker pool size
    #[serde(default = "default_max_workers")]
    pub max_workers: usize,

    /// Per-unit deadline in seconds
    #[serde(default = "default_unit_timeout")]
    pub unit_timeout_secs: u64,
}

impl Default for ScheduleConfig {
    fn default() -> Self {
        Self {
            every_minutes: default_every_minutes(),
            parallel: true,
            max_workers: default_max_workers(),
            unit_timeout_secs: default_unit_timeout(),
        }
    }
}

impl ScheduleConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.every_minutes.saturating_mul(60))
    }

    /// Reject intervals and pool sizes the scheduler cannot honor.
    pub fn validate(&self) -> Result<()> {
        if !(1..=MAX_EVERY_MINUTES).contains(&self.every_minutes) {
            return Err(Error::Config(format!(
                "schedule.every_minutes must be between 1 and {}, got {}",
                MAX_EVERY_MINUTES, self.every_minutes
            )));
        }
        if self.max_workers == 0 {
            return Err(Error::Config(
                "schedule.max_workers must be at least 1".to_string(),
            ));
        }
        Ok(())
    }

    pub fn unit_timeout(&self) -> Duration {
        Duration::from_secs(self.unit_timeout_secs)
    }
}

fn default_every_minutes() -> u64 {
    5
}

fn default_true() -> bool {
    true
}

fn default_max_workers() -> usize {
    8
}

fn default_unit_timeout() -> u64 {
    600
}

/// One `[[sources]]` table
#[derive(Debug, Deserialize, Clone)]
#[serde(deny_unknown_fields)]
pub struct SourceSpec {
    pub name: String,

    #[serde(default = "default_true")]
    pub enabled: bool,

    /// `local` or `sftp` (alias `remote`); required so a remote entry can
    /// never be mistaken for a local path
    #[serde(alias = "type")]
    pub kind: String,

    pub host: Option<String>,

    #[serde(default = "default_port")]
    pub port: u16,

    pub username: Option<String>,

    pub key_path: Option<PathBuf>,

    /// Environment variable holding the key passphrase
    pub key_passphrase_env: Option<String>,

    /// OpenSSH known_hosts file used to verify the server key
    pub known_hosts: Option<PathBuf>,

    #[serde(default)]
    pub streams: Vec<StreamSpec>,
}

fn default_port() -> u16 {
    22
}

/// One `[[sources.streams]]` table
#[derive(Debug, Deserialize, Clone)]
#[serde(deny_unknown_fields)]
pub struct StreamSpec {
    pub name: String,

    /// Directory holding the stream's files
    pub path: String,

    #[serde(default = "default_file_glob")]
    pub file_glob: String,

    /// Only lines matching this regex are emitted
    pub include: Option<String>,

    /// Lines matching this regex are dropped
    pub exclude: Option<String>,

    #[serde(default = "default_parser")]
    pub parser: String,
}

fn default_file_glob() -> String {
    "*.log".to_string()
}

fn default_parser() -> String {
    parser::DEFAULT_PARSER.to_string()
}

impl Inventory {
    /// Read and parse an inventory file
    pub fn load_from(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            Error::Config(format!("failed to read inventory {:?}: {}", path, e))
        })?;
        Self::parse(&content)
    }

    /// Parse an inventory document
    pub fn parse(content: &str) -> Result<Self> {
        toml::from_str(content).map_err(|e| Error::Config(format!("failed to parse inventory: {}", e)))
    }

    /// Validate every source and stream into immutable records.
    ///
    /// Fails on the first schema violation; nothing is partially loaded.
    pub fn into_sources(self) -> Result<(ScheduleConfig, Vec<LogSource>)> {
        self.schedule.validate()?;

        let mut names = HashSet::new();
        let mut sources = Vec::with_capacity(self.sources.len());
        for spec in self.sources {
            if !names.insert(spec.name.clone()) {
                return Err(Error::Config(format!("duplicate source name {:?}", spec.name)));
            }
            sources.push(spec.validate()?);
        }

        Ok((self.schedule, sources))
    }
}

impl SourceSpec {
    fn validate(self) -> Result<LogSource> {
        let name = self.name.trim().to_string();
        if name.is_empty() {
            return Err(Error::Config("source name must not be empty".to_string()));
        }

        let kind_tag = self.kind.trim().to_ascii_lowercase();
        if UNSUPPORTED_KINDS.contains(&kind_tag.as_str()) {
            return Err(Error::Config(format!(
                "source {:?}: kind {:?} is not supported",
                name, kind_tag
            )));
        }
        let kind: SourceKind = kind_tag
            .parse()
            .map_err(|e| Error::Config(format!("source {:?}: {}", name, e)))?;

        let remote = match kind {
            SourceKind::Local => None,
            SourceKind::Remote => Some(self.remote_connection(&name)?),
        };

        let mut stream_names = HashSet::new();
        let mut streams = Vec::with_capacity(self.streams.len());
        for stream in self.streams {
            if !stream_names.insert(stream.name.clone()) {
                return Err(Error::Config(format!(
                    "source {:?}: duplicate stream name {:?}",
                    name, stream.name
                )));
            }
            streams.push(stream.validate(&name, kind)?);
        }

        Ok(LogSource {
            name,
            enabled: self.enabled,
            kind,
            remote,
            streams,
        })
    }

    fn remote_connection(&self, name: &str) -> Result<RemoteConnection> {
        let missing = |field: &str| {
            Error::Config(format!(
                "source {:?}: remote sources require {}",
                name, field
            ))
        };

        let host = self
            .host
            .clone()
            .filter(|h| !h.trim().is_empty())
            .ok_or_else(|| missing("host"))?;
        let username = self
            .username
            .clone()
            .filter(|u| !u.trim().is_empty())
            .ok_or_else(|| missing("username"))?;
        let key_path = self.key_path.clone().ok_or_else(|| missing("key_path"))?;

        let key_passphrase = match &self.key_passphrase_env {
            Some(var) => Some(std::env::var(var).map_err(|_| {
                Error::Config(format!(
                    "source {:?}: passphrase variable {} is not set",
                    name, var
                ))
            })?),
            None => None,
        };

        Ok(RemoteConnection {
            host,
            port: self.port,
            username,
            key_path,
            key_passphrase,
            known_hosts: self.known_hosts.clone(),
        })
    }
}

impl StreamSpec {
    fn validate(self, source: &str, kind: SourceKind) -> Result<LogStream> {
        let context = |msg: String| Error::Config(format!("stream {}/{}: {}", source, self.name, msg));

        if self.name.trim().is_empty() {
            return Err(Error::Config(format!(
                "source {:?}: stream name must not be empty",
                source
            )));
        }
        if self.path.trim().is_empty() {
            return Err(context("path must not be empty".to_string()));
        }
        if kind == SourceKind::Remote && !self.path.starts_with('/') {
            return Err(context(format!(
                "remote paths must be absolute, got {:?}",
                self.path
            )));
        }
        glob::Pattern::new(&self.file_glob)
            .map_err(|e| context(format!("invalid file_glob {:?}: {}", self.file_glob, e)))?;
        if parser::parser_for(&self.parser).is_none() {
            return Err(context(format!("unknown parser {:?}", self.parser)));
        }

        let filter = LineFilter::from_patterns(self.include.as_deref(), self.exclude.as_deref())
            .map_err(|e| match e {
                Error::Config(msg) => context(msg),
                other => other,
            })?;

        Ok(LogStream {
            name: self.name,
            path: self.path,
            file_glob: self.file_glob,
            filter,
            parser: self.parser,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const EXAMPLE: &str = r#"
        [schedule]
        every_minutes = 2
        parallel = false

        [[sources]]
        name = "local-app"
        kind = "local"

        [[sources.streams]]
        name = "web"
        path = "app"
        include = "ERROR"
        exclude = "healthcheck"

        [[sources]]
        name = "prod"
        kind = "sftp"
        host = "10.0.0.12"
        username = "logreader"
        key_path = "/run/secrets/prod_key"
        enabled = false

        [[sources.streams]]
        name = "laravel"
        path = "/var/www/app/storage/logs"
        file_glob = "laravel-*.log"
        parser = "laravel"
    "#;

    fn load(doc: &str) -> Result<(ScheduleConfig, Vec<LogSource>)> {
        Inventory::parse(doc)?.into_sources()
    }

    fn expect_config_error(doc: &str, needle: &str) {
        match load(doc) {
            Err(Error::Config(msg)) => assert!(msg.contains(needle), "{msg}"),
            other => panic!("expected config error containing {needle:?}, got {other:?}"),
        }
    }

    #[test]
    fn test_parse_example_inventory() {
        let (schedule, sources) = load(EXAMPLE).unwrap();
        assert_eq!(schedule.every_minutes, 2);
        assert!(!schedule.parallel);
        assert_eq!(schedule.max_workers, 8);
        assert_eq!(schedule.unit_timeout_secs, 600);

        assert_eq!(sources.len(), 2);
        let local = &sources[0];
        assert_eq!(local.kind, SourceKind::Local);
        assert!(local.remote.is_none());
        assert_eq!(local.streams[0].file_glob, "*.log");
        assert_eq!(local.streams[0].parser, "regex");
        assert!(local.streams[0].filter.accepts("ERROR boom"));
        assert!(!local.streams[0].filter.accepts("ERROR healthcheck"));

        let remote = &sources[1];
        assert!(!remote.enabled);
        assert_eq!(remote.kind, SourceKind::Remote);
        let conn = remote.remote.as_ref().unwrap();
        assert_eq!(conn.port, 22);
        assert_eq!(conn.username, "logreader");
    }

    #[test]
    fn test_empty_inventory_uses_defaults() {
        let (schedule, sources) = load("").unwrap();
        assert_eq!(schedule.every_minutes, 5);
        assert!(schedule.parallel);
        assert!(sources.is_empty());
    }

    #[test]
    fn test_unknown_kind_is_fatal() {
        expect_config_error(
            r#"
            [[sources]]
            name = "x"
            kind = "ftp"
            "#,
            "unknown source kind",
        );
    }

    #[test]
    fn test_declared_but_unimplemented_kinds_are_fatal() {
        for kind in ["http", "syslog"] {
            let doc = format!("[[sources]]\nname = \"x\"\nkind = \"{kind}\"\n");
            expect_config_error(&doc, "not supported");
        }
    }

    #[test]
    fn test_remote_requires_credentials() {
        expect_config_error(
            r#"
            [[sources]]
            name = "prod"
            kind = "sftp"
            host = "10.0.0.12"
            username = "logreader"
            "#,
            "key_path",
        );
        expect_config_error(
            r#"
            [[sources]]
            name = "prod"
            kind = "sftp"
            username = "logreader"
            key_path = "/k"
            "#,
            "host",
        );
    }

    #[test]
    fn test_remote_paths_must_be_absolute() {
        expect_config_error(
            r#"
            [[sources]]
            name = "prod"
            kind = "sftp"
            host = "h"
            username = "u"
            key_path = "/k"

            [[sources.streams]]
            name = "web"
            path = "logs/web"
            "#,
            "must be absolute",
        );
    }

    #[test]
    fn test_duplicate_names_are_fatal() {
        expect_config_error(
            "[[sources]]\nname = \"a\"\nkind = \"local\"\n[[sources]]\nname = \"a\"\nkind = \"local\"\n",
            "duplicate source",
        );
        expect_config_error(
            r#"
            [[sources]]
            name = "a"
            kind = "local"
            [[sources.streams]]
            name = "s"
            path = "x"
            [[sources.streams]]
            name = "s"
            path = "y"
            "#,
            "duplicate stream",
        );
    }

    #[test]
    fn test_bad_stream_settings_are_fatal() {
        let stream = |extra: &str| {
            format!(
                "[[sources]]\nname = \"a\"\nkind = \"local\"\n[[sources.streams]]\nname = \"s\"\npath = \"x\"\n{extra}\n"
            )
        };
        expect_config_error(&stream("include = \"(unclosed\""), "invalid filter pattern");
        expect_config_error(&stream("file_glob = \"[\""), "invalid file_glob");
        expect_config_error(&stream("parser = \"nginx\""), "unknown parser");
    }

    #[test]
    fn test_unknown_fields_are_rejected() {
        expect_config_error("[[sources]]\nname = \"a\"\nkinds = \"local\"\n", "failed to parse");
    }

    #[test]
    fn test_zero_interval_is_fatal() {
        expect_config_error("[schedule]\nevery_minutes = 0\n", "every_minutes");
    }

    #[test]
    fn test_huge_interval_is_fatal() {
        expect_config_error(
            "[schedule]\nevery_minutes = 400000000000000000\n",
            "every_minutes",
        );
        let schedule = ScheduleConfig {
            every_minutes: u64::MAX,
            ..Default::default()
        };
        assert_eq!(schedule.interval(), Duration::from_secs(u64::MAX));
        assert!(schedule.validate().is_err());
    }

    #[test]
    fn test_week_interval_is_accepted() {
        let doc = format!("[schedule]\nevery_minutes = {MAX_EVERY_MINUTES}\n");
        let (schedule, _) = load(&doc).unwrap();
        assert_eq!(schedule.interval(), Duration::from_secs(7 * 24 * 3600));
    }

    #[test]
    fn test_kind_is_required() {
        expect_config_error(
            r#"
            [[sources]]
            name = "prod"
            host = "10.0.0.12"
            username = "logreader"
            key_path = "/run/secrets/prod_key"
            "#,
            "kind",
        );
    }

    #[test]
    fn test_type_is_an_alias_for_kind() {
        let (_, sources) = load(
            r#"
            [[sources]]
            name = "prod"
            type = "sftp"
            host = "10.0.0.12"
            username = "logreader"
            key_path = "/run/secrets/prod_key"
            "#,
        )
        .unwrap();
        assert_eq!(sources[0].kind, SourceKind::Remote);
    }
}
