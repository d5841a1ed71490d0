//! Local filesystem reader (logs mounted into this host)

use super::{LineFilter, LogReader, Tail};
use crate::error::{Error, Result};
use crate::types::SourceKind;
use std::fs::{self, File};
use std::io::ErrorKind;
use std::path::Path;
use std::time::{SystemTime, UNIX_EPOCH};

/// Reads files directly from the local filesystem.
///
/// No default include filter is applied: without an include pattern every
/// line is emitted.
#[derive(Debug, Default, Clone)]
pub struct LocalReader;

impl LocalReader {
    pub fn new() -> Self {
        Self
    }
}

impl LogReader for LocalReader {
    fn kind(&self) -> SourceKind {
        SourceKind::Local
    }

    fn find_latest(&self, base_path: &str, file_glob: &str) -> Result<Option<String>> {
        let pattern = glob::Pattern::new(file_glob)
            .map_err(|e| Error::Config(format!("invalid file glob {:?}: {}", file_glob, e)))?;

        let entries = match fs::read_dir(base_path) {
            Ok(entries) => entries,
            Err(e) if e.kind() == ErrorKind::NotFound => {
                tracing::debug!(path = %base_path, "Log directory does not exist");
                return Ok(None);
            }
            Err(e) => return Err(Error::unavailable(base_path, e)),
        };

        let mut latest: Option<(SystemTime, String)> = None;

        for entry in entries {
            let entry = match entry {
                Ok(entry) => entry,
                Err(e) => {
                    tracing::warn!(path = %base_path, error = %e, "Failed to read directory entry");
                    continue;
                }
            };

            let name = entry.file_name().to_string_lossy().into_owned();
            if !pattern.matches(&name) {
                continue;
            }

            // Follow symlinks so `current.log -> app-2025-08-13.log` works
            let metadata = match fs::metadata(entry.path()) {
                Ok(m) if m.is_file() => m,
                Ok(_) => continue,
                Err(e) => {
                    tracing::debug!(file = %name, error = %e, "Skipping unreadable entry");
                    continue;
                }
            };
            let modified = metadata.modified().unwrap_or(UNIX_EPOCH);

            let newer = match &latest {
                None => true,
                Some((best_time, best_name)) => (modified, &name) > (*best_time, best_name),
            };
            if newer {
                latest = Some((modified, name));
            }
        }

        Ok(latest.map(|(_, name)| Path::new(base_path).join(name).to_string_lossy().into_owned()))
    }

    fn tail(&self, file_id: &str, start_offset: u64, filter: &LineFilter) -> Result<Tail> {
        let file = File::open(file_id).map_err(|e| Error::unavailable(file_id, e))?;
        let file_len = file.metadata()?.len();
        Tail::open(file, file_len, start_offset, filter.clone(), file_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs::OpenOptions;
    use std::io::Write;
    use std::time::Duration;
    use tempfile::TempDir;

    fn set_mtime(path: &Path, secs: u64) {
        let file = OpenOptions::new().write(true).open(path).unwrap();
        file.set_modified(UNIX_EPOCH + Duration::from_secs(secs))
            .unwrap();
    }

    #[test]
    fn test_find_latest_prefers_newest_mtime_over_name() {
        let dir = TempDir::new().unwrap();
        let older = dir.path().join("b-older.log");
        let newer = dir.path().join("a-newer.log");
        fs::write(&older, "x\n").unwrap();
        fs::write(&newer, "y\n").unwrap();
        set_mtime(&older, 1_700_000_000);
        set_mtime(&newer, 1_700_000_500);

        let reader = LocalReader::new();
        let latest = reader
            .find_latest(dir.path().to_str().unwrap(), "*.log")
            .unwrap()
            .unwrap();
        assert!(latest.ends_with("a-newer.log"), "{latest}");
    }

    #[test]
    fn test_find_latest_respects_glob() {
        let dir = TempDir::new().unwrap();
        fs::write(dir.path().join("app.log"), "x\n").unwrap();
        fs::write(dir.path().join("notes.txt"), "y\n").unwrap();
        set_mtime(&dir.path().join("app.log"), 1_700_000_000);
        set_mtime(&dir.path().join("notes.txt"), 1_800_000_000);

        let latest = LocalReader::new()
            .find_latest(dir.path().to_str().unwrap(), "*.log")
            .unwrap()
            .unwrap();
        assert!(latest.ends_with("app.log"));
    }

    #[test]
    fn test_find_latest_missing_dir_is_none() {
        let dir = TempDir::new().unwrap();
        let missing = dir.path().join("nope");
        let latest = LocalReader::new()
            .find_latest(missing.to_str().unwrap(), "*.log")
            .unwrap();
        assert!(latest.is_none());
    }

    #[test]
    fn test_find_latest_no_match_is_none() {
        let dir = TempDir::new().unwrap();
        fs::write(dir.path().join("app.txt"), "x\n").unwrap();
        let latest = LocalReader::new()
            .find_latest(dir.path().to_str().unwrap(), "*.log")
            .unwrap();
        assert!(latest.is_none());
    }

    #[test]
    fn test_find_latest_ties_break_by_name() {
        let dir = TempDir::new().unwrap();
        for name in ["a.log", "c.log", "b.log"] {
            let path = dir.path().join(name);
            fs::write(&path, "x\n").unwrap();
            set_mtime(&path, 1_700_000_000);
        }
        let latest = LocalReader::new()
            .find_latest(dir.path().to_str().unwrap(), "*.log")
            .unwrap()
            .unwrap();
        assert!(latest.ends_with("c.log"));
    }

    #[test]
    fn test_incremental_tail_resumes_from_offset() {
        let dir = TempDir::new().unwrap();
        let log = dir.path().join("error-2025-08-13.log");
        fs::write(&log, "L1 ERROR first\nL2 INFO ok\nL3 ERROR third\n").unwrap();
        let file_id = log.to_str().unwrap();

        let reader = LocalReader::new();
        let filter = LineFilter::from_patterns(Some("ERROR"), None).unwrap();

        let first: Vec<_> = reader
            .tail(file_id, 0, &filter)
            .unwrap()
            .map(|r| r.unwrap())
            .collect();
        assert_eq!(
            first.iter().map(|l| l.text.as_str()).collect::<Vec<_>>(),
            vec!["L1 ERROR first", "L3 ERROR third"]
        );
        let resume_at = first.last().unwrap().offset;
        assert_eq!(resume_at, fs::metadata(&log).unwrap().len());

        let mut f = OpenOptions::new().append(true).open(&log).unwrap();
        writeln!(f, "L4 ERROR fourth").unwrap();

        let second: Vec<_> = reader
            .tail(file_id, resume_at, &filter)
            .unwrap()
            .map(|r| r.unwrap().text)
            .collect();
        assert_eq!(second, vec!["L4 ERROR fourth"]);
    }

    #[test]
    fn test_local_has_no_default_include() {
        let dir = TempDir::new().unwrap();
        let log = dir.path().join("app.log");
        fs::write(&log, "INFO a\nDEBUG b\n").unwrap();

        let lines: Vec<_> = LocalReader::new()
            .tail(log.to_str().unwrap(), 0, &LineFilter::default())
            .unwrap()
            .map(|r| r.unwrap().text)
            .collect();
        assert_eq!(lines, vec!["INFO a", "DEBUG b"]);
    }

    #[test]
    fn test_tail_missing_file_is_unavailable() {
        let dir = TempDir::new().unwrap();
        let missing = dir.path().join("gone.log");
        let err = LocalReader::new()
            .tail(missing.to_str().unwrap(), 0, &LineFilter::default())
            .err()
            .unwrap();
        assert!(matches!(err, Error::SourceUnavailable { .. }));
    }
}
