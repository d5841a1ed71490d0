//! Result persistence
//!
//! One text artifact per (source, stream, file name), replaced whenever a
//! cycle produces a new report for it.

use crate::error::Result;
use std::path::{Component, Path, PathBuf};

/// Where analysis reports end up.
pub trait ResultSink: Send + Sync {
    /// Store `report` for the given key, replacing any previous content.
    fn write(&self, source: &str, stream: &str, file_name: &str, report: &str) -> Result<()>;
}

/// Writes reports to `{root}/{source}/{stream}/{file_name}`.
#[derive(Debug, Clone)]
pub struct FileResultSink {
    root: PathBuf,
}

impl FileResultSink {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Location of the report for a key.
    pub fn path_for(&self, source: &str, stream: &str, file_name: &str) -> PathBuf {
        self.root
            .join(sanitize(source))
            .join(sanitize(stream))
            .join(sanitize(file_name))
    }
}

impl ResultSink for FileResultSink {
    fn write(&self, source: &str, stream: &str, file_name: &str, report: &str) -> Result<()> {
        let path = self.path_for(source, stream, file_name);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        // Atomic replace
        let tmp = path.with_file_name(format!(".{}.tmp", sanitize(file_name)));
        std::fs::write(&tmp, report)?;
        std::fs::rename(&tmp, &path)?;

        tracing::debug!(path = %path.display(), bytes = report.len(), "Wrote analysis result");
        Ok(())
    }
}

/// Keep a name as a single path segment.
fn sanitize(segment: &str) -> String {
    let is_plain = matches!(
        Path::new(segment).components().collect::<Vec<_>>().as_slice(),
        [Component::Normal(_)]
    );
    if is_plain {
        segment.to_string()
    } else {
        segment.replace(['/', '\\'], "_").replace("..", "_")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_write_mirrors_source_and_stream() {
        let dir = TempDir::new().unwrap();
        let sink = FileResultSink::new(dir.path());
        sink.write("prod", "laravel", "laravel-2025-08-17.log", "report")
            .unwrap();

        let path = dir.path().join("prod/laravel/laravel-2025-08-17.log");
        assert_eq!(std::fs::read_to_string(path).unwrap(), "report");
    }

    #[test]
    fn test_write_overwrites() {
        let dir = TempDir::new().unwrap();
        let sink = FileResultSink::new(dir.path());
        sink.write("prod", "web", "error.log", "first cycle").unwrap();
        sink.write("prod", "web", "error.log", "second").unwrap();

        let path = sink.path_for("prod", "web", "error.log");
        assert_eq!(std::fs::read_to_string(path).unwrap(), "second");
        assert!(!dir.path().join("prod/web/.error.log.tmp").exists());
    }

    #[test]
    fn test_names_cannot_escape_root() {
        let dir = TempDir::new().unwrap();
        let sink = FileResultSink::new(dir.path());
        let path = sink.path_for("../etc", "a/b", "..");
        assert!(path.starts_with(dir.path()));
        assert_eq!(path.components().count(), dir.path().components().count() + 3);
    }
}
