//! Process-level lock enforcing a single writer per offset store.
//!
//! Two errsift processes cycling against the same database would race on
//! offsets and double-process lines. `run` and `once` hold an advisory OS file
//! lock (flock) scoped to the database path for their whole lifetime.

use anyhow::{Context, Result};
use std::collections::hash_map::DefaultHasher;
use std::fs::{self, File, OpenOptions};
use std::hash::{Hash, Hasher};
use std::io::{self, Seek, SeekFrom, Write};
use std::os::fd::AsRawFd;
use std::path::{Path, PathBuf};

const INGEST_LOCK_FILE: &str = "errsift-ingest.lock";

/// Held by the process that owns the offset store.
pub struct IngestGuard {
    _lock: ProcessLock,
}

/// Acquire the ingest lock for `db_path`.
///
/// Fails if another errsift process already cycles against the same store.
pub fn acquire_ingest_guard(db_path: &Path) -> Result<IngestGuard> {
    match try_acquire_lock(INGEST_LOCK_FILE, db_path)? {
        Some(lock) => Ok(IngestGuard { _lock: lock }),
        None => anyhow::bail!(
            "another errsift process is already running against {}",
            db_path.display()
        ),
    }
}

struct ProcessLock {
    file: File,
    path: PathBuf,
}

impl Drop for ProcessLock {
    fn drop(&mut self) {
        let _ = unlock_file(&self.file);
        let _ = fs::remove_file(&self.path);
    }
}

fn try_acquire_lock(filename: &str, db_path: &Path) -> Result<Option<ProcessLock>> {
    let dir = lock_dir();
    fs::create_dir_all(&dir)
        .with_context(|| format!("failed to create runtime lock directory: {}", dir.display()))?;

    let path = dir.join(scoped_lock_filename(filename, db_path));
    let mut file = OpenOptions::new()
        .read(true)
        .write(true)
        .create(true)
        .truncate(false)
        .open(&path)
        .with_context(|| format!("failed to open lock file: {}", path.display()))?;

    match lock_file_nonblocking(&file) {
        Ok(()) => {
            // Owner info for debugging
            let _ = file.set_len(0);
            let _ = file.seek(SeekFrom::Start(0));
            let _ = writeln!(file, "pid={}", std::process::id());
            let _ = writeln!(file, "db={}", db_path.display());
            let _ = file.flush();

            Ok(Some(ProcessLock { file, path }))
        }
        Err(e) if is_lock_busy(&e) => Ok(None),
        Err(e) => Err(e).with_context(|| format!("failed to lock file: {}", path.display())),
    }
}

fn lock_dir() -> PathBuf {
    let mut dir = match std::env::var_os("XDG_RUNTIME_DIR") {
        Some(path) if !path.is_empty() => PathBuf::from(path),
        _ => std::env::temp_dir(),
    };
    dir.push("errsift");
    dir
}

fn scoped_lock_filename(base_filename: &str, db_path: &Path) -> String {
    let canonical = db_path
        .parent()
        .and_then(|p| fs::canonicalize(p).ok())
        .zip(db_path.file_name())
        .map(|(dir, name)| dir.join(name))
        .unwrap_or_else(|| db_path.to_path_buf());

    let mut hasher = DefaultHasher::new();
    canonical.to_string_lossy().hash(&mut hasher);
    let digest = hasher.finish();
    format!("{base_filename}.{digest:016x}")
}

fn is_lock_busy(error: &io::Error) -> bool {
    matches!(error.kind(), io::ErrorKind::WouldBlock)
        || matches!(error.raw_os_error(), Some(11) | Some(35))
}

#[cfg(unix)]
fn lock_file_nonblocking(file: &File) -> io::Result<()> {
    const LOCK_EX: i32 = 2;
    const LOCK_NB: i32 = 4;
    let fd = file.as_raw_fd();
    // SAFETY: flock is called with a valid file descriptor and constant flags.
    let rc = unsafe { flock(fd, LOCK_EX | LOCK_NB) };
    if rc == 0 {
        Ok(())
    } else {
        Err(io::Error::last_os_error())
    }
}

#[cfg(unix)]
fn unlock_file(file: &File) -> io::Result<()> {
    const LOCK_UN: i32 = 8;
    let fd = file.as_raw_fd();
    // SAFETY: flock is called with a valid file descriptor and constant flags.
    let rc = unsafe { flock(fd, LOCK_UN) };
    if rc == 0 {
        Ok(())
    } else {
        Err(io::Error::last_os_error())
    }
}

#[cfg(unix)]
extern "C" {
    fn flock(fd: i32, operation: i32) -> i32;
}

#[cfg(not(unix))]
compile_error!("errsift process locks currently require Unix (macOS/Linux)");

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_second_guard_for_same_db_fails() {
        let dir = TempDir::new().unwrap();
        let db = dir.path().join("state.db");

        let first = acquire_ingest_guard(&db).unwrap();
        assert!(acquire_ingest_guard(&db).is_err());

        drop(first);
        assert!(acquire_ingest_guard(&db).is_ok());
    }

    #[test]
    fn test_distinct_dbs_do_not_conflict() {
        let dir = TempDir::new().unwrap();
        let _a = acquire_ingest_guard(&dir.path().join("a.db")).unwrap();
        let _b = acquire_ingest_guard(&dir.path().join("b.db")).unwrap();
    }
}
