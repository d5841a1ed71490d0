//! Source registry: validated inventory plus reader construction
//!
//! The registry owns the immutable [`LogSource`] records for the lifetime of
//! the process. Stream paths are resolved against the mount root each time a
//! cycle asks for its work units, not when the inventory is loaded.

mod inventory;

pub use inventory::{Inventory, ScheduleConfig, SourceSpec, StreamSpec};

use crate::error::{Error, Result};
use crate::source::{LocalReader, LogReader, RemoteReader};
use crate::types::{LogSource, LogStream, SourceKind, WorkUnit};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Enabled and disabled sources, the schedule, and the mount root.
#[derive(Debug, Clone)]
pub struct SourceRegistry {
    sources: Vec<LogSource>,
    schedule: ScheduleConfig,
    mount_root: PathBuf,
}

impl SourceRegistry {
    /// Build a registry from already-validated sources.
    pub fn new(sources: Vec<LogSource>, schedule: ScheduleConfig, mount_root: PathBuf) -> Self {
        Self {
            sources,
            schedule,
            mount_root,
        }
    }

    /// Load and validate an inventory file.
    pub fn load(inventory_path: &Path, mount_root: impl Into<PathBuf>) -> Result<Self> {
        let (schedule, sources) = Inventory::load_from(inventory_path)?.into_sources()?;

        tracing::info!(
            path = %inventory_path.display(),
            sources = sources.len(),
            enabled = sources.iter().filter(|s| s.enabled).count(),
            "Loaded source inventory"
        );

        Ok(Self::new(sources, schedule, mount_root.into()))
    }

    pub fn schedule(&self) -> &ScheduleConfig {
        &self.schedule
    }

    pub fn schedule_mut(&mut self) -> &mut ScheduleConfig {
        &mut self.schedule
    }

    pub fn mount_root(&self) -> &Path {
        &self.mount_root
    }

    /// Every configured source, in inventory order
    pub fn sources(&self) -> &[LogSource] {
        &self.sources
    }

    /// Sources with `enabled = true`, in inventory order
    pub fn enabled_sources(&self) -> impl Iterator<Item = &LogSource> {
        self.sources.iter().filter(|s| s.enabled)
    }

    /// Construct the reader matching the source kind.
    ///
    /// Remote readers bound each network operation by the unit timeout.
    pub fn reader_for(&self, source: &LogSource) -> Result<Box<dyn LogReader>> {
        match source.kind {
            SourceKind::Local => Ok(Box::new(LocalReader::new())),
            SourceKind::Remote => {
                let conn = source.remote.clone().ok_or_else(|| {
                    Error::Config(format!(
                        "source {:?} is remote but has no connection settings",
                        source.name
                    ))
                })?;
                let timeout = self.schedule.unit_timeout().max(Duration::from_secs(1));
                Ok(Box::new(RemoteReader::new(conn).with_timeout(timeout)))
            }
        }
    }

    /// Concrete base path for a stream in the current environment.
    ///
    /// Absolute paths pass through for every kind. Relative local paths are
    /// joined with the mount root; remote paths are absolute by validation.
    pub fn resolve_path(&self, source: &LogSource, stream: &LogStream) -> String {
        let path = Path::new(&stream.path);
        if path.is_absolute() || source.kind == SourceKind::Remote {
            return stream.path.clone();
        }
        self.mount_root.join(path).to_string_lossy().into_owned()
    }

    /// Work units for one cycle: every stream of every enabled source.
    pub fn work_units(&self) -> Vec<WorkUnit<'_>> {
        self.enabled_sources()
            .flat_map(|source| {
                source.streams.iter().map(move |stream| WorkUnit {
                    source,
                    stream,
                    base_path: self.resolve_path(source, stream),
                })
            })
            .collect()
    }
}
