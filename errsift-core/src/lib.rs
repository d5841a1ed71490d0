//! # errsift-core
//!
//! Core library for errsift - an incremental error-log harvester.
//!
//! This library provides:
//! - Source readers for mounted and SFTP-reachable log directories
//! - Durable per-file offsets in SQLite
//! - A source registry loaded from a declarative inventory
//! - Line parsers, an LLM analysis pipeline, result sink and notifier
//! - A fixed-interval scheduler and the orchestrator binding it all together
//!
//! ## Data flow
//!
//! ```text
//! SourceRegistry → (LogReader, path) → Orchestrator → ParsedEntry batch → Analyzer → ResultSink
//!                                          │
//!                                          └── offsets ──► OffsetStore ──► next cycle
//! ```
//!
//! ## Example
//!
//! ```rust,no_run
//! use errsift_core::{Config, Orchestrator, SourceRegistry};
//!
//! let config = Config::load().expect("failed to load config");
//! let registry = SourceRegistry::load(&config.sources_path(), config.paths.mount_root.clone())
//!     .expect("failed to load inventory");
//! let orchestrator = Orchestrator::from_config(&config, registry).expect("failed to start");
//!
//! let report = orchestrator.run_cycle();
//! println!("{} units analyzed", report.analyzed());
//! ```

// Re-export commonly used items at the crate root
pub use config::Config;
pub use db::OffsetStore;
pub use error::{Error, Result};
pub use ingest::{CycleReport, Orchestrator, UnitOutcome, UnitReport};
pub use registry::SourceRegistry;
pub use scheduler::{BatchMode, Scheduler, Shutdown};
pub use types::*;

// Public modules
pub mod analysis;
pub mod config;
pub mod db;
pub mod error;
pub mod ingest;
pub mod logging;
pub mod notify;
pub mod parser;
pub mod registry;
pub mod scheduler;
pub mod sink;
pub mod source;
pub mod types;
