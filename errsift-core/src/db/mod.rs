//! Offset store for errsift
//!
//! This module provides the durable state layer using SQLite with:
//! - Schema migrations (create-if-absent, run at startup)
//! - Per-file byte offsets keyed by (source, stream, file_key)
//! - An advisory, insert-only execution history

pub mod repo;
pub mod schema;

pub use repo::OffsetStore;
