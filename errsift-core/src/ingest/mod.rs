//! Orchestrator: one cycle over every enabled (source, stream) pair
//!
//! ## Architecture
//!
//! ```text
//! ┌────────────────┐   work units   ┌──────────────┐  find_latest/tail  ┌───────────┐
//! │ SourceRegistry │ ─────────────► │ Orchestrator │ ─────────────────► │ LogReader │
//! └────────────────┘                └──────┬───────┘                    └───────────┘
//!                                          │ parse → analyze → write → commit
//!            ┌──────────────┬──────────────┼──────────────┬──────────────┐
//!            ▼              ▼              ▼              ▼              ▼
//!       LineParser      Analyzer      ResultSink     OffsetStore      Notifier
//! ```
//!
//! ## Per-unit sequence
//!
//! 1. Find the newest file matching the stream glob; none means nothing to do.
//! 2. Look up the stored offset for its base name (0 if absent or unreadable).
//! 3. Tail from that offset through the stream's filters. If the newest file
//!    replaced an earlier one, whatever the earlier file still holds past its
//!    stored offset (including an unterminated last line) joins the batch.
//! 4. No new lines: commit the consumed offset if it moved, skip analysis.
//! 5. Otherwise parse, analyze once, write the report, then commit the offset.
//!
//! Any error in steps 1–5 fails only that unit. It is logged, the notifier is
//! told, and the offset is left where it was so the same lines are read again
//! next cycle.

use crate::analysis::{AnalysisContext, Analyzer};
use crate::config::Config;
use crate::db::OffsetStore;
use crate::error::{Error, Result};
use crate::notify::Notifier;
use crate::parser::{self, parse_lines};
use crate::registry::SourceRegistry;
use crate::scheduler::{run_batch, BatchMode, Job};
use crate::sink::ResultSink;
use crate::source::LogReader;
use crate::types::{file_key, ExecutionRecord, OffsetKey, RunStatus, WorkUnit};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, PoisonError};
use std::time::{Duration, Instant};

/// What happened to one work unit in one cycle.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum UnitOutcome {
    /// No file matched the stream glob
    NoFile,
    /// The newest file had no new (unfiltered) lines
    NoNewLines { file: String, offset: u64 },
    /// New lines were analyzed and the report written
    Analyzed {
        file: String,
        lines: usize,
        entries: usize,
        offset: u64,
        /// Whether the new offset reached the store
        committed: bool,
    },
    /// The unit failed; its offset was not advanced
    Failed { error: String },
}

impl UnitOutcome {
    pub fn is_failure(&self) -> bool {
        matches!(self, UnitOutcome::Failed { .. })
    }
}

/// Outcome of one unit plus identification and timing.
#[derive(Debug, Clone, Serialize)]
pub struct UnitReport {
    pub source: String,
    pub stream: String,
    #[serde(flatten)]
    pub outcome: UnitOutcome,
    pub duration_ms: u64,
}

/// Summary of one scheduling cycle.
#[derive(Debug, Clone)]
pub struct CycleReport {
    pub run_id: String,
    pub started_at: DateTime<Utc>,
    pub duration: Duration,
    pub mode: BatchMode,
    /// Unit reports in inventory order
    pub units: Vec<UnitReport>,
}

impl CycleReport {
    pub fn analyzed(&self) -> usize {
        self.count(|o| matches!(o, UnitOutcome::Analyzed { .. }))
    }

    pub fn failed(&self) -> usize {
        self.count(UnitOutcome::is_failure)
    }

    fn count(&self, pred: impl Fn(&UnitOutcome) -> bool) -> usize {
        self.units.iter().filter(|u| pred(&u.outcome)).count()
    }

    /// Overall status recorded in the execution history
    pub fn status(&self) -> RunStatus {
        let failed = self.failed();
        if failed > 0 && failed == self.units.len() {
            RunStatus::Failed
        } else if failed > 0 {
            RunStatus::PartialFailure
        } else if self.analyzed() > 0 {
            RunStatus::Success
        } else {
            RunStatus::NoNewLogs
        }
    }

    /// Advisory history record for this cycle
    pub fn to_execution_record(&self) -> ExecutionRecord {
        let sources: Vec<_> = self
            .units
            .iter()
            .map(|u| format!("{}/{}", u.source, u.stream))
            .collect();

        ExecutionRecord {
            run_id: self.run_id.clone(),
            run_time: self.started_at,
            duration_ms: self.duration.as_millis().min(i64::MAX as u128) as i64,
            status: self.status(),
            payload: serde_json::json!({
                "units": self.units.len(),
                "mode": self.mode.as_str(),
                "work_units": sources,
            }),
            response: serde_json::to_value(&self.units).unwrap_or(serde_json::Value::Null),
        }
    }
}

/// Unread tail of a stream's superseded file.
struct Carryover {
    key: OffsetKey,
    lines: Vec<String>,
    offset: u64,
}

/// Cooperative per-unit time budget.
#[derive(Debug, Clone, Copy)]
pub struct Deadline {
    started: Instant,
    limit: Duration,
}

impl Deadline {
    pub fn new(limit: Duration) -> Self {
        Self {
            started: Instant::now(),
            limit,
        }
    }

    /// Fail with [`Error::Timeout`] once the budget is spent.
    pub fn check(&self, stage: &str) -> Result<()> {
        let elapsed = self.started.elapsed();
        if elapsed >= self.limit {
            return Err(Error::Timeout {
                stage: stage.to_string(),
                elapsed_secs: elapsed.as_secs(),
            });
        }
        Ok(())
    }
}

/// Binds registry, readers, parsers, analyzer, sink, store and notifier.
pub struct Orchestrator {
    registry: SourceRegistry,
    store: OffsetStore,
    analyzer: Box<dyn Analyzer>,
    sink: Box<dyn ResultSink>,
    notifier: Box<dyn Notifier>,
    mode: BatchMode,
    unit_timeout: Duration,
    history_file: Option<PathBuf>,
}

impl Orchestrator {
    /// Create an orchestrator; batch mode and unit timeout come from the
    /// registry's schedule.
    pub fn new(
        registry: SourceRegistry,
        store: OffsetStore,
        analyzer: Box<dyn Analyzer>,
        sink: Box<dyn ResultSink>,
        notifier: Box<dyn Notifier>,
    ) -> Self {
        let schedule = registry.schedule();
        let mode = BatchMode::new(schedule.parallel, schedule.max_workers);
        let unit_timeout = schedule.unit_timeout();

        Self {
            registry,
            store,
            analyzer,
            sink,
            notifier,
            mode,
            unit_timeout,
            history_file: None,
        }
    }

    /// Wire up the default collaborators described by `config`.
    ///
    /// Opens the offset store and ensures its schema exists.
    pub fn from_config(config: &Config, registry: SourceRegistry) -> Result<Self> {
        let store = OffsetStore::open(
            config.database_path(),
            Duration::from_millis(config.database.busy_timeout_ms),
        )?;
        store.migrate()?;

        let analyzer = crate::analysis::create_analyzer(config)?;
        let notifier = crate::notify::create_notifier(&config.notifier)?;
        let sink = Box::new(crate::sink::FileResultSink::new(config.results_dir()));

        let mut orchestrator = Self::new(registry, store, analyzer, sink, notifier);
        if config.history.jsonl {
            orchestrator = orchestrator.with_history_file(Config::history_path());
        }
        Ok(orchestrator)
    }

    pub fn with_mode(mut self, mode: BatchMode) -> Self {
        self.mode = mode;
        self
    }

    pub fn with_unit_timeout(mut self, timeout: Duration) -> Self {
        self.unit_timeout = timeout;
        self
    }

    /// Also append every cycle record to this JSON Lines file.
    pub fn with_history_file(mut self, path: PathBuf) -> Self {
        self.history_file = Some(path);
        self
    }

    pub fn registry(&self) -> &SourceRegistry {
        &self.registry
    }

    pub fn store(&self) -> &OffsetStore {
        &self.store
    }

    pub fn mode(&self) -> BatchMode {
        self.mode
    }

    /// Run every work unit once and record the cycle.
    ///
    /// Never fails: unit errors are contained in their [`UnitReport`].
    pub fn run_cycle(&self) -> CycleReport {
        let run_id = uuid::Uuid::new_v4().to_string();
        let started_at = Utc::now();
        let clock = Instant::now();
        let units = self.registry.work_units();

        tracing::info!(
            run_id = %run_id,
            units = units.len(),
            mode = self.mode.as_str(),
            "Cycle starting"
        );

        let results: Mutex<Vec<(usize, UnitReport)>> = Mutex::new(Vec::with_capacity(units.len()));
        let jobs: Vec<Job<'_>> = units
            .iter()
            .enumerate()
            .map(|(index, unit)| {
                let results = &results;
                let run_id = run_id.as_str();
                let job: Job<'_> = Box::new(move || {
                    let report = self.run_unit(unit, run_id);
                    results
                        .lock()
                        .unwrap_or_else(PoisonError::into_inner)
                        .push((index, report));
                });
                job
            })
            .collect();

        let panicked = run_batch(jobs, self.mode);

        let mut finished = results.into_inner().unwrap_or_else(PoisonError::into_inner);
        if panicked > 0 {
            let done: Vec<usize> = finished.iter().map(|(i, _)| *i).collect();
            for (index, unit) in units.iter().enumerate().filter(|(i, _)| !done.contains(i)) {
                let error = "unit panicked".to_string();
                self.report_failure(unit, &run_id, &error);
                finished.push((
                    index,
                    UnitReport {
                        source: unit.source.name.clone(),
                        stream: unit.stream.name.clone(),
                        outcome: UnitOutcome::Failed { error },
                        duration_ms: 0,
                    },
                ));
            }
        }
        finished.sort_by_key(|(i, _)| *i);

        let report = CycleReport {
            run_id,
            started_at,
            duration: clock.elapsed(),
            mode: self.mode,
            units: finished.into_iter().map(|(_, r)| r).collect(),
        };

        tracing::info!(
            run_id = %report.run_id,
            status = report.status().as_str(),
            analyzed = report.analyzed(),
            failed = report.failed(),
            duration_ms = report.duration.as_millis() as u64,
            "Cycle finished"
        );

        self.record_history(&report);
        report
    }

    /// Process one unit with failure containment.
    pub fn run_unit(&self, unit: &WorkUnit<'_>, run_id: &str) -> UnitReport {
        let clock = Instant::now();
        let deadline = Deadline::new(self.unit_timeout);

        let outcome = match self.process_unit(unit, &deadline) {
            Ok(outcome) => outcome,
            Err(e) => {
                let error = e.to_string();
                self.report_failure(unit, run_id, &error);
                UnitOutcome::Failed { error }
            }
        };

        UnitReport {
            source: unit.source.name.clone(),
            stream: unit.stream.name.clone(),
            outcome,
            duration_ms: clock.elapsed().as_millis() as u64,
        }
    }

    fn report_failure(&self, unit: &WorkUnit<'_>, run_id: &str, error: &str) {
        tracing::error!(
            run_id = %run_id,
            source = %unit.source.name,
            stream = %unit.stream.name,
            kind = %unit.source.kind,
            path = %unit.base_path,
            error = %error,
            "Work unit failed, offset not advanced"
        );
        self.notifier.notify(&format!(
            "errsift: {} failed ({}): {}",
            unit.label(),
            unit.base_path,
            error
        ));
    }

    /// The fallible per-unit sequence. Errors leave the stored offset untouched.
    pub fn process_unit(&self, unit: &WorkUnit<'_>, deadline: &Deadline) -> Result<UnitOutcome> {
        let source = unit.source;
        let stream = unit.stream;
        let reader = self.registry.reader_for(source)?;

        deadline.check("find_latest")?;
        let Some(latest) = reader.find_latest(&unit.base_path, &stream.file_glob)? else {
            tracing::debug!(
                source = %source.name,
                stream = %stream.name,
                path = %unit.base_path,
                glob = %stream.file_glob,
                "No matching log file"
            );
            return Ok(UnitOutcome::NoFile);
        };

        let file_name = file_key(&latest);
        let key = OffsetKey::new(&source.name, &stream.name, &file_name);
        let stored = match self.store.get(&key) {
            Ok(offset) => offset,
            Err(e) => {
                tracing::warn!(
                    source = %source.name,
                    stream = %stream.name,
                    file = %file_name,
                    error = %e,
                    "Offset store unavailable, reading from the start of the file"
                );
                0
            }
        };

        // Lines left in the file this one superseded come first
        let carryover = self.drain_previous_file(unit, reader.as_ref(), &file_name, deadline)?;
        let (mut lines, previous) = match carryover {
            Some(carry) => (carry.lines, Some((carry.key, carry.offset))),
            None => (Vec::new(), None),
        };

        deadline.check("tail")?;
        let mut tail = reader.tail(&latest, stored, &stream.filter)?;
        for item in &mut tail {
            deadline.check("tail")?;
            lines.push(item?.text);
        }
        let new_offset = tail.offset();
        // Release the file (and any remote session) before the slow part
        drop(tail);

        tracing::debug!(
            source = %source.name,
            stream = %stream.name,
            file = %file_name,
            from = stored,
            to = new_offset,
            lines = lines.len(),
            "Tailed log file"
        );

        if lines.is_empty() {
            if let Some((previous_key, previous_offset)) = &previous {
                self.commit(previous_key, *previous_offset);
            }
            if new_offset != stored {
                self.commit(&key, new_offset);
            }
            return Ok(UnitOutcome::NoNewLines {
                file: file_name,
                offset: new_offset,
            });
        }

        let parser = parser::parser_for(&stream.parser)
            .ok_or_else(|| Error::Config(format!("unknown parser {:?}", stream.parser)))?;
        let entries = parse_lines(parser.as_ref(), lines.iter().map(String::as_str));

        deadline.check("analysis")?;
        let ctx = AnalysisContext {
            source: source.name.clone(),
            stream: stream.name.clone(),
            file_name: file_name.clone(),
            context: previous
                .as_ref()
                .map(|(k, _)| format!("Includes the final lines of rotated file {}", k.file_key)),
        };
        let report = self.analyzer.analyze(&entries, &ctx)?;
        self.sink
            .write(&source.name, &stream.name, &file_name, &report)?;

        let mut committed = true;
        if let Some((previous_key, previous_offset)) = &previous {
            committed &= self.commit(previous_key, *previous_offset);
        }
        committed &= self.commit(&key, new_offset);

        tracing::info!(
            source = %source.name,
            stream = %stream.name,
            file = %file_name,
            lines = lines.len(),
            entries = entries.len(),
            offset = new_offset,
            "Analyzed new log lines"
        );

        Ok(UnitOutcome::Analyzed {
            file: file_name,
            lines: lines.len(),
            entries: entries.len(),
            offset: new_offset,
            committed,
        })
    }

    /// Read whatever the stream's previous file still holds past its stored
    /// offset, including an unterminated last line.
    ///
    /// Once a newer file exists the old one is no longer written to, so a
    /// held-back fragment will never be completed. Problems reading it only
    /// log; the unit carries on with the newest file.
    fn drain_previous_file(
        &self,
        unit: &WorkUnit<'_>,
        reader: &dyn LogReader,
        current_file: &str,
        deadline: &Deadline,
    ) -> Result<Option<Carryover>> {
        let source = unit.source;
        let stream = unit.stream;

        let previous = match self
            .store
            .previous_file(&source.name, &stream.name, current_file)
        {
            Ok(Some(record)) => record,
            Ok(None) => return Ok(None),
            Err(e) => {
                tracing::warn!(
                    source = %source.name,
                    stream = %stream.name,
                    error = %e,
                    "Offset store unavailable, not checking the previous file"
                );
                return Ok(None);
            }
        };

        let file_id = format!(
            "{}/{}",
            unit.base_path.trim_end_matches('/'),
            previous.key.file_key
        );
        deadline.check("drain")?;
        let mut tail = match reader.tail(&file_id, previous.offset, &stream.filter) {
            Ok(tail) => tail.to_eof(),
            Err(e) => {
                tracing::debug!(file = %file_id, error = %e, "Previous file is gone");
                return Ok(None);
            }
        };
        if tail.rewound() {
            // Rewritten since it was superseded; not ours to reread
            return Ok(None);
        }

        let mut lines = Vec::new();
        for item in &mut tail {
            deadline.check("drain")?;
            match item {
                Ok(line) => lines.push(line.text),
                Err(e) => {
                    tracing::warn!(file = %file_id, error = %e, "Failed to drain previous file");
                    return Ok(None);
                }
            }
        }

        let offset = tail.offset();
        if offset == previous.offset {
            return Ok(None);
        }
        tracing::info!(
            source = %source.name,
            stream = %stream.name,
            file = %previous.key.file_key,
            from = previous.offset,
            to = offset,
            lines = lines.len(),
            "Drained superseded log file"
        );
        Ok(Some(Carryover {
            key: previous.key,
            lines,
            offset,
        }))
    }

    /// Store the new offset; a failed write only logs.
    fn commit(&self, key: &OffsetKey, offset: u64) -> bool {
        match self.store.upsert(key, offset) {
            Ok(()) => true,
            Err(e) => {
                tracing::error!(
                    source = %key.source,
                    stream = %key.stream,
                    file = %key.file_key,
                    offset,
                    error = %e,
                    "Failed to commit offset, lines will be read again"
                );
                false
            }
        }
    }

    fn record_history(&self, report: &CycleReport) {
        let record = report.to_execution_record();

        if let Err(e) = self.store.record_execution(&record) {
            tracing::warn!(run_id = %record.run_id, error = %e, "Failed to record execution");
        }

        if let Some(path) = &self.history_file {
            if let Err(e) = append_jsonl(path, &record) {
                tracing::warn!(
                    run_id = %record.run_id,
                    path = %path.display(),
                    error = %e,
                    "Failed to append execution history"
                );
            }
        }
    }
}

fn append_jsonl(path: &Path, record: &ExecutionRecord) -> Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let mut line = serde_json::to_string(record)?;
    line.push('\n');
    let mut file = OpenOptions::new().create(true).append(true).open(path)?;
    file.write_all(line.as_bytes())?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn unit_report(outcome: UnitOutcome) -> UnitReport {
        UnitReport {
            source: "s".to_string(),
            stream: "t".to_string(),
            outcome,
            duration_ms: 1,
        }
    }

    fn cycle(outcomes: Vec<UnitOutcome>) -> CycleReport {
        CycleReport {
            run_id: "r".to_string(),
            started_at: Utc::now(),
            duration: Duration::from_millis(5),
            mode: BatchMode::Serial,
            units: outcomes.into_iter().map(unit_report).collect(),
        }
    }

    fn analyzed() -> UnitOutcome {
        UnitOutcome::Analyzed {
            file: "f.log".to_string(),
            lines: 2,
            entries: 2,
            offset: 10,
            committed: true,
        }
    }

    fn failed() -> UnitOutcome {
        UnitOutcome::Failed {
            error: "boom".to_string(),
        }
    }

    #[test]
    fn test_cycle_status() {
        assert_eq!(cycle(vec![]).status(), RunStatus::NoNewLogs);
        assert_eq!(
            cycle(vec![UnitOutcome::NoFile, analyzed()]).status(),
            RunStatus::Success
        );
        assert_eq!(
            cycle(vec![UnitOutcome::NoFile, failed()]).status(),
            RunStatus::PartialFailure
        );
        assert_eq!(cycle(vec![failed(), failed()]).status(), RunStatus::Failed);
        assert_eq!(
            cycle(vec![UnitOutcome::NoNewLines {
                file: "f.log".to_string(),
                offset: 3
            }])
            .status(),
            RunStatus::NoNewLogs
        );
    }

    #[test]
    fn test_execution_record_summarizes_units() {
        let record = cycle(vec![analyzed(), failed()]).to_execution_record();
        assert_eq!(record.status, RunStatus::PartialFailure);
        assert_eq!(record.payload["units"], 2);
        assert_eq!(record.payload["mode"], "serial");
        assert_eq!(record.response[0]["outcome"], "analyzed");
        assert_eq!(record.response[1]["error"], "boom");
        assert_eq!(record.response[1]["source"], "s");
    }

    #[test]
    fn test_deadline() {
        assert!(Deadline::new(Duration::from_secs(60)).check("tail").is_ok());

        let expired = Deadline::new(Duration::ZERO);
        match expired.check("analysis") {
            Err(Error::Timeout { stage, .. }) => assert_eq!(stage, "analysis"),
            other => panic!("expected timeout, got {other:?}"),
        }
    }
}
