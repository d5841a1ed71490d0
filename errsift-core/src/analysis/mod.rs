//! Analysis of new log entries
//!
//! The orchestrator hands each batch of newly parsed entries to an
//! [`Analyzer`] exactly once per unit and cycle. The default implementation,
//! [`AnalysisPipeline`], gathers runbook context, asks an LLM for a root-cause
//! summary (or builds an offline digest when no LLM is configured) and frames
//! the result with source metadata.

mod llm;

pub use llm::{create_completion_client, CompletionClient, HttpCompletionClient};

use crate::config::Config;
use crate::error::{Error, Result};
use crate::types::ParsedEntry;
use std::collections::HashMap;
use std::io::ErrorKind;
use std::path::PathBuf;

const MAX_EVENTS_CHARS: usize = 16_000;
const DIGEST_TOP_MESSAGES: usize = 5;

/// Metadata accompanying one batch.
#[derive(Debug, Clone, Default)]
pub struct AnalysisContext {
    pub source: String,
    pub stream: String,
    /// Base name of the file the batch was read from
    pub file_name: String,
    /// Free-text context supplied by the caller
    pub context: Option<String>,
}

/// Turns a batch of entries into a text report.
///
/// May be slow and may perform I/O. Not assumed idempotent.
pub trait Analyzer: Send + Sync {
    fn analyze(&self, batch: &[ParsedEntry], ctx: &AnalysisContext) -> Result<String>;
}

/// Looks up operator runbooks for a source/stream.
///
/// `{dir}/{source}/{stream}.md` wins over `{dir}/{source}.md`.
#[derive(Debug, Clone, Default)]
pub struct RunbookRetriever {
    dir: Option<PathBuf>,
}

impl RunbookRetriever {
    pub fn new(dir: Option<PathBuf>) -> Self {
        Self { dir }
    }

    pub fn fetch(&self, source: &str, stream: &str) -> Option<String> {
        let dir = self.dir.as_ref()?;
        let candidates = [
            dir.join(source).join(format!("{stream}.md")),
            dir.join(format!("{source}.md")),
        ];

        for path in candidates {
            match std::fs::read_to_string(&path) {
                Ok(text) if !text.trim().is_empty() => return Some(text),
                Ok(_) => {}
                Err(e) if e.kind() == ErrorKind::NotFound => {}
                Err(e) => {
                    tracing::warn!(path = %path.display(), error = %e, "Failed to read runbook");
                }
            }
        }
        None
    }
}

/// Runbook lookup, completion (or offline digest) and report framing.
pub struct AnalysisPipeline {
    retriever: RunbookRetriever,
    client: Option<Box<dyn CompletionClient>>,
}

impl AnalysisPipeline {
    pub fn new(retriever: RunbookRetriever, client: Option<Box<dyn CompletionClient>>) -> Self {
        Self { retriever, client }
    }

    /// Pipeline without an LLM; reports carry an offline digest.
    pub fn offline(retriever: RunbookRetriever) -> Self {
        Self::new(retriever, None)
    }

    fn merged_context(&self, ctx: &AnalysisContext) -> Option<String> {
        let runbook = self.retriever.fetch(&ctx.source, &ctx.stream);
        match (ctx.context.as_deref(), runbook) {
            (Some(given), Some(runbook)) => Some(format!("{given}\n\n{runbook}")),
            (Some(given), None) => Some(given.to_string()),
            (None, runbook) => runbook,
        }
    }
}

impl Analyzer for AnalysisPipeline {
    fn analyze(&self, batch: &[ParsedEntry], ctx: &AnalysisContext) -> Result<String> {
        let context = self.merged_context(ctx);

        let body = match &self.client {
            Some(client) => {
                let prompt = build_prompt(batch, ctx, context.as_deref());
                let answer = client.complete(&prompt)?;
                if answer.trim().is_empty() {
                    return Err(Error::Analysis("completion was empty".to_string()));
                }
                answer.trim().to_string()
            }
            None => offline_digest(batch),
        };

        Ok(format_report(ctx, &body))
    }
}

/// Build the analyzer described by the process configuration.
pub fn create_analyzer(config: &Config) -> Result<Box<dyn Analyzer>> {
    let retriever = RunbookRetriever::new(config.paths.runbooks_dir.clone());
    let client = match &config.llm {
        Some(llm) => {
            tracing::info!(provider = ?llm.provider, model = %llm.model, "LLM analysis enabled");
            Some(create_completion_client(llm)?)
        }
        None => {
            tracing::info!("No [llm] configured, reports will contain an offline digest");
            None
        }
    };
    Ok(Box::new(AnalysisPipeline::new(retriever, client)))
}

fn build_prompt(batch: &[ParsedEntry], ctx: &AnalysisContext, context: Option<&str>) -> String {
    let mut events = String::new();
    for entry in batch {
        let line = format!(
            "- [{}] {}\n",
            entry.level.as_deref().unwrap_or("?"),
            entry.text().replace('\n', " ")
        );
        events.push_str(&line);
        if events.len() >= MAX_EVENTS_CHARS {
            truncate_at_char_boundary(&mut events, MAX_EVENTS_CHARS);
            events.push_str("\n...[truncated]");
            break;
        }
    }

    format!(
        "Source: {}\nStream: {}\nFile: {}\n\nContext:\n{}\n\nEvents ({}):\n{}\n",
        ctx.source,
        ctx.stream,
        ctx.file_name,
        context.unwrap_or("N/A"),
        batch.len(),
        events
    )
}

fn truncate_at_char_boundary(s: &mut String, max: usize) {
    if s.len() <= max {
        return;
    }
    let mut cut = max;
    while !s.is_char_boundary(cut) {
        cut -= 1;
    }
    s.truncate(cut);
}

/// Counts per level and the most frequent messages.
fn offline_digest(batch: &[ParsedEntry]) -> String {
    let mut levels: HashMap<&str, usize> = HashMap::new();
    let mut messages: HashMap<&str, usize> = HashMap::new();
    for entry in batch {
        *levels
            .entry(entry.level.as_deref().unwrap_or("UNKNOWN"))
            .or_default() += 1;
        *messages.entry(entry.text()).or_default() += 1;
    }

    let mut levels: Vec<_> = levels.into_iter().collect();
    levels.sort_by(|a, b| b.1.cmp(&a.1).then(a.0.cmp(b.0)));
    let mut messages: Vec<_> = messages.into_iter().collect();
    messages.sort_by(|a, b| b.1.cmp(&a.1).then(a.0.cmp(b.0)));

    let mut out = format!("No LLM configured. {} new entries.\n", batch.len());

    out.push_str("\nBy level:\n");
    for (level, count) in &levels {
        out.push_str(&format!("  {level}: {count}\n"));
    }

    let first = batch.iter().find_map(|e| e.timestamp.as_deref());
    let last = batch.iter().rev().find_map(|e| e.timestamp.as_deref());
    if let (Some(first), Some(last)) = (first, last) {
        out.push_str(&format!("\nWindow: {first} .. {last}\n"));
    }

    out.push_str("\nMost frequent:\n");
    for (message, count) in messages.iter().take(DIGEST_TOP_MESSAGES) {
        let first_line = message.lines().next().unwrap_or_default();
        out.push_str(&format!("  {count}x {first_line}\n"));
    }

    out.trim_end().to_string()
}

fn format_report(ctx: &AnalysisContext, body: &str) -> String {
    [
        format!("Source: {}", ctx.source),
        format!("Stream: {}", ctx.stream),
        format!("Source-File: {}", ctx.file_name),
        "----- Analysis -----".to_string(),
        body.to_string(),
        "--------------------".to_string(),
    ]
    .join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;
    use tempfile::TempDir;

    struct MockClient {
        response: String,
        prompts: Mutex<Vec<String>>,
    }

    impl MockClient {
        fn new(response: &str) -> Self {
            Self {
                response: response.to_string(),
                prompts: Mutex::new(Vec::new()),
            }
        }
    }

    impl CompletionClient for MockClient {
        fn complete(&self, prompt: &str) -> Result<String> {
            self.prompts.lock().unwrap().push(prompt.to_string());
            Ok(self.response.clone())
        }
    }

    impl CompletionClient for std::sync::Arc<MockClient> {
        fn complete(&self, prompt: &str) -> Result<String> {
            self.as_ref().complete(prompt)
        }
    }

    fn ctx() -> AnalysisContext {
        AnalysisContext {
            source: "prod".to_string(),
            stream: "laravel".to_string(),
            file_name: "laravel-2025-08-17.log".to_string(),
            context: None,
        }
    }

    fn batch() -> Vec<ParsedEntry> {
        vec![
            ParsedEntry {
                raw: "2025-08-17 10:00:00 ERROR db down".to_string(),
                timestamp: Some("2025-08-17 10:00:00".to_string()),
                level: Some("ERROR".to_string()),
                message: Some("db down".to_string()),
            },
            ParsedEntry {
                raw: "2025-08-17 10:00:05 ERROR db down".to_string(),
                timestamp: Some("2025-08-17 10:00:05".to_string()),
                level: Some("ERROR".to_string()),
                message: Some("db down".to_string()),
            },
            ParsedEntry::unclassified("kernel: oom-killer invoked"),
        ]
    }

    #[test]
    fn test_report_is_framed() {
        let pipeline = AnalysisPipeline::new(
            RunbookRetriever::default(),
            Some(Box::new(MockClient::new("  Root cause: database  \n"))),
        );
        let report = pipeline.analyze(&batch(), &ctx()).unwrap();
        assert_eq!(
            report,
            "Source: prod\nStream: laravel\nSource-File: laravel-2025-08-17.log\n\
             ----- Analysis -----\nRoot cause: database\n--------------------"
        );
    }

    #[test]
    fn test_empty_completion_is_failure() {
        let pipeline =
            AnalysisPipeline::new(RunbookRetriever::default(), Some(Box::new(MockClient::new("  "))));
        let err = pipeline.analyze(&batch(), &ctx()).unwrap_err();
        assert!(matches!(err, Error::Analysis(_)));
    }

    #[test]
    fn test_prompt_includes_events_and_runbook() {
        let dir = TempDir::new().unwrap();
        std::fs::create_dir_all(dir.path().join("prod")).unwrap();
        std::fs::write(dir.path().join("prod/laravel.md"), "Restart php-fpm first.").unwrap();
        std::fs::write(dir.path().join("prod.md"), "Generic prod runbook").unwrap();

        let client = std::sync::Arc::new(MockClient::new("ok"));
        let pipeline = AnalysisPipeline::new(
            RunbookRetriever::new(Some(dir.path().to_path_buf())),
            Some(Box::new(client.clone())),
        );
        pipeline.analyze(&batch(), &ctx()).unwrap();

        let prompts = client.prompts.lock().unwrap();
        assert_eq!(prompts.len(), 1);
        assert!(prompts[0].contains("Restart php-fpm first."));
        assert!(!prompts[0].contains("Generic prod runbook"));
        assert!(prompts[0].contains("- [ERROR] db down"));
        assert!(prompts[0].contains("Events (3)"));
    }

    #[test]
    fn test_runbook_falls_back_to_source_file() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("prod.md"), "Generic prod runbook").unwrap();
        let retriever = RunbookRetriever::new(Some(dir.path().to_path_buf()));
        assert_eq!(
            retriever.fetch("prod", "laravel").as_deref(),
            Some("Generic prod runbook")
        );
        assert!(retriever.fetch("staging", "laravel").is_none());
    }

    #[test]
    fn test_offline_digest() {
        let pipeline = AnalysisPipeline::offline(RunbookRetriever::default());
        let report = pipeline.analyze(&batch(), &ctx()).unwrap();
        assert!(report.contains("3 new entries"));
        assert!(report.contains("ERROR: 3"));
        assert!(report.contains("2x db down"));
        assert!(report.contains("Window: 2025-08-17 10:00:00 .. 2025-08-17 10:00:05"));
    }

    #[test]
    fn test_prompt_truncation_respects_char_boundaries() {
        let entry = ParsedEntry::unclassified(&"é".repeat(MAX_EVENTS_CHARS));
        let prompt = build_prompt(&[entry], &ctx(), None);
        assert!(prompt.contains("...[truncated]"));
    }
}
