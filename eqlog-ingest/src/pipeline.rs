//! Format plugins and the `process_and_upload` entry point.
//!
//! A plugin ties one file format to the engine components:
//! - the tailer reads the appended text (or the whole file for single-shot formats)
//! - the parser turns it into records, the allow-list narrows error entries
//! - the writer stores them synchronously, or the batch accumulator queues them
//! - the reclaimer settles the source file once its records are durable
//!
//! The host only sees [`IngestPlugin`] and [`PluginRegistry`].

use crate::batcher::{BatchAccumulator, BatchItem, BatchOptions, EnqueueOutcome, FlushOutcome};
use crate::error::{IngestSummary, Outcome, SkipReason};
use crate::filter::{filter_records, load_allow_set};
use crate::metrics::{RECORDS_DROPPED_TOTAL, RECORDS_PARSED_TOTAL, TAIL_SKIPS_TOTAL};
use crate::parsers::{
    ErrorLogParser, FileHints, FlatWaferParser, Parser, PrealignParser, SpectralParser,
    WaferMapParser,
};
use crate::reclaim::{Disposition, Reclaimer, SourceFile};
use crate::settings::SettingsSource;
use crate::tail_state::TailStateStore;
use crate::tailer::{TailOptions, TailRead, Tailer, TextEncoding};
use crate::writer::BulkWriter;
use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FormatKind {
    WaferMap,
    Prealign,
    FlatWafer,
    Spectral,
    ErrorLog,
}

/// What happens to a source file once its records are stored.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Retention {
    /// Produced once and read whole; deleted after upload.
    Disposable,
    /// Grows over time; tailed from the committed offset and never deleted.
    AppendLog,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    Synchronous,
    Batched,
}

impl FormatKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            FormatKind::WaferMap => "wafer_map",
            FormatKind::Prealign => "prealign",
            FormatKind::FlatWafer => "flat_wafer",
            FormatKind::Spectral => "spectral",
            FormatKind::ErrorLog => "error_log",
        }
    }

    pub fn default_task_name(&self) -> &'static str {
        match self {
            FormatKind::WaferMap => "WaferMapUpload",
            FormatKind::Prealign => "PrealignUpload",
            FormatKind::FlatWafer => "FlatWaferUpload",
            FormatKind::Spectral => "SpectralUpload",
            FormatKind::ErrorLog => "ErrorLogUpload",
        }
    }

    pub fn default_file_filter(&self) -> &'static [&'static str] {
        match self {
            FormatKind::WaferMap => &["map", "wmap"],
            FormatKind::Prealign => &["log"],
            FormatKind::FlatWafer => &["csv"],
            FormatKind::Spectral => &["spc", "csv"],
            FormatKind::ErrorLog => &["log", "txt"],
        }
    }

    pub fn retention(&self) -> Retention {
        match self {
            FormatKind::WaferMap | FormatKind::FlatWafer | FormatKind::Spectral => {
                Retention::Disposable
            }
            FormatKind::Prealign | FormatKind::ErrorLog => Retention::AppendLog,
        }
    }

    pub fn delivery(&self) -> Delivery {
        match self {
            FormatKind::WaferMap | FormatKind::Spectral => Delivery::Batched,
            FormatKind::Prealign | FormatKind::FlatWafer | FormatKind::ErrorLog => {
                Delivery::Synchronous
            }
        }
    }

    /// Error entries are narrowed to the classifications known to the reference table.
    pub fn uses_allow_list(&self) -> bool {
        matches!(self, FormatKind::ErrorLog)
    }

    fn parser(&self) -> Box<dyn Parser> {
        match self {
            FormatKind::WaferMap => Box::new(WaferMapParser::default()),
            FormatKind::Prealign => Box::new(PrealignParser::default()),
            FormatKind::FlatWafer => Box::new(FlatWaferParser),
            FormatKind::Spectral => Box::new(SpectralParser::default()),
            FormatKind::ErrorLog => Box::new(ErrorLogParser::default()),
        }
    }
}

/// Per-deployment choices for one format; unset fields take the format's defaults.
#[derive(Debug, Clone)]
pub struct FormatSpec {
    pub kind: FormatKind,
    pub task_name: Option<String>,
    pub file_filter: Option<Vec<String>>,
    pub encoding: TextEncoding,
}

impl FormatSpec {
    pub fn new(kind: FormatKind) -> Self {
        Self {
            kind,
            task_name: None,
            file_filter: None,
            encoding: TextEncoding::default(),
        }
    }

    /// Configured extensions, lowercased without the leading dot, or the format's defaults.
    pub fn effective_file_filter(&self) -> Vec<String> {
        match &self.file_filter {
            Some(filter) => filter
                .iter()
                .map(|ext| ext.trim_start_matches('.').to_ascii_lowercase())
                .filter(|ext| !ext.is_empty())
                .collect(),
            None => self
                .kind
                .default_file_filter()
                .iter()
                .map(|ext| ext.to_string())
                .collect(),
        }
    }
}

/// Declarative description a host reads before dispatching files to a plugin.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PluginMetadata {
    pub default_task_name: String,
    /// Lowercase extensions without the leading dot.
    pub file_filter: Vec<String>,
    /// Set when the deployment replaced the format's built-in task name.
    pub override_names: bool,
}

impl PluginMetadata {
    pub fn matches(&self, path: &Path) -> bool {
        let Some(extension) = path.extension().and_then(|ext| ext.to_str()) else {
            return false;
        };
        let extension = extension.to_ascii_lowercase();
        self.file_filter.iter().any(|accepted| *accepted == extension)
    }
}

#[async_trait]
pub trait IngestPlugin: Send + Sync {
    fn metadata(&self) -> &PluginMetadata;

    /// Processes whatever is new in `path`. Never panics and never returns an error: every
    /// failure is reported as [`Outcome::Skip`] or [`Outcome::Fail`] and retried on the next
    /// trigger.
    async fn process_and_upload(&self, path: &Path, settings: &SettingsSource) -> Outcome;
}

/// Services shared by every plugin of a process.
#[derive(Clone)]
pub struct IngestContext {
    pub state: Arc<TailStateStore>,
    pub writer: BulkWriter,
    pub tail_options: TailOptions,
    pub batch_options: BatchOptions,
}

impl IngestContext {
    pub fn new(writer: BulkWriter) -> Self {
        Self {
            state: TailStateStore::new(),
            writer,
            tail_options: TailOptions::default(),
            batch_options: BatchOptions::default(),
        }
    }
}

pub struct FormatIngestor {
    kind: FormatKind,
    metadata: PluginMetadata,
    parser: Box<dyn Parser>,
    tailer: Tailer,
    state: Arc<TailStateStore>,
    writer: BulkWriter,
    reclaimer: Reclaimer,
    accumulator: Option<Arc<BatchAccumulator>>,
}

impl FormatIngestor {
    pub fn new(spec: FormatSpec, ctx: &IngestContext) -> Self {
        let kind = spec.kind;
        let file_filter = spec.effective_file_filter();
        let override_names = spec.task_name.is_some();
        let default_task_name = spec
            .task_name
            .unwrap_or_else(|| kind.default_task_name().to_string());

        let tail_options = TailOptions {
            single_shot: kind.retention() == Retention::Disposable,
            encoding: spec.encoding,
            ..ctx.tail_options.clone()
        };
        let reclaimer = Reclaimer::new(ctx.state.clone());
        let accumulator = match kind.delivery() {
            Delivery::Batched => Some(BatchAccumulator::new(
                default_task_name.clone(),
                ctx.writer.clone(),
                reclaimer.clone(),
                ctx.batch_options.clone(),
            )),
            Delivery::Synchronous => None,
        };

        Self {
            kind,
            metadata: PluginMetadata {
                default_task_name,
                file_filter,
                override_names,
            },
            parser: kind.parser(),
            tailer: Tailer::new(ctx.state.clone(), tail_options),
            state: ctx.state.clone(),
            writer: ctx.writer.clone(),
            reclaimer,
            accumulator,
        }
    }

    pub fn kind(&self) -> FormatKind {
        self.kind
    }

    /// The batch queue of a batched format; the host starts its flush scheduler.
    pub fn accumulator(&self) -> Option<&Arc<BatchAccumulator>> {
        self.accumulator.as_ref()
    }

    async fn ingest(&self, path: &Path, settings: &SettingsSource) -> Outcome {
        let Some(_claim) = self.state.claim(path) else {
            return Outcome::Skip(SkipReason::InProgress);
        };
        if let Some(accumulator) = &self.accumulator {
            if accumulator.is_queued(path) {
                return Outcome::Skip(SkipReason::AlreadyQueued);
            }
        }

        let chunk = match self.tailer.tail(path).await {
            TailRead::Chunk(chunk) => chunk,
            TailRead::Skip(reason) => return Outcome::Skip(reason),
        };
        let settings = settings.resolve().await;
        let hints = FileHints::new(path, &settings.eqpid);

        let parsed = match self.parser.parse(&chunk.text, &hints) {
            Ok(parsed) => parsed,
            Err(err) => {
                warn!(
                    error = %err,
                    path = %path.display(),
                    format = self.kind.as_str(),
                    "file could not be parsed; leaving it in place"
                );
                return Outcome::Skip(SkipReason::Unparseable(err.to_string()));
            }
        };
        let format = self.kind.as_str();
        RECORDS_PARSED_TOTAL
            .with_label_values(&[format])
            .inc_by(parsed.records.len() as u64);
        RECORDS_DROPPED_TOTAL
            .with_label_values(&[format])
            .inc_by(parsed.dropped as u64);

        let mut summary = IngestSummary {
            parsed: parsed.records.len(),
            dropped: parsed.dropped,
            ..IngestSummary::default()
        };
        let records = if self.kind.uses_allow_list() {
            let allow = load_allow_set(self.writer.store().as_ref()).await;
            let filtered = filter_records(parsed.records, &allow);
            summary.skipped_by_filter = filtered.skipped;
            filtered.kept
        } else {
            parsed.records
        };
        debug!(
            path = %path.display(),
            format,
            matched = records.len(),
            skipped = summary.dropped + summary.skipped_by_filter,
            "records matched"
        );

        let disposition = match self.kind.retention() {
            Retention::Disposable => Disposition::Delete,
            Retention::AppendLog => Disposition::CommitOffset(chunk.commit.clone()),
        };

        if records.is_empty() {
            // Nothing to store; an append log still moves past the lines it has read.
            if let Disposition::CommitOffset(commit) = &disposition {
                self.state.commit(commit);
            }
            return if summary.skipped_by_filter > 0 {
                Outcome::Success(summary)
            } else {
                Outcome::Skip(SkipReason::Empty)
            };
        }

        let source = SourceFile {
            path: path.to_path_buf(),
            disposition,
        };
        match &self.accumulator {
            Some(accumulator) => {
                summary.queued = true;
                match accumulator.enqueue(BatchItem { source, records }).await {
                    EnqueueOutcome::AlreadyQueued => Outcome::Skip(SkipReason::AlreadyQueued),
                    EnqueueOutcome::Queued { .. } => Outcome::Success(summary),
                    EnqueueOutcome::Flushed(FlushOutcome::Failed { error, .. }) => {
                        Outcome::Fail(error)
                    }
                    EnqueueOutcome::Flushed(FlushOutcome::Flushed { rows_written, .. }) => {
                        summary.rows_written = rows_written;
                        Outcome::Success(summary)
                    }
                    EnqueueOutcome::Flushed(_) => Outcome::Success(summary),
                }
            }
            None => match self.writer.write(&records).await {
                Ok(report) => {
                    self.reclaimer.reclaim(std::slice::from_ref(&source)).await;
                    summary.rows_written = report.rows_written;
                    Outcome::Success(summary)
                }
                Err(err) => Outcome::Fail(err.to_string()),
            },
        }
    }
}

#[async_trait]
impl IngestPlugin for FormatIngestor {
    fn metadata(&self) -> &PluginMetadata {
        &self.metadata
    }

    async fn process_and_upload(&self, path: &Path, settings: &SettingsSource) -> Outcome {
        let outcome = self.ingest(path, settings).await;
        match &outcome {
            Outcome::Success(summary) => info!(
                task = %self.metadata.default_task_name,
                path = %path.display(),
                parsed = summary.parsed,
                dropped = summary.dropped,
                skipped_by_filter = summary.skipped_by_filter,
                rows_written = summary.rows_written,
                queued = summary.queued,
                "file processed"
            ),
            Outcome::Skip(reason) => {
                TAIL_SKIPS_TOTAL.with_label_values(&[reason.label()]).inc();
                debug!(
                    task = %self.metadata.default_task_name,
                    path = %path.display(),
                    reason = %reason,
                    "file skipped"
                );
            }
            Outcome::Fail(cause) => warn!(
                task = %self.metadata.default_task_name,
                path = %path.display(),
                error = %cause,
                "upload failed; progress not committed"
            ),
        }
        outcome
    }
}

/// Plugins in registration order; the first whose filter matches a path handles it.
#[derive(Default)]
pub struct PluginRegistry {
    plugins: Vec<Arc<dyn IngestPlugin>>,
}

impl PluginRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, plugin: Arc<dyn IngestPlugin>) {
        info!(
            task = %plugin.metadata().default_task_name,
            filter = ?plugin.metadata().file_filter,
            "plugin registered"
        );
        self.plugins.push(plugin);
    }

    pub fn route(&self, path: &Path) -> Option<&Arc<dyn IngestPlugin>> {
        self.plugins
            .iter()
            .find(|plugin| plugin.metadata().matches(path))
    }

    pub fn iter(&self) -> impl Iterator<Item = &Arc<dyn IngestPlugin>> {
        self.plugins.iter()
    }

    pub fn len(&self) -> usize {
        self.plugins.len()
    }

    pub fn is_empty(&self) -> bool {
        self.plugins.is_empty()
    }

    /// Files already present under the watch paths that some plugin accepts, oldest first.
    pub fn discover_existing_files(&self, paths: &[PathBuf]) -> Result<Vec<PathBuf>> {
        let mut collected_files = Vec::new();
        for watch_path in paths {
            if !watch_path.exists() {
                debug!(
                    path = %watch_path.display(),
                    "watch path does not exist on disk; skipping"
                );
                continue;
            }
            self.collect_files(watch_path, &mut collected_files)?;
        }

        collected_files.sort_by(|a, b| {
            let a_mtime = std::fs::metadata(a).ok().and_then(|m| m.modified().ok());
            let b_mtime = std::fs::metadata(b).ok().and_then(|m| m.modified().ok());
            match (a_mtime, b_mtime) {
                (Some(a_time), Some(b_time)) => a_time.cmp(&b_time).then_with(|| a.cmp(b)),
                (Some(_), None) => std::cmp::Ordering::Less,
                (None, Some(_)) => std::cmp::Ordering::Greater,
                (None, None) => a.cmp(b),
            }
        });
        collected_files.dedup();

        debug!(file_count = collected_files.len(), "existing files discovered");
        Ok(collected_files)
    }

    fn collect_files(&self, path: &Path, files: &mut Vec<PathBuf>) -> Result<()> {
        let metadata = std::fs::metadata(path)
            .with_context(|| format!("failed to read metadata for {}", path.display()))?;
        if metadata.is_file() {
            if self.route(path).is_some() {
                files.push(path.to_path_buf());
            } else {
                debug!(path = %path.display(), "no plugin accepts file; skipping");
            }
            return Ok(());
        }

        if metadata.is_dir() {
            for entry in std::fs::read_dir(path)
                .with_context(|| format!("failed to read directory {}", path.display()))?
            {
                let entry = entry?;
                self.collect_files(&entry.path(), files)?;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::OffsetClock;
    use crate::error::StoreError;
    use crate::settings::Settings;
    use crate::writer::{TableBatch, UpsertStore, WriterOptions};
    use std::collections::HashSet;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::time::Duration;

    #[derive(Default)]
    struct MemoryStore {
        rows: AtomicUsize,
        fail: AtomicBool,
        allow: Vec<String>,
    }

    #[async_trait]
    impl UpsertStore for MemoryStore {
        async fn apply(&self, batches: &[TableBatch]) -> Result<Vec<u64>, StoreError> {
            if self.fail.load(Ordering::SeqCst) {
                return Err(StoreError::Rejected("forced".into()));
            }
            let counts: Vec<u64> = batches.iter().map(|batch| batch.rows as u64).collect();
            self.rows
                .fetch_add(counts.iter().sum::<u64>() as usize, Ordering::SeqCst);
            Ok(counts)
        }

        async fn fetch_allow_list(&self) -> Result<HashSet<String>, StoreError> {
            Ok(self.allow.iter().cloned().collect())
        }
    }

    fn context(store: Arc<MemoryStore>) -> IngestContext {
        let writer = BulkWriter::new(
            store,
            Arc::new(OffsetClock::default()),
            WriterOptions {
                timeout: Duration::from_secs(5),
                retries: 0,
                retry_delay: Duration::from_millis(1),
            },
        );
        let mut ctx = IngestContext::new(writer);
        ctx.tail_options.open_retries = 0;
        ctx.batch_options.flush_interval = Duration::from_millis(20);
        ctx
    }

    fn settings() -> SettingsSource {
        SettingsSource::Inline(Settings::with_eqpid("EQ-1"))
    }

    fn summary(outcome: Outcome) -> IngestSummary {
        match outcome {
            Outcome::Success(summary) => summary,
            other => panic!("unexpected outcome {other:?}"),
        }
    }

    #[tokio::test]
    async fn append_log_commits_offset_only_after_write() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("prealign.log");
        let line = "05-Jan-25 13:45:10 PA X=0.10 Y=-0.02 T=0.001\n";
        std::fs::write(&path, line).unwrap();

        let store = Arc::new(MemoryStore::default());
        let ctx = context(store.clone());
        let plugin = FormatIngestor::new(FormatSpec::new(FormatKind::Prealign), &ctx);

        store.fail.store(true, Ordering::SeqCst);
        assert!(matches!(
            plugin.process_and_upload(&path, &settings()).await,
            Outcome::Fail(_)
        ));
        assert_eq!(ctx.state.get_offset(&path), None);

        store.fail.store(false, Ordering::SeqCst);
        let first = summary(plugin.process_and_upload(&path, &settings()).await);
        assert_eq!(first.rows_written, 1);
        assert_eq!(ctx.state.get_offset(&path), Some(line.len() as u64));

        assert_eq!(
            plugin.process_and_upload(&path, &settings()).await,
            Outcome::Skip(SkipReason::NoChange)
        );
        assert_eq!(store.rows.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn empty_allow_list_rejects_errors_but_advances_offset() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("error.log");
        let text = "2025-01-05 13:45:10 [ERROR] E1 Vacuum low\n";
        std::fs::write(&path, text).unwrap();

        let store = Arc::new(MemoryStore::default());
        let ctx = context(store.clone());
        let plugin = FormatIngestor::new(FormatSpec::new(FormatKind::ErrorLog), &ctx);

        let result = summary(plugin.process_and_upload(&path, &settings()).await);
        assert_eq!(result.skipped_by_filter, 1);
        assert_eq!(result.rows_written, 0);
        assert_eq!(store.rows.load(Ordering::SeqCst), 0);
        assert_eq!(ctx.state.get_offset(&path), Some(text.len() as u64));
    }

    #[tokio::test]
    async fn allowed_errors_are_written() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("error.log");
        std::fs::write(
            &path,
            "2025-01-05 13:45:10 [ERROR] E1 Vacuum low\n\
             2025-01-05 13:45:11 [ERROR] E2 Door open\n",
        )
        .unwrap();

        let store = Arc::new(MemoryStore {
            allow: vec!["E2".into()],
            ..MemoryStore::default()
        });
        let plugin = FormatIngestor::new(FormatSpec::new(FormatKind::ErrorLog), &context(store));
        let result = summary(plugin.process_and_upload(&path, &settings()).await);
        assert_eq!(result.parsed, 2);
        assert_eq!(result.skipped_by_filter, 1);
        assert_eq!(result.rows_written, 1);
    }

    #[tokio::test]
    async fn disposable_file_is_deleted_after_write() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("FW_20250105_134510.csv");
        std::fs::write(&path, "Point,Thk\n1,1.0\n2,2.0\n").unwrap();

        let store = Arc::new(MemoryStore::default());
        let plugin = FormatIngestor::new(FormatSpec::new(FormatKind::FlatWafer), &context(store));
        let result = summary(plugin.process_and_upload(&path, &settings()).await);
        assert_eq!(result.rows_written, 2);
        assert!(!path.exists());
    }

    #[tokio::test]
    async fn unparseable_disposable_file_is_kept() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("FW.csv");
        std::fs::write(&path, "Point,Thk\n1,1.0\n").unwrap();

        let store = Arc::new(MemoryStore::default());
        let plugin = FormatIngestor::new(FormatSpec::new(FormatKind::FlatWafer), &context(store));
        assert!(matches!(
            plugin.process_and_upload(&path, &settings()).await,
            Outcome::Skip(SkipReason::Unparseable(_))
        ));
        assert!(path.exists());
    }

    #[tokio::test]
    async fn claimed_file_is_skipped() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("prealign.log");
        std::fs::write(&path, "05-Jan-25 13:45:10 PA X=0.1 Y=0.2 T=0.3\n").unwrap();

        let ctx = context(Arc::new(MemoryStore::default()));
        let plugin = FormatIngestor::new(FormatSpec::new(FormatKind::Prealign), &ctx);
        let _claim = ctx.state.claim(&path).unwrap();
        assert_eq!(
            plugin.process_and_upload(&path, &settings()).await,
            Outcome::Skip(SkipReason::InProgress)
        );
    }

    #[tokio::test]
    async fn batched_file_is_queued_once_and_deleted_on_flush() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("LOT1_W05.map");
        std::fs::write(&path, "2025-01-05 13:45:10 MAPUPLOAD LOT1 W05\n").unwrap();

        let store = Arc::new(MemoryStore::default());
        let plugin = FormatIngestor::new(FormatSpec::new(FormatKind::WaferMap), &context(store.clone()));

        let first = summary(plugin.process_and_upload(&path, &settings()).await);
        assert!(first.queued);
        assert_eq!(
            plugin.process_and_upload(&path, &settings()).await,
            Outcome::Skip(SkipReason::AlreadyQueued)
        );

        let accumulator = plugin.accumulator().unwrap();
        assert!(matches!(
            accumulator.flush().await,
            FlushOutcome::Flushed { files: 1, .. }
        ));
        assert_eq!(store.rows.load(Ordering::SeqCst), 1);
        assert!(!path.exists());
    }

    #[tokio::test]
    async fn registry_routes_by_extension_in_registration_order() {
        let ctx = context(Arc::new(MemoryStore::default()));
        let mut registry = PluginRegistry::new();
        registry.register(Arc::new(FormatIngestor::new(
            FormatSpec::new(FormatKind::FlatWafer),
            &ctx,
        )));
        registry.register(Arc::new(FormatIngestor::new(
            FormatSpec {
                task_name: Some("SpectraNightly".into()),
                file_filter: Some(vec![".SPC".into(), "csv".into()]),
                ..FormatSpec::new(FormatKind::Spectral)
            },
            &ctx,
        )));

        let route = |name: &str| {
            registry
                .route(Path::new(name))
                .map(|plugin| plugin.metadata().default_task_name.clone())
        };
        assert_eq!(route("/in/a.CSV").as_deref(), Some("FlatWaferUpload"));
        assert_eq!(route("/in/a.spc").as_deref(), Some("SpectraNightly"));
        assert_eq!(route("/in/a.log"), None);
        assert_eq!(route("/in/noext"), None);

        let spectral = registry.iter().nth(1).unwrap().metadata();
        assert!(spectral.override_names);
        assert_eq!(spectral.file_filter, vec!["spc", "csv"]);
    }

    #[tokio::test]
    async fn discovery_keeps_only_routable_files() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir(dir.path().join("nested")).unwrap();
        std::fs::write(dir.path().join("a.map"), "").unwrap();
        std::fs::write(dir.path().join("nested").join("b.map"), "").unwrap();
        std::fs::write(dir.path().join("readme.md"), "").unwrap();

        let ctx = context(Arc::new(MemoryStore::default()));
        let mut registry = PluginRegistry::new();
        registry.register(Arc::new(FormatIngestor::new(
            FormatSpec::new(FormatKind::WaferMap),
            &ctx,
        )));

        let files = registry
            .discover_existing_files(&[dir.path().to_path_buf(), dir.path().join("missing")])
            .unwrap();
        assert_eq!(files.len(), 2);
        assert!(files.iter().all(|path| path.extension().unwrap() == "map"));
    }
}
