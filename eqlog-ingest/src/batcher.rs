//! Batch accumulator and flush scheduler for batched formats.
//!
//! Ingestion calls enqueue one item per file. A flush drains the whole queue into one write;
//! only one flush runs at a time, whether started by the timer or by an enqueue that crossed
//! the size threshold. Failed flushes are not requeued: the files stay on disk and the next
//! trigger parses them again.

use crate::reclaim::{Reclaimer, SourceFile};
use crate::record::ParsedRecord;
use crate::tail_state::normalize_path;
use crate::writer::BulkWriter;
use dashmap::DashSet;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

const DEFAULT_FLUSH_THRESHOLD: usize = 500;
const DEFAULT_FLUSH_INTERVAL_MS: u64 = 5_000;

#[derive(Debug, Clone)]
pub struct BatchOptions {
    /// Pending record count that triggers an immediate flush.
    pub flush_threshold: usize,
    pub flush_interval: Duration,
}

impl Default for BatchOptions {
    fn default() -> Self {
        Self {
            flush_threshold: DEFAULT_FLUSH_THRESHOLD,
            flush_interval: Duration::from_millis(DEFAULT_FLUSH_INTERVAL_MS),
        }
    }
}

/// Records parsed from one source file.
#[derive(Debug, Clone)]
pub struct BatchItem {
    pub source: SourceFile,
    pub records: Vec<ParsedRecord>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FlushOutcome {
    /// Nothing was queued.
    Idle,
    /// Another flush is draining the queue.
    Busy,
    Flushed {
        files: usize,
        records: usize,
        rows_written: u64,
    },
    Failed {
        files: usize,
        error: String,
    },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EnqueueOutcome {
    AlreadyQueued,
    Queued { pending_records: usize },
    Flushed(FlushOutcome),
}

#[derive(Default)]
struct Queue {
    items: Vec<BatchItem>,
    records: usize,
}

struct FlushGuard<'a>(&'a AtomicBool);

impl Drop for FlushGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

pub struct BatchAccumulator {
    name: String,
    queue: Mutex<Queue>,
    queued: DashSet<String>,
    flushing: AtomicBool,
    scheduler_started: AtomicBool,
    writer: BulkWriter,
    reclaimer: Reclaimer,
    options: BatchOptions,
}

impl BatchAccumulator {
    pub fn new(
        name: impl Into<String>,
        writer: BulkWriter,
        reclaimer: Reclaimer,
        options: BatchOptions,
    ) -> Arc<Self> {
        Arc::new(Self {
            name: name.into(),
            queue: Mutex::new(Queue::default()),
            queued: DashSet::new(),
            flushing: AtomicBool::new(false),
            scheduler_started: AtomicBool::new(false),
            writer,
            reclaimer,
            options,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Whether the file is waiting in the queue.
    pub fn is_queued(&self, path: &Path) -> bool {
        self.queued.contains(&normalize_path(path))
    }

    pub async fn pending_records(&self) -> usize {
        self.queue.lock().await.records
    }

    /// Queues a file's records, flushing immediately once the threshold is reached.
    pub async fn enqueue(&self, item: BatchItem) -> EnqueueOutcome {
        let identity = normalize_path(&item.source.path);
        if !self.queued.insert(identity) {
            return EnqueueOutcome::AlreadyQueued;
        }

        let pending_records = {
            let mut queue = self.queue.lock().await;
            queue.records += item.records.len();
            queue.items.push(item);
            queue.records
        };
        debug!(
            task = %self.name,
            pending_records,
            threshold = self.options.flush_threshold,
            "records queued"
        );

        if pending_records >= self.options.flush_threshold {
            EnqueueOutcome::Flushed(self.flush().await)
        } else {
            EnqueueOutcome::Queued { pending_records }
        }
    }

    /// Drains the queue into one write. Returns [`FlushOutcome::Busy`] if a flush is running.
    pub async fn flush(&self) -> FlushOutcome {
        if self
            .flushing
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return FlushOutcome::Busy;
        }
        let _guard = FlushGuard(&self.flushing);

        let items = {
            let mut queue = self.queue.lock().await;
            queue.records = 0;
            std::mem::take(&mut queue.items)
        };
        if items.is_empty() {
            return FlushOutcome::Idle;
        }

        let records: Vec<ParsedRecord> = items
            .iter()
            .flat_map(|item| item.records.iter().cloned())
            .collect();
        let result = self.writer.write(&records).await;

        let outcome = match result {
            Ok(report) => {
                let sources: Vec<SourceFile> =
                    items.iter().map(|item| item.source.clone()).collect();
                let reclaimed = self.reclaimer.reclaim(&sources).await;
                info!(
                    task = %self.name,
                    files = items.len(),
                    records = records.len(),
                    rows_written = report.rows_written,
                    deleted = reclaimed.deleted,
                    "batch flushed"
                );
                FlushOutcome::Flushed {
                    files: items.len(),
                    records: records.len(),
                    rows_written: report.rows_written,
                }
            }
            Err(err) => {
                warn!(
                    task = %self.name,
                    error = %err,
                    files = items.len(),
                    records = records.len(),
                    "batch flush failed; source files retained for the next trigger"
                );
                FlushOutcome::Failed {
                    files: items.len(),
                    error: err.to_string(),
                }
            }
        };

        for item in &items {
            self.queued.remove(&normalize_path(&item.source.path));
        }
        outcome
    }

    /// Starts the periodic flush task. Later calls return `None`.
    pub fn start_scheduler(self: &Arc<Self>, cancel: CancellationToken) -> Option<JoinHandle<()>> {
        if self.scheduler_started.swap(true, Ordering::AcqRel) {
            return None;
        }

        let accumulator = Arc::clone(self);
        Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(accumulator.options.flush_interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            ticker.tick().await;
            info!(
                task = %accumulator.name,
                interval_ms = accumulator.options.flush_interval.as_millis() as u64,
                "flush scheduler started"
            );

            loop {
                tokio::select! {
                    biased;
                    _ = cancel.cancelled() => {
                        info!(task = %accumulator.name, "flush scheduler stopped");
                        break;
                    }
                    _ = ticker.tick() => {
                        accumulator.flush().await;
                    }
                }
            }
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::OffsetClock;
    use crate::error::StoreError;
    use crate::reclaim::Disposition;
    use crate::record::WaferMapEvent;
    use crate::tail_state::TailStateStore;
    use crate::writer::{TableBatch, UpsertStore, WriterOptions};
    use async_trait::async_trait;
    use chrono::NaiveDate;
    use std::collections::HashSet;
    use std::path::PathBuf;
    use std::sync::atomic::AtomicUsize;

    struct CountingStore {
        calls: AtomicUsize,
        rows: AtomicUsize,
        fail: AtomicBool,
        delay: Duration,
    }

    impl CountingStore {
        fn new(delay: Duration) -> Arc<Self> {
            Arc::new(Self {
                calls: AtomicUsize::new(0),
                rows: AtomicUsize::new(0),
                fail: AtomicBool::new(false),
                delay,
            })
        }
    }

    #[async_trait]
    impl UpsertStore for CountingStore {
        async fn apply(&self, batches: &[TableBatch]) -> Result<Vec<u64>, StoreError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(self.delay).await;
            if self.fail.load(Ordering::SeqCst) {
                return Err(StoreError::Rejected("forced".into()));
            }
            let counts: Vec<u64> = batches.iter().map(|batch| batch.rows as u64).collect();
            self.rows
                .fetch_add(counts.iter().sum::<u64>() as usize, Ordering::SeqCst);
            Ok(counts)
        }

        async fn fetch_allow_list(&self) -> Result<HashSet<String>, StoreError> {
            Ok(HashSet::new())
        }
    }

    fn accumulator(store: Arc<CountingStore>, threshold: usize) -> Arc<BatchAccumulator> {
        let writer = BulkWriter::new(
            store,
            Arc::new(OffsetClock::default()),
            WriterOptions {
                timeout: Duration::from_secs(5),
                retries: 0,
                retry_delay: Duration::from_millis(1),
            },
        );
        BatchAccumulator::new(
            "wafer_map",
            writer,
            Reclaimer::new(TailStateStore::new()),
            BatchOptions {
                flush_threshold: threshold,
                flush_interval: Duration::from_millis(20),
            },
        )
    }

    fn item(path: PathBuf, events: usize) -> BatchItem {
        let datetime = NaiveDate::from_ymd_opt(2025, 1, 5)
            .unwrap()
            .and_hms_opt(0, 0, 0)
            .unwrap();
        let file_name = path.file_name().unwrap().to_string_lossy().into_owned();
        BatchItem {
            records: (0..events)
                .map(|i| {
                    ParsedRecord::WaferMap(WaferMapEvent {
                        eqpid: "EQ".into(),
                        datetime: datetime + chrono::Duration::seconds(i as i64),
                        file_name: file_name.clone(),
                        event: "UPLOAD".into(),
                        lot_id: "LOT".into(),
                        wafer_no: 1,
                    })
                })
                .collect(),
            source: SourceFile {
                path,
                disposition: Disposition::Delete,
            },
        }
    }

    fn touch(dir: &Path, name: &str) -> PathBuf {
        let path = dir.join(name);
        std::fs::write(&path, "x").unwrap();
        path
    }

    #[tokio::test]
    async fn flush_drains_queue_and_deletes_sources() {
        let dir = tempfile::tempdir().unwrap();
        let store = CountingStore::new(Duration::ZERO);
        let acc = accumulator(store.clone(), 100);
        let a = touch(dir.path(), "a.map");
        let b = touch(dir.path(), "b.map");

        assert_eq!(
            acc.enqueue(item(a.clone(), 2)).await,
            EnqueueOutcome::Queued { pending_records: 2 }
        );
        acc.enqueue(item(b.clone(), 1)).await;
        assert!(acc.is_queued(&a));

        assert_eq!(
            acc.flush().await,
            FlushOutcome::Flushed {
                files: 2,
                records: 3,
                rows_written: 3
            }
        );
        assert_eq!(store.calls.load(Ordering::SeqCst), 1);
        assert!(!a.exists() && !b.exists());
        assert!(!acc.is_queued(&a));
        assert_eq!(acc.flush().await, FlushOutcome::Idle);
    }

    #[tokio::test]
    async fn queued_file_is_not_enqueued_twice() {
        let dir = tempfile::tempdir().unwrap();
        let acc = accumulator(CountingStore::new(Duration::ZERO), 100);
        let a = touch(dir.path(), "a.map");
        acc.enqueue(item(a.clone(), 1)).await;
        assert_eq!(
            acc.enqueue(item(a.clone(), 1)).await,
            EnqueueOutcome::AlreadyQueued
        );
        assert_eq!(acc.pending_records().await, 1);
    }

    #[tokio::test]
    async fn threshold_triggers_immediate_flush() {
        let dir = tempfile::tempdir().unwrap();
        let store = CountingStore::new(Duration::ZERO);
        let acc = accumulator(store.clone(), 3);
        acc.enqueue(item(touch(dir.path(), "a.map"), 2)).await;
        let outcome = acc.enqueue(item(touch(dir.path(), "b.map"), 1)).await;
        assert!(matches!(
            outcome,
            EnqueueOutcome::Flushed(FlushOutcome::Flushed { records: 3, .. })
        ));
        assert_eq!(acc.pending_records().await, 0);
    }

    #[tokio::test]
    async fn failed_flush_keeps_files_and_clears_queue() {
        let dir = tempfile::tempdir().unwrap();
        let store = CountingStore::new(Duration::ZERO);
        store.fail.store(true, Ordering::SeqCst);
        let acc = accumulator(store.clone(), 100);
        let a = touch(dir.path(), "a.map");
        acc.enqueue(item(a.clone(), 1)).await;

        assert!(matches!(acc.flush().await, FlushOutcome::Failed { files: 1, .. }));
        assert!(a.exists());
        assert!(!acc.is_queued(&a));
        assert_eq!(acc.pending_records().await, 0);

        store.fail.store(false, Ordering::SeqCst);
        acc.enqueue(item(a.clone(), 1)).await;
        assert!(matches!(acc.flush().await, FlushOutcome::Flushed { .. }));
        assert!(!a.exists());
    }

    #[tokio::test]
    async fn concurrent_flush_observes_busy() {
        let dir = tempfile::tempdir().unwrap();
        let store = CountingStore::new(Duration::from_millis(100));
        let acc = accumulator(store.clone(), 100);
        acc.enqueue(item(touch(dir.path(), "a.map"), 1)).await;

        let (first, second) = tokio::join!(acc.flush(), async {
            tokio::time::sleep(Duration::from_millis(20)).await;
            acc.flush().await
        });
        assert!(matches!(first, FlushOutcome::Flushed { .. }));
        assert_eq!(second, FlushOutcome::Busy);
        assert_eq!(store.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn scheduler_flushes_on_interval_until_cancelled() {
        let dir = tempfile::tempdir().unwrap();
        let store = CountingStore::new(Duration::ZERO);
        let acc = accumulator(store.clone(), 100);
        let cancel = CancellationToken::new();
        let handle = acc.start_scheduler(cancel.clone()).unwrap();
        assert!(acc.start_scheduler(cancel.clone()).is_none());

        let a = touch(dir.path(), "a.map");
        acc.enqueue(item(a.clone(), 2)).await;
        for _ in 0..100 {
            if !a.exists() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(!a.exists());
        assert_eq!(store.rows.load(Ordering::SeqCst), 2);

        cancel.cancel();
        handle.await.unwrap();
    }
}
