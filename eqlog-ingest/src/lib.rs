//! Incremental ingestion and batched upsert of equipment log files.
//!
//! Files are tailed from their last committed offset, parsed per format, optionally narrowed
//! by a reference allow-list, and written to a relational store in one transaction per batch.
//! Progress (tail offsets, deletion of single-shot files) is settled only after the write
//! commits, so every record is delivered at least once and duplicates are absorbed by the
//! per-table conflict policy.

pub mod batcher;
pub mod clock;
pub mod config;
pub mod error;
pub mod filter;
pub mod metrics;
pub mod parsers;
pub mod pipeline;
pub mod reclaim;
pub mod record;
pub mod runner;
pub mod settings;
pub mod tail_state;
pub mod tailer;
pub mod watcher;
pub mod writer;

pub use error::{IngestSummary, Outcome, SkipReason, StoreError};
pub use pipeline::{FormatIngestor, FormatKind, FormatSpec, IngestPlugin, PluginRegistry};
pub use settings::SettingsSource;
