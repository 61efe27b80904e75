//! Error and outcome types for the ingestion engine.
//!
//! Skip conditions (locked, unchanged, vanished files) are values of [`Outcome`], never errors.
//! Errors are reserved for whole-file parse failures and store failures.

use std::fmt;
use std::time::Duration;
use thiserror::Error;

/// Whole-file parse failure. Individual malformed records are dropped, not reported here.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ParseError {
    #[error("unparseable file name {name:?}: {reason}")]
    FileName { name: String, reason: String },

    #[error("unparseable header: {0}")]
    Header(String),
}

/// Failure reported by a relational store backend.
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("store call timed out after {0:?}")]
    Timeout(Duration),

    #[error("store connection error: {0}")]
    Connection(String),

    #[error("store rejected batch: {0}")]
    Rejected(String),

    #[error("invalid batch: {0}")]
    InvalidBatch(String),
}

impl StoreError {
    /// Transient failures are worth retrying with the same batch.
    pub fn is_transient(&self) -> bool {
        matches!(self, StoreError::Timeout(_) | StoreError::Connection(_))
    }
}

impl From<sqlx::Error> for StoreError {
    fn from(err: sqlx::Error) -> Self {
        match err {
            sqlx::Error::Io(_)
            | sqlx::Error::PoolTimedOut
            | sqlx::Error::PoolClosed
            | sqlx::Error::WorkerCrashed
            | sqlx::Error::Tls(_) => StoreError::Connection(err.to_string()),
            other => StoreError::Rejected(other.to_string()),
        }
    }
}

impl From<rusqlite::Error> for StoreError {
    fn from(err: rusqlite::Error) -> Self {
        match &err {
            rusqlite::Error::SqliteFailure(code, _)
                if matches!(
                    code.code,
                    rusqlite::ErrorCode::DatabaseBusy
                        | rusqlite::ErrorCode::DatabaseLocked
                        | rusqlite::ErrorCode::CannotOpen
                ) =>
            {
                StoreError::Connection(err.to_string())
            }
            _ => StoreError::Rejected(err.to_string()),
        }
    }
}

/// Configuration validation failure.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("configuration error: {0}")]
    Invalid(String),

    #[error("failed to read {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse configuration: {0}")]
    Toml(#[from] toml::de::Error),
}

/// Why a call returned without writing anything.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SkipReason {
    /// The file does not exist (or vanished mid-call).
    NotFound,
    /// The file could not be opened for shared reading within the retry budget.
    NotReady,
    /// Nothing was appended since the last committed offset.
    NoChange,
    /// Another trigger is processing the same file.
    InProgress,
    /// The file is already waiting in the batch queue.
    AlreadyQueued,
    /// The file could not be parsed as a whole.
    Unparseable(String),
    /// The file parsed, but yielded no records.
    Empty,
}

impl SkipReason {
    pub fn label(&self) -> &'static str {
        match self {
            SkipReason::NotFound => "not_found",
            SkipReason::NotReady => "not_ready",
            SkipReason::NoChange => "no_change",
            SkipReason::InProgress => "in_progress",
            SkipReason::AlreadyQueued => "already_queued",
            SkipReason::Unparseable(_) => "unparseable",
            SkipReason::Empty => "empty",
        }
    }
}

impl fmt::Display for SkipReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SkipReason::Unparseable(reason) => write!(f, "unparseable: {reason}"),
            other => f.write_str(other.label()),
        }
    }
}

/// Counters describing a successful ingestion call.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct IngestSummary {
    pub parsed: usize,
    pub dropped: usize,
    pub skipped_by_filter: usize,
    /// Rows reported by the store; zero when the records were only queued.
    pub rows_written: u64,
    pub queued: bool,
}

/// Result of one `process_and_upload` call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    Success(IngestSummary),
    Skip(SkipReason),
    Fail(String),
}

impl Outcome {
    pub fn is_success(&self) -> bool {
        matches!(self, Outcome::Success(_))
    }

    pub fn summary(&self) -> Option<&IngestSummary> {
        match self {
            Outcome::Success(summary) => Some(summary),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn timeouts_and_connection_errors_are_transient() {
        assert!(StoreError::Timeout(Duration::from_secs(1)).is_transient());
        assert!(StoreError::Connection("refused".into()).is_transient());
        assert!(!StoreError::Rejected("unique violation".into()).is_transient());
        assert!(!StoreError::InvalidBatch("ragged".into()).is_transient());
    }

    #[test]
    fn sqlite_busy_maps_to_connection_error() {
        let err = rusqlite::Error::SqliteFailure(
            rusqlite::ffi::Error::new(rusqlite::ffi::SQLITE_BUSY),
            None,
        );
        assert!(StoreError::from(err).is_transient());
    }

    #[test]
    fn skip_reason_display_includes_detail() {
        let reason = SkipReason::Unparseable("missing point column".into());
        assert_eq!(reason.to_string(), "unparseable: missing point column");
        assert_eq!(SkipReason::NoChange.to_string(), "no_change");
    }
}
