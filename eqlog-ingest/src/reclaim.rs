//! Post-flush reclaimer: settles source files once their records are durably written.

use crate::tail_state::{TailCommit, TailStateStore};
use std::io::ErrorKind;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::fs;
use tracing::{debug, warn};

/// What happens to a source file after a successful write.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Disposition {
    /// Single-shot file; removed from disk.
    Delete,
    /// Append log; kept on disk, tail offset advanced.
    CommitOffset(TailCommit),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceFile {
    pub path: PathBuf,
    pub disposition: Disposition,
}

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ReclaimReport {
    pub deleted: usize,
    pub delete_failures: usize,
    pub committed: usize,
}

#[derive(Clone)]
pub struct Reclaimer {
    state: Arc<TailStateStore>,
}

impl Reclaimer {
    pub fn new(state: Arc<TailStateStore>) -> Self {
        Self { state }
    }

    /// Call only after the write covering `sources` has committed. A failed deletion is logged
    /// and otherwise ignored: the file is re-ingested later and the duplicate write suppressed.
    pub async fn reclaim(&self, sources: &[SourceFile]) -> ReclaimReport {
        let mut report = ReclaimReport::default();
        for source in sources {
            match &source.disposition {
                Disposition::Delete => match fs::remove_file(&source.path).await {
                    Ok(()) => {
                        self.state.remove(&source.path);
                        report.deleted += 1;
                        debug!(path = %source.path.display(), "uploaded file deleted");
                    }
                    Err(err) if err.kind() == ErrorKind::NotFound => {
                        self.state.remove(&source.path);
                        debug!(path = %source.path.display(), "uploaded file already gone");
                    }
                    Err(err) => {
                        report.delete_failures += 1;
                        warn!(
                            error = %err,
                            path = %source.path.display(),
                            "failed to delete uploaded file; it will be re-ingested"
                        );
                    }
                },
                Disposition::CommitOffset(commit) => {
                    self.state.commit(commit);
                    report.committed += 1;
                }
            }
        }
        report
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tail_state::normalize_path;

    #[tokio::test]
    async fn deletes_disposable_files_and_commits_append_logs() {
        let dir = tempfile::tempdir().unwrap();
        let map = dir.path().join("LOT1.map");
        let log = dir.path().join("error.log");
        std::fs::write(&map, "x").unwrap();
        std::fs::write(&log, "line\n").unwrap();

        let state = TailStateStore::new();
        let reclaimer = Reclaimer::new(state.clone());
        let sources = vec![
            SourceFile {
                path: map.clone(),
                disposition: Disposition::Delete,
            },
            SourceFile {
                path: log.clone(),
                disposition: Disposition::CommitOffset(TailCommit {
                    file_identity: normalize_path(&log),
                    offset: 5,
                }),
            },
        ];

        let report = reclaimer.reclaim(&sources).await;
        assert_eq!(
            report,
            ReclaimReport {
                deleted: 1,
                delete_failures: 0,
                committed: 1
            }
        );
        assert!(!map.exists());
        assert!(log.exists());
        assert_eq!(state.get_offset(&log), Some(5));
    }

    #[tokio::test]
    async fn deletion_failure_is_not_fatal() {
        let dir = tempfile::tempdir().unwrap();
        let nested = dir.path().join("not-a-file");
        std::fs::create_dir(&nested).unwrap();

        let reclaimer = Reclaimer::new(TailStateStore::new());
        let report = reclaimer
            .reclaim(&[SourceFile {
                path: nested.clone(),
                disposition: Disposition::Delete,
            }])
            .await;
        assert_eq!(report.delete_failures, 1);
        assert!(nested.exists());
    }
}
