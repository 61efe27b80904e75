//! In-process tail state: last committed byte offset per file identity.
//!
//! The store is created once per process and shared by reference with every plugin. It is
//! never persisted; a cold start re-reads files from offset zero and relies on idempotent
//! writes downstream.

use dashmap::{DashMap, DashSet};
use std::path::Path;
use std::sync::Arc;
use tracing::debug;

#[derive(Debug, Default)]
pub struct TailStateStore {
    offsets: DashMap<String, u64>,
    in_flight: DashSet<String>,
}

/// Offset to commit for a file once its records are durably written.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TailCommit {
    pub file_identity: String,
    pub offset: u64,
}

impl TailStateStore {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn get_offset(&self, file_path: &Path) -> Option<u64> {
        self.offsets
            .get(&normalize_path(file_path))
            .map(|entry| *entry.value())
    }

    pub fn commit(&self, commit: &TailCommit) {
        let previous = self
            .offsets
            .insert(commit.file_identity.clone(), commit.offset);
        debug!(
            file = %commit.file_identity,
            previous_offset = previous.unwrap_or(0),
            offset = commit.offset,
            "tail offset committed"
        );
    }

    /// Forgets a file entirely so a future file with the same name starts clean.
    pub fn remove(&self, file_path: &Path) {
        let identity = normalize_path(file_path);
        if self.offsets.remove(&identity).is_some() {
            debug!(file = %identity, "tail state purged");
        }
    }

    pub fn len(&self) -> usize {
        self.offsets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.offsets.is_empty()
    }

    /// Marks a file as being processed. Returns `None` when another call holds it.
    pub fn claim(self: &Arc<Self>, file_path: &Path) -> Option<FileClaim> {
        let identity = normalize_path(file_path);
        if self.in_flight.insert(identity.clone()) {
            Some(FileClaim {
                store: Arc::clone(self),
                identity,
            })
        } else {
            None
        }
    }
}

/// Releases the in-flight mark when dropped.
#[derive(Debug)]
pub struct FileClaim {
    store: Arc<TailStateStore>,
    identity: String,
}

impl Drop for FileClaim {
    fn drop(&mut self) {
        self.store.in_flight.remove(&self.identity);
    }
}

/// File identity used as the map key.
pub fn normalize_path(path: &Path) -> String {
    let absolute = if path.is_absolute() {
        path.to_path_buf()
    } else {
        std::env::current_dir()
            .map(|cwd| cwd.join(path))
            .unwrap_or_else(|_| path.to_path_buf())
    };
    let identity = absolute.to_string_lossy().replace('\\', "/");
    if cfg!(windows) {
        identity.to_lowercase()
    } else {
        identity
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn commit_and_remove_round_trip() {
        let store = TailStateStore::new();
        let path = Path::new("/data/prealign.log");
        assert_eq!(store.get_offset(path), None);

        store.commit(&TailCommit {
            file_identity: normalize_path(path),
            offset: 42,
        });
        assert_eq!(store.get_offset(path), Some(42));
        assert_eq!(store.len(), 1);

        store.remove(path);
        assert_eq!(store.get_offset(path), None);
        assert!(store.is_empty());
    }

    #[test]
    fn claim_is_exclusive_until_dropped() {
        let store = TailStateStore::new();
        let path = Path::new("/data/error.log");

        let claim = store.claim(path).expect("first claim succeeds");
        assert!(store.claim(path).is_none());
        assert!(store.claim(Path::new("/data/other.log")).is_some());

        drop(claim);
        assert!(store.claim(path).is_some());
    }

    #[test]
    fn relative_and_absolute_paths_share_identity() {
        let cwd = std::env::current_dir().unwrap();
        let relative = Path::new("logs/a.log");
        assert_eq!(normalize_path(relative), normalize_path(&cwd.join(relative)));
    }
}
