//! Offset-tracked tailer.
//!
//! Each call compares the file's current length with the last committed offset and returns the
//! bytes appended since then. The tailer never commits progress itself: the caller commits the
//! returned [`TailCommit`] once the records read from the chunk are durably written.

use crate::error::SkipReason;
use crate::tail_state::{normalize_path, TailCommit, TailStateStore};
use serde::Deserialize;
use std::io::ErrorKind;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::fs;
use tokio::io::{AsyncReadExt, AsyncSeekExt};
use tokio::time::sleep;
use tracing::{debug, warn};

const DEFAULT_OPEN_RETRIES: u32 = 3;
const DEFAULT_RETRY_DELAY_MS: u64 = 200;

/// Byte encoding of a source format.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TextEncoding {
    /// Invalid sequences are replaced rather than rejected.
    #[default]
    Utf8,
    Latin1,
}

impl TextEncoding {
    pub fn decode(self, bytes: &[u8]) -> String {
        match self {
            TextEncoding::Utf8 => String::from_utf8_lossy(bytes).into_owned(),
            TextEncoding::Latin1 => bytes.iter().map(|&byte| char::from(byte)).collect(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct TailOptions {
    /// Extra open attempts after the first one fails.
    pub open_retries: u32,
    pub retry_delay: Duration,
    /// Read the whole file on every call instead of resuming from the committed offset.
    pub single_shot: bool,
    pub encoding: TextEncoding,
}

impl Default for TailOptions {
    fn default() -> Self {
        Self {
            open_retries: DEFAULT_OPEN_RETRIES,
            retry_delay: Duration::from_millis(DEFAULT_RETRY_DELAY_MS),
            single_shot: false,
            encoding: TextEncoding::Utf8,
        }
    }
}

/// Text read by one call, with the offset to commit after a successful write.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TailChunk {
    pub text: String,
    pub start_offset: u64,
    pub file_len: u64,
    pub truncated: bool,
    pub commit: TailCommit,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TailRead {
    Chunk(TailChunk),
    Skip(SkipReason),
}

pub struct Tailer {
    state: Arc<TailStateStore>,
    options: TailOptions,
}

impl Tailer {
    pub fn new(state: Arc<TailStateStore>, options: TailOptions) -> Self {
        Self { state, options }
    }

    pub fn state(&self) -> &Arc<TailStateStore> {
        &self.state
    }

    pub fn options(&self) -> &TailOptions {
        &self.options
    }

    async fn open_shared(&self, path: &Path) -> Result<fs::File, SkipReason> {
        let mut attempt = 0u32;
        loop {
            match fs::File::open(path).await {
                Ok(file) => return Ok(file),
                Err(err) if err.kind() == ErrorKind::NotFound => return Err(SkipReason::NotFound),
                Err(err) if attempt < self.options.open_retries => {
                    attempt += 1;
                    debug!(
                        error = %err,
                        path = %path.display(),
                        attempt,
                        "file not readable yet; retrying open"
                    );
                    sleep(self.options.retry_delay).await;
                }
                Err(err) => {
                    warn!(
                        error = %err,
                        path = %path.display(),
                        attempts = attempt + 1,
                        "file could not be opened for shared reading"
                    );
                    return Err(SkipReason::NotReady);
                }
            }
        }
    }

    pub async fn tail(&self, path: &Path) -> TailRead {
        let mut file = match self.open_shared(path).await {
            Ok(file) => file,
            Err(SkipReason::NotFound) => {
                self.state.remove(path);
                debug!(path = %path.display(), "file not found; tail state purged");
                return TailRead::Skip(SkipReason::NotFound);
            }
            Err(reason) => return TailRead::Skip(reason),
        };

        let file_len = match file.metadata().await {
            Ok(metadata) => metadata.len(),
            Err(err) => {
                warn!(error = %err, path = %path.display(), "file metadata unavailable");
                return TailRead::Skip(SkipReason::NotReady);
            }
        };

        let last_offset = if self.options.single_shot {
            0
        } else {
            self.state.get_offset(path).unwrap_or(0)
        };
        if file_len == last_offset && last_offset > 0 {
            return TailRead::Skip(SkipReason::NoChange);
        }

        let truncated = file_len < last_offset;
        if truncated {
            warn!(
                path = %path.display(),
                previous_offset = last_offset,
                current_size = file_len,
                "file truncated or rotated; reading from start"
            );
        }
        let start_offset = if truncated { 0 } else { last_offset };

        let mut buffer = Vec::with_capacity(file_len.saturating_sub(start_offset) as usize);
        let read = async {
            file.seek(std::io::SeekFrom::Start(start_offset)).await?;
            file.read_to_end(&mut buffer).await
        };
        if let Err(err) = read.await {
            if err.kind() == ErrorKind::NotFound {
                self.state.remove(path);
                return TailRead::Skip(SkipReason::NotFound);
            }
            warn!(
                error = %err,
                path = %path.display(),
                offset = start_offset,
                "failed to read appended bytes"
            );
            return TailRead::Skip(SkipReason::NotReady);
        }

        // A trailing line without its newline is still being written; leave it for next time.
        let consumed = if self.options.single_shot {
            buffer.len()
        } else {
            buffer
                .iter()
                .rposition(|&byte| byte == b'\n')
                .map(|index| index + 1)
                .unwrap_or(0)
        };
        if consumed < buffer.len() {
            debug!(
                path = %path.display(),
                pending_bytes = buffer.len() - consumed,
                "partial trailing line left unread"
            );
        }

        let text = self.options.encoding.decode(&buffer[..consumed]);
        let commit = TailCommit {
            file_identity: normalize_path(path),
            offset: start_offset + consumed as u64,
        };
        debug!(
            path = %path.display(),
            start_offset,
            bytes = consumed,
            file_len,
            "read appended text"
        );

        TailRead::Chunk(TailChunk {
            text,
            start_offset,
            file_len,
            truncated,
            commit,
        })
    }
}
