//! Line-framed parser abstraction.
//!
//! Most equipment formats are one record per line. `LineFramedParser` splits the text window,
//! trims line endings, skips blanks and counts malformed lines, so individual formats only
//! implement the per-line grammar in [`LineParser`].

use crate::error::ParseError;
use crate::parsers::utils::{line_preview, LINE_PREVIEW_LIMIT};
use crate::parsers::{FileHints, ParseOutput, Parser};
use crate::record::{FileMetadata, ParsedRecord};
use tracing::debug;

/// Result of parsing one line.
#[derive(Debug)]
pub enum Line {
    Records(Vec<ParsedRecord>),
    /// Comments and other lines that carry no record and are not errors.
    Ignored,
    /// The line looked like a record but a field was unusable; it is dropped.
    Malformed(&'static str),
}

impl From<ParsedRecord> for Line {
    fn from(record: ParsedRecord) -> Self {
        Line::Records(vec![record])
    }
}

/// Per-line grammar of a format.
pub trait LineParser: Send + Sync {
    /// Extracts file-level metadata (usually from the file name) once per file.
    fn file_metadata(&self, _hints: &FileHints<'_>) -> Result<FileMetadata, ParseError> {
        Ok(FileMetadata::default())
    }

    /// Parses one line; `line` has surrounding whitespace and line endings trimmed.
    fn parse_line(&self, line: &str, hints: &FileHints<'_>, metadata: &FileMetadata) -> Line;
}

/// Adapts a [`LineParser`] to the [`Parser`] trait.
#[derive(Debug, Default, Clone)]
pub struct LineFramedParser<P: LineParser> {
    inner: P,
}

impl<P: LineParser> LineFramedParser<P> {
    pub fn new(inner: P) -> Self {
        Self { inner }
    }

    pub fn inner(&self) -> &P {
        &self.inner
    }
}

impl<P: LineParser> Parser for LineFramedParser<P> {
    fn parse(&self, text: &str, hints: &FileHints<'_>) -> Result<ParseOutput, ParseError> {
        let metadata = self.inner.file_metadata(hints)?;
        let mut output = ParseOutput {
            metadata,
            ..ParseOutput::default()
        };

        for raw_line in text.lines() {
            let line = raw_line.trim();
            if line.is_empty() {
                continue;
            }

            match self.inner.parse_line(line, hints, &output.metadata) {
                Line::Records(mut records) => output.records.append(&mut records),
                Line::Ignored => {}
                Line::Malformed(reason) => {
                    output.dropped += 1;
                    debug!(
                        path = %hints.path.display(),
                        reason,
                        preview = %line_preview(line, LINE_PREVIEW_LIMIT),
                        "dropping malformed line"
                    );
                }
            }
        }

        Ok(output)
    }
}
