use crate::error::ParseError;
use crate::record::{FileMetadata, ParsedRecord};
use std::path::Path;

pub mod buffered;
pub mod error_log;
pub mod flat_wafer;
pub mod prealign;
pub mod spectral;
pub(crate) mod utils;
pub mod wafer_map;

pub use buffered::{Line, LineFramedParser, LineParser};
pub use error_log::ErrorLogParser;
pub use flat_wafer::FlatWaferParser;
pub use prealign::PrealignParser;
pub use spectral::SpectralParser;
pub use wafer_map::WaferMapParser;

/// What a parser knows about the file besides its text.
#[derive(Debug, Clone, Copy)]
pub struct FileHints<'a> {
    pub path: &'a Path,
    pub eqpid: &'a str,
}

impl<'a> FileHints<'a> {
    pub fn new(path: &'a Path, eqpid: &'a str) -> Self {
        Self { path, eqpid }
    }

    pub fn file_name(&self) -> String {
        utils::file_name(self.path)
    }

    pub fn file_stem(&self) -> String {
        utils::file_stem(self.path)
    }
}

#[derive(Debug, Default)]
pub struct ParseOutput {
    pub records: Vec<ParsedRecord>,
    pub metadata: FileMetadata,
    /// Records rejected individually (bad timestamp, bad number, missing fields).
    pub dropped: usize,
}

/// Turns a text window handed over by the tailer into typed records.
///
/// Parsers never touch the file system: the tailer owns I/O and retries, and the parser only
/// sees the appended text (or the whole file for single-shot formats). That keeps every parser
/// testable with string literals.
///
/// # Examples
///
/// ```
/// use eqlog_ingest::parsers::{FileHints, Parser, PrealignParser};
/// use std::path::Path;
///
/// let parser = PrealignParser::default();
/// let hints = FileHints::new(Path::new("prealign.log"), "PA-01");
/// let output = parser
///     .parse("05-Jan-25 13:45:10 PA X=0.10 Y=-0.02 T=0.001\n", &hints)
///     .unwrap();
/// assert_eq!(output.records.len(), 1);
/// ```
pub trait Parser: Send + Sync {
    /// Parse `text`. An `Err` means the whole file is unusable; malformed individual records
    /// are counted in [`ParseOutput::dropped`] instead.
    fn parse(&self, text: &str, hints: &FileHints<'_>) -> Result<ParseOutput, ParseError>;
}
