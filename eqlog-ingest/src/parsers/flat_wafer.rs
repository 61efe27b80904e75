//! Flat-wafer measurement tables.
//!
//! A table file is named `<prefix>_<yyyymmdd>_<hhmmss>.csv`; the capture time in the name is the
//! datetime of every row. The first non-empty line is the header. Measurement columns depend on
//! the recipe, so rows carry `(column, value)` pairs keyed by the normalized header.

use crate::error::ParseError;
use crate::parsers::utils::{
    column_index, line_preview, parse_number, parse_split_timestamp, LINE_PREVIEW_LIMIT,
};
use crate::parsers::{FileHints, ParseOutput, Parser};
use crate::record::{FileMetadata, FlatWaferRow, ParsedRecord};
use chrono::NaiveDateTime;
use tracing::debug;

const POINT_COLUMN: &str = "point";
/// Columns owned by the relation itself; measurements with these names are prefixed.
const RESERVED_COLUMNS: &[&str] = &["eqpid", "datetime", "point", "serv_ts"];

#[derive(Debug, Default, Clone)]
pub struct FlatWaferParser;

impl FlatWaferParser {
    fn capture_time(hints: &FileHints<'_>) -> Result<NaiveDateTime, ParseError> {
        let stem = hints.file_stem();
        let tokens: Vec<&str> = stem.split('_').collect();
        if tokens.len() < 3 {
            return Err(ParseError::FileName {
                name: hints.file_name(),
                reason: format!("expected at least 3 '_' tokens, found {}", tokens.len()),
            });
        }
        let date = tokens[tokens.len() - 2];
        let time = tokens[tokens.len() - 1];
        parse_split_timestamp(date, time).ok_or_else(|| ParseError::FileName {
            name: hints.file_name(),
            reason: format!("invalid capture time {date}_{time}"),
        })
    }
}

fn measurement_name(normalized: &str) -> String {
    if RESERVED_COLUMNS.contains(&normalized) {
        format!("m_{normalized}")
    } else {
        normalized.to_string()
    }
}

impl Parser for FlatWaferParser {
    fn parse(&self, text: &str, hints: &FileHints<'_>) -> Result<ParseOutput, ParseError> {
        let datetime = Self::capture_time(hints)?;

        let mut lines = text.lines().map(str::trim).filter(|line| !line.is_empty());
        let header = lines
            .next()
            .ok_or_else(|| ParseError::Header("file has no header line".to_string()))?;
        let delimiter = if header.contains('\t') { '\t' } else { ',' };
        let raw_headers: Vec<&str> = header.split(delimiter).collect();
        let columns = column_index(&raw_headers);

        let point_idx = columns
            .iter()
            .find(|(name, _)| name == POINT_COLUMN)
            .map(|(_, idx)| *idx)
            .ok_or_else(|| ParseError::Header(format!("missing {POINT_COLUMN} column")))?;
        let measurements: Vec<(String, usize)> = columns
            .iter()
            .filter(|(_, idx)| *idx != point_idx)
            .map(|(name, idx)| (measurement_name(name), *idx))
            .collect();

        let mut output = ParseOutput {
            metadata: FileMetadata {
                captured_at: Some(datetime),
                ..FileMetadata::default()
            },
            ..ParseOutput::default()
        };

        'rows: for line in lines {
            let cells: Vec<&str> = line.split(delimiter).map(str::trim).collect();
            let point = match cells.get(point_idx).and_then(|cell| parse_number(cell)) {
                Some(point) if point.fract() == 0.0 => point as i64,
                _ => {
                    output.dropped += 1;
                    debug!(
                        path = %hints.path.display(),
                        preview = %line_preview(line, LINE_PREVIEW_LIMIT),
                        "dropping flat-wafer row with invalid point"
                    );
                    continue;
                }
            };

            let mut values = Vec::with_capacity(measurements.len());
            for (name, idx) in &measurements {
                let cell = cells.get(*idx).copied().unwrap_or("");
                if cell.is_empty() {
                    continue;
                }
                match parse_number(cell) {
                    Some(value) => values.push((name.clone(), value)),
                    None => {
                        output.dropped += 1;
                        debug!(
                            path = %hints.path.display(),
                            column = %name,
                            point,
                            "dropping flat-wafer row with invalid numeric cell"
                        );
                        continue 'rows;
                    }
                }
            }

            output.records.push(ParsedRecord::FlatWafer(FlatWaferRow {
                eqpid: hints.eqpid.to_string(),
                datetime,
                point,
                values,
            }));
        }

        Ok(output)
    }
}
