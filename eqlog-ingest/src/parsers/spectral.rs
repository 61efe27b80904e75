use crate::error::ParseError;
use crate::parsers::utils::{parse_number, parse_split_timestamp};
use crate::parsers::{FileHints, Line, LineFramedParser, LineParser};
use crate::record::{FileMetadata, ParsedRecord, SpectralRow};

/// Spectral scan files: `<prefix>_<yyyymmdd>_<hhmmss>_P<point>_<class>.spc`.
///
/// The capture time, point and class come from the file name and are merged into every
/// spectrum line (`<kind>,<angle>,<v1>,<v2>,…`) of the body.
pub type SpectralParser = LineFramedParser<SpectralLineParser>;

#[derive(Debug, Default, Clone)]
pub struct SpectralLineParser;

impl LineParser for SpectralLineParser {
    fn file_metadata(&self, hints: &FileHints<'_>) -> Result<FileMetadata, ParseError> {
        let stem = hints.file_stem();
        let tokens: Vec<&str> = stem.split('_').collect();
        let name_error = |reason: String| ParseError::FileName {
            name: hints.file_name(),
            reason,
        };
        if tokens.len() < 4 {
            return Err(name_error(format!(
                "expected at least 4 '_' tokens, found {}",
                tokens.len()
            )));
        }

        let n = tokens.len();
        let class = tokens[n - 1];
        let point_token = tokens[n - 2];
        let captured_at = parse_split_timestamp(tokens[n - 4], tokens[n - 3])
            .ok_or_else(|| name_error("invalid capture time".to_string()))?;
        let point = point_token
            .strip_prefix(['P', 'p'])
            .and_then(|digits| digits.parse::<i64>().ok())
            .ok_or_else(|| name_error(format!("invalid point token {point_token:?}")))?;
        if class.is_empty() {
            return Err(name_error("empty class token".to_string()));
        }

        Ok(FileMetadata {
            captured_at: Some(captured_at),
            point: Some(point),
            class: Some(class.to_string()),
        })
    }

    fn parse_line(&self, line: &str, hints: &FileHints<'_>, metadata: &FileMetadata) -> Line {
        if line.starts_with('#') {
            return Line::Ignored;
        }
        let (Some(timestamp), Some(point), Some(class)) =
            (metadata.captured_at, metadata.point, metadata.class.as_ref())
        else {
            return Line::Malformed("file metadata incomplete");
        };

        let fields: Vec<&str> = line.split(',').map(str::trim).collect();
        if fields.len() < 3 || fields[0].is_empty() {
            return Line::Malformed("expected kind, angle and at least one value");
        }
        let Some(angle) = parse_number(fields[1]) else {
            return Line::Malformed("invalid angle");
        };
        let values: Option<Vec<f64>> = fields[2..].iter().map(|field| parse_number(field)).collect();
        let Some(values) = values else {
            return Line::Malformed("invalid spectrum value");
        };

        ParsedRecord::Spectral(SpectralRow {
            eqpid: hints.eqpid.to_string(),
            timestamp,
            point,
            class: class.clone(),
            kind: fields[0].to_string(),
            angle,
            values,
        })
        .into()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parsers::Parser;
    use std::path::Path;

    #[test]
    fn merges_file_name_metadata_into_rows() {
        let parser = SpectralParser::default();
        let hints = FileHints::new(Path::new("/in/SCAN_LOT1_20250105_134510_P12_A.spc"), "SP-01");
        let output = parser
            .parse("# kind,angle,values\nTE,65.0,0.1,0.2\nTM,65.0,0.3,bad\n", &hints)
            .unwrap();

        assert_eq!(output.records.len(), 1);
        assert_eq!(output.dropped, 1);
        assert_eq!(output.metadata.point, Some(12));
        let ParsedRecord::Spectral(row) = &output.records[0] else {
            panic!("expected spectral row");
        };
        assert_eq!(row.point, 12);
        assert_eq!(row.class, "A");
        assert_eq!(row.kind, "TE");
        assert_eq!(row.values, vec![0.1, 0.2]);
        assert_eq!(row.timestamp.to_string(), "2025-01-05 13:45:10");
    }

    #[test]
    fn too_few_file_name_tokens_fail_the_file() {
        let parser = SpectralParser::default();
        let hints = FileHints::new(Path::new("20250105_134510.spc"), "SP-01");
        assert!(matches!(
            parser.parse("TE,1,2\n", &hints),
            Err(ParseError::FileName { .. })
        ));
    }

    #[test]
    fn bad_point_token_fails_the_file() {
        let parser = SpectralParser::default();
        let hints = FileHints::new(Path::new("S_20250105_134510_X1_A.spc"), "SP-01");
        assert!(parser.parse("TE,1,2\n", &hints).is_err());
    }
}
