use crate::parsers::utils::{parse_number, parse_split_timestamp};
use crate::parsers::{FileHints, Line, LineFramedParser, LineParser};
use crate::record::{FileMetadata, ParsedRecord, PrealignSample};

/// Parses prealigner telemetry: `05-Jan-25 13:45:10.250 PA X=0.0123 Y=-0.0045 T=0.0021`.
///
/// Axis values may be written `X=..` or `X:..`. A sample missing any axis, or carrying a
/// non-numeric value, is dropped without affecting its neighbours.
pub type PrealignParser = LineFramedParser<PrealignLineParser>;

#[derive(Debug, Default, Clone)]
pub struct PrealignLineParser;

impl LineParser for PrealignLineParser {
    fn parse_line(&self, line: &str, hints: &FileHints<'_>, _metadata: &FileMetadata) -> Line {
        let tokens: Vec<&str> = line.split_whitespace().collect();
        if tokens.len() < 3 {
            return Line::Malformed("too few tokens");
        }

        let Some(datetime) = parse_split_timestamp(tokens[0], tokens[1]) else {
            return Line::Malformed("invalid timestamp");
        };

        let mut x = None;
        let mut y = None;
        let mut theta = None;
        for token in &tokens[2..] {
            let Some((key, value)) = token.split_once(['=', ':']) else {
                continue;
            };
            let slot = match key.to_ascii_uppercase().as_str() {
                "X" => &mut x,
                "Y" => &mut y,
                "T" | "THETA" => &mut theta,
                _ => continue,
            };
            match parse_number(value) {
                Some(number) => *slot = Some(number),
                None => return Line::Malformed("invalid axis value"),
            }
        }

        match (x, y, theta) {
            (Some(x), Some(y), Some(theta)) => ParsedRecord::Prealign(PrealignSample {
                eqpid: hints.eqpid.to_string(),
                datetime,
                x,
                y,
                theta,
            })
            .into(),
            _ => Line::Malformed("missing axis"),
        }
    }
}
