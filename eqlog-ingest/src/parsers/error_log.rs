use crate::parsers::utils::parse_split_timestamp;
use crate::parsers::{FileHints, Line, LineFramedParser, LineParser};
use crate::record::{EquipmentInfo, ErrorLogEntry, FileMetadata, ParsedRecord};
use lazy_static::lazy_static;
use regex::Regex;

/// Parses equipment error logs.
///
/// `2025-01-05 13:45:10,123 [ERROR] E1234 Vacuum pressure low` becomes an [`ErrorLogEntry`];
/// `2025-01-05 13:45:10 [INFO] EQINFO model=XR-200 sw=4.2.1` becomes an [`EquipmentInfo`]
/// snapshot.
pub type ErrorLogParser = LineFramedParser<ErrorLogLineParser>;

const EQUIPMENT_INFO_MARKER: &str = "EQINFO";

lazy_static! {
    static ref ERROR_LINE: Regex =
        Regex::new(r"^(\S+)\s+(\S+)\s+\[([A-Za-z]+)\]\s+(\S+)\s*(.*)$").unwrap();
}

#[derive(Debug, Default, Clone)]
pub struct ErrorLogLineParser;

fn equipment_info(body: &str, eqpid: &str, datetime: chrono::NaiveDateTime) -> Line {
    let mut model = None;
    let mut sw_version = None;
    for token in body.split_whitespace() {
        match token.split_once('=') {
            Some((key, value)) if key.eq_ignore_ascii_case("model") => {
                model = Some(value.to_string())
            }
            Some((key, value))
                if key.eq_ignore_ascii_case("sw") || key.eq_ignore_ascii_case("version") =>
            {
                sw_version = Some(value.to_string())
            }
            _ => {}
        }
    }

    match (model, sw_version) {
        (Some(model), Some(sw_version)) => ParsedRecord::EquipmentInfo(EquipmentInfo {
            eqpid: eqpid.to_string(),
            datetime,
            model,
            sw_version,
        })
        .into(),
        _ => Line::Malformed("equipment info without model and sw"),
    }
}

impl LineParser for ErrorLogLineParser {
    fn parse_line(&self, line: &str, hints: &FileHints<'_>, _metadata: &FileMetadata) -> Line {
        let Some(caps) = ERROR_LINE.captures(line) else {
            return Line::Malformed("not an error log line");
        };
        let Some(datetime) = parse_split_timestamp(&caps[1], &caps[2]) else {
            return Line::Malformed("invalid timestamp");
        };

        let level = caps[3].to_ascii_uppercase();
        let error_id = &caps[4];
        let message = caps[5].trim();

        if error_id == EQUIPMENT_INFO_MARKER {
            return equipment_info(message, hints.eqpid, datetime);
        }

        ParsedRecord::ErrorLog(ErrorLogEntry {
            eqpid: hints.eqpid.to_string(),
            datetime,
            level,
            error_id: error_id.to_string(),
            message: message.to_string(),
        })
        .into()
    }
}
