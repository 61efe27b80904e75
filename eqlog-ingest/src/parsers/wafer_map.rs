use crate::parsers::utils::{find_wafer_anchor, parse_split_timestamp};
use crate::parsers::{FileHints, Line, LineFramedParser, LineParser};
use crate::record::{FileMetadata, ParsedRecord, WaferMapEvent};

/// Converts wafer map upload descriptors into `wafer_map_event` rows.
///
/// Each descriptor line reads `<date> <time> <event> <token>… W<nn> [<token>…]`. The number of
/// tokens between the event and the wafer token depends on the recipe, so the lot id is found
/// relative to the wafer token rather than at a fixed position.
pub type WaferMapParser = LineFramedParser<WaferMapLineParser>;

#[derive(Debug, Default, Clone)]
pub struct WaferMapLineParser;

impl LineParser for WaferMapLineParser {
    fn parse_line(&self, line: &str, hints: &FileHints<'_>, _metadata: &FileMetadata) -> Line {
        let tokens: Vec<&str> = line.split_whitespace().collect();
        if tokens.len() < 5 {
            return Line::Malformed("too few tokens");
        }

        let Some(datetime) = parse_split_timestamp(tokens[0], tokens[1]) else {
            return Line::Malformed("invalid timestamp");
        };

        let event = tokens[2];
        let Some(anchor) = find_wafer_anchor(&tokens[3..]) else {
            return Line::Malformed("no wafer token");
        };

        ParsedRecord::WaferMap(WaferMapEvent {
            eqpid: hints.eqpid.to_string(),
            datetime,
            file_name: hints.file_name(),
            event: event.to_string(),
            lot_id: anchor.lot_id,
            wafer_no: anchor.wafer_no,
        })
        .into()
    }
}
