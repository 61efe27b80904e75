use chrono::NaiveDateTime;
use lazy_static::lazy_static;
use regex::Regex;
use std::path::Path;

pub const LINE_PREVIEW_LIMIT: usize = 256;

/// Timestamp layouts seen across equipment vendors, tried in order.
const TIMESTAMP_FORMATS: &[&str] = &[
    "%Y-%m-%d %H:%M:%S%.f",
    "%Y/%m/%d %H:%M:%S%.f",
    "%d-%b-%y %H:%M:%S%.f",
    "%d-%b-%Y %H:%M:%S%.f",
    "%m/%d/%Y %H:%M:%S%.f",
    "%Y-%m-%dT%H:%M:%S%.f",
    "%Y%m%d %H%M%S",
];

lazy_static! {
    static ref WAFER_ANCHOR: Regex = Regex::new(r"^[Ww](\d{1,3})$").unwrap();
    static ref UNIT_SUFFIX: Regex = Regex::new(r"\s*[\(\[][^\)\]]*[\)\]]\s*$").unwrap();
    static ref NON_ALNUM_RUN: Regex = Regex::new(r"[^a-z0-9]+").unwrap();
}

/// Parses a single timestamp string. A comma before the fraction is accepted.
pub(crate) fn parse_timestamp(text: &str) -> Option<NaiveDateTime> {
    let text = text.trim().replace(',', ".");
    TIMESTAMP_FORMATS
        .iter()
        .find_map(|format| NaiveDateTime::parse_from_str(&text, format).ok())
}

/// Date and time arrive as separate tokens; they are joined before parsing.
pub(crate) fn parse_split_timestamp(date: &str, time: &str) -> Option<NaiveDateTime> {
    parse_timestamp(&format!("{} {}", date.trim(), time.trim()))
}

/// Parses a fixed- or floating-point token. Non-finite values are rejected.
pub(crate) fn parse_number(token: &str) -> Option<f64> {
    let token = token.trim();
    let token = token.strip_prefix('+').unwrap_or(token);
    token.parse::<f64>().ok().filter(|value| value.is_finite())
}

/// Case-folds a column header, strips a trailing unit suffix and collapses separators.
///
/// `"Thickness (um)"` and `"THICKNESS  [um]"` both become `"thickness"`;
/// `"Delta X"` becomes `"delta_x"`.
pub(crate) fn normalize_header(raw: &str) -> String {
    let without_unit = UNIT_SUFFIX.replace(raw.trim(), "");
    let folded = without_unit.to_lowercase();
    NON_ALNUM_RUN
        .replace_all(&folded, "_")
        .trim_matches('_')
        .to_string()
}

/// Maps normalized headers to column indices; duplicates keep the first occurrence.
pub(crate) fn column_index(headers: &[&str]) -> Vec<(String, usize)> {
    let mut columns: Vec<(String, usize)> = Vec::with_capacity(headers.len());
    for (idx, raw) in headers.iter().enumerate() {
        let name = normalize_header(raw);
        if name.is_empty() || columns.iter().any(|(existing, _)| *existing == name) {
            continue;
        }
        columns.push((name, idx));
    }
    columns
}

/// Lot and wafer recovered around a `W<digits>` token.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct WaferAnchor {
    pub lot_id: String,
    pub wafer_no: u32,
    pub index: usize,
}

/// Two-pass scan: find the wafer token, then derive the lot id from what precedes it.
///
/// The number of leading tokens varies, so positions are never fixed. If the token right
/// before the anchor is purely numeric it is a lot suffix and the token before that is the
/// lot base (`ABC123 01 W05` -> `ABC123.01`); otherwise the preceding token is the whole lot
/// id (`ABC123 W05` -> `ABC123`).
pub(crate) fn find_wafer_anchor(tokens: &[&str]) -> Option<WaferAnchor> {
    let (index, wafer_no) = tokens.iter().enumerate().find_map(|(idx, token)| {
        WAFER_ANCHOR
            .captures(token)
            .and_then(|caps| caps[1].parse::<u32>().ok())
            .map(|wafer| (idx, wafer))
    })?;

    let previous = index.checked_sub(1).map(|idx| tokens[idx])?;
    let is_suffix = !previous.is_empty() && previous.bytes().all(|b| b.is_ascii_digit());

    let lot_id = if is_suffix {
        match index.checked_sub(2).map(|idx| tokens[idx]) {
            Some(base) => format!("{base}.{previous}"),
            None => previous.to_string(),
        }
    } else {
        previous.to_string()
    };

    Some(WaferAnchor {
        lot_id,
        wafer_no,
        index,
    })
}

pub(crate) fn file_name(path: &Path) -> String {
    path.file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_default()
}

pub(crate) fn file_stem(path: &Path) -> String {
    path.file_stem()
        .map(|stem| stem.to_string_lossy().into_owned())
        .unwrap_or_default()
}

pub(crate) fn line_preview(line: &str, limit: usize) -> String {
    let mut preview = String::new();
    for (idx, ch) in line.chars().enumerate() {
        if idx >= limit {
            preview.push('…');
            return preview;
        }
        preview.push(ch);
    }
    preview
}
