//! Typed records produced by the format parsers.

use chrono::NaiveDateTime;
use std::fmt;

/// Storage domain of a record; selects the target relation and its conflict policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Domain {
    WaferMap,
    Prealign,
    FlatWafer,
    Spectral,
    ErrorLog,
    EquipmentInfo,
}

impl Domain {
    pub fn as_str(&self) -> &'static str {
        match self {
            Domain::WaferMap => "wafer_map",
            Domain::Prealign => "prealign",
            Domain::FlatWafer => "flat_wafer",
            Domain::Spectral => "spectral",
            Domain::ErrorLog => "error_log",
            Domain::EquipmentInfo => "equipment_info",
        }
    }
}

impl fmt::Display for Domain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A wafer map file was uploaded by the equipment.
#[derive(Debug, Clone, PartialEq)]
pub struct WaferMapEvent {
    pub eqpid: String,
    pub datetime: NaiveDateTime,
    pub file_name: String,
    pub event: String,
    pub lot_id: String,
    pub wafer_no: u32,
}

/// One prealigner position sample.
#[derive(Debug, Clone, PartialEq)]
pub struct PrealignSample {
    pub eqpid: String,
    pub datetime: NaiveDateTime,
    pub x: f64,
    pub y: f64,
    pub theta: f64,
}

/// One measurement point of a flat-wafer table. `values` holds normalized column names.
#[derive(Debug, Clone, PartialEq)]
pub struct FlatWaferRow {
    pub eqpid: String,
    pub datetime: NaiveDateTime,
    pub point: i64,
    pub values: Vec<(String, f64)>,
}

/// One spectrum of a spectral scan file.
#[derive(Debug, Clone, PartialEq)]
pub struct SpectralRow {
    pub eqpid: String,
    pub timestamp: NaiveDateTime,
    pub point: i64,
    pub class: String,
    pub kind: String,
    pub angle: f64,
    pub values: Vec<f64>,
}

impl SpectralRow {
    pub fn values_text(&self) -> String {
        self.values
            .iter()
            .map(|value| value.to_string())
            .collect::<Vec<_>>()
            .join(",")
    }

    pub fn summary(&self) -> String {
        let n = self.values.len();
        if n == 0 {
            return "n=0".to_string();
        }
        let min = self.values.iter().copied().fold(f64::INFINITY, f64::min);
        let max = self.values.iter().copied().fold(f64::NEG_INFINITY, f64::max);
        let mean = self.values.iter().sum::<f64>() / n as f64;
        format!("n={n} min={min:.6} max={max:.6} mean={mean:.6}")
    }
}

/// One equipment error log line.
#[derive(Debug, Clone, PartialEq)]
pub struct ErrorLogEntry {
    pub eqpid: String,
    pub datetime: NaiveDateTime,
    pub level: String,
    pub error_id: String,
    pub message: String,
}

impl ErrorLogEntry {
    /// Key compared against the classification allow-list.
    pub fn classification_key(&self) -> &str {
        &self.error_id
    }
}

/// Equipment identity reported by the error log; stored only when it changes.
#[derive(Debug, Clone, PartialEq)]
pub struct EquipmentInfo {
    pub eqpid: String,
    pub datetime: NaiveDateTime,
    pub model: String,
    pub sw_version: String,
}

impl EquipmentInfo {
    pub fn same_snapshot(&self, other: &EquipmentInfo) -> bool {
        self.eqpid == other.eqpid
            && self.model == other.model
            && self.sw_version == other.sw_version
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum ParsedRecord {
    WaferMap(WaferMapEvent),
    Prealign(PrealignSample),
    FlatWafer(FlatWaferRow),
    Spectral(SpectralRow),
    ErrorLog(ErrorLogEntry),
    EquipmentInfo(EquipmentInfo),
}

impl ParsedRecord {
    pub fn domain(&self) -> Domain {
        match self {
            ParsedRecord::WaferMap(_) => Domain::WaferMap,
            ParsedRecord::Prealign(_) => Domain::Prealign,
            ParsedRecord::FlatWafer(_) => Domain::FlatWafer,
            ParsedRecord::Spectral(_) => Domain::Spectral,
            ParsedRecord::ErrorLog(_) => Domain::ErrorLog,
            ParsedRecord::EquipmentInfo(_) => Domain::EquipmentInfo,
        }
    }

    pub fn eqpid(&self) -> &str {
        match self {
            ParsedRecord::WaferMap(r) => &r.eqpid,
            ParsedRecord::Prealign(r) => &r.eqpid,
            ParsedRecord::FlatWafer(r) => &r.eqpid,
            ParsedRecord::Spectral(r) => &r.eqpid,
            ParsedRecord::ErrorLog(r) => &r.eqpid,
            ParsedRecord::EquipmentInfo(r) => &r.eqpid,
        }
    }

    /// Source timestamp, before clock correction.
    pub fn timestamp(&self) -> NaiveDateTime {
        match self {
            ParsedRecord::WaferMap(r) => r.datetime,
            ParsedRecord::Prealign(r) => r.datetime,
            ParsedRecord::FlatWafer(r) => r.datetime,
            ParsedRecord::Spectral(r) => r.timestamp,
            ParsedRecord::ErrorLog(r) => r.datetime,
            ParsedRecord::EquipmentInfo(r) => r.datetime,
        }
    }
}

/// File-level metadata recovered once per file, usually from its name.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FileMetadata {
    pub captured_at: Option<NaiveDateTime>,
    pub point: Option<i64>,
    pub class: Option<String>,
}
