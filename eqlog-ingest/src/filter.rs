//! Allow-list filter for error log entries.
//!
//! The allow-list is the set of error ids present in the reference classification table. It is
//! fetched on every call so rule changes apply immediately. An empty or unavailable allow-list
//! rejects every entry; the caller still advances the tail offset.

use crate::record::ParsedRecord;
use crate::writer::UpsertStore;
use std::collections::HashSet;
use tracing::{debug, warn};

/// Normalized classification keys.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AllowSet {
    keys: HashSet<String>,
}

impl AllowSet {
    pub fn new<I, S>(keys: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        Self {
            keys: keys
                .into_iter()
                .map(|key| normalize_key(key.as_ref()))
                .filter(|key| !key.is_empty())
                .collect(),
        }
    }

    pub fn contains(&self, key: &str) -> bool {
        self.keys.contains(&normalize_key(key))
    }

    pub fn len(&self) -> usize {
        self.keys.len()
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }
}

fn normalize_key(key: &str) -> String {
    key.trim().to_lowercase()
}

#[derive(Debug, Default)]
pub struct FilterResult {
    pub kept: Vec<ParsedRecord>,
    pub matched: usize,
    pub skipped: usize,
}

/// Narrows error log entries to those whose error id is in `allow`. Other record kinds pass
/// through untouched and are not counted, unless the allow-list is empty: then nothing is kept.
pub fn filter_records(records: Vec<ParsedRecord>, allow: &AllowSet) -> FilterResult {
    let mut result = FilterResult::default();
    if allow.is_empty() {
        result.skipped = records
            .iter()
            .filter(|record| matches!(record, ParsedRecord::ErrorLog(_)))
            .count();
        return result;
    }
    for record in records {
        match &record {
            ParsedRecord::ErrorLog(entry) => {
                if allow.contains(entry.classification_key()) {
                    result.matched += 1;
                    result.kept.push(record);
                } else {
                    result.skipped += 1;
                }
            }
            _ => result.kept.push(record),
        }
    }
    result
}

/// Loads the current allow-list; failures are logged and produce an empty set.
pub async fn load_allow_set(store: &dyn UpsertStore) -> AllowSet {
    match store.fetch_allow_list().await {
        Ok(keys) => {
            let allow = AllowSet::new(keys);
            if allow.is_empty() {
                warn!("classification allow-list is empty; rejecting all error entries");
            } else {
                debug!(size = allow.len(), "classification allow-list loaded");
            }
            allow
        }
        Err(err) => {
            warn!(error = %err, "classification allow-list unavailable; rejecting all error entries");
            AllowSet::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::{EquipmentInfo, ErrorLogEntry};
    use chrono::NaiveDate;

    fn entry(error_id: &str) -> ParsedRecord {
        ParsedRecord::ErrorLog(ErrorLogEntry {
            eqpid: "EQ".into(),
            datetime: NaiveDate::from_ymd_opt(2025, 1, 5)
                .unwrap()
                .and_hms_opt(0, 0, 0)
                .unwrap(),
            level: "ERROR".into(),
            error_id: error_id.into(),
            message: String::new(),
        })
    }

    #[test]
    fn comparison_ignores_case_and_surrounding_whitespace() {
        let allow = AllowSet::new([" e1234 ", "W77"]);
        let result = filter_records(vec![entry("E1234"), entry("w77 "), entry("E9")], &allow);
        assert_eq!(result.matched, 2);
        assert_eq!(result.skipped, 1);
        assert_eq!(result.kept.len(), 2);
    }

    #[test]
    fn empty_allow_set_rejects_every_entry() {
        let result = filter_records(vec![entry("E1"), entry("E2")], &AllowSet::default());
        assert_eq!(result.matched, 0);
        assert_eq!(result.skipped, 2);
        assert!(result.kept.is_empty());
    }

    #[test]
    fn non_error_records_pass_through() {
        let info = ParsedRecord::EquipmentInfo(EquipmentInfo {
            eqpid: "EQ".into(),
            datetime: NaiveDate::from_ymd_opt(2025, 1, 5)
                .unwrap()
                .and_hms_opt(0, 0, 0)
                .unwrap(),
            model: "XR".into(),
            sw_version: "1".into(),
        });
        let allow = AllowSet::new(["E1"]);
        let result = filter_records(vec![info.clone(), entry("E2")], &allow);
        assert_eq!(result.kept, vec![info.clone()]);
        assert_eq!(result.skipped, 1);

        let result = filter_records(vec![info], &AllowSet::default());
        assert!(result.kept.is_empty());
    }
}
