//! Bulk upsert writer.
//!
//! Records are grouped by domain and turned into column-oriented [`TableBatch`]es, one array per
//! column. A store backend expands the arrays server-side and inserts every row of a batch in a
//! single statement; all batches of one write share one transaction.

pub mod postgres;
pub mod sql;
pub mod sqlite;

pub use postgres::PgStore;
pub use sqlite::SqliteStore;

use crate::clock::ClockSync;
use crate::error::StoreError;
use crate::metrics::{FLUSH_DURATION, FLUSH_TOTAL, ROWS_WRITTEN_TOTAL};
use crate::record::{Domain, EquipmentInfo, ParsedRecord};
use async_trait::async_trait;
use chrono::NaiveDateTime;
use std::collections::hash_map::Entry;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::hash::Hash;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

/// Relation holding the reference error classification.
pub const ALLOW_LIST_TABLE: &str = "err_reference";
pub const ALLOW_LIST_COLUMN: &str = "error_id";

#[async_trait]
pub trait UpsertStore: Send + Sync {
    /// Applies every batch inside one transaction and returns the rows affected per batch.
    async fn apply(&self, batches: &[TableBatch]) -> Result<Vec<u64>, StoreError>;

    /// Current set of known classification keys.
    async fn fetch_allow_list(&self) -> Result<HashSet<String>, StoreError>;
}

/// How rows that already exist under the natural key are treated.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConflictPolicy {
    /// `ON CONFLICT DO NOTHING`; an empty key relies on whatever uniqueness the relation declares.
    IgnoreDuplicate(&'static [&'static str]),
    /// `ON CONFLICT (key) DO UPDATE` refreshing the listed columns.
    UpdateOnConflict {
        key: &'static [&'static str],
        refresh: &'static [&'static str],
    },
    /// Deletes stored rows sharing the batch's keys, then inserts. Dynamic columns are created.
    ReplaceMatching { key: &'static [&'static str] },
    /// Inserts a row only when it is newer than every stored row of its partition and its
    /// compare columns differ from the latest of them.
    InsertIfChanged {
        partition: &'static str,
        order_by: &'static str,
        compare: &'static [&'static str],
    },
    /// Inserts a row only when it is newer than every stored row of its partition.
    AppendIfNewer {
        partition: &'static str,
        order_by: &'static str,
    },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableSpec {
    pub table: &'static str,
    pub policy: ConflictPolicy,
}

impl TableSpec {
    pub fn for_domain(domain: Domain) -> TableSpec {
        match domain {
            Domain::WaferMap => TableSpec {
                table: "wafer_map_event",
                policy: ConflictPolicy::IgnoreDuplicate(&["eqpid", "datetime", "file_name"]),
            },
            Domain::Prealign => TableSpec {
                table: "prealign_data",
                policy: ConflictPolicy::IgnoreDuplicate(&["eqpid", "datetime"]),
            },
            Domain::FlatWafer => TableSpec {
                table: "flat_wafer_data",
                policy: ConflictPolicy::ReplaceMatching {
                    key: &["eqpid", "datetime"],
                },
            },
            Domain::Spectral => TableSpec {
                table: "spectral_data",
                policy: ConflictPolicy::UpdateOnConflict {
                    key: &["eqpid", "ts", "point", "class", "kind"],
                    refresh: &["angle", "vals", "summary", "serv_ts"],
                },
            },
            Domain::ErrorLog => TableSpec {
                table: "error_log",
                policy: ConflictPolicy::IgnoreDuplicate(&[]),
            },
            Domain::EquipmentInfo => TableSpec {
                table: "equipment_info",
                policy: ConflictPolicy::InsertIfChanged {
                    partition: "eqpid",
                    order_by: "datetime",
                    compare: &["model", "sw_version"],
                },
            },
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum ColumnData {
    Text(Vec<String>),
    Int(Vec<i64>),
    Float(Vec<Option<f64>>),
    Timestamp(Vec<NaiveDateTime>),
}

impl ColumnData {
    pub fn len(&self) -> usize {
        match self {
            ColumnData::Text(values) => values.len(),
            ColumnData::Int(values) => values.len(),
            ColumnData::Float(values) => values.len(),
            ColumnData::Timestamp(values) => values.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Column {
    pub name: String,
    pub data: ColumnData,
    /// Created on demand when missing from the relation.
    pub dynamic: bool,
}

impl Column {
    fn fixed(name: &str, data: ColumnData) -> Self {
        Self {
            name: name.to_string(),
            data,
            dynamic: false,
        }
    }
}

/// Column arrays for one relation.
#[derive(Debug, Clone, PartialEq)]
pub struct TableBatch {
    pub spec: TableSpec,
    pub columns: Vec<Column>,
    pub rows: usize,
}

impl TableBatch {
    pub fn column(&self, name: &str) -> Option<&Column> {
        self.columns.iter().find(|column| column.name == name)
    }

    /// Rejects batches whose arrays disagree in length or that miss a key column.
    pub fn validate(&self) -> Result<(), StoreError> {
        let invalid = |reason: String| {
            Err(StoreError::InvalidBatch(format!(
                "{}: {reason}",
                self.spec.table
            )))
        };
        if self.rows == 0 {
            return invalid("batch has no rows".to_string());
        }
        let mut seen = HashSet::new();
        for column in &self.columns {
            if column.name.is_empty() || !seen.insert(column.name.as_str()) {
                return invalid(format!("duplicate or empty column {:?}", column.name));
            }
            if column.data.len() != self.rows {
                return invalid(format!(
                    "column {} has {} values for {} rows",
                    column.name,
                    column.data.len(),
                    self.rows
                ));
            }
        }
        let required: Vec<&str> = match &self.spec.policy {
            ConflictPolicy::IgnoreDuplicate(key) => key.to_vec(),
            ConflictPolicy::UpdateOnConflict { key, refresh } => {
                key.iter().chain(refresh.iter()).copied().collect()
            }
            ConflictPolicy::ReplaceMatching { key } => key.to_vec(),
            ConflictPolicy::InsertIfChanged {
                partition,
                order_by,
                compare,
            } => std::iter::once(*partition)
                .chain(std::iter::once(*order_by))
                .chain(compare.iter().copied())
                .collect(),
            ConflictPolicy::AppendIfNewer {
                partition,
                order_by,
            } => vec![*partition, *order_by],
        };
        if let Some(missing) = required.iter().find(|name| self.column(name).is_none()) {
            return invalid(format!("missing key column {missing}"));
        }
        Ok(())
    }
}

fn text<'a, T: 'a>(rows: &[&'a T], f: impl Fn(&'a T) -> &'a str) -> ColumnData {
    ColumnData::Text(rows.iter().map(|row| f(*row).to_string()).collect())
}

fn timestamps<'a, T: 'a>(rows: &[&'a T], f: impl Fn(&'a T) -> NaiveDateTime) -> ColumnData {
    ColumnData::Timestamp(rows.iter().map(|row| f(*row)).collect())
}

fn floats<'a, T: 'a>(rows: &[&'a T], f: impl Fn(&'a T) -> f64) -> ColumnData {
    ColumnData::Float(rows.iter().map(|row| Some(f(*row))).collect())
}

fn ints<'a, T: 'a>(rows: &[&'a T], f: impl Fn(&'a T) -> i64) -> ColumnData {
    ColumnData::Int(rows.iter().map(|row| f(*row)).collect())
}

fn serv_ts<'a, T: 'a>(
    rows: &[&'a T],
    clock: &dyn ClockSync,
    f: impl Fn(&'a T) -> NaiveDateTime,
) -> ColumnData {
    ColumnData::Timestamp(
        rows.iter()
            .map(|row| clock.to_synchronized_wall_clock(f(*row)))
            .collect(),
    )
}

fn batch(domain: Domain, rows: usize, columns: Vec<Column>) -> TableBatch {
    TableBatch {
        spec: TableSpec::for_domain(domain),
        columns,
        rows,
    }
}

/// Keeps one row per key: the last one seen, at the position where its key first appeared.
/// A single `ON CONFLICT DO UPDATE` statement may not touch the same key twice.
fn last_per_key<'a, T, K>(rows: Vec<&'a T>, key: impl Fn(&'a T) -> K) -> Vec<&'a T>
where
    K: Eq + Hash,
{
    let mut position: HashMap<K, usize> = HashMap::new();
    let mut kept: Vec<&'a T> = Vec::with_capacity(rows.len());
    for row in rows {
        match position.entry(key(row)) {
            Entry::Occupied(slot) => kept[*slot.get()] = row,
            Entry::Vacant(slot) => {
                slot.insert(kept.len());
                kept.push(row);
            }
        }
    }
    kept
}

/// Splits equipment snapshots into the first snapshot per equipment, inserted only when it
/// differs from the stored history, and the later in-batch changes. Consecutive identical
/// snapshots of the same equipment collapse to the first.
fn split_snapshots<'a>(
    snapshots: &[&'a EquipmentInfo],
) -> (Vec<&'a EquipmentInfo>, Vec<&'a EquipmentInfo>) {
    let mut last: HashMap<&str, &EquipmentInfo> = HashMap::new();
    let mut first = Vec::new();
    let mut changes = Vec::new();
    for snapshot in snapshots {
        match last.get(snapshot.eqpid.as_str()) {
            None => first.push(*snapshot),
            Some(previous) if previous.same_snapshot(snapshot) => continue,
            Some(_) => changes.push(*snapshot),
        }
        last.insert(snapshot.eqpid.as_str(), *snapshot);
    }
    (first, changes)
}

fn equipment_columns(rows: &[&EquipmentInfo], clock: &dyn ClockSync) -> Vec<Column> {
    vec![
        Column::fixed("eqpid", text(rows, |r| &r.eqpid)),
        Column::fixed("datetime", timestamps(rows, |r| r.datetime)),
        Column::fixed("model", text(rows, |r| &r.model)),
        Column::fixed("sw_version", text(rows, |r| &r.sw_version)),
        Column::fixed("serv_ts", serv_ts(rows, clock, |r| r.datetime)),
    ]
}

/// Converts records into table batches. `serv_ts` is computed here, once per record.
pub fn build_batches(records: &[ParsedRecord], clock: &dyn ClockSync) -> Vec<TableBatch> {
    let mut by_domain: BTreeMap<Domain, Vec<&ParsedRecord>> = BTreeMap::new();
    for record in records {
        by_domain.entry(record.domain()).or_default().push(record);
    }

    let mut batches = Vec::new();
    for (domain, group) in by_domain {
        match domain {
            Domain::WaferMap => {
                let rows: Vec<_> = group
                    .iter()
                    .filter_map(|r| match r {
                        ParsedRecord::WaferMap(row) => Some(row),
                        _ => None,
                    })
                    .collect();
                batches.push(batch(
                    domain,
                    rows.len(),
                    vec![
                        Column::fixed("eqpid", text(&rows, |r| &r.eqpid)),
                        Column::fixed("datetime", timestamps(&rows, |r| r.datetime)),
                        Column::fixed("file_name", text(&rows, |r| &r.file_name)),
                        Column::fixed("event", text(&rows, |r| &r.event)),
                        Column::fixed("lot_id", text(&rows, |r| &r.lot_id)),
                        Column::fixed("wafer_no", ints(&rows, |r| i64::from(r.wafer_no))),
                        Column::fixed("serv_ts", serv_ts(&rows, clock, |r| r.datetime)),
                    ],
                ));
            }
            Domain::Prealign => {
                let rows: Vec<_> = group
                    .iter()
                    .filter_map(|r| match r {
                        ParsedRecord::Prealign(row) => Some(row),
                        _ => None,
                    })
                    .collect();
                batches.push(batch(
                    domain,
                    rows.len(),
                    vec![
                        Column::fixed("eqpid", text(&rows, |r| &r.eqpid)),
                        Column::fixed("datetime", timestamps(&rows, |r| r.datetime)),
                        Column::fixed("x", floats(&rows, |r| r.x)),
                        Column::fixed("y", floats(&rows, |r| r.y)),
                        Column::fixed("theta", floats(&rows, |r| r.theta)),
                        Column::fixed("serv_ts", serv_ts(&rows, clock, |r| r.datetime)),
                    ],
                ));
            }
            Domain::FlatWafer => {
                let rows: Vec<_> = group
                    .iter()
                    .filter_map(|r| match r {
                        ParsedRecord::FlatWafer(row) => Some(row),
                        _ => None,
                    })
                    .collect();
                let mut columns = vec![
                    Column::fixed("eqpid", text(&rows, |r| &r.eqpid)),
                    Column::fixed("datetime", timestamps(&rows, |r| r.datetime)),
                    Column::fixed("point", ints(&rows, |r| r.point)),
                    Column::fixed("serv_ts", serv_ts(&rows, clock, |r| r.datetime)),
                ];
                let mut measurement_names: Vec<&str> = Vec::new();
                for row in &rows {
                    for (name, _) in &row.values {
                        if !measurement_names.contains(&name.as_str()) {
                            measurement_names.push(name);
                        }
                    }
                }
                for name in measurement_names {
                    let values = rows
                        .iter()
                        .map(|row| {
                            row.values
                                .iter()
                                .find(|(column, _)| column == name)
                                .map(|(_, value)| *value)
                        })
                        .collect();
                    columns.push(Column {
                        name: name.to_string(),
                        data: ColumnData::Float(values),
                        dynamic: true,
                    });
                }
                batches.push(batch(domain, rows.len(), columns));
            }
            Domain::Spectral => {
                let rows: Vec<_> = group
                    .iter()
                    .filter_map(|r| match r {
                        ParsedRecord::Spectral(row) => Some(row),
                        _ => None,
                    })
                    .collect();
                let rows = last_per_key(rows, |r| {
                    (
                        r.eqpid.as_str(),
                        r.timestamp,
                        r.point,
                        r.class.as_str(),
                        r.kind.as_str(),
                    )
                });
                batches.push(batch(
                    domain,
                    rows.len(),
                    vec![
                        Column::fixed("eqpid", text(&rows, |r| &r.eqpid)),
                        Column::fixed("ts", timestamps(&rows, |r| r.timestamp)),
                        Column::fixed("point", ints(&rows, |r| r.point)),
                        Column::fixed("class", text(&rows, |r| &r.class)),
                        Column::fixed("kind", text(&rows, |r| &r.kind)),
                        Column::fixed("angle", floats(&rows, |r| r.angle)),
                        Column::fixed(
                            "vals",
                            ColumnData::Text(rows.iter().map(|r| r.values_text()).collect()),
                        ),
                        Column::fixed(
                            "summary",
                            ColumnData::Text(rows.iter().map(|r| r.summary()).collect()),
                        ),
                        Column::fixed("serv_ts", serv_ts(&rows, clock, |r| r.timestamp)),
                    ],
                ));
            }
            Domain::ErrorLog => {
                let rows: Vec<_> = group
                    .iter()
                    .filter_map(|r| match r {
                        ParsedRecord::ErrorLog(row) => Some(row),
                        _ => None,
                    })
                    .collect();
                batches.push(batch(
                    domain,
                    rows.len(),
                    vec![
                        Column::fixed("eqpid", text(&rows, |r| &r.eqpid)),
                        Column::fixed("datetime", timestamps(&rows, |r| r.datetime)),
                        Column::fixed("error_id", text(&rows, |r| &r.error_id)),
                        Column::fixed("level", text(&rows, |r| &r.level)),
                        Column::fixed("message", text(&rows, |r| &r.message)),
                        Column::fixed("serv_ts", serv_ts(&rows, clock, |r| r.datetime)),
                    ],
                ));
            }
            Domain::EquipmentInfo => {
                let snapshots: Vec<_> = group
                    .iter()
                    .filter_map(|r| match r {
                        ParsedRecord::EquipmentInfo(row) => Some(row),
                        _ => None,
                    })
                    .collect();
                let (first, changes) = split_snapshots(&snapshots);
                batches.push(batch(domain, first.len(), equipment_columns(&first, clock)));
                if !changes.is_empty() {
                    let mut appended =
                        batch(domain, changes.len(), equipment_columns(&changes, clock));
                    appended.spec.policy = ConflictPolicy::AppendIfNewer {
                        partition: "eqpid",
                        order_by: "datetime",
                    };
                    batches.push(appended);
                }
            }
        }
    }
    batches
}

#[derive(Debug, Clone)]
pub struct WriterOptions {
    pub timeout: Duration,
    pub retries: u32,
    pub retry_delay: Duration,
}

impl Default for WriterOptions {
    fn default() -> Self {
        Self {
            timeout: Duration::from_millis(10_000),
            retries: 2,
            retry_delay: Duration::from_millis(500),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WriteReport {
    pub rows_written: u64,
    pub per_table: Vec<(&'static str, u64)>,
}

/// Writes record batches through an [`UpsertStore`] with a bounded timeout and fixed-delay
/// retries of transient failures.
#[derive(Clone)]
pub struct BulkWriter {
    store: Arc<dyn UpsertStore>,
    clock: Arc<dyn ClockSync>,
    options: WriterOptions,
}

impl BulkWriter {
    pub fn new(
        store: Arc<dyn UpsertStore>,
        clock: Arc<dyn ClockSync>,
        options: WriterOptions,
    ) -> Self {
        Self {
            store,
            clock,
            options,
        }
    }

    pub fn store(&self) -> &Arc<dyn UpsertStore> {
        &self.store
    }

    pub async fn write(&self, records: &[ParsedRecord]) -> Result<WriteReport, StoreError> {
        if records.is_empty() {
            return Ok(WriteReport::default());
        }

        let batches = build_batches(records, self.clock.as_ref());
        let started = Instant::now();
        let mut attempt = 0u32;
        let result = loop {
            let outcome = match tokio::time::timeout(
                self.options.timeout,
                self.store.apply(&batches),
            )
            .await
            {
                Ok(result) => result,
                Err(_) => Err(StoreError::Timeout(self.options.timeout)),
            };

            match outcome {
                Err(err) if err.is_transient() && attempt < self.options.retries => {
                    attempt += 1;
                    warn!(
                        error = %err,
                        attempt,
                        retries = self.options.retries,
                        "transient store failure; retrying batch"
                    );
                    tokio::time::sleep(self.options.retry_delay).await;
                }
                other => break other,
            }
        };
        FLUSH_DURATION.observe(started.elapsed().as_secs_f64());

        match result {
            Ok(counts) => {
                FLUSH_TOTAL.with_label_values(&["success"]).inc();
                let per_table: Vec<(&'static str, u64)> = batches
                    .iter()
                    .zip(counts)
                    .map(|(batch, count)| (batch.spec.table, count))
                    .collect();
                for (table, count) in &per_table {
                    ROWS_WRITTEN_TOTAL.with_label_values(&[*table]).inc_by(*count);
                }
                let report = WriteReport {
                    rows_written: per_table.iter().map(|(_, count)| count).sum(),
                    per_table,
                };
                debug!(
                    records = records.len(),
                    rows_written = report.rows_written,
                    "batch committed"
                );
                Ok(report)
            }
            Err(err) => {
                FLUSH_TOTAL.with_label_values(&["failure"]).inc();
                Err(err)
            }
        }
    }
}
