use crate::error::StoreError;
use crate::writer::sql::{
    add_column_statement, allow_list_query, delete_matching_statement, existing_columns_query,
    insert_statement, Dialect,
};
use crate::writer::{
    Column, ColumnData, ConflictPolicy, TableBatch, UpsertStore, ALLOW_LIST_COLUMN,
    ALLOW_LIST_TABLE,
};
use async_trait::async_trait;
use rusqlite::{params_from_iter, Connection};
use serde_json::Value;
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::task;
use tracing::{debug, info};

const BUSY_TIMEOUT: Duration = Duration::from_secs(5);
const TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S%.f";

const SCHEMA: &str = "
    CREATE TABLE IF NOT EXISTS wafer_map_event (
        eqpid TEXT NOT NULL,
        datetime TEXT NOT NULL,
        file_name TEXT NOT NULL,
        event TEXT,
        lot_id TEXT,
        wafer_no INTEGER,
        serv_ts TEXT,
        UNIQUE (eqpid, datetime, file_name)
    );
    CREATE TABLE IF NOT EXISTS prealign_data (
        eqpid TEXT NOT NULL,
        datetime TEXT NOT NULL,
        x REAL,
        y REAL,
        theta REAL,
        serv_ts TEXT,
        UNIQUE (eqpid, datetime)
    );
    CREATE TABLE IF NOT EXISTS flat_wafer_data (
        eqpid TEXT NOT NULL,
        datetime TEXT NOT NULL,
        point INTEGER,
        serv_ts TEXT
    );
    CREATE TABLE IF NOT EXISTS spectral_data (
        eqpid TEXT NOT NULL,
        ts TEXT NOT NULL,
        point INTEGER NOT NULL,
        class TEXT NOT NULL,
        kind TEXT NOT NULL,
        angle REAL,
        vals TEXT,
        summary TEXT,
        serv_ts TEXT,
        UNIQUE (eqpid, ts, point, class, kind)
    );
    CREATE TABLE IF NOT EXISTS error_log (
        eqpid TEXT NOT NULL,
        datetime TEXT NOT NULL,
        error_id TEXT NOT NULL,
        level TEXT,
        message TEXT,
        serv_ts TEXT,
        UNIQUE (eqpid, datetime, error_id)
    );
    CREATE TABLE IF NOT EXISTS equipment_info (
        eqpid TEXT NOT NULL,
        datetime TEXT NOT NULL,
        model TEXT,
        sw_version TEXT,
        serv_ts TEXT
    );
    CREATE TABLE IF NOT EXISTS err_reference (
        error_id TEXT PRIMARY KEY
    );
";

/// SQLite backend for edge deployments. Column arrays are bound as JSON text and expanded with
/// `json_each`, joined on the array index.
#[derive(Debug, Clone)]
pub struct SqliteStore {
    path: Arc<PathBuf>,
}

impl SqliteStore {
    pub fn new(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent().filter(|parent| !parent.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).map_err(|err| {
                StoreError::Connection(format!(
                    "failed to create store directory {}: {err}",
                    parent.display()
                ))
            })?;
        }

        open_connection(&path)?;

        Ok(Self {
            path: Arc::new(path),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Creates any missing relation this crate writes to.
    pub async fn initialize_schema(&self) -> Result<(), StoreError> {
        let path = self.path.clone();
        task::spawn_blocking(move || {
            let conn = open_connection(&path)?;
            conn.execute_batch(SCHEMA)?;
            Ok::<_, StoreError>(())
        })
        .await
        .map_err(join_error)??;
        info!(path = %self.path.display(), "sqlite schema ready");
        Ok(())
    }
}

fn join_error(err: task::JoinError) -> StoreError {
    StoreError::Rejected(format!("sqlite task failed: {err}"))
}

fn open_connection(path: &Path) -> Result<Connection, StoreError> {
    let conn = Connection::open(path)?;
    conn.pragma_update(None, "journal_mode", "WAL")?;
    conn.pragma_update(None, "synchronous", "NORMAL")?;
    conn.busy_timeout(BUSY_TIMEOUT)?;
    Ok(conn)
}

fn json_array(data: &ColumnData) -> String {
    let values: Vec<Value> = match data {
        ColumnData::Text(values) => values.iter().map(|v| Value::from(v.as_str())).collect(),
        ColumnData::Int(values) => values.iter().map(|v| Value::from(*v)).collect(),
        ColumnData::Float(values) => values
            .iter()
            .map(|v| v.map(Value::from).unwrap_or(Value::Null))
            .collect(),
        ColumnData::Timestamp(values) => values
            .iter()
            .map(|v| Value::from(v.format(TIMESTAMP_FORMAT).to_string()))
            .collect(),
    };
    Value::Array(values).to_string()
}

fn ensure_columns(conn: &Connection, batch: &TableBatch) -> Result<(), StoreError> {
    let dynamic: Vec<&Column> = batch.columns.iter().filter(|column| column.dynamic).collect();
    if dynamic.is_empty() {
        return Ok(());
    }

    let mut stmt = conn.prepare(existing_columns_query(Dialect::Sqlite))?;
    let existing: HashSet<String> = stmt
        .query_map([batch.spec.table], |row| row.get::<_, String>(0))?
        .collect::<rusqlite::Result<Vec<String>>>()?
        .into_iter()
        .map(|name| name.to_lowercase())
        .collect();

    for column in dynamic {
        if existing.contains(&column.name.to_lowercase()) {
            continue;
        }
        conn.execute(
            &add_column_statement(Dialect::Sqlite, batch.spec.table, &column.name),
            [],
        )?;
        info!(table = batch.spec.table, column = %column.name, "added measurement column");
    }
    Ok(())
}

fn apply_batch(conn: &Connection, batch: &TableBatch) -> Result<u64, StoreError> {
    if let ConflictPolicy::ReplaceMatching { key } = &batch.spec.policy {
        ensure_columns(conn, batch)?;

        let key_columns: Vec<&Column> =
            key.iter().filter_map(|name| batch.column(name)).collect();
        let removed = conn.execute(
            &delete_matching_statement(Dialect::Sqlite, batch.spec.table, &key_columns),
            params_from_iter(key_columns.iter().map(|column| json_array(&column.data))),
        )?;
        debug!(table = batch.spec.table, removed, "removed rows superseded by batch");
    }

    let changed = conn.execute(
        &insert_statement(Dialect::Sqlite, batch),
        params_from_iter(batch.columns.iter().map(|column| json_array(&column.data))),
    )?;
    Ok(changed as u64)
}

#[async_trait]
impl UpsertStore for SqliteStore {
    async fn apply(&self, batches: &[TableBatch]) -> Result<Vec<u64>, StoreError> {
        for batch in batches {
            batch.validate()?;
        }

        let path = self.path.clone();
        let batches = batches.to_vec();
        task::spawn_blocking(move || {
            let mut conn = open_connection(&path)?;
            let tx = conn.transaction()?;
            let mut counts = Vec::with_capacity(batches.len());
            for batch in &batches {
                counts.push(apply_batch(&tx, batch)?);
            }
            tx.commit()?;
            Ok::<_, StoreError>(counts)
        })
        .await
        .map_err(join_error)?
    }

    async fn fetch_allow_list(&self) -> Result<HashSet<String>, StoreError> {
        let path = self.path.clone();
        task::spawn_blocking(move || {
            let conn = open_connection(&path)?;
            let mut stmt = conn.prepare(&allow_list_query(ALLOW_LIST_TABLE, ALLOW_LIST_COLUMN))?;
            let keys = stmt
                .query_map([], |row| row.get::<_, String>(0))?
                .collect::<rusqlite::Result<HashSet<String>>>()?;
            Ok::<_, StoreError>(keys)
        })
        .await
        .map_err(join_error)?
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::OffsetClock;
    use crate::record::{EquipmentInfo, FlatWaferRow, ParsedRecord, PrealignSample, SpectralRow};
    use crate::writer::{build_batches, TableSpec};
    use chrono::{NaiveDate, NaiveDateTime};
    use tempfile::TempDir;

    fn ts(s: u32, ms: u32) -> NaiveDateTime {
        NaiveDate::from_ymd_opt(2025, 1, 5)
            .unwrap()
            .and_hms_milli_opt(13, 45, s, ms)
            .unwrap()
    }

    async fn store() -> (TempDir, SqliteStore) {
        let dir = tempfile::tempdir().unwrap();
        let store = SqliteStore::new(dir.path().join("db").join("eqlog.sqlite")).unwrap();
        store.initialize_schema().await.unwrap();
        (dir, store)
    }

    fn query_strings(store: &SqliteStore, sql: &str) -> Vec<String> {
        let conn = Connection::open(store.path()).unwrap();
        let mut stmt = conn.prepare(sql).unwrap();
        let rows = stmt
            .query_map([], |row| row.get::<_, String>(0))
            .unwrap()
            .collect::<rusqlite::Result<Vec<_>>>()
            .unwrap();
        rows
    }

    fn count(store: &SqliteStore, table: &str) -> i64 {
        let conn = Connection::open(store.path()).unwrap();
        conn.query_row(&format!("SELECT COUNT(*) FROM {table}"), [], |row| row.get(0))
            .unwrap()
    }

    fn prealign(s: u32, ms: u32, x: f64) -> ParsedRecord {
        ParsedRecord::Prealign(PrealignSample {
            eqpid: "PA-01".into(),
            datetime: ts(s, ms),
            x,
            y: 0.5,
            theta: 0.1,
        })
    }

    fn snapshot(s: u32, model: &str) -> ParsedRecord {
        ParsedRecord::EquipmentInfo(EquipmentInfo {
            eqpid: "EQ".into(),
            datetime: ts(s, 0),
            model: model.into(),
            sw_version: "4.2".into(),
        })
    }

    #[tokio::test]
    async fn duplicate_rows_are_ignored() {
        let (_dir, store) = store().await;
        let batches = build_batches(
            &[prealign(10, 250, 1.0), prealign(11, 0, 2.0)],
            &OffsetClock::new(1_000),
        );

        assert_eq!(store.apply(&batches).await.unwrap(), vec![2]);
        assert_eq!(store.apply(&batches).await.unwrap(), vec![0]);
        assert_eq!(count(&store, "prealign_data"), 2);
        assert_eq!(
            query_strings(&store, "SELECT datetime || '|' || serv_ts FROM prealign_data ORDER BY datetime"),
            vec![
                "2025-01-05 13:45:10.250|2025-01-05 13:45:11".to_string(),
                "2025-01-05 13:45:11|2025-01-05 13:45:12".to_string(),
            ]
        );
    }

    #[tokio::test]
    async fn failing_batch_rolls_back_the_whole_write() {
        let (_dir, store) = store().await;
        let mut batches = build_batches(&[prealign(10, 0, 1.0)], &OffsetClock::default());
        let mut broken = batches[0].clone();
        broken.spec = TableSpec {
            table: "no_such_table",
            policy: ConflictPolicy::IgnoreDuplicate(&[]),
        };
        batches.push(broken);

        let err = store.apply(&batches).await.unwrap_err();
        assert!(matches!(err, StoreError::Rejected(_)));
        assert_eq!(count(&store, "prealign_data"), 0);
    }

    #[tokio::test]
    async fn spectral_rows_refresh_on_conflict() {
        let (_dir, store) = store().await;
        let row = |angle: f64, values: Vec<f64>| {
            ParsedRecord::Spectral(SpectralRow {
                eqpid: "SP".into(),
                timestamp: ts(0, 0),
                point: 3,
                class: "A".into(),
                kind: "TE".into(),
                angle,
                values,
            })
        };
        let clock = OffsetClock::default();
        store
            .apply(&build_batches(&[row(65.0, vec![0.1, 0.2])], &clock))
            .await
            .unwrap();
        store
            .apply(&build_batches(&[row(70.0, vec![0.5])], &clock))
            .await
            .unwrap();

        assert_eq!(count(&store, "spectral_data"), 1);
        assert_eq!(
            query_strings(&store, "SELECT angle || '|' || vals || '|' || summary FROM spectral_data"),
            vec!["70.0|0.5|n=1 min=0.500000 max=0.500000 mean=0.500000".to_string()]
        );
    }

    #[tokio::test]
    async fn flat_wafer_batches_replace_rows_and_add_columns() {
        let (_dir, store) = store().await;
        let row = |point: i64, name: &str, value: f64| {
            ParsedRecord::FlatWafer(FlatWaferRow {
                eqpid: "FW".into(),
                datetime: ts(0, 0),
                point,
                values: vec![(name.to_string(), value)],
            })
        };
        let clock = OffsetClock::default();
        store
            .apply(&build_batches(
                &[row(1, "thk", 1.0), row(2, "thk", 1.1), row(3, "thk", 1.2)],
                &clock,
            ))
            .await
            .unwrap();
        store
            .apply(&build_batches(&[row(1, "gof", 0.9), row(2, "thk", 2.0)], &clock))
            .await
            .unwrap();

        assert_eq!(count(&store, "flat_wafer_data"), 2);
        assert_eq!(
            query_strings(
                &store,
                "SELECT point || '|' || IFNULL(thk, '-') || '|' || IFNULL(gof, '-') \
                 FROM flat_wafer_data ORDER BY point"
            ),
            vec!["1|-|0.9".to_string(), "2|2.0|-".to_string()]
        );
    }

    #[tokio::test]
    async fn equipment_info_is_stored_only_when_changed() {
        let (_dir, store) = store().await;
        let clock = OffsetClock::default();

        store
            .apply(&build_batches(&[snapshot(0, "X")], &clock))
            .await
            .unwrap();
        let unchanged = store
            .apply(&build_batches(&[snapshot(5, "X")], &clock))
            .await
            .unwrap();
        assert_eq!(unchanged, vec![0]);

        let counts = store
            .apply(&build_batches(
                &[snapshot(10, "Y"), snapshot(11, "Y"), snapshot(12, "X")],
                &clock,
            ))
            .await
            .unwrap();
        assert_eq!(counts, vec![1, 1]);
        assert_eq!(
            query_strings(&store, "SELECT model FROM equipment_info ORDER BY datetime"),
            vec!["X".to_string(), "Y".to_string(), "X".to_string()]
        );
    }

    #[tokio::test]
    async fn replayed_equipment_history_is_not_stored_again() {
        let (_dir, store) = store().await;
        let clock = OffsetClock::default();
        let history = build_batches(&[snapshot(0, "X"), snapshot(5, "Y")], &clock);

        assert_eq!(store.apply(&history).await.unwrap(), vec![1, 1]);
        assert_eq!(store.apply(&history).await.unwrap(), vec![0, 0]);
        let stale = store
            .apply(&build_batches(&[snapshot(3, "Z")], &clock))
            .await
            .unwrap();
        assert_eq!(stale, vec![0]);
        assert_eq!(
            query_strings(&store, "SELECT model FROM equipment_info ORDER BY datetime"),
            vec!["X".to_string(), "Y".to_string()]
        );
    }

    #[tokio::test]
    async fn allow_list_reads_reference_table() {
        let (_dir, store) = store().await;
        assert!(store.fetch_allow_list().await.unwrap().is_empty());

        let conn = Connection::open(store.path()).unwrap();
        conn.execute_batch("INSERT INTO err_reference (error_id) VALUES ('E1'), ('W77');")
            .unwrap();
        let keys = store.fetch_allow_list().await.unwrap();
        assert_eq!(keys, HashSet::from(["E1".to_string(), "W77".to_string()]));
    }
}
