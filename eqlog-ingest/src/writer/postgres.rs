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
use sqlx::postgres::{PgArguments, PgConnection, PgPool, PgPoolOptions};
use sqlx::query::Query;
use sqlx::Postgres;
use std::collections::HashSet;
use std::time::Duration;
use tracing::{debug, info};

/// Postgres backend. Column arrays are bound as typed arrays and expanded with `UNNEST`.
#[derive(Debug, Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub async fn connect(
        database_url: &str,
        max_connections: u32,
        acquire_timeout: Duration,
    ) -> Result<Self, StoreError> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .acquire_timeout(acquire_timeout)
            .connect(database_url)
            .await?;

        sqlx::query("SELECT 1").execute(&pool).await?;

        Ok(Self { pool })
    }

    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

fn bind_column<'q>(
    query: Query<'q, Postgres, PgArguments>,
    column: &'q Column,
) -> Query<'q, Postgres, PgArguments> {
    match &column.data {
        ColumnData::Text(values) => query.bind(values.as_slice()),
        ColumnData::Int(values) => query.bind(values.as_slice()),
        ColumnData::Float(values) => query.bind(values.as_slice()),
        ColumnData::Timestamp(values) => query.bind(values.as_slice()),
    }
}

async fn ensure_columns(conn: &mut PgConnection, batch: &TableBatch) -> Result<(), StoreError> {
    let dynamic: Vec<&Column> = batch.columns.iter().filter(|column| column.dynamic).collect();
    if dynamic.is_empty() {
        return Ok(());
    }

    let existing: HashSet<String> =
        sqlx::query_scalar::<_, String>(existing_columns_query(Dialect::Postgres))
            .bind(batch.spec.table)
            .fetch_all(&mut *conn)
            .await?
            .into_iter()
            .map(|name| name.to_lowercase())
            .collect();

    for column in dynamic {
        if existing.contains(&column.name.to_lowercase()) {
            continue;
        }
        sqlx::query(&add_column_statement(
            Dialect::Postgres,
            batch.spec.table,
            &column.name,
        ))
        .execute(&mut *conn)
        .await?;
        info!(table = batch.spec.table, column = %column.name, "added measurement column");
    }
    Ok(())
}

async fn apply_batch(conn: &mut PgConnection, batch: &TableBatch) -> Result<u64, StoreError> {
    if let ConflictPolicy::ReplaceMatching { key } = &batch.spec.policy {
        ensure_columns(conn, batch).await?;

        let key_columns: Vec<&Column> =
            key.iter().filter_map(|name| batch.column(name)).collect();
        let delete = delete_matching_statement(Dialect::Postgres, batch.spec.table, &key_columns);
        let mut query = sqlx::query(&delete);
        for column in key_columns.iter().copied() {
            query = bind_column(query, column);
        }
        let removed = query.execute(&mut *conn).await?.rows_affected();
        debug!(table = batch.spec.table, removed, "removed rows superseded by batch");
    }

    let insert = insert_statement(Dialect::Postgres, batch);
    let mut query = sqlx::query(&insert);
    for column in &batch.columns {
        query = bind_column(query, column);
    }
    Ok(query.execute(&mut *conn).await?.rows_affected())
}

#[async_trait]
impl UpsertStore for PgStore {
    async fn apply(&self, batches: &[TableBatch]) -> Result<Vec<u64>, StoreError> {
        for batch in batches {
            batch.validate()?;
        }

        let mut tx = self.pool.begin().await?;
        let mut counts = Vec::with_capacity(batches.len());
        for batch in batches {
            counts.push(apply_batch(&mut tx, batch).await?);
        }
        tx.commit().await?;
        Ok(counts)
    }

    async fn fetch_allow_list(&self) -> Result<HashSet<String>, StoreError> {
        let sql = allow_list_query(ALLOW_LIST_TABLE, ALLOW_LIST_COLUMN);
        let keys = sqlx::query_scalar::<_, String>(&sql)
            .fetch_all(&self.pool)
            .await?;
        Ok(keys.into_iter().collect())
    }
}
