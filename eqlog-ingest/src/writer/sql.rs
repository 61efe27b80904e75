//! Statement text for the store backends.
//!
//! Only identifiers are interpolated, always double-quoted; every data value is a bound column
//! array. Placeholders are numbered in the order of the columns passed in.

use crate::writer::{Column, ColumnData, ConflictPolicy, TableBatch};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dialect {
    Postgres,
    Sqlite,
}

impl Dialect {
    fn placeholder(self, index: usize) -> String {
        match self {
            Dialect::Postgres => format!("${index}"),
            Dialect::Sqlite => format!("?{index}"),
        }
    }

    fn null_safe_eq(self, left: &str, right: &str) -> String {
        match self {
            Dialect::Postgres => format!("{left} IS NOT DISTINCT FROM {right}"),
            Dialect::Sqlite => format!("{left} IS {right}"),
        }
    }

    fn float_type(self) -> &'static str {
        match self {
            Dialect::Postgres => "DOUBLE PRECISION",
            Dialect::Sqlite => "REAL",
        }
    }

    fn array_type(self, data: &ColumnData) -> &'static str {
        match data {
            ColumnData::Text(_) => "text[]",
            ColumnData::Int(_) => "bigint[]",
            ColumnData::Float(_) => "double precision[]",
            ColumnData::Timestamp(_) => "timestamp[]",
        }
    }

    /// `FROM` clause expanding the column arrays into rows, plus one value expression per column.
    fn row_source(self, columns: &[&Column]) -> (String, Vec<String>) {
        match self {
            Dialect::Postgres => {
                let arrays: Vec<String> = columns
                    .iter()
                    .enumerate()
                    .map(|(i, column)| {
                        format!("{}::{}", self.placeholder(i + 1), self.array_type(&column.data))
                    })
                    .collect();
                let aliases: Vec<String> =
                    columns.iter().map(|column| quote_ident(&column.name)).collect();
                let exprs = aliases.iter().map(|alias| format!("src.{alias}")).collect();
                (
                    format!(
                        "FROM UNNEST({}) AS src({})",
                        arrays.join(", "),
                        aliases.join(", ")
                    ),
                    exprs,
                )
            }
            Dialect::Sqlite => {
                let mut from = String::from("FROM ");
                for i in 0..columns.len() {
                    if i == 0 {
                        from.push_str(&format!("json_each({}) AS c0", self.placeholder(1)));
                    } else {
                        from.push_str(&format!(
                            " JOIN json_each({}) AS c{i} ON c{i}.key = c0.key",
                            self.placeholder(i + 1)
                        ));
                    }
                }
                let exprs = (0..columns.len()).map(|i| format!("c{i}.value")).collect();
                (from, exprs)
            }
        }
    }
}

pub fn quote_ident(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

fn column_list(names: &[&str]) -> String {
    names
        .iter()
        .map(|name| quote_ident(name))
        .collect::<Vec<_>>()
        .join(", ")
}

/// Multi-row insert for a batch; bind every column of the batch in order.
pub fn insert_statement(dialect: Dialect, batch: &TableBatch) -> String {
    let columns: Vec<&Column> = batch.columns.iter().collect();
    let names: Vec<&str> = columns.iter().map(|column| column.name.as_str()).collect();
    let (from, exprs) = dialect.row_source(&columns);
    let table = quote_ident(batch.spec.table);
    let expr_of = |name: &str| -> String {
        names
            .iter()
            .position(|candidate| *candidate == name)
            .map(|i| exprs[i].clone())
            .unwrap_or_else(|| "NULL".to_string())
    };

    let newer_than_stored = |partition: &str, order_by: &str| -> String {
        format!(
            "NOT EXISTS (SELECT 1 FROM {table} AS later WHERE {} AND later.{} >= {})",
            dialect.null_safe_eq(
                &format!("later.{}", quote_ident(partition)),
                &expr_of(partition)
            ),
            quote_ident(order_by),
            expr_of(order_by),
        )
    };
    let condition = match &batch.spec.policy {
        ConflictPolicy::InsertIfChanged {
            partition,
            order_by,
            compare,
        } => {
            let partition_expr = expr_of(*partition);
            let mut matches = vec![
                dialect.null_safe_eq(&format!("prev.{}", quote_ident(partition)), &partition_expr),
                format!(
                    "prev.{order} = (SELECT MAX(latest.{order}) FROM {table} AS latest WHERE {})",
                    dialect.null_safe_eq(
                        &format!("latest.{}", quote_ident(partition)),
                        &partition_expr
                    ),
                    order = quote_ident(order_by),
                ),
            ];
            matches.extend(compare.iter().map(|name| {
                dialect.null_safe_eq(&format!("prev.{}", quote_ident(name)), &expr_of(*name))
            }));
            format!(
                "{} AND NOT EXISTS (SELECT 1 FROM {table} AS prev WHERE {})",
                newer_than_stored(*partition, *order_by),
                matches.join(" AND ")
            )
        }
        ConflictPolicy::AppendIfNewer {
            partition,
            order_by,
        } => newer_than_stored(*partition, *order_by),
        _ => "true".to_string(),
    };

    let conflict = match &batch.spec.policy {
        ConflictPolicy::IgnoreDuplicate(key) if key.is_empty() => {
            " ON CONFLICT DO NOTHING".to_string()
        }
        ConflictPolicy::IgnoreDuplicate(key) => {
            format!(" ON CONFLICT ({}) DO NOTHING", column_list(key))
        }
        ConflictPolicy::UpdateOnConflict { key, refresh } => {
            let assignments: Vec<String> = refresh
                .iter()
                .map(|name| {
                    let quoted = quote_ident(name);
                    format!("{quoted} = excluded.{quoted}")
                })
                .collect();
            format!(
                " ON CONFLICT ({}) DO UPDATE SET {}",
                column_list(key),
                assignments.join(", ")
            )
        }
        _ => String::new(),
    };

    format!(
        "INSERT INTO {table} ({}) SELECT {} {from} WHERE {condition}{conflict}",
        column_list(&names),
        exprs.join(", "),
    )
}

/// Deletes stored rows sharing any of the batch's key tuples; bind the key columns in order.
pub fn delete_matching_statement(dialect: Dialect, table: &str, key: &[&Column]) -> String {
    let (from, exprs) = dialect.row_source(key);
    let table = quote_ident(table);
    let matches: Vec<String> = key
        .iter()
        .zip(&exprs)
        .map(|(column, expr)| {
            dialect.null_safe_eq(&format!("{table}.{}", quote_ident(&column.name)), expr)
        })
        .collect();
    format!(
        "DELETE FROM {table} WHERE EXISTS (SELECT 1 {from} WHERE {})",
        matches.join(" AND ")
    )
}

/// Lists the relation's column names; bind the table name.
pub fn existing_columns_query(dialect: Dialect) -> &'static str {
    match dialect {
        Dialect::Postgres => {
            "SELECT column_name::text FROM information_schema.columns \
             WHERE table_schema = current_schema() AND table_name = $1"
        }
        Dialect::Sqlite => "SELECT name FROM pragma_table_info(?1)",
    }
}

pub fn add_column_statement(dialect: Dialect, table: &str, column: &str) -> String {
    let if_not_exists = match dialect {
        Dialect::Postgres => "IF NOT EXISTS ",
        Dialect::Sqlite => "",
    };
    format!(
        "ALTER TABLE {} ADD COLUMN {if_not_exists}{} {}",
        quote_ident(table),
        quote_ident(column),
        dialect.float_type()
    )
}

pub fn allow_list_query(table: &str, column: &str) -> String {
    format!(
        "SELECT {} FROM {} WHERE {} IS NOT NULL",
        quote_ident(column),
        quote_ident(table),
        quote_ident(column)
    )
}
