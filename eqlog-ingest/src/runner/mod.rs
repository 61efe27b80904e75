//! Reference host for the ingestion engine.
//!
//! Builds the store and the format plugins from configuration and drives them from directory
//! events. Real deployments embed the plugins in their own scheduler instead.

pub mod file_mode;

use crate::batcher::BatchAccumulator;
use crate::clock::OffsetClock;
use crate::config::{AgentConfig, StoreTarget};
use crate::pipeline::{FormatIngestor, IngestContext, PluginRegistry};
use crate::tail_state::TailStateStore;
use crate::writer::{BulkWriter, PgStore, SqliteStore, UpsertStore};
use anyhow::{Context, Result};
use std::sync::Arc;
use tracing::info;

/// Connects the backend named by `store.database_url`.
pub async fn build_store(config: &AgentConfig) -> Result<Arc<dyn UpsertStore>> {
    match config.store_target() {
        StoreTarget::Postgres(url) => {
            let store = PgStore::connect(
                &url,
                config.store.max_connections,
                config.writer_options().timeout,
            )
            .await
            .context("failed to connect to postgres store")?;
            info!(
                max_connections = config.store.max_connections,
                "connected to postgres store"
            );
            Ok(Arc::new(store))
        }
        StoreTarget::Sqlite(path) => {
            let store = SqliteStore::new(&path)
                .with_context(|| format!("failed to open sqlite store {}", path.display()))?;
            store
                .initialize_schema()
                .await
                .context("failed to initialize sqlite schema")?;
            info!(path = %path.display(), "opened sqlite store");
            Ok(Arc::new(store))
        }
    }
}

/// Registered plugins plus the batch queues whose schedulers the host owns.
pub struct Plugins {
    pub registry: PluginRegistry,
    pub accumulators: Vec<Arc<BatchAccumulator>>,
}

pub fn build_plugins(config: &AgentConfig, store: Arc<dyn UpsertStore>) -> Plugins {
    let writer = BulkWriter::new(store, OffsetClock::global(), config.writer_options());
    let ctx = IngestContext {
        state: TailStateStore::new(),
        writer,
        tail_options: config.tail_options(),
        batch_options: config.batch_options(),
    };

    let mut registry = PluginRegistry::new();
    let mut accumulators = Vec::new();
    for spec in config.format_specs() {
        let ingestor = Arc::new(FormatIngestor::new(spec, &ctx));
        if let Some(accumulator) = ingestor.accumulator() {
            accumulators.push(Arc::clone(accumulator));
        }
        registry.register(ingestor);
    }

    Plugins {
        registry,
        accumulators,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn builds_sqlite_store_and_one_queue_per_batched_format() {
        let dir = tempfile::tempdir().unwrap();
        let raw = format!(
            r#"
            [store]
            database_url = "sqlite://{}"

            [host]
            watch_paths = ["{}"]

            [[formats]]
            kind = "wafer_map"

            [[formats]]
            kind = "flat_wafer"

            [[formats]]
            kind = "spectral"
            file_filter = ["spc"]
            "#,
            dir.path().join("edge.db").display(),
            dir.path().display()
        );
        let config = AgentConfig::from_toml_str(&raw).unwrap();

        let store = build_store(&config).await.unwrap();
        assert!(store.fetch_allow_list().await.unwrap().is_empty());

        let plugins = build_plugins(&config, store);
        assert_eq!(plugins.registry.len(), 3);
        assert_eq!(plugins.accumulators.len(), 2);
        assert_eq!(plugins.accumulators[0].name(), "WaferMapUpload");
    }
}
