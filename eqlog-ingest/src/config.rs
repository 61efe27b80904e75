use crate::batcher::BatchOptions;
use crate::error::ConfigError;
use crate::pipeline::{FormatKind, FormatSpec};
use crate::settings::{Settings, SettingsSource};
use crate::tailer::{TailOptions, TextEncoding};
use crate::writer::WriterOptions;
use serde::Deserialize;
use std::collections::{HashMap, HashSet};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Path of the agent configuration file.
pub const CONFIG_PATH_ENV: &str = "EQLOG_AGENT_CONFIG";
/// Overrides `store.database_url` so credentials stay out of the file.
pub const DATABASE_URL_ENV: &str = "EQLOG_DATABASE_URL";
pub const DEFAULT_CONFIG_PATH: &str = "config.toml";

#[derive(Debug, Deserialize, Clone)]
pub struct AgentConfig {
    pub store: StoreConfig,
    #[serde(default)]
    pub tailer: TailerConfig,
    #[serde(default)]
    pub batch: BatchConfig,
    pub host: HostConfig,
    #[serde(default)]
    pub formats: Vec<FormatConfig>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct StoreConfig {
    #[serde(default)]
    pub database_url: String,
    #[serde(default = "default_store_timeout_ms")]
    pub timeout_ms: u64,
    #[serde(default = "default_store_retries")]
    pub retries: u32,
    #[serde(default = "default_store_retry_delay_ms")]
    pub retry_delay_ms: u64,
    /// Postgres pool size; ignored by the SQLite backend.
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,
}

#[derive(Debug, Deserialize, Clone)]
pub struct TailerConfig {
    #[serde(default = "default_open_retries")]
    pub open_retries: u32,
    #[serde(default = "default_open_retry_delay_ms")]
    pub open_retry_delay_ms: u64,
}

#[derive(Debug, Deserialize, Clone)]
pub struct BatchConfig {
    #[serde(default = "default_flush_threshold")]
    pub flush_threshold: usize,
    #[serde(default = "default_flush_interval_ms")]
    pub flush_interval_ms: u64,
}

#[derive(Debug, Deserialize, Clone)]
pub struct HostConfig {
    pub watch_paths: Vec<String>,
    /// Equipment settings file; the unknown eqpid is used when absent.
    #[serde(default)]
    pub settings_path: Option<String>,
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
}

#[derive(Debug, Deserialize, Clone)]
pub struct FormatConfig {
    pub kind: FormatKind,
    #[serde(default)]
    pub task_name: Option<String>,
    #[serde(default)]
    pub file_filter: Option<Vec<String>>,
    #[serde(default)]
    pub encoding: TextEncoding,
}

/// Backend selected by `store.database_url`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreTarget {
    Postgres(String),
    Sqlite(PathBuf),
}

const DEFAULT_STORE_TIMEOUT_MS: u64 = 10_000;
const DEFAULT_STORE_RETRIES: u32 = 2;
const DEFAULT_STORE_RETRY_DELAY_MS: u64 = 500;
const DEFAULT_MAX_CONNECTIONS: u32 = 4;
const DEFAULT_OPEN_RETRIES: u32 = 3;
const DEFAULT_OPEN_RETRY_DELAY_MS: u64 = 200;
const DEFAULT_FLUSH_THRESHOLD: usize = 500;
const DEFAULT_FLUSH_INTERVAL_MS: u64 = 5_000;
const DEFAULT_POLL_INTERVAL_MS: u64 = 1_000;

fn default_store_timeout_ms() -> u64 {
    DEFAULT_STORE_TIMEOUT_MS
}

fn default_store_retries() -> u32 {
    DEFAULT_STORE_RETRIES
}

fn default_store_retry_delay_ms() -> u64 {
    DEFAULT_STORE_RETRY_DELAY_MS
}

fn default_max_connections() -> u32 {
    DEFAULT_MAX_CONNECTIONS
}

fn default_open_retries() -> u32 {
    DEFAULT_OPEN_RETRIES
}

fn default_open_retry_delay_ms() -> u64 {
    DEFAULT_OPEN_RETRY_DELAY_MS
}

fn default_flush_threshold() -> usize {
    DEFAULT_FLUSH_THRESHOLD
}

fn default_flush_interval_ms() -> u64 {
    DEFAULT_FLUSH_INTERVAL_MS
}

fn default_poll_interval_ms() -> u64 {
    DEFAULT_POLL_INTERVAL_MS
}

impl Default for TailerConfig {
    fn default() -> Self {
        Self {
            open_retries: DEFAULT_OPEN_RETRIES,
            open_retry_delay_ms: DEFAULT_OPEN_RETRY_DELAY_MS,
        }
    }
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self {
            flush_threshold: DEFAULT_FLUSH_THRESHOLD,
            flush_interval_ms: DEFAULT_FLUSH_INTERVAL_MS,
        }
    }
}

impl AgentConfig {
    /// Reads the file, applies the database URL override from the environment and validates.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let raw = fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.display().to_string(),
            source,
        })?;
        let mut config: AgentConfig = toml::from_str(&raw)?;
        config.override_database_url(std::env::var(DATABASE_URL_ENV).ok());
        config.validate()?;
        Ok(config)
    }

    pub fn from_toml_str(raw: &str) -> Result<Self, ConfigError> {
        let config: AgentConfig = toml::from_str(raw)?;
        config.validate()?;
        Ok(config)
    }

    /// Config path from `EQLOG_AGENT_CONFIG`, falling back to `config.toml`.
    pub fn path_from_env() -> PathBuf {
        let raw = std::env::var(CONFIG_PATH_ENV).unwrap_or_else(|_| DEFAULT_CONFIG_PATH.into());
        PathBuf::from(shellexpand::tilde(&raw).as_ref())
    }

    pub fn override_database_url(&mut self, url: Option<String>) {
        if let Some(url) = url.map(|url| url.trim().to_string()) {
            if !url.is_empty() {
                self.store.database_url = url;
            }
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.store.database_url.trim().is_empty() {
            return Err(ConfigError::Invalid(format!(
                "store.database_url cannot be empty (set it or {DATABASE_URL_ENV})"
            )));
        }
        if self.host.watch_paths.is_empty() {
            return Err(ConfigError::Invalid("host.watch_paths cannot be empty".into()));
        }
        if self.batch.flush_threshold == 0 {
            return Err(ConfigError::Invalid(
                "batch.flush_threshold must be at least 1".into(),
            ));
        }
        if self.formats.is_empty() {
            return Err(ConfigError::Invalid(
                "at least one [[formats]] entry is required".into(),
            ));
        }

        let mut seen = HashSet::new();
        for format in &self.formats {
            if !seen.insert(format.kind) {
                return Err(ConfigError::Invalid(format!(
                    "format {} is configured more than once",
                    format.kind.as_str()
                )));
            }
            if let Some(filter) = &format.file_filter {
                if filter.iter().all(|ext| ext.trim_start_matches('.').is_empty()) {
                    return Err(ConfigError::Invalid(format!(
                        "format {} has an empty file_filter",
                        format.kind.as_str()
                    )));
                }
            }
        }

        // The registry routes a file to the first matching format, so a shared extension would
        // starve every later format that accepts it.
        let mut claimed: HashMap<String, FormatKind> = HashMap::new();
        for spec in self.format_specs() {
            for ext in spec.effective_file_filter() {
                if let Some(owner) = claimed.insert(ext.clone(), spec.kind) {
                    if owner != spec.kind {
                        return Err(ConfigError::Invalid(format!(
                            "extension .{ext} is accepted by both {} and {}; \
                             set a file_filter that separates them",
                            owner.as_str(),
                            spec.kind.as_str()
                        )));
                    }
                }
            }
        }
        Ok(())
    }

    pub fn store_target(&self) -> StoreTarget {
        let url = self.store.database_url.trim();
        if url.starts_with("postgres://") || url.starts_with("postgresql://") {
            return StoreTarget::Postgres(url.to_string());
        }
        let path = url.strip_prefix("sqlite://").unwrap_or(url);
        StoreTarget::Sqlite(PathBuf::from(shellexpand::tilde(path).as_ref()))
    }

    pub fn watch_paths(&self) -> Vec<PathBuf> {
        self.host
            .watch_paths
            .iter()
            .map(|p| PathBuf::from(shellexpand::tilde(p).as_ref()))
            .collect()
    }

    pub fn settings_source(&self) -> SettingsSource {
        match &self.host.settings_path {
            Some(path) if !path.trim().is_empty() => {
                SettingsSource::Path(PathBuf::from(shellexpand::tilde(path).as_ref()))
            }
            _ => SettingsSource::Inline(Settings::default()),
        }
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.host.poll_interval_ms)
    }

    pub fn writer_options(&self) -> WriterOptions {
        WriterOptions {
            timeout: Duration::from_millis(self.store.timeout_ms),
            retries: self.store.retries,
            retry_delay: Duration::from_millis(self.store.retry_delay_ms),
        }
    }

    pub fn tail_options(&self) -> TailOptions {
        TailOptions {
            open_retries: self.tailer.open_retries,
            retry_delay: Duration::from_millis(self.tailer.open_retry_delay_ms),
            ..TailOptions::default()
        }
    }

    pub fn batch_options(&self) -> BatchOptions {
        BatchOptions {
            flush_threshold: self.batch.flush_threshold,
            flush_interval: Duration::from_millis(self.batch.flush_interval_ms),
        }
    }

    pub fn format_specs(&self) -> Vec<FormatSpec> {
        self.formats
            .iter()
            .map(|format| FormatSpec {
                kind: format.kind,
                task_name: format.task_name.clone(),
                file_filter: format.file_filter.clone(),
                encoding: format.encoding,
            })
            .collect()
    }
}
