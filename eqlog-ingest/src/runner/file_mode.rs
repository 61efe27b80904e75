//! Directory-driven host loop.
//!
//! Seeds the files already present, then dispatches every created or modified file to the
//! plugin whose filter accepts it. A file is processed by at most one task at a time; events
//! arriving while it is busy schedule one more pass once the running one finishes.

use crate::batcher::BatchAccumulator;
use crate::config::AgentConfig;
use crate::pipeline::PluginRegistry;
use crate::runner::{build_plugins, build_store};
use crate::settings::SettingsSource;
use crate::watcher::{watch_directories, WATCHER_CHANNEL_CAPACITY};
use anyhow::Result;
use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::{Id, JoinError, JoinHandle, JoinSet};
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(5);

/// In-flight `process_and_upload` calls keyed by path.
struct Dispatcher {
    registry: Arc<PluginRegistry>,
    settings: Arc<SettingsSource>,
    tasks: JoinSet<PathBuf>,
    /// Path of every spawned task, so a panicked one can still be released.
    paths: HashMap<Id, PathBuf>,
    in_flight: HashSet<PathBuf>,
    rerun: HashSet<PathBuf>,
}

impl Dispatcher {
    fn new(registry: PluginRegistry, settings: SettingsSource) -> Self {
        Self {
            registry: Arc::new(registry),
            settings: Arc::new(settings),
            tasks: JoinSet::new(),
            paths: HashMap::new(),
            in_flight: HashSet::new(),
            rerun: HashSet::new(),
        }
    }

    fn dispatch(&mut self, path: PathBuf) {
        if self.in_flight.contains(&path) {
            self.rerun.insert(path);
            return;
        }
        let Some(plugin) = self.registry.route(&path).cloned() else {
            debug!(path = %path.display(), "no plugin accepts file; ignoring event");
            return;
        };

        self.in_flight.insert(path.clone());
        let settings = Arc::clone(&self.settings);
        let task_path = path.clone();
        let handle = self.tasks.spawn(async move {
            plugin.process_and_upload(&task_path, &settings).await;
            task_path
        });
        self.paths.insert(handle.id(), path);
    }

    fn joined(&mut self, result: Result<(Id, PathBuf), JoinError>) {
        let id = match &result {
            Ok((id, _)) => *id,
            Err(err) => err.id(),
        };
        let Some(path) = self.paths.remove(&id) else {
            return;
        };
        if let Err(err) = result {
            error!(path = %path.display(), error = %err, "upload task panicked");
        }
        self.finished(path);
    }

    fn finished(&mut self, path: PathBuf) {
        self.in_flight.remove(&path);
        if self.rerun.remove(&path) {
            self.dispatch(path);
        }
    }

    async fn drain(&mut self) {
        let deadline = sleep(SHUTDOWN_TIMEOUT);
        tokio::pin!(deadline);
        while !self.tasks.is_empty() {
            tokio::select! {
                _ = &mut deadline => {
                    warn!(
                        pending = self.tasks.len(),
                        "uploads did not finish within timeout; aborting"
                    );
                    self.tasks.abort_all();
                    break;
                }
                joined = self.tasks.join_next() => {
                    if let Some(Err(err)) = joined {
                        warn!(error = %err, "upload task failed during shutdown");
                    }
                }
            }
        }
    }
}

/// Run the reference host until Ctrl-C.
pub async fn run(config: &AgentConfig) -> Result<()> {
    info!("eqlog-agent starting in file mode");

    let cancel_token = CancellationToken::new();
    let watch_paths = config.watch_paths();
    let store = build_store(config).await?;
    let plugins = build_plugins(config, store);

    let schedulers: Vec<JoinHandle<()>> = plugins
        .accumulators
        .iter()
        .filter_map(|accumulator| accumulator.start_scheduler(cancel_token.clone()))
        .collect();

    let existing_files = match plugins.registry.discover_existing_files(&watch_paths) {
        Ok(files) => files,
        Err(err) => {
            warn!(error = %err, "failed to discover existing files on startup");
            Vec::new()
        }
    };
    info!(file_count = existing_files.len(), "seeding existing files");

    let mut dispatcher = Dispatcher::new(plugins.registry, config.settings_source());
    for path in existing_files {
        dispatcher.dispatch(path);
    }

    let (event_tx, mut event_rx) = mpsc::channel(WATCHER_CHANNEL_CAPACITY);
    let watcher_handle = tokio::spawn({
        let paths = watch_paths.clone();
        let poll_interval = config.poll_interval();
        let cancel_token = cancel_token.clone();
        async move {
            if let Err(err) = watch_directories(paths, poll_interval, event_tx, cancel_token).await
            {
                error!(error = %err, "file watcher exited unexpectedly");
            }
        }
    });

    info!("eqlog-agent started; awaiting file events");

    let mut shutdown_reason = "event channel closed";
    loop {
        tokio::select! {
            maybe_event = event_rx.recv() => {
                match maybe_event {
                    Some(event) => dispatcher.dispatch(event.path().to_path_buf()),
                    None => {
                        warn!("event channel closed; shutting down");
                        break;
                    }
                }
            }
            Some(joined) = dispatcher.tasks.join_next_with_id(), if !dispatcher.tasks.is_empty() => {
                dispatcher.joined(joined);
            }
            result = tokio::signal::ctrl_c() => {
                if let Err(err) = result {
                    error!(error = %err, "failed while waiting for shutdown signal");
                }
                info!("shutdown signal received");
                shutdown_reason = "signal";
                break;
            }
        }
    }

    info!(reason = shutdown_reason, "initiating shutdown");
    cancel_token.cancel();

    info!("waiting for in-flight uploads");
    dispatcher.drain().await;

    for handle in schedulers {
        stop_task(handle, "flush scheduler").await;
    }
    final_flush(&plugins.accumulators).await;
    stop_task(watcher_handle, "file watcher").await;

    Ok(())
}

async fn stop_task(mut handle: JoinHandle<()>, name: &str) {
    let timeout = sleep(SHUTDOWN_TIMEOUT);
    tokio::pin!(timeout);
    let result = tokio::select! {
        res = &mut handle => Some(res),
        _ = &mut timeout => None,
    };

    match result {
        Some(Ok(())) => info!(task = name, "stopped"),
        Some(Err(err)) => warn!(task = name, error = %err, "exited with error during shutdown"),
        None => {
            warn!(task = name, "did not stop within timeout; aborting");
            handle.abort();
        }
    }
}

/// Writes whatever is still queued so batched files are not left waiting for a restart.
async fn final_flush(accumulators: &[Arc<BatchAccumulator>]) {
    for accumulator in accumulators {
        let outcome = accumulator.flush().await;
        info!(task = accumulator.name(), ?outcome, "final flush");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Outcome;
    use crate::pipeline::{IngestPlugin, PluginMetadata};
    use crate::settings::Settings;
    use async_trait::async_trait;
    use std::path::Path;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct Crashing {
        metadata: PluginMetadata,
        calls: AtomicUsize,
    }

    #[async_trait]
    impl IngestPlugin for Crashing {
        fn metadata(&self) -> &PluginMetadata {
            &self.metadata
        }

        async fn process_and_upload(&self, _path: &Path, _settings: &SettingsSource) -> Outcome {
            self.calls.fetch_add(1, Ordering::SeqCst);
            panic!("corrupt parser state");
        }
    }

    #[tokio::test]
    async fn panicked_upload_does_not_pin_its_path() {
        let plugin = Arc::new(Crashing {
            metadata: PluginMetadata {
                default_task_name: "CrashUpload".into(),
                file_filter: vec!["map".into()],
                override_names: false,
            },
            calls: AtomicUsize::new(0),
        });
        let mut registry = PluginRegistry::new();
        registry.register(plugin.clone());
        let mut dispatcher =
            Dispatcher::new(registry, SettingsSource::Inline(Settings::default()));
        let path = PathBuf::from("/data/maps/LOT1.map");

        dispatcher.dispatch(path.clone());
        dispatcher.dispatch(path.clone());
        assert_eq!(dispatcher.tasks.len(), 1);

        let joined = dispatcher.tasks.join_next_with_id().await.unwrap();
        assert!(joined.as_ref().is_err_and(|err| err.is_panic()));
        dispatcher.joined(joined);
        assert_eq!(dispatcher.tasks.len(), 1, "queued rerun was dispatched");

        let joined = dispatcher.tasks.join_next_with_id().await.unwrap();
        dispatcher.joined(joined);
        assert!(dispatcher.in_flight.is_empty());
        assert!(dispatcher.paths.is_empty());

        dispatcher.dispatch(path.clone());
        assert!(dispatcher.in_flight.contains(&path));
        dispatcher.drain().await;
        assert_eq!(plugin.calls.load(Ordering::SeqCst), 3);
    }
}
