//! Orphan staging-directory reclamation: a background `tokio::spawn` loop
//! on a fixed interval, operating on state captured at schedule time.

use dashmap::DashSet;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info};

/// Default GC sweep interval.
pub const DEFAULT_GC_INTERVAL: Duration = Duration::from_secs(60 * 60);

/// Set of service-ids whose staging directories are live. Consulted by
/// the GC sweep before deleting any directory under `base_dir`.
#[derive(Default)]
pub struct ActiveBundleSet {
    ids: DashSet<String>,
}

impl ActiveBundleSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, service_id: impl Into<String>) {
        self.ids.insert(service_id.into());
    }

    pub fn remove(&self, service_id: &str) {
        self.ids.remove(service_id);
    }

    pub fn contains(&self, service_id: &str) -> bool {
        self.ids.contains(service_id)
    }
}

/// Handle to a running GC task; dropping it does not stop the task —
/// use [`GcHandle::stop`] for an explicit shutdown.
pub struct GcHandle {
    task: tokio::task::JoinHandle<()>,
}

impl GcHandle {
    pub fn stop(self) {
        self.task.abort();
    }
}

/// Spawn a task that, at most once per `interval`, deletes every directory
/// under `base_dir` whose name is not present in `active`. `base_dir` is
/// captured at schedule time so later overrides (e.g. in tests) don't race
/// with a scan already in flight.
pub fn spawn_gc(base_dir: PathBuf, active: Arc<ActiveBundleSet>, interval: Duration) -> GcHandle {
    let task = tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.tick().await; // first tick fires immediately; skip it
        loop {
            ticker.tick().await;
            sweep(&base_dir, &active).await;
        }
    });
    GcHandle { task }
}

async fn sweep(base_dir: &PathBuf, active: &ActiveBundleSet) {
    let mut entries = match tokio::fs::read_dir(base_dir).await {
        Ok(entries) => entries,
        Err(err) => {
            error!(base_dir = %base_dir.display(), error = %err, "gc sweep could not read base dir");
            return;
        }
    };

    while let Ok(Some(entry)) = entries.next_entry().await {
        let Some(name) = entry.file_name().to_str().map(str::to_owned) else {
            continue;
        };
        if active.contains(&name) {
            continue;
        }
        let path = entry.path();
        match tokio::fs::remove_dir_all(&path).await {
            Ok(()) => info!(service_id = %name, "gc removed orphan staging directory"),
            Err(err) => error!(service_id = %name, error = %err, "gc failed to remove staging directory"),
        }
    }
}
