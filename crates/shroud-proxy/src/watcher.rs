//! Configuration directory polling.

use crate::server::Server;
use std::collections::hash_map::DefaultHasher;
use std::fs;
use std::hash::{Hash, Hasher};
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, UNIX_EPOCH};
use tokio::time::MissedTickBehavior;

/// Reloads the server whenever the configuration directory changes.
///
/// A change is any difference in the set of files or in one file's size
/// or modification time.
#[derive(Debug)]
pub struct ConfigWatcher {
    dir: PathBuf,
    interval: Duration,
    fingerprint: Option<u64>,
}

impl ConfigWatcher {
    pub fn new(dir: impl Into<PathBuf>, interval: Duration) -> Self {
        Self {
            dir: dir.into(),
            interval,
            fingerprint: None,
        }
    }

    /// Whether the directory changed since the previous call. The first
    /// call records a baseline and reports no change.
    pub fn poll_changed(&mut self) -> bool {
        let current = match fingerprint(&self.dir) {
            Ok(current) => current,
            Err(e) => {
                tracing::warn!(dir = %self.dir.display(), error = %e, "Cannot scan configuration directory");
                return false;
            }
        };
        let previous = self.fingerprint.replace(current);
        previous.is_some_and(|previous| previous != current)
    }

    pub async fn run(mut self, server: Arc<Server>) {
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        self.poll_changed();
        tracing::info!(dir = %self.dir.display(), interval_ms = self.interval.as_millis() as u64, "Watching configuration");

        loop {
            ticker.tick().await;
            if !self.poll_changed() {
                continue;
            }
            tracing::info!(dir = %self.dir.display(), "Configuration changed, reloading");
            match server.reload().await {
                Ok(()) => tracing::info!(epoch = server.manager().current().epoch, "Reload committed"),
                Err(e) => tracing::error!(error = %e, "Reload failed, keeping the active generation"),
            }
        }
    }
}

/// Hash of every file path, size and modification time under `dir`.
pub fn fingerprint(dir: &Path) -> io::Result<u64> {
    let mut entries = Vec::new();
    collect(dir, &mut entries)?;
    entries.sort();
    let mut hasher = DefaultHasher::new();
    entries.hash(&mut hasher);
    Ok(hasher.finish())
}

fn collect(dir: &Path, entries: &mut Vec<(PathBuf, u64, u128)>) -> io::Result<()> {
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        let metadata = entry.metadata()?;
        if metadata.is_dir() {
            collect(&entry.path(), entries)?;
            continue;
        }
        let modified = metadata
            .modified()
            .ok()
            .and_then(|time| time.duration_since(UNIX_EPOCH).ok())
            .map_or(0, |since| since.as_nanos());
        entries.push((entry.path(), metadata.len(), modified));
    }
    Ok(())
}
