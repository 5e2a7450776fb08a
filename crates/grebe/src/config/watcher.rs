use std::future::Future;
use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::Mutex;

use crate::config::file_checksum;

type WatchCallback = Box<dyn FnOnce() -> Pin<Box<dyn Future<Output = ()> + Send>> + Send>;

/// Polls a config file and invokes queued one-shot callbacks once its content
/// checksum differs from the last one seen.
///
/// Reload requests arriving while a change is pending are coalesced simply by
/// queuing their callbacks; all of them fire on the next detected change.
pub struct ConfigWatcher {
    path: PathBuf,
    state: Mutex<WatcherState>,
}

struct WatcherState {
    last_checksum: Vec<u8>,
    callbacks: Vec<WatchCallback>,
}

impl ConfigWatcher {
    /// Start watching `path`, treating `checksum` as the currently-loaded
    /// content. The polling task stops when the watcher is dropped.
    pub fn spawn(path: PathBuf, checksum: Vec<u8>, poll_interval: Duration) -> Arc<ConfigWatcher> {
        let watcher = Arc::new(ConfigWatcher {
            path,
            state: Mutex::new(WatcherState {
                last_checksum: checksum,
                callbacks: Vec::new(),
            }),
        });
        let weak: Weak<ConfigWatcher> = Arc::downgrade(&watcher);
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(poll_interval);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                interval.tick().await;
                let Some(watcher) = weak.upgrade() else {
                    return;
                };
                watcher.poll_once().await;
            }
        });
        watcher
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Queue a callback to run on the next detected content change.
    pub fn add_callback(&self, callback: WatchCallback) {
        self.state.lock().callbacks.push(callback);
    }

    async fn poll_once(&self) {
        let checksum = match file_checksum(&self.path) {
            Ok(checksum) => checksum,
            Err(e) => {
                log::debug!("Config file {} not readable: {e}", self.path.display());
                return;
            }
        };
        let fired = {
            let mut state = self.state.lock();
            if checksum == state.last_checksum || state.callbacks.is_empty() {
                return;
            }
            state.last_checksum = checksum;
            std::mem::take(&mut state.callbacks)
        };
        log::info!(
            "Config file {} changed, running {} reload callback(s)",
            self.path.display(),
            fired.len()
        );
        for callback in fired {
            callback().await;
        }
    }
}
