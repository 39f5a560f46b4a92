//! Config-store adapter: polls a JSON file and feeds changes to the controller.

use std::path::{Path, PathBuf};
use std::sync::mpsc::{self, RecvTimeoutError, Sender};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, SystemTime};

use anyhow::{Context, Result};

use crate::error::ConfigError;
use crate::scheduler::PipelineController;

pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(2);

/// Content applied when no config file exists yet: every key takes its default.
const EMPTY_CONFIG: &str = "{}";

/// What the last poll saw. A change in either field triggers a reconfiguration.
#[derive(Debug, PartialEq, Eq)]
struct Seen {
    contents: String,
    modified: Option<SystemTime>,
}

pub struct ConfigWatcher {
    path: PathBuf,
    controller: Arc<PipelineController>,
    last_seen: Option<Seen>,
}

impl ConfigWatcher {
    pub fn new(path: impl Into<PathBuf>, controller: Arc<PipelineController>) -> Self {
        Self {
            path: path.into(),
            controller,
            last_seen: None,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Check the file once. Returns `None` when neither contents nor modification
    /// time changed, otherwise the outcome of the reconfiguration.
    pub fn poll_once(&mut self) -> Option<Result<(), ConfigError>> {
        let seen = match std::fs::read_to_string(&self.path) {
            Ok(contents) => Seen {
                contents,
                modified: std::fs::metadata(&self.path)
                    .and_then(|meta| meta.modified())
                    .ok(),
            },
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                if self.last_seen.is_some() {
                    return None;
                }
                log::warn!(
                    "config file {} not found; using defaults",
                    self.path.display()
                );
                Seen {
                    contents: EMPTY_CONFIG.to_string(),
                    modified: None,
                }
            }
            Err(err) => {
                log::warn!("cannot read config file {}: {}", self.path.display(), err);
                return None;
            }
        };

        if self.last_seen.as_ref() == Some(&seen) {
            return None;
        }
        log::info!("configuration change detected in {}", self.path.display());
        let outcome = self.controller.reconfigure(&seen.contents);
        self.last_seen = Some(seen);
        Some(outcome)
    }

    /// Poll on a background thread until the handle is stopped.
    pub fn spawn(mut self, interval: Duration) -> Result<WatchHandle> {
        let (stop, stopped) = mpsc::channel::<()>();
        let handle = std::thread::Builder::new()
            .name("config-watch".to_string())
            .spawn(move || loop {
                self.poll_once();
                match stopped.recv_timeout(interval) {
                    Err(RecvTimeoutError::Timeout) => {}
                    Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
                }
            })
            .context("spawn config watcher")?;
        Ok(WatchHandle { stop, handle })
    }
}

pub struct WatchHandle {
    stop: Sender<()>,
    handle: JoinHandle<()>,
}

impl WatchHandle {
    pub fn stop(self) {
        let _ = self.stop.send(());
        if self.handle.join().is_err() {
            log::error!("config watcher thread panicked");
        }
    }
}
