//! Configuration stores
//!
//! [`JsonConfigStore`] writes every snapshot to a JSON file from a
//! background writer task, replacing the file atomically (temp file plus
//! rename). [`MemoryConfigStore`] keeps the snapshots for inspection.

use std::path::{Path, PathBuf};

use parking_lot::Mutex;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error, warn};

use crate::domain::ConfigStore;
use crate::error::{Error, Result};
use crate::raid::config::VolumeConfig;

enum Command {
    Persist(Box<VolumeConfig>),
    Flush(oneshot::Sender<Result<()>>),
}

/// Persists volume configuration as a JSON file.
#[derive(Debug, Clone)]
pub struct JsonConfigStore {
    path: PathBuf,
    tx: mpsc::UnboundedSender<Command>,
}

impl std::fmt::Debug for Command {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Command::Persist(config) => write!(f, "Persist({})", config.name),
            Command::Flush(_) => write!(f, "Flush"),
        }
    }
}

impl JsonConfigStore {
    /// Start the writer task. Must be called from within a tokio runtime.
    pub fn spawn(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let (tx, rx) = mpsc::unbounded_channel();
        tokio::spawn(writer(path.clone(), rx));
        Self { path, tx }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Wait until every snapshot persisted so far has been written.
    ///
    /// Reports the first write failure since the previous flush.
    pub async fn flush(&self) -> Result<()> {
        let (tx, rx) = oneshot::channel();
        self.tx
            .send(Command::Flush(tx))
            .map_err(|_| Error::Internal("config writer has stopped".into()))?;
        rx.await
            .map_err(|_| Error::Internal("config writer has stopped".into()))?
    }
}

impl ConfigStore for JsonConfigStore {
    fn persist(&self, snapshot: VolumeConfig) {
        if self.tx.send(Command::Persist(Box::new(snapshot))).is_err() {
            warn!(path = %self.path.display(), "config writer has stopped, snapshot dropped");
        }
    }
}

async fn writer(path: PathBuf, mut rx: mpsc::UnboundedReceiver<Command>) {
    let mut newest: Option<u64> = None;
    let mut failure: Option<String> = None;

    while let Some(command) = rx.recv().await {
        match command {
            Command::Persist(snapshot) => {
                // Snapshots from concurrent state changes may arrive out of order.
                if newest.is_some_and(|seq| snapshot.sequence <= seq) {
                    debug!(
                        path = %path.display(),
                        sequence = snapshot.sequence,
                        "skipping stale snapshot"
                    );
                    continue;
                }
                newest = Some(snapshot.sequence);
                match write_atomic(&path, &snapshot).await {
                    Ok(()) => debug!(
                        path = %path.display(),
                        states = ?snapshot.chunk_states,
                        "persisted volume configuration"
                    ),
                    Err(e) => {
                        error!(path = %path.display(), "failed to persist configuration: {}", e);
                        failure.get_or_insert_with(|| e.to_string());
                    }
                }
            }
            Command::Flush(reply) => {
                let outcome = match failure.take() {
                    Some(reason) => Err(Error::Internal(format!("persist failed: {reason}"))),
                    None => Ok(()),
                };
                let _ = reply.send(outcome);
            }
        }
    }
}

async fn write_atomic(path: &Path, config: &VolumeConfig) -> Result<()> {
    let bytes = config.to_json()?;
    let tmp = path.with_extension("json.tmp");
    tokio::fs::write(&tmp, bytes).await?;
    tokio::fs::rename(&tmp, path).await?;
    Ok(())
}

/// Keeps every persisted snapshot in memory.
#[derive(Debug, Default)]
pub struct MemoryConfigStore {
    snapshots: Mutex<Vec<VolumeConfig>>,
}

impl MemoryConfigStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn latest(&self) -> Option<VolumeConfig> {
        self.snapshots.lock().last().cloned()
    }

    pub fn count(&self) -> usize {
        self.snapshots.lock().len()
    }

    pub fn history(&self) -> Vec<VolumeConfig> {
        self.snapshots.lock().clone()
    }
}

impl ConfigStore for MemoryConfigStore {
    fn persist(&self, snapshot: VolumeConfig) {
        self.snapshots.lock().push(snapshot);
    }
}
