use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde_json::Value;
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use revchat_provider_core::{Credential, PoolSnapshot, StateSink};

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("state io error: {0}")]
    Io(#[from] io::Error),
    #[error("state encode error: {0}")]
    Encode(#[from] serde_json::Error),
}

/// File-backed artifact store: one `<backend>_credentials.json` per pool
/// under the state directory.
#[derive(Debug, Clone)]
pub struct FileArtifactStore {
    dir: PathBuf,
}

impl FileArtifactStore {
    pub fn open(dir: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let dir = dir.into();
        fs::create_dir_all(&dir)?;
        Ok(Self { dir })
    }

    fn state_path(&self, backend: &str) -> PathBuf {
        self.dir.join(format!("{backend}_credentials.json"))
    }

    /// Build the startup snapshot for one back-end.
    ///
    /// Secret material always comes from configuration; persisted lifecycle
    /// state (validity, usage, cooldowns) is adopted per index when the
    /// stored secret still matches the configured one.
    pub fn load_pool(&self, backend: &str, secrets: Vec<Value>) -> PoolSnapshot {
        let persisted = self.read_snapshot(backend);
        let credentials = secrets
            .into_iter()
            .enumerate()
            .map(|(i, secret)| {
                let id = i as i64;
                match persisted.credentials.iter().find(|c| c.id == id) {
                    Some(prior) if prior.secret == secret => {
                        let mut cred = prior.clone();
                        cred.secret = secret;
                        cred
                    }
                    _ => Credential::new(id, secret),
                }
            })
            .collect();
        PoolSnapshot { credentials }
    }

    fn read_snapshot(&self, backend: &str) -> PoolSnapshot {
        let path = self.state_path(backend);
        let bytes = match fs::read(&path) {
            Ok(bytes) => bytes,
            Err(err) if err.kind() == io::ErrorKind::NotFound => {
                debug!(backend, path = %path.display(), "no prior credential state");
                return PoolSnapshot::empty();
            }
            Err(err) => {
                warn!(backend, path = %path.display(), error = %err, "credential state unreadable, starting fresh");
                return PoolSnapshot::empty();
            }
        };
        match serde_json::from_slice(&bytes) {
            Ok(snapshot) => snapshot,
            Err(err) => {
                warn!(backend, path = %path.display(), error = %err, "credential state corrupt, starting fresh");
                PoolSnapshot::empty()
            }
        }
    }

    pub fn write_snapshot(&self, backend: &str, snapshot: &PoolSnapshot) -> Result<(), StoreError> {
        write_atomic(&self.state_path(backend), snapshot)
    }

    /// A `StateSink` for one back-end's pool. Snapshots are handed to a
    /// writer task over a channel so the pool never blocks on disk; bursts
    /// collapse to the most recent snapshot.
    pub fn sink(&self, backend: &str) -> Arc<dyn StateSink> {
        let (tx, mut rx) = mpsc::unbounded_channel::<PoolSnapshot>();
        let path = self.state_path(backend);
        let backend = backend.to_string();
        tokio::spawn(async move {
            while let Some(mut snapshot) = rx.recv().await {
                while let Ok(newer) = rx.try_recv() {
                    snapshot = newer;
                }
                if let Err(err) = write_atomic(&path, &snapshot) {
                    warn!(backend = %backend, error = %err, "failed to persist credential state");
                }
            }
        });
        Arc::new(ChannelSink { tx })
    }
}

struct ChannelSink {
    tx: mpsc::UnboundedSender<PoolSnapshot>,
}

impl StateSink for ChannelSink {
    fn persist(&self, snapshot: PoolSnapshot) {
        let _ = self.tx.send(snapshot);
    }
}

fn write_atomic(path: &Path, snapshot: &PoolSnapshot) -> Result<(), StoreError> {
    let tmp = path.with_extension("json.tmp");
    fs::write(&tmp, serde_json::to_vec_pretty(snapshot)?)?;
    fs::rename(&tmp, path)?;
    Ok(())
}
