//! Debounced JSON snapshot persistence.
//!
//! Every store keeps its authoritative state in memory and periodically
//! rewrites a pretty-printed JSON snapshot of the whole collection. Writes
//! are coalesced: a mutation schedules a trailing-edge debounced save, and a
//! burst of mutations produces a single write. A background write failure is
//! logged and swallowed; the next mutation schedules a retry. This trades
//! durability for availability.
//!
//! Snapshot files are replaced atomically (temp file + fsync + rename) so a
//! crash mid-write never leaves a truncated snapshot behind.

use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::Duration;

use serde::Serialize;
use serde::de::DeserializeOwned;
use thiserror::Error;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio::task::JoinHandle;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("snapshot io at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("snapshot decode at {path}: {source}")]
    Decode {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("snapshot encode: {0}")]
    Encode(#[source] serde_json::Error),
}

impl StoreError {
    fn io(path: &Path, source: std::io::Error) -> Self {
        StoreError::Io {
            path: path.to_path_buf(),
            source,
        }
    }
}

/// Write a pretty-printed JSON snapshot to a temp file, fsync it, then
/// atomically rename it over the final path.
///
/// The temp file name carries a ULID so concurrent writers targeting the same
/// final path never collide.
pub async fn write_snapshot<T: Serialize>(path: &Path, value: &T) -> Result<(), StoreError> {
    let data = serde_json::to_vec_pretty(value).map_err(StoreError::Encode)?;

    if let Some(parent) = path.parent()
        && !parent.as_os_str().is_empty()
    {
        fs::create_dir_all(parent)
            .await
            .map_err(|e| StoreError::io(parent, e))?;
    }

    let file_name = path.file_name().and_then(|n| n.to_str()).unwrap_or("snapshot");
    let temp_path = path.with_file_name(format!("{}.{}.tmp", file_name, ulid::Ulid::new()));

    let mut file = fs::File::create(&temp_path)
        .await
        .map_err(|e| StoreError::io(&temp_path, e))?;
    file.write_all(&data)
        .await
        .map_err(|e| StoreError::io(&temp_path, e))?;
    file.sync_all()
        .await
        .map_err(|e| StoreError::io(&temp_path, e))?;
    fs::rename(&temp_path, path)
        .await
        .map_err(|e| StoreError::io(path, e))?;
    Ok(())
}

/// Load a JSON snapshot, returning `None` when the file does not exist yet.
pub async fn load_snapshot<T: DeserializeOwned>(path: &Path) -> Result<Option<T>, StoreError> {
    let data = match fs::read(path).await {
        Ok(d) => d,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(StoreError::io(path, e)),
    };
    let value = serde_json::from_slice(&data).map_err(|e| StoreError::Decode {
        path: path.to_path_buf(),
        source: e,
    })?;
    Ok(Some(value))
}

/// Trailing-edge debouncer: scheduling replaces any pending run, so only the
/// last schedule within a burst fires.
pub struct Debouncer {
    delay: Duration,
    pending: Mutex<Option<JoinHandle<()>>>,
}

impl Debouncer {
    pub fn new(delay: Duration) -> Self {
        Self {
            delay,
            pending: Mutex::new(None),
        }
    }

    /// Schedule `make` to run after the debounce delay, cancelling any
    /// previously scheduled run that has not fired yet.
    pub fn schedule<F, Fut>(&self, make: F)
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let delay = self.delay;
        let mut slot = self.pending.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(handle) = slot.take() {
            handle.abort();
        }
        *slot = Some(tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            make().await;
        }));
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::sync::atomic::{AtomicU32, Ordering};

    use serde::Deserialize;
    use tempfile::TempDir;

    use super::*;

    #[derive(Serialize, Deserialize, PartialEq, Debug)]
    struct Doc {
        name: String,
        count: u32,
    }

    #[tokio::test]
    async fn snapshot_roundtrip() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("state").join("doc.json");

        let doc = Doc {
            name: "relay".into(),
            count: 3,
        };
        write_snapshot(&path, &doc).await.unwrap();

        let loaded: Option<Doc> = load_snapshot(&path).await.unwrap();
        assert_eq!(loaded, Some(doc));

        // Snapshot is pretty-printed.
        let raw = std::fs::read_to_string(&path).unwrap();
        assert!(raw.contains("\n"));
    }

    #[tokio::test]
    async fn missing_snapshot_loads_as_none() {
        let dir = TempDir::new().unwrap();
        let loaded: Option<Doc> = load_snapshot(&dir.path().join("nope.json")).await.unwrap();
        assert!(loaded.is_none());
    }

    #[tokio::test]
    async fn debouncer_coalesces_bursts() {
        let fired = Arc::new(AtomicU32::new(0));
        let debouncer = Debouncer::new(Duration::from_millis(50));

        for _ in 0..5 {
            let fired = Arc::clone(&fired);
            debouncer.schedule(move || async move {
                fired.fetch_add(1, Ordering::SeqCst);
            });
        }

        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }
}
