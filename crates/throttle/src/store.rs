//! Durable rate window state
//!
//! A `StateStore` saves and loads one `WindowSnapshot` per limiter key. The
//! limiter loads at most once (before its first use) and saves on throttle
//! events, periodically on admissions, and on close.

use std::collections::HashMap;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::pin::Pin;

use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::debug;

use crate::error::{Error, Result};

/// Persisted form of a limiter's window.
///
/// Timestamps are seconds on the limiter clock, ascending. Entries that have
/// aged out of the window by the time the snapshot is loaded are dropped.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct WindowSnapshot {
    pub request_timestamps: Vec<f64>,
    pub total_requests: u64,
    pub total_throttled: u64,
    pub max_concurrent: usize,
    pub last_reset: f64,
}

/// Backend for limiter persistence.
///
/// Uses `Pin<Box<dyn Future>>` return types so limiters can hold an
/// `Arc<dyn StateStore>`.
pub trait StateStore: Send + Sync {
    fn save<'a>(
        &'a self,
        key: &'a str,
        snapshot: &'a WindowSnapshot,
    ) -> Pin<Box<dyn Future<Output = Result<()>> + Send + 'a>>;

    /// `Ok(None)` when nothing was ever saved for `key`.
    fn load<'a>(
        &'a self,
        key: &'a str,
    ) -> Pin<Box<dyn Future<Output = Result<Option<WindowSnapshot>>> + Send + 'a>>;
}

/// One JSON file per key under a directory: `{dir}/{key}.json`.
///
/// The directory is created on first save. Writes go through a temp file and
/// a rename so a crash never leaves a torn snapshot behind.
#[derive(Debug, Clone)]
pub struct FileStateStore {
    dir: PathBuf,
}

impl FileStateStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path_for(&self, key: &str) -> Result<PathBuf> {
        if key.is_empty() || key.contains(['/', '\\']) || key.starts_with('.') {
            return Err(Error::Store(format!("invalid state key: {key:?}")));
        }
        Ok(self.dir.join(format!("{key}.json")))
    }

    async fn save_file(&self, key: &str, snapshot: &WindowSnapshot) -> Result<()> {
        let path = self.path_for(key)?;
        let json = serde_json::to_vec(snapshot)
            .map_err(|e| Error::Store(format!("serializing window state: {e}")))?;

        tokio::fs::create_dir_all(&self.dir)
            .await
            .map_err(|e| Error::Store(format!("creating state directory: {e}")))?;

        let tmp_path = self
            .dir
            .join(format!(".{key}.json.tmp.{}", std::process::id()));
        tokio::fs::write(&tmp_path, &json)
            .await
            .map_err(|e| Error::Store(format!("writing temp state file: {e}")))?;
        tokio::fs::rename(&tmp_path, &path)
            .await
            .map_err(|e| Error::Store(format!("renaming temp state file: {e}")))?;

        debug!(key, path = %path.display(), "persisted window state");
        Ok(())
    }

    async fn load_file(&self, key: &str) -> Result<Option<WindowSnapshot>> {
        let path = self.path_for(key)?;
        let contents = match tokio::fs::read(&path).await {
            Ok(contents) => contents,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(Error::Store(format!("reading state file: {e}"))),
        };
        let snapshot = serde_json::from_slice(&contents)
            .map_err(|e| Error::Store(format!("parsing state file {}: {e}", path.display())))?;
        Ok(Some(snapshot))
    }
}

impl StateStore for FileStateStore {
    fn save<'a>(
        &'a self,
        key: &'a str,
        snapshot: &'a WindowSnapshot,
    ) -> Pin<Box<dyn Future<Output = Result<()>> + Send + 'a>> {
        Box::pin(self.save_file(key, snapshot))
    }

    fn load<'a>(
        &'a self,
        key: &'a str,
    ) -> Pin<Box<dyn Future<Output = Result<Option<WindowSnapshot>>> + Send + 'a>> {
        Box::pin(self.load_file(key))
    }
}

/// In-process store. Snapshots live as long as the store does.
#[derive(Debug, Default)]
pub struct MemoryStateStore {
    snapshots: Mutex<HashMap<String, WindowSnapshot>>,
}

impl MemoryStateStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of keys with a saved snapshot.
    pub async fn len(&self) -> usize {
        self.snapshots.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}

impl StateStore for MemoryStateStore {
    fn save<'a>(
        &'a self,
        key: &'a str,
        snapshot: &'a WindowSnapshot,
    ) -> Pin<Box<dyn Future<Output = Result<()>> + Send + 'a>> {
        Box::pin(async move {
            self.snapshots
                .lock()
                .await
                .insert(key.to_string(), snapshot.clone());
            Ok(())
        })
    }

    fn load<'a>(
        &'a self,
        key: &'a str,
    ) -> Pin<Box<dyn Future<Output = Result<Option<WindowSnapshot>>> + Send + 'a>> {
        Box::pin(async move { Ok(self.snapshots.lock().await.get(key).cloned()) })
    }
}
