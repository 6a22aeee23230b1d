//! Credential storage
//!
//! A JSON file mapping account keys to credentials. Loaded eagerly, kept in
//! memory behind a tokio Mutex, and rewritten on every change through a
//! temp file + rename so the file on disk is always a complete snapshot.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use tokio::sync::Mutex;
use tracing::{debug, info};

use crate::credential::Credential;
use crate::error::{Error, Result};

/// Thread-safe credential file manager.
pub struct CredentialStore {
    path: PathBuf,
    state: Mutex<HashMap<String, Credential>>,
}

impl CredentialStore {
    /// Load credentials from `path`.
    ///
    /// A missing file (and missing parent directories) is created holding
    /// `{}` so the next load takes the normal path.
    pub async fn load(path: PathBuf) -> Result<Self> {
        let state = if tokio::fs::try_exists(&path).await.unwrap_or(false) {
            let contents = tokio::fs::read_to_string(&path)
                .await
                .map_err(|e| Error::Io(format!("reading credential file: {e}")))?;
            let credentials: HashMap<String, Credential> = serde_json::from_str(&contents)
                .map_err(|e| Error::CredentialParse(format!("parsing credential file: {e}")))?;
            info!(path = %path.display(), accounts = credentials.len(), "loaded credentials");
            credentials
        } else {
            info!(path = %path.display(), "credential file not found, starting with empty store");
            if let Some(dir) = path.parent().filter(|d| !d.as_os_str().is_empty()) {
                tokio::fs::create_dir_all(dir)
                    .await
                    .map_err(|e| Error::Io(format!("creating credential directory: {e}")))?;
            }
            let store = HashMap::new();
            write_atomic(&path, &store).await?;
            store
        };

        Ok(Self {
            path,
            state: Mutex::new(state),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub async fn get(&self, account_key: &str) -> Option<Credential> {
        self.state.lock().await.get(account_key).cloned()
    }

    pub async fn account_keys(&self) -> Vec<String> {
        self.state.lock().await.keys().cloned().collect()
    }

    /// Store `credential` under its `account_key`, replacing any previous
    /// one, and persist.
    ///
    /// The in-memory entry is updated even if the write fails.
    pub async fn put(&self, credential: Credential) -> Result<()> {
        let mut state = self.state.lock().await;
        let account_key = credential.account_key.clone();
        state.insert(account_key.clone(), credential);
        debug!(account_key, "stored credential");
        write_atomic(&self.path, &state).await
    }

    /// Remove and return the credential for `account_key`, persisting if
    /// anything was removed.
    pub async fn remove(&self, account_key: &str) -> Result<Option<Credential>> {
        let mut state = self.state.lock().await;
        let removed = state.remove(account_key);
        if removed.is_some() {
            debug!(account_key, "removed credential");
            write_atomic(&self.path, &state).await?;
        }
        Ok(removed)
    }

    pub async fn len(&self) -> usize {
        self.state.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}

/// Write the credential map atomically with 0600 permissions.
async fn write_atomic(path: &Path, data: &HashMap<String, Credential>) -> Result<()> {
    let json = serde_json::to_string_pretty(data)
        .map_err(|e| Error::CredentialParse(format!("serializing credentials: {e}")))?;

    let dir = match path.parent() {
        Some(dir) if !dir.as_os_str().is_empty() => dir,
        _ => Path::new("."),
    };
    let file_name = path
        .file_name()
        .ok_or_else(|| Error::Io("credential path has no file name".into()))?
        .to_string_lossy();
    let tmp_path = dir.join(format!(".{file_name}.tmp.{}", std::process::id()));

    tokio::fs::write(&tmp_path, json.as_bytes())
        .await
        .map_err(|e| Error::Io(format!("writing temp credential file: {e}")))?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let perms = std::fs::Permissions::from_mode(0o600);
        tokio::fs::set_permissions(&tmp_path, perms)
            .await
            .map_err(|e| Error::Io(format!("setting credential file permissions: {e}")))?;
    }

    tokio::fs::rename(&tmp_path, path)
        .await
        .map_err(|e| Error::Io(format!("renaming temp credential file: {e}")))?;

    debug!(path = %path.display(), "persisted credentials");
    Ok(())
}
