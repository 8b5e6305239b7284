//! State backends: where records and intents live.
//!
//! Today: a local directory, or memory for tests. The store only talks to
//! the trait, so a remote backend slots in without touching the executor.

use crate::error::{StateError, StateResult};
use crate::intent::Intent;
use clusterform_core::{ResourceAddress, StateRecord};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tokio::sync::Mutex;

#[async_trait::async_trait]
pub trait StateBackend: Send + Sync {
    async fn load_all(&self) -> StateResult<Vec<StateRecord>>;

    async fn put(&self, record: &StateRecord) -> StateResult<()>;

    async fn remove(&self, address: &ResourceAddress) -> StateResult<()>;

    async fn put_intent(&self, intent: &Intent) -> StateResult<()>;

    async fn clear_intent(&self, address: &ResourceAddress) -> StateResult<()>;

    async fn intents(&self) -> StateResult<Vec<Intent>>;

    /// Directory holding the run lock, for backends that support one.
    fn lock_dir(&self) -> Option<PathBuf> {
        None
    }

    /// Human-readable location.
    fn location(&self) -> String;
}

/// One JSON document per instance under `<dir>/records/`, intents under
/// `<dir>/intents/`. Writes go to a temp file that is renamed into place.
pub struct LocalFsBackend {
    dir: PathBuf,
}

impl LocalFsBackend {
    pub fn new(dir: impl AsRef<Path>) -> Self {
        Self {
            dir: dir.as_ref().to_path_buf(),
        }
    }

    fn record_path(&self, address: &ResourceAddress) -> PathBuf {
        self.dir
            .join("records")
            .join(format!("{}.json", address.file_stem()))
    }

    fn intent_path(&self, address: &ResourceAddress) -> PathBuf {
        self.dir
            .join("intents")
            .join(format!("{}.json", address.file_stem()))
    }

    async fn write_atomic<T: Serialize>(path: &Path, value: &T) -> StateResult<()> {
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let body = serde_json::to_vec_pretty(value)?;
        let tmp = path.with_extension("json.tmp");
        tokio::fs::write(&tmp, &body).await?;
        tokio::fs::rename(&tmp, path).await?;
        tracing::debug!("wrote {} ({} bytes)", path.display(), body.len());
        Ok(())
    }

    async fn remove_file(path: &Path) -> StateResult<()> {
        match tokio::fs::remove_file(path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    async fn read_dir<T: DeserializeOwned>(dir: &Path) -> StateResult<Vec<T>> {
        let mut entries = match tokio::fs::read_dir(dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };
        let mut paths = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) == Some("json") {
                paths.push(path);
            }
        }
        paths.sort();

        let mut out = Vec::with_capacity(paths.len());
        for path in paths {
            let text = tokio::fs::read_to_string(&path).await?;
            let value = serde_json::from_str(&text).map_err(|e| StateError::Corrupt {
                path: path.clone(),
                message: e.to_string(),
            })?;
            out.push(value);
        }
        Ok(out)
    }
}

#[async_trait::async_trait]
impl StateBackend for LocalFsBackend {
    async fn load_all(&self) -> StateResult<Vec<StateRecord>> {
        Self::read_dir(&self.dir.join("records")).await
    }

    async fn put(&self, record: &StateRecord) -> StateResult<()> {
        Self::write_atomic(&self.record_path(&record.address), record).await
    }

    async fn remove(&self, address: &ResourceAddress) -> StateResult<()> {
        Self::remove_file(&self.record_path(address)).await
    }

    async fn put_intent(&self, intent: &Intent) -> StateResult<()> {
        Self::write_atomic(&self.intent_path(&intent.address), intent).await
    }

    async fn clear_intent(&self, address: &ResourceAddress) -> StateResult<()> {
        Self::remove_file(&self.intent_path(address)).await
    }

    async fn intents(&self) -> StateResult<Vec<Intent>> {
        Self::read_dir(&self.dir.join("intents")).await
    }

    fn lock_dir(&self) -> Option<PathBuf> {
        Some(self.dir.clone())
    }

    fn location(&self) -> String {
        self.dir.display().to_string()
    }
}

/// Volatile backend for tests and dry runs.
#[derive(Default)]
pub struct MemoryBackend {
    records: Mutex<BTreeMap<ResourceAddress, StateRecord>>,
    intents: Mutex<BTreeMap<ResourceAddress, Intent>>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_records(records: impl IntoIterator<Item = StateRecord>) -> Self {
        Self {
            records: Mutex::new(records.into_iter().map(|r| (r.address.clone(), r)).collect()),
            intents: Mutex::default(),
        }
    }
}

#[async_trait::async_trait]
impl StateBackend for MemoryBackend {
    async fn load_all(&self) -> StateResult<Vec<StateRecord>> {
        Ok(self.records.lock().await.values().cloned().collect())
    }

    async fn put(&self, record: &StateRecord) -> StateResult<()> {
        self.records
            .lock()
            .await
            .insert(record.address.clone(), record.clone());
        Ok(())
    }

    async fn remove(&self, address: &ResourceAddress) -> StateResult<()> {
        self.records.lock().await.remove(address);
        Ok(())
    }

    async fn put_intent(&self, intent: &Intent) -> StateResult<()> {
        self.intents
            .lock()
            .await
            .insert(intent.address.clone(), intent.clone());
        Ok(())
    }

    async fn clear_intent(&self, address: &ResourceAddress) -> StateResult<()> {
        self.intents.lock().await.remove(address);
        Ok(())
    }

    async fn intents(&self) -> StateResult<Vec<Intent>> {
        Ok(self.intents.lock().await.values().cloned().collect())
    }

    fn location(&self) -> String {
        "memory".into()
    }
}
