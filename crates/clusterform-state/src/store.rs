//! State Store
//!
//! Last-known provider-side state keyed by resource address. Records are
//! cached in memory and written through to the backend; a record is only
//! written after the provider call it describes has succeeded.
//!
//! Writers serialize per address via [`StateStore::lock`]; different
//! addresses never contend.

use crate::backend::{LocalFsBackend, MemoryBackend, StateBackend};
use crate::error::StateResult;
use crate::intent::Intent;
use crate::lock::{LockInfo, RunLock};
use chrono::Utc;
use clusterform_core::{ResourceAddress, StateRecord, StateSnapshot};
use dashmap::DashMap;
use std::path::Path;
use std::sync::Arc;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::{debug, info};

pub struct StateStore {
    backend: Arc<dyn StateBackend>,
    records: DashMap<ResourceAddress, StateRecord>,
    locks: DashMap<ResourceAddress, Arc<Mutex<()>>>,
}

impl StateStore {
    pub async fn open(backend: Arc<dyn StateBackend>) -> StateResult<Self> {
        let records: DashMap<_, _> = backend
            .load_all()
            .await?
            .into_iter()
            .map(|r| (r.address.clone(), r))
            .collect();
        debug!(location = %backend.location(), records = records.len(), "state loaded");
        Ok(Self {
            backend,
            records,
            locks: DashMap::new(),
        })
    }

    pub async fn open_local(dir: impl AsRef<Path>) -> StateResult<Self> {
        Self::open(Arc::new(LocalFsBackend::new(dir))).await
    }

    pub async fn in_memory() -> Self {
        Self {
            backend: Arc::new(MemoryBackend::new()),
            records: DashMap::new(),
            locks: DashMap::new(),
        }
    }

    pub fn location(&self) -> String {
        self.backend.location()
    }

    /// Point-in-time copy used as the diff baseline.
    pub fn snapshot(&self) -> StateSnapshot {
        StateSnapshot::from_records(self.records.iter().map(|r| r.value().clone()))
    }

    pub fn get(&self, address: &ResourceAddress) -> Option<StateRecord> {
        self.records.get(address).map(|r| r.value().clone())
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Exclusive access to one address.
    pub async fn lock(&self, address: &ResourceAddress) -> OwnedMutexGuard<()> {
        let mutex = self
            .locks
            .entry(address.clone())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone();
        mutex.lock_owned().await
    }

    /// Persist a record, bumping its version past the one it replaces.
    pub async fn commit(&self, mut record: StateRecord) -> StateResult<StateRecord> {
        record.version = self
            .records
            .get(&record.address)
            .map(|r| r.version + 1)
            .unwrap_or(1);
        record.updated_at = Utc::now();
        self.backend.put(&record).await?;
        self.records.insert(record.address.clone(), record.clone());
        debug!(address = %record.address, version = record.version, "state committed");
        Ok(record)
    }

    pub async fn remove(&self, address: &ResourceAddress) -> StateResult<Option<StateRecord>> {
        self.backend.remove(address).await?;
        Ok(self.records.remove(address).map(|(_, r)| r))
    }

    /// Remove the record only if it still describes object `id`. A replaced
    /// instance's record already points at the new object.
    pub async fn remove_if_id(&self, address: &ResourceAddress, id: &str) -> StateResult<bool> {
        let matches = self
            .records
            .get(address)
            .map(|r| r.id == id)
            .unwrap_or(false);
        if matches {
            self.remove(address).await?;
        }
        Ok(matches)
    }

    /// Make the store match `snapshot`: write changed records, drop missing ones.
    pub async fn sync(&self, snapshot: &StateSnapshot) -> StateResult<usize> {
        let mut written = 0;
        for record in snapshot.records() {
            let current = self.get(&record.address);
            let same = current
                .as_ref()
                .map(|c| c.id == record.id && c.inputs == record.inputs && c.outputs == record.outputs)
                .unwrap_or(false);
            if !same {
                self.commit(record.clone()).await?;
                written += 1;
            }
        }
        let stale: Vec<ResourceAddress> = self
            .records
            .iter()
            .filter(|r| snapshot.get(r.key()).is_none())
            .map(|r| r.key().clone())
            .collect();
        for address in stale {
            self.remove(&address).await?;
            written += 1;
        }
        Ok(written)
    }

    pub async fn begin(&self, intent: &Intent) -> StateResult<()> {
        self.backend.put_intent(intent).await
    }

    pub async fn finish(&self, address: &ResourceAddress) -> StateResult<()> {
        self.backend.clear_intent(address).await
    }

    pub async fn pending_intents(&self) -> StateResult<Vec<Intent>> {
        self.backend.intents().await
    }

    /// Take the run lock. Backends without a lock directory need none.
    pub fn lock_run(&self, run_id: &str, command: &str) -> StateResult<Option<RunLock>> {
        match self.backend.lock_dir() {
            Some(dir) => RunLock::acquire(&dir, LockInfo::new(run_id, command)).map(Some),
            None => Ok(None),
        }
    }

    pub fn break_lock(&self) -> StateResult<Option<LockInfo>> {
        match self.backend.lock_dir() {
            Some(dir) => {
                let held = RunLock::break_lock(&dir)?;
                if let Some(info) = &held {
                    info!(holder = %info, "removed run lock");
                }
                Ok(held)
            }
            None => Ok(None),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clusterform_core::Attributes;

    fn record(id: &str) -> StateRecord {
        StateRecord::new(
            ResourceAddress::keyed("cluster", "main", "ams3"),
            id,
            Attributes::new(),
            Attributes::new(),
            vec![],
        )
    }

    #[tokio::test]
    async fn commit_bumps_version() {
        let store = StateStore::in_memory().await;
        let first = store.commit(record("c-1")).await.unwrap();
        let second = store.commit(record("c-1")).await.unwrap();
        assert_eq!(first.version, 1);
        assert_eq!(second.version, 2);
        assert_eq!(store.len(), 1);
    }

    #[tokio::test]
    async fn remove_if_id_keeps_replacement() {
        let store = StateStore::in_memory().await;
        store.commit(record("c-new")).await.unwrap();
        let address = ResourceAddress::keyed("cluster", "main", "ams3");
        assert!(!store.remove_if_id(&address, "c-old").await.unwrap());
        assert!(store.get(&address).is_some());
        assert!(store.remove_if_id(&address, "c-new").await.unwrap());
        assert!(store.is_empty());
    }

    #[tokio::test]
    async fn reopen_local_store() {
        let tmp = tempfile::tempdir().unwrap();
        {
            let store = StateStore::open_local(tmp.path()).await.unwrap();
            store.commit(record("c-1")).await.unwrap();
        }
        let store = StateStore::open_local(tmp.path()).await.unwrap();
        let snap = store.snapshot();
        assert_eq!(snap.len(), 1);
        assert_eq!(snap.records().next().unwrap().version, 1);
    }

    #[tokio::test]
    async fn per_address_lock_is_exclusive() {
        let store = Arc::new(StateStore::in_memory().await);
        let address = ResourceAddress::new("namespace", "app");
        let guard = store.lock(&address).await;

        let other = ResourceAddress::new("namespace", "other");
        let _free = store.lock(&other).await;

        let contender = {
            let store = store.clone();
            let address = address.clone();
            tokio::spawn(async move {
                let _g = store.lock(&address).await;
            })
        };
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        assert!(!contender.is_finished());
        drop(guard);
        contender.await.unwrap();
    }
}
