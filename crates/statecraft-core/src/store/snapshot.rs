//! Read-only snapshot store for dry runs
//!
//! On `init` the scope's records are copied out of the wrapped store. Later
//! writes only touch the in-memory copy, so a dry run can exercise the full
//! apply path without mutating persisted state.

use super::{StateStore, StoreFactory};
use crate::error::Result;
use crate::state::StoredState;
use async_trait::async_trait;
use indexmap::IndexMap;
use std::sync::Arc;
use tokio::sync::RwLock;

/// Wraps another backend so nothing is ever written to it
pub struct SnapshotBackend {
    inner: Arc<dyn StoreFactory>,
}

impl SnapshotBackend {
    pub fn new(inner: Arc<dyn StoreFactory>) -> Self {
        Self { inner }
    }
}

impl StoreFactory for SnapshotBackend {
    fn create(&self, chain: &[String]) -> Arc<dyn StateStore> {
        Arc::new(SnapshotStateStore::new(self.inner.create(chain)))
    }
}

pub struct SnapshotStateStore {
    inner: Arc<dyn StateStore>,
    records: RwLock<Option<IndexMap<String, StoredState>>>,
}

impl SnapshotStateStore {
    pub fn new(inner: Arc<dyn StateStore>) -> Self {
        Self {
            inner,
            records: RwLock::new(None),
        }
    }

    async fn load(&self) -> Result<()> {
        let mut records = self.records.write().await;
        if records.is_none() {
            self.inner.init().await?;
            let snapshot = self.inner.all().await?;
            tracing::debug!("Loaded snapshot with {} records", snapshot.len());
            *records = Some(snapshot);
        }
        Ok(())
    }

    async fn with_records<T>(&self, f: impl FnOnce(&mut IndexMap<String, StoredState>) -> T) -> Result<T> {
        self.load().await?;
        let mut records = self.records.write().await;
        Ok(f(records.get_or_insert_with(IndexMap::new)))
    }
}

#[async_trait]
impl StateStore for SnapshotStateStore {
    async fn init(&self) -> Result<()> {
        self.load().await
    }

    async fn list(&self) -> Result<Vec<String>> {
        self.with_records(|records| records.keys().cloned().collect())
            .await
    }

    async fn get(&self, id: &str) -> Result<Option<StoredState>> {
        self.with_records(|records| records.get(id).cloned()).await
    }

    async fn set(&self, id: &str, state: &StoredState) -> Result<()> {
        self.with_records(|records| {
            records.insert(id.to_string(), state.clone());
        })
        .await
    }

    async fn delete(&self, id: &str) -> Result<()> {
        self.with_records(|records| {
            records.shift_remove(id);
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryBackend;
    use crate::store::memory::tests::record;

    #[tokio::test]
    async fn test_writes_do_not_reach_inner_store() {
        let backend = MemoryBackend::new();
        let chain = vec!["dev".to_string()];
        backend.store(&chain).set("a", &record("a", 0)).await.unwrap();

        let snapshot = SnapshotBackend::new(Arc::new(backend.clone())).create(&chain);
        snapshot.init().await.unwrap();
        assert_eq!(snapshot.list().await.unwrap(), vec!["a"]);

        snapshot.set("b", &record("b", 1)).await.unwrap();
        snapshot.delete("a").await.unwrap();
        assert_eq!(snapshot.list().await.unwrap(), vec!["b"]);

        let inner = backend.store(&chain);
        assert_eq!(inner.list().await.unwrap(), vec!["a"]);
    }
}
