//! In-memory state store
//!
//! Records live in a map shared by every scope of a [`MemoryBackend`], so a
//! second scope tree built on the same backend sees what the first one wrote.
//! Useful for tests and for one-shot runs that need no persistence.

use super::{StateStore, StoreFactory, chain_key};
use crate::error::Result;
use crate::state::StoredState;
use async_trait::async_trait;
use indexmap::IndexMap;
use std::sync::Arc;
use tokio::sync::RwLock;

type Records = IndexMap<(String, String), StoredState>;

/// Shared in-memory storage for a whole scope tree
#[derive(Clone, Default)]
pub struct MemoryBackend {
    records: Arc<RwLock<Records>>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Total number of records across all scopes
    pub async fn len(&self) -> usize {
        self.records.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.records.read().await.is_empty()
    }

    /// The store for one scope chain
    pub fn store(&self, chain: &[String]) -> MemoryStateStore {
        MemoryStateStore {
            records: self.records.clone(),
            chain: chain_key(chain),
        }
    }
}

impl StoreFactory for MemoryBackend {
    fn create(&self, chain: &[String]) -> Arc<dyn StateStore> {
        Arc::new(self.store(chain))
    }
}

/// Records of one scope inside a [`MemoryBackend`]
pub struct MemoryStateStore {
    records: Arc<RwLock<Records>>,
    chain: String,
}

impl MemoryStateStore {
    fn key(&self, id: &str) -> (String, String) {
        (self.chain.clone(), id.to_string())
    }
}

#[async_trait]
impl StateStore for MemoryStateStore {
    async fn list(&self) -> Result<Vec<String>> {
        Ok(self
            .records
            .read()
            .await
            .keys()
            .filter(|(chain, _)| *chain == self.chain)
            .map(|(_, id)| id.clone())
            .collect())
    }

    async fn get(&self, id: &str) -> Result<Option<StoredState>> {
        Ok(self.records.read().await.get(&self.key(id)).cloned())
    }

    async fn set(&self, id: &str, state: &StoredState) -> Result<()> {
        self.records
            .write()
            .await
            .insert(self.key(id), state.clone());
        Ok(())
    }

    async fn delete(&self, id: &str) -> Result<()> {
        self.records.write().await.shift_remove(&self.key(id));
        Ok(())
    }
}
