//! State store contract
//!
//! A [`StateStore`] holds the records of exactly one scope. Backends are
//! shared by the whole scope tree and hand out one store per scope chain
//! through [`StoreFactory`]; records are therefore keyed by
//! `(resource id, scope chain)` and same-named resources in sibling scopes
//! never collide.

pub mod file;
pub mod memory;
pub mod snapshot;

pub use file::{FileSystemBackend, FileSystemStateStore};
pub use memory::{MemoryBackend, MemoryStateStore};
pub use snapshot::{SnapshotBackend, SnapshotStateStore};

use crate::error::Result;
use crate::state::StoredState;
use async_trait::async_trait;
use indexmap::IndexMap;
use std::sync::Arc;

/// Id of the per-stage salt record in the root scope store
pub const SALT_ID: &str = "__salt__";

/// Ids with this prefix are owned by the engine, never by resources
pub const RESERVED_PREFIX: &str = "__";

pub fn is_reserved_id(id: &str) -> bool {
    id.starts_with(RESERVED_PREFIX)
}

/// Storage for the records of a single scope
#[async_trait]
pub trait StateStore: Send + Sync {
    /// Prepare the backing medium; called before the first read or write
    async fn init(&self) -> Result<()> {
        Ok(())
    }

    /// Release the backing medium once the scope holds no records
    async fn deinit(&self) -> Result<()> {
        Ok(())
    }

    /// Ids of every record in the scope
    async fn list(&self) -> Result<Vec<String>>;

    async fn count(&self) -> Result<usize> {
        Ok(self.list().await?.len())
    }

    async fn get(&self, id: &str) -> Result<Option<StoredState>>;

    /// Records for the given ids; missing ids are left out
    async fn get_batch(&self, ids: &[String]) -> Result<IndexMap<String, StoredState>> {
        let mut found = IndexMap::with_capacity(ids.len());
        for id in ids {
            if let Some(state) = self.get(id).await? {
                found.insert(id.clone(), state);
            }
        }
        Ok(found)
    }

    async fn all(&self) -> Result<IndexMap<String, StoredState>> {
        let ids = self.list().await?;
        self.get_batch(&ids).await
    }

    async fn set(&self, id: &str, state: &StoredState) -> Result<()>;

    /// Removing a missing record is not an error
    async fn delete(&self, id: &str) -> Result<()>;
}

/// Creates the store for a scope chain (`[stage, scope, ...]`)
pub trait StoreFactory: Send + Sync {
    fn create(&self, chain: &[String]) -> Arc<dyn StateStore>;
}

impl<F> StoreFactory for F
where
    F: Fn(&[String]) -> Arc<dyn StateStore> + Send + Sync,
{
    fn create(&self, chain: &[String]) -> Arc<dyn StateStore> {
        self(chain)
    }
}

/// Storage key for a scope chain in backends that flatten it into one column
pub fn chain_key(chain: &[String]) -> String {
    chain.join("/")
}
