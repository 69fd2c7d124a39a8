//! Statecraft SQLite state store
//!
//! Keeps every scope of a stage tree in one SQLite database:
//!
//! - `resources(id, scope_chain, data, updated_at)`: one JSON-encoded
//!   [`StoredState`] per resource, keyed by `(id, scope_chain)`
//! - `scopes(chain)`: scopes that have been initialized
//! - `schema_migrations(version)`: applied migrations
//!
//! All stores of a [`SqliteBackend`] share one connection behind a mutex.
//! Queries run on tokio's blocking pool.

mod error;
mod lock;
mod migrations;

pub use error::{Result, SqliteStoreError};
pub use lock::DatabaseLock;

use async_trait::async_trait;
use indexmap::IndexMap;
use rusqlite::{Connection, OptionalExtension, params};
use statecraft_core::state::StoredState;
use statecraft_core::store::{StateStore, StoreFactory, chain_key};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use tokio::sync::OnceCell;

type SharedConnection = Arc<Mutex<Connection>>;

struct Database {
    /// `None` for an in-memory database
    path: Option<PathBuf>,
    conn: OnceCell<SharedConnection>,
}

impl Database {
    async fn connection(&self) -> Result<SharedConnection> {
        let conn = self
            .conn
            .get_or_try_init(|| async { self.open().await })
            .await?;
        Ok(conn.clone())
    }

    async fn open(&self) -> Result<SharedConnection> {
        let Some(path) = self.path.clone() else {
            let mut conn = Connection::open_in_memory()?;
            migrations::migrate(&mut conn)?;
            return Ok(Arc::new(Mutex::new(conn)));
        };

        let lock = DatabaseLock::acquire(&path).await?;
        let opened = tokio::task::spawn_blocking(move || -> Result<Connection> {
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent)?;
            }
            let mut conn = Connection::open(&path)?;
            let applied = migrations::migrate(&mut conn)?;
            tracing::debug!(
                "Opened state database {} ({} migration(s) applied)",
                path.display(),
                applied
            );
            Ok(conn)
        })
        .await
        .map_err(|e| SqliteStoreError::Task(e.to_string()));
        lock.release().await?;

        Ok(Arc::new(Mutex::new(opened??)))
    }

    async fn run<T, F>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&mut Connection) -> Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let conn = self.connection().await?;
        tokio::task::spawn_blocking(move || {
            let mut conn = conn.lock().unwrap_or_else(|e| e.into_inner());
            f(&mut conn)
        })
        .await
        .map_err(|e| SqliteStoreError::Task(e.to_string()))?
    }
}

/// One SQLite database for a whole scope tree
#[derive(Clone)]
pub struct SqliteBackend {
    db: Arc<Database>,
}

impl SqliteBackend {
    /// Database at `path`, created and migrated on first use
    pub fn open(path: impl AsRef<Path>) -> Self {
        Self::with_path(Some(path.as_ref().to_path_buf()))
    }

    pub fn in_memory() -> Self {
        Self::with_path(None)
    }

    fn with_path(path: Option<PathBuf>) -> Self {
        Self {
            db: Arc::new(Database {
                path,
                conn: OnceCell::new(),
            }),
        }
    }

    pub fn path(&self) -> Option<&Path> {
        self.db.path.as_deref()
    }

    pub fn store(&self, chain: &[String]) -> SqliteStateStore {
        SqliteStateStore {
            db: self.db.clone(),
            chain: chain_key(chain),
        }
    }

    /// Chains of every initialized scope, sorted
    pub async fn scopes(&self) -> Result<Vec<String>> {
        self.db
            .run(|conn| {
                let mut stmt = conn.prepare("SELECT chain FROM scopes ORDER BY chain")?;
                let chains = stmt
                    .query_map([], |row| row.get(0))?
                    .collect::<rusqlite::Result<Vec<String>>>()?;
                Ok(chains)
            })
            .await
    }

    pub async fn schema_version(&self) -> Result<u32> {
        self.db
            .run(|conn| migrations::current_version(conn))
            .await
    }
}

impl StoreFactory for SqliteBackend {
    fn create(&self, chain: &[String]) -> Arc<dyn StateStore> {
        Arc::new(self.store(chain))
    }
}

/// Rows of one scope chain
pub struct SqliteStateStore {
    db: Arc<Database>,
    chain: String,
}

impl SqliteStateStore {
    pub fn chain(&self) -> &str {
        &self.chain
    }
}

#[async_trait]
impl StateStore for SqliteStateStore {
    async fn init(&self) -> statecraft_core::Result<()> {
        let chain = self.chain.clone();
        self.db
            .run(move |conn| {
                conn.execute(
                    "INSERT OR IGNORE INTO scopes (chain, created_at) VALUES (?1, ?2)",
                    params![chain, chrono::Utc::now().to_rfc3339()],
                )?;
                Ok(())
            })
            .await?;
        Ok(())
    }

    async fn deinit(&self) -> statecraft_core::Result<()> {
        let chain = self.chain.clone();
        self.db
            .run(move |conn| {
                conn.execute(
                    "DELETE FROM scopes WHERE chain = ?1
                     AND NOT EXISTS (SELECT 1 FROM resources WHERE scope_chain = ?1)",
                    params![chain],
                )?;
                Ok(())
            })
            .await?;
        Ok(())
    }

    async fn list(&self) -> statecraft_core::Result<Vec<String>> {
        let chain = self.chain.clone();
        let ids = self
            .db
            .run(move |conn| {
                let mut stmt =
                    conn.prepare("SELECT id FROM resources WHERE scope_chain = ?1 ORDER BY id")?;
                let ids = stmt
                    .query_map(params![chain], |row| row.get(0))?
                    .collect::<rusqlite::Result<Vec<String>>>()?;
                Ok(ids)
            })
            .await?;
        Ok(ids)
    }

    async fn count(&self) -> statecraft_core::Result<usize> {
        let chain = self.chain.clone();
        let count = self
            .db
            .run(move |conn| {
                let count: i64 = conn.query_row(
                    "SELECT COUNT(*) FROM resources WHERE scope_chain = ?1",
                    params![chain],
                    |row| row.get(0),
                )?;
                Ok(count as usize)
            })
            .await?;
        Ok(count)
    }

    async fn get(&self, id: &str) -> statecraft_core::Result<Option<StoredState>> {
        let chain = self.chain.clone();
        let id = id.to_string();
        let data = self
            .db
            .run(move |conn| {
                let data: Option<String> = conn
                    .query_row(
                        "SELECT data FROM resources WHERE scope_chain = ?1 AND id = ?2",
                        params![chain, id],
                        |row| row.get(0),
                    )
                    .optional()?;
                Ok(data)
            })
            .await?;
        match data {
            Some(data) => Ok(Some(serde_json::from_str(&data)?)),
            None => Ok(None),
        }
    }

    async fn all(&self) -> statecraft_core::Result<IndexMap<String, StoredState>> {
        let chain = self.chain.clone();
        let rows = self
            .db
            .run(move |conn| {
                let mut stmt = conn.prepare(
                    "SELECT id, data FROM resources WHERE scope_chain = ?1 ORDER BY id",
                )?;
                let rows = stmt
                    .query_map(params![chain], |row| Ok((row.get(0)?, row.get(1)?)))?
                    .collect::<rusqlite::Result<Vec<(String, String)>>>()?;
                Ok(rows)
            })
            .await?;

        let mut records = IndexMap::with_capacity(rows.len());
        for (id, data) in rows {
            records.insert(id, serde_json::from_str(&data)?);
        }
        Ok(records)
    }

    async fn set(&self, id: &str, state: &StoredState) -> statecraft_core::Result<()> {
        let chain = self.chain.clone();
        let id = id.to_string();
        let data = serde_json::to_string(state)?;
        let updated_at = state.updated_at.to_rfc3339();
        self.db
            .run(move |conn| {
                conn.execute(
                    "INSERT INTO resources (id, scope_chain, data, updated_at)
                     VALUES (?1, ?2, ?3, ?4)
                     ON CONFLICT (id, scope_chain)
                     DO UPDATE SET data = excluded.data, updated_at = excluded.updated_at",
                    params![id, chain, data, updated_at],
                )?;
                tracing::debug!("Saved state: {}/{}", chain, id);
                Ok(())
            })
            .await?;
        Ok(())
    }

    async fn delete(&self, id: &str) -> statecraft_core::Result<()> {
        let chain = self.chain.clone();
        let id = id.to_string();
        self.db
            .run(move |conn| {
                conn.execute(
                    "DELETE FROM resources WHERE scope_chain = ?1 AND id = ?2",
                    params![chain, id],
                )?;
                Ok(())
            })
            .await?;
        Ok(())
    }
}
