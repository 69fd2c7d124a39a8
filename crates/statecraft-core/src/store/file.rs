//! Flat-file state store
//!
//! One pretty-printed JSON document per resource:
//!
//! ```text
//! .statecraft/
//! └── prod/                  <- stage (root scope)
//!     ├── __salt__.json
//!     ├── database.json
//!     └── api/               <- nested scope
//!         └── worker.json
//! ```

use super::{StateStore, StoreFactory};
use crate::error::Result;
use crate::state::StoredState;
use async_trait::async_trait;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::fs;

/// Default state directory, relative to the project root
pub const STATE_DIR: &str = ".statecraft";

const RECORD_EXT: &str = "json";

/// Keeps every scope of a tree under one root directory
#[derive(Debug, Clone)]
pub struct FileSystemBackend {
    root: PathBuf,
}

impl FileSystemBackend {
    pub fn new(root: impl AsRef<Path>) -> Self {
        Self {
            root: root.as_ref().to_path_buf(),
        }
    }

    /// `<project_root>/.statecraft`
    pub fn in_project(project_root: impl AsRef<Path>) -> Self {
        Self::new(project_root.as_ref().join(STATE_DIR))
    }

    pub fn store(&self, chain: &[String]) -> FileSystemStateStore {
        let dir = chain
            .iter()
            .fold(self.root.clone(), |dir, part| dir.join(part));
        FileSystemStateStore { dir }
    }
}

impl StoreFactory for FileSystemBackend {
    fn create(&self, chain: &[String]) -> Arc<dyn StateStore> {
        Arc::new(self.store(chain))
    }
}

/// The directory holding one scope's records
#[derive(Debug, Clone)]
pub struct FileSystemStateStore {
    dir: PathBuf,
}

impl FileSystemStateStore {
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn record_path(&self, id: &str) -> PathBuf {
        self.dir.join(format!("{id}.{RECORD_EXT}"))
    }

    async fn ensure_dir(&self) -> Result<()> {
        if !self.dir.exists() {
            fs::create_dir_all(&self.dir).await?;
            tracing::debug!("Created state directory: {}", self.dir.display());
        }
        Ok(())
    }
}

#[async_trait]
impl StateStore for FileSystemStateStore {
    async fn init(&self) -> Result<()> {
        self.ensure_dir().await
    }

    async fn deinit(&self) -> Result<()> {
        let mut entries = match fs::read_dir(&self.dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(()),
            Err(e) => return Err(e.into()),
        };
        if entries.next_entry().await?.is_none() {
            fs::remove_dir(&self.dir).await?;
            tracing::debug!("Removed empty state directory: {}", self.dir.display());
        }
        Ok(())
    }

    async fn list(&self) -> Result<Vec<String>> {
        let mut entries = match fs::read_dir(&self.dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let mut ids = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            if !entry.file_type().await?.is_file() {
                continue;
            }
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some(RECORD_EXT) {
                continue;
            }
            if let Some(stem) = path.file_stem().and_then(|s| s.to_str()) {
                ids.push(stem.to_string());
            }
        }
        ids.sort();
        Ok(ids)
    }

    async fn get(&self, id: &str) -> Result<Option<StoredState>> {
        let content = match fs::read_to_string(self.record_path(id)).await {
            Ok(content) => content,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        Ok(Some(serde_json::from_str(&content)?))
    }

    async fn set(&self, id: &str, state: &StoredState) -> Result<()> {
        self.ensure_dir().await?;

        // Write to a temp file and rename so a crash never leaves half a record
        let path = self.record_path(id);
        let tmp = self.dir.join(format!(".{id}.{RECORD_EXT}.tmp"));
        let content = serde_json::to_string_pretty(state)?;
        fs::write(&tmp, content).await?;
        fs::rename(&tmp, &path).await?;

        tracing::debug!("Saved state: {}", path.display());
        Ok(())
    }

    async fn delete(&self, id: &str) -> Result<()> {
        match fs::remove_file(self.record_path(id)).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}
