//! Advisory lock file guarding database creation and migration

use crate::error::{Result, SqliteStoreError};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tokio::fs;
use tokio::io::AsyncWriteExt;

/// Locks older than this are assumed abandoned
const STALE_AFTER_MINUTES: i64 = 10;

#[derive(Debug, Serialize, Deserialize)]
struct LockInfo {
    holder: String,
    pid: u32,
    acquired_at: DateTime<Utc>,
}

/// RAII guard for the lock file; removed on release or drop
#[derive(Debug)]
pub struct DatabaseLock {
    lock_path: PathBuf,
    released: bool,
}

impl DatabaseLock {
    /// `<database>.lock`
    pub fn path_for(db_path: &Path) -> PathBuf {
        let mut name = db_path.as_os_str().to_owned();
        name.push(".lock");
        PathBuf::from(name)
    }

    pub async fn acquire(db_path: &Path) -> Result<Self> {
        let lock_path = Self::path_for(db_path);
        if let Some(parent) = lock_path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent).await?;
            }
        }

        let info = LockInfo {
            holder: std::env::var("HOSTNAME")
                .or_else(|_| std::env::var("HOST"))
                .unwrap_or_else(|_| "unknown".to_string()),
            pid: std::process::id(),
            acquired_at: Utc::now(),
        };
        let content = serde_json::to_string_pretty(&info)?;

        // One retry after a stale lock is cleared
        for _ in 0..2 {
            match fs::OpenOptions::new()
                .write(true)
                .create_new(true)
                .open(&lock_path)
                .await
            {
                Ok(mut file) => {
                    file.write_all(content.as_bytes()).await?;
                    file.sync_all().await?;
                    tracing::debug!("Acquired database lock {}", lock_path.display());
                    return Ok(Self {
                        lock_path,
                        released: false,
                    });
                }
                Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
                    Self::clear_if_stale(&lock_path).await?;
                }
                Err(e) => return Err(e.into()),
            }
        }

        Err(Self::held_by(&lock_path).await)
    }

    /// Remove the lock file when its holder has been gone long enough
    async fn clear_if_stale(lock_path: &Path) -> Result<()> {
        let content = fs::read_to_string(lock_path).await.unwrap_or_default();
        match serde_json::from_str::<LockInfo>(&content) {
            Ok(info) => {
                let age = Utc::now().signed_duration_since(info.acquired_at);
                if age.num_minutes() < STALE_AFTER_MINUTES {
                    return Err(SqliteStoreError::Locked {
                        holder: format!("{} (pid {})", info.holder, info.pid),
                        since: info.acquired_at.to_rfc3339(),
                    });
                }
                tracing::warn!("Removing stale database lock held by {}", info.holder);
            }
            // A holder may not have written its info yet; judge by mtime
            Err(_) => {
                let modified = match fs::metadata(lock_path).await {
                    Ok(meta) => meta.modified().map(DateTime::<Utc>::from).ok(),
                    Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
                    Err(e) => return Err(e.into()),
                };
                let modified = modified.unwrap_or_else(Utc::now);
                if Utc::now().signed_duration_since(modified).num_minutes() < STALE_AFTER_MINUTES {
                    return Err(SqliteStoreError::Locked {
                        holder: "unknown".to_string(),
                        since: modified.to_rfc3339(),
                    });
                }
                tracing::warn!("Removing unreadable lock file {}", lock_path.display());
            }
        }

        match fs::remove_file(lock_path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    async fn held_by(lock_path: &Path) -> SqliteStoreError {
        let content = fs::read_to_string(lock_path).await.unwrap_or_default();
        match serde_json::from_str::<LockInfo>(&content) {
            Ok(info) => SqliteStoreError::Locked {
                holder: format!("{} (pid {})", info.holder, info.pid),
                since: info.acquired_at.to_rfc3339(),
            },
            Err(_) => SqliteStoreError::Locked {
                holder: "unknown".to_string(),
                since: Utc::now().to_rfc3339(),
            },
        }
    }

    pub async fn release(mut self) -> Result<()> {
        if !self.released {
            match fs::remove_file(&self.lock_path).await {
                Ok(()) => tracing::debug!("Released database lock"),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(e.into()),
            }
            self.released = true;
        }
        Ok(())
    }
}

impl Drop for DatabaseLock {
    fn drop(&mut self) {
        if !self.released {
            let _ = std::fs::remove_file(&self.lock_path);
        }
    }
}
