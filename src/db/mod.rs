pub mod models;

use chrono::{DateTime, Utc};
use std::path::{Path, PathBuf};
use thiserror::Error;
use tokio::fs;
use tokio::sync::Mutex;
use tracing::{debug, info};

use self::models::Content;

#[derive(Error, Debug)]
pub enum DatabaseError {
    #[error("Database file error at {path:?}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("Database serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("Invalid database content: {0}")]
    Invalid(String),
}

/// JSON-file backed store. Every read-modify-write goes through [`Database::write`],
/// which holds the lock for both the mutation and the save.
pub struct Database {
    path: PathBuf,
    content: Mutex<Content>,
}

impl Database {
    /// Loads the document at `path`, or writes the default document if the file is missing.
    pub async fn open(path: impl Into<PathBuf>) -> Result<Self, DatabaseError> {
        let path = path.into();
        let content = if fs::try_exists(&path).await.unwrap_or(false) {
            let raw = fs::read(&path).await.map_err(|source| DatabaseError::Io {
                path: path.clone(),
                source,
            })?;
            let mut content: Content = serde_json::from_slice(&raw)?;
            content.backfill_usage_bytes();
            content.settings.validate().map_err(DatabaseError::Invalid)?;
            info!(path = ?path, users = content.users.len(), nodes = content.nodes.len(), "Database loaded.");
            content
        } else {
            let content = Content::default();
            write_document(&path, &content).await?;
            info!(path = ?path, "Database file not found, default document written.");
            content
        };

        Ok(Self {
            path,
            content: Mutex::new(content),
        })
    }

    /// Wraps an in-memory document without touching disk until the first write.
    pub fn with_content(path: impl Into<PathBuf>, content: Content) -> Self {
        Self {
            path: path.into(),
            content: Mutex::new(content),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Runs `f` against a consistent view of the document.
    pub async fn read<R>(&self, f: impl FnOnce(&Content) -> R) -> R {
        let guard = self.content.lock().await;
        f(&guard)
    }

    /// Runs `f` with exclusive access and persists the document before releasing the lock.
    pub async fn write<R>(&self, f: impl FnOnce(&mut Content) -> R) -> Result<R, DatabaseError> {
        let mut guard = self.content.lock().await;
        let result = f(&mut guard);
        write_document(&self.path, &guard).await?;
        Ok(result)
    }

    /// Writes a copy of the document next to the database file, one slot per weekday and hour.
    pub async fn backup(&self, now: DateTime<Utc>) -> Result<PathBuf, DatabaseError> {
        let guard = self.content.lock().await;
        let path = backup_path(&self.path, now);
        write_document(&path, &guard).await?;
        debug!(path = ?path, "Database backup written.");
        Ok(path)
    }
}

fn backup_path(database_path: &Path, now: DateTime<Utc>) -> PathBuf {
    let name = format!("backup-{}.json", now.format("%a-%H")).to_lowercase();
    match database_path.parent() {
        Some(dir) => dir.join(name),
        None => PathBuf::from(name),
    }
}

async fn write_document(path: &Path, content: &Content) -> Result<(), DatabaseError> {
    let io_err = |source| DatabaseError::Io {
        path: path.to_path_buf(),
        source,
    };
    if let Some(dir) = path.parent() {
        if !dir.as_os_str().is_empty() {
            fs::create_dir_all(dir).await.map_err(io_err)?;
        }
    }
    let raw = serde_json::to_vec_pretty(content)?;
    fs::write(path, raw).await.map_err(io_err)
}
