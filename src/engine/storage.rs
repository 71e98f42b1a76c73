//! Filesystem layout and durable config persistence
//!
//! Maps the data root into its fixed layout (work-queue stores and
//! resource-log scopes live under it) and persists the engine configuration
//! with an atomic temp-write-rename.

use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use super::EngineConfig;
use super::error::{StorageError, StorageResult};
use super::identity::CanaryIdentifiers;

/// Storage manager for engine persistence
#[derive(Debug, Clone)]
pub struct Storage {
    root: PathBuf,
}

impl Storage {
    /// Create a new storage manager
    pub fn new(root: PathBuf) -> Self {
        Self { root }
    }

    /// Get the root directory
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Get the config file path
    pub fn config_path(&self) -> PathBuf {
        self.root.join("config.json")
    }

    /// Get the work-queue directory path
    pub fn workqueue_dir(&self) -> PathBuf {
        self.root.join("workqueue")
    }

    /// Get the resource-log directory path
    pub fn resourcelog_dir(&self) -> PathBuf {
        self.root.join("resourcelog")
    }

    /// Get the work-queue database path for one canary identity
    ///
    /// One store file per `{name, hash}` pair; the hash prefix keeps renamed
    /// copies of the same source from sharing state.
    pub fn workqueue_db_path(&self, identifiers: &CanaryIdentifiers) -> PathBuf {
        self.workqueue_dir().join(format!(
            "{}-{}.db",
            identifiers.name(),
            identifiers.short_hash()
        ))
    }

    /// Write data atomically to a file
    ///
    /// Temp file, fsync, rename, directory fsync: a reader either sees the
    /// previous content or all of the new content, crash included.
    pub fn write_atomic(&self, path: &Path, data: &[u8]) -> StorageResult<()> {
        let failed = |detail: String| StorageError::AtomicWriteFailed {
            path: path.to_path_buf(),
            detail,
        };

        let temp_path = path.with_extension("tmp");
        let mut file =
            File::create(&temp_path).map_err(|e| failed(format!("create temp: {e}")))?;
        file.write_all(data)
            .map_err(|e| failed(format!("write: {e}")))?;
        file.sync_all()
            .map_err(|e| failed(format!("sync temp: {e}")))?;
        drop(file);

        fs::rename(&temp_path, path).map_err(|e| failed(format!("rename: {e}")))?;

        if let Some(parent) = path.parent() {
            OpenOptions::new()
                .read(true)
                .open(parent)
                .and_then(|dir| dir.sync_all())
                .map_err(|e| failed(format!("sync dir: {e}")))?;
        }

        Ok(())
    }
}

/// Initialize storage directories for a new engine (idempotent)
pub fn init_storage(root: &Path) -> StorageResult<()> {
    let storage = Storage::new(root.to_path_buf());
    fs::create_dir_all(&storage.workqueue_dir())?;
    fs::create_dir_all(&storage.resourcelog_dir())?;
    Ok(())
}

/// Write engine configuration
pub fn write_config(config: &EngineConfig) -> StorageResult<()> {
    let storage = Storage::new(config.root.clone());
    let json = serde_json::to_vec_pretty(config)?;
    storage.write_atomic(&storage.config_path(), &json)
}

/// Load engine configuration
pub fn load_config(root: &Path) -> StorageResult<EngineConfig> {
    let config_path = Storage::new(root.to_path_buf()).config_path();
    if !config_path.exists() {
        return Err(StorageError::PathNotFound(config_path));
    }
    let data = fs::read(&config_path)?;
    Ok(serde_json::from_slice(&data)?)
}
