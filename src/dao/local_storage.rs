//! Durable per-device key/value storage used for offline snapshots.

use std::{
    fs,
    io::{self, ErrorKind},
    path::PathBuf,
};

use dashmap::DashMap;
use thiserror::Error;

/// Failures of the local durable storage.
#[derive(Debug, Error)]
pub enum LocalStorageError {
    /// Reading or writing the backing file failed.
    #[error("local storage i/o failed for key `{key}`")]
    Io {
        /// Key whose file was accessed.
        key: String,
        /// Error reported by the file system.
        #[source]
        source: io::Error,
    },
    /// Keys become file names and must stay simple.
    #[error("invalid local storage key `{0}`")]
    InvalidKey(String),
}

/// Durable string storage surviving page reloads / process restarts.
pub trait LocalStorage: Send + Sync {
    /// Value stored under `key`, or `None` when absent.
    fn get(&self, key: &str) -> Result<Option<String>, LocalStorageError>;
    /// Store `value` under `key`, replacing any earlier value.
    fn set(&self, key: &str, value: &str) -> Result<(), LocalStorageError>;
    /// Delete `key`. Missing keys are not an error.
    fn remove(&self, key: &str) -> Result<(), LocalStorageError>;
}

/// Storage keeping one file per key inside a directory.
#[derive(Debug, Clone)]
pub struct FileStorage {
    dir: PathBuf,
}

impl FileStorage {
    /// Use `dir` as storage root; it is created on the first write.
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    fn file_for(&self, key: &str) -> Result<PathBuf, LocalStorageError> {
        let valid = !key.is_empty()
            && key
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-'))
            && !key.starts_with('.');
        if !valid {
            return Err(LocalStorageError::InvalidKey(key.to_string()));
        }
        Ok(self.dir.join(format!("{key}.json")))
    }
}

impl LocalStorage for FileStorage {
    fn get(&self, key: &str) -> Result<Option<String>, LocalStorageError> {
        let path = self.file_for(key)?;
        match fs::read_to_string(path) {
            Ok(contents) => Ok(Some(contents)),
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(None),
            Err(source) => Err(LocalStorageError::Io {
                key: key.to_string(),
                source,
            }),
        }
    }

    fn set(&self, key: &str, value: &str) -> Result<(), LocalStorageError> {
        let path = self.file_for(key)?;
        let io_err = |source: io::Error| LocalStorageError::Io {
            key: key.to_string(),
            source,
        };
        fs::create_dir_all(&self.dir).map_err(io_err)?;
        // Readers only ever see a complete file.
        let tmp = path.with_extension("json.tmp");
        fs::write(&tmp, value).map_err(io_err)?;
        fs::rename(&tmp, &path).map_err(io_err)
    }

    fn remove(&self, key: &str) -> Result<(), LocalStorageError> {
        let path = self.file_for(key)?;
        match fs::remove_file(path) {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(()),
            Err(source) => Err(LocalStorageError::Io {
                key: key.to_string(),
                source,
            }),
        }
    }
}

/// Process-local storage, used when no durable location is configured.
#[derive(Debug, Default)]
pub struct MemoryStorage {
    entries: DashMap<String, String>,
}

impl MemoryStorage {
    /// Empty storage.
    pub fn new() -> Self {
        Self::default()
    }
}

impl LocalStorage for MemoryStorage {
    fn get(&self, key: &str) -> Result<Option<String>, LocalStorageError> {
        Ok(self.entries.get(key).map(|entry| entry.value().clone()))
    }

    fn set(&self, key: &str, value: &str) -> Result<(), LocalStorageError> {
        self.entries.insert(key.to_string(), value.to_string());
        Ok(())
    }

    fn remove(&self, key: &str) -> Result<(), LocalStorageError> {
        self.entries.remove(key);
        Ok(())
    }
}
