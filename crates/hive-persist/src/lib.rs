//! JSON snapshot persistence.
//!
//! A [`JsonStore`] owns one `<name>.json` file inside a state directory and
//! writes whole snapshots of a serializable value to it. Writes go to a
//! sibling temporary file first and are then renamed into place, so a crash
//! mid-write never leaves a truncated snapshot behind.

#![forbid(unsafe_code)]

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use serde::Serialize;
use serde::de::DeserializeOwned;
use thiserror::Error;
use tracing::{debug, warn};

/// Errors that can occur while reading or writing a snapshot.
#[derive(Debug, Error)]
pub enum PersistError {
    /// Filesystem error.
    #[error("io error on {path}: {source}")]
    Io {
        /// File involved.
        path: PathBuf,
        /// Underlying error.
        #[source]
        source: std::io::Error,
    },

    /// Snapshot could not be encoded or decoded.
    #[error("serialization error on {path}: {source}")]
    Serialization {
        /// File involved.
        path: PathBuf,
        /// Underlying error.
        #[source]
        source: serde_json::Error,
    },
}

/// Result type for persistence operations.
pub type Result<T> = std::result::Result<T, PersistError>;

/// A single JSON snapshot file.
#[derive(Debug, Clone)]
pub struct JsonStore {
    path: PathBuf,
}

impl JsonStore {
    /// Create a store for `<state_dir>/<name>.json`.
    pub fn new(state_dir: &Path, name: &str) -> Self {
        Self {
            path: state_dir.join(format!("{name}.json")),
        }
    }

    /// Path of the snapshot file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Load the snapshot, falling back to `T::default()` when the file is
    /// missing or unreadable.
    pub fn load<T: DeserializeOwned + Default>(&self) -> T {
        match self.try_load() {
            Ok(value) => value,
            Err(e) => {
                warn!(error = %e, "failed to load snapshot, starting empty");
                T::default()
            }
        }
    }

    /// Load the snapshot. A missing file yields `T::default()`.
    ///
    /// # Errors
    ///
    /// Returns an error if the file exists but cannot be read or decoded.
    pub fn try_load<T: DeserializeOwned + Default>(&self) -> Result<T> {
        let bytes = match fs::read(&self.path) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!(path = %self.path.display(), "no snapshot yet");
                return Ok(T::default());
            }
            Err(source) => {
                return Err(PersistError::Io {
                    path: self.path.clone(),
                    source,
                });
            }
        };

        serde_json::from_slice(&bytes).map_err(|source| PersistError::Serialization {
            path: self.path.clone(),
            source,
        })
    }

    /// Write a snapshot atomically.
    ///
    /// # Errors
    ///
    /// Returns an error if the value cannot be encoded or the file cannot be
    /// written.
    pub fn save<T: Serialize>(&self, value: &T) -> Result<()> {
        let json = serde_json::to_vec_pretty(value).map_err(|source| {
            PersistError::Serialization {
                path: self.path.clone(),
                source,
            }
        })?;

        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent).map_err(|source| PersistError::Io {
                path: parent.to_path_buf(),
                source,
            })?;
        }

        let tmp = self.path.with_extension("json.tmp");
        let io_err = |source| PersistError::Io {
            path: tmp.clone(),
            source,
        };
        let mut file = fs::File::create(&tmp).map_err(io_err)?;
        file.write_all(&json).map_err(io_err)?;
        file.sync_all().map_err(io_err)?;
        drop(file);

        fs::rename(&tmp, &self.path).map_err(|source| PersistError::Io {
            path: self.path.clone(),
            source,
        })
    }
}
