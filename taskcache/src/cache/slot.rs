//! Durable key-value slots backing the [`Store`](super::Store).
//!
//! A slot stores whole blobs under string keys. Writes replace the blob
//! entirely; a reader never observes a partially written value.

use std::collections::HashMap;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::Mutex;

use super::StorageError;

/// A key-value slot holding serialized blobs.
pub trait StorageSlot: Send + Sync {
    /// Reads the blob stored under `key`, or `None` if nothing is stored.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError`] if the backend cannot be read.
    fn read(&self, key: &str) -> Result<Option<Vec<u8>>, StorageError>;

    /// Replaces the blob stored under `key`.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError`] if the backend refuses or fails the write.
    fn write(&self, key: &str, bytes: &[u8]) -> Result<(), StorageError>;
}

impl<T: StorageSlot + ?Sized> StorageSlot for Arc<T> {
    fn read(&self, key: &str) -> Result<Option<Vec<u8>>, StorageError> {
        (**self).read(key)
    }

    fn write(&self, key: &str, bytes: &[u8]) -> Result<(), StorageError> {
        (**self).write(key, bytes)
    }
}

/// In-memory slot, for tests and for running without durable storage.
///
/// Writes can be made to fail on demand to simulate a full quota.
#[derive(Debug, Default)]
pub struct MemorySlot {
    entries: Mutex<HashMap<String, Vec<u8>>>,
    failing: AtomicBool,
}

impl MemorySlot {
    /// Creates an empty slot.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes subsequent writes fail (`true`) or succeed (`false`).
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    /// Stores raw bytes directly, bypassing the failure switch.
    pub fn insert(&self, key: &str, bytes: impl Into<Vec<u8>>) {
        self.entries.lock().insert(key.to_string(), bytes.into());
    }

    /// Returns a copy of the raw bytes stored under `key`.
    #[must_use]
    pub fn get(&self, key: &str) -> Option<Vec<u8>> {
        self.entries.lock().get(key).cloned()
    }
}

impl StorageSlot for MemorySlot {
    fn read(&self, key: &str) -> Result<Option<Vec<u8>>, StorageError> {
        Ok(self.get(key))
    }

    fn write(&self, key: &str, bytes: &[u8]) -> Result<(), StorageError> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(StorageError::Unavailable("quota exceeded".to_string()));
        }
        self.insert(key, bytes);
        Ok(())
    }
}

/// Directory-backed slot: each key is a `<key>.json` file.
///
/// Writes go to a temp file in the same directory, are fsynced, and then
/// renamed over the target, so readers see either the old or the new blob.
#[derive(Debug, Clone)]
pub struct FileSlot {
    dir: PathBuf,
}

impl FileSlot {
    /// Creates a slot rooted at `dir`. The directory is created on first write.
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    /// Directory holding the slot files.
    #[must_use]
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Path of the file backing `key`.
    #[must_use]
    pub fn path_for(&self, key: &str) -> PathBuf {
        self.dir.join(format!("{key}.json"))
    }

    fn io_error(key: &str, source: std::io::Error) -> StorageError {
        StorageError::Io {
            key: key.to_string(),
            source,
        }
    }
}

impl StorageSlot for FileSlot {
    fn read(&self, key: &str) -> Result<Option<Vec<u8>>, StorageError> {
        match std::fs::read(self.path_for(key)) {
            Ok(bytes) => Ok(Some(bytes)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(Self::io_error(key, e)),
        }
    }

    fn write(&self, key: &str, bytes: &[u8]) -> Result<(), StorageError> {
        std::fs::create_dir_all(&self.dir).map_err(|e| Self::io_error(key, e))?;

        let path = self.path_for(key);
        let temp_path = self.dir.join(format!(".{key}.json.tmp.{}", std::process::id()));

        let mut file = std::fs::File::create(&temp_path).map_err(|e| Self::io_error(key, e))?;
        file.write_all(bytes).map_err(|e| Self::io_error(key, e))?;
        file.sync_all().map_err(|e| Self::io_error(key, e))?;
        drop(file);

        std::fs::rename(&temp_path, &path).map_err(|e| {
            let _ = std::fs::remove_file(&temp_path);
            Self::io_error(key, e)
        })
    }
}
