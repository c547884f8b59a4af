//! Client-held task cache.
//!
//! The cache is split into three cooperating parts:
//! - [`store::Store`] owns the ordered task collection and mirrors it into a
//!   [`slot::StorageSlot`] so it survives restarts.
//! - [`identity::IdentityResolver`] mints provisional ids and swaps them for
//!   server-assigned ids once a create is acknowledged.
//! - [`merge::merge_snapshot`] folds a fetched server snapshot into local state
//!   without losing unsynced local edits.

pub mod identity;
pub mod merge;
pub mod slot;
pub mod store;

pub use identity::{DeferredUpdate, IdentityResolver, Resolution};
pub use merge::{MergeOutcome, MergeReport, merge_snapshot};
pub use slot::{FileSlot, MemorySlot, StorageSlot};
pub use store::{STORAGE_KEY, Store, StoreEvent, TOMBSTONE_KEY};

use taskcache_proto::codec::CodecError;
use taskcache_proto::task::TaskId;
use thiserror::Error;

/// Errors returned synchronously when a local mutation is refused.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum TaskError {
    /// Task title cannot be empty.
    #[error("task title cannot be empty")]
    TitleEmpty,
    /// Task title exceeds the configured maximum length.
    #[error("task title too long (max {0} characters)")]
    TitleTooLong(usize),
    /// List name cannot be empty.
    #[error("list name cannot be empty")]
    ListEmpty,
    /// Task with the given ID was not found.
    #[error("task not found: {0}")]
    TaskNotFound(TaskId),
    /// Subtask with the given ID was not found on the task.
    #[error("subtask {subtask} not found on task {task}")]
    SubtaskNotFound {
        /// Parent task.
        task: TaskId,
        /// Missing subtask.
        subtask: TaskId,
    },
}

/// Errors from the persisted-storage layer.
///
/// These never escape the [`Store`]; they are logged and surfaced as
/// [`StoreEvent::PersistFailed`].
#[derive(Debug, Error)]
pub enum StorageError {
    /// The storage backend refused the write (quota exceeded, read-only, ...).
    #[error("storage unavailable: {0}")]
    Unavailable(String),

    /// An underlying I/O error occurred.
    #[error("storage I/O error for key {key}: {source}")]
    Io {
        /// Storage key being accessed.
        key: String,
        /// Underlying I/O error.
        source: std::io::Error,
    },

    /// The stored bytes could not be encoded or decoded.
    #[error("storage codec error: {0}")]
    Codec(#[from] CodecError),
}

/// Validates a title against the configured maximum length.
///
/// # Errors
///
/// Returns [`TaskError::TitleEmpty`] for blank titles or
/// [`TaskError::TitleTooLong`] if the title exceeds `max_len` characters.
pub fn validate_title(title: &str, max_len: usize) -> Result<(), TaskError> {
    if title.trim().is_empty() {
        return Err(TaskError::TitleEmpty);
    }
    if title.chars().count() > max_len {
        return Err(TaskError::TitleTooLong(max_len));
    }
    Ok(())
}
