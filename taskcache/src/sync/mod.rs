//! Server collaborator abstraction and the synchronizer driving it.
//!
//! Defines the [`TaskApi`] trait the [`Synchronizer`] talks to. Concrete
//! implementations:
//! - [`loopback::LoopbackApi`]: in-process server stand-in, optionally
//!   persisted to a [`FileSlot`](crate::cache::FileSlot)
//! - [`offline::OfflineApi`]: every call fails with [`ApiError::Offline`]

pub mod engine;
pub mod loopback;
pub mod offline;

pub use engine::{RefreshOutcome, SyncError, SyncOptions, Synchronizer};
pub use loopback::{ApiCall, LoopbackApi};
pub use offline::OfflineApi;

use std::future::Future;
use std::sync::Arc;

use taskcache_proto::api::{CreateTask, TaskUpdate, UpdateAck};
use taskcache_proto::snapshot::Snapshot;
use taskcache_proto::task::{RecordError, TaskId, TaskRecord};

/// Errors returned by a [`TaskApi`] call.
///
/// None of these are fatal: the optimistic local state stands and the
/// failure is logged.
#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    /// The server cannot be reached.
    #[error("server unreachable")]
    Offline,

    /// The server answered with a non-success status.
    #[error("server returned status {0}")]
    Status(u16),

    /// The server does not hold the referenced task.
    #[error("task {0} not found on server")]
    NotFound(TaskId),

    /// The server answered with a record that fails validation.
    #[error("server returned an invalid record: {0}")]
    InvalidRecord(#[from] RecordError),

    /// Any other transport-level failure.
    #[error("transport error: {0}")]
    Transport(String),
}

/// Async interface to the task server.
///
/// Update calls are never issued for provisional ids; the synchronizer holds
/// them back until the id resolves.
pub trait TaskApi: Send + Sync {
    /// Fetches every task the server holds for this user.
    fn fetch_all(&self) -> impl Future<Output = Result<Snapshot, ApiError>> + Send;

    /// Creates a task. The response carries the canonical id.
    fn create(
        &self,
        request: &CreateTask,
    ) -> impl Future<Output = Result<TaskRecord, ApiError>> + Send;

    /// Applies a partial update to a canonical task.
    fn update(
        &self,
        id: &TaskId,
        update: &TaskUpdate,
    ) -> impl Future<Output = Result<UpdateAck, ApiError>> + Send;

    /// Deletes a task. The caller does not wait for or retry this.
    fn delete(&self, id: &TaskId) -> impl Future<Output = Result<(), ApiError>> + Send;
}

impl<T: TaskApi> TaskApi for Arc<T> {
    fn fetch_all(&self) -> impl Future<Output = Result<Snapshot, ApiError>> + Send {
        (**self).fetch_all()
    }

    fn create(
        &self,
        request: &CreateTask,
    ) -> impl Future<Output = Result<TaskRecord, ApiError>> + Send {
        (**self).create(request)
    }

    fn update(
        &self,
        id: &TaskId,
        update: &TaskUpdate,
    ) -> impl Future<Output = Result<UpdateAck, ApiError>> + Send {
        (**self).update(id, update)
    }

    fn delete(&self, id: &TaskId) -> impl Future<Output = Result<(), ApiError>> + Send {
        (**self).delete(id)
    }
}
