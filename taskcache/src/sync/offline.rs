//! A [`TaskApi`] with no server behind it.

use taskcache_proto::api::{CreateTask, TaskUpdate, UpdateAck};
use taskcache_proto::snapshot::Snapshot;
use taskcache_proto::task::{TaskId, TaskRecord};

use super::{ApiError, TaskApi};

/// Fails every call with [`ApiError::Offline`].
///
/// Running against it exercises the purely local path: edits land in the
/// Store and persist, and nothing ever resolves.
#[derive(Debug, Clone, Copy, Default)]
pub struct OfflineApi;

impl TaskApi for OfflineApi {
    async fn fetch_all(&self) -> Result<Snapshot, ApiError> {
        Err(ApiError::Offline)
    }

    async fn create(&self, _request: &CreateTask) -> Result<TaskRecord, ApiError> {
        Err(ApiError::Offline)
    }

    async fn update(&self, _id: &TaskId, _update: &TaskUpdate) -> Result<UpdateAck, ApiError> {
        Err(ApiError::Offline)
    }

    async fn delete(&self, _id: &TaskId) -> Result<(), ApiError> {
        Err(ApiError::Offline)
    }
}
