//! In-process task server for tests and local runs.
//!
//! [`LoopbackApi`] keeps the server-side collection in memory and answers
//! calls the way the real server does: creates mint UUID v7 canonical ids,
//! `AddSubtask` mints a canonical subtask id, deletes are idempotent.
//!
//! Tests can take it offline with [`LoopbackApi::set_offline`] and hold
//! responses in flight with [`LoopbackApi::hold`] / [`LoopbackApi::release`]
//! to reproduce races between a response and later local edits. The server
//! effect of a held call happens immediately; only the response waits.

use std::sync::Arc;

use chrono::Utc;
use parking_lot::Mutex;
use tokio::sync::watch;
use uuid::Uuid;

use taskcache_proto::api::{CreateTask, TaskUpdate, UpdateAck};
use taskcache_proto::codec;
use taskcache_proto::snapshot::Snapshot;
use taskcache_proto::task::{Subtask, Task, TaskId, TaskRecord};

use super::{ApiError, TaskApi};
use crate::cache::StorageSlot;

/// Storage key for the server-side collection when a backing slot is used.
pub const REMOTE_KEY: &str = "tasks";

/// A call as received by the loopback server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ApiCall {
    /// `fetch_all`.
    FetchAll,
    /// `create`.
    Create(CreateTask),
    /// `update`.
    Update(TaskId, TaskUpdate),
    /// `delete`.
    Delete(TaskId),
}

#[derive(Default)]
struct ServerState {
    tasks: Vec<Task>,
    offline: bool,
    calls: Vec<ApiCall>,
}

/// In-process server stand-in. See the module docs.
pub struct LoopbackApi {
    state: Mutex<ServerState>,
    backing: Option<Arc<dyn StorageSlot>>,
    held: watch::Sender<bool>,
}

impl Default for LoopbackApi {
    fn default() -> Self {
        Self::new()
    }
}

impl LoopbackApi {
    /// Creates an empty, memory-only server.
    #[must_use]
    pub fn new() -> Self {
        let (held, _) = watch::channel(false);
        Self {
            state: Mutex::new(ServerState::default()),
            backing: None,
            held,
        }
    }

    /// Creates a server whose collection lives in `slot` under [`REMOTE_KEY`].
    ///
    /// # Errors
    ///
    /// Returns [`ApiError::Transport`] if the slot cannot be read or holds
    /// bytes that do not decode.
    pub fn open(slot: Arc<dyn StorageSlot>) -> Result<Self, ApiError> {
        let tasks = match slot.read(REMOTE_KEY) {
            Ok(Some(bytes)) => codec::decode_collection(&bytes)
                .map_err(|e| ApiError::Transport(format!("corrupt server data: {e}")))?,
            Ok(None) => Vec::new(),
            Err(e) => return Err(ApiError::Transport(e.to_string())),
        };
        tracing::debug!(tasks = tasks.len(), "loopback server opened");
        let mut api = Self::new();
        api.state.get_mut().tasks = tasks;
        api.backing = Some(slot);
        Ok(api)
    }

    /// Replaces the server-side collection.
    pub fn seed(&self, tasks: impl IntoIterator<Item = Task>) {
        let mut state = self.state.lock();
        state.tasks = tasks.into_iter().collect();
        self.persist(&state.tasks);
    }

    /// Adds a task server-side, as if another client created it.
    pub fn insert_remote(&self, task: Task) {
        let mut state = self.state.lock();
        state.tasks.push(task);
        self.persist(&state.tasks);
    }

    /// Removes a task server-side, as if another client deleted it.
    pub fn remove_remote(&self, id: &TaskId) {
        let mut state = self.state.lock();
        state.tasks.retain(|t| t.id != *id);
        self.persist(&state.tasks);
    }

    /// The server-side collection.
    #[must_use]
    pub fn tasks(&self) -> Vec<Task> {
        self.state.lock().tasks.clone()
    }

    /// Every call received so far, in arrival order.
    #[must_use]
    pub fn calls(&self) -> Vec<ApiCall> {
        self.state.lock().calls.clone()
    }

    /// Makes every subsequent call fail with [`ApiError::Offline`].
    pub fn set_offline(&self, offline: bool) {
        self.state.lock().offline = offline;
    }

    /// Holds responses of subsequent calls until [`Self::release`].
    pub fn hold(&self) {
        self.held.send_replace(true);
    }

    /// Lets held responses complete.
    pub fn release(&self) {
        self.held.send_replace(false);
    }

    fn persist(&self, tasks: &[Task]) {
        let Some(slot) = &self.backing else {
            return;
        };
        let result = codec::encode_collection(tasks)
            .map_err(crate::cache::StorageError::from)
            .and_then(|bytes| slot.write(REMOTE_KEY, &bytes));
        if let Err(err) = result {
            tracing::warn!(error = %err, "loopback server could not persist");
        }
    }

    /// Records the call and runs `effect` against the server state, unless
    /// offline.
    fn handle<T>(
        &self,
        call: ApiCall,
        effect: impl FnOnce(&mut Vec<Task>) -> Result<T, ApiError>,
    ) -> Result<T, ApiError> {
        let mut state = self.state.lock();
        if state.offline {
            return Err(ApiError::Offline);
        }
        state.calls.push(call);
        let result = effect(&mut state.tasks);
        if result.is_ok() {
            self.persist(&state.tasks);
        }
        result
    }

    async fn respond<T>(&self, result: Result<T, ApiError>) -> Result<T, ApiError> {
        let mut gate = self.held.subscribe();
        if gate.wait_for(|held| !*held).await.is_err() {
            return Err(ApiError::Transport("loopback server shut down".into()));
        }
        result
    }
}

fn canonical_id() -> TaskId {
    TaskId::new(Uuid::now_v7().to_string())
}

fn find<'a>(tasks: &'a mut [Task], id: &TaskId) -> Result<&'a mut Task, ApiError> {
    if id.is_provisional() {
        // The server never issued this id.
        return Err(ApiError::Status(422));
    }
    tasks
        .iter_mut()
        .find(|t| t.id == *id)
        .ok_or_else(|| ApiError::NotFound(id.clone()))
}

impl TaskApi for LoopbackApi {
    async fn fetch_all(&self) -> Result<Snapshot, ApiError> {
        let result = self.handle(ApiCall::FetchAll, |tasks| {
            Ok(Snapshot::from_tasks(tasks.iter().cloned()))
        });
        self.respond(result).await
    }

    async fn create(&self, request: &CreateTask) -> Result<TaskRecord, ApiError> {
        let result = self.handle(ApiCall::Create(request.clone()), |tasks| {
            if request.title.trim().is_empty() || request.list.trim().is_empty() {
                return Err(ApiError::Status(400));
            }
            let mut task = Task::new(canonical_id(), request.title.clone(), request.list.clone());
            task.completed = request.completed;
            task.created_at = Some(Utc::now());
            tasks.push(task.clone());
            Ok(TaskRecord::from(task))
        });
        self.respond(result).await
    }

    async fn update(&self, id: &TaskId, update: &TaskUpdate) -> Result<UpdateAck, ApiError> {
        let result = self.handle(ApiCall::Update(id.clone(), update.clone()), |tasks| {
            let task = find(tasks, id)?;
            if let TaskUpdate::AddSubtask { subtask } = update {
                let created = Subtask {
                    id: canonical_id(),
                    title: subtask.title.clone(),
                    completed: subtask.completed,
                };
                task.subtasks.push(created.clone());
                return Ok(UpdateAck::SubtaskCreated { subtask: created });
            }
            if update.subtask_id().is_some_and(TaskId::is_provisional) {
                return Err(ApiError::Status(422));
            }
            if update.apply(task) {
                Ok(UpdateAck::Applied)
            } else {
                Err(ApiError::Status(404))
            }
        });
        self.respond(result).await
    }

    async fn delete(&self, id: &TaskId) -> Result<(), ApiError> {
        let result = self.handle(ApiCall::Delete(id.clone()), |tasks| {
            tasks.retain(|t| t.id != *id);
            Ok(())
        });
        self.respond(result).await
    }
}
