//! The synchronizer: optimistic local mutations plus background server calls.
//!
//! Every mutation runs synchronously against the [`Store`] (which persists
//! it) and then schedules a best-effort server call on a tokio [`JoinSet`].
//! Nothing waits for the network. Responses are folded back in through the
//! [`IdentityResolver`] (for creates) or the [`merge_snapshot`] field
//! ownership rules (for fetches), so a late response never overwrites a newer
//! local edit.
//!
//! # Architecture
//!
//! ```text
//! caller ──mutation──▶ Store (sync, persisted) ──▶ StoreEvent subscribers
//!                        │
//!                        └──spawn──▶ TaskApi call ──response──▶ resolver / merge
//! ```
//!
//! All state sits behind one mutex that is never held across an `.await`.

use std::collections::{HashSet, VecDeque};
use std::future::Future;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::runtime::Handle;
use tokio::sync::broadcast;
use tokio::task::JoinSet;

use taskcache_proto::api::{CreateTask, TaskUpdate, UpdateAck};
use taskcache_proto::snapshot::Snapshot;
use taskcache_proto::task::{MAX_TASK_TITLE_LENGTH, Subtask, Task, TaskId, TaskRecord};

use super::{ApiError, TaskApi};
use crate::cache::{
    DeferredUpdate, IdentityResolver, MergeReport, Resolution, StorageSlot, Store, StoreEvent,
    TaskError, merge_snapshot, validate_title,
};
use crate::lists::{DEFAULT_LISTS, ListRegistry};

/// Errors constructing a [`Synchronizer`].
#[derive(Debug, thiserror::Error)]
pub enum SyncError {
    /// The synchronizer spawns server calls and must be built inside a
    /// tokio runtime.
    #[error("no tokio runtime available: {0}")]
    NoRuntime(#[from] tokio::runtime::TryCurrentError),
}

/// Tunables for a [`Synchronizer`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncOptions {
    /// Maximum task and subtask title length in characters.
    pub max_title_len: usize,
    /// Lists that always exist.
    pub default_lists: Vec<String>,
}

impl Default for SyncOptions {
    fn default() -> Self {
        Self {
            max_title_len: MAX_TASK_TITLE_LENGTH,
            default_lists: DEFAULT_LISTS.iter().map(ToString::to_string).collect(),
        }
    }
}

/// What a [`Synchronizer::refresh`] did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RefreshOutcome {
    /// A snapshot was fetched and merged.
    Merged(MergeReport),
    /// The fetch failed; local state is unchanged.
    Offline,
}

struct SyncState<S: StorageSlot> {
    store: Store<S>,
    resolver: IdentityResolver,
    lists: ListRegistry,
    /// Provisional tasks whose create call has not answered yet.
    creating: HashSet<TaskId>,
    /// Members of `creating` the user deleted before the response arrived.
    deleted_while_creating: HashSet<TaskId>,
}

struct Shared<S: StorageSlot, A: TaskApi> {
    state: Mutex<SyncState<S>>,
    api: A,
    in_flight: Mutex<JoinSet<()>>,
    runtime: Handle,
    max_title_len: usize,
}

/// Coordinates the Store, the Identity Resolver, and the server.
///
/// Cloning yields another handle to the same synchronizer.
pub struct Synchronizer<S: StorageSlot + 'static, A: TaskApi + 'static> {
    shared: Arc<Shared<S, A>>,
}

impl<S: StorageSlot + 'static, A: TaskApi + 'static> Clone for Synchronizer<S, A> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl<S: StorageSlot + 'static, A: TaskApi + 'static> Synchronizer<S, A> {
    /// Wraps an already restored `store` and an `api`.
    ///
    /// The resolver is seeded past every provisional id in the store, and
    /// every list name the store uses is registered.
    ///
    /// # Errors
    ///
    /// Returns [`SyncError::NoRuntime`] outside a tokio runtime.
    pub fn new(store: Store<S>, api: A, options: SyncOptions) -> Result<Self, SyncError> {
        let runtime = Handle::try_current()?;
        let resolver = IdentityResolver::seeded(store.tasks());
        let mut lists = ListRegistry::new(options.default_lists);
        for task in store.tasks() {
            lists.ensure(&task.list);
        }
        Ok(Self {
            shared: Arc::new(Shared {
                state: Mutex::new(SyncState {
                    store,
                    resolver,
                    lists,
                    creating: HashSet::new(),
                    deleted_while_creating: HashSet::new(),
                }),
                api,
                in_flight: Mutex::new(JoinSet::new()),
                runtime,
                max_title_len: options.max_title_len,
            }),
        })
    }

    /// The server collaborator.
    #[must_use]
    pub fn api(&self) -> &A {
        &self.shared.api
    }

    // ── Reads ──────────────────────────────────────────────────────

    /// Returns a copy of the task with the given id.
    #[must_use]
    pub fn get(&self, id: &TaskId) -> Option<Task> {
        self.shared.state.lock().store.get(id).cloned()
    }

    /// Copies of all tasks in order, optionally restricted to one list.
    #[must_use]
    pub fn tasks(&self, list: Option<&str>) -> Vec<Task> {
        self.shared
            .state
            .lock()
            .store
            .all(list)
            .into_iter()
            .cloned()
            .collect()
    }

    /// Known list names.
    #[must_use]
    pub fn lists(&self) -> Vec<String> {
        self.shared
            .state
            .lock()
            .lists
            .names()
            .map(ToString::to_string)
            .collect()
    }

    /// Registers a list name without creating a task in it.
    ///
    /// # Errors
    ///
    /// Returns [`TaskError::ListEmpty`] for a blank name.
    pub fn add_list(&self, name: &str) -> Result<bool, TaskError> {
        if name.trim().is_empty() {
            return Err(TaskError::ListEmpty);
        }
        Ok(self.shared.state.lock().lists.ensure(name))
    }

    /// Subscribes to Store change notifications.
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<StoreEvent> {
        self.shared.state.lock().store.subscribe()
    }

    /// Number of updates waiting for an id to resolve.
    #[must_use]
    pub fn deferred_len(&self) -> usize {
        self.shared.state.lock().resolver.deferred().len()
    }

    /// Number of failed Store saves so far.
    #[must_use]
    pub fn persist_failures(&self) -> u64 {
        self.shared.state.lock().store.persist_failures()
    }

    // ── Fetch and merge ────────────────────────────────────────────

    /// Fetches a snapshot and merges it into the Store.
    ///
    /// An unreachable server leaves local state untouched.
    pub async fn refresh(&self) -> RefreshOutcome {
        match self.shared.api.fetch_all().await {
            Ok(snapshot) => RefreshOutcome::Merged(self.apply_snapshot(&snapshot)),
            Err(err) => {
                tracing::warn!(error = %err, "fetch failed, keeping local state");
                RefreshOutcome::Offline
            }
        }
    }

    /// Merges an already fetched snapshot into the Store.
    pub fn apply_snapshot(&self, snapshot: &Snapshot) -> MergeReport {
        let (report, released, deletes) = {
            let mut guard = self.shared.state.lock();
            let state = &mut *guard;
            let outcome = merge_snapshot(state.store.tasks(), snapshot, state.store.tombstones());
            for task in &outcome.tasks {
                state.lists.ensure(&task.list);
            }
            let pending: HashSet<&TaskId> = outcome.pending_deletes.iter().collect();
            state.store.retain_tombstones(|id| pending.contains(id));
            state.store.replace_all(outcome.tasks);

            let mut released = Vec::new();
            for (provisional, canonical) in &outcome.resolutions {
                tracing::info!(provisional = %provisional, canonical = %canonical, "task resolved by snapshot");
                released.extend(state.resolver.rekey(provisional, canonical));
            }
            // Edits queued behind a provisional id are newer than the
            // snapshot; put them back on top of the adopted server fields.
            for deferred in &released {
                state
                    .store
                    .update(&deferred.task_id, |task| deferred.update.apply(task));
            }
            (outcome.report, released, outcome.pending_deletes)
        };

        let r = &report;
        tracing::info!(
            adopted = r.adopted,
            carried = r.carried,
            resolved = r.resolved,
            retained = r.retained,
            dropped = r.dropped,
            deduplicated = r.deduplicated,
            skipped = r.skipped,
            suppressed = r.suppressed,
            "snapshot merged"
        );
        if r.skipped > 0 {
            tracing::warn!(skipped = r.skipped, "snapshot contained malformed records");
        }

        Shared::send_updates(&self.shared, released);
        for id in deletes {
            tracing::info!(id = %id, "re-issuing delete for task still on server");
            Shared::send_delete(&self.shared, id);
        }
        report
    }

    /// Sends creates for provisional tasks with no create in flight.
    ///
    /// This is the explicit way to push tasks created while offline. Fields
    /// the create body does not carry (notes, subtasks) follow as deferred
    /// updates once the task resolves. Returns the number of creates sent.
    pub fn push_pending(&self) -> usize {
        let pending: Vec<Task> = {
            let mut guard = self.shared.state.lock();
            let state = &mut *guard;
            let pending: Vec<Task> = state
                .store
                .tasks()
                .iter()
                .filter(|t| t.id.is_provisional() && !state.creating.contains(&t.id))
                .cloned()
                .collect();
            for task in &pending {
                state.creating.insert(task.id.clone());
                let already_queued = state.resolver.deferred().iter().any(|d| d.task_id == task.id);
                if !already_queued {
                    for update in catch_up_updates(task) {
                        state.resolver.defer(task.id.clone(), update);
                    }
                }
            }
            pending
        };
        for task in &pending {
            Shared::send_create(&self.shared, task);
        }
        pending.len()
    }

    /// Waits until every in-flight server call, including follow-ups they
    /// schedule, has finished.
    pub async fn settle(&self) {
        loop {
            let mut batch = std::mem::take(&mut *self.shared.in_flight.lock());
            if batch.is_empty() {
                return;
            }
            while let Some(result) = batch.join_next().await {
                if let Err(err) = result {
                    tracing::warn!(error = %err, "server call task failed");
                }
            }
        }
    }

    // ── Task mutations ─────────────────────────────────────────────

    /// Creates a task under a fresh provisional id and sends the create.
    ///
    /// # Errors
    ///
    /// Returns [`TaskError`] for an invalid title or a blank list.
    pub fn add_task(&self, title: &str, list: &str) -> Result<TaskId, TaskError> {
        validate_title(title, self.shared.max_title_len)?;
        if list.trim().is_empty() {
            return Err(TaskError::ListEmpty);
        }
        let task = {
            let mut state = self.shared.state.lock();
            let id = state.resolver.mint();
            let task = Task::new(id.clone(), title, list);
            state.lists.ensure(list);
            state.store.upsert(task.clone());
            state.creating.insert(id);
            task
        };
        tracing::debug!(id = %task.id, list, "task added locally");
        Shared::send_create(&self.shared, &task);
        Ok(task.id)
    }

    /// Flips a task's completion flag. Returns the new value.
    ///
    /// # Errors
    ///
    /// Returns [`TaskError::TaskNotFound`] for an unknown id.
    pub fn toggle_task(&self, id: &TaskId) -> Result<bool, TaskError> {
        let completed = !self.require(id)?.completed;
        self.set_completed(id, completed)?;
        Ok(completed)
    }

    /// Sets a task's completion flag.
    ///
    /// # Errors
    ///
    /// Returns [`TaskError::TaskNotFound`] for an unknown id.
    pub fn set_completed(&self, id: &TaskId, completed: bool) -> Result<(), TaskError> {
        self.mutate(id, TaskUpdate::Completion { completed })
    }

    /// Moves a task to another list, registering the list if it is new.
    ///
    /// # Errors
    ///
    /// Returns [`TaskError::ListEmpty`] or [`TaskError::TaskNotFound`].
    pub fn move_task(&self, id: &TaskId, list: &str) -> Result<(), TaskError> {
        if list.trim().is_empty() {
            return Err(TaskError::ListEmpty);
        }
        self.require(id)?;
        self.shared.state.lock().lists.ensure(list);
        self.mutate(id, TaskUpdate::Move {
            list: list.to_string(),
        })
    }

    /// Renames a task.
    ///
    /// # Errors
    ///
    /// Returns [`TaskError`] for an invalid title or an unknown id.
    pub fn rename_task(&self, id: &TaskId, title: &str) -> Result<(), TaskError> {
        validate_title(title, self.shared.max_title_len)?;
        self.mutate(id, TaskUpdate::Title {
            title: title.to_string(),
        })
    }

    /// Replaces a task's notes.
    ///
    /// # Errors
    ///
    /// Returns [`TaskError::TaskNotFound`] for an unknown id.
    pub fn set_notes(&self, id: &TaskId, notes: &str) -> Result<(), TaskError> {
        self.mutate(id, TaskUpdate::Notes {
            notes: notes.to_string(),
        })
    }

    /// Deletes a task locally and sends a fire-and-forget delete.
    ///
    /// A provisional task is never sent; its queued updates are dropped, and
    /// if its create is still in flight the server copy is deleted when the
    /// response arrives.
    ///
    /// # Errors
    ///
    /// Returns [`TaskError::TaskNotFound`] for an unknown id.
    pub fn delete_task(&self, id: &TaskId) -> Result<Task, TaskError> {
        let removed = {
            let mut state = self.shared.state.lock();
            let removed = state
                .store
                .remove(id)
                .ok_or_else(|| TaskError::TaskNotFound(id.clone()))?;
            let dropped = state.resolver.forget(id);
            if dropped > 0 {
                tracing::debug!(id = %id, dropped, "dropped queued updates for deleted task");
            }
            if state.creating.contains(id) {
                state.deleted_while_creating.insert(id.clone());
            }
            removed
        };
        if !id.is_provisional() {
            Shared::send_delete(&self.shared, id.clone());
        }
        Ok(removed)
    }

    // ── Subtask mutations ──────────────────────────────────────────

    /// Appends a subtask under a fresh provisional id.
    ///
    /// # Errors
    ///
    /// Returns [`TaskError`] for an invalid title or an unknown task.
    pub fn add_subtask(&self, task_id: &TaskId, title: &str) -> Result<TaskId, TaskError> {
        validate_title(title, self.shared.max_title_len)?;
        self.require(task_id)?;
        let subtask_id = self.shared.state.lock().resolver.mint();
        self.mutate(task_id, TaskUpdate::AddSubtask {
            subtask: Subtask::new(subtask_id.clone(), title),
        })?;
        Ok(subtask_id)
    }

    /// Flips a subtask's completion flag. Returns the new value.
    ///
    /// # Errors
    ///
    /// Returns [`TaskError::TaskNotFound`] or [`TaskError::SubtaskNotFound`].
    pub fn toggle_subtask(&self, task_id: &TaskId, subtask_id: &TaskId) -> Result<bool, TaskError> {
        let completed = !self.require_subtask(task_id, subtask_id)?.completed;
        self.mutate(task_id, TaskUpdate::ToggleSubtask {
            subtask_id: subtask_id.clone(),
            completed,
        })?;
        Ok(completed)
    }

    /// Removes a subtask.
    ///
    /// # Errors
    ///
    /// Returns [`TaskError::TaskNotFound`] or [`TaskError::SubtaskNotFound`].
    pub fn remove_subtask(&self, task_id: &TaskId, subtask_id: &TaskId) -> Result<(), TaskError> {
        self.require_subtask(task_id, subtask_id)?;
        self.mutate(task_id, TaskUpdate::RemoveSubtask {
            subtask_id: subtask_id.clone(),
        })
    }

    fn require(&self, id: &TaskId) -> Result<Task, TaskError> {
        self.get(id).ok_or_else(|| TaskError::TaskNotFound(id.clone()))
    }

    fn require_subtask(&self, task_id: &TaskId, subtask_id: &TaskId) -> Result<Subtask, TaskError> {
        self.require(task_id)?
            .subtask(subtask_id)
            .cloned()
            .ok_or_else(|| TaskError::SubtaskNotFound {
                task: task_id.clone(),
                subtask: subtask_id.clone(),
            })
    }

    /// Applies `update` locally, then sends or defers it.
    fn mutate(&self, id: &TaskId, update: TaskUpdate) -> Result<(), TaskError> {
        let ready = {
            let mut state = self.shared.state.lock();
            match state.store.update(id, |task| update.apply(task)) {
                None => return Err(TaskError::TaskNotFound(id.clone())),
                Some(false) => {
                    return Err(TaskError::SubtaskNotFound {
                        task: id.clone(),
                        subtask: update.subtask_id().cloned().unwrap_or_else(|| id.clone()),
                    });
                }
                Some(true) => {}
            }
            if IdentityResolver::needs_deferral(id, &update) {
                state.resolver.defer(id.clone(), update);
                None
            } else {
                Some(DeferredUpdate {
                    task_id: id.clone(),
                    update,
                })
            }
        };
        if let Some(update) = ready {
            Shared::send_updates(&self.shared, vec![update]);
        }
        Ok(())
    }
}

impl<S: StorageSlot + 'static, A: TaskApi + 'static> Shared<S, A> {
    fn spawn(self: &Arc<Self>, call: impl Future<Output = ()> + Send + 'static) {
        let mut in_flight = self.in_flight.lock();
        // Reap finished calls so the set does not grow without a settle.
        while in_flight.try_join_next().is_some() {}
        in_flight.spawn_on(call, &self.runtime);
    }

    fn send_create(self: &Arc<Self>, task: &Task) {
        let shared = Arc::clone(self);
        let provisional = task.id.clone();
        let request = CreateTask::from(task);
        self.spawn(async move {
            let result = shared.api.create(&request).await;
            shared.on_created(&provisional, &request, result);
        });
    }

    fn on_created(
        self: &Arc<Self>,
        provisional: &TaskId,
        request: &CreateTask,
        result: Result<TaskRecord, ApiError>,
    ) {
        let incoming = result.and_then(|record| record.into_task().map_err(ApiError::from));
        let incoming = match incoming {
            Ok(task) => task,
            Err(err) => {
                tracing::warn!(id = %provisional, error = %err, "create failed, task stays provisional");
                let mut state = self.state.lock();
                state.creating.remove(provisional);
                state.deleted_while_creating.remove(provisional);
                return;
            }
        };

        // The server holds what the create body carried and nothing else.
        let mut base = Task::new(provisional.clone(), &request.title, &request.list);
        base.completed = request.completed;

        let canonical = incoming.id.clone();
        let (resolution, orphan) = {
            let mut guard = self.state.lock();
            let state = &mut *guard;
            state.creating.remove(provisional);
            let deleted = state.deleted_while_creating.remove(provisional);
            let resolution = state
                .resolver
                .resolve(&mut state.store, provisional, &base, incoming);
            // Only a user delete removes the server copy. A merge that already
            // resolved or dropped the provisional leaves the server alone.
            let orphan = resolution == Resolution::Orphaned
                && deleted
                && !state.store.contains(&canonical);
            if orphan {
                state.store.tombstone(canonical.clone());
            }
            (resolution, orphan)
        };

        match resolution {
            Resolution::Resolved { released, .. } => self.send_updates(released),
            Resolution::Orphaned if orphan => {
                tracing::info!(id = %canonical, "deleting server copy of a task removed before its create landed");
                self.send_delete(canonical);
            }
            Resolution::Orphaned => {}
        }
    }

    /// Sends updates one after another, in order, on a single task.
    fn send_updates(self: &Arc<Self>, updates: Vec<DeferredUpdate>) {
        if updates.is_empty() {
            return;
        }
        let shared = Arc::clone(self);
        self.spawn(async move {
            let mut queue = VecDeque::from(updates);
            while let Some(DeferredUpdate { task_id, update }) = queue.pop_front() {
                match shared.api.update(&task_id, &update).await {
                    Ok(UpdateAck::SubtaskCreated { subtask }) => {
                        if let TaskUpdate::AddSubtask { subtask: base } = &update {
                            queue.extend(shared.on_subtask_created(&task_id, base, subtask));
                        }
                    }
                    Ok(UpdateAck::Applied) => {}
                    Err(err) => {
                        tracing::warn!(id = %task_id, ?update, error = %err, "update failed, keeping local state");
                    }
                }
            }
        });
    }

    fn on_subtask_created(
        &self,
        task_id: &TaskId,
        base: &Subtask,
        incoming: Subtask,
    ) -> Vec<DeferredUpdate> {
        let mut guard = self.state.lock();
        let state = &mut *guard;
        match state
            .resolver
            .resolve_subtask(&mut state.store, task_id, &base.id, base, incoming)
        {
            Resolution::Resolved { released, .. } => released,
            Resolution::Orphaned => Vec::new(),
        }
    }

    fn send_delete(self: &Arc<Self>, id: TaskId) {
        let shared = Arc::clone(self);
        self.spawn(async move {
            if let Err(err) = shared.api.delete(&id).await {
                tracing::warn!(id = %id, error = %err, "delete failed, tombstone kept");
            }
        });
    }
}

/// Updates that bring a freshly created server task up to the local copy:
/// the create body carries only title, list, and completion.
fn catch_up_updates(task: &Task) -> Vec<TaskUpdate> {
    let mut updates = Vec::new();
    if !task.notes.is_empty() {
        updates.push(TaskUpdate::Notes {
            notes: task.notes.clone(),
        });
    }
    for subtask in &task.subtasks {
        let mut created = subtask.clone();
        created.completed = false;
        updates.push(TaskUpdate::AddSubtask { subtask: created });
        if subtask.completed {
            updates.push(TaskUpdate::ToggleSubtask {
                subtask_id: subtask.id.clone(),
                completed: true,
            });
        }
    }
    updates
}
