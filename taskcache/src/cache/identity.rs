//! Provisional id minting and provisional-to-canonical resolution.
//!
//! A task created locally gets a provisional id (`local_<millis>`) right away
//! so the UI can show it. When the server acknowledges the create, the entry
//! is re-keyed to the canonical id with a three-way merge: fields the user
//! changed while the create was in flight keep their local value, everything
//! else comes from the server.
//!
//! Updates aimed at a provisional task (or a provisional subtask) cannot be
//! sent yet because the server does not know the id. They wait in a deferred
//! queue owned by the resolver and are released, re-keyed, once every id they
//! reference has resolved.

use std::time::{SystemTime, UNIX_EPOCH};

use taskcache_proto::api::TaskUpdate;
use taskcache_proto::task::{Subtask, Task, TaskId};

use super::slot::StorageSlot;
use super::store::Store;

/// An update waiting for the ids it references to resolve.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeferredUpdate {
    /// Target task. May still be provisional.
    pub task_id: TaskId,
    /// The update to send once `task_id` and any subtask id are canonical.
    pub update: TaskUpdate,
}

impl DeferredUpdate {
    fn is_ready(&self) -> bool {
        !self.task_id.is_provisional() && !blocked_on_subtask(&self.update)
    }
}

/// An update is blocked by its subtask id unless it is the create of that
/// subtask itself.
fn blocked_on_subtask(update: &TaskUpdate) -> bool {
    match update {
        TaskUpdate::AddSubtask { .. } => false,
        other => other.subtask_id().is_some_and(TaskId::is_provisional),
    }
}

/// Result of resolving a provisional id.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Resolution {
    /// The entry was re-keyed. `released` holds the deferred updates that
    /// no longer reference provisional ids, in the order they were queued.
    Resolved {
        /// The canonical id now held by the Store.
        canonical: TaskId,
        /// Updates ready to send.
        released: Vec<DeferredUpdate>,
    },
    /// The provisional entry was no longer in the Store (deleted locally or
    /// already resolved by a merge). Nothing changed.
    Orphaned,
}

/// Mints provisional ids and tracks updates deferred behind them.
#[derive(Debug, Default)]
pub struct IdentityResolver {
    last_suffix: u64,
    deferred: Vec<DeferredUpdate>,
}

impl IdentityResolver {
    /// Creates a resolver with an empty queue.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a resolver whose next id sorts after every provisional id in
    /// `tasks` (including subtask ids), so restored and new ids never collide.
    #[must_use]
    pub fn seeded(tasks: &[Task]) -> Self {
        let last_suffix = tasks
            .iter()
            .flat_map(|t| std::iter::once(&t.id).chain(t.subtasks.iter().map(|s| &s.id)))
            .filter_map(TaskId::provisional_suffix)
            .max()
            .unwrap_or(0);
        Self {
            last_suffix,
            deferred: Vec::new(),
        }
    }

    /// Mints a fresh provisional id from the wall clock.
    pub fn mint(&mut self) -> TaskId {
        self.mint_at(now_ms())
    }

    /// Mints a provisional id as if the clock read `now_ms`.
    ///
    /// The suffix is `max(now_ms, last + 1)`, so ids stay strictly increasing
    /// even if the clock stalls or steps backwards.
    pub fn mint_at(&mut self, now_ms: u64) -> TaskId {
        let suffix = now_ms.max(self.last_suffix.saturating_add(1));
        self.last_suffix = suffix;
        TaskId::provisional(suffix)
    }

    /// Returns `true` if `id` has the provisional shape.
    #[must_use]
    pub fn is_provisional(id: &TaskId) -> bool {
        id.is_provisional()
    }

    /// Returns `true` if `update` cannot be sent for `task_id` yet.
    #[must_use]
    pub fn needs_deferral(task_id: &TaskId, update: &TaskUpdate) -> bool {
        task_id.is_provisional() || blocked_on_subtask(update)
    }

    /// Queues an update behind unresolved ids.
    ///
    /// A `RemoveSubtask` whose matching `AddSubtask` is still queued cancels
    /// that add and any queued edits of the subtask instead of being queued
    /// itself; the server never hears of the subtask. Returns `false` in that
    /// case.
    pub fn defer(&mut self, task_id: TaskId, update: TaskUpdate) -> bool {
        if let TaskUpdate::RemoveSubtask { subtask_id } = &update {
            let add_queued = self.deferred.iter().any(|d| {
                d.task_id == task_id
                    && matches!(&d.update, TaskUpdate::AddSubtask { subtask } if subtask.id == *subtask_id)
            });
            if add_queued {
                let before = self.deferred.len();
                self.deferred
                    .retain(|d| d.task_id != task_id || d.update.subtask_id() != Some(subtask_id));
                tracing::debug!(
                    task = %task_id,
                    subtask = %subtask_id,
                    cancelled = before - self.deferred.len(),
                    "unsent subtask removed, cancelled queued updates"
                );
                return false;
            }
        }
        tracing::debug!(task = %task_id, ?update, "deferring update");
        self.deferred.push(DeferredUpdate { task_id, update });
        true
    }

    /// Drops every queued update for `task_id` (the task was deleted locally).
    pub fn forget(&mut self, task_id: &TaskId) -> usize {
        let before = self.deferred.len();
        self.deferred.retain(|d| d.task_id != *task_id);
        before - self.deferred.len()
    }

    /// The queued updates, oldest first.
    #[must_use]
    pub fn deferred(&self) -> &[DeferredUpdate] {
        &self.deferred
    }

    /// Resolves a provisional task against the server's create response.
    ///
    /// `base` is the task as it was when the create was sent and `incoming`
    /// is the validated server record. Fields where the current local record
    /// differs from `base` keep their local value; all others, plus the id
    /// and `createdAt`, come from `incoming`. The Store entry is re-keyed in
    /// place and the deferred queue follows it.
    pub fn resolve<S: StorageSlot>(
        &mut self,
        store: &mut Store<S>,
        provisional: &TaskId,
        base: &Task,
        incoming: Task,
    ) -> Resolution {
        let Some(local) = store.get(provisional) else {
            tracing::info!(
                provisional = %provisional,
                canonical = %incoming.id,
                "create acknowledged for a task no longer held locally"
            );
            return Resolution::Orphaned;
        };
        let merged = three_way(base, local, incoming);
        let canonical = merged.id.clone();
        store.replace(provisional, merged);
        tracing::info!(provisional = %provisional, canonical = %canonical, "task resolved");
        let released = self.rekey(provisional, &canonical);
        Resolution::Resolved {
            canonical,
            released,
        }
    }

    /// Re-keys queued updates from `from` to `to` and releases the ones that
    /// are now ready to send.
    ///
    /// Used directly when a merge resolves a provisional task by key.
    pub fn rekey(&mut self, from: &TaskId, to: &TaskId) -> Vec<DeferredUpdate> {
        for deferred in &mut self.deferred {
            if deferred.task_id == *from {
                deferred.task_id = to.clone();
            }
        }
        self.release()
    }

    /// Resolves a provisional subtask against the server's `AddSubtask`
    /// acknowledgment, using the same three-way rule as [`Self::resolve`].
    ///
    /// If the subtask was removed locally in the meantime, the queued
    /// removal is still re-keyed and released so the server copy goes too.
    pub fn resolve_subtask<S: StorageSlot>(
        &mut self,
        store: &mut Store<S>,
        task_id: &TaskId,
        provisional: &TaskId,
        base: &Subtask,
        incoming: Subtask,
    ) -> Resolution {
        let canonical = incoming.id.clone();
        let held = store.get(task_id).is_some_and(|t| t.subtask(provisional).is_some());
        if !held {
            if !store.contains(task_id) {
                tracing::info!(task = %task_id, "subtask acknowledged for a task no longer held locally");
                return Resolution::Orphaned;
            }
            self.rekey_subtask(task_id, provisional, &canonical);
            return Resolution::Resolved {
                canonical,
                released: self.release(),
            };
        }
        store.update(task_id, |task| {
            let Some(local) = task.subtask_mut(provisional) else {
                return false;
            };
            let title = if local.title == base.title {
                incoming.title
            } else {
                local.title.clone()
            };
            let completed = if local.completed == base.completed {
                incoming.completed
            } else {
                local.completed
            };
            *local = Subtask {
                id: canonical.clone(),
                title,
                completed,
            };
            true
        });
        tracing::info!(task = %task_id, provisional = %provisional, canonical = %canonical, "subtask resolved");
        self.rekey_subtask(task_id, provisional, &canonical);
        Resolution::Resolved {
            canonical,
            released: self.release(),
        }
    }

    fn rekey_subtask(&mut self, task_id: &TaskId, from: &TaskId, to: &TaskId) {
        for deferred in &mut self.deferred {
            if deferred.task_id == *task_id {
                deferred.update.rekey_subtask(from, to);
            }
        }
    }

    fn release(&mut self) -> Vec<DeferredUpdate> {
        let (ready, waiting): (Vec<_>, Vec<_>) =
            std::mem::take(&mut self.deferred).into_iter().partition(DeferredUpdate::is_ready);
        self.deferred = waiting;
        ready
    }
}

/// Picks each field from `local` if it moved away from `base`, otherwise from
/// `incoming`. Identity and server-assigned metadata always come from
/// `incoming`.
fn three_way(base: &Task, local: &Task, incoming: Task) -> Task {
    fn pick<T: PartialEq + Clone>(base: &T, local: &T, incoming: T) -> T {
        if local == base { incoming } else { local.clone() }
    }

    Task {
        title: pick(&base.title, &local.title, incoming.title),
        list: pick(&base.list, &local.list, incoming.list),
        completed: pick(&base.completed, &local.completed, incoming.completed),
        notes: pick(&base.notes, &local.notes, incoming.notes),
        subtasks: pick(&base.subtasks, &local.subtasks, incoming.subtasks),
        attachments: pick(&base.attachments, &local.attachments, incoming.attachments),
        id: incoming.id,
        created_at: incoming.created_at,
    }
}

fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |d| u64::try_from(d.as_millis()).unwrap_or(u64::MAX))
}
