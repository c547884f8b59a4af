//! Authoritative in-memory task collection, mirrored into a [`StorageSlot`].
//!
//! Every mutating method writes the whole collection back to the slot. A
//! failed write is logged and reported to subscribers as
//! [`StoreEvent::PersistFailed`]; the in-memory state is kept regardless, so
//! the cache degrades to memory-only operation instead of losing edits.
//!
//! # Deletion tombstones
//!
//! Removing a task with a canonical id records a tombstone. Merges skip
//! tombstoned ids, so a snapshot fetched before the server processed the
//! delete cannot bring the task back. Tombstones are persisted next to the
//! collection under [`TOMBSTONE_KEY`] and cleared once a snapshot no longer
//! lists the id.

use std::collections::BTreeSet;

use tokio::sync::broadcast;

use taskcache_proto::codec;
use taskcache_proto::task::{Task, TaskId};

use super::StorageError;
use super::slot::StorageSlot;

/// Storage key holding the serialized task collection.
pub const STORAGE_KEY: &str = "taskCache";

/// Storage key holding the ids of locally deleted canonical tasks.
pub const TOMBSTONE_KEY: &str = "taskCacheDeleted";

/// Capacity of the change-notification channel.
const EVENT_BUFFER: usize = 64;

/// Change notifications emitted by the [`Store`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreEvent {
    /// A task was inserted or modified.
    Upserted(TaskId),
    /// A task was removed.
    Removed(TaskId),
    /// A task was re-keyed (provisional id resolved to a canonical one).
    Replaced {
        /// Previous id.
        from: TaskId,
        /// New id.
        to: TaskId,
    },
    /// The whole collection was replaced (after a merge).
    Reset {
        /// Number of tasks now held.
        count: usize,
    },
    /// Writing to persisted storage failed; state is held in memory only.
    PersistFailed {
        /// Description of the storage error.
        reason: String,
    },
}

/// Ordered collection of tasks with exactly one record per id.
pub struct Store<S: StorageSlot> {
    slot: S,
    tasks: Vec<Task>,
    tombstones: BTreeSet<TaskId>,
    events: broadcast::Sender<StoreEvent>,
    persist_failures: u64,
}

impl<S: StorageSlot> Store<S> {
    /// Opens a store over `slot`, restoring whatever it holds.
    ///
    /// Absent or corrupt storage yields an empty store; this never fails.
    pub fn open(slot: S) -> Self {
        let (events, _) = broadcast::channel(EVENT_BUFFER);
        let mut store = Self {
            slot,
            tasks: Vec::new(),
            tombstones: BTreeSet::new(),
            events,
            persist_failures: 0,
        };
        store.tasks = dedup_by_id(store.load());
        store.tombstones = store.load_tombstones();
        tracing::debug!(
            tasks = store.tasks.len(),
            tombstones = store.tombstones.len(),
            "task cache restored"
        );
        store
    }

    /// Reads the persisted collection.
    ///
    /// Returns an empty collection (and logs why) if nothing is stored, the
    /// slot cannot be read, or the bytes do not parse.
    pub fn load(&self) -> Vec<Task> {
        match self.slot.read(STORAGE_KEY) {
            Ok(Some(bytes)) => match codec::decode_collection(&bytes) {
                Ok(tasks) => tasks,
                Err(err) => {
                    tracing::warn!(key = STORAGE_KEY, error = %err, "persisted task cache is corrupt, starting empty");
                    Vec::new()
                }
            },
            Ok(None) => {
                tracing::info!(key = STORAGE_KEY, "no persisted task cache, starting empty");
                Vec::new()
            }
            Err(err) => {
                tracing::warn!(key = STORAGE_KEY, error = %err, "could not read task cache, starting empty");
                Vec::new()
            }
        }
    }

    fn load_tombstones(&self) -> BTreeSet<TaskId> {
        match self.slot.read(TOMBSTONE_KEY) {
            Ok(Some(bytes)) => serde_json::from_slice(&bytes).unwrap_or_else(|err| {
                tracing::warn!(key = TOMBSTONE_KEY, error = %err, "discarding corrupt tombstones");
                BTreeSet::new()
            }),
            Ok(None) => BTreeSet::new(),
            Err(err) => {
                tracing::warn!(key = TOMBSTONE_KEY, error = %err, "could not read tombstones");
                BTreeSet::new()
            }
        }
    }

    /// Writes the full collection (and tombstones) to the slot.
    ///
    /// Failures are logged and broadcast, never returned.
    pub fn save(&mut self) {
        if let Err(err) = self.write_all() {
            self.persist_failures += 1;
            tracing::warn!(
                error = %err,
                failures = self.persist_failures,
                "task cache save failed, keeping state in memory"
            );
            self.emit(StoreEvent::PersistFailed {
                reason: err.to_string(),
            });
        }
    }

    fn write_all(&self) -> Result<(), StorageError> {
        let bytes = codec::encode_collection(&self.tasks)?;
        self.slot.write(STORAGE_KEY, &bytes)?;
        let tombstones = serde_json::to_vec(&self.tombstones).map_err(codec::CodecError::from)?;
        self.slot.write(TOMBSTONE_KEY, &tombstones)
    }

    /// Returns the task with the given id.
    #[must_use]
    pub fn get(&self, id: &TaskId) -> Option<&Task> {
        self.tasks.iter().find(|t| t.id == *id)
    }

    /// Returns `true` if a task with the given id is held.
    #[must_use]
    pub fn contains(&self, id: &TaskId) -> bool {
        self.position(id).is_some()
    }

    fn position(&self, id: &TaskId) -> Option<usize> {
        self.tasks.iter().position(|t| t.id == *id)
    }

    /// Inserts a task, or replaces the one with the same id in place.
    pub fn upsert(&mut self, task: Task) {
        let id = task.id.clone();
        match self.position(&id) {
            Some(pos) => self.tasks[pos] = task,
            None => self.tasks.push(task),
        }
        self.save();
        self.emit(StoreEvent::Upserted(id));
    }

    /// Applies `f` to the task with the given id.
    ///
    /// `f` returns whether it changed the task; only then is the collection
    /// saved and [`StoreEvent::Upserted`] emitted. Returns `None` without
    /// calling `f` if the id is not held.
    pub fn update(&mut self, id: &TaskId, f: impl FnOnce(&mut Task) -> bool) -> Option<bool> {
        let pos = self.position(id)?;
        let changed = f(&mut self.tasks[pos]);
        if changed {
            self.save();
            self.emit(StoreEvent::Upserted(id.clone()));
        }
        Some(changed)
    }

    /// Removes the task with the given id.
    ///
    /// Removing an absent id is a no-op and does not touch storage. Removing
    /// a canonical id records a tombstone.
    pub fn remove(&mut self, id: &TaskId) -> Option<Task> {
        let pos = self.position(id)?;
        let task = self.tasks.remove(pos);
        if !id.is_provisional() {
            self.tombstones.insert(id.clone());
        }
        self.save();
        self.emit(StoreEvent::Removed(id.clone()));
        Some(task)
    }

    /// Replaces the entry keyed by `from` with `task`, keeping its position.
    ///
    /// Any other entry already holding `task.id` is dropped so ids stay
    /// unique. Returns `false` (and changes nothing) if `from` is not held.
    pub fn replace(&mut self, from: &TaskId, task: Task) -> bool {
        let Some(pos) = self.position(from) else {
            return false;
        };
        let to = task.id.clone();
        if let Some(existing) = self.position(&to)
            && existing != pos
        {
            tracing::debug!(id = %to, "resolved task displaces an existing entry");
            self.tasks.remove(existing);
        }
        let pos = self.position(from).unwrap_or(pos);
        self.tasks[pos] = task;
        self.save();
        self.emit(StoreEvent::Replaced {
            from: from.clone(),
            to,
        });
        true
    }

    /// Replaces the whole collection in one write.
    pub fn replace_all(&mut self, tasks: Vec<Task>) {
        self.tasks = dedup_by_id(tasks);
        self.save();
        self.emit(StoreEvent::Reset {
            count: self.tasks.len(),
        });
    }

    /// All tasks in order, optionally restricted to one list.
    #[must_use]
    pub fn all(&self, list: Option<&str>) -> Vec<&Task> {
        self.tasks
            .iter()
            .filter(|t| list.is_none_or(|name| t.list == name))
            .collect()
    }

    /// The full ordered collection.
    #[must_use]
    pub fn tasks(&self) -> &[Task] {
        &self.tasks
    }

    /// Number of tasks held.
    #[must_use]
    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    /// Returns `true` if no tasks are held.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    /// Ids of canonical tasks deleted locally and not yet seen gone upstream.
    #[must_use]
    pub const fn tombstones(&self) -> &BTreeSet<TaskId> {
        &self.tombstones
    }

    /// Records a tombstone for a canonical id that is not held, such as the
    /// server copy of a task deleted before its create was acknowledged.
    pub fn tombstone(&mut self, id: TaskId) {
        if id.is_provisional() || !self.tombstones.insert(id) {
            return;
        }
        self.save();
    }

    /// Keeps only the tombstones for which `keep` returns `true`.
    ///
    /// Does not save; callers follow up with a collection write.
    pub fn retain_tombstones(&mut self, mut keep: impl FnMut(&TaskId) -> bool) {
        self.tombstones.retain(|id| keep(id));
    }

    /// Number of saves that failed since the store was opened.
    #[must_use]
    pub const fn persist_failures(&self) -> u64 {
        self.persist_failures
    }

    /// Subscribes to change notifications.
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<StoreEvent> {
        self.events.subscribe()
    }

    /// Borrow the underlying slot.
    #[must_use]
    pub const fn slot(&self) -> &S {
        &self.slot
    }

    fn emit(&self, event: StoreEvent) {
        // No subscribers is fine.
        let _ = self.events.send(event);
    }
}

/// Keeps the first record for each id, preserving order.
fn dedup_by_id(tasks: Vec<Task>) -> Vec<Task> {
    let mut seen = BTreeSet::new();
    let before = tasks.len();
    let tasks: Vec<Task> = tasks
        .into_iter()
        .filter(|t| seen.insert(t.id.clone()))
        .collect();
    if tasks.len() != before {
        tracing::warn!(
            dropped = before - tasks.len(),
            "dropped duplicate task ids from collection"
        );
    }
    tasks
}
