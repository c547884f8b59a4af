//! Task record schema for `TaskCache`.
//!
//! Defines the [`Task`] record that the cache stores and mirrors against the
//! server, its [`Subtask`] children, and the lenient [`TaskRecord`] form used
//! for records arriving from outside (server snapshots and create responses)
//! before they pass shape validation.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Reserved prefix that marks a locally minted, not-yet-acknowledged id.
///
/// Canonical ids assigned by the server never start with this prefix.
pub const PROVISIONAL_PREFIX: &str = "local_";

/// Maximum allowed task title length in characters.
pub const MAX_TASK_TITLE_LENGTH: usize = 256;

/// Identifier of a task or subtask.
///
/// Either a *provisional* id (`local_<suffix>`, minted on this client) or a
/// *canonical* id assigned by the server on first successful create.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TaskId(String);

impl TaskId {
    /// Creates a `TaskId` from any string.
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Creates a provisional id with the given numeric suffix.
    #[must_use]
    pub fn provisional(suffix: u64) -> Self {
        Self(format!("{PROVISIONAL_PREFIX}{suffix}"))
    }

    /// Returns the string form of this id.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Returns `true` if this id was minted locally and has not been
    /// replaced by a server-assigned id yet.
    #[must_use]
    pub fn is_provisional(&self) -> bool {
        self.0.starts_with(PROVISIONAL_PREFIX)
    }

    /// Returns the numeric suffix of a provisional id, if it has one.
    #[must_use]
    pub fn provisional_suffix(&self) -> Option<u64> {
        self.0.strip_prefix(PROVISIONAL_PREFIX)?.parse().ok()
    }
}

impl std::fmt::Display for TaskId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for TaskId {
    fn from(id: &str) -> Self {
        Self::new(id)
    }
}

impl From<String> for TaskId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

/// An opaque file reference attached to a task.
///
/// The cache never inspects attachments; they are carried through merges and
/// resolutions exactly as the server or the user supplied them.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Attachment(serde_json::Value);

impl Attachment {
    /// Wraps an arbitrary JSON value as an attachment reference.
    #[must_use]
    pub const fn new(value: serde_json::Value) -> Self {
        Self(value)
    }

    /// Returns the wrapped JSON value.
    #[must_use]
    pub const fn as_value(&self) -> &serde_json::Value {
        &self.0
    }
}

/// A checklist item inside a task.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Subtask {
    /// Provisional or canonical subtask id.
    pub id: TaskId,
    /// Subtask text.
    pub title: String,
    /// Whether the subtask is checked off.
    #[serde(default)]
    pub completed: bool,
}

impl Subtask {
    /// Creates an unchecked subtask.
    pub fn new(id: TaskId, title: impl Into<String>) -> Self {
        Self {
            id,
            title: title.into(),
            completed: false,
        }
    }
}

/// A task record, the unit of synchronization.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Task {
    /// Provisional or canonical task id.
    pub id: TaskId,
    /// Task title (never empty).
    pub title: String,
    /// Name of the list this task belongs to.
    pub list: String,
    /// Completion flag.
    #[serde(default)]
    pub completed: bool,
    /// Free-form notes.
    #[serde(default)]
    pub notes: String,
    /// Ordered checklist.
    #[serde(default)]
    pub subtasks: Vec<Subtask>,
    /// Pass-through file references.
    #[serde(default)]
    pub attachments: Vec<Attachment>,
    /// Creation time, used only as an ordering tie-breaker.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_at: Option<DateTime<Utc>>,
}

impl Task {
    /// Creates an incomplete task with no notes, subtasks, or attachments.
    pub fn new(id: TaskId, title: impl Into<String>, list: impl Into<String>) -> Self {
        Self {
            id,
            title: title.into(),
            list: list.into(),
            completed: false,
            notes: String::new(),
            subtasks: Vec::new(),
            attachments: Vec::new(),
            created_at: None,
        }
    }

    /// Returns the `(title, list)` pair used to recognize a server echo of a
    /// task this client created under a provisional id.
    #[must_use]
    pub fn duplicate_key(&self) -> (&str, &str) {
        (&self.title, &self.list)
    }

    /// Returns the subtask with the given id.
    #[must_use]
    pub fn subtask(&self, id: &TaskId) -> Option<&Subtask> {
        self.subtasks.iter().find(|s| s.id == *id)
    }

    /// Returns a mutable reference to the subtask with the given id.
    pub fn subtask_mut(&mut self, id: &TaskId) -> Option<&mut Subtask> {
        self.subtasks.iter_mut().find(|s| s.id == *id)
    }
}

/// Reasons a [`TaskRecord`] fails basic shape validation.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RecordError {
    /// The record carries neither `id` nor `_id`.
    #[error("record has no id")]
    MissingId,
    /// The record has no title, or an empty one.
    #[error("record {0} has no title")]
    MissingTitle(TaskId),
    /// The record has no list name, or an empty one.
    #[error("record {0} has no list")]
    MissingList(TaskId),
    /// The server handed back an id in the reserved provisional shape.
    #[error("server record uses reserved provisional id {0}")]
    ProvisionalId(TaskId),
}

/// A task record as received from the server, before validation.
///
/// Every field is optional or defaulted so that one bad record in a snapshot
/// never prevents the others from decoding. Use [`TaskRecord::into_task`] to
/// obtain a validated [`Task`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct TaskRecord {
    /// Canonical id. Document-store backends send it as `_id`.
    #[serde(alias = "_id", skip_serializing_if = "Option::is_none")]
    pub id: Option<TaskId>,
    /// Task title.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    /// List name.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub list: Option<String>,
    /// Completion flag.
    pub completed: bool,
    /// Notes; `null` is treated as empty.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub notes: Option<String>,
    /// Checklist.
    pub subtasks: Vec<Subtask>,
    /// Pass-through file references.
    pub attachments: Vec<Attachment>,
    /// Creation time.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub created_at: Option<DateTime<Utc>>,
}

impl TaskRecord {
    /// Validates the record's shape and converts it into a [`Task`].
    ///
    /// # Errors
    ///
    /// Returns a [`RecordError`] if the id is missing or provisional, or if
    /// the title or list is missing or blank.
    pub fn into_task(self) -> Result<Task, RecordError> {
        let id = self.id.ok_or(RecordError::MissingId)?;
        if id.is_provisional() {
            return Err(RecordError::ProvisionalId(id));
        }
        let Some(title) = self.title.filter(|t| !t.trim().is_empty()) else {
            return Err(RecordError::MissingTitle(id));
        };
        let Some(list) = self.list.filter(|l| !l.trim().is_empty()) else {
            return Err(RecordError::MissingList(id));
        };
        Ok(Task {
            id,
            title,
            list,
            completed: self.completed,
            notes: self.notes.unwrap_or_default(),
            subtasks: self.subtasks,
            attachments: self.attachments,
            created_at: self.created_at,
        })
    }
}

impl From<Task> for TaskRecord {
    fn from(task: Task) -> Self {
        Self {
            id: Some(task.id),
            title: Some(task.title),
            list: Some(task.list),
            completed: task.completed,
            notes: Some(task.notes),
            subtasks: task.subtasks,
            attachments: task.attachments,
            created_at: task.created_at,
        }
    }
}
