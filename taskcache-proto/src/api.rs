//! Request and acknowledgment types exchanged with the task server.
//!
//! The server itself is an external collaborator; these types fix only the
//! payload shapes the cache sends and the acknowledgments it understands.

use serde::{Deserialize, Serialize};

use crate::task::{Subtask, Task, TaskId};

/// Body of a create call. The server answers with the created record,
/// carrying its canonical id.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateTask {
    /// Task title.
    pub title: String,
    /// List name.
    pub list: String,
    /// Completion flag at send time.
    pub completed: bool,
}

impl From<&Task> for CreateTask {
    fn from(task: &Task) -> Self {
        Self {
            title: task.title.clone(),
            list: task.list.clone(),
            completed: task.completed,
        }
    }
}

/// An idempotent partial update keyed by a canonical task id.
///
/// The same value is applied locally (optimistically) and sent to the
/// server, so both sides run [`TaskUpdate::apply`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "camelCase")]
pub enum TaskUpdate {
    /// Set the completion flag.
    Completion {
        /// New value.
        completed: bool,
    },
    /// Move the task to another list.
    Move {
        /// Destination list name.
        list: String,
    },
    /// Rename the task.
    Title {
        /// New title.
        title: String,
    },
    /// Replace the notes.
    Notes {
        /// New notes.
        notes: String,
    },
    /// Append a subtask. The server acknowledges with the canonical subtask.
    AddSubtask {
        /// The subtask as created locally.
        subtask: Subtask,
    },
    /// Remove a subtask.
    #[serde(rename_all = "camelCase")]
    RemoveSubtask {
        /// Subtask to remove.
        subtask_id: TaskId,
    },
    /// Set a subtask's completion flag.
    #[serde(rename_all = "camelCase")]
    ToggleSubtask {
        /// Subtask to change.
        subtask_id: TaskId,
        /// New value.
        completed: bool,
    },
}

impl TaskUpdate {
    /// Returns the subtask id this update refers to, if any.
    #[must_use]
    pub const fn subtask_id(&self) -> Option<&TaskId> {
        match self {
            Self::AddSubtask { subtask } => Some(&subtask.id),
            Self::RemoveSubtask { subtask_id } | Self::ToggleSubtask { subtask_id, .. } => {
                Some(subtask_id)
            }
            Self::Completion { .. } | Self::Move { .. } | Self::Title { .. } | Self::Notes { .. } => {
                None
            }
        }
    }

    /// Rewrites a subtask id reference after the subtask was resolved.
    pub fn rekey_subtask(&mut self, from: &TaskId, to: &TaskId) {
        match self {
            Self::AddSubtask { subtask } if subtask.id == *from => subtask.id = to.clone(),
            Self::RemoveSubtask { subtask_id } | Self::ToggleSubtask { subtask_id, .. }
                if *subtask_id == *from =>
            {
                *subtask_id = to.clone();
            }
            _ => {}
        }
    }

    /// Applies this update to a task.
    ///
    /// Returns `false` if the update targets a subtask the task does not
    /// have (the task is left unchanged in that case).
    pub fn apply(&self, task: &mut Task) -> bool {
        match self {
            Self::Completion { completed } => task.completed = *completed,
            Self::Move { list } => task.list.clone_from(list),
            Self::Title { title } => task.title.clone_from(title),
            Self::Notes { notes } => task.notes.clone_from(notes),
            Self::AddSubtask { subtask } => {
                if task.subtask(&subtask.id).is_none() {
                    task.subtasks.push(subtask.clone());
                }
            }
            Self::RemoveSubtask { subtask_id } => {
                let before = task.subtasks.len();
                task.subtasks.retain(|s| s.id != *subtask_id);
                return task.subtasks.len() != before;
            }
            Self::ToggleSubtask {
                subtask_id,
                completed,
            } => match task.subtask_mut(subtask_id) {
                Some(subtask) => subtask.completed = *completed,
                None => return false,
            },
        }
        true
    }
}

/// Server acknowledgment of a [`TaskUpdate`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "ack", rename_all = "camelCase")]
pub enum UpdateAck {
    /// The update was applied; nothing new to learn.
    Applied,
    /// An `AddSubtask` was applied and the subtask received a canonical id.
    SubtaskCreated {
        /// The subtask as stored by the server.
        subtask: Subtask,
    },
}
