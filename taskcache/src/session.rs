//! Per-session view state.
//!
//! Which list is being shown and which task is open are explicit values held
//! by the caller, never read back from rendered output.

use taskcache_proto::task::TaskId;

use crate::lists::ListRegistry;

/// The current list and, optionally, the currently open task.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SessionState {
    /// List whose tasks are shown. `None` shows every list.
    pub current_list: Option<String>,
    /// Task whose details are open.
    pub current_task: Option<TaskId>,
}

impl SessionState {
    /// Starts a session scoped to `list`.
    pub fn in_list(list: impl Into<String>) -> Self {
        Self {
            current_list: Some(list.into()),
            current_task: None,
        }
    }

    /// Switches lists, closing any open task.
    pub fn select_list(&mut self, list: impl Into<String>) {
        self.current_list = Some(list.into());
        self.current_task = None;
    }

    /// Opens a task.
    pub fn open_task(&mut self, id: TaskId) {
        self.current_task = Some(id);
    }

    /// Follows a task through re-keying so an open task stays open.
    pub fn rekey(&mut self, from: &TaskId, to: &TaskId) {
        if self.current_task.as_ref() == Some(from) {
            self.current_task = Some(to.clone());
        }
    }

    /// List new tasks go into: the current list, else the registry's first.
    #[must_use]
    pub fn target_list<'a>(&'a self, lists: &'a ListRegistry) -> Option<&'a str> {
        self.current_list.as_deref().or_else(|| lists.first())
    }
}
