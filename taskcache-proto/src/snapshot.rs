//! Full point-in-time listing of a user's tasks, as returned by fetch-all.

use crate::task::{Task, TaskRecord};

/// A fetched server snapshot.
///
/// Records are kept in their lenient [`TaskRecord`] form; validation happens
/// during the merge so that malformed records can be skipped and counted.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Snapshot {
    /// Records that decoded, in server order.
    pub records: Vec<TaskRecord>,
    /// Number of array elements that could not be decoded at all.
    pub undecodable: usize,
}

impl Snapshot {
    /// Creates a snapshot from already-decoded records.
    #[must_use]
    pub const fn new(records: Vec<TaskRecord>) -> Self {
        Self {
            records,
            undecodable: 0,
        }
    }

    /// Creates a snapshot from validated tasks.
    pub fn from_tasks(tasks: impl IntoIterator<Item = Task>) -> Self {
        Self::new(tasks.into_iter().map(TaskRecord::from).collect())
    }

    /// Number of decoded records.
    #[must_use]
    pub fn len(&self) -> usize {
        self.records.len()
    }

    /// Returns `true` if no records decoded.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}
