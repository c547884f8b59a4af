//! Folds a fetched server snapshot into the local task collection.
//!
//! Field ownership:
//! - `completed` and `subtasks` are owned by the client. They are carried
//!   forward from the local copy whenever a server task is matched to one.
//! - Every other field is owned by the server and adopted from the snapshot.
//!
//! Matching runs in two passes. A server task first looks for a local task
//! with the same id. Failing that, it may consume a local provisional task
//! with the same `(title, list)` key: that is the server's echo of a create
//! whose acknowledgment has not been processed here yet.
//!
//! The merge is a pure function of its inputs and is idempotent: merging the
//! output with the same snapshot again yields the same collection.

use std::collections::{BTreeSet, HashMap, HashSet, VecDeque};

use chrono::{DateTime, Utc};
use taskcache_proto::snapshot::Snapshot;
use taskcache_proto::task::{Task, TaskId};

/// Counters describing what a merge did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MergeReport {
    /// Server tasks with no local counterpart, taken as-is.
    pub adopted: usize,
    /// Server tasks matched to a local task by id.
    pub carried: usize,
    /// Local provisional tasks matched to a server task by key.
    pub resolved: usize,
    /// Local provisional tasks kept because nothing on the server matched.
    pub retained: usize,
    /// Local canonical tasks absent from the snapshot, removed.
    pub dropped: usize,
    /// Repeated local records sharing an id, of which only the first is kept.
    pub deduplicated: usize,
    /// Malformed or duplicate records in the snapshot.
    pub skipped: usize,
    /// Snapshot records ignored because the task was deleted locally.
    pub suppressed: usize,
}

/// Result of [`merge_snapshot`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MergeOutcome {
    /// The merged collection, ready for [`Store::replace_all`](super::Store::replace_all).
    pub tasks: Vec<Task>,
    /// What happened.
    pub report: MergeReport,
    /// `(provisional, canonical)` pairs resolved by key.
    pub resolutions: Vec<(TaskId, TaskId)>,
    /// Tombstoned ids the server still lists. Their deletes have not landed.
    pub pending_deletes: Vec<TaskId>,
}

type Key<'a> = (&'a str, &'a str);

/// Merges `snapshot` into `local`, honouring deletion `tombstones`.
#[must_use]
pub fn merge_snapshot(
    local: &[Task],
    snapshot: &Snapshot,
    tombstones: &BTreeSet<TaskId>,
) -> MergeOutcome {
    let mut report = MergeReport {
        skipped: snapshot.undecodable,
        ..MergeReport::default()
    };
    let mut pending_deletes = Vec::new();

    // Validate, then drop duplicate ids and tombstoned ids.
    let mut malformed_ids = HashSet::new();
    let mut seen = HashSet::new();
    let mut server = Vec::with_capacity(snapshot.len());
    for record in &snapshot.records {
        let task = match record.clone().into_task() {
            Ok(task) => task,
            Err(err) => {
                tracing::warn!(error = %err, "skipping malformed server record");
                report.skipped += 1;
                if let Some(id) = record.id.as_ref().filter(|id| !id.is_provisional()) {
                    malformed_ids.insert(id.clone());
                }
                continue;
            }
        };
        if !seen.insert(task.id.clone()) {
            tracing::warn!(id = %task.id, "skipping duplicate server record");
            report.skipped += 1;
            continue;
        }
        if tombstones.contains(&task.id) {
            report.suppressed += 1;
            pending_deletes.push(task.id);
            continue;
        }
        server.push(task);
    }

    // A repeated local id keeps its first record.
    let mut local_ids = HashSet::new();
    let local: Vec<&Task> = local
        .iter()
        .filter(|&t| {
            let fresh = local_ids.insert(&t.id);
            if !fresh {
                report.deduplicated += 1;
            }
            fresh
        })
        .collect();
    let local_by_id: HashMap<&TaskId, &Task> = local.iter().map(|&t| (&t.id, t)).collect();

    // Provisional tasks waiting for their server echo, oldest first per key.
    let mut provisional_by_key: HashMap<Key<'_>, VecDeque<&Task>> = HashMap::new();
    for task in local.iter().copied().filter(|t| t.id.is_provisional()) {
        provisional_by_key
            .entry(task.duplicate_key())
            .or_default()
            .push_back(task);
    }

    // Among server tasks without a local id match, one candidate per key may
    // claim a provisional: the latest `createdAt`, first in order on ties.
    let mut preferred: HashMap<Key<'_>, usize> = HashMap::new();
    for (index, task) in server.iter().enumerate() {
        if local_by_id.contains_key(&task.id) {
            continue;
        }
        preferred
            .entry(task.duplicate_key())
            .and_modify(|best| {
                if later(task.created_at, server[*best].created_at) {
                    *best = index;
                }
            })
            .or_insert(index);
    }

    let mut resolutions = Vec::new();
    let mut consumed: HashSet<&TaskId> = HashSet::new();
    let mut tasks = Vec::with_capacity(server.len() + local.len());
    for (index, server_task) in server.iter().enumerate() {
        if let Some(local_task) = local_by_id.get(&server_task.id) {
            report.carried += 1;
            tasks.push(carry_local_fields(server_task.clone(), local_task));
            continue;
        }
        let key = server_task.duplicate_key();
        let claim = if preferred.get(&key) == Some(&index) {
            provisional_by_key.get_mut(&key).and_then(VecDeque::pop_front)
        } else {
            None
        };
        match claim {
            Some(provisional) => {
                report.resolved += 1;
                consumed.insert(&provisional.id);
                resolutions.push((provisional.id.clone(), server_task.id.clone()));
                tasks.push(carry_local_fields(server_task.clone(), provisional));
            }
            None => {
                report.adopted += 1;
                tasks.push(server_task.clone());
            }
        }
    }

    let server_ids: HashSet<&TaskId> = server.iter().map(|t| &t.id).collect();

    for task in local {
        if task.id.is_provisional() {
            // Each server task claims at most one provisional; any other
            // provisional with the same key is a distinct create.
            if !consumed.contains(&task.id) {
                report.retained += 1;
                tasks.push(task.clone());
            }
        } else if !server_ids.contains(&task.id) {
            if malformed_ids.contains(&task.id) {
                // The server still has it; keep the last good copy.
                report.carried += 1;
                tasks.push(task.clone());
            } else {
                report.dropped += 1;
            }
        }
    }

    MergeOutcome {
        tasks,
        report,
        resolutions,
        pending_deletes,
    }
}

/// Adopts the server record but keeps the client-owned fields of `local`.
fn carry_local_fields(mut server: Task, local: &Task) -> Task {
    server.completed = local.completed;
    server.subtasks.clone_from(&local.subtasks);
    server
}

/// `true` if `a` is strictly later than `b`. A missing timestamp is earliest.
fn later(a: Option<DateTime<Utc>>, b: Option<DateTime<Utc>>) -> bool {
    a > b
}
