//! Property-based tests for snapshot merging.
//!
//! Uses proptest to verify:
//! 1. Merging the same snapshot twice yields the same collection.
//! 2. Every local provisional task is either retained or resolved. None
//!    silently vanish, even when several share a key.
//! 3. Ids in the merged collection are unique and never tombstoned.
//! 4. Client-owned fields follow the local copy.
//! 5. The order of a snapshot with distinct keys does not change the result.
//!
//! Ids and keys come from small pools so local and server tasks collide often.

use std::collections::{BTreeSet, HashMap, HashSet};

use chrono::{DateTime, Utc};
use proptest::prelude::*;
use taskcache::cache::merge_snapshot;
use taskcache_proto::snapshot::Snapshot;
use taskcache_proto::task::{Task, TaskId};

fn arb_canonical_id() -> impl Strategy<Value = TaskId> {
    "srv_[0-9]".prop_map(TaskId::new)
}

fn arb_key() -> impl Strategy<Value = (String, String)> {
    (
        prop::sample::select(vec!["Eggs", "Milk", "Bread"]),
        prop::sample::select(vec!["Personal", "Work"]),
    )
        .prop_map(|(title, list)| (title.to_string(), list.to_string()))
}

fn arb_created_at() -> impl Strategy<Value = Option<DateTime<Utc>>> {
    prop::option::of((0i64..4).prop_map(|day| {
        DateTime::from_timestamp(1_700_000_000 + day * 86_400, 0).unwrap_or_default()
    }))
}

fn arb_server_task() -> impl Strategy<Value = Task> {
    (arb_canonical_id(), arb_key(), any::<bool>(), arb_created_at(), "[a-z]{0,6}").prop_map(
        |(id, (title, list), completed, created_at, notes)| {
            let mut task = Task::new(id, title, list);
            task.completed = completed;
            task.created_at = created_at;
            task.notes = notes;
            task
        },
    )
}

fn arb_local_task() -> impl Strategy<Value = Task> {
    (
        prop_oneof![arb_canonical_id(), (1u64..40).prop_map(TaskId::provisional)],
        arb_key(),
        any::<bool>(),
    )
        .prop_map(|(id, (title, list), completed)| {
            let mut task = Task::new(id, title, list);
            task.completed = completed;
            task
        })
}

fn unique_ids(tasks: Vec<Task>) -> Vec<Task> {
    let mut seen = HashSet::new();
    tasks.into_iter().filter(|t| seen.insert(t.id.clone())).collect()
}

fn unique_keys(tasks: Vec<Task>) -> Vec<Task> {
    let mut seen = HashSet::new();
    tasks
        .into_iter()
        .filter(|t| seen.insert((t.title.clone(), t.list.clone())))
        .collect()
}

fn arb_local() -> impl Strategy<Value = Vec<Task>> {
    prop::collection::vec(arb_local_task(), 0..10).prop_map(unique_ids)
}

fn arb_server() -> impl Strategy<Value = Vec<Task>> {
    prop::collection::vec(arb_server_task(), 0..10)
}

fn arb_tombstones() -> impl Strategy<Value = BTreeSet<TaskId>> {
    prop::collection::btree_set(arb_canonical_id(), 0..3)
}

fn by_id(mut tasks: Vec<Task>) -> Vec<Task> {
    tasks.sort_by(|a, b| a.id.cmp(&b.id));
    tasks
}

proptest! {
    /// A second merge of the same snapshot changes nothing.
    #[test]
    fn merge_is_idempotent(local in arb_local(), server in arb_server(), tombstones in arb_tombstones()) {
        let snapshot = Snapshot::from_tasks(server);
        let once = merge_snapshot(&local, &snapshot, &tombstones);
        let twice = merge_snapshot(&once.tasks, &snapshot, &tombstones);
        prop_assert_eq!(&once.tasks, &twice.tasks);
        prop_assert!(twice.resolutions.is_empty());
        prop_assert_eq!(twice.report.dropped, 0);
    }

    /// Provisional tasks are only ever retained or resolved.
    #[test]
    fn provisional_tasks_are_accounted_for(local in arb_local(), server in arb_server(), tombstones in arb_tombstones()) {
        let outcome = merge_snapshot(&local, &Snapshot::from_tasks(server), &tombstones);
        let out_ids: HashSet<&TaskId> = outcome.tasks.iter().map(|t| &t.id).collect();
        let resolved: HashSet<&TaskId> = outcome.resolutions.iter().map(|(p, _)| p).collect();

        let provisionals: Vec<&Task> = local.iter().filter(|t| t.id.is_provisional()).collect();
        for task in &provisionals {
            prop_assert!(
                out_ids.contains(&task.id) != resolved.contains(&task.id),
                "provisional {} vanished or was duplicated",
                task.id
            );
        }
        let r = outcome.report;
        prop_assert_eq!(r.retained + r.resolved, provisionals.len());
        prop_assert_eq!(r.deduplicated, 0);
    }

    /// Each server task resolves at most one provisional, so the merged
    /// collection never holds fewer tasks per key than either side.
    #[test]
    fn same_key_provisionals_are_never_collapsed(local in arb_local(), server in arb_server()) {
        let outcome = merge_snapshot(&local, &Snapshot::from_tasks(server), &BTreeSet::new());
        let mut local_count: HashMap<(&str, &str), usize> = HashMap::new();
        for task in local.iter().filter(|t| t.id.is_provisional()) {
            *local_count.entry(task.duplicate_key()).or_default() += 1;
        }
        let mut merged_count: HashMap<(&str, &str), usize> = HashMap::new();
        for task in &outcome.tasks {
            *merged_count.entry(task.duplicate_key()).or_default() += 1;
        }
        for (key, count) in local_count {
            prop_assert!(merged_count.get(&key).copied().unwrap_or_default() >= count);
        }
    }

    /// Merged ids are unique and tombstoned ids stay gone.
    #[test]
    fn merged_ids_are_unique_and_not_tombstoned(local in arb_local(), server in arb_server(), tombstones in arb_tombstones()) {
        let outcome = merge_snapshot(&local, &Snapshot::from_tasks(server), &tombstones);
        let mut seen = HashSet::new();
        for task in &outcome.tasks {
            prop_assert!(seen.insert(&task.id), "duplicate id {}", task.id);
            prop_assert!(!tombstones.contains(&task.id));
        }
        for id in &outcome.pending_deletes {
            prop_assert!(tombstones.contains(id));
        }
    }

    /// Completion follows the local copy a server task was matched to.
    #[test]
    fn completion_is_client_owned(local in arb_local(), server in arb_server()) {
        let outcome = merge_snapshot(&local, &Snapshot::from_tasks(server), &BTreeSet::new());
        let local_by_id: HashMap<&TaskId, &Task> = local.iter().map(|t| (&t.id, t)).collect();
        let canonical_of: HashMap<&TaskId, &TaskId> =
            outcome.resolutions.iter().map(|(p, c)| (c, p)).collect();
        for task in &outcome.tasks {
            let source = canonical_of.get(&task.id).copied().unwrap_or(&task.id);
            if let Some(local_task) = local_by_id.get(source) {
                prop_assert_eq!(task.completed, local_task.completed);
            }
        }
    }

    /// With distinct ids and keys, snapshot order does not matter.
    #[test]
    fn snapshot_order_does_not_change_the_result(
        (local, server, shuffled) in (arb_local(), arb_server())
            .prop_map(|(local, server)| (local, unique_keys(unique_ids(server))))
            .prop_flat_map(|(local, server)| {
                let shuffled = Just(server.clone()).prop_shuffle();
                (Just(local), Just(server), shuffled)
            })
    ) {
        let a = merge_snapshot(&local, &Snapshot::from_tasks(server), &BTreeSet::new());
        let b = merge_snapshot(&local, &Snapshot::from_tasks(shuffled), &BTreeSet::new());
        prop_assert_eq!(a.report, b.report);
        prop_assert_eq!(by_id(a.tasks), by_id(b.tasks));
    }
}
