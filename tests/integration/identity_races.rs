//! Integration tests for races between server responses and local edits.
//!
//! The loopback server applies each call immediately but can hold the
//! response, which lets these tests interleave local mutations and snapshot
//! merges with an in-flight create or subtask add.

#![allow(clippy::expect_used, clippy::unwrap_used)]

use std::collections::HashSet;
use std::sync::Arc;

use taskcache::cache::{IdentityResolver, MemorySlot, Store};
use taskcache::sync::{ApiCall, LoopbackApi, OfflineApi, SyncOptions, Synchronizer};
use taskcache_proto::api::TaskUpdate;
use taskcache_proto::snapshot::Snapshot;
use taskcache_proto::task::{Task, TaskId};

// ---------------------------------------------------------------------------
// Helper functions
// ---------------------------------------------------------------------------

type LoopbackSync = Synchronizer<Arc<MemorySlot>, Arc<LoopbackApi>>;

fn setup() -> (Arc<LoopbackApi>, LoopbackSync) {
    let api = Arc::new(LoopbackApi::new());
    let sync = Synchronizer::new(
        Store::open(Arc::new(MemorySlot::new())),
        Arc::clone(&api),
        SyncOptions::default(),
    )
    .expect("inside a runtime");
    (api, sync)
}

/// Lets spawned calls run until the server has received `n` calls. Held
/// calls stop at the response gate.
async fn wait_for_calls(api: &LoopbackApi, n: usize) {
    while api.calls().len() < n {
        tokio::task::yield_now().await;
    }
}

fn no_provisional_ids_sent(api: &LoopbackApi) -> bool {
    api.calls().iter().all(|call| match call {
        ApiCall::Update(id, update) => {
            !id.is_provisional()
                && update.subtask_id().is_none_or(|s| !s.is_provisional())
        }
        ApiCall::Delete(id) => !id.is_provisional(),
        ApiCall::FetchAll | ApiCall::Create(_) => true,
    })
}

// ---------------------------------------------------------------------------
// Task creates
// ---------------------------------------------------------------------------

#[tokio::test]
async fn edits_during_create_survive_the_response() {
    let (api, sync) = setup();
    api.hold();
    let id = sync.add_task("Eggs", "Personal").unwrap();
    wait_for_calls(&api, 1).await;

    sync.toggle_task(&id).unwrap();
    sync.rename_task(&id, "Free range eggs").unwrap();
    sync.set_notes(&id, "a dozen").unwrap();
    assert_eq!(sync.deferred_len(), 3);

    api.release();
    sync.settle().await;

    let tasks = sync.tasks(None);
    assert_eq!(tasks.len(), 1);
    let local = &tasks[0];
    assert!(!local.id.is_provisional());
    assert!(local.completed);
    assert_eq!(local.title, "Free range eggs");
    assert_eq!(local.notes, "a dozen");

    let remote = &api.tasks()[0];
    assert_eq!(remote.id, local.id);
    assert!(remote.completed);
    assert_eq!(remote.title, "Free range eggs");
    assert_eq!(remote.notes, "a dozen");
    assert!(no_provisional_ids_sent(&api));
    assert_eq!(sync.deferred_len(), 0);
}

#[tokio::test]
async fn delete_during_create_removes_the_server_copy() {
    let (api, sync) = setup();
    api.hold();
    let id = sync.add_task("Eggs", "Personal").unwrap();
    wait_for_calls(&api, 1).await;

    sync.set_notes(&id, "never sent").unwrap();
    sync.delete_task(&id).unwrap();
    assert_eq!(sync.deferred_len(), 0);

    api.release();
    sync.settle().await;

    assert!(sync.tasks(None).is_empty());
    assert!(api.tasks().is_empty());
    assert!(no_provisional_ids_sent(&api));
    assert!(
        !api.calls()
            .iter()
            .any(|c| matches!(c, ApiCall::Update(_, TaskUpdate::Notes { .. })))
    );

    // A later snapshot does not bring it back.
    sync.refresh().await;
    assert!(sync.tasks(None).is_empty());
}

#[tokio::test]
async fn snapshot_with_the_new_task_arrives_before_the_response() {
    let (api, sync) = setup();
    api.hold();
    let id = sync.add_task("Eggs", "Personal").unwrap();
    wait_for_calls(&api, 1).await;

    // The server already holds the task; its create response is still held.
    let report = sync.apply_snapshot(&Snapshot::from_tasks(api.tasks()));
    assert_eq!(report.resolved, 1);
    assert!(sync.get(&id).is_none());

    api.release();
    sync.settle().await;

    let tasks = sync.tasks(None);
    assert_eq!(tasks.len(), 1);
    assert_eq!(tasks[0].id, api.tasks()[0].id);
    assert!(!api.calls().iter().any(|c| matches!(c, ApiCall::Delete(_))));
}

#[tokio::test]
async fn snapshot_without_the_new_task_arrives_before_the_response() {
    let (api, sync) = setup();
    api.hold();
    let id = sync.add_task("Eggs", "Personal").unwrap();
    wait_for_calls(&api, 1).await;

    let report = sync.apply_snapshot(&Snapshot::default());
    assert_eq!(report.retained, 1);
    assert!(sync.get(&id).is_some());

    api.release();
    sync.settle().await;

    let tasks = sync.tasks(None);
    assert_eq!(tasks.len(), 1);
    assert!(!tasks[0].id.is_provisional());
}

#[tokio::test]
async fn same_key_creates_survive_a_snapshot_with_only_the_first() {
    let (api, sync) = setup();
    api.hold();
    sync.add_task("Eggs", "Personal").unwrap();
    wait_for_calls(&api, 1).await;
    sync.add_task("Eggs", "Personal").unwrap();
    wait_for_calls(&api, 2).await;

    // The server holds both, but this snapshot was taken after the first.
    let first = api.tasks()[0].clone();
    let report = sync.apply_snapshot(&Snapshot::from_tasks([first.clone()]));
    assert_eq!(report.resolved, 1);
    assert_eq!(report.retained, 1);
    assert_eq!(sync.tasks(None).len(), 2);

    api.release();
    sync.settle().await;

    let tasks = sync.tasks(None);
    assert_eq!(tasks.len(), 2);
    assert!(tasks.iter().all(|t| !t.id.is_provisional()));
    assert_eq!(tasks[0].id, first.id);
    assert_eq!(api.tasks().len(), 2);
    assert!(!api.calls().iter().any(|c| matches!(c, ApiCall::Delete(_))));
}

#[tokio::test]
async fn merge_dropping_a_task_during_its_create_leaves_the_server_copy() {
    let (api, sync) = setup();
    api.hold();
    sync.add_task("Eggs", "Personal").unwrap();
    wait_for_calls(&api, 1).await;

    // One snapshot resolves the task, a stale one then drops it.
    assert_eq!(sync.apply_snapshot(&Snapshot::from_tasks(api.tasks())).resolved, 1);
    assert_eq!(sync.apply_snapshot(&Snapshot::default()).dropped, 1);
    assert!(sync.tasks(None).is_empty());

    api.release();
    sync.settle().await;

    assert!(!api.calls().iter().any(|c| matches!(c, ApiCall::Delete(_))));
    assert_eq!(api.tasks().len(), 1);

    // Nothing was tombstoned, so the next refresh brings it back.
    sync.refresh().await;
    let tasks = sync.tasks(None);
    assert_eq!(tasks.len(), 1);
    assert_eq!(tasks[0].id, api.tasks()[0].id);
}

#[tokio::test]
async fn delete_of_a_task_resolved_by_merge_during_create_is_sent_once() {
    let (api, sync) = setup();
    api.hold();
    sync.add_task("Eggs", "Personal").unwrap();
    wait_for_calls(&api, 1).await;
    sync.apply_snapshot(&Snapshot::from_tasks(api.tasks()));
    let canonical = sync.tasks(None)[0].id.clone();

    sync.delete_task(&canonical).unwrap();
    wait_for_calls(&api, 2).await;
    api.release();
    sync.settle().await;

    let deletes = api
        .calls()
        .iter()
        .filter(|c| matches!(c, ApiCall::Delete(_)))
        .count();
    assert_eq!(deletes, 1);
    assert!(api.tasks().is_empty());
    assert!(sync.tasks(None).is_empty());
}

// ---------------------------------------------------------------------------
// Subtasks
// ---------------------------------------------------------------------------

async fn canonical_task(api: &LoopbackApi, sync: &LoopbackSync) -> TaskId {
    api.seed([Task::new(TaskId::new("a1"), "Pack", "Personal")]);
    sync.refresh().await;
    TaskId::new("a1")
}

#[tokio::test]
async fn subtask_toggle_during_add_is_sent_after_resolution() {
    let (api, sync) = setup();
    let task = canonical_task(&api, &sync).await;
    api.hold();
    let sub = sync.add_subtask(&task, "socks").unwrap();
    wait_for_calls(&api, 2).await;

    assert!(sync.toggle_subtask(&task, &sub).unwrap());
    assert_eq!(sync.deferred_len(), 1);

    api.release();
    sync.settle().await;

    let local = sync.get(&task).unwrap();
    let remote = api.tasks()[0].clone();
    assert_eq!(local.subtasks.len(), 1);
    assert_eq!(local.subtasks[0].id, remote.subtasks[0].id);
    assert!(local.subtasks[0].completed);
    assert!(remote.subtasks[0].completed);
    assert!(no_provisional_ids_sent(&api));
}

#[tokio::test]
async fn subtask_removed_during_add_is_removed_on_the_server() {
    let (api, sync) = setup();
    let task = canonical_task(&api, &sync).await;
    api.hold();
    let sub = sync.add_subtask(&task, "socks").unwrap();
    wait_for_calls(&api, 2).await;

    sync.remove_subtask(&task, &sub).unwrap();
    assert!(sync.get(&task).unwrap().subtasks.is_empty());

    api.release();
    sync.settle().await;

    assert!(sync.get(&task).unwrap().subtasks.is_empty());
    assert!(api.tasks()[0].subtasks.is_empty());
    assert!(no_provisional_ids_sent(&api));
}

#[tokio::test]
async fn removing_an_unsent_subtask_cancels_its_queued_updates() {
    let (api, sync) = setup();
    api.hold();
    let task = sync.add_task("Pack", "Personal").unwrap();
    wait_for_calls(&api, 1).await;

    let sub = sync.add_subtask(&task, "socks").unwrap();
    sync.toggle_subtask(&task, &sub).unwrap();
    assert_eq!(sync.deferred_len(), 2);
    sync.remove_subtask(&task, &sub).unwrap();
    assert_eq!(sync.deferred_len(), 0);

    api.release();
    sync.settle().await;

    assert!(api.calls().iter().all(|c| !matches!(c, ApiCall::Update(..))));
    assert!(api.tasks()[0].subtasks.is_empty());
    assert!(sync.tasks(None)[0].subtasks.is_empty());
}

// ---------------------------------------------------------------------------
// Provisional id minting
// ---------------------------------------------------------------------------

#[tokio::test]
async fn rapid_creates_get_distinct_ids() {
    let sync = Synchronizer::new(
        Store::open(MemorySlot::new()),
        OfflineApi,
        SyncOptions::default(),
    )
    .unwrap();

    let ids: Vec<TaskId> = (0..200)
        .map(|i| sync.add_task(&format!("Task {i}"), "Work").unwrap())
        .collect();

    let unique: HashSet<&TaskId> = ids.iter().collect();
    assert_eq!(unique.len(), ids.len());
    assert!(
        ids.windows(2)
            .all(|w| w[0].provisional_suffix() < w[1].provisional_suffix())
    );
}

#[test]
fn clock_stepping_backwards_still_yields_fresh_ids() {
    let mut resolver = IdentityResolver::new();
    let first = resolver.mint_at(1_700_000_000_500);
    let second = resolver.mint_at(1_700_000_000_000);
    let third = resolver.mint_at(1_700_000_000_000);

    assert_eq!(second.provisional_suffix(), Some(1_700_000_000_501));
    assert_eq!(third.provisional_suffix(), Some(1_700_000_000_502));
    assert_ne!(first, second);
}
