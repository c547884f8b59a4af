//! Property-based tests for task record decoding.
//!
//! Uses proptest to verify:
//! 1. Random bytes never cause a panic in `decode_snapshot` or `decode_collection`.
//! 2. A snapshot built from valid tasks decodes with nothing skipped, and every
//!    record passes shape validation unchanged.
//! 3. Mixing garbage elements into a snapshot only ever increases the
//!    undecodable count; the valid records still come through in order.

use proptest::prelude::*;
use taskcache_proto::codec;
use taskcache_proto::task::{Subtask, Task, TaskId};

/// Strategy for canonical (server-assigned) ids.
fn arb_canonical_id() -> impl Strategy<Value = TaskId> {
    "[a-f0-9]{24}".prop_map(TaskId::new)
}

/// Strategy for non-blank single-line text.
fn arb_text() -> impl Strategy<Value = String> {
    "[A-Za-z0-9][A-Za-z0-9 ]{0,31}"
}

fn arb_subtask() -> impl Strategy<Value = Subtask> {
    (arb_canonical_id(), arb_text(), any::<bool>()).prop_map(|(id, title, completed)| Subtask {
        id,
        title,
        completed,
    })
}

/// Strategy for valid server tasks.
fn arb_task() -> impl Strategy<Value = Task> {
    (
        arb_canonical_id(),
        arb_text(),
        prop_oneof![
            Just("Personal".to_string()),
            Just("Work".to_string()),
            arb_text()
        ],
        any::<bool>(),
        ".{0,64}",
        prop::collection::vec(arb_subtask(), 0..4),
    )
        .prop_map(|(id, title, list, completed, notes, subtasks)| {
            let mut task = Task::new(id, title, list);
            task.completed = completed;
            task.notes = notes;
            task.subtasks = subtasks;
            task
        })
}

proptest! {
    /// Random bytes never cause a panic when decoded as a snapshot.
    #[test]
    fn random_bytes_decode_snapshot_no_panic(bytes in prop::collection::vec(any::<u8>(), 0..512)) {
        let _ = codec::decode_snapshot(&bytes);
    }

    /// Random bytes never cause a panic when decoded as a persisted collection.
    #[test]
    fn random_bytes_decode_collection_no_panic(bytes in prop::collection::vec(any::<u8>(), 0..512)) {
        let _ = codec::decode_collection(&bytes);
    }

    /// Valid tasks encoded as a fetch-all body come back as valid records.
    #[test]
    fn valid_snapshot_validates_cleanly(tasks in prop::collection::vec(arb_task(), 0..16)) {
        let body = codec::encode_snapshot(&tasks).expect("encode should succeed");
        let snapshot = codec::decode_snapshot(&body).expect("decode should succeed");
        prop_assert_eq!(snapshot.undecodable, 0);
        let validated: Vec<Task> = snapshot
            .records
            .into_iter()
            .map(|r| r.into_task().expect("valid record"))
            .collect();
        prop_assert_eq!(validated, tasks);
    }

    /// Garbage elements are counted, never fatal, and never reorder good records.
    #[test]
    fn garbage_elements_are_counted(
        tasks in prop::collection::vec(arb_task(), 1..8),
        garbage in prop::collection::vec(any::<i64>(), 1..8),
    ) {
        let mut elements: Vec<serde_json::Value> = tasks
            .iter()
            .map(|t| serde_json::to_value(t).expect("to_value"))
            .collect();
        for (i, g) in garbage.iter().enumerate() {
            let at = (i * 2).min(elements.len());
            elements.insert(at, serde_json::Value::from(*g));
        }
        let body = serde_json::to_vec(&elements).expect("to_vec");
        let snapshot = codec::decode_snapshot(&body).expect("decode should succeed");
        prop_assert_eq!(snapshot.undecodable, garbage.len());
        let ids: Vec<_> = snapshot.records.iter().filter_map(|r| r.id.clone()).collect();
        let expected: Vec<_> = tasks.iter().map(|t| t.id.clone()).collect();
        prop_assert_eq!(ids, expected);
    }
}
