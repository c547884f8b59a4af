//! JSON encoding for task collections and server snapshots.
//!
//! The persisted cache and the fetch-all response share one wire format: a
//! JSON array of task records. The persisted form is strict (any defect means
//! the blob is corrupt); the snapshot form is lenient and decodes each element
//! on its own so a single malformed record cannot sink the rest.

use crate::snapshot::Snapshot;
use crate::task::{Task, TaskRecord};

/// Error type for codec encode/decode operations.
#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    /// Serialization or deserialization failed.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    /// The payload is valid JSON but not an array of records.
    #[error("expected a JSON array of task records, found {0}")]
    NotAnArray(&'static str),
}

/// Encodes a task collection for persisted storage.
///
/// # Errors
///
/// Returns `CodecError::Serialization` if a record cannot be serialized.
pub fn encode_collection(tasks: &[Task]) -> Result<Vec<u8>, CodecError> {
    Ok(serde_json::to_vec(tasks)?)
}

/// Decodes a persisted task collection.
///
/// # Errors
///
/// Returns `CodecError::Serialization` if the bytes are not a well-formed
/// array of task records.
pub fn decode_collection(bytes: &[u8]) -> Result<Vec<Task>, CodecError> {
    Ok(serde_json::from_slice(bytes)?)
}

/// Decodes a fetch-all response into a [`Snapshot`].
///
/// Elements that fail to decode are counted in
/// [`Snapshot::undecodable`] instead of failing the whole payload.
///
/// # Errors
///
/// Returns `CodecError::Serialization` if the bytes are not JSON at all, or
/// `CodecError::NotAnArray` if the top-level value is not an array.
pub fn decode_snapshot(bytes: &[u8]) -> Result<Snapshot, CodecError> {
    let value: serde_json::Value = serde_json::from_slice(bytes)?;
    let elements = match value {
        serde_json::Value::Array(elements) => elements,
        other => return Err(CodecError::NotAnArray(json_kind(&other))),
    };

    let mut snapshot = Snapshot::default();
    for element in elements {
        match serde_json::from_value::<TaskRecord>(element) {
            Ok(record) => snapshot.records.push(record),
            Err(_) => snapshot.undecodable += 1,
        }
    }
    Ok(snapshot)
}

/// Encodes tasks as a fetch-all response body.
///
/// # Errors
///
/// Returns `CodecError::Serialization` if a record cannot be serialized.
pub fn encode_snapshot(tasks: &[Task]) -> Result<Vec<u8>, CodecError> {
    encode_collection(tasks)
}

const fn json_kind(value: &serde_json::Value) -> &'static str {
    match value {
        serde_json::Value::Null => "null",
        serde_json::Value::Bool(_) => "a boolean",
        serde_json::Value::Number(_) => "a number",
        serde_json::Value::String(_) => "a string",
        serde_json::Value::Array(_) => "an array",
        serde_json::Value::Object(_) => "an object",
    }
}
