//! Shared record definitions for the `TaskCache` sync protocol.

pub mod api;
pub mod codec;
pub mod snapshot;
pub mod task;
