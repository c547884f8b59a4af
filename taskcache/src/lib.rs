//! `TaskCache`: offline-first task list cache with server reconciliation.

pub mod cache;
pub mod config;
pub mod lists;
pub mod session;
pub mod sync;
