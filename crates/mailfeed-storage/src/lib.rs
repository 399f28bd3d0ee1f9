//! SQLite-backed status ledger for the mailfeed pipeline.
//!
//! This crate owns schema bootstrap, the per-message status rows, and the
//! read-only aggregations behind the status query tool. Connections are
//! opened per thread and never shared; the WAL journal plus `BEGIN
//! IMMEDIATE` transactions give the multi-writer behavior the worker pool
//! relies on.

pub mod connection;
pub mod schema;
pub mod status;

pub use connection::{Ledger, LedgerConfig};
pub use schema::{bootstrap, current_version, SCHEMA_VERSION};
pub use status::{StatusCounts, StatusKey, StatusRow};
