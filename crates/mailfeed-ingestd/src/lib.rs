//! The mailfeed ingestion daemon.
//!
//! Wires the staging directories, the batcher, the bounded work queue, the
//! worker pool, and the shutdown protocol into one long-running process.
//! See [`orchestrator::Orchestrator`] for the lifecycle.

pub mod batcher;
pub mod orchestrator;
pub mod queue;
pub mod shutdown;
pub mod stager;
pub mod worker;

pub use batcher::{BatchPlan, PlannedBatch, Unroutable, BATCH_MAX};
pub use orchestrator::{CycleStats, Orchestrator, SHUTDOWN_DEADLINE};
pub use queue::{QueueItem, WorkQueue};
pub use shutdown::ShutdownCoordinator;
pub use stager::{Stager, SCAN_LIMIT};
pub use worker::{BatchOutcome, WorkerPool};
