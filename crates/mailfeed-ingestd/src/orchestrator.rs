//! Startup, polling, and shutdown of the whole pipeline.
//!
//! The orchestrator is the only writer from `wait/` into `run/` and the
//! only bulk scanner; workers own the terminal transitions. Startup
//! failures (ledger, collection, recovery) abort before any worker starts,
//! which is what makes the daemon's exit code meaningful.

use std::sync::Arc;
use std::time::Duration;

use mailfeed_core::{AppConfig, IngestResult, MailBatch};
use mailfeed_sink::SinkConnector;
use mailfeed_storage::{Ledger, LedgerConfig, StatusKey};

use crate::batcher::{self, PlannedBatch, Unroutable};
use crate::queue::WorkQueue;
use crate::shutdown::ShutdownCoordinator;
use crate::stager::{Stager, SCAN_LIMIT};
use crate::worker::{read_mail, WorkerPool};

/// How long shutdown waits for in-flight batches before abandoning the
/// worker threads to process teardown.
pub const SHUTDOWN_DEADLINE: Duration = Duration::from_secs(30);

/// What one poll cycle did, for logging and tests.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct CycleStats {
    pub scanned: usize,
    pub batches_enqueued: usize,
    pub files_enqueued: usize,
    pub unroutable: usize,
}

/// Owns every long-lived component of the daemon.
pub struct Orchestrator {
    config: AppConfig,
    stager: Stager,
    ledger: Ledger,
    queue: WorkQueue,
    shutdown: Arc<ShutdownCoordinator>,
    pool: Option<WorkerPool>,
}

impl Orchestrator {
    /// Run the full startup sequence: directories, ledger bootstrap,
    /// collection ensuring, `run/` recovery, then the worker pool.
    pub fn bootstrap(
        config: AppConfig,
        connector: Arc<dyn SinkConnector>,
        shutdown: Arc<ShutdownCoordinator>,
    ) -> IngestResult<Self> {
        config.validate()?;

        let stager = Stager::new(&config.paths);
        stager.ensure_dirs()?;

        let ledger_config = LedgerConfig::at_path(&config.paths.sqlite_path);
        let ledger = Ledger::open(ledger_config.clone())?;

        let mut sink = connector.connect()?;
        sink.ensure_collection()?;
        drop(sink);

        let recovered = recover_run_files(&stager)?;
        if recovered > 0 {
            tracing::info!(
                target: "mailfeed.ingestd",
                recovered,
                "moved leftover run/ files back to wait/"
            );
        }

        let queue = WorkQueue::bounded(config.queue.maxsize);
        let pool = WorkerPool::spawn(
            config.worker.threads,
            queue.receiver(),
            stager.clone(),
            ledger_config,
            connector,
        )?;
        tracing::info!(
            target: "mailfeed.ingestd",
            workers = config.worker.threads,
            queue_capacity = config.queue.maxsize,
            "pipeline started"
        );

        Ok(Self {
            config,
            stager,
            ledger,
            queue,
            shutdown,
            pool: Some(pool),
        })
    }

    #[must_use]
    pub fn queue(&self) -> &WorkQueue {
        &self.queue
    }

    #[must_use]
    pub fn ledger(&self) -> &Ledger {
        &self.ledger
    }

    /// One scan-batch-enqueue pass, sized to the queue's spare capacity.
    pub fn poll_cycle(&self) -> IngestResult<CycleStats> {
        let mut stats = CycleStats::default();

        let capacity = self.queue.remaining_capacity();
        if capacity == 0 {
            return Ok(stats);
        }

        let names = self.stager.list_pending(SCAN_LIMIT)?;
        stats.scanned = names.len();
        if names.is_empty() {
            return Ok(stats);
        }

        let plan = batcher::plan(self.stager.wait_dir(), &names, capacity);
        stats.unroutable = plan.unroutable.len();
        for entry in &plan.unroutable {
            self.quarantine_unroutable(entry);
        }
        for planned in plan.selected {
            self.stage_and_enqueue(planned, &mut stats);
        }
        Ok(stats)
    }

    /// Main loop: poll, sleep, repeat until shutdown, then drain workers.
    pub fn run(&mut self) -> IngestResult<()> {
        let poll = self.config.worker.poll_duration();
        while !self.shutdown.is_shutting_down() {
            match self.poll_cycle() {
                Ok(stats) if stats.batches_enqueued > 0 => tracing::info!(
                    target: "mailfeed.ingestd",
                    batches = stats.batches_enqueued,
                    files = stats.files_enqueued,
                    unroutable = stats.unroutable,
                    "enqueued work"
                ),
                Ok(_) => {}
                Err(error) => tracing::warn!(
                    target: "mailfeed.ingestd",
                    %error,
                    "poll cycle failed; retrying next interval"
                ),
            }
            if !self.shutdown.sleep_unless_shutdown(poll) {
                break;
            }
        }
        self.drain_and_join()
    }

    /// Close the queue with poison pills and wait for workers, bounded by
    /// [`SHUTDOWN_DEADLINE`].
    pub fn drain_and_join(&mut self) -> IngestResult<()> {
        let Some(pool) = self.pool.take() else {
            return Ok(());
        };

        tracing::info!(
            target: "mailfeed.ingestd",
            workers = pool.len(),
            queued = self.queue.len(),
            "shutting down; dispatching poison pills"
        );
        for _ in 0..pool.len() {
            self.queue.push_poison()?;
        }

        if pool.join_with_deadline(SHUTDOWN_DEADLINE) {
            tracing::info!(target: "mailfeed.ingestd", "all workers exited cleanly");
        } else {
            tracing::warn!(
                target: "mailfeed.ingestd",
                "workers did not exit before the deadline; run/ residue will be recovered on next startup"
            );
        }
        Ok(())
    }

    /// Terminal handling for a file whose domain never resolved: failure
    /// row first (when the record exposed a `mail_id`), then the move.
    fn quarantine_unroutable(&self, entry: &Unroutable) {
        if let Some(mail_id) = &entry.mail_id {
            let key = StatusKey::new(
                mail_id.clone(),
                entry.user_id.clone().unwrap_or_else(|| "unknown".to_owned()),
                "unknown",
                entry.received_time.clone().unwrap_or_default(),
            );
            if let Err(error) = self.ledger.mark_failure(&key, &entry.reason) {
                tracing::warn!(
                    target: "mailfeed.ingestd",
                    mail_id = %mail_id,
                    %error,
                    "failed to record unroutable file in the ledger"
                );
            }
        }
        let path = self.stager.wait_path(&entry.file);
        match self.stager.move_to_buggy(&path) {
            Ok(_) => tracing::warn!(
                target: "mailfeed.ingestd",
                file = %entry.file,
                reason = %entry.reason,
                "unroutable file quarantined"
            ),
            Err(error) => tracing::error!(
                target: "mailfeed.ingestd",
                file = %entry.file,
                %error,
                "failed to quarantine unroutable file"
            ),
        }
    }

    /// Move a planned batch into `run/`, upsert its pending rows in one
    /// transaction, and enqueue it.
    fn stage_and_enqueue(&self, planned: PlannedBatch, stats: &mut CycleStats) {
        let mut moved = Vec::with_capacity(planned.files.len());
        let mut pending = Vec::with_capacity(planned.files.len());

        for name in &planned.files {
            match self.stager.move_to_run(name) {
                Ok(path) => {
                    // A record that fails to parse here still travels with
                    // the batch; the worker owns its terminal transition.
                    // Pending rows carry the domain the batch was grouped
                    // under, matching the tenant the worker imports into.
                    if let Ok(mail) = read_mail(&path, &planned.domain) {
                        pending.push(StatusKey::for_tenant(&mail, &planned.domain));
                    }
                    moved.push(path);
                }
                Err(error) => tracing::warn!(
                    target: "mailfeed.ingestd",
                    file = %name,
                    %error,
                    "failed to stage file; leaving it for the next cycle"
                ),
            }
        }
        if moved.is_empty() {
            return;
        }

        if let Err(error) = self.ledger.upsert_pending_many(&pending) {
            tracing::warn!(
                target: "mailfeed.ingestd",
                domain = %planned.domain,
                %error,
                "failed to upsert pending rows; progress queries will lag this batch"
            );
        }

        let size = moved.len();
        let batch = MailBatch {
            domain: planned.domain.clone(),
            file_paths: moved.clone(),
        };
        match self.queue.push_batch(batch) {
            Ok(()) => {
                stats.batches_enqueued += 1;
                stats.files_enqueued += size;
                tracing::debug!(
                    target: "mailfeed.ingestd",
                    domain = %planned.domain,
                    size,
                    "batch enqueued"
                );
            }
            Err(error) => {
                // Capacity accounting should make this unreachable; put the
                // files back so nothing is stranded in run/.
                tracing::warn!(
                    target: "mailfeed.ingestd",
                    domain = %planned.domain,
                    %error,
                    "queue rejected batch; returning files to wait/"
                );
                for path in moved {
                    if let Some(name) = path.file_name().and_then(|n| n.to_str()) {
                        if let Err(undo_error) = self.stager.move_run_back_to_wait(name) {
                            tracing::error!(
                                target: "mailfeed.ingestd",
                                file = %path.display(),
                                %undo_error,
                                "failed to return file to wait/"
                            );
                        }
                    }
                }
            }
        }
    }
}

/// Startup recovery: every leftover `run/` file goes back to `wait/`.
/// Idempotent with respect to the ledger; stale pending rows are simply
/// overwritten on the next attempt.
fn recover_run_files(stager: &Stager) -> IngestResult<usize> {
    let leftovers = stager.list_run()?;
    for name in &leftovers {
        stager.move_run_back_to_wait(name)?;
    }
    Ok(leftovers.len())
}
