//! Import worker pool.
//!
//! Each worker thread owns its own ledger connection and vector-sink client
//! for its whole lifetime, dequeues one batch at a time, and drives every
//! file of that batch to a terminal state: deleted on successful import,
//! quarantined in `buggy/` otherwise. Ledger rows for the batch commit in
//! one transaction before any file is touched, so a crash between the
//! commit and the filesystem work leaves `run/` as the authoritative
//! pending indicator for the next startup.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crossbeam_channel::{unbounded, Receiver, RecvTimeoutError};
use mailfeed_core::{IngestError, IngestResult, Mail, MailBatch};
use mailfeed_sink::{SinkConnector, SinkObject, VectorSink};
use mailfeed_storage::{Ledger, LedgerConfig, StatusKey};
use serde_json::Value;

use crate::queue::QueueItem;
use crate::stager::Stager;

/// Counts reported after one batch, for logging and tests.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct BatchOutcome {
    pub imported: usize,
    pub failed: usize,
    pub parse_failures: usize,
}

/// Handle over the running worker threads.
pub struct WorkerPool {
    handles: Vec<JoinHandle<()>>,
    done_rx: Receiver<usize>,
}

impl WorkerPool {
    /// Start `count` workers consuming from `queue`.
    pub fn spawn(
        count: usize,
        queue: Receiver<QueueItem>,
        stager: Stager,
        ledger_config: LedgerConfig,
        connector: Arc<dyn SinkConnector>,
    ) -> IngestResult<Self> {
        let (done_tx, done_rx) = unbounded();
        let mut handles = Vec::with_capacity(count);
        for worker_id in 0..count {
            let queue = queue.clone();
            let stager = stager.clone();
            let ledger_config = ledger_config.clone();
            let connector = Arc::clone(&connector);
            let done_tx = done_tx.clone();
            let handle = thread::Builder::new()
                .name(format!("mailfeed-worker-{worker_id}"))
                .spawn(move || {
                    run_worker(worker_id, &queue, &stager, ledger_config, &connector);
                    let _ = done_tx.send(worker_id);
                })
                .map_err(|error| IngestError::subsystem("worker", error))?;
            handles.push(handle);
        }
        Ok(Self { handles, done_rx })
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.handles.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.handles.is_empty()
    }

    /// Wait for every worker to exit, up to `deadline`.
    ///
    /// Returns `false` when the deadline passes with workers still running;
    /// those threads are abandoned to process teardown and any `run/`
    /// residue is reclaimed by the next startup's recovery step.
    pub fn join_with_deadline(self, deadline: Duration) -> bool {
        let end = Instant::now() + deadline;
        let mut remaining = self.handles.len();
        while remaining > 0 {
            let budget = end.saturating_duration_since(Instant::now());
            match self.done_rx.recv_timeout(budget) {
                Ok(worker_id) => {
                    tracing::debug!(target: "mailfeed.worker", worker_id, "worker exited");
                    remaining -= 1;
                }
                Err(RecvTimeoutError::Timeout) => {
                    tracing::warn!(
                        target: "mailfeed.worker",
                        still_running = remaining,
                        "shutdown deadline exceeded waiting for workers"
                    );
                    return false;
                }
                Err(RecvTimeoutError::Disconnected) => break,
            }
        }
        for handle in self.handles {
            let _ = handle.join();
        }
        true
    }
}

fn run_worker(
    worker_id: usize,
    queue: &Receiver<QueueItem>,
    stager: &Stager,
    ledger_config: LedgerConfig,
    connector: &Arc<dyn SinkConnector>,
) {
    let ledger = match Ledger::open(ledger_config) {
        Ok(ledger) => ledger,
        Err(error) => {
            tracing::error!(
                target: "mailfeed.worker",
                worker_id,
                %error,
                "worker could not open its ledger connection"
            );
            return;
        }
    };
    let mut sink = match connector.connect() {
        Ok(sink) => sink,
        Err(error) => {
            tracing::error!(
                target: "mailfeed.worker",
                worker_id,
                %error,
                "worker could not create its sink client"
            );
            return;
        }
    };

    tracing::info!(target: "mailfeed.worker", worker_id, "worker started");
    loop {
        match queue.recv() {
            Ok(QueueItem::Batch(batch)) => {
                let domain = batch.domain.clone();
                let size = batch.file_paths.len();
                match process_batch(&batch, stager, &ledger, sink.as_mut()) {
                    Ok(outcome) => tracing::debug!(
                        target: "mailfeed.worker",
                        worker_id,
                        domain = %domain,
                        size,
                        imported = outcome.imported,
                        failed = outcome.failed,
                        parse_failures = outcome.parse_failures,
                        "batch completed"
                    ),
                    Err(error) => {
                        tracing::warn!(
                            target: "mailfeed.worker",
                            worker_id,
                            domain = %domain,
                            %error,
                            "batch processing failed; quarantining remaining files"
                        );
                        quarantine_remaining(&batch, stager);
                    }
                }
            }
            Ok(QueueItem::Poison) | Err(_) => break,
        }
    }
    tracing::info!(target: "mailfeed.worker", worker_id, "worker exiting");
}

/// Drive one batch through the per-file state machine.
pub fn process_batch(
    batch: &MailBatch,
    stager: &Stager,
    ledger: &Ledger,
    sink: &mut dyn VectorSink,
) -> IngestResult<BatchOutcome> {
    let mut mails: Vec<Mail> = Vec::with_capacity(batch.file_paths.len());
    let mut path_by_id: HashMap<String, PathBuf> = HashMap::new();
    let mut failures: Vec<(StatusKey, String)> = Vec::new();
    let mut quarantine: Vec<PathBuf> = Vec::new();
    let mut outcome = BatchOutcome::default();

    for path in &batch.file_paths {
        match read_mail(path, &batch.domain) {
            Ok(mail) => {
                if path_by_id.contains_key(&mail.mail_id) {
                    // A second file carrying an id already seen in this batch
                    // keeps no ledger row of its own; the first occurrence
                    // owns the row, the extra file is quarantined.
                    tracing::warn!(
                        target: "mailfeed.worker",
                        mail_id = %mail.mail_id,
                        file = %path.display(),
                        "duplicate mail_id within batch"
                    );
                    quarantine.push(path.clone());
                    continue;
                }
                path_by_id.insert(mail.mail_id.clone(), path.clone());
                mails.push(mail);
            }
            Err(error) => {
                outcome.parse_failures += 1;
                failures.push((
                    surrogate_key(path, &batch.domain),
                    format!("parse failure: {error}"),
                ));
                quarantine.push(path.clone());
            }
        }
    }

    let mut successes: Vec<StatusKey> = Vec::new();
    let mut deletions: Vec<PathBuf> = Vec::new();

    if !mails.is_empty() {
        let objects: Vec<SinkObject> = mails
            .iter()
            .map(|mail| SinkObject {
                id: mail.mail_id.clone(),
                properties: mail.to_properties(),
            })
            .collect();

        let import = sink
            .ensure_tenant(&batch.domain)
            .and_then(|()| sink.import_batch(&batch.domain, &objects));
        match import {
            Ok(object_failures) => {
                let failed_by_id: HashMap<String, String> = object_failures
                    .into_iter()
                    .map(|failure| (failure.mail_id, failure.message))
                    .collect();
                for mail in &mails {
                    let key = StatusKey::for_tenant(mail, &batch.domain);
                    let path = path_by_id[&mail.mail_id].clone();
                    if let Some(message) = failed_by_id.get(&mail.mail_id) {
                        outcome.failed += 1;
                        failures.push((key, message.clone()));
                        quarantine.push(path);
                    } else {
                        outcome.imported += 1;
                        successes.push(key);
                        deletions.push(path);
                    }
                }
            }
            Err(error) => {
                tracing::warn!(
                    target: "mailfeed.worker",
                    domain = %batch.domain,
                    %error,
                    "bulk import failed for the whole batch"
                );
                let detail = format!("batch import failed: {error}");
                for mail in &mails {
                    outcome.failed += 1;
                    failures.push((StatusKey::for_tenant(mail, &batch.domain), detail.clone()));
                    quarantine.push(path_by_id[&mail.mail_id].clone());
                }
            }
        }
    }

    // Terminal rows first, in one transaction; files only after the commit.
    ledger.finalize_batch(&successes, &failures)?;

    for path in deletions {
        if let Err(error) = stager.delete(&path) {
            tracing::error!(
                target: "mailfeed.worker",
                file = %path.display(),
                %error,
                "failed to delete imported file"
            );
        }
    }
    for path in quarantine {
        if let Err(error) = stager.move_to_buggy(&path) {
            tracing::error!(
                target: "mailfeed.worker",
                file = %path.display(),
                %error,
                "failed to quarantine file"
            );
        }
    }

    Ok(outcome)
}

/// Parse one staged message file.
///
/// `resolved_domain` is the domain the batch was grouped under; it backs
/// up records whose body carries neither a `domain` nor an `@`-bearing
/// `user_id`, so a file routable by filename alone still parses here.
pub(crate) fn read_mail(path: &Path, resolved_domain: &str) -> IngestResult<Mail> {
    let raw = std::fs::read_to_string(path)?;
    let record: Value =
        serde_json::from_str(&raw).map_err(|error| IngestError::MalformedRecord {
            detail: error.to_string(),
        })?;
    Mail::from_json_record(&record, resolved_domain)
}

/// Ledger key for a file that failed to parse.
///
/// Recovers whatever identity the record still exposes; an unreadable
/// record falls back to the file stem so the failure is never hidden from
/// the ledger. Such a file never produced a pending row, so the surrogate
/// key cannot collide with a real one.
fn surrogate_key(path: &Path, domain: &str) -> StatusKey {
    let partial = std::fs::read_to_string(path)
        .ok()
        .and_then(|raw| serde_json::from_str::<Value>(&raw).ok());
    let field = |name: &str| {
        partial
            .as_ref()
            .and_then(|record| record.get(name))
            .and_then(Value::as_str)
            .filter(|value| !value.is_empty())
            .map(str::to_owned)
    };

    let stem = path
        .file_stem()
        .map(|stem| stem.to_string_lossy().into_owned())
        .unwrap_or_else(|| "unknown".to_owned());

    StatusKey::new(
        field("mail_id").unwrap_or(stem),
        field("user_id").unwrap_or_else(|| "unknown".to_owned()),
        domain,
        field("received_time").unwrap_or_default(),
    )
}

/// Best-effort cleanup after an unexpected processing error: any file of
/// the batch still on disk moves to `buggy/` so nothing stays in `run/`.
fn quarantine_remaining(batch: &MailBatch, stager: &Stager) {
    for path in &batch.file_paths {
        if path.exists() {
            if let Err(error) = stager.move_to_buggy(path) {
                tracing::error!(
                    target: "mailfeed.worker",
                    file = %path.display(),
                    %error,
                    "failed to quarantine file after batch error"
                );
            }
        }
    }
}
