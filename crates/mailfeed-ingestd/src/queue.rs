//! Bounded work queue between the orchestrator and the worker pool.
//!
//! A FIFO of batches with capacity `queue.maxsize`. The orchestrator sizes
//! each poll cycle from [`WorkQueue::remaining_capacity`] and never
//! over-fills, so `try`-style pushes suffice for batches; shutdown closes
//! the queue by feeding one poison pill per worker, pushed blocking so they
//! land as workers drain.

use crossbeam_channel::{bounded, Receiver, Sender, TrySendError};
use mailfeed_core::{IngestError, IngestResult, MailBatch};

/// One dequeued unit: a batch to process, or the instruction to exit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum QueueItem {
    Batch(MailBatch),
    Poison,
}

/// Bounded FIFO handle shared by the orchestrator and workers.
#[derive(Debug, Clone)]
pub struct WorkQueue {
    tx: Sender<QueueItem>,
    rx: Receiver<QueueItem>,
    capacity: usize,
}

impl WorkQueue {
    #[must_use]
    pub fn bounded(capacity: usize) -> Self {
        let (tx, rx) = bounded(capacity);
        Self { tx, rx, capacity }
    }

    #[must_use]
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Batches currently queued (excludes batches already being processed).
    #[must_use]
    pub fn len(&self) -> usize {
        self.tx.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// How many more batches the current poll cycle may enqueue.
    #[must_use]
    pub fn remaining_capacity(&self) -> usize {
        self.capacity.saturating_sub(self.len())
    }

    /// Consumer handle for a worker thread.
    #[must_use]
    pub fn receiver(&self) -> Receiver<QueueItem> {
        self.rx.clone()
    }

    /// Non-blocking batch push; the caller sized its cycle to capacity, so
    /// a full queue here means the accounting went wrong and the caller
    /// must put the files back.
    pub fn push_batch(&self, batch: MailBatch) -> IngestResult<()> {
        match self.tx.try_send(QueueItem::Batch(batch)) {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(_)) => Err(IngestError::QueueFull {
                capacity: self.capacity,
            }),
            Err(TrySendError::Disconnected(_)) => Err(IngestError::QueueClosed),
        }
    }

    /// Blocking poison push, used only during shutdown; waits for workers
    /// to make room when the queue is full.
    pub fn push_poison(&self) -> IngestResult<()> {
        self.tx
            .send(QueueItem::Poison)
            .map_err(|_| IngestError::QueueClosed)
    }
}

#[cfg(test)]
mod tests {
    use std::path::PathBuf;

    use super::*;

    fn batch(domain: &str) -> MailBatch {
        MailBatch {
            domain: domain.to_owned(),
            file_paths: vec![PathBuf::from(format!("/run/{domain}.json"))],
        }
    }

    #[test]
    fn fifo_order_is_preserved() {
        let queue = WorkQueue::bounded(4);
        queue.push_batch(batch("a.com")).expect("push a");
        queue.push_batch(batch("b.com")).expect("push b");

        let rx = queue.receiver();
        assert_eq!(rx.recv().expect("recv a"), QueueItem::Batch(batch("a.com")));
        assert_eq!(rx.recv().expect("recv b"), QueueItem::Batch(batch("b.com")));
    }

    #[test]
    fn capacity_is_enforced() {
        let queue = WorkQueue::bounded(2);
        queue.push_batch(batch("a.com")).expect("push 1");
        queue.push_batch(batch("b.com")).expect("push 2");
        assert_eq!(queue.remaining_capacity(), 0);

        let err = queue.push_batch(batch("c.com")).expect_err("queue is full");
        assert!(matches!(err, IngestError::QueueFull { capacity: 2 }));
    }

    #[test]
    fn remaining_capacity_tracks_consumption() {
        let queue = WorkQueue::bounded(3);
        queue.push_batch(batch("a.com")).expect("push");
        assert_eq!(queue.len(), 1);
        assert_eq!(queue.remaining_capacity(), 2);

        let rx = queue.receiver();
        rx.recv().expect("drain");
        assert_eq!(queue.remaining_capacity(), 3);
        assert!(queue.is_empty());
    }

    #[test]
    fn poison_pills_terminate_consumers() {
        let queue = WorkQueue::bounded(2);
        queue.push_batch(batch("a.com")).expect("push batch");
        queue.push_poison().expect("push poison");

        let rx = queue.receiver();
        assert!(matches!(rx.recv().expect("batch"), QueueItem::Batch(_)));
        assert_eq!(rx.recv().expect("poison"), QueueItem::Poison);
    }
}
