//! Graceful-shutdown coordination.
//!
//! One flag, flipped by the first interrupt or terminate signal, observed
//! by the orchestrator's main loop and its inter-cycle sleep. Workers are
//! not interrupted mid-batch; the orchestrator closes the queue with poison
//! pills once the flag is set.

use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread;
use std::time::{Duration, Instant};

use mailfeed_core::{IngestError, IngestResult};
use signal_hook::consts::signal::{SIGINT, SIGTERM};
use tracing::{info, warn};

const SLEEP_SLICE: Duration = Duration::from_millis(50);

/// Tracks shutdown intent and owns the signal listener thread.
pub struct ShutdownCoordinator {
    shutting_down: AtomicBool,
    signal_handle: Mutex<Option<signal_hook::iterator::Handle>>,
    listener: Mutex<Option<thread::JoinHandle<()>>>,
}

impl Default for ShutdownCoordinator {
    fn default() -> Self {
        Self::new()
    }
}

impl ShutdownCoordinator {
    #[must_use]
    pub const fn new() -> Self {
        Self {
            shutting_down: AtomicBool::new(false),
            signal_handle: Mutex::new(None),
            listener: Mutex::new(None),
        }
    }

    /// Install the SIGINT/SIGTERM listener thread.
    pub fn register_signals(self: &Arc<Self>) -> IngestResult<()> {
        let mut signals =
            signal_hook::iterator::Signals::new([SIGINT, SIGTERM]).map_err(|error| {
                IngestError::subsystem(
                    "signals",
                    io::Error::other(format!("failed to register signal listeners: {error}")),
                )
            })?;
        let handle = signals.handle();

        let coordinator = Arc::clone(self);
        let listener = thread::Builder::new()
            .name("mailfeed-signal-listener".to_owned())
            .spawn(move || {
                for signal in signals.forever() {
                    info!(signal, "received shutdown signal");
                    coordinator.request_shutdown();
                }
            })
            .map_err(|error| {
                IngestError::subsystem(
                    "signals",
                    io::Error::other(format!("failed to start signal listener thread: {error}")),
                )
            })?;

        *lock_or_recover(&self.signal_handle) = Some(handle);
        *lock_or_recover(&self.listener) = Some(listener);
        Ok(())
    }

    /// Stop the signal listener thread, if one was installed.
    pub fn stop_signal_listener(&self) {
        if let Some(handle) = lock_or_recover(&self.signal_handle).take() {
            handle.close();
        }
        if let Some(listener) = lock_or_recover(&self.listener).take() {
            if listener.join().is_err() {
                warn!("signal listener thread panicked while stopping");
            }
        }
    }

    /// Request graceful shutdown from any source.
    pub fn request_shutdown(&self) {
        if !self.shutting_down.swap(true, Ordering::AcqRel) {
            info!("shutdown requested; no new batches will be admitted");
        }
    }

    #[must_use]
    pub fn is_shutting_down(&self) -> bool {
        self.shutting_down.load(Ordering::Acquire)
    }

    /// Sleep for `duration`, waking early on shutdown.
    ///
    /// Returns `true` when the full duration elapsed, `false` when the
    /// sleep was cut short by a shutdown request.
    pub fn sleep_unless_shutdown(&self, duration: Duration) -> bool {
        let end = Instant::now() + duration;
        while Instant::now() < end {
            if self.is_shutting_down() {
                return false;
            }
            let budget = end.saturating_duration_since(Instant::now());
            thread::sleep(budget.min(SLEEP_SLICE));
        }
        !self.is_shutting_down()
    }
}

fn lock_or_recover<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn starts_in_the_running_state() {
        let coordinator = ShutdownCoordinator::new();
        assert!(!coordinator.is_shutting_down());
    }

    #[test]
    fn request_shutdown_is_sticky() {
        let coordinator = ShutdownCoordinator::new();
        coordinator.request_shutdown();
        coordinator.request_shutdown();
        assert!(coordinator.is_shutting_down());
    }

    #[test]
    fn sleep_completes_when_running() {
        let coordinator = ShutdownCoordinator::new();
        let started = Instant::now();
        assert!(coordinator.sleep_unless_shutdown(Duration::from_millis(60)));
        assert!(started.elapsed() >= Duration::from_millis(60));
    }

    #[test]
    fn sleep_is_cut_short_by_shutdown() {
        let coordinator = Arc::new(ShutdownCoordinator::new());
        let trigger = Arc::clone(&coordinator);
        let handle = thread::spawn(move || {
            thread::sleep(Duration::from_millis(30));
            trigger.request_shutdown();
        });

        let started = Instant::now();
        let slept_fully = coordinator.sleep_unless_shutdown(Duration::from_secs(10));
        handle.join().expect("trigger thread");

        assert!(!slept_fully);
        assert!(started.elapsed() < Duration::from_secs(5));
    }

    #[test]
    fn listener_can_be_registered_and_stopped() {
        let coordinator = Arc::new(ShutdownCoordinator::new());
        coordinator
            .register_signals()
            .expect("signal registration should succeed");
        coordinator.stop_signal_listener();
    }
}
