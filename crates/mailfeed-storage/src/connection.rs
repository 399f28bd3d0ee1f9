use std::path::PathBuf;
use std::thread;
use std::time::{Duration, Instant};

use mailfeed_core::{IngestError, IngestResult};
use rusqlite::Connection;

use crate::schema;

/// How long a single transaction keeps retrying on `SQLITE_BUSY` before the
/// contention is reported to the caller.
const BUSY_RETRY_BUDGET: Duration = Duration::from_secs(5);
const BUSY_RETRY_BASE_DELAY: Duration = Duration::from_millis(20);

/// Ledger open parameters.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LedgerConfig {
    pub db_path: PathBuf,
    pub wal_mode: bool,
    pub busy_timeout_ms: u64,
}

impl LedgerConfig {
    /// Config pointing at a file path with default durability settings.
    #[must_use]
    pub fn at_path(db_path: impl Into<PathBuf>) -> Self {
        Self {
            db_path: db_path.into(),
            ..Self::default()
        }
    }

    #[must_use]
    pub fn in_memory() -> Self {
        Self::at_path(":memory:")
    }
}

impl Default for LedgerConfig {
    fn default() -> Self {
        Self {
            db_path: PathBuf::from("mailfeed-status.sqlite3"),
            wal_mode: true,
            busy_timeout_ms: 5_000,
        }
    }
}

/// One connection to the status ledger.
///
/// Connections are never shared between threads: the orchestrator and each
/// worker open their own `Ledger` and rely on SQLite's transactional
/// isolation for coordination.
pub struct Ledger {
    conn: Connection,
    config: LedgerConfig,
}

impl std::fmt::Debug for Ledger {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Ledger")
            .field("path", &self.config.db_path)
            .field("wal_mode", &self.config.wal_mode)
            .finish_non_exhaustive()
    }
}

impl Ledger {
    /// Open a connection, apply pragmas, and bootstrap the schema.
    pub fn open(config: LedgerConfig) -> IngestResult<Self> {
        tracing::debug!(
            target: "mailfeed.ledger",
            path = %config.db_path.display(),
            wal_mode = config.wal_mode,
            busy_timeout_ms = config.busy_timeout_ms,
            "opening ledger connection"
        );

        if config.db_path.as_os_str() != ":memory:" {
            if let Some(parent) = config.db_path.parent() {
                if !parent.as_os_str().is_empty() {
                    std::fs::create_dir_all(parent)?;
                }
            }
        }

        let conn = Connection::open(&config.db_path).map_err(map_ledger_error)?;
        let ledger = Self { conn, config };
        ledger.apply_pragmas()?;
        schema::bootstrap(ledger.connection())?;
        Ok(ledger)
    }

    /// In-memory ledger for tests.
    pub fn open_in_memory() -> IngestResult<Self> {
        Self::open(LedgerConfig::in_memory())
    }

    #[must_use]
    pub fn connection(&self) -> &Connection {
        &self.conn
    }

    #[must_use]
    pub fn config(&self) -> &LedgerConfig {
        &self.config
    }

    /// Run a closure inside a `BEGIN IMMEDIATE` transaction.
    ///
    /// The write lock is taken up front so batched upserts never interleave
    /// with a concurrent writer. `SQLITE_BUSY` on the begin is retried with
    /// backoff inside a bounded budget; contention past the budget surfaces
    /// to the caller.
    pub fn transaction<F, T>(&self, f: F) -> IngestResult<T>
    where
        F: FnOnce(&Connection) -> IngestResult<T>,
    {
        let started = Instant::now();
        let mut attempt: u32 = 0;
        loop {
            match self.conn.execute_batch("BEGIN IMMEDIATE;") {
                Ok(()) => break,
                Err(error) if is_busy(&error) && started.elapsed() < BUSY_RETRY_BUDGET => {
                    attempt += 1;
                    let delay = BUSY_RETRY_BASE_DELAY
                        .saturating_mul(1_u32.checked_shl(attempt.min(6)).unwrap_or(u32::MAX));
                    tracing::debug!(
                        target: "mailfeed.ledger",
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        "ledger busy on transaction begin, backing off"
                    );
                    thread::sleep(delay);
                }
                Err(error) => return Err(map_ledger_error(error)),
            }
        }

        match f(&self.conn) {
            Ok(value) => {
                self.conn.execute_batch("COMMIT;").map_err(|commit_err| {
                    let _ = self.conn.execute_batch("ROLLBACK;");
                    map_ledger_error(commit_err)
                })?;
                Ok(value)
            }
            Err(err) => {
                let _ = self.conn.execute_batch("ROLLBACK;");
                tracing::debug!(
                    target: "mailfeed.ledger",
                    ?err,
                    "ledger transaction rolled back"
                );
                Err(err)
            }
        }
    }

    fn apply_pragmas(&self) -> IngestResult<()> {
        let journal = if self.config.wal_mode { "WAL" } else { "DELETE" };
        self.conn
            .execute_batch(&format!("PRAGMA journal_mode={journal};"))
            .map_err(map_ledger_error)?;
        self.conn
            .execute_batch("PRAGMA synchronous=NORMAL; PRAGMA foreign_keys=ON;")
            .map_err(map_ledger_error)?;
        self.conn
            .busy_timeout(Duration::from_millis(self.config.busy_timeout_ms))
            .map_err(map_ledger_error)?;
        Ok(())
    }
}

pub(crate) fn map_ledger_error(source: rusqlite::Error) -> IngestError {
    IngestError::subsystem("ledger", source)
}

fn is_busy(error: &rusqlite::Error) -> bool {
    matches!(
        error.sqlite_error_code(),
        Some(rusqlite::ErrorCode::DatabaseBusy) | Some(rusqlite::ErrorCode::DatabaseLocked)
    )
}
