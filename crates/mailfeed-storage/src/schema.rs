use rusqlite::{Connection, OptionalExtension};

use mailfeed_core::{IngestError, IngestResult};

use crate::connection::map_ledger_error;

pub const SCHEMA_VERSION: i64 = 1;

/// Canonical schema for the status ledger.
///
/// One row per `mail_id`; the three secondary indexes back the read-only
/// aggregation queries (per-domain counts, per-user counts, latest
/// completion time).
const LATEST_SCHEMA: &[&str] = &[
    "CREATE TABLE IF NOT EXISTS mail_status (\
        mail_id TEXT PRIMARY KEY,\
        user_id TEXT NOT NULL,\
        domain TEXT NOT NULL,\
        is_completed INTEGER NOT NULL DEFAULT 0,\
        is_success INTEGER NOT NULL DEFAULT 0,\
        received_time TEXT NOT NULL,\
        error_message TEXT\
    );",
    "CREATE INDEX IF NOT EXISTS idx_domain_stats \
     ON mail_status (domain, is_completed, is_success);",
    "CREATE INDEX IF NOT EXISTS idx_user_stats \
     ON mail_status (user_id, is_completed, is_success);",
    "CREATE INDEX IF NOT EXISTS idx_time_progress \
     ON mail_status (received_time, is_completed);",
];

/// Create the ledger tables and indexes if absent.
///
/// Safe to run from several connections at once; every statement is
/// idempotent and the whole bootstrap runs inside one immediate transaction.
pub fn bootstrap(conn: &Connection) -> IngestResult<()> {
    conn.execute_batch("BEGIN IMMEDIATE;")
        .map_err(map_ledger_error)?;
    match bootstrap_inner(conn) {
        Ok(()) => conn.execute_batch("COMMIT;").map_err(map_ledger_error),
        Err(error) => {
            if let Err(rollback_err) = conn.execute_batch("ROLLBACK;") {
                tracing::warn!(
                    target: "mailfeed.ledger",
                    error = %rollback_err,
                    "rollback failed after schema bootstrap error"
                );
            }
            Err(error)
        }
    }
}

fn bootstrap_inner(conn: &Connection) -> IngestResult<()> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS schema_version (version INTEGER PRIMARY KEY);",
    )
    .map_err(map_ledger_error)?;

    let version = current_version_optional(conn)?.unwrap_or(0);
    if version > SCHEMA_VERSION {
        return Err(IngestError::subsystem(
            "ledger",
            std::io::Error::other(format!(
                "schema version {version} is newer than supported {SCHEMA_VERSION}"
            )),
        ));
    }

    if version < SCHEMA_VERSION {
        tracing::debug!(
            target: "mailfeed.ledger",
            from_version = version,
            to_version = SCHEMA_VERSION,
            "bootstrapping ledger schema"
        );
        for statement in LATEST_SCHEMA {
            conn.execute_batch(statement).map_err(map_ledger_error)?;
        }
        conn.execute(
            "INSERT OR REPLACE INTO schema_version(version) VALUES (?1);",
            [SCHEMA_VERSION],
        )
        .map_err(map_ledger_error)?;
    }

    Ok(())
}

pub fn current_version(conn: &Connection) -> IngestResult<i64> {
    current_version_optional(conn)?.ok_or_else(|| {
        IngestError::subsystem(
            "ledger",
            std::io::Error::other("schema_version table has no rows"),
        )
    })
}

fn current_version_optional(conn: &Connection) -> IngestResult<Option<i64>> {
    conn.query_row(
        "SELECT version FROM schema_version ORDER BY version DESC LIMIT 1;",
        [],
        |row| row.get(0),
    )
    .optional()
    .map_err(map_ledger_error)
}
