//! Status row operations.
//!
//! Every message ever enqueued has exactly one row keyed by `mail_id`.
//! Rows are created in the pending state at enqueue time and finalized to
//! success or failure by the worker that terminates the batch; once
//! `is_completed` is set it is never cleared. All batched variants commit
//! in a single transaction.

use mailfeed_core::message::Mail;
use mailfeed_core::IngestResult;
use rusqlite::{params, Connection, OptionalExtension};
use serde::Serialize;

use crate::connection::{map_ledger_error, Ledger};

/// Identifying fields written with every status transition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusKey {
    pub mail_id: String,
    pub user_id: String,
    pub domain: String,
    pub received_time: String,
}

impl StatusKey {
    #[must_use]
    pub fn new(
        mail_id: impl Into<String>,
        user_id: impl Into<String>,
        domain: impl Into<String>,
        received_time: impl Into<String>,
    ) -> Self {
        Self {
            mail_id: mail_id.into(),
            user_id: user_id.into(),
            domain: domain.into(),
            received_time: received_time.into(),
        }
    }

    /// Key for a message handled under a specific tenant domain.
    ///
    /// The domain a batch was grouped under is the tenant its objects are
    /// imported into, so it is also what every ledger row for that batch
    /// records; the message body's own domain never diverges from what
    /// the aggregations report.
    #[must_use]
    pub fn for_tenant(mail: &Mail, domain: impl Into<String>) -> Self {
        Self::new(
            mail.mail_id.clone(),
            mail.user_id.clone(),
            domain,
            mail.received_time.clone(),
        )
    }
}

/// A full ledger row as stored.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusRow {
    pub mail_id: String,
    pub user_id: String,
    pub domain: String,
    pub is_completed: bool,
    pub is_success: bool,
    pub received_time: String,
    pub error_message: Option<String>,
}

/// Aggregated counts for a domain or user.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct StatusCounts {
    pub completed_success: u64,
    pub completed_failure: u64,
    pub pending: u64,
    pub total: u64,
}

impl Ledger {
    /// Insert-or-replace a row in the pending state. Used at enqueue.
    pub fn upsert_pending(&self, key: &StatusKey) -> IngestResult<()> {
        self.transaction(|conn| upsert_row(conn, key, false, false, None))
    }

    /// Pending upserts for a whole batch in one transaction.
    pub fn upsert_pending_many(&self, keys: &[StatusKey]) -> IngestResult<()> {
        if keys.is_empty() {
            return Ok(());
        }
        self.transaction(|conn| {
            for key in keys {
                upsert_row(conn, key, false, false, None)?;
            }
            Ok(())
        })
    }

    /// Finalize one row as successfully imported.
    pub fn mark_success(&self, key: &StatusKey) -> IngestResult<()> {
        self.transaction(|conn| upsert_row(conn, key, true, true, None))
    }

    /// Finalize one row as failed, recording the reason.
    pub fn mark_failure(&self, key: &StatusKey, error_message: &str) -> IngestResult<()> {
        self.transaction(|conn| upsert_row(conn, key, true, false, Some(error_message)))
    }

    /// Finalize every row of a processed batch in one transaction.
    ///
    /// Workers call this once per batch, before touching the files, so a
    /// crash between the commit and the filesystem moves leaves `run/` as
    /// the authoritative pending indicator for the next startup.
    pub fn finalize_batch(
        &self,
        successes: &[StatusKey],
        failures: &[(StatusKey, String)],
    ) -> IngestResult<()> {
        if successes.is_empty() && failures.is_empty() {
            return Ok(());
        }
        self.transaction(|conn| {
            for key in successes {
                upsert_row(conn, key, true, true, None)?;
            }
            for (key, error_message) in failures {
                upsert_row(conn, key, true, false, Some(error_message))?;
            }
            Ok(())
        })
    }

    /// Per-domain completion counts.
    pub fn domain_stats(&self, domain: &str) -> IngestResult<StatusCounts> {
        grouped_counts(
            self.connection(),
            "SELECT is_completed, is_success, COUNT(*) FROM mail_status \
             WHERE domain = ?1 GROUP BY is_completed, is_success;",
            domain,
        )
    }

    /// Per-user completion counts.
    pub fn user_stats(&self, user_id: &str) -> IngestResult<StatusCounts> {
        grouped_counts(
            self.connection(),
            "SELECT is_completed, is_success, COUNT(*) FROM mail_status \
             WHERE user_id = ?1 GROUP BY is_completed, is_success;",
            user_id,
        )
    }

    /// Latest `received_time` among completed rows, if any.
    pub fn last_completed_time(&self) -> IngestResult<Option<String>> {
        self.connection()
            .query_row(
                "SELECT MAX(received_time) FROM mail_status WHERE is_completed = 1;",
                [],
                |row| row.get(0),
            )
            .map_err(map_ledger_error)
    }

    /// Fetch one row by id.
    pub fn fetch_status(&self, mail_id: &str) -> IngestResult<Option<StatusRow>> {
        self.connection()
            .query_row(
                "SELECT mail_id, user_id, domain, is_completed, is_success, \
                        received_time, error_message \
                 FROM mail_status WHERE mail_id = ?1;",
                [mail_id],
                |row| {
                    Ok(StatusRow {
                        mail_id: row.get(0)?,
                        user_id: row.get(1)?,
                        domain: row.get(2)?,
                        is_completed: row.get::<_, i64>(3)? != 0,
                        is_success: row.get::<_, i64>(4)? != 0,
                        received_time: row.get(5)?,
                        error_message: row.get(6)?,
                    })
                },
            )
            .optional()
            .map_err(map_ledger_error)
    }
}

fn upsert_row(
    conn: &Connection,
    key: &StatusKey,
    is_completed: bool,
    is_success: bool,
    error_message: Option<&str>,
) -> IngestResult<()> {
    let mut stmt = conn
        .prepare_cached(
            "INSERT INTO mail_status \
             (mail_id, user_id, domain, is_completed, is_success, received_time, error_message) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7) \
             ON CONFLICT(mail_id) DO UPDATE SET \
                 user_id = excluded.user_id, \
                 domain = excluded.domain, \
                 is_completed = excluded.is_completed, \
                 is_success = excluded.is_success, \
                 received_time = excluded.received_time, \
                 error_message = excluded.error_message;",
        )
        .map_err(map_ledger_error)?;
    stmt.execute(params![
        key.mail_id,
        key.user_id,
        key.domain,
        i64::from(is_completed),
        i64::from(is_success),
        key.received_time,
        error_message,
    ])
    .map_err(map_ledger_error)?;
    Ok(())
}

fn grouped_counts(conn: &Connection, sql: &str, param: &str) -> IngestResult<StatusCounts> {
    let mut stmt = conn.prepare_cached(sql).map_err(map_ledger_error)?;
    let rows = stmt
        .query_map([param], |row| {
            Ok((
                row.get::<_, i64>(0)?,
                row.get::<_, i64>(1)?,
                row.get::<_, i64>(2)?,
            ))
        })
        .map_err(map_ledger_error)?;

    let mut counts = StatusCounts::default();
    for row in rows {
        let (is_completed, is_success, count) = row.map_err(map_ledger_error)?;
        let count = u64::try_from(count).unwrap_or(0);
        match (is_completed != 0, is_success != 0) {
            (true, true) => counts.completed_success += count,
            (true, false) => counts.completed_failure += count,
            (false, _) => counts.pending += count,
        }
    }
    counts.total = counts.completed_success + counts.completed_failure + counts.pending;
    Ok(counts)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(mail_id: &str) -> StatusKey {
        StatusKey::new(mail_id, "alice@ex.com", "ex.com", "2025-02-01T09:00:00")
    }

    #[test]
    fn pending_then_success_keeps_one_row() {
        let ledger = Ledger::open_in_memory().expect("ledger");
        ledger.upsert_pending(&key("m1")).expect("pending");
        ledger.mark_success(&key("m1")).expect("success");

        let row = ledger
            .fetch_status("m1")
            .expect("fetch")
            .expect("row should exist");
        assert!(row.is_completed);
        assert!(row.is_success);
        assert_eq!(row.error_message, None);

        let stats = ledger.domain_stats("ex.com").expect("stats");
        assert_eq!(stats.total, 1);
        assert_eq!(stats.completed_success, 1);
    }

    #[test]
    fn failure_records_error_message() {
        let ledger = Ledger::open_in_memory().expect("ledger");
        ledger.upsert_pending(&key("m2")).expect("pending");
        ledger
            .mark_failure(&key("m2"), "import rejected: bad tenant")
            .expect("failure");

        let row = ledger.fetch_status("m2").expect("fetch").expect("row");
        assert!(row.is_completed);
        assert!(!row.is_success);
        assert_eq!(
            row.error_message.as_deref(),
            Some("import rejected: bad tenant")
        );
    }

    #[test]
    fn finalize_batch_is_one_transaction() {
        let ledger = Ledger::open_in_memory().expect("ledger");
        let keys: Vec<StatusKey> = (0..5).map(|i| key(&format!("m{i}"))).collect();
        ledger.upsert_pending_many(&keys).expect("pending many");

        let successes = keys[..3].to_vec();
        let failures: Vec<(StatusKey, String)> = keys[3..]
            .iter()
            .map(|k| (k.clone(), "object rejected".to_owned()))
            .collect();
        ledger
            .finalize_batch(&successes, &failures)
            .expect("finalize");

        let stats = ledger.domain_stats("ex.com").expect("stats");
        assert_eq!(stats.completed_success, 3);
        assert_eq!(stats.completed_failure, 2);
        assert_eq!(stats.pending, 0);
        assert_eq!(stats.total, 5);
    }

    #[test]
    fn stale_pending_row_is_overwritten_on_retry() {
        // Crash recovery re-enqueues a file whose pending row survived.
        let ledger = Ledger::open_in_memory().expect("ledger");
        ledger.upsert_pending(&key("m3")).expect("first attempt");
        ledger.upsert_pending(&key("m3")).expect("second attempt");

        let stats = ledger.domain_stats("ex.com").expect("stats");
        assert_eq!(stats.total, 1, "retry must not duplicate the row");
        assert_eq!(stats.pending, 1);
    }

    #[test]
    fn user_stats_are_scoped_to_the_user() {
        let ledger = Ledger::open_in_memory().expect("ledger");
        ledger.upsert_pending(&key("m4")).expect("pending");
        ledger
            .mark_success(&StatusKey::new(
                "m5",
                "bob@ex.com",
                "ex.com",
                "2025-02-01T10:00:00",
            ))
            .expect("success");

        let alice = ledger.user_stats("alice@ex.com").expect("alice stats");
        assert_eq!(alice.pending, 1);
        assert_eq!(alice.total, 1);

        let bob = ledger.user_stats("bob@ex.com").expect("bob stats");
        assert_eq!(bob.completed_success, 1);
        assert_eq!(bob.total, 1);
    }

    #[test]
    fn last_completed_time_ignores_pending_rows() {
        let ledger = Ledger::open_in_memory().expect("ledger");
        assert_eq!(ledger.last_completed_time().expect("empty"), None);

        ledger
            .upsert_pending(&StatusKey::new(
                "m6",
                "a@ex.com",
                "ex.com",
                "2025-09-01T00:00:00",
            ))
            .expect("pending");
        assert_eq!(
            ledger.last_completed_time().expect("still pending"),
            None,
            "pending rows do not advance progress"
        );

        ledger
            .mark_success(&StatusKey::new(
                "m7",
                "a@ex.com",
                "ex.com",
                "2025-03-01T00:00:00",
            ))
            .expect("success");
        assert_eq!(
            ledger.last_completed_time().expect("completed").as_deref(),
            Some("2025-03-01T00:00:00")
        );
    }

    #[test]
    fn for_tenant_overrides_the_message_domain() {
        let mail = Mail::from_json_record(
            &serde_json::json!({
                "mail_id": "m8",
                "user_id": "a@other.net",
                "domain": "other.net",
                "received_time": "2025-02-01T09:00:00"
            }),
            "",
        )
        .expect("record should parse");

        let key = StatusKey::for_tenant(&mail, "ex.com");
        assert_eq!(key.domain, "ex.com");
        assert_eq!(key.mail_id, "m8");
        assert_eq!(key.user_id, "a@other.net");
    }

    #[test]
    fn empty_batches_are_no_ops() {
        let ledger = Ledger::open_in_memory().expect("ledger");
        ledger.upsert_pending_many(&[]).expect("empty pending");
        ledger.finalize_batch(&[], &[]).expect("empty finalize");
        assert_eq!(ledger.domain_stats("ex.com").expect("stats").total, 0);
    }
}
