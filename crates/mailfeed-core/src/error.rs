use std::path::PathBuf;

/// Unified error type covering all failure modes across the mailfeed pipeline.
///
/// Every variant carries enough context to act on: which message record was
/// malformed, which config field was rejected, which subsystem produced an
/// underlying error. Workers treat `MalformedRecord`, `MissingField`, and
/// `InvalidTimestamp` as terminal for the affected file; `SinkUnavailable`
/// is terminal for the whole batch in flight.
#[derive(Debug, thiserror::Error)]
pub enum IngestError {
    /// The message record could not be interpreted at all.
    #[error("malformed message record: {detail}")]
    MalformedRecord {
        /// What went wrong while reading the record.
        detail: String,
    },

    /// A required message field is absent or not a string.
    #[error("message field {field:?} is missing or not a non-empty string")]
    MissingField {
        /// Which field was missing.
        field: &'static str,
    },

    /// `received_time` could not be parsed as an ISO-8601 timestamp.
    #[error("unparseable received_time {value:?}: expected an ISO-8601 timestamp")]
    InvalidTimestamp {
        /// The offending value.
        value: String,
    },

    /// No domain could be derived for a staged file.
    #[error("no domain resolvable for {file}: {detail}")]
    DomainUnresolved {
        /// The staged filename.
        file: String,
        /// Why every resolution step failed.
        detail: String,
    },

    /// A configuration value is invalid.
    #[error("invalid config: {field} = {value:?}: {reason}")]
    InvalidConfig {
        /// Which config field.
        field: String,
        /// The invalid value.
        value: String,
        /// Why it is invalid.
        reason: String,
    },

    /// The vector sink could not be reached at all; the whole batch fails.
    #[error("vector sink unreachable at {endpoint}: {detail}")]
    SinkUnavailable {
        /// The endpoint that was attempted.
        endpoint: String,
        /// Transport-level detail.
        detail: String,
    },

    /// The bounded work queue has been closed; no further batches are accepted.
    #[error("work queue is closed")]
    QueueClosed,

    /// The bounded work queue is at capacity.
    #[error("work queue is full ({capacity} batches)")]
    QueueFull {
        /// Configured queue capacity.
        capacity: usize,
    },

    /// A filesystem move could not be completed, leaving the source in place.
    #[error("failed to move {src} to {dst}: {source}")]
    MoveFailed {
        /// Source path.
        src: PathBuf,
        /// Destination path.
        dst: PathBuf,
        /// The underlying error.
        #[source]
        source: std::io::Error,
    },

    /// Wraps `std::io::Error` for file operations.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Wraps errors from subsystems (ledger, sink, config parsing).
    #[error("{subsystem} error: {source}")]
    Subsystem {
        /// Which subsystem produced the error (e.g. "ledger", "sink", "config").
        subsystem: &'static str,
        /// The underlying error.
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },
}

impl IngestError {
    /// Wrap an arbitrary error as a subsystem failure.
    pub fn subsystem<E>(subsystem: &'static str, source: E) -> Self
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        Self::Subsystem {
            subsystem,
            source: Box::new(source),
        }
    }
}

/// Convenience alias used throughout the mailfeed crate hierarchy.
pub type IngestResult<T> = Result<T, IngestError>;
