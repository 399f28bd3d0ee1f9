//! Tracing conventions shared across the mailfeed crates.
//!
//! Subscriber installation lives in the binaries; this module only fixes the
//! target names and the level parsing so logs stay filterable with
//! `RUST_LOG=mailfeed=debug` regardless of which binary emits them.

use tracing::Level;

/// Target prefix used by all mailfeed tracing events.
pub const TARGET_PREFIX: &str = "mailfeed";

/// Per-subsystem tracing targets.
pub mod targets {
    /// Status ledger operations.
    pub const LEDGER: &str = "mailfeed.ledger";
    /// Vector sink calls.
    pub const SINK: &str = "mailfeed.sink";
    /// Orchestrator, stager, batcher, queue.
    pub const INGEST: &str = "mailfeed.ingestd";
    /// Worker pool lifecycle and batch processing.
    pub const WORKER: &str = "mailfeed.worker";
}

/// Parse a log level string (case-insensitive).
///
/// Recognized values: `trace`, `debug`, `info`, `warn`, `error`.
#[must_use]
pub fn parse_level(s: &str) -> Option<Level> {
    match s.to_lowercase().as_str() {
        "trace" => Some(Level::TRACE),
        "debug" => Some(Level::DEBUG),
        "info" => Some(Level::INFO),
        "warn" => Some(Level::WARN),
        "error" => Some(Level::ERROR),
        _ => None,
    }
}

/// Resolve the effective log level: `MAILFEED_LOG_LEVEL` wins over the
/// configured value, which wins over the provided default.
#[must_use]
pub fn effective_level(configured: &str, default: Level) -> Level {
    if let Ok(env_value) = std::env::var("MAILFEED_LOG_LEVEL") {
        if let Some(level) = parse_level(&env_value) {
            return level;
        }
    }
    parse_level(configured).unwrap_or(default)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_level_recognizes_valid_levels() {
        assert_eq!(parse_level("trace"), Some(Level::TRACE));
        assert_eq!(parse_level("debug"), Some(Level::DEBUG));
        assert_eq!(parse_level("info"), Some(Level::INFO));
        assert_eq!(parse_level("warn"), Some(Level::WARN));
        assert_eq!(parse_level("error"), Some(Level::ERROR));
    }

    #[test]
    fn parse_level_is_case_insensitive() {
        assert_eq!(parse_level("INFO"), Some(Level::INFO));
        assert_eq!(parse_level("Debug"), Some(Level::DEBUG));
    }

    #[test]
    fn parse_level_rejects_unknown_values() {
        assert_eq!(parse_level("verbose"), None);
        assert_eq!(parse_level(""), None);
    }

    #[test]
    fn effective_level_prefers_configured_value() {
        assert_eq!(effective_level("warn", Level::INFO), Level::WARN);
        assert_eq!(effective_level("nonsense", Level::INFO), Level::INFO);
    }

    #[test]
    fn targets_share_the_prefix() {
        for target in [targets::LEDGER, targets::SINK, targets::INGEST, targets::WORKER] {
            assert!(target.starts_with(TARGET_PREFIX));
        }
    }
}
