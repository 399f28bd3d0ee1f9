//! YAML-backed configuration for the mailfeed daemon.
//!
//! `paths` and `weaviate` are mandatory; `queue`, `worker`, and `logging`
//! default to sensible production values when omitted. [`AppConfig::load`]
//! reads, parses, and validates in one step so the daemon either starts with
//! a coherent config or exits before touching any state.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{IngestError, IngestResult};

/// Top-level configuration, one per daemon process.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AppConfig {
    pub paths: PathsConfig,
    pub weaviate: WeaviateConfig,
    #[serde(default)]
    pub queue: QueueConfig,
    #[serde(default)]
    pub worker: WorkerConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Staging directories and the ledger file location.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PathsConfig {
    /// Directory where producers drop new message files.
    pub wait_dir: PathBuf,
    /// Directory holding files of batches currently in flight.
    pub run_dir: PathBuf,
    /// Directory where failed files are quarantined.
    pub buggy_dir: PathBuf,
    /// Location of the SQLite status ledger.
    pub sqlite_path: PathBuf,
}

/// Vector database connection and collection settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct WeaviateConfig {
    /// Server base URL including scheme, e.g. `http://localhost:8080`.
    pub host: String,
    /// Optional API key; sent as a bearer token when present.
    #[serde(default)]
    pub api_key: Option<String>,
    /// Multi-tenant collection name.
    #[serde(default = "default_collection_name")]
    pub collection_name: String,
    pub embedding: EmbeddingConfig,
}

/// Server-side vectorizer selection.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct EmbeddingConfig {
    pub provider: EmbeddingProvider,
    pub model: String,
    pub vector_dimensions: u32,
}

/// Supported embedding providers.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum EmbeddingProvider {
    OpenAi,
    Ollama,
}

impl EmbeddingProvider {
    /// The vectorizer module name the server expects.
    #[must_use]
    pub const fn vectorizer(self) -> &'static str {
        match self {
            Self::OpenAi => "text2vec-openai",
            Self::Ollama => "text2vec-ollama",
        }
    }
}

/// Bounded work queue sizing.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct QueueConfig {
    /// Maximum number of batches queued at once.
    #[serde(default = "default_queue_maxsize")]
    pub maxsize: usize,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            maxsize: default_queue_maxsize(),
        }
    }
}

/// Worker pool sizing and poll cadence.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct WorkerConfig {
    /// Number of import worker threads.
    #[serde(default = "default_worker_threads")]
    pub threads: usize,
    /// Seconds between staging-area scans.
    #[serde(default = "default_poll_interval")]
    pub poll_interval: f64,
}

impl WorkerConfig {
    /// Poll interval as a `Duration`, clamped to a 100 ms floor.
    #[must_use]
    pub fn poll_duration(&self) -> Duration {
        Duration::from_secs_f64(self.poll_interval.max(0.1))
    }
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            threads: default_worker_threads(),
            poll_interval: default_poll_interval(),
        }
    }
}

/// Logging verbosity.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct LoggingConfig {
    /// One of `trace`, `debug`, `info`, `warn`, `error`.
    #[serde(default = "default_log_level")]
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

impl AppConfig {
    /// Load and validate a YAML config file.
    pub fn load(path: &Path) -> IngestResult<Self> {
        let raw = std::fs::read_to_string(path).map_err(|source| IngestError::InvalidConfig {
            field: "config".to_owned(),
            value: path.display().to_string(),
            reason: format!("cannot read file: {source}"),
        })?;
        let config: Self =
            serde_yaml::from_str(&raw).map_err(|source| IngestError::subsystem("config", source))?;
        config.validate()?;
        Ok(config)
    }

    /// Reject values that would make the daemon misbehave silently.
    pub fn validate(&self) -> IngestResult<()> {
        if self.queue.maxsize == 0 {
            return Err(invalid("queue.maxsize", "0", "must be at least 1"));
        }
        if self.worker.threads == 0 {
            return Err(invalid("worker.threads", "0", "must be at least 1"));
        }
        if !(self.worker.poll_interval.is_finite() && self.worker.poll_interval > 0.0) {
            return Err(invalid(
                "worker.poll_interval",
                &self.worker.poll_interval.to_string(),
                "must be a positive number of seconds",
            ));
        }
        if self.weaviate.host.trim().is_empty() {
            return Err(invalid("weaviate.host", "", "must not be empty"));
        }
        if self.weaviate.collection_name.trim().is_empty() {
            return Err(invalid("weaviate.collection_name", "", "must not be empty"));
        }
        if self.weaviate.embedding.vector_dimensions == 0 {
            return Err(invalid(
                "weaviate.embedding.vector_dimensions",
                "0",
                "must be at least 1",
            ));
        }
        Ok(())
    }
}

fn invalid(field: &str, value: &str, reason: &str) -> IngestError {
    IngestError::InvalidConfig {
        field: field.to_owned(),
        value: value.to_owned(),
        reason: reason.to_owned(),
    }
}

fn default_collection_name() -> String {
    "MailDoc".to_owned()
}

fn default_queue_maxsize() -> usize {
    100
}

fn default_worker_threads() -> usize {
    4
}

fn default_poll_interval() -> f64 {
    2.0
}

fn default_log_level() -> String {
    "info".to_owned()
}
