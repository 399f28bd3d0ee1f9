//! Core types for the mailfeed batch ingestion pipeline.
//!
//! This crate defines the shared error type ([`IngestError`]), the validated
//! message model ([`Mail`], [`MailBatch`]), YAML configuration loading
//! ([`AppConfig`]), and the tracing conventions used across the workspace.
//! It has minimal external dependencies and is depended on by every other
//! crate in the workspace.

pub mod config;
pub mod error;
pub mod message;
pub mod tracing_config;

pub use config::{
    AppConfig, EmbeddingConfig, EmbeddingProvider, LoggingConfig, PathsConfig, QueueConfig,
    WeaviateConfig, WorkerConfig,
};
pub use error::{IngestError, IngestResult};
pub use message::{Mail, MailBatch};
