//! Vector sink facade.
//!
//! The pipeline only ever needs three operations from the vector database:
//! make sure the multi-tenant collection exists, make sure a tenant exists,
//! and bulk-import a batch of objects reporting per-object failures. The
//! [`VectorSink`] trait captures exactly that seam so workers can be
//! exercised against an in-memory fake, and [`WeaviateSink`] implements it
//! over the Weaviate REST API.
//!
//! Each worker owns its own sink instance; a [`SinkConnector`] mints them.

pub mod weaviate;

use mailfeed_core::IngestResult;
use serde_json::{Map, Value};

pub use weaviate::{WeaviateConnector, WeaviateSink};

/// One object to import: the message id doubles as the vector object id.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SinkObject {
    pub id: String,
    pub properties: Map<String, Value>,
}

/// A per-object import failure reported by the sink.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObjectFailure {
    pub mail_id: String,
    pub message: String,
}

/// The operations the pipeline invokes against the vector database.
///
/// Implementations do not retry: a connection-level error from
/// [`import_batch`](VectorSink::import_batch) means the caller must treat
/// every object in the batch as failed.
pub trait VectorSink {
    /// Idempotently create the multi-tenant collection. Called once at
    /// startup from the orchestrator's connection; workers assume it exists.
    fn ensure_collection(&mut self) -> IngestResult<()>;

    /// Idempotently create a tenant. Called lazily, once per batch.
    fn ensure_tenant(&mut self, domain: &str) -> IngestResult<()>;

    /// Bulk-import a batch for one tenant, returning per-object failures.
    fn import_batch(
        &mut self,
        domain: &str,
        objects: &[SinkObject],
    ) -> IngestResult<Vec<ObjectFailure>>;
}

/// Mints one sink per worker thread; clients are never shared.
pub trait SinkConnector: Send + Sync {
    fn connect(&self) -> IngestResult<Box<dyn VectorSink>>;
}
