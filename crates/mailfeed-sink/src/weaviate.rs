//! Weaviate REST implementation of the [`VectorSink`] trait.
//!
//! The collection is created with multi-tenancy enabled and a server-side
//! vectorizer module selected from the embedding config; objects are
//! imported through the batch endpoint with the tenant set per object.
//! Vectors are generated server-side, so inserts carry text only.

use std::collections::HashSet;
use std::time::Duration;

use mailfeed_core::{IngestError, IngestResult, WeaviateConfig};
use reqwest::blocking::{Client, RequestBuilder, Response};
use reqwest::StatusCode;
use serde_json::{json, Value};

use crate::{ObjectFailure, SinkConnector, SinkObject, VectorSink};

const HTTP_TIMEOUT: Duration = Duration::from_secs(60);

/// Required properties every collection carries.
const BASE_PROPERTIES: &[&str] = &[
    "filter_user_id",
    "filter_year",
    "filter_month",
    "filter_day",
    "mail_id",
    "search_mail_content",
    "search_mail_header",
];

/// Optional `filter_*` properties shipped with the default schema.
///
/// Changing this list is a breaking schema change: extend it here, make the
/// message property mapping emit the new field, and drop-and-recreate any
/// live collection whose schema conflicts. There is no online migration.
const DEFAULT_FILTER_FIELDS: &[&str] = &["filter_mailbox", "filter_folder"];

/// One Weaviate client, owned by exactly one thread.
pub struct WeaviateSink {
    http: Client,
    config: WeaviateConfig,
    tenants: HashSet<String>,
}

impl WeaviateSink {
    /// Build a client for the configured server. No request is made yet.
    pub fn connect(config: &WeaviateConfig) -> IngestResult<Self> {
        let http = Client::builder()
            .timeout(HTTP_TIMEOUT)
            .build()
            .map_err(|error| transport(&config.host, &error))?;
        Ok(Self {
            http,
            config: config.clone(),
            tenants: HashSet::new(),
        })
    }

    fn endpoint(&self, path: &str) -> String {
        format!("{}/v1/{path}", self.config.host.trim_end_matches('/'))
    }

    fn authorize(&self, request: RequestBuilder) -> RequestBuilder {
        match &self.config.api_key {
            Some(key) => request.bearer_auth(key),
            None => request,
        }
    }

    fn create_collection(&self) -> IngestResult<()> {
        let url = self.endpoint("schema");
        let payload = class_payload(&self.config);
        let response = self
            .authorize(self.http.post(&url))
            .json(&payload)
            .send()
            .map_err(|error| transport(&url, &error))?;

        let status = response.status();
        if status.is_success() {
            tracing::info!(
                target: "mailfeed.sink",
                collection = %self.config.collection_name,
                vectorizer = self.config.embedding.provider.vectorizer(),
                "created vector collection"
            );
            return Ok(());
        }

        // A concurrent creator may have won the race; that is fine.
        let body = body_snippet(response);
        if body.contains("already exists") {
            return Ok(());
        }
        Err(protocol_error(&url, status, &body))
    }
}

impl VectorSink for WeaviateSink {
    fn ensure_collection(&mut self) -> IngestResult<()> {
        let url = self.endpoint(&format!("schema/{}", self.config.collection_name));
        let response = self
            .authorize(self.http.get(&url))
            .send()
            .map_err(|error| transport(&url, &error))?;

        match response.status() {
            status if status.is_success() => Ok(()),
            StatusCode::NOT_FOUND => self.create_collection(),
            status => Err(protocol_error(&url, status, &body_snippet(response))),
        }
    }

    fn ensure_tenant(&mut self, domain: &str) -> IngestResult<()> {
        if domain.is_empty() || self.tenants.contains(domain) {
            return Ok(());
        }

        let url = self.endpoint(&format!("schema/{}/tenants", self.config.collection_name));
        let response = self
            .authorize(self.http.post(&url))
            .json(&json!([{ "name": domain }]))
            .send()
            .map_err(|error| transport(&url, &error))?;

        let status = response.status();
        if !status.is_success() {
            let body = body_snippet(response);
            if !body.contains("already exists") {
                return Err(protocol_error(&url, status, &body));
            }
        }

        tracing::debug!(target: "mailfeed.sink", tenant = domain, "tenant ensured");
        self.tenants.insert(domain.to_owned());
        Ok(())
    }

    fn import_batch(
        &mut self,
        domain: &str,
        objects: &[SinkObject],
    ) -> IngestResult<Vec<ObjectFailure>> {
        if objects.is_empty() {
            return Ok(Vec::new());
        }

        let url = self.endpoint("batch/objects");
        let payload = json!({
            "objects": objects
                .iter()
                .map(|object| {
                    json!({
                        "class": self.config.collection_name,
                        "id": object.id,
                        "tenant": domain,
                        "properties": Value::Object(object.properties.clone()),
                    })
                })
                .collect::<Vec<Value>>(),
        });

        let response = self
            .authorize(self.http.post(&url))
            .json(&payload)
            .send()
            .map_err(|error| transport(&url, &error))?;

        let status = response.status();
        if !status.is_success() {
            return Err(IngestError::SinkUnavailable {
                endpoint: url,
                detail: format!("HTTP {status}: {}", body_snippet(response)),
            });
        }

        let results: Value = response.json().map_err(|error| transport(&url, &error))?;
        let failures = collect_failures(&results);
        tracing::debug!(
            target: "mailfeed.sink",
            tenant = domain,
            objects = objects.len(),
            failed = failures.len(),
            "batch import completed"
        );
        Ok(failures)
    }
}

/// Mints per-worker [`WeaviateSink`] clients from a shared config.
#[derive(Debug, Clone)]
pub struct WeaviateConnector {
    config: WeaviateConfig,
}

impl WeaviateConnector {
    #[must_use]
    pub fn new(config: WeaviateConfig) -> Self {
        Self { config }
    }
}

impl SinkConnector for WeaviateConnector {
    fn connect(&self) -> IngestResult<Box<dyn VectorSink>> {
        Ok(Box::new(WeaviateSink::connect(&self.config)?))
    }
}

/// Build the class definition for the multi-tenant collection.
fn class_payload(config: &WeaviateConfig) -> Value {
    let vectorizer = config.embedding.provider.vectorizer();
    let properties: Vec<Value> = BASE_PROPERTIES
        .iter()
        .chain(DEFAULT_FILTER_FIELDS)
        .map(|name| json!({ "name": name, "dataType": ["text"] }))
        .collect();

    // The module config key is the vectorizer name itself.
    let mut module_config = serde_json::Map::new();
    module_config.insert(
        vectorizer.to_owned(),
        json!({
            "model": config.embedding.model,
            "dimensions": config.embedding.vector_dimensions,
        }),
    );

    json!({
        "class": config.collection_name,
        "vectorizer": vectorizer,
        "moduleConfig": Value::Object(module_config),
        "multiTenancyConfig": { "enabled": true },
        "properties": properties,
    })
}

/// Extract per-object failures from a batch-import response body.
fn collect_failures(results: &Value) -> Vec<ObjectFailure> {
    let Some(items) = results.as_array() else {
        return Vec::new();
    };

    let mut failures = Vec::new();
    for item in items {
        let Some(mail_id) = item.get("id").and_then(Value::as_str) else {
            continue;
        };
        let errors = item
            .pointer("/result/errors/error")
            .and_then(Value::as_array);
        if let Some(errors) = errors {
            if errors.is_empty() {
                continue;
            }
            let message = errors
                .first()
                .and_then(|entry| entry.get("message"))
                .and_then(Value::as_str)
                .unwrap_or("batch import failed")
                .to_owned();
            failures.push(ObjectFailure {
                mail_id: mail_id.to_owned(),
                message,
            });
        }
    }
    failures
}

fn transport(endpoint: &str, error: &reqwest::Error) -> IngestError {
    IngestError::SinkUnavailable {
        endpoint: endpoint.to_owned(),
        detail: error.to_string(),
    }
}

fn protocol_error(url: &str, status: StatusCode, body: &str) -> IngestError {
    IngestError::subsystem(
        "sink",
        std::io::Error::other(format!("unexpected HTTP {status} from {url}: {body}")),
    )
}

fn body_snippet(response: Response) -> String {
    const SNIPPET_LEN: usize = 512;
    let mut body = response.text().unwrap_or_default();
    body.truncate(SNIPPET_LEN);
    body
}
