//! Bulk backends. The writer owns buffering; a backend only sends one rendered chunk.

use std::collections::{BTreeMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use odh_core::{IndexOperation, OperationKind};
use serde_json::{json, Value as JsonValue};
use tracing::debug;

use crate::{EngineFlavor, IndexError};

/// One operation the engine rejected.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ItemFailure {
    pub index: String,
    pub id: String,
    pub kind: OperationKind,
    pub reason: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BulkResponse {
    pub sent: usize,
    pub failures: Vec<ItemFailure>,
}

#[async_trait]
pub trait BulkSink: Send + Sync {
    /// Sends one chunk of operations, all targeting `index`.
    async fn send_bulk(
        &self,
        index: &str,
        operations: &[IndexOperation<JsonValue>],
    ) -> Result<BulkResponse, IndexError>;
}

/// Renders the NDJSON body of a `_bulk` request.
pub fn render_bulk_body(
    flavor: EngineFlavor,
    operations: &[IndexOperation<JsonValue>],
) -> Result<String, IndexError> {
    let mut body = String::new();
    for op in operations {
        let mut meta = json!({ "_index": op.target_index(), "_id": op.document_id() });
        if flavor.requires_type() {
            meta["_type"] = json!("_doc");
        }
        let action = match op.kind() {
            OperationKind::Index => "index",
            OperationKind::Delete => "delete",
        };
        let mut line = serde_json::Map::new();
        line.insert(action.to_string(), meta);
        body.push_str(&serde_json::to_string(&line)?);
        body.push('\n');
        if let Some(document) = op.document() {
            body.push_str(&serde_json::to_string(document)?);
            body.push('\n');
        }
    }
    Ok(body)
}

/// Maps the per-item results of a `_bulk` response back onto the submitted operations.
/// A delete answered with 404 means the document is already gone and counts as success.
pub fn parse_bulk_response(
    operations: &[IndexOperation<JsonValue>],
    response: &JsonValue,
) -> Result<BulkResponse, IndexError> {
    let items = response
        .get("items")
        .and_then(JsonValue::as_array)
        .ok_or_else(|| IndexError::InvalidResponse("missing items array".into()))?;
    if items.len() != operations.len() {
        return Err(IndexError::InvalidResponse(format!(
            "{} items for {} operations",
            items.len(),
            operations.len()
        )));
    }

    let mut failures = Vec::new();
    for (op, item) in operations.iter().zip(items) {
        let result = item
            .as_object()
            .and_then(|obj| obj.values().next())
            .ok_or_else(|| IndexError::InvalidResponse("empty bulk item".into()))?;
        let status = result.get("status").and_then(JsonValue::as_u64).unwrap_or(0);
        let ok = (200..300).contains(&status) || (op.kind() == OperationKind::Delete && status == 404);
        if ok {
            continue;
        }
        let reason = result
            .get("error")
            .map(|err| {
                err.get("reason")
                    .or_else(|| err.get("type"))
                    .and_then(JsonValue::as_str)
                    .map(str::to_string)
                    .unwrap_or_else(|| err.to_string())
            })
            .unwrap_or_else(|| format!("status {status}"));
        failures.push(ItemFailure {
            index: op.target_index().to_string(),
            id: op.document_id().to_string(),
            kind: op.kind(),
            reason,
        });
    }

    Ok(BulkResponse {
        sent: operations.len(),
        failures,
    })
}

/// Elasticsearch 6/7 or OpenSearch over HTTP.
#[derive(Debug, Clone)]
pub struct ElasticBackend {
    client: reqwest::Client,
    base_url: String,
    flavor: EngineFlavor,
}

impl ElasticBackend {
    pub fn new(base_url: &str, flavor: EngineFlavor, timeout: Duration) -> Result<Self, IndexError> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            flavor,
        })
    }

    pub fn flavor(&self) -> EngineFlavor {
        self.flavor
    }
}

#[async_trait]
impl BulkSink for ElasticBackend {
    async fn send_bulk(
        &self,
        index: &str,
        operations: &[IndexOperation<JsonValue>],
    ) -> Result<BulkResponse, IndexError> {
        let body = render_bulk_body(self.flavor, operations)?;
        debug!(index, operations = operations.len(), bytes = body.len(), "sending bulk chunk");

        let response = self
            .client
            .post(format!("{}/_bulk", self.base_url))
            .header(reqwest::header::CONTENT_TYPE, "application/x-ndjson")
            .body(body)
            .send()
            .await?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(IndexError::Status {
                status: status.as_u16(),
                body,
            });
        }
        let payload: JsonValue = response.json().await?;
        parse_bulk_response(operations, &payload)
    }
}

#[derive(Debug, Default)]
struct InMemoryState {
    batches: Vec<(String, Vec<IndexOperation<JsonValue>>)>,
    documents: BTreeMap<String, BTreeMap<String, JsonValue>>,
}

/// Records every batch and applies it to an in-process document map. Ids registered with
/// [`InMemoryBackend::fail_id`] are rejected per item.
#[derive(Debug, Default)]
pub struct InMemoryBackend {
    state: Mutex<InMemoryState>,
    failing_ids: Mutex<HashSet<String>>,
}

impl InMemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, InMemoryState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn fail_id(&self, id: impl Into<String>) {
        self.failing_ids
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .insert(id.into());
    }

    pub fn batches(&self) -> Vec<(String, Vec<IndexOperation<JsonValue>>)> {
        self.state().batches.clone()
    }

    pub fn document(&self, index: &str, id: &str) -> Option<JsonValue> {
        self.state().documents.get(index)?.get(id).cloned()
    }

    pub fn document_ids(&self, index: &str) -> Vec<String> {
        self.state()
            .documents
            .get(index)
            .map(|docs| docs.keys().cloned().collect())
            .unwrap_or_default()
    }
}

#[async_trait]
impl BulkSink for InMemoryBackend {
    async fn send_bulk(
        &self,
        index: &str,
        operations: &[IndexOperation<JsonValue>],
    ) -> Result<BulkResponse, IndexError> {
        let failing = self
            .failing_ids
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone();

        let mut state = self.state();
        state.batches.push((index.to_string(), operations.to_vec()));

        let mut failures = Vec::new();
        for op in operations {
            if failing.contains(op.document_id()) {
                failures.push(ItemFailure {
                    index: op.target_index().to_string(),
                    id: op.document_id().to_string(),
                    kind: op.kind(),
                    reason: "rejected by in-memory backend".into(),
                });
                continue;
            }
            let docs = state.documents.entry(op.target_index().to_string()).or_default();
            match op {
                IndexOperation::Index { id, document, .. } => {
                    docs.insert(id.clone(), document.clone());
                }
                IndexOperation::Delete { id, .. } => {
                    docs.remove(id);
                }
            }
        }

        Ok(BulkResponse {
            sent: operations.len(),
            failures,
        })
    }
}

#[derive(Debug, Clone)]
pub enum IndexBackend {
    Elastic(ElasticBackend),
    InMemory(Arc<InMemoryBackend>),
}

impl IndexBackend {
    pub fn describe(&self) -> String {
        match self {
            Self::Elastic(backend) => format!("{} at {}", backend.flavor, backend.base_url),
            Self::InMemory(_) => "in-memory".to_string(),
        }
    }
}

#[async_trait]
impl BulkSink for IndexBackend {
    async fn send_bulk(
        &self,
        index: &str,
        operations: &[IndexOperation<JsonValue>],
    ) -> Result<BulkResponse, IndexError> {
        match self {
            Self::Elastic(backend) => backend.send_bulk(index, operations).await,
            Self::InMemory(backend) => backend.send_bulk(index, operations).await,
        }
    }
}
