use std::collections::BTreeMap;
use std::sync::Arc;

use odh_core::IndexOperation;
use serde::Serialize;
use serde_json::Value as JsonValue;
use tracing::{info, warn};

use crate::backend::{BulkSink, IndexBackend, ItemFailure};
use crate::IndexError;

pub const DEFAULT_CHUNK_SIZE: usize = 50;

/// What happened to a submitted operation, or to an index at finalize.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubmitOutcome {
    /// Buffered, not yet sent.
    Queued,
    Sent,
    /// Sent, but this many items were rejected.
    SentWithErrors(usize),
}

impl SubmitOutcome {
    fn combine(self, other: SubmitOutcome) -> SubmitOutcome {
        match (self, other) {
            (Self::SentWithErrors(a), Self::SentWithErrors(b)) => Self::SentWithErrors(a + b),
            (Self::SentWithErrors(a), _) | (_, Self::SentWithErrors(a)) => Self::SentWithErrors(a),
            (Self::Sent, _) | (_, Self::Sent) => Self::Sent,
            _ => Self::Queued,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WriterReport {
    /// One entry per index that received at least one chunk.
    pub outcomes: BTreeMap<String, SubmitOutcome>,
    pub sent: usize,
    pub errors: Vec<ItemFailure>,
}

impl WriterReport {
    pub fn is_clean(&self) -> bool {
        self.errors.is_empty()
    }
}

/// Buffers operations per target index and sends them in chunks of `chunk_size`.
/// Operations for different indices never share a request.
pub struct BulkIndexWriter {
    backend: Arc<IndexBackend>,
    chunk_size: usize,
    queues: BTreeMap<String, Vec<IndexOperation<JsonValue>>>,
    report: WriterReport,
}

impl BulkIndexWriter {
    pub fn new(backend: Arc<IndexBackend>, chunk_size: usize) -> Self {
        Self {
            backend,
            chunk_size: chunk_size.max(1),
            queues: BTreeMap::new(),
            report: WriterReport::default(),
        }
    }

    pub fn pending(&self) -> usize {
        self.queues.values().map(Vec::len).sum()
    }

    pub fn errors(&self) -> &[ItemFailure] {
        &self.report.errors
    }

    pub async fn submit(&mut self, operation: IndexOperation<JsonValue>) -> SubmitOutcome {
        let index = operation.target_index().to_string();
        let queue = self.queues.entry(index.clone()).or_default();
        queue.push(operation);
        if queue.len() < self.chunk_size {
            return SubmitOutcome::Queued;
        }
        let chunk = std::mem::take(queue);
        self.send_chunk(&index, chunk).await
    }

    pub async fn submit_document<D: Serialize>(
        &mut self,
        operation: IndexOperation<D>,
    ) -> Result<SubmitOutcome, IndexError> {
        let operation = operation.try_map_document(|doc| serde_json::to_value(doc))?;
        Ok(self.submit(operation).await)
    }

    /// Sends every remaining queue and returns the per-index outcomes and all item failures.
    pub async fn finalize(mut self) -> WriterReport {
        let queues = std::mem::take(&mut self.queues);
        for (index, chunk) in queues {
            if !chunk.is_empty() {
                self.send_chunk(&index, chunk).await;
            }
        }
        info!(
            indices = self.report.outcomes.len(),
            sent = self.report.sent,
            errors = self.report.errors.len(),
            "bulk writer finalized"
        );
        self.report
    }

    /// Drops everything still queued; chunks already sent stay sent.
    pub fn discard(mut self) -> WriterReport {
        let dropped = self.pending();
        if dropped > 0 {
            warn!(dropped, "discarding queued index operations");
        }
        self.queues.clear();
        self.report
    }

    async fn send_chunk(&mut self, index: &str, chunk: Vec<IndexOperation<JsonValue>>) -> SubmitOutcome {
        let outcome = match self.backend.send_bulk(index, &chunk).await {
            Ok(response) => {
                for failure in &response.failures {
                    warn!(index, id = %failure.id, reason = %failure.reason, "index operation rejected");
                }
                let failed = response.failures.len();
                self.report.sent += response.sent;
                self.report.errors.extend(response.failures);
                if failed == 0 {
                    SubmitOutcome::Sent
                } else {
                    SubmitOutcome::SentWithErrors(failed)
                }
            }
            Err(err) => {
                warn!(index, operations = chunk.len(), error = %err, "bulk request failed");
                let reason = err.to_string();
                self.report.sent += chunk.len();
                self.report.errors.extend(chunk.iter().map(|op| ItemFailure {
                    index: index.to_string(),
                    id: op.document_id().to_string(),
                    kind: op.kind(),
                    reason: reason.clone(),
                }));
                SubmitOutcome::SentWithErrors(chunk.len())
            }
        };

        let entry = self
            .report
            .outcomes
            .entry(index.to_string())
            .or_insert(SubmitOutcome::Queued);
        *entry = entry.combine(outcome);
        outcome
    }
}
