//! Document contract every format adapter implements, plus the canonical document assembler.

use std::path::PathBuf;
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use odh_core::{Agent, Distribution, License, ResourceKind, RunCounts, TemporalRange};
use odh_storage::{FetchError, HttpFetcher};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use thiserror::Error;
use uuid::Uuid;

pub mod assembler;
pub mod hooks;
pub mod json_catalog;

pub use assembler::{Assembled, DocumentAssembler};
pub use hooks::{TransformRule, TransformRules};
pub use json_catalog::{JsonCatalogAdapter, JsonRecord, JsonRecordDocument};

pub const CRATE_NAME: &str = "odh-adapters";

/// Adapter families, resolved once when the adapter is constructed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AdapterKind {
    /// Paged JSON catalog API.
    CatalogApi,
    /// JSON catalog export read from disk.
    ManualExport,
}

impl AdapterKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::CatalogApi => "catalog_api",
            Self::ManualExport => "manual_export",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Severity {
    Warning,
    Error,
}

/// Failure of a single contract operation.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum FieldError {
    /// Unparseable literal; the field is treated as absent.
    #[error("{field}: malformed value {value:?}")]
    Malformed { field: &'static str, value: String },
    #[error("{field}: mandatory field missing")]
    MissingMandatory { field: &'static str },
    #[error("{field}: {message}")]
    Adapter { field: &'static str, message: String },
}

impl FieldError {
    pub fn severity(&self) -> Severity {
        match self {
            Self::Malformed { .. } => Severity::Warning,
            Self::MissingMandatory { .. } | Self::Adapter { .. } => Severity::Error,
        }
    }
}

pub type FieldResult<T> = Result<T, FieldError>;

#[derive(Debug, Error)]
pub enum AdapterError {
    #[error("{0}")]
    Message(String),
    #[error(transparent)]
    Fetch(#[from] FetchError),
    #[error("parsing catalog payload: {0}")]
    Parse(#[from] serde_json::Error),
    #[error(transparent)]
    Anyhow(#[from] anyhow::Error),
}

#[derive(Debug, Default)]
struct RunStatsInner {
    counts: RunCounts,
    warnings: Vec<String>,
    errors: Vec<String>,
}

/// Run-scoped statistics sink shared by the adapter, the assembler and the job.
#[derive(Debug, Default)]
pub struct RunStats {
    inner: Mutex<RunStatsInner>,
}

impl RunStats {
    fn lock(&self) -> MutexGuard<'_, RunStatsInner> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn warn(&self, message: impl Into<String>) {
        let mut inner = self.lock();
        inner.counts.warnings += 1;
        inner.warnings.push(message.into());
    }

    pub fn error(&self, message: impl Into<String>) {
        let mut inner = self.lock();
        inner.counts.errors += 1;
        inner.errors.push(message.into());
    }

    pub fn processed(&self) {
        self.lock().counts.processed += 1;
    }

    pub fn skipped(&self) {
        self.lock().counts.skipped += 1;
    }

    pub fn invalid(&self) {
        self.lock().counts.invalid += 1;
    }

    pub fn counts(&self) -> RunCounts {
        self.lock().counts
    }

    pub fn snapshot(&self) -> (RunCounts, Vec<String>, Vec<String>) {
        let inner = self.lock();
        (inner.counts, inner.warnings.clone(), inner.errors.clone())
    }
}

/// Shared per-run context handed to adapters and the assembler.
#[derive(Debug, Clone)]
pub struct HarvestContext {
    pub run_id: Uuid,
    pub source_id: String,
    pub collection_id: Option<String>,
    pub kind: AdapterKind,
    pub harvested_at: DateTime<Utc>,
    pub stats: Arc<RunStats>,
}

impl HarvestContext {
    pub fn new(source_id: impl Into<String>, kind: AdapterKind, harvested_at: DateTime<Utc>) -> Self {
        Self {
            run_id: Uuid::new_v4(),
            source_id: source_id.into(),
            collection_id: None,
            kind,
            harvested_at,
            stats: Arc::new(RunStats::default()),
        }
    }

    pub fn with_collection(mut self, collection_id: Option<String>) -> Self {
        self.collection_id = collection_id;
        self
    }
}

/// Operations a format adapter provides for one harvested record.
///
/// Operations are pure apart from `distributions`, which may touch the network.
/// Values the assembler computes once (keywords, contacts) are passed back in
/// rather than memoized inside the adapter.
#[async_trait]
pub trait MetadataDocument: Send + Sync {
    fn generated_id(&self) -> FieldResult<String>;

    fn title(&self) -> FieldResult<Option<String>>;

    fn description(&self) -> FieldResult<Option<String>> {
        Ok(None)
    }

    async fn distributions(&self, _ctx: &HarvestContext) -> FieldResult<Vec<Distribution>> {
        Ok(Vec::new())
    }

    fn publisher(&self) -> FieldResult<Vec<Agent>> {
        Ok(Vec::new())
    }

    fn contact_point(&self) -> FieldResult<Vec<Agent>> {
        Ok(Vec::new())
    }

    fn display_contacts(&self, contact_point: &[Agent], publisher: &[Agent]) -> FieldResult<Vec<Agent>> {
        if contact_point.is_empty() {
            Ok(publisher.to_vec())
        } else {
            Ok(contact_point.to_vec())
        }
    }

    fn creator(&self) -> FieldResult<Vec<Agent>> {
        Ok(Vec::new())
    }

    fn originator(&self) -> FieldResult<Vec<Agent>> {
        Ok(Vec::new())
    }

    fn spatial(&self) -> FieldResult<Option<JsonValue>> {
        Ok(None)
    }

    fn spatial_text(&self) -> FieldResult<Option<String>> {
        Ok(None)
    }

    fn temporal(&self) -> FieldResult<Vec<TemporalRange>> {
        Ok(Vec::new())
    }

    fn keywords(&self) -> FieldResult<Vec<String>> {
        Ok(Vec::new())
    }

    fn themes(&self, _keywords: &[String]) -> FieldResult<Vec<String>> {
        Ok(Vec::new())
    }

    fn categories(&self, _keywords: &[String]) -> FieldResult<Vec<String>> {
        Ok(Vec::new())
    }

    fn accrual_periodicity(&self) -> FieldResult<Option<String>> {
        Ok(None)
    }

    fn license(&self) -> FieldResult<Option<License>> {
        Ok(None)
    }

    fn groups(&self) -> FieldResult<Vec<String>> {
        Ok(Vec::new())
    }

    fn sub_sections(&self) -> FieldResult<Vec<String>> {
        Ok(Vec::new())
    }

    fn metadata_source(&self) -> FieldResult<Option<String>> {
        Ok(None)
    }

    fn issued(&self) -> FieldResult<Option<DateTime<Utc>>> {
        Ok(None)
    }

    fn modified(&self) -> FieldResult<Option<DateTime<Utc>>> {
        Ok(None)
    }

    fn harvested_raw_payload(&self) -> Option<String> {
        None
    }

    fn resource_kind(&self) -> ResourceKind {
        ResourceKind::Dataset
    }

    /// Identifiers of the datasets a service record exposes.
    fn operates_on(&self) -> Vec<String> {
        Vec::new()
    }

    fn is_feature_type(&self) -> bool {
        false
    }

    /// `false` keeps the record stored but marks it not displayable.
    fn is_valid(&self) -> bool {
        true
    }

    /// `true` drops the record from this run's output entirely.
    fn should_be_skipped(&self, _keywords: &[String]) -> bool {
        false
    }
}

/// Where and how to read one source.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AdapterSpec {
    pub source_id: String,
    pub kind: AdapterKind,
    pub url: Option<String>,
    pub path: Option<PathBuf>,
    pub page_size: usize,
}

#[async_trait]
pub trait SourceAdapter: Send + Sync {
    fn source_id(&self) -> &str;
    fn kind(&self) -> AdapterKind;

    async fn fetch_documents(
        &self,
        http: &HttpFetcher,
        ctx: &HarvestContext,
    ) -> Result<Vec<Box<dyn MetadataDocument>>, AdapterError>;
}

pub fn adapter_for_source(spec: &AdapterSpec) -> Result<Box<dyn SourceAdapter>, AdapterError> {
    match spec.kind {
        AdapterKind::CatalogApi => {
            let url = spec.url.clone().ok_or_else(|| {
                AdapterError::Message(format!("source {} (catalog_api) needs a url", spec.source_id))
            })?;
            Ok(Box::new(JsonCatalogAdapter::remote(&spec.source_id, url, spec.page_size)))
        }
        AdapterKind::ManualExport => {
            let path = spec.path.clone().ok_or_else(|| {
                AdapterError::Message(format!("source {} (manual_export) needs a path", spec.source_id))
            })?;
            Ok(Box::new(JsonCatalogAdapter::file(&spec.source_id, path)))
        }
    }
}
