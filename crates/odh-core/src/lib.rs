//! Core domain model for the harvest-to-index pipeline.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use sha2::{Digest, Sha256};
use uuid::Uuid;

pub const CRATE_NAME: &str = "odh-core";

/// Hex-encoded SHA-256 of `bytes`.
pub fn sha256_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hex::encode(hasher.finalize())
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Distribution {
    pub access_url: String,
    #[serde(default)]
    pub format: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub byte_size: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub issued: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub modified: Option<DateTime<Utc>>,
}

/// Publisher, originator, creator or contact.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Agent {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub organization: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub homepage: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub role: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct License {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TemporalRange {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gte: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lte: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResourceKind {
    #[default]
    Dataset,
    Service,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ReferenceRelation {
    /// Dataset side of a coupling: the dataset is served by the referenced service.
    RefersTo,
    /// Service side of a coupling.
    ReferredBy,
}

/// Cross reference between a dataset and a service that operates on it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DocumentReference {
    pub identifier: String,
    pub source: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    pub relation: ReferenceRelation,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SourceDescriptor {
    pub source_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub collection_id: Option<String>,
    pub kind: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub raw_url: Option<String>,
}

/// Audit block stamped by the assembler.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HarvestMetadata {
    pub harvested: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub issued: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub modified: Option<DateTime<Utc>>,
    pub source: SourceDescriptor,
    pub is_valid: bool,
    #[serde(default)]
    pub harvesting_errors: Vec<String>,
    #[serde(default)]
    pub merged_from: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deleted_at: Option<DateTime<Utc>>,
}

impl HarvestMetadata {
    pub fn new(harvested: DateTime<Utc>, source: SourceDescriptor) -> Self {
        Self {
            harvested,
            issued: None,
            modified: None,
            source,
            is_valid: true,
            harvesting_errors: Vec::new(),
            merged_from: Vec::new(),
            deleted_at: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Extras {
    pub metadata: HarvestMetadata,
    #[serde(default)]
    pub resource_kind: ResourceKind,
    #[serde(default)]
    pub feature_type: bool,
    #[serde(default)]
    pub groups: Vec<String>,
    #[serde(default)]
    pub subsections: Vec<String>,
    #[serde(default)]
    pub references: Vec<DocumentReference>,
}

/// Normalized record shape every adapter output is assembled into.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CanonicalDocument {
    pub id: String,
    pub identifier: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default)]
    pub distributions: Vec<Distribution>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub spatial: Option<JsonValue>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub spatial_text: Option<String>,
    #[serde(default)]
    pub temporal: Vec<TemporalRange>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub license: Option<License>,
    #[serde(default)]
    pub keywords: Vec<String>,
    #[serde(default)]
    pub themes: Vec<String>,
    #[serde(default)]
    pub categories: Vec<String>,
    #[serde(default)]
    pub publisher: Vec<Agent>,
    #[serde(default)]
    pub originator: Vec<Agent>,
    #[serde(default)]
    pub creator: Vec<Agent>,
    #[serde(default)]
    pub contact_point: Vec<Agent>,
    #[serde(default)]
    pub display_contacts: Vec<Agent>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub accrual_periodicity: Option<String>,
    pub extras: Extras,
}

impl CanonicalDocument {
    /// Empty document carrying only identity and audit fields.
    pub fn skeleton(id: impl Into<String>, identifier: impl Into<String>, metadata: HarvestMetadata) -> Self {
        Self {
            id: id.into(),
            identifier: identifier.into(),
            title: None,
            description: None,
            distributions: Vec::new(),
            spatial: None,
            spatial_text: None,
            temporal: Vec::new(),
            license: None,
            keywords: Vec::new(),
            themes: Vec::new(),
            categories: Vec::new(),
            publisher: Vec::new(),
            originator: Vec::new(),
            creator: Vec::new(),
            contact_point: Vec::new(),
            display_contacts: Vec::new(),
            accrual_periodicity: None,
            extras: Extras {
                metadata,
                resource_kind: ResourceKind::Dataset,
                feature_type: false,
                groups: Vec::new(),
                subsections: Vec::new(),
                references: Vec::new(),
            },
        }
    }

    pub fn is_service(&self) -> bool {
        self.extras.resource_kind == ResourceKind::Service
    }

    /// Adds a cross reference unless an equal (identifier, source, relation) entry exists.
    pub fn add_reference(&mut self, reference: DocumentReference) -> bool {
        let exists = self.extras.references.iter().any(|r| {
            r.identifier == reference.identifier
                && r.source == reference.source
                && r.relation == reference.relation
        });
        if exists {
            return false;
        }
        self.extras.references.push(reference);
        true
    }

    /// Appends a distribution unless one with the same access URL is present.
    pub fn add_distribution(&mut self, distribution: Distribution) -> bool {
        if self
            .distributions
            .iter()
            .any(|d| d.access_url == distribution.access_url)
        {
            return false;
        }
        self.distributions.push(distribution);
        true
    }
}

/// What the aggregator needs to know about a document it merges and emits.
pub trait IndexDocument: Clone {
    fn document_id(&self) -> &str;
    fn is_retracted(&self) -> bool;
    fn merged_from(&self) -> &[String];
    /// Append-only; an id already present is not added twice.
    fn record_merged_from(&mut self, id: &str);
}

impl IndexDocument for CanonicalDocument {
    fn document_id(&self) -> &str {
        &self.id
    }

    fn is_retracted(&self) -> bool {
        self.extras.metadata.deleted_at.is_some()
    }

    fn merged_from(&self) -> &[String] {
        &self.extras.metadata.merged_from
    }

    fn record_merged_from(&mut self, id: &str) {
        let merged = &mut self.extras.metadata.merged_from;
        if !merged.iter().any(|m| m == id) {
            merged.push(id.to_string());
        }
    }
}

/// One stored row per (identifier, source).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawRecord {
    pub identifier: String,
    pub source: String,
    pub collection_id: Option<String>,
    pub document: CanonicalDocument,
    pub raw: Option<String>,
    pub operates_on: Vec<String>,
    pub created_at: DateTime<Utc>,
    pub last_modified_at: DateTime<Utc>,
}

impl RawRecord {
    pub fn key(&self) -> (&str, &str) {
        (&self.identifier, &self.source)
    }
}

/// Named collection (tenant) owning harvested records.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Catalog {
    pub identifier: String,
    pub title: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub publisher: Option<Agent>,
}

/// A stored record as it appears inside a bucket.
#[derive(Debug, Clone, PartialEq)]
pub struct BucketMember<T> {
    pub id: i64,
    pub source: String,
    pub document: T,
    pub issued: DateTime<Utc>,
    pub modified: DateTime<Utc>,
}

/// All records believed to denote one real-world entity, plus coupled services.
#[derive(Debug, Clone, PartialEq)]
pub struct Bucket<T> {
    pub anchor_id: i64,
    pub duplicates: Vec<BucketMember<T>>,
    pub operating_services: Vec<BucketMember<T>>,
}

impl<T> Bucket<T> {
    pub fn new(anchor_id: i64) -> Self {
        Self {
            anchor_id,
            duplicates: Vec::new(),
            operating_services: Vec::new(),
        }
    }

    /// Keyed by record id: a second member with the same id replaces the first in place.
    pub fn insert_duplicate(&mut self, member: BucketMember<T>) {
        upsert_member(&mut self.duplicates, member);
    }

    pub fn insert_service(&mut self, member: BucketMember<T>) {
        upsert_member(&mut self.operating_services, member);
    }

    pub fn len(&self) -> usize {
        self.duplicates.len() + self.operating_services.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

fn upsert_member<T>(members: &mut Vec<BucketMember<T>>, member: BucketMember<T>) {
    match members.iter_mut().find(|m| m.id == member.id) {
        Some(existing) => *existing = member,
        None => members.push(member),
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationKind {
    Index,
    Delete,
}

/// A single write against the search index.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "operation", rename_all = "snake_case")]
pub enum IndexOperation<D> {
    Index { index: String, id: String, document: D },
    Delete { index: String, id: String },
}

impl<D> IndexOperation<D> {
    pub fn index(index: impl Into<String>, id: impl Into<String>, document: D) -> Self {
        Self::Index {
            index: index.into(),
            id: id.into(),
            document,
        }
    }

    pub fn delete(index: impl Into<String>, id: impl Into<String>) -> Self {
        Self::Delete {
            index: index.into(),
            id: id.into(),
        }
    }

    pub fn kind(&self) -> OperationKind {
        match self {
            Self::Index { .. } => OperationKind::Index,
            Self::Delete { .. } => OperationKind::Delete,
        }
    }

    pub fn target_index(&self) -> &str {
        match self {
            Self::Index { index, .. } | Self::Delete { index, .. } => index,
        }
    }

    pub fn document_id(&self) -> &str {
        match self {
            Self::Index { id, .. } | Self::Delete { id, .. } => id,
        }
    }

    pub fn document(&self) -> Option<&D> {
        match self {
            Self::Index { document, .. } => Some(document),
            Self::Delete { .. } => None,
        }
    }

    pub fn try_map_document<E, T>(self, f: impl FnOnce(D) -> Result<T, E>) -> Result<IndexOperation<T>, E> {
        Ok(match self {
            Self::Index { index, id, document } => IndexOperation::Index {
                index,
                id,
                document: f(document)?,
            },
            Self::Delete { index, id } => IndexOperation::Delete { index, id },
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Completed,
    Failed,
    Cancelled,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunCounts {
    pub processed: usize,
    pub skipped: usize,
    pub invalid: usize,
    pub warnings: usize,
    pub errors: usize,
}

/// Outward result of one harvest job; the only failure signal a caller sees.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunSummary {
    pub run_id: Uuid,
    pub source_id: String,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub status: RunStatus,
    pub counts: RunCounts,
    pub warnings: Vec<String>,
    pub errors: Vec<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AggregationSummary {
    pub buckets: usize,
    pub indexed: usize,
    pub deleted: usize,
    /// Hard-retracted rows removed from the store after their deletes were accepted.
    #[serde(default)]
    pub removed_records: u64,
    pub bucket_errors: Vec<String>,
    pub index_errors: Vec<String>,
}
