//! Canonical Document Assembler: drives every contract operation and builds the stored record.

use std::sync::Arc;

use odh_core::{sha256_hex, CanonicalDocument, Distribution, HarvestMetadata, RawRecord, SourceDescriptor};
use odh_storage::ReachabilityChecker;
use tracing::{debug, warn};

use crate::hooks::TransformRules;
use crate::{FieldError, FieldResult, HarvestContext, MetadataDocument, Severity};

#[derive(Debug, Clone, PartialEq)]
pub enum Assembled {
    Skipped,
    Record(Box<RawRecord>),
}

/// Per-record field error log. Warnings leave the record valid, errors do not.
#[derive(Debug, Default)]
struct FieldLog {
    messages: Vec<String>,
    has_errors: bool,
}

impl FieldLog {
    fn take<T: Default>(&mut self, ctx: &HarvestContext, record: &str, result: FieldResult<T>) -> T {
        match result {
            Ok(value) => value,
            Err(err) => {
                self.note(ctx, record, &err);
                T::default()
            }
        }
    }

    fn note(&mut self, ctx: &HarvestContext, record: &str, err: &FieldError) {
        let message = err.to_string();
        match err.severity() {
            Severity::Warning => ctx.stats.warn(format!("{record}: {message}")),
            Severity::Error => {
                self.has_errors = true;
                ctx.stats.error(format!("{record}: {message}"));
            }
        }
        self.messages.push(message);
    }
}

#[derive(Debug, Clone)]
pub struct DocumentAssembler {
    reachability: Option<Arc<ReachabilityChecker>>,
    rules: Arc<TransformRules>,
}

impl DocumentAssembler {
    pub fn new(rules: Arc<TransformRules>) -> Self {
        Self {
            reachability: None,
            rules,
        }
    }

    pub fn with_reachability(mut self, checker: Arc<ReachabilityChecker>) -> Self {
        self.reachability = Some(checker);
        self
    }

    /// Builds the stored record for `doc`. `previous` is the document stored for the same
    /// identifier by an earlier run; its `issued` and `mergedFrom` survive re-harvesting.
    pub async fn assemble(
        &self,
        doc: &dyn MetadataDocument,
        ctx: &HarvestContext,
        previous: Option<&CanonicalDocument>,
    ) -> Assembled {
        let mut log = FieldLog::default();
        let raw = doc.harvested_raw_payload();

        let generated = doc.generated_id();
        let title = doc.title();
        let id = match generated {
            Ok(id) if !id.trim().is_empty() => id,
            other => {
                if let Err(err) = other {
                    log.note(ctx, "<unidentified>", &err);
                }
                fallback_id(&ctx.source_id, raw.as_deref(), title.as_ref().ok().and_then(|t| t.as_deref()))
            }
        };
        let title = log.take(ctx, &id, title);

        let keywords = log.take(ctx, &id, doc.keywords());
        if doc.should_be_skipped(&keywords) {
            debug!(source_id = %ctx.source_id, record = %id, "record skipped by adapter");
            ctx.stats.skipped();
            return Assembled::Skipped;
        }

        let mut metadata = HarvestMetadata::new(
            ctx.harvested_at,
            SourceDescriptor {
                source_id: ctx.source_id.clone(),
                collection_id: ctx.collection_id.clone(),
                kind: ctx.kind.as_str().to_string(),
                raw_url: log.take(ctx, &id, doc.metadata_source()),
            },
        );
        metadata.issued = log.take(ctx, &id, doc.issued());
        metadata.modified = log.take(ctx, &id, doc.modified());
        if let Some(previous) = previous {
            metadata.issued = previous.extras.metadata.issued.or(metadata.issued);
            metadata.merged_from = previous.extras.metadata.merged_from.clone();
        }

        let mut document = CanonicalDocument::skeleton(id.clone(), id.clone(), metadata);
        document.title = title;
        document.description = log.take(ctx, &id, doc.description());
        document.themes = log.take(ctx, &id, doc.themes(&keywords));
        document.categories = log.take(ctx, &id, doc.categories(&keywords));
        document.keywords = keywords;

        let publisher = log.take(ctx, &id, doc.publisher());
        let contact_point = log.take(ctx, &id, doc.contact_point());
        document.display_contacts = log.take(ctx, &id, doc.display_contacts(&contact_point, &publisher));
        document.publisher = publisher;
        document.contact_point = contact_point;
        document.creator = log.take(ctx, &id, doc.creator());
        document.originator = log.take(ctx, &id, doc.originator());

        document.spatial = log.take(ctx, &id, doc.spatial());
        document.spatial_text = log.take(ctx, &id, doc.spatial_text());
        document.temporal = log.take(ctx, &id, doc.temporal());
        document.accrual_periodicity = log.take(ctx, &id, doc.accrual_periodicity());
        document.license = log.take(ctx, &id, doc.license());

        document.extras.groups = log.take(ctx, &id, doc.groups());
        document.extras.subsections = log.take(ctx, &id, doc.sub_sections());
        document.extras.resource_kind = doc.resource_kind();
        document.extras.feature_type = doc.is_feature_type();

        let distributions = log.take(ctx, &id, doc.distributions(ctx).await);
        for distribution in self.reachable(ctx, &id, distributions, &mut log).await {
            document.add_distribution(distribution);
        }
        if document.distributions.is_empty() {
            log.note(ctx, &id, &FieldError::Adapter {
                field: "distributions",
                message: "no usable distribution".into(),
            });
        }

        self.rules.apply(&mut document);
        if self.rules.should_skip(&document.keywords) {
            debug!(source_id = %ctx.source_id, record = %id, "record skipped by transform rules");
            ctx.stats.skipped();
            return Assembled::Skipped;
        }

        let valid = doc.is_valid() && !log.has_errors;
        document.extras.metadata.is_valid = valid;
        document.extras.metadata.harvesting_errors = log.messages;
        ctx.stats.processed();
        if !valid {
            ctx.stats.invalid();
        }

        Assembled::Record(Box::new(RawRecord {
            identifier: id,
            source: ctx.source_id.clone(),
            collection_id: ctx.collection_id.clone(),
            document,
            raw,
            operates_on: doc.operates_on(),
            created_at: ctx.harvested_at,
            last_modified_at: ctx.harvested_at,
        }))
    }

    async fn reachable(
        &self,
        ctx: &HarvestContext,
        record: &str,
        distributions: Vec<Distribution>,
        log: &mut FieldLog,
    ) -> Vec<Distribution> {
        let Some(checker) = &self.reachability else {
            return distributions;
        };

        let mut kept = Vec::with_capacity(distributions.len());
        for distribution in distributions {
            if checker.is_reachable(&ctx.source_id, &distribution.access_url).await {
                kept.push(distribution);
            } else {
                warn!(source_id = %ctx.source_id, record, url = %distribution.access_url, "dropping unreachable distribution");
                log.note(ctx, record, &FieldError::Malformed {
                    field: "distributions",
                    value: format!("unreachable {}", distribution.access_url),
                });
            }
        }
        kept
    }
}

fn fallback_id(source_id: &str, raw: Option<&str>, title: Option<&str>) -> String {
    let seed = match raw {
        Some(raw) if !raw.is_empty() => raw.to_string(),
        _ => format!("{source_id}\n{}", title.unwrap_or_default()),
    };
    sha256_hex(seed.as_bytes())
}
