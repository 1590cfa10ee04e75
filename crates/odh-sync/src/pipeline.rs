use std::collections::HashSet;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use chrono::{DateTime, Utc};
use futures::stream::{self, StreamExt};
use odh_adapters::{adapter_for_source, Assembled, DocumentAssembler, HarvestContext, TransformRules};
use odh_core::{
    AggregationSummary, Bucket, CanonicalDocument, IndexDocument, IndexOperation, OperationKind, RunStatus,
    RunSummary,
};
use odh_index::{BulkIndexWriter, ElasticBackend, InMemoryBackend, IndexBackend};
use odh_storage::{
    HttpClientConfig, HttpFetcher, ReachabilityChecker, RecordStore, RetractionDecision, RetractionMode,
};
use tracing::{error, info, info_span, warn, Instrument};
use uuid::Uuid;

use crate::aggregate::{aggregate_bucket, aggregator_for_profile, Aggregator};
use crate::cancel::CancellationToken;
use crate::config::{HarvestConfig, SourceConfig, SourceRegistry};
use crate::report::{write_aggregation_report, write_run_report};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum JobEnd {
    Completed,
    Cancelled,
}

/// Result of `run_all`: one summary per harvested source, then the aggregation pass.
#[derive(Debug, Clone)]
pub struct HarvestReport {
    pub runs: Vec<RunSummary>,
    pub aggregation: Option<AggregationSummary>,
}

pub fn build_index_backend(config: &HarvestConfig) -> Result<IndexBackend> {
    if config.dry_run_index {
        return Ok(IndexBackend::InMemory(Arc::new(InMemoryBackend::new())));
    }
    let backend = ElasticBackend::new(&config.index_url, config.index_flavor, config.http_timeout)
        .with_context(|| format!("building index client for {}", config.index_url))?;
    Ok(IndexBackend::Elastic(backend))
}

/// Owns the process-wide store, HTTP client and index backend. Each harvest job gets its
/// own write scope; each aggregation pass gets its own bulk writer.
pub struct SyncPipeline {
    config: HarvestConfig,
    store: RecordStore,
    http: Arc<HttpFetcher>,
    index: Arc<IndexBackend>,
    aggregator: Box<dyn Aggregator<CanonicalDocument>>,
}

impl SyncPipeline {
    pub async fn connect(config: HarvestConfig) -> Result<Self> {
        let store = RecordStore::connect(&config.database_url, config.db_max_connections)
            .await
            .context("connecting to the record store")?;
        let index = Arc::new(build_index_backend(&config)?);
        Self::with_parts(config, store, index)
    }

    pub fn with_parts(config: HarvestConfig, store: RecordStore, index: Arc<IndexBackend>) -> Result<Self> {
        let http = HttpFetcher::new(HttpClientConfig {
            timeout: config.http_timeout,
            user_agent: config.user_agent.clone(),
            ..Default::default()
        })?;
        let aggregator = aggregator_for_profile(config.profile);
        Ok(Self {
            config,
            store,
            http: Arc::new(http),
            index,
            aggregator,
        })
    }

    pub fn config(&self) -> &HarvestConfig {
        &self.config
    }

    pub fn store(&self) -> &RecordStore {
        &self.store
    }

    pub fn index_backend(&self) -> &Arc<IndexBackend> {
        &self.index
    }

    pub async fn migrate(&self) -> Result<()> {
        self.store.migrate().await.context("applying migrations")
    }

    pub async fn close(&self) {
        self.store.close().await;
    }

    pub async fn load_registry(&self) -> Result<SourceRegistry> {
        SourceRegistry::load(&self.config.registry_path()).await
    }

    fn rules_for(&self, source: &SourceConfig) -> Result<Arc<TransformRules>> {
        let root = &self.config.workspace_root;
        let rules = match &source.rules {
            Some(path) => TransformRules::from_path(&root.join(path))?,
            None => {
                let default = root.join("rules").join("default.yaml");
                if default.exists() {
                    TransformRules::from_path(&default)?
                } else {
                    TransformRules::empty()
                }
            }
        };
        Ok(Arc::new(rules))
    }

    /// Runs one harvest job. Failures are reported through the summary's status and errors.
    pub async fn run_source(
        &self,
        source: &SourceConfig,
        run_started_at: DateTime<Utc>,
        cancel: &CancellationToken,
    ) -> RunSummary {
        let ctx = HarvestContext::new(source.source_id.clone(), source.kind, run_started_at)
            .with_collection(source.catalog.as_ref().map(|c| c.identifier.clone()));
        let span = info_span!("harvest_source", run_id = %ctx.run_id, source_id = %source.source_id);

        let status = match self
            .harvest(source, &ctx, run_started_at, cancel)
            .instrument(span)
            .await
        {
            Ok(JobEnd::Completed) => RunStatus::Completed,
            Ok(JobEnd::Cancelled) => RunStatus::Cancelled,
            Err(err) => {
                error!(source_id = %source.source_id, error = %format!("{err:#}"), "harvest failed; record writes rolled back");
                ctx.stats.error(format!("{err:#}"));
                RunStatus::Failed
            }
        };

        let (counts, warnings, errors) = ctx.stats.snapshot();
        RunSummary {
            run_id: ctx.run_id,
            source_id: source.source_id.clone(),
            started_at: run_started_at,
            finished_at: Utc::now(),
            status,
            counts,
            warnings,
            errors,
        }
    }

    async fn harvest(
        &self,
        source: &SourceConfig,
        ctx: &HarvestContext,
        run_started_at: DateTime<Utc>,
        cancel: &CancellationToken,
    ) -> Result<JobEnd> {
        if let Some(catalog) = &source.catalog {
            self.store
                .upsert_catalog(catalog)
                .await
                .with_context(|| format!("storing catalog {}", catalog.identifier))?;
        }

        let mut assembler = DocumentAssembler::new(self.rules_for(source)?);
        if self.config.reachability_checks {
            assembler = assembler.with_reachability(Arc::new(ReachabilityChecker::new(
                self.http.clone(),
                self.config.reachability_timeout,
            )));
        }

        let adapter = adapter_for_source(&source.adapter_spec(&self.config.workspace_root))?;
        let documents = adapter
            .fetch_documents(&self.http, ctx)
            .await
            .with_context(|| format!("fetching records of {}", source.source_id))?;
        info!(documents = documents.len(), "source fetched");
        if cancel.is_cancelled() {
            return Ok(JobEnd::Cancelled);
        }

        let previous = self
            .store
            .load_documents(&source.source_id)
            .await
            .context("loading previously stored documents")?;
        let mut scope = self
            .store
            .begin_source_run(&source.source_id, self.config.store_batch_size)
            .await
            .context("opening write scope")?;

        let assembler = &assembler;
        let previous = &previous;
        let mut assembled = stream::iter(documents.iter())
            .map(move |doc| {
                let prior = doc.generated_id().ok().and_then(|id| previous.get(&id));
                assembler.assemble(&**doc, ctx, prior)
            })
            .buffered(source.max_concurrency.max(1));

        while let Some(item) = assembled.next().await {
            if cancel.is_cancelled() {
                drop(assembled);
                scope.rollback().await.context("rolling back cancelled run")?;
                warn!("harvest cancelled; write scope rolled back");
                return Ok(JobEnd::Cancelled);
            }
            if let Assembled::Record(record) = item {
                scope.push(*record).await.context("writing record batch")?;
            }
        }
        drop(assembled);

        let written = scope.commit().await.context("committing source run")?;
        info!(written, "source run committed");

        let outcome = self
            .store
            .retract_stale(&source.source_id, run_started_at, &self.config.retraction)
            .await
            .context("retracting stale records")?;
        match outcome.decision {
            RetractionDecision::NothingStale => {}
            RetractionDecision::Proceed { known, stale } => {
                info!(known, stale, affected = outcome.affected, "retracted stale records");
            }
            RetractionDecision::Refused {
                known,
                stale,
                fraction,
            } => {
                warn!(known, stale, fraction, "too many records missing; retraction skipped");
                ctx.stats.warn(format!(
                    "retraction skipped: {stale} of {known} stored records missing ({:.0}%)",
                    fraction * 100.0
                ));
            }
        }

        Ok(JobEnd::Completed)
    }

    /// Harvests the given sources (every enabled source when `only` is empty) concurrently
    /// and writes one report per run.
    pub async fn harvest_sources(
        &self,
        only: &[String],
        run_started_at: DateTime<Utc>,
        cancel: &CancellationToken,
    ) -> Result<Vec<RunSummary>> {
        let registry = self.load_registry().await?;
        let selected: Vec<&SourceConfig> = if only.is_empty() {
            registry.enabled().collect()
        } else {
            let mut selected = Vec::with_capacity(only.len());
            for id in only {
                match registry.get(id) {
                    Some(source) => selected.push(source),
                    None => bail!("unknown source {id:?}"),
                }
            }
            selected
        };

        let runs = futures::future::join_all(
            selected
                .into_iter()
                .map(|source| self.run_source(source, run_started_at, cancel)),
        )
        .await;

        for run in &runs {
            if let Err(err) = write_run_report(&self.config.reports_dir(), run).await {
                warn!(run_id = %run.run_id, error = %format!("{err:#}"), "could not write run report");
            }
        }
        Ok(runs)
    }

    /// Rebuilds the index entries of every bucket touching `source` (all buckets for `None`).
    pub async fn aggregate(&self, source: Option<&str>) -> Result<AggregationSummary> {
        match source {
            Some(source) => self.aggregate_sources(&[source.to_string()]).await,
            None => self.aggregate_sources(&[]).await,
        }
    }

    /// One aggregation pass over every bucket touching any of `sources`; an empty slice
    /// selects every bucket. Buckets shared by several sources are built once.
    pub async fn aggregate_sources(&self, sources: &[String]) -> Result<AggregationSummary> {
        let mut scope: Vec<String> = sources.to_vec();
        scope.sort();
        scope.dedup();
        let label = if scope.is_empty() { "*".to_string() } else { scope.join(",") };

        let span = info_span!("aggregate", sources = %label, profile = self.aggregator.name());
        let scope = (!scope.is_empty()).then_some(scope);
        let summary = self.aggregate_inner(scope.as_deref()).instrument(span).await?;

        let reported = scope.as_ref().map(|_| label.as_str());
        if let Err(err) =
            write_aggregation_report(&self.config.reports_dir(), Uuid::new_v4(), Utc::now(), reported, &summary)
                .await
        {
            warn!(error = %format!("{err:#}"), "could not write aggregation report");
        }
        Ok(summary)
    }

    /// Writes the merged `mergedFrom` back to the primary's row so later passes start from it.
    async fn persist_provenance(
        &self,
        bucket: &Bucket<CanonicalDocument>,
        operations: &[IndexOperation<CanonicalDocument>],
    ) {
        let Some(merged) = operations.iter().find_map(IndexOperation::document) else {
            return;
        };
        let Some(primary) = bucket
            .duplicates
            .iter()
            .find(|m| m.document.document_id() == merged.document_id())
        else {
            return;
        };
        if primary.document.merged_from() == merged.merged_from() {
            return;
        }
        if let Err(err) = self.store.store_merged_from(primary.id, merged.merged_from()).await {
            warn!(record_id = primary.id, error = %err, "could not store mergedFrom");
        }
    }

    async fn aggregate_inner(&self, sources: Option<&[String]>) -> Result<AggregationSummary> {
        let buckets = self
            .store
            .fetch_buckets_in(sources)
            .await
            .context("loading buckets")?;
        let mut writer = BulkIndexWriter::new(self.index.clone(), self.config.index_chunk_size);
        let mut summary = AggregationSummary {
            buckets: buckets.len(),
            ..AggregationSummary::default()
        };
        let hard = self.config.retraction.mode == RetractionMode::Hard;
        // (record id, document id) of retracted rows whose deletes were submitted.
        let mut removable: Vec<(i64, String)> = Vec::new();

        for bucket in &buckets {
            let operations = match aggregate_bucket(self.aggregator.as_ref(), bucket, &self.config.index_name) {
                Ok(operations) => operations,
                Err(err) => {
                    warn!(anchor_id = bucket.anchor_id, error = %err, "bucket skipped");
                    summary.bucket_errors.push(err.to_string());
                    continue;
                }
            };
            self.persist_provenance(bucket, &operations).await;

            let mut rejected = false;
            for operation in operations {
                let kind = operation.kind();
                let id = operation.document_id().to_string();
                match writer.submit_document(operation).await {
                    Ok(_) => match kind {
                        OperationKind::Index => summary.indexed += 1,
                        OperationKind::Delete => summary.deleted += 1,
                    },
                    Err(err) => {
                        rejected = true;
                        summary.index_errors.push(format!("{id}: {err}"));
                    }
                }
            }
            if hard && !rejected {
                removable.extend(
                    bucket
                        .duplicates
                        .iter()
                        .chain(bucket.operating_services.iter())
                        .filter(|m| m.document.is_retracted())
                        .map(|m| (m.id, m.document.document_id().to_string())),
                );
            }
        }

        let report = writer.finalize().await;
        for failure in &report.errors {
            match failure.kind {
                OperationKind::Index => summary.indexed = summary.indexed.saturating_sub(1),
                OperationKind::Delete => summary.deleted = summary.deleted.saturating_sub(1),
            }
            summary
                .index_errors
                .push(format!("{}/{}: {}", failure.index, failure.id, failure.reason));
        }

        if !removable.is_empty() {
            let failed: HashSet<&str> = report.errors.iter().map(|f| f.id.as_str()).collect();
            let mut record_ids: Vec<i64> = removable
                .iter()
                .filter(|(_, document_id)| !failed.contains(document_id.as_str()))
                .map(|(record_id, _)| *record_id)
                .collect();
            record_ids.sort_unstable();
            record_ids.dedup();
            summary.removed_records = self
                .store
                .remove_retracted(&record_ids)
                .await
                .context("removing hard-retracted records")?;
        }

        info!(
            buckets = summary.buckets,
            indexed = summary.indexed,
            deleted = summary.deleted,
            removed_records = summary.removed_records,
            bucket_errors = summary.bucket_errors.len(),
            index_errors = summary.index_errors.len(),
            backend = %self.index.describe(),
            "aggregation finished"
        );
        Ok(summary)
    }

    /// Harvests every enabled source, then runs one aggregation pass unless cancelled.
    pub async fn run_all(&self, run_started_at: DateTime<Utc>, cancel: &CancellationToken) -> Result<HarvestReport> {
        let runs = self.harvest_sources(&[], run_started_at, cancel).await?;
        let aggregation = if cancel.is_cancelled() {
            None
        } else {
            Some(self.aggregate(None).await?)
        };
        Ok(HarvestReport { runs, aggregation })
    }

    /// Hard-deletes records soft-retracted more than `older_than_days` ago and drops index
    /// entries no live record still carries.
    pub async fn purge(&self, older_than_days: u32) -> Result<u64> {
        let cutoff = Utc::now() - chrono::Duration::days(i64::from(older_than_days));
        let outcome = self
            .store
            .purge_retracted(cutoff)
            .await
            .context("purging retracted records")?;

        let mut writer = BulkIndexWriter::new(self.index.clone(), self.config.index_chunk_size);
        for id in &outcome.index_ids {
            writer
                .submit(IndexOperation::delete(self.config.index_name.as_str(), id.as_str()))
                .await;
        }
        let report = writer.finalize().await;
        for failure in &report.errors {
            warn!(id = %failure.id, reason = %failure.reason, "index delete for purged record failed");
        }
        info!(purged = outcome.purged, index_deletes = outcome.index_ids.len(), %cutoff, "purged retracted records");
        Ok(outcome.purged)
    }
}
