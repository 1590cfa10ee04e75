//! Relational persistence of harvested records: batched upsert, write scopes and retraction.

use std::collections::HashMap;
use std::time::Duration;

use chrono::{DateTime, Utc};
use odh_core::{CanonicalDocument, Catalog, RawRecord};
use serde::{Deserialize, Serialize};
use sqlx::postgres::{PgPool, PgPoolOptions};
use sqlx::types::Json;
use sqlx::{Postgres, QueryBuilder, Row, Transaction};
use thiserror::Error;
use tracing::{debug, info, warn};

pub const DEFAULT_BATCH_SIZE: usize = 50;

const UPSERT_CONFLICT_CLAUSE: &str = r#"
 ON CONFLICT (identifier, source) DO UPDATE SET
    collection_id = EXCLUDED.collection_id,
    dataset = EXCLUDED.dataset,
    operates_on = EXCLUDED.operates_on,
    raw = COALESCE(NULLIF(EXCLUDED.raw, ''), record.raw),
    last_modified = EXCLUDED.last_modified
"#;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("migration failed: {0}")]
    Migrate(#[from] sqlx::migrate::MigrateError),
    #[error("record {identifier} belongs to source {found}, write scope is for {expected}")]
    SourceMismatch {
        identifier: String,
        expected: String,
        found: String,
    },
}

/// Client-side buffer for pending upserts.
///
/// Records with the same `(identifier, source)` collapse into one entry (last write wins),
/// so a single `INSERT .. ON CONFLICT` statement never touches a row twice.
#[derive(Debug)]
pub struct UpsertBuffer {
    batch_size: usize,
    pending: Vec<RawRecord>,
}

impl UpsertBuffer {
    pub fn new(batch_size: usize) -> Self {
        let batch_size = batch_size.max(1);
        Self {
            batch_size,
            pending: Vec::with_capacity(batch_size),
        }
    }

    /// Buffers `record`; returns a full batch once the threshold is reached.
    pub fn push(&mut self, record: RawRecord) -> Option<Vec<RawRecord>> {
        match self.pending.iter_mut().find(|r| r.key() == record.key()) {
            Some(existing) => *existing = record,
            None => self.pending.push(record),
        }
        if self.pending.len() >= self.batch_size {
            Some(self.drain())
        } else {
            None
        }
    }

    pub fn drain(&mut self) -> Vec<RawRecord> {
        std::mem::replace(&mut self.pending, Vec::with_capacity(self.batch_size))
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RetractionMode {
    /// Mark `extras.metadata.deletedAt`; the aggregator then emits index deletes.
    Soft,
    /// Marked like `Soft`; the next aggregation pass removes the rows once the index
    /// has accepted their deletes.
    Hard,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RetractionPolicy {
    /// Retraction only runs when `stale / known` is strictly below this fraction.
    pub max_missing_fraction: f64,
    pub mode: RetractionMode,
}

impl Default for RetractionPolicy {
    fn default() -> Self {
        Self {
            max_missing_fraction: 0.2,
            mode: RetractionMode::Soft,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
#[serde(tag = "decision", rename_all = "snake_case")]
pub enum RetractionDecision {
    NothingStale,
    Proceed { known: u64, stale: u64 },
    Refused { known: u64, stale: u64, fraction: f64 },
}

pub fn retraction_decision(known: u64, stale: u64, policy: &RetractionPolicy) -> RetractionDecision {
    if stale == 0 || known == 0 {
        return RetractionDecision::NothingStale;
    }
    let fraction = stale as f64 / known as f64;
    if fraction < policy.max_missing_fraction {
        RetractionDecision::Proceed { known, stale }
    } else {
        RetractionDecision::Refused {
            known,
            stale,
            fraction,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct PurgeOutcome {
    pub purged: u64,
    pub index_ids: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct RetractionOutcome {
    pub decision: RetractionDecision,
    pub affected: u64,
}

/// Process-wide handle on the relational store.
#[derive(Debug, Clone)]
pub struct RecordStore {
    pool: PgPool,
}

impl RecordStore {
    pub async fn connect(database_url: &str, max_connections: u32) -> Result<Self, StoreError> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections.max(1))
            .acquire_timeout(Duration::from_secs(10))
            .connect(database_url)
            .await?;
        Ok(Self { pool })
    }

    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    pub async fn migrate(&self) -> Result<(), StoreError> {
        sqlx::migrate!("../../migrations").run(&self.pool).await?;
        Ok(())
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }

    pub async fn upsert_catalog(&self, catalog: &Catalog) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO collection (identifier, title, description, publisher)
            VALUES ($1, $2, $3, $4)
            ON CONFLICT (identifier) DO UPDATE SET
                title = EXCLUDED.title,
                description = EXCLUDED.description,
                publisher = EXCLUDED.publisher,
                last_modified = NOW()
            "#,
        )
        .bind(&catalog.identifier)
        .bind(&catalog.title)
        .bind(&catalog.description)
        .bind(catalog.publisher.clone().map(Json))
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Opens the write phase of one source run. Nothing is visible to other
    /// connections until [`SourceWriteScope::commit`].
    pub async fn begin_source_run(
        &self,
        source: &str,
        batch_size: usize,
    ) -> Result<SourceWriteScope, StoreError> {
        let tx = self.pool.begin().await?;
        Ok(SourceWriteScope {
            tx,
            buffer: UpsertBuffer::new(batch_size),
            source: source.to_string(),
            written: 0,
        })
    }

    /// Previously stored documents of `source`, keyed by identifier.
    pub async fn load_documents(
        &self,
        source: &str,
    ) -> Result<HashMap<String, CanonicalDocument>, StoreError> {
        let rows = sqlx::query("SELECT identifier, dataset FROM record WHERE source = $1")
            .bind(source)
            .fetch_all(&self.pool)
            .await?;

        let mut out = HashMap::with_capacity(rows.len());
        for row in rows {
            let identifier: String = row.try_get("identifier")?;
            let Json(value): Json<serde_json::Value> = row.try_get("dataset")?;
            match serde_json::from_value::<CanonicalDocument>(value) {
                Ok(document) => {
                    out.insert(identifier, document);
                }
                Err(err) => {
                    warn!(source, %identifier, error = %err, "stored document no longer decodes")
                }
            }
        }
        Ok(out)
    }

    /// Retracts records of `source` not touched by the run that started at `run_started_at`.
    /// Must only be called after that run's write scope committed.
    pub async fn retract_stale(
        &self,
        source: &str,
        run_started_at: DateTime<Utc>,
        policy: &RetractionPolicy,
    ) -> Result<RetractionOutcome, StoreError> {
        let row = sqlx::query(
            r#"
            SELECT COUNT(*) AS known,
                   COUNT(*) FILTER (WHERE last_modified < $2) AS stale
              FROM record
             WHERE source = $1
               AND dataset #>> '{extras,metadata,deletedAt}' IS NULL
            "#,
        )
        .bind(source)
        .bind(run_started_at)
        .fetch_one(&self.pool)
        .await?;
        let known: i64 = row.try_get("known")?;
        let stale: i64 = row.try_get("stale")?;

        let decision = retraction_decision(known.max(0) as u64, stale.max(0) as u64, policy);
        let RetractionDecision::Proceed { .. } = decision else {
            if let RetractionDecision::Refused { fraction, .. } = decision {
                warn!(
                    source,
                    known,
                    stale,
                    fraction,
                    threshold = policy.max_missing_fraction,
                    "retraction refused: too many records missing from this run"
                );
            }
            return Ok(RetractionOutcome {
                decision,
                affected: 0,
            });
        };

        let affected = sqlx::query(
            r#"
            UPDATE record
               SET dataset = jsonb_set(dataset, '{extras,metadata,deletedAt}', $3)
             WHERE source = $1
               AND last_modified < $2
               AND dataset #>> '{extras,metadata,deletedAt}' IS NULL
            "#,
        )
        .bind(source)
        .bind(run_started_at)
        .bind(Json(run_started_at))
        .execute(&self.pool)
        .await?
        .rows_affected();

        info!(source, affected, mode = ?policy.mode, "retracted stale records");
        Ok(RetractionOutcome { decision, affected })
    }

    /// Deletes still-retracted rows and their couplings by record id. Rows a later
    /// harvest revived are kept.
    pub async fn remove_retracted(&self, record_ids: &[i64]) -> Result<u64, StoreError> {
        if record_ids.is_empty() {
            return Ok(0);
        }
        let mut tx = self.pool.begin().await?;
        sqlx::query(
            r#"
            DELETE FROM coupling c
             USING record r
             WHERE r.id = ANY($1)
               AND r.dataset #>> '{extras,metadata,deletedAt}' IS NOT NULL
               AND c.source = r.source
               AND c.service_identifier = r.identifier
            "#,
        )
        .bind(record_ids)
        .execute(&mut *tx)
        .await?;
        let removed = sqlx::query(
            "DELETE FROM record WHERE id = ANY($1) AND dataset #>> '{extras,metadata,deletedAt}' IS NOT NULL",
        )
        .bind(record_ids)
        .execute(&mut *tx)
        .await?
        .rows_affected();
        tx.commit().await?;
        Ok(removed)
    }

    /// Replaces the stored `mergedFrom` of one record. Returns whether the row changed.
    pub async fn store_merged_from(&self, record_id: i64, merged_from: &[String]) -> Result<bool, StoreError> {
        let changed = sqlx::query(
            r#"
            UPDATE record
               SET dataset = jsonb_set(dataset, '{extras,metadata,mergedFrom}', $2::jsonb)
             WHERE id = $1
               AND dataset #> '{extras,metadata,mergedFrom}' IS DISTINCT FROM $2::jsonb
            "#,
        )
        .bind(record_id)
        .bind(Json(merged_from))
        .execute(&self.pool)
        .await?
        .rows_affected();
        Ok(changed > 0)
    }

    /// Hard-deletes soft-retracted records whose `deletedAt` is older than `older_than`.
    /// Also returns the document ids no remaining live record carries, so their index
    /// entries can be dropped.
    pub async fn purge_retracted(&self, older_than: DateTime<Utc>) -> Result<PurgeOutcome, StoreError> {
        let mut tx = self.pool.begin().await?;
        let index_ids: Vec<String> = sqlx::query_scalar(
            r#"
            SELECT DISTINCT r.dataset ->> 'id'
              FROM record r
             WHERE (r.dataset #>> '{extras,metadata,deletedAt}')::timestamptz < $1
               AND r.dataset ->> 'id' IS NOT NULL
               AND NOT EXISTS (
                   SELECT 1
                     FROM record l
                    WHERE l.dataset ->> 'id' = r.dataset ->> 'id'
                      AND l.dataset #>> '{extras,metadata,deletedAt}' IS NULL
               )
            "#,
        )
        .bind(older_than)
        .fetch_all(&mut *tx)
        .await?;
        sqlx::query(
            r#"
            DELETE FROM coupling c
             USING record r
             WHERE (r.dataset #>> '{extras,metadata,deletedAt}')::timestamptz < $1
               AND c.source = r.source
               AND c.service_identifier = r.identifier
            "#,
        )
        .bind(older_than)
        .execute(&mut *tx)
        .await?;
        let purged = sqlx::query(
            "DELETE FROM record WHERE (dataset #>> '{extras,metadata,deletedAt}')::timestamptz < $1",
        )
        .bind(older_than)
        .execute(&mut *tx)
        .await?
        .rows_affected();
        tx.commit().await?;
        Ok(PurgeOutcome { purged, index_ids })
    }
}

/// Transaction-bound write phase of one source run.
///
/// Dropping the scope without calling [`commit`](Self::commit) rolls the transaction back.
pub struct SourceWriteScope {
    tx: Transaction<'static, Postgres>,
    buffer: UpsertBuffer,
    source: String,
    written: usize,
}

impl SourceWriteScope {
    pub fn source(&self) -> &str {
        &self.source
    }

    /// Rows sent to the database so far (not yet committed).
    pub fn written(&self) -> usize {
        self.written
    }

    pub fn pending(&self) -> usize {
        self.buffer.len()
    }

    pub async fn push(&mut self, record: RawRecord) -> Result<(), StoreError> {
        if record.source != self.source {
            return Err(StoreError::SourceMismatch {
                identifier: record.identifier,
                expected: self.source.clone(),
                found: record.source,
            });
        }
        if let Some(batch) = self.buffer.push(record) {
            self.write_batch(batch).await?;
        }
        Ok(())
    }

    pub async fn flush(&mut self) -> Result<usize, StoreError> {
        let batch = self.buffer.drain();
        let len = batch.len();
        if len > 0 {
            self.write_batch(batch).await?;
        }
        Ok(len)
    }

    pub async fn commit(mut self) -> Result<usize, StoreError> {
        self.flush().await?;
        let written = self.written;
        self.tx.commit().await?;
        Ok(written)
    }

    pub async fn rollback(self) -> Result<(), StoreError> {
        self.tx.rollback().await?;
        Ok(())
    }

    async fn write_batch(&mut self, batch: Vec<RawRecord>) -> Result<(), StoreError> {
        let mut builder: QueryBuilder<Postgres> = QueryBuilder::new(
            "INSERT INTO record (identifier, source, collection_id, dataset, raw, operates_on, created_on, last_modified) ",
        );
        builder.push_values(batch.iter(), |mut row, record| {
            row.push_bind(record.identifier.clone())
                .push_bind(record.source.clone())
                .push_bind(record.collection_id.clone())
                .push_bind(Json(record.document.clone()))
                .push_bind(record.raw.clone())
                .push_bind(record.operates_on.clone())
                .push_bind(record.created_at)
                .push_bind(record.last_modified_at);
        });
        builder.push(UPSERT_CONFLICT_CLAUSE);
        builder.build().execute(&mut *self.tx).await?;

        let identifiers: Vec<String> = batch.iter().map(|r| r.identifier.clone()).collect();
        sqlx::query("DELETE FROM coupling WHERE source = $1 AND service_identifier = ANY($2)")
            .bind(&self.source)
            .bind(identifiers)
            .execute(&mut *self.tx)
            .await?;

        let (services, datasets): (Vec<String>, Vec<String>) = batch
            .iter()
            .flat_map(|r| {
                r.operates_on
                    .iter()
                    .map(move |dataset| (r.identifier.clone(), dataset.clone()))
            })
            .unzip();
        if !services.is_empty() {
            sqlx::query(
                r#"
                INSERT INTO coupling (source, service_identifier, dataset_identifier)
                SELECT $1, s, d FROM UNNEST($2::text[], $3::text[]) AS t(s, d)
                ON CONFLICT DO NOTHING
                "#,
            )
            .bind(&self.source)
            .bind(services)
            .bind(datasets)
            .execute(&mut *self.tx)
            .await?;
        }

        self.written += batch.len();
        debug!(source = %self.source, rows = batch.len(), "flushed upsert batch");
        Ok(())
    }
}
