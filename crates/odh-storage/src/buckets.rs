//! Bucket Builder: cross-source grouping of stored records into one bucket per entity.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use odh_core::{Bucket, BucketMember, CanonicalDocument};
use sqlx::types::Json;
use sqlx::Row;
use tracing::warn;

use crate::records::{RecordStore, StoreError};

/// Datasets are grouped on their non-empty title (untitled records stay alone) and anchored
/// at the smallest record id of the group, so every pass agrees on the anchor.
/// Services attach to every group containing a live dataset they operate on; services with
/// no live dataset anchor themselves and are returned as the only duplicate of their bucket.
/// `$1` is the source scope; NULL selects every bucket.
const BUCKET_QUERY: &str = r#"
WITH datasets AS (
    SELECT r.id, r.identifier, r.source, r.dataset, r.created_on, r.last_modified,
           r.dataset #>> '{extras,metadata,deletedAt}' IS NULL AS live,
           MIN(r.id) OVER w AS anchor_id,
           BOOL_OR($1::text[] IS NULL OR r.source = ANY($1)) OVER w AS in_scope
      FROM record r
     WHERE COALESCE(r.dataset #>> '{extras,resourceKind}', 'dataset') <> 'service'
    WINDOW w AS (PARTITION BY COALESCE(NULLIF(r.dataset ->> 'title', ''), 'record:' || r.id::text))
),
services AS (
    SELECT s.id, s.identifier, s.source, s.dataset, s.created_on, s.last_modified
      FROM record s
     WHERE s.dataset #>> '{extras,resourceKind}' = 'service'
)
SELECT d.anchor_id, d.id, d.source, d.dataset, FALSE AS is_service,
       d.created_on AS issued, d.last_modified AS modified
  FROM datasets d
 WHERE d.in_scope
UNION
SELECT d.anchor_id, s.id, s.source, s.dataset, TRUE AS is_service,
       s.created_on AS issued, s.last_modified AS modified
  FROM datasets d
  JOIN coupling c ON c.dataset_identifier = d.identifier
  JOIN services s ON s.identifier = c.service_identifier AND s.source = c.source
 WHERE d.in_scope
   AND d.live
UNION
SELECT s.id AS anchor_id, s.id, s.source, s.dataset, FALSE AS is_service,
       s.created_on AS issued, s.last_modified AS modified
  FROM services s
 WHERE ($1::text[] IS NULL OR s.source = ANY($1))
   AND NOT EXISTS (
       SELECT 1
         FROM coupling c
         JOIN datasets d ON d.identifier = c.dataset_identifier
        WHERE c.source = s.source
          AND c.service_identifier = s.identifier
          AND d.live
   )
ORDER BY anchor_id, is_service, id
"#;

#[derive(Debug, Clone, PartialEq)]
pub struct BucketRow<T> {
    pub anchor_id: i64,
    pub id: i64,
    pub source: String,
    pub dataset: T,
    pub is_service: bool,
    pub issued: DateTime<Utc>,
    pub modified: DateTime<Utc>,
}

/// Groups rows by `anchor_id`, keeping first-seen order of anchors and of members.
pub fn group_bucket_rows<T>(rows: impl IntoIterator<Item = BucketRow<T>>) -> Vec<Bucket<T>> {
    let mut buckets: Vec<Bucket<T>> = Vec::new();
    let mut positions: HashMap<i64, usize> = HashMap::new();

    for row in rows {
        let position = *positions.entry(row.anchor_id).or_insert_with(|| {
            buckets.push(Bucket::new(row.anchor_id));
            buckets.len() - 1
        });
        let member = BucketMember {
            id: row.id,
            source: row.source,
            document: row.dataset,
            issued: row.issued,
            modified: row.modified,
        };
        if row.is_service {
            buckets[position].insert_service(member);
        } else {
            buckets[position].insert_duplicate(member);
        }
    }

    buckets
}

impl RecordStore {
    /// Bucket rows touching any of `sources`, or every bucket when `sources` is `None`.
    pub async fn fetch_bucket_rows(
        &self,
        sources: Option<&[String]>,
    ) -> Result<Vec<BucketRow<CanonicalDocument>>, StoreError> {
        let rows = sqlx::query(BUCKET_QUERY)
            .bind(sources)
            .fetch_all(self.pool())
            .await?;

        let mut out = Vec::with_capacity(rows.len());
        for row in rows {
            let id: i64 = row.try_get("id")?;
            let Json(value): Json<serde_json::Value> = row.try_get("dataset")?;
            let dataset = match serde_json::from_value::<CanonicalDocument>(value) {
                Ok(dataset) => dataset,
                Err(err) => {
                    warn!(record_id = id, error = %err, "skipping undecodable record in bucket query");
                    continue;
                }
            };
            out.push(BucketRow {
                anchor_id: row.try_get("anchor_id")?,
                id,
                source: row.try_get("source")?,
                dataset,
                is_service: row.try_get("is_service")?,
                issued: row.try_get("issued")?,
                modified: row.try_get("modified")?,
            });
        }
        Ok(out)
    }

    pub async fn fetch_buckets(
        &self,
        source: Option<&str>,
    ) -> Result<Vec<Bucket<CanonicalDocument>>, StoreError> {
        let scope = source.map(|s| vec![s.to_string()]);
        self.fetch_buckets_in(scope.as_deref()).await
    }

    pub async fn fetch_buckets_in(
        &self,
        sources: Option<&[String]>,
    ) -> Result<Vec<Bucket<CanonicalDocument>>, StoreError> {
        Ok(group_bucket_rows(self.fetch_bucket_rows(sources).await?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn row(anchor_id: i64, id: i64, source: &str, title: &str, is_service: bool) -> BucketRow<String> {
        let ts = Utc.with_ymd_and_hms(2024, 5, 1, 8, 0, 0).single().unwrap();
        BucketRow {
            anchor_id,
            id,
            source: source.into(),
            dataset: title.into(),
            is_service,
            issued: ts,
            modified: ts,
        }
    }

    #[test]
    fn same_anchor_rows_share_a_bucket() {
        let buckets = group_bucket_rows(vec![
            row(1, 1, "S1", "Roads 2024", false),
            row(1, 2, "S2", "Roads 2024", false),
            row(1, 3, "S2", "Roads WMS", true),
            row(4, 4, "S1", "Rivers", false),
        ]);

        assert_eq!(buckets.len(), 2);
        let roads = &buckets[0];
        assert_eq!(roads.anchor_id, 1);
        assert_eq!(
            roads.duplicates.iter().map(|m| m.id).collect::<Vec<_>>(),
            vec![1, 2]
        );
        assert_eq!(roads.operating_services.len(), 1);
        assert_eq!(roads.operating_services[0].source, "S2");

        let rivers = &buckets[1];
        assert_eq!(rivers.duplicates.len(), 1);
        assert!(rivers.operating_services.is_empty());
    }

    #[test]
    fn interleaved_rows_keep_first_seen_order() {
        let buckets = group_bucket_rows(vec![
            row(7, 7, "S1", "b", false),
            row(2, 2, "S1", "a", false),
            row(7, 9, "S3", "b", false),
        ]);
        assert_eq!(buckets.iter().map(|b| b.anchor_id).collect::<Vec<_>>(), vec![7, 2]);
        assert_eq!(buckets[0].duplicates.len(), 2);
    }

    #[test]
    fn a_service_coupled_through_two_duplicates_is_attached_once() {
        let buckets = group_bucket_rows(vec![
            row(1, 1, "S1", "x", false),
            row(1, 5, "S2", "svc", true),
            row(1, 5, "S2", "svc", true),
        ]);
        assert_eq!(buckets[0].operating_services.len(), 1);
    }
}
