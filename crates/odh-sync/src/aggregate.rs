//! Aggregator: turns one bucket into the index operations for its entity.
//!
//! `aggregate_bucket` performs no I/O; profiles only decide primary order and field merges.

use odh_core::{
    Bucket, BucketMember, CanonicalDocument, DocumentReference, IndexDocument, IndexOperation,
    ReferenceRelation,
};
use thiserror::Error;

use crate::config::Profile;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum AggregationError {
    #[error("bucket {anchor_id} has no dataset members")]
    EmptyBucket { anchor_id: i64 },
    #[error("bucket {anchor_id}: primary position {position} out of range for {candidates} candidates")]
    InvalidPrimary {
        anchor_id: i64,
        position: usize,
        candidates: usize,
    },
    #[error("merging {duplicate} into {primary}: {message}")]
    Merge {
        primary: String,
        duplicate: String,
        message: String,
    },
}

/// Profile hooks over the fixed aggregation algorithm.
pub trait Aggregator<D: IndexDocument>: Send + Sync {
    fn name(&self) -> &'static str;

    /// Index of the primary among `candidates`, which are in bucket order.
    /// Must be a deterministic function of the candidates.
    fn primary_position(&self, _candidates: &[&BucketMember<D>]) -> usize {
        0
    }

    fn merge_duplicate(&self, primary: &mut D, duplicate: &BucketMember<D>) -> Result<(), AggregationError>;

    /// Folds a coupled service into the dataset. Must be idempotent.
    fn couple_service(&self, dataset: &mut D, service: &BucketMember<D>);
}

/// Computes the operations for one bucket: deletes for every retired id, then one index
/// operation for the merged primary.
///
/// Retired ids are merged or retracted duplicates and the own ids of services (coupled
/// services only live inside the dataset document). Retracted duplicates stay in the
/// primary's `mergedFrom`, so provenance never shrinks between passes. A bucket whose
/// members are all retracted yields only deletes, the primary's id first.
pub fn aggregate_bucket<D, A>(
    aggregator: &A,
    bucket: &Bucket<D>,
    index: &str,
) -> Result<Vec<IndexOperation<D>>, AggregationError>
where
    D: IndexDocument,
    A: Aggregator<D> + ?Sized,
{
    if bucket.duplicates.is_empty() {
        return Err(AggregationError::EmptyBucket {
            anchor_id: bucket.anchor_id,
        });
    }

    let live: Vec<&BucketMember<D>> = bucket
        .duplicates
        .iter()
        .filter(|m| !m.document.is_retracted())
        .collect();

    if live.is_empty() {
        let all: Vec<&BucketMember<D>> = bucket.duplicates.iter().collect();
        let primary = pick(aggregator, bucket.anchor_id, &all)?;
        let retired = std::iter::once(primary)
            .chain(all.iter().copied())
            .chain(bucket.operating_services.iter())
            .map(|m| m.document.document_id().to_string());
        return Ok(deletes(index, retired, None));
    }

    let primary_member = pick(aggregator, bucket.anchor_id, &live)?;
    let mut primary = primary_member.document.clone();
    let mut retired: Vec<String> = Vec::new();

    for service in &bucket.operating_services {
        if !service.document.is_retracted() {
            aggregator.couple_service(&mut primary, service);
        }
        retired.push(service.document.document_id().to_string());
    }

    for duplicate in &bucket.duplicates {
        if duplicate.id == primary_member.id {
            continue;
        }
        let duplicate_id = duplicate.document.document_id().to_string();
        if duplicate.document.is_retracted() {
            primary.record_merged_from(&duplicate_id);
            retired.push(duplicate_id);
            continue;
        }

        let before = primary.document_id().to_string();
        aggregator.merge_duplicate(&mut primary, duplicate)?;
        primary.record_merged_from(&duplicate_id);
        if primary.document_id() != before {
            retired.push(before);
        }
        retired.push(duplicate_id);
    }

    let final_id = primary.document_id().to_string();
    let mut operations = deletes(index, retired, Some(final_id.as_str()));
    operations.push(IndexOperation::index(index, final_id, primary));
    Ok(operations)
}

/// One delete per distinct id, in first-seen order, never for `keep`.
fn deletes<D>(index: &str, ids: impl IntoIterator<Item = String>, keep: Option<&str>) -> Vec<IndexOperation<D>> {
    let mut operations: Vec<IndexOperation<D>> = Vec::new();
    for id in ids {
        if keep == Some(id.as_str()) || operations.iter().any(|op| op.document_id() == id) {
            continue;
        }
        operations.push(IndexOperation::delete(index, id));
    }
    operations
}

fn pick<'a, D, A>(
    aggregator: &A,
    anchor_id: i64,
    candidates: &[&'a BucketMember<D>],
) -> Result<&'a BucketMember<D>, AggregationError>
where
    D: IndexDocument,
    A: Aggregator<D> + ?Sized,
{
    let position = aggregator.primary_position(candidates);
    candidates
        .get(position)
        .copied()
        .ok_or(AggregationError::InvalidPrimary {
            anchor_id,
            position,
            candidates: candidates.len(),
        })
}

fn fill<T: Clone>(target: &mut Option<T>, source: &Option<T>) {
    if target.is_none() {
        target.clone_from(source);
    }
}

fn fill_vec<T: Clone>(target: &mut Vec<T>, source: &[T]) {
    if target.is_empty() {
        target.extend_from_slice(source);
    }
}

fn union<T: Clone + PartialEq>(target: &mut Vec<T>, source: &[T]) {
    for item in source {
        if !target.contains(item) {
            target.push(item.clone());
        }
    }
}

/// Catalog profile: first record wins, gaps are filled from duplicates,
/// keyword-like lists and distributions are unioned.
#[derive(Debug, Clone, Copy, Default)]
pub struct DcatAggregator;

impl DcatAggregator {
    fn merge_fields(primary: &mut CanonicalDocument, duplicate: &CanonicalDocument) {
        fill(&mut primary.title, &duplicate.title);
        fill(&mut primary.description, &duplicate.description);
        fill(&mut primary.license, &duplicate.license);
        fill(&mut primary.spatial, &duplicate.spatial);
        fill(&mut primary.spatial_text, &duplicate.spatial_text);
        fill(&mut primary.accrual_periodicity, &duplicate.accrual_periodicity);
        fill_vec(&mut primary.temporal, &duplicate.temporal);
        fill_vec(&mut primary.publisher, &duplicate.publisher);
        fill_vec(&mut primary.originator, &duplicate.originator);
        fill_vec(&mut primary.creator, &duplicate.creator);
        fill_vec(&mut primary.contact_point, &duplicate.contact_point);
        fill_vec(&mut primary.display_contacts, &duplicate.display_contacts);

        union(&mut primary.keywords, &duplicate.keywords);
        union(&mut primary.themes, &duplicate.themes);
        union(&mut primary.categories, &duplicate.categories);
        union(&mut primary.extras.groups, &duplicate.extras.groups);

        for distribution in &duplicate.distributions {
            primary.add_distribution(distribution.clone());
        }
        for reference in &duplicate.extras.references {
            primary.add_reference(reference.clone());
        }
    }

    fn couple(dataset: &mut CanonicalDocument, service: &BucketMember<CanonicalDocument>) {
        for distribution in &service.document.distributions {
            dataset.add_distribution(distribution.clone());
        }
        dataset.add_reference(DocumentReference {
            identifier: service.document.identifier.clone(),
            source: service.source.clone(),
            title: service.document.title.clone(),
            url: service
                .document
                .distributions
                .first()
                .map(|d| d.access_url.clone()),
            relation: ReferenceRelation::RefersTo,
        });
    }
}

impl Aggregator<CanonicalDocument> for DcatAggregator {
    fn name(&self) -> &'static str {
        "dcat"
    }

    fn merge_duplicate(
        &self,
        primary: &mut CanonicalDocument,
        duplicate: &BucketMember<CanonicalDocument>,
    ) -> Result<(), AggregationError> {
        Self::merge_fields(primary, &duplicate.document);
        Ok(())
    }

    fn couple_service(&self, dataset: &mut CanonicalDocument, service: &BucketMember<CanonicalDocument>) {
        Self::couple(dataset, service);
    }
}

/// Geodata profile: feature-type representatives are preferred as primary; temporal
/// ranges are unioned instead of filled.
#[derive(Debug, Clone, Copy, Default)]
pub struct GeoAggregator;

impl Aggregator<CanonicalDocument> for GeoAggregator {
    fn name(&self) -> &'static str {
        "geo"
    }

    fn primary_position(&self, candidates: &[&BucketMember<CanonicalDocument>]) -> usize {
        candidates
            .iter()
            .position(|m| m.document.extras.feature_type)
            .unwrap_or(0)
    }

    fn merge_duplicate(
        &self,
        primary: &mut CanonicalDocument,
        duplicate: &BucketMember<CanonicalDocument>,
    ) -> Result<(), AggregationError> {
        DcatAggregator::merge_fields(primary, &duplicate.document);
        union(&mut primary.temporal, &duplicate.document.temporal);
        Ok(())
    }

    fn couple_service(&self, dataset: &mut CanonicalDocument, service: &BucketMember<CanonicalDocument>) {
        DcatAggregator::couple(dataset, service);
    }
}

pub fn aggregator_for_profile(profile: Profile) -> Box<dyn Aggregator<CanonicalDocument>> {
    match profile {
        Profile::Dcat => Box::new(DcatAggregator),
        Profile::Geo => Box::new(GeoAggregator),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};
    use odh_core::{
        Distribution, HarvestMetadata, OperationKind, ResourceKind, SourceDescriptor, TemporalRange,
    };

    const INDEX: &str = "datasets";

    fn doc(id: &str, title: &str, url: &str) -> CanonicalDocument {
        let at = Utc.with_ymd_and_hms(2024, 5, 1, 8, 0, 0).single().unwrap();
        let metadata = HarvestMetadata::new(
            at,
            SourceDescriptor {
                source_id: "s".into(),
                collection_id: None,
                kind: "catalog_api".into(),
                raw_url: None,
            },
        );
        let mut d = CanonicalDocument::skeleton(id, id, metadata);
        d.title = Some(title.into());
        d.distributions.push(Distribution {
            access_url: url.into(),
            ..Distribution::default()
        });
        d
    }

    fn member<D>(id: i64, source: &str, document: D) -> BucketMember<D> {
        let at = Utc.with_ymd_and_hms(2024, 5, 1, 8, 0, 0).single().unwrap();
        BucketMember {
            id,
            source: source.into(),
            document,
            issued: at,
            modified: at,
        }
    }

    fn retracted(mut d: CanonicalDocument) -> CanonicalDocument {
        d.extras.metadata.deleted_at = Some(Utc::now());
        d
    }

    fn only_index(ops: &[IndexOperation<CanonicalDocument>]) -> &CanonicalDocument {
        let indexed: Vec<_> = ops.iter().filter_map(|op| op.document()).collect();
        assert_eq!(indexed.len(), 1);
        indexed[0]
    }

    #[test]
    fn first_member_is_primary_regardless_of_content() {
        let mut bucket = Bucket::new(1);
        bucket.insert_duplicate(member(1, "s1", doc("A", "t", "https://a")));
        bucket.insert_duplicate(member(2, "s2", doc("B", "t", "https://b")));
        bucket.insert_duplicate(member(3, "s3", doc("C", "t", "https://c")));

        let ops = aggregate_bucket(&DcatAggregator, &bucket, INDEX).unwrap();
        let kinds: Vec<_> = ops.iter().map(|op| (op.kind(), op.document_id())).collect();
        assert_eq!(
            kinds,
            vec![
                (OperationKind::Delete, "B"),
                (OperationKind::Delete, "C"),
                (OperationKind::Index, "A"),
            ]
        );
        let primary = only_index(&ops);
        assert_eq!(primary.merged_from(), ["B".to_string(), "C".to_string()]);
        assert_eq!(primary.distributions.len(), 3);
    }

    #[test]
    fn fully_retracted_bucket_yields_only_deletes_primary_first() {
        let mut bucket = Bucket::new(1);
        bucket.insert_duplicate(member(1, "s1", retracted(doc("A", "t", "https://a"))));
        bucket.insert_duplicate(member(2, "s2", retracted(doc("B", "t", "https://b"))));

        let ops = aggregate_bucket(&DcatAggregator, &bucket, INDEX).unwrap();
        assert_eq!(
            ops,
            vec![IndexOperation::delete(INDEX, "A"), IndexOperation::delete(INDEX, "B")]
        );
    }

    #[test]
    fn retracted_duplicate_is_deleted_and_kept_as_provenance_only() {
        let mut bucket = Bucket::new(1);
        bucket.insert_duplicate(member(1, "s1", retracted(doc("A", "t", "https://a"))));
        bucket.insert_duplicate(member(2, "s2", doc("B", "t", "https://b")));

        let ops = aggregate_bucket(&DcatAggregator, &bucket, INDEX).unwrap();
        assert_eq!(ops.len(), 2);
        assert_eq!(ops[0], IndexOperation::delete(INDEX, "A"));
        let primary = only_index(&ops);
        assert_eq!(primary.id, "B");
        assert_eq!(primary.merged_from(), ["A".to_string()]);
        assert_eq!(primary.distributions.len(), 1);
    }

    #[test]
    fn merged_from_survives_retraction_of_a_merged_duplicate() {
        let mut bucket = Bucket::new(1);
        bucket.insert_duplicate(member(1, "s1", doc("x", "Roads", "https://s1/x.csv")));
        bucket.insert_duplicate(member(2, "s2", doc("y", "Roads", "https://s2/y.csv")));
        let first = aggregate_bucket(&DcatAggregator, &bucket, INDEX).unwrap();
        assert_eq!(only_index(&first).merged_from(), ["y".to_string()]);

        let mut bucket = Bucket::new(1);
        bucket.insert_duplicate(member(1, "s1", doc("x", "Roads", "https://s1/x.csv")));
        bucket.insert_duplicate(member(2, "s2", retracted(doc("y", "Roads", "https://s2/y.csv"))));
        let second = aggregate_bucket(&DcatAggregator, &bucket, INDEX).unwrap();

        let x = only_index(&second);
        assert_eq!(x.merged_from(), ["y".to_string()]);
        assert_eq!(x.distributions.len(), 1);
        assert_eq!(second[0], IndexOperation::delete(INDEX, "y"));
    }

    #[test]
    fn coupled_service_loses_its_standalone_entry() {
        let mut wms = doc("svc", "Roads WMS", "https://maps/wms");
        wms.extras.resource_kind = ResourceKind::Service;

        let mut alone = Bucket::new(5);
        alone.insert_duplicate(member(5, "s2", wms.clone()));
        let ops = aggregate_bucket(&DcatAggregator, &alone, INDEX).unwrap();
        assert_eq!(ops.len(), 1);
        assert_eq!(only_index(&ops).id, "svc");

        let mut coupled = Bucket::new(1);
        coupled.insert_duplicate(member(1, "s1", doc("x", "Roads", "https://example.org/x.csv")));
        coupled.insert_service(member(5, "s2", wms));
        let ops = aggregate_bucket(&DcatAggregator, &coupled, INDEX).unwrap();
        let summary: Vec<_> = ops.iter().map(|op| (op.kind(), op.document_id())).collect();
        assert_eq!(
            summary,
            vec![(OperationKind::Delete, "svc"), (OperationKind::Index, "x")]
        );
        assert_eq!(only_index(&ops).extras.references[0].identifier, "svc");
    }

    #[test]
    fn coupling_is_idempotent() {
        let mut service = doc("x-wms", "Roads WMS", "https://maps.example.org/wms");
        service.extras.resource_kind = ResourceKind::Service;
        let service = member(9, "s2", service);

        let mut dataset = doc("x", "Roads", "https://example.org/x.csv");
        DcatAggregator.couple_service(&mut dataset, &service);
        let once = dataset.clone();
        DcatAggregator.couple_service(&mut dataset, &service);

        assert_eq!(dataset, once);
        assert_eq!(dataset.extras.references.len(), 1);
        assert_eq!(dataset.extras.references[0].relation, ReferenceRelation::RefersTo);
        assert_eq!(dataset.distributions.len(), 2);
    }

    #[test]
    fn retracted_services_are_not_coupled() {
        let mut bucket = Bucket::new(1);
        bucket.insert_duplicate(member(1, "s1", doc("x", "Roads", "https://example.org/x.csv")));
        bucket.insert_service(member(2, "s2", retracted(doc("x-wms", "WMS", "https://maps/wms"))));

        let ops = aggregate_bucket(&DcatAggregator, &bucket, INDEX).unwrap();
        assert!(only_index(&ops).extras.references.is_empty());
        assert_eq!(ops[0], IndexOperation::delete(INDEX, "x-wms"));
    }

    #[test]
    fn dataset_and_service_from_two_sources_collapse_into_one_document() {
        let mut bucket = Bucket::new(1);
        bucket.insert_duplicate(member(1, "S1", doc("x", "Roads 2024", "https://s1.example.org/x.csv")));
        let mut y = doc("y", "Roads 2024", "https://s2.example.org/y.csv");
        y.description = Some("Road network of 2024".into());
        bucket.insert_duplicate(member(2, "S2", y));
        let mut wms = doc("y-wms", "Roads WMS", "https://maps.s2.example.org/wms");
        wms.extras.resource_kind = ResourceKind::Service;
        bucket.insert_service(member(3, "S2", wms));

        let ops = aggregate_bucket(&DcatAggregator, &bucket, INDEX).unwrap();
        let summary: Vec<_> = ops.iter().map(|op| (op.kind(), op.document_id())).collect();
        assert_eq!(
            summary,
            vec![
                (OperationKind::Delete, "y-wms"),
                (OperationKind::Delete, "y"),
                (OperationKind::Index, "x"),
            ]
        );

        let x = only_index(&ops);
        assert_eq!(x.merged_from(), ["y".to_string()]);
        assert_eq!(x.description.as_deref(), Some("Road network of 2024"));
        assert!(x
            .distributions
            .iter()
            .any(|d| d.access_url == "https://maps.s2.example.org/wms"));
        assert_eq!(x.extras.references[0].identifier, "y-wms");
        assert_eq!(x.extras.references[0].source, "S2");
    }

    #[test]
    fn geo_profile_prefers_feature_type_representative() {
        let mut bucket = Bucket::new(1);
        bucket.insert_duplicate(member(1, "s1", doc("A", "t", "https://a")));
        let mut b = doc("B", "t", "https://b");
        b.extras.feature_type = true;
        bucket.insert_duplicate(member(2, "s2", b));

        let ops = aggregate_bucket(&GeoAggregator, &bucket, INDEX).unwrap();
        assert_eq!(only_index(&ops).id, "B");
        assert_eq!(ops[0], IndexOperation::delete(INDEX, "A"));

        let ops = aggregate_bucket(&DcatAggregator, &bucket, INDEX).unwrap();
        assert_eq!(only_index(&ops).id, "A");
    }

    #[test]
    fn geo_profile_unions_temporal_ranges() {
        let y2023 = TemporalRange {
            gte: Some(Utc.with_ymd_and_hms(2023, 1, 1, 0, 0, 0).single().unwrap()),
            lte: None,
        };
        let y2024 = TemporalRange {
            gte: Some(Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).single().unwrap()),
            lte: None,
        };
        let mut a = doc("A", "t", "https://a");
        a.temporal = vec![y2023.clone()];
        let mut b = doc("B", "t", "https://b");
        b.temporal = vec![y2023.clone(), y2024.clone()];

        let mut bucket = Bucket::new(1);
        bucket.insert_duplicate(member(1, "s1", a));
        bucket.insert_duplicate(member(2, "s2", b));

        let ops = aggregate_bucket(&GeoAggregator, &bucket, INDEX).unwrap();
        assert_eq!(only_index(&ops).temporal, vec![y2023, y2024]);
    }

    #[test]
    fn empty_bucket_is_an_error() {
        let bucket: Bucket<CanonicalDocument> = Bucket::new(7);
        assert_eq!(
            aggregate_bucket(&DcatAggregator, &bucket, INDEX),
            Err(AggregationError::EmptyBucket { anchor_id: 7 })
        );
    }

    /// Identity is derived from content, so merging renames the primary.
    #[derive(Debug, Clone, PartialEq)]
    struct HashedDoc {
        id: String,
        merged: Vec<String>,
    }

    impl IndexDocument for HashedDoc {
        fn document_id(&self) -> &str {
            &self.id
        }

        fn is_retracted(&self) -> bool {
            false
        }

        fn merged_from(&self) -> &[String] {
            &self.merged
        }

        fn record_merged_from(&mut self, id: &str) {
            if !self.merged.iter().any(|m| m == id) {
                self.merged.push(id.to_string());
            }
        }
    }

    struct Renaming;

    impl Aggregator<HashedDoc> for Renaming {
        fn name(&self) -> &'static str {
            "renaming"
        }

        fn merge_duplicate(
            &self,
            primary: &mut HashedDoc,
            _duplicate: &BucketMember<HashedDoc>,
        ) -> Result<(), AggregationError> {
            primary.id = "3".into();
            Ok(())
        }

        fn couple_service(&self, _dataset: &mut HashedDoc, _service: &BucketMember<HashedDoc>) {}
    }

    #[test]
    fn identity_change_retires_the_old_primary_id() {
        let mut bucket = Bucket::new(1);
        for id in ["1", "2"] {
            bucket.insert_duplicate(member(
                id.parse().unwrap(),
                "s",
                HashedDoc {
                    id: id.into(),
                    merged: vec![],
                },
            ));
        }

        let ops = aggregate_bucket(&Renaming, &bucket, INDEX).unwrap();
        let summary: Vec<_> = ops.iter().map(|op| (op.kind(), op.document_id())).collect();
        assert_eq!(
            summary,
            vec![
                (OperationKind::Delete, "1"),
                (OperationKind::Delete, "2"),
                (OperationKind::Index, "3"),
            ]
        );
        assert_eq!(ops[2].document().unwrap().merged, vec!["2".to_string()]);
    }

    #[test]
    fn failing_merge_surfaces_as_bucket_error() {
        struct Refusing;
        impl Aggregator<CanonicalDocument> for Refusing {
            fn name(&self) -> &'static str {
                "refusing"
            }
            fn merge_duplicate(
                &self,
                primary: &mut CanonicalDocument,
                duplicate: &BucketMember<CanonicalDocument>,
            ) -> Result<(), AggregationError> {
                Err(AggregationError::Merge {
                    primary: primary.id.clone(),
                    duplicate: duplicate.document.id.clone(),
                    message: "conflicting licenses".into(),
                })
            }
            fn couple_service(&self, _: &mut CanonicalDocument, _: &BucketMember<CanonicalDocument>) {}
        }

        let mut bucket = Bucket::new(1);
        bucket.insert_duplicate(member(1, "s1", doc("A", "t", "https://a")));
        bucket.insert_duplicate(member(2, "s2", doc("B", "t", "https://b")));
        let err = aggregate_bucket(&Refusing, &bucket, INDEX).unwrap_err();
        assert_eq!(err.to_string(), "merging B into A: conflicting licenses");
    }
}
