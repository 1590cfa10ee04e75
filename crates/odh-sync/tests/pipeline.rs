// Runs against a live Postgres when ODH_TEST_DATABASE_URL is set; otherwise each test returns early.

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

use chrono::Utc;
use odh_core::RunStatus;
use odh_index::{IndexBackend, InMemoryBackend};
use odh_storage::RecordStore;
use odh_sync::{CancellationToken, HarvestConfig, SyncPipeline};
use serde_json::json;
use uuid::Uuid;

struct Harness {
    dir: tempfile::TempDir,
    pipeline: SyncPipeline,
    memory: Arc<InMemoryBackend>,
    s1: String,
    s2: String,
    tag: String,
}

fn write_json(path: &Path, value: serde_json::Value) {
    std::fs::create_dir_all(path.parent().unwrap()).unwrap();
    std::fs::write(path, serde_json::to_vec_pretty(&value).unwrap()).unwrap();
}

async fn harness() -> Option<Harness> {
    harness_with(&[]).await
}

async fn harness_with(env: &[(&'static str, &str)]) -> Option<Harness> {
    let url = std::env::var("ODH_TEST_DATABASE_URL").ok()?;
    let root = tempfile::tempdir().unwrap();
    let tag = Uuid::new_v4().simple().to_string();
    let s1 = format!("s1-{tag}");
    let s2 = format!("s2-{tag}");

    std::fs::write(
        root.path().join("sources.yaml"),
        format!(
            "sources:\n  - {{source_id: {s1}, display_name: Regional, kind: manual_export, path: s1.json}}\n  - {{source_id: {s2}, display_name: Ministry, kind: manual_export, path: s2.json}}\n"
        ),
    )
    .unwrap();

    let mut lookup: HashMap<&str, String> = HashMap::from([
        ("DATABASE_URL", url.clone()),
        ("ODH_WORKSPACE_ROOT", root.path().display().to_string()),
        ("ODH_DRY_RUN_INDEX", "true".to_string()),
    ]);
    lookup.extend(env.iter().map(|(key, value)| (*key, value.to_string())));
    let config = HarvestConfig::from_lookup(|key| lookup.get(key).cloned()).unwrap();

    let store = RecordStore::connect(&url, 2).await.expect("connect");
    store.migrate().await.expect("migrate");
    let memory = Arc::new(InMemoryBackend::new());
    let pipeline = SyncPipeline::with_parts(config, store, Arc::new(IndexBackend::InMemory(memory.clone()))).unwrap();

    Some(Harness {
        dir: root,
        pipeline,
        memory,
        s1,
        s2,
        tag,
    })
}

impl Harness {
    fn root(&self) -> &Path {
        self.dir.path()
    }

    async fn harvest(&self, source: &str) -> odh_core::RunSummary {
        let runs = self
            .pipeline
            .harvest_sources(&[source.to_string()], Utc::now(), &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(runs.len(), 1);
        runs.into_iter().next().unwrap()
    }

    fn index(&self) -> &str {
        &self.pipeline.config().index_name
    }

    fn entry(&self, identifier: &str, title: &str) -> serde_json::Value {
        json!({ "identifier": identifier, "title": title,
                "distributions": [{ "accessUrl": format!("https://example.org/{identifier}") }] })
    }
}

#[tokio::test]
async fn duplicates_across_sources_collapse_into_one_index_entry() {
    let Some(h) = harness().await else { return };
    let title = format!("Road network {}", h.tag);
    let (x, y, wms) = (format!("x-{}", h.tag), format!("y-{}", h.tag), format!("y-wms-{}", h.tag));

    write_json(
        &h.root().join("s1.json"),
        json!([{ "identifier": x, "title": title,
                 "distributions": [{ "accessUrl": "https://s1.example/roads.csv", "format": "CSV" }] }]),
    );
    write_json(
        &h.root().join("s2.json"),
        json!({ "records": [
            { "identifier": y, "title": title, "description": "Road network of 2024",
              "distributions": [{ "accessUrl": "https://s2.example/roads.zip" }] },
            { "identifier": wms, "title": format!("WMS {}", h.tag), "type": "service", "operatesOn": [y],
              "distributions": [{ "accessUrl": "https://s2.example/wms", "format": "WMS" }] }
        ]}),
    );

    let run1 = h.harvest(&h.s1).await;
    assert_eq!(run1.status, RunStatus::Completed);
    assert_eq!(run1.counts.processed, 1);
    let run2 = h.harvest(&h.s2).await;
    assert_eq!(run2.status, RunStatus::Completed);
    assert_eq!(run2.counts.processed, 2);
    assert!(h.root().join("reports").join(run2.run_id.to_string()).join("summary.json").exists());

    let summary = h.pipeline.aggregate(Some(&h.s1)).await.unwrap();
    assert!(summary.bucket_errors.is_empty());
    assert!(summary.index_errors.is_empty());
    assert_eq!(summary.indexed, 1);
    // y folded into x, and the coupled service's own entry.
    assert_eq!(summary.deleted, 2);

    let index = &h.pipeline.config().index_name;
    let merged = h.memory.document(index, &x).expect("x indexed");
    assert_eq!(merged["extras"]["metadata"]["mergedFrom"], json!([y]));
    assert_eq!(merged["description"], "Road network of 2024");
    let urls: Vec<&str> = merged["distributions"]
        .as_array()
        .unwrap()
        .iter()
        .filter_map(|d| d["accessUrl"].as_str())
        .collect();
    assert!(urls.contains(&"https://s2.example/wms"));
    assert!(h.memory.document(index, &y).is_none());
    assert!(h.memory.document(index, &wms).is_none());
    let stored = h.pipeline.store().load_documents(&h.s1).await.unwrap();
    assert_eq!(stored[&x].extras.metadata.merged_from, vec![y.clone()]);
}

#[tokio::test]
async fn missing_records_are_retracted_only_below_the_threshold() {
    let Some(h) = harness().await else { return };
    let records: Vec<_> = (0..10)
        .map(|i| json!({ "identifier": format!("r{i}-{}", h.tag), "title": format!("Record {i} {}", h.tag),
                         "distributions": [{ "accessUrl": format!("https://s1.example/{i}") }] }))
        .collect();
    write_json(&h.root().join("s1.json"), json!(records));
    assert_eq!(h.harvest(&h.s1).await.status, RunStatus::Completed);

    // 3 of 10 missing exceeds the default 20% limit.
    write_json(&h.root().join("s1.json"), json!(records[..7]));
    let refused = h.harvest(&h.s1).await;
    assert_eq!(refused.status, RunStatus::Completed);
    assert!(refused.warnings.iter().any(|w| w.contains("retraction skipped")));
    assert_eq!(h.pipeline.store().load_documents(&h.s1).await.unwrap().len(), 10);

    // 1 of 10 missing is retracted.
    write_json(&h.root().join("s1.json"), json!(records[..9]));
    let retracted = h.harvest(&h.s1).await;
    assert!(retracted.warnings.iter().all(|w| !w.contains("retraction skipped")));
}

#[tokio::test]
async fn failed_source_reports_failure_and_leaves_siblings_alone() {
    let Some(h) = harness().await else { return };
    write_json(
        &h.root().join("s2.json"),
        json!([{ "identifier": format!("ok-{}", h.tag), "title": "Fine",
                 "distributions": [{ "accessUrl": "https://s2.example/ok" }] }]),
    );
    // s1.json is never written, so its adapter fails to read the export.
    let runs = h
        .pipeline
        .harvest_sources(&[], Utc::now(), &CancellationToken::new())
        .await
        .unwrap();

    let by_source: HashMap<_, _> = runs.iter().map(|r| (r.source_id.as_str(), r)).collect();
    assert_eq!(by_source[h.s1.as_str()].status, RunStatus::Failed);
    assert!(!by_source[h.s1.as_str()].errors.is_empty());
    assert!(h.pipeline.store().load_documents(&h.s1).await.unwrap().is_empty());
    assert_eq!(by_source[h.s2.as_str()].status, RunStatus::Completed);
    assert_eq!(h.pipeline.store().load_documents(&h.s2).await.unwrap().len(), 1);
}

#[tokio::test]
async fn cancelled_runs_write_nothing() {
    let Some(h) = harness().await else { return };
    write_json(
        &h.root().join("s1.json"),
        json!([{ "identifier": format!("c-{}", h.tag), "title": "Cancelled",
                 "distributions": [{ "accessUrl": "https://s1.example/c" }] }]),
    );
    let cancel = CancellationToken::new();
    cancel.cancel();
    let runs = h.pipeline.harvest_sources(&[h.s1.clone()], Utc::now(), &cancel).await.unwrap();

    assert_eq!(runs[0].status, RunStatus::Cancelled);
    assert!(h.pipeline.store().load_documents(&h.s1).await.unwrap().is_empty());
}

#[tokio::test]
async fn run_all_harvests_every_enabled_source_then_aggregates() {
    let Some(h) = harness().await else { return };
    for (file, id) in [("s1.json", "a"), ("s2.json", "b")] {
        write_json(
            &h.root().join(file),
            json!([{ "identifier": format!("{id}-{}", h.tag), "title": format!("All {}", h.tag),
                     "distributions": [{ "accessUrl": format!("https://example.org/{id}") }] }]),
        );
    }
    let report = h.pipeline.run_all(Utc::now(), &CancellationToken::new()).await.unwrap();

    assert_eq!(report.runs.len(), 2);
    assert!(report.runs.iter().all(|r| r.status == RunStatus::Completed));
    let aggregation = report.aggregation.expect("aggregation ran");
    assert!(aggregation.indexed >= 1);
    let index = &h.pipeline.config().index_name;
    // Same title, so exactly one of the two survives as the primary.
    let a = h.memory.document(index, &format!("a-{}", h.tag)).is_some();
    let b = h.memory.document(index, &format!("b-{}", h.tag)).is_some();
    assert!(a ^ b);
}

#[tokio::test]
async fn soft_retracted_record_leaves_the_index_on_the_next_aggregation() {
    let Some(h) = harness_with(&[("ODH_RETRACTION_MAX_MISSING", "0.6")]).await else { return };
    let (keep, gone) = (format!("keep-{}", h.tag), format!("gone-{}", h.tag));
    write_json(
        &h.root().join("s1.json"),
        json!([h.entry(&keep, &format!("Keep {}", h.tag)), h.entry(&gone, &format!("Gone {}", h.tag))]),
    );
    h.harvest(&h.s1).await;
    assert_eq!(h.pipeline.aggregate(Some(&h.s1)).await.unwrap().indexed, 2);
    assert!(h.memory.document(h.index(), &gone).is_some());

    write_json(&h.root().join("s1.json"), json!([h.entry(&keep, &format!("Keep {}", h.tag))]));
    h.harvest(&h.s1).await;
    let summary = h.pipeline.aggregate(Some(&h.s1)).await.unwrap();

    assert_eq!(summary.deleted, 1);
    assert_eq!(summary.removed_records, 0);
    assert!(h.memory.document(h.index(), &gone).is_none());
    assert!(h.memory.document(h.index(), &keep).is_some());
    let stored = h.pipeline.store().load_documents(&h.s1).await.unwrap();
    assert!(stored[&gone].extras.metadata.deleted_at.is_some());
}

#[tokio::test]
async fn hard_retraction_removes_rows_after_the_index_delete() {
    let Some(h) = harness_with(&[("ODH_RETRACTION_MAX_MISSING", "0.6"), ("ODH_RETRACTION_MODE", "hard")]).await
    else {
        return;
    };
    let (keep, gone) = (format!("keep-{}", h.tag), format!("gone-{}", h.tag));
    write_json(
        &h.root().join("s1.json"),
        json!([h.entry(&keep, &format!("Keep {}", h.tag)), h.entry(&gone, &format!("Gone {}", h.tag))]),
    );
    h.harvest(&h.s1).await;
    h.pipeline.aggregate(Some(&h.s1)).await.unwrap();
    assert!(h.memory.document(h.index(), &gone).is_some());

    write_json(&h.root().join("s1.json"), json!([h.entry(&keep, &format!("Keep {}", h.tag))]));
    h.harvest(&h.s1).await;
    // Marked, not yet removed: the aggregation still has to see it.
    assert_eq!(h.pipeline.store().load_documents(&h.s1).await.unwrap().len(), 2);

    let summary = h.pipeline.aggregate(Some(&h.s1)).await.unwrap();
    assert_eq!(summary.removed_records, 1);
    assert!(h.memory.document(h.index(), &gone).is_none());
    let stored = h.pipeline.store().load_documents(&h.s1).await.unwrap();
    assert_eq!(stored.len(), 1);
    assert!(stored.contains_key(&keep));
}

#[tokio::test]
async fn merged_from_outlives_the_merged_duplicate() {
    let Some(h) = harness_with(&[("ODH_RETRACTION_MAX_MISSING", "0.6")]).await else { return };
    let title = format!("Shared {}", h.tag);
    let (x, y, z) = (format!("x-{}", h.tag), format!("y-{}", h.tag), format!("z-{}", h.tag));
    write_json(&h.root().join("s1.json"), json!([h.entry(&x, &title)]));
    write_json(
        &h.root().join("s2.json"),
        json!([h.entry(&y, &title), h.entry(&z, &format!("Other {}", h.tag))]),
    );
    h.harvest(&h.s1).await;
    h.harvest(&h.s2).await;
    h.pipeline.aggregate_sources(&[h.s1.clone(), h.s2.clone()]).await.unwrap();
    assert_eq!(h.memory.document(h.index(), &x).unwrap()["extras"]["metadata"]["mergedFrom"], json!([y]));

    write_json(&h.root().join("s2.json"), json!([h.entry(&z, &format!("Other {}", h.tag))]));
    h.harvest(&h.s2).await;
    h.pipeline.aggregate(Some(&h.s2)).await.unwrap();

    let merged = h.memory.document(h.index(), &x).expect("x still indexed");
    assert_eq!(merged["extras"]["metadata"]["mergedFrom"], json!([y]));
    assert!(h.memory.document(h.index(), &y).is_none());
}

#[tokio::test]
async fn standalone_service_entry_is_replaced_once_its_dataset_arrives() {
    let Some(h) = harness().await else { return };
    let (y, wms) = (format!("y-{}", h.tag), format!("y-wms-{}", h.tag));
    let service = json!({ "identifier": wms, "title": format!("WMS {}", h.tag), "type": "service",
                          "operatesOn": [y], "distributions": [{ "accessUrl": "https://s2.example/wms" }] });

    write_json(&h.root().join("s2.json"), json!([service]));
    h.harvest(&h.s2).await;
    let summary = h.pipeline.aggregate(Some(&h.s2)).await.unwrap();
    assert_eq!(summary.indexed, 1);
    assert!(h.memory.document(h.index(), &wms).is_some());

    write_json(&h.root().join("s2.json"), json!([h.entry(&y, &format!("Roads {}", h.tag)), service]));
    h.harvest(&h.s2).await;
    let summary = h.pipeline.aggregate(Some(&h.s2)).await.unwrap();

    assert_eq!(summary.indexed, 1);
    assert_eq!(summary.deleted, 1);
    assert!(h.memory.document(h.index(), &wms).is_none());
    let dataset = h.memory.document(h.index(), &y).expect("dataset indexed");
    let urls: Vec<&str> = dataset["distributions"]
        .as_array()
        .unwrap()
        .iter()
        .filter_map(|d| d["accessUrl"].as_str())
        .collect();
    assert!(urls.contains(&"https://s2.example/wms"));
}

#[tokio::test]
async fn shared_bucket_is_built_once_for_a_repeated_source_scope() {
    let Some(h) = harness().await else { return };
    let title = format!("Shared {}", h.tag);
    write_json(&h.root().join("s1.json"), json!([h.entry(&format!("a-{}", h.tag), &title)]));
    write_json(&h.root().join("s2.json"), json!([h.entry(&format!("b-{}", h.tag), &title)]));
    h.harvest(&h.s1).await;
    h.harvest(&h.s2).await;

    let summary = h
        .pipeline
        .aggregate_sources(&[h.s1.clone(), h.s2.clone(), h.s1.clone()])
        .await
        .unwrap();
    assert_eq!(summary.buckets, 1);
    assert_eq!(summary.indexed, 1);
    assert_eq!(summary.deleted, 1);
}
