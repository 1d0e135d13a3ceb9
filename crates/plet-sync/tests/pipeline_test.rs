//! End-to-end pipeline properties: idempotent double runs, stage
//! uniqueness, link symmetry, and dry-run write suppression.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use chrono::NaiveDate;
use plet_adapters::{FixtureBillSource, ScriptedValidator};
use plet_core::{collections, BillDetail, BillKey, BillSummary, SourceType, StageInfo};
use plet_store::{DocumentStore, MemoryStore, WriteOp};
use plet_sync::{IngestOptions, IngestPipeline, PipelineContext, RuleSet};
use serde_json::{json, Value as JsonValue};

fn workspace_root() -> PathBuf {
    Path::new(env!("CARGO_MANIFEST_DIR"))
        .join("../..")
        .canonicalize()
        .expect("workspace root")
}

fn rules() -> RuleSet {
    RuleSet::from_workspace_root(&workspace_root()).expect("workspace rule files")
}

fn housing_promise() -> JsonValue {
    json!({
        "id": "promise-housing-1",
        "text": "Build 1.4 million new homes and make affordable housing a reality in every community",
        "parties": ["Example Party"],
        "departments": ["Infrastructure Canada"],
        "keywords": [],
        "evidence_ids": []
    })
}

fn stage(id: &str, name: &str, day: u32) -> StageInfo {
    StageInfo {
        stage_id: id.to_string(),
        name: name.to_string(),
        chamber: Some("House".to_string()),
        completed_at: NaiveDate::from_ymd_opt(2026, 2, day),
    }
}

fn housing_bill(latest_activity: &str, stage_info: StageInfo) -> (BillSummary, BillDetail) {
    let key = BillKey::new(44, 1, "C-56");
    let summary = BillSummary {
        key: key.clone(),
        latest_activity: Some(latest_activity.to_string()),
    };
    let detail = BillDetail {
        key,
        title: "Affordable Housing and Groceries Act".to_string(),
        short_title: None,
        sponsor: Some("Minister of Finance".to_string()),
        departments: vec!["Finance Canada".to_string(), "Infrastructure Canada".to_string()],
        latest_major_stage: Some(stage_info.clone()),
        latest_stage: Some(stage_info),
        full_text_url: None,
    };
    (summary, detail)
}

async fn seeded_store() -> Arc<MemoryStore> {
    let store = Arc::new(MemoryStore::new());
    store
        .apply(&[WriteOp::set(
            collections::PROMISES,
            "promise-housing-1",
            housing_promise(),
        )])
        .await
        .expect("seed promise");
    store
}

fn pipeline(
    store: Arc<MemoryStore>,
    bills: FixtureBillSource,
    validator: Arc<ScriptedValidator>,
) -> IngestPipeline {
    IngestPipeline::new(PipelineContext {
        store,
        bills: Arc::new(bills),
        validator,
        archive: None,
        rules: rules(),
        polite_delay: Duration::ZERO,
        reports_root: None,
    })
}

fn royal_assent_source(latest_activity: &str) -> FixtureBillSource {
    let (summary, detail) = housing_bill(latest_activity, stage("royal-assent", "Royal assent", 20));
    let mut source = FixtureBillSource::new();
    source.push_bill(summary, Some(detail));
    source
}

#[tokio::test]
async fn double_run_is_idempotent_and_links_symmetrically() {
    let store = seeded_store().await;
    let validator = Arc::new(ScriptedValidator::new());
    validator.push_verdict(true, "stage of the promised housing program");

    let pipeline = pipeline(store.clone(), royal_assent_source("2026-02-20T09:00:00Z"), validator.clone());
    let options = IngestOptions::default();

    let first = pipeline.run_bills(&options).await.expect("first run");
    assert_eq!(first.processed, 1);
    assert_eq!(first.updated, 1);
    assert_eq!(first.errors, 0);
    assert_eq!(validator.call_count(), 1);

    // Link recorded on both sides, with the terminal-stage flag set.
    let evidence_docs = store
        .find_eq(collections::EVIDENCE, "bill_key", &json!("44-1-C-56"))
        .await
        .expect("evidence query");
    assert_eq!(evidence_docs.len(), 1);
    let evidence = &evidence_docs[0];
    let evidence_id = evidence["id"].as_str().expect("evidence id").to_string();
    assert_eq!(evidence["terminal_stage"], json!(true));
    assert_eq!(evidence["promise_ids"], json!(["promise-housing-1"]));

    let promise = store
        .get(collections::PROMISES, "promise-housing-1")
        .await
        .expect("promise get")
        .expect("promise present");
    assert_eq!(promise["evidence_ids"], json!([evidence_id]));

    // Second run over the unchanged snapshot: zero additional writes.
    let writes_after_first = store.write_count();
    let second = pipeline.run_bills(&options).await.expect("second run");
    assert_eq!(second.skipped, 1);
    assert_eq!(second.processed, 0);
    assert_eq!(store.write_count(), writes_after_first);
    // And no further validator spend either.
    assert_eq!(validator.call_count(), 1);
}

#[tokio::test]
async fn repoll_with_new_activity_but_same_stage_creates_no_duplicate() {
    let store = seeded_store().await;
    let validator = Arc::new(ScriptedValidator::new());
    validator.push_verdict(true, "housing measure");

    let first_pipeline = pipeline(store.clone(), royal_assent_source("2026-02-20T09:00:00Z"), validator.clone());
    first_pipeline
        .run_bills(&IngestOptions::default())
        .await
        .expect("first poll");

    // Later activity timestamp, but the completed stage has not moved.
    let second_pipeline = pipeline(store.clone(), royal_assent_source("2026-02-21T09:00:00Z"), validator.clone());
    let summary = second_pipeline
        .run_bills(&IngestOptions::default())
        .await
        .expect("second poll");

    assert_eq!(summary.processed, 1);
    assert_eq!(summary.updated, 0);
    let evidence_docs = store
        .find_eq(collections::EVIDENCE, "bill_key", &json!("44-1-C-56"))
        .await
        .expect("evidence query");
    assert_eq!(evidence_docs.len(), 1);
}

#[tokio::test]
async fn validator_rejection_blocks_the_link_on_both_sides() {
    let store = seeded_store().await;
    let validator = Arc::new(ScriptedValidator::new());
    validator.push_verdict(false, "different housing program entirely");

    let pipeline = pipeline(store.clone(), royal_assent_source("2026-02-20T09:00:00Z"), validator.clone());
    pipeline
        .run_bills(&IngestOptions::default())
        .await
        .expect("run");

    assert_eq!(validator.call_count(), 1);
    let evidence_docs = store
        .find_eq(collections::EVIDENCE, "bill_key", &json!("44-1-C-56"))
        .await
        .expect("evidence query");
    assert_eq!(evidence_docs[0]["promise_ids"], json!([]));
    let promise = store
        .get(collections::PROMISES, "promise-housing-1")
        .await
        .expect("promise get")
        .expect("promise present");
    assert_eq!(promise["evidence_ids"], json!([]));
}

#[tokio::test]
async fn validator_schema_violation_degrades_to_reject() {
    let store = seeded_store().await;
    let validator = Arc::new(ScriptedValidator::new());
    validator.push_schema_violation("free-text answer instead of JSON");

    let pipeline = pipeline(store.clone(), royal_assent_source("2026-02-20T09:00:00Z"), validator.clone());
    let summary = pipeline
        .run_bills(&IngestOptions::default())
        .await
        .expect("run");

    // The item itself still completes; only the link is withheld.
    assert_eq!(summary.errors, 0);
    let evidence_docs = store
        .find_eq(collections::EVIDENCE, "bill_key", &json!("44-1-C-56"))
        .await
        .expect("evidence query");
    assert_eq!(evidence_docs[0]["promise_ids"], json!([]));
}

#[tokio::test]
async fn dry_run_makes_the_same_decisions_but_writes_nothing() {
    let store = seeded_store().await;
    let validator = Arc::new(ScriptedValidator::new());
    validator.push_verdict(true, "housing measure");
    let writes_after_seed = store.write_count();

    let pipeline = pipeline(store.clone(), royal_assent_source("2026-02-20T09:00:00Z"), validator.clone());
    let summary = pipeline
        .run_bills(&IngestOptions {
            dry_run: true,
            ..Default::default()
        })
        .await
        .expect("dry run");

    assert!(summary.dry_run);
    assert_eq!(summary.processed, 1);
    assert_eq!(summary.updated, 1);
    // The validator still ran (same decisions as a live run)...
    assert_eq!(validator.call_count(), 1);
    // ...but nothing was persisted.
    assert_eq!(store.write_count(), writes_after_seed);
    let evidence_docs = store
        .find_eq(collections::EVIDENCE, "bill_key", &json!("44-1-C-56"))
        .await
        .expect("evidence query");
    assert!(evidence_docs.is_empty());
}

#[tokio::test]
async fn force_flag_reprocesses_an_unchanged_bill() {
    let store = seeded_store().await;
    let validator = Arc::new(ScriptedValidator::new());
    validator.push_verdict(true, "housing measure");

    let pipeline = pipeline(store.clone(), royal_assent_source("2026-02-20T09:00:00Z"), validator.clone());
    pipeline
        .run_bills(&IngestOptions::default())
        .await
        .expect("first run");

    let summary = pipeline
        .run_bills(&IngestOptions {
            force: true,
            ..Default::default()
        })
        .await
        .expect("forced run");

    // Reprocessed, but the deterministic identifier still prevents a
    // duplicate stage record.
    assert_eq!(summary.processed, 1);
    assert_eq!(summary.updated, 0);
    let evidence_docs = store
        .find_eq(collections::EVIDENCE, "bill_key", &json!("44-1-C-56"))
        .await
        .expect("evidence query");
    assert_eq!(evidence_docs.len(), 1);
}

#[tokio::test]
async fn news_item_ingest_is_idempotent_across_runs() {
    let store = seeded_store().await;
    let validator = Arc::new(ScriptedValidator::new());
    let pipeline = pipeline(store.clone(), FixtureBillSource::new(), validator);

    let items: Vec<JsonValue> = plet_adapters::read_json_file(
        workspace_root().join("fixtures/news/sample/items.json"),
    )
    .expect("news items fixture");

    let first = pipeline
        .run_items(SourceType::News, &items, false)
        .await
        .expect("first item run");
    assert_eq!(first.processed, 2);
    assert_eq!(first.updated, 2);
    assert_eq!(first.errors, 0);

    let writes_after_first = store.write_count();
    let second = pipeline
        .run_items(SourceType::News, &items, false)
        .await
        .expect("second item run");
    assert_eq!(second.skipped, 2);
    assert_eq!(second.updated, 0);
    assert_eq!(store.write_count(), writes_after_first);
}

#[tokio::test]
async fn malformed_item_is_skipped_without_aborting_the_batch() {
    let store = seeded_store().await;
    let validator = Arc::new(ScriptedValidator::new());
    let pipeline = pipeline(store.clone(), FixtureBillSource::new(), validator);

    let items = vec![
        json!({"headline": "No publication date on this one", "link": "https://news.example.org/x"}),
        json!({
            "headline": "Dated and well-formed",
            "published_at": "2026-03-04",
            "link": "https://news.example.org/y"
        }),
    ];

    let summary = pipeline
        .run_items(SourceType::News, &items, false)
        .await
        .expect("run");
    assert_eq!(summary.errors, 1);
    assert_eq!(summary.processed, 1);
    assert_eq!(summary.updated, 1);
}
