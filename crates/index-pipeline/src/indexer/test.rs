use big_s::S;
use indexhub_types::build::BuildDoc;
use indexhub_types::tasks::{IndexMode, JobStatus, Step};
use serde_json::json;

use super::*;
use crate::clients::StateSection;
use crate::test_utils::{hub, indexer_env, seed_build, TestHub};

fn indexer(hub: &TestHub, build_id: &str) -> Indexer {
    let build = hub.builds.build_json(build_id).expect("build exists");
    Indexer::new(&hub.ctx, &BuildDoc::try_from(build).unwrap(), indexer_env("prod"), None)
        .unwrap()
}

async fn step_status(hub: &TestHub, build_id: &str, index: &str, step: &str) -> Option<JobStatus> {
    hub.builds
        .read_state(build_id, StateSection::Index, index, step)
        .await
        .unwrap()
        .map(|state| state.status)
}

#[tokio::test]
async fn out_of_range_batch_size_writes_no_state() {
    let hub = hub();
    seed_build(&hub, "mynews", 10);

    let params = IndexParams { batch_size: Some(49), ..IndexParams::default() };
    let err = indexer(&hub, "mynews").run(params).await.unwrap_err();
    assert!(matches!(err, Error::BatchSizeOutOfRange(49)));

    for step in ["pre", "index", "post"] {
        assert_eq!(step_status(&hub, "mynews", "mynews", step).await, None);
    }

    let params = IndexParams { batch_size: Some(10_001), ..IndexParams::default() };
    let err = indexer(&hub, "mynews").run(params).await.unwrap_err();
    assert!(matches!(err, Error::BatchSizeOutOfRange(10_001)));
}

#[tokio::test]
async fn unordered_steps_are_refused() {
    let hub = hub();
    seed_build(&hub, "mynews", 10);

    let params = IndexParams {
        steps: Some(vec![Step::Index, Step::Pre]),
        ..IndexParams::default()
    };
    let err = indexer(&hub, "mynews").run(params).await.unwrap_err();
    assert!(matches!(err, Error::InvalidSteps));

    let params = IndexParams { steps: Some(vec![]), ..IndexParams::default() };
    let err = indexer(&hub, "mynews").run(params).await.unwrap_err();
    assert!(matches!(err, Error::EmptySteps));
}

#[tokio::test]
async fn a_full_run_indexes_the_whole_collection() {
    let hub = hub();
    seed_build(&hub, "mynews", 25_000);

    let result = indexer(&hub, "mynews").run(IndexParams::default()).await.unwrap();
    assert_eq!(result, json!({ "mynews": { "count": 25_000 } }));
    assert_eq!(hub.engine.doc_count("mynews"), 25_000);

    for step in ["pre", "index", "post"] {
        assert_eq!(
            step_status(&hub, "mynews", "mynews", step).await,
            Some(JobStatus::Succeeded),
            "step {step} should have succeeded"
        );
    }

    // the succeeded record carries the merged result so far
    let index_state = hub
        .builds
        .read_state("mynews", StateSection::Index, "mynews", "index")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(index_state.result.unwrap(), json!({ "mynews": { "count": 25_000 } }));
}

#[tokio::test]
async fn caller_supplied_ids_bound_the_run() {
    let hub = hub();
    seed_build(&hub, "mynews", 200);

    let ids: Vec<String> = (0..75).map(|i| format!("mynews-{i}")).collect();
    let params = IndexParams {
        batch_size: Some(50),
        ids: Some(ids),
        ..IndexParams::default()
    };
    let result = indexer(&hub, "mynews").run(params).await.unwrap();
    assert_eq!(result, json!({ "mynews": { "count": 75 } }));
    assert_eq!(hub.engine.doc_count("mynews"), 75);
}

#[tokio::test]
async fn mode_index_refuses_an_existing_index() {
    let hub = hub();
    seed_build(&hub, "mynews", 10);
    hub.engine.create_bare_index("mynews");
    hub.engine.put_doc("mynews", "stale", json!({ "_id": "stale" }));

    let err = indexer(&hub, "mynews").run(IndexParams::default()).await.unwrap_err();
    assert!(matches!(err, Error::IndexAlreadyExists(_)));

    // the pre step failed, and the index is unchanged
    assert_eq!(step_status(&hub, "mynews", "mynews", "pre").await, Some(JobStatus::Failed));
    assert_eq!(step_status(&hub, "mynews", "mynews", "index").await, None);
    assert_eq!(hub.engine.doc_count("mynews"), 1);
}

#[tokio::test]
async fn mode_resume_requires_and_keeps_an_existing_index() {
    let hub = hub();
    seed_build(&hub, "mynews", 10);

    let params =
        IndexParams { mode: IndexMode::Resume, ..IndexParams::default() };
    let err = indexer(&hub, "mynews").run(params.clone()).await.unwrap_err();
    assert!(matches!(err, Error::IndexMissing(_)));

    hub.engine.create_bare_index("mynews");
    let result = indexer(&hub, "mynews").run(params).await.unwrap();
    assert_eq!(result, json!({ "mynews": { "count": 10 } }));
    // creation was skipped: the bare index has no creation body
    assert_eq!(hub.engine.creation_body("mynews"), Some(serde_json::Value::Null));
}

#[tokio::test]
async fn mode_purge_recreates_unconditionally() {
    let hub = hub();
    seed_build(&hub, "mynews", 10);
    hub.engine.create_bare_index("mynews");
    hub.engine.put_doc("mynews", "stale", json!({ "_id": "stale" }));

    let params = IndexParams { mode: IndexMode::Purge, ..IndexParams::default() };
    let result = indexer(&hub, "mynews").run(params).await.unwrap();
    assert_eq!(result, json!({ "mynews": { "count": 10 } }));

    // exactly the fresh documents, no leftovers
    assert_eq!(hub.engine.doc_count("mynews"), 10);
    assert!(hub.engine.doc("mynews", "stale").is_none());
    // purge also works when the index does not exist at all
    let hub2 = crate::test_utils::hub();
    seed_build(&hub2, "mynews", 3);
    let params = IndexParams { mode: IndexMode::Purge, ..IndexParams::default() };
    indexer(&hub2, "mynews").run(params).await.unwrap();
    assert_eq!(hub2.engine.doc_count("mynews"), 3);
}

#[tokio::test]
async fn creation_body_carries_finalized_settings_and_mappings() {
    let hub = hub();
    seed_build(&hub, "mynews", 1);

    indexer(&hub, "mynews").run(IndexParams::default()).await.unwrap();
    let body = hub.engine.creation_body("mynews").unwrap();
    assert_eq!(body["settings"]["number_of_shards"], 1);
    assert_eq!(body["mappings"]["properties"]["n"]["type"], "integer");
    assert_eq!(body["mappings"]["_meta"]["build_version"], "202105261855");
    // the private hub key never reaches a modern engine
    assert!(body["mappings"].get("__hub_doc_type").is_none());
}

#[tokio::test]
async fn legacy_engines_get_typed_mappings() {
    let hub = hub();
    seed_build(&hub, "mynews", 1);
    hub.engine.set_version(6, 8);

    indexer(&hub, "mynews").run(IndexParams::default()).await.unwrap();
    let body = hub.engine.creation_body("mynews").unwrap();
    // the mapping body nests under the document type name
    assert_eq!(body["mappings"]["news"]["properties"]["n"]["type"], "integer");
    assert!(body["mappings"].get("properties").is_none());
}

#[tokio::test]
async fn a_failing_batch_fails_the_index_step() {
    let hub = hub();
    seed_build(&hub, "mynews", 5);
    hub.engine.fail_next_bulk("ConnectionReset: the server closed the connection");

    let err = indexer(&hub, "mynews").run(IndexParams::default()).await.unwrap_err();
    assert!(matches!(err, Error::BatchFailed { batch: 1, .. }));
    assert!(err.to_string().contains("ConnectionReset"));

    assert_eq!(step_status(&hub, "mynews", "mynews", "pre").await, Some(JobStatus::Succeeded));
    assert_eq!(step_status(&hub, "mynews", "mynews", "index").await, Some(JobStatus::Failed));
    // the failed step never gets a succeeded record, post never runs
    assert_eq!(step_status(&hub, "mynews", "mynews", "post").await, None);

    let state = hub
        .builds
        .read_state("mynews", StateSection::Index, "mynews", "index")
        .await
        .unwrap()
        .unwrap();
    assert!(state.err.unwrap().contains("ConnectionReset"));
}

#[tokio::test]
async fn long_failure_messages_are_truncated_in_the_record() {
    let hub = hub();
    seed_build(&hub, "mynews", 5);
    hub.engine.fail_next_bulk(&format!("ConnectionReset{}", "x".repeat(2000)));

    indexer(&hub, "mynews").run(IndexParams::default()).await.unwrap_err();
    let state = hub
        .builds
        .read_state("mynews", StateSection::Index, "mynews", "index")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(state.err.unwrap().chars().count(), 500);
}

#[tokio::test]
async fn per_document_rejections_do_not_fail_the_batch() {
    let hub = hub();
    seed_build(&hub, "mynews", 10);
    hub.engine.reject_ids(&["mynews-3", "mynews-7"]);

    let result = indexer(&hub, "mynews").run(IndexParams::default()).await.unwrap();
    // only successful writes are counted
    assert_eq!(result, json!({ "mynews": { "count": 10 } }));
    assert_eq!(hub.engine.doc_count("mynews"), 8);
    assert_eq!(step_status(&hub, "mynews", "mynews", "index").await, Some(JobStatus::Succeeded));
}

#[tokio::test]
async fn reindexing_with_purge_matches_the_source_count() {
    let hub = hub();
    seed_build(&hub, "mynews", 120);

    let params = IndexParams { batch_size: Some(50), ..IndexParams::default() };
    indexer(&hub, "mynews").run(params).await.unwrap();
    let params = IndexParams {
        batch_size: Some(50),
        mode: IndexMode::Purge,
        ..IndexParams::default()
    };
    let result = indexer(&hub, "mynews").run(params).await.unwrap();
    assert_eq!(result, json!({ "mynews": { "count": 120 } }));
    assert_eq!(hub.engine.doc_count("mynews"), 120);
}

fn seed_cold_hot(hub: &TestHub) {
    // cold: a static base of 6 docs, hot: 4 docs of which 2 overlap
    let cold_docs = (0..6)
        .map(|i| json!({ "_id": format!("doc-{i}"), "body": "cold", "extra": { "cold": true } }))
        .collect();
    hub.store.insert("target", "mynews_cold", cold_docs);
    let hot_docs = (4..8)
        .map(|i| json!({ "_id": format!("doc-{i}"), "body": "hot" }))
        .collect();
    hub.store.insert("target", "mynews_hot", hot_docs);

    hub.builds.insert_build(json!({
        "_id": "mynews_cold",
        "target_backend": "mongo",
        "target_name": "mynews_cold",
        "backend_url": "mynews_cold",
        "build_config": { "name": "mynews", "doc_type": "news" },
        "mapping": { "body": { "type": "keyword" } },
        "_meta": { "build_version": "1" }
    }));
    hub.builds.insert_build(json!({
        "_id": "mynews_hot",
        "target_backend": "mongo",
        "target_name": "mynews_hot",
        "backend_url": "mynews_hot",
        "build_config": {
            "name": "mynews",
            "doc_type": "news",
            "cold_collection": "mynews_cold"
        },
        "mapping": { "body": { "type": "text" } },
        "_meta": { "build_version": "2" }
    }));
}

#[tokio::test]
async fn cold_hot_composes_a_single_index() {
    let hub = hub();
    seed_cold_hot(&hub);

    let build = BuildDoc::try_from(hub.builds.build_json("mynews_hot").unwrap()).unwrap();
    let indexer = ColdHotIndexer::new(&hub.ctx, build, indexer_env("prod"), None).await.unwrap();
    let result = indexer.run(IndexParams::default()).await.unwrap();

    // |cold ids ∪ hot ids| documents, counted cumulatively
    assert_eq!(result, json!({ "mynews_hot": 10 }));
    assert_eq!(hub.engine.doc_count("mynews_hot"), 8);

    // hot fields override cold fields on overlap, cold-only fields survive
    let overlap = hub.engine.doc("mynews_hot", "doc-4").unwrap();
    assert_eq!(overlap["body"], "hot");
    assert_eq!(overlap["extra"]["cold"], true);
    let cold_only = hub.engine.doc("mynews_hot", "doc-0").unwrap();
    assert_eq!(cold_only["body"], "cold");

    // the composed mapping lets hot win
    let body = hub.engine.creation_body("mynews_hot").unwrap();
    assert_eq!(body["mappings"]["properties"]["body"]["type"], "text");
    assert_eq!(body["mappings"]["_meta"]["build_version"], "2");
}

#[tokio::test]
async fn cold_hot_never_runs_hot_in_index_mode() {
    let hub = hub();
    seed_cold_hot(&hub);

    let build = BuildDoc::try_from(hub.builds.build_json("mynews_hot").unwrap()).unwrap();
    let indexer = ColdHotIndexer::new(&hub.ctx, build, indexer_env("prod"), None).await.unwrap();
    indexer.run(IndexParams::default()).await.unwrap();

    // cold ran pre+index against its own record
    assert_eq!(
        step_status(&hub, "mynews_cold", "mynews_hot", "pre").await,
        Some(JobStatus::Succeeded)
    );
    // hot ran only the index step: with the index already created, a hot
    // `pre` in mode `index` would have failed the run
    assert_eq!(step_status(&hub, "mynews_hot", "mynews_hot", "pre").await, None);
    assert_eq!(
        step_status(&hub, "mynews_hot", "mynews_hot", "index").await,
        Some(JobStatus::Succeeded)
    );
}

#[tokio::test]
async fn cold_hot_requires_a_cold_collection() {
    let hub = hub();
    seed_build(&hub, "mynews", 2);

    let build = BuildDoc::try_from(hub.builds.build_json("mynews").unwrap()).unwrap();
    let err = ColdHotIndexer::new(&hub.ctx, build, indexer_env("prod"), None)
        .await
        .unwrap_err();
    assert!(err.to_string().contains("cold_collection"));
}

#[tokio::test]
async fn missing_source_collection_is_reported() {
    let hub = hub();
    seed_build(&hub, "mynews", 2);
    hub.builds.insert_build(json!({
        "_id": "ghost",
        "target_backend": "mongo",
        "target_name": "ghost",
        "backend_url": "ghost",
        "build_config": { "name": "ghost", "doc_type": "news" }
    }));

    let err = indexer(&hub, "ghost").run(IndexParams::default()).await.unwrap_err();
    assert!(matches!(err, Error::SourceCollectionMissing { .. }));
}

#[tokio::test]
async fn the_first_batch_failure_stops_the_run_short() {
    let hub = hub();
    seed_build(&hub, "mynews", 300);
    hub.engine.fail_next_bulk("ConnectionReset: the server closed the connection");

    // slow workers and a tight concurrency bound keep batches pending when
    // the first one fails
    let mut dispatcher =
        crate::test_utils::TaskDispatcher::new(hub.store.clone(), hub.engine.clone());
    dispatcher.delay = Some(std::time::Duration::from_millis(50));
    let ctx = PipelineContext { dispatcher: Arc::new(dispatcher), ..hub.ctx.clone() };

    let build = BuildDoc::try_from(hub.builds.build_json("mynews").unwrap()).unwrap();
    let mut env = indexer_env("prod");
    env.concurrency = 2;
    let indexer = Indexer::new(&ctx, &build, env, None).unwrap();

    let params = IndexParams { batch_size: Some(50), ..IndexParams::default() };
    let err = indexer.run(params).await.unwrap_err();
    assert!(matches!(err, Error::BatchFailed { .. }));

    // pending batches were canceled, so the index never caught up
    assert!(hub.engine.doc_count("mynews") < 300);
    assert_eq!(step_status(&hub, "mynews", "mynews", "index").await, Some(JobStatus::Failed));
}

#[tokio::test]
async fn registry_resolves_known_names_only() {
    let registry = IndexerRegistry::default();
    assert!(registry.get(DEFAULT_INDEXER).is_ok());
    assert!(registry.get(COLD_HOT_INDEXER).is_ok());
    let err = registry.get("hub.dataindex.indexer.DrugIndexer").unwrap_err();
    assert!(err.to_string().contains(&S("DrugIndexer")));
}
