//! End-to-end scenarios against a fully wired `Engine`, over an in-memory
//! blob store and a temp-file `redb` metadata store.

use std::collections::HashMap;
use std::sync::Arc;

use chronos_db::storage::{BlobStore, InMemoryBlobStore};
use chronos_db::{Config, Engine, RestoreTarget, WriteOptions};
use serde_json::json;
use tempfile::tempdir;

fn config(dir: &std::path::Path) -> Config {
    use chronos_db::config::{
        BlobConn, BucketSet, CounterOp, CounterRule, CounterRulesConfig, DatabaseTypeConfig, DatabasesConfig, MetadataConn,
        PredicateScope, TierAssignment,
    };

    let mut blob_conns = HashMap::new();
    blob_conns.insert(
        "default".to_string(),
        BlobConn {
            name: "default".to_string(),
            buckets: BucketSet {
                records: String::new(),
                versions: String::new(),
                content: String::new(),
                backups: String::new(),
                bucket: Some("chronos-bucket".to_string()),
            },
        },
    );

    let mut when = HashMap::new();
    when.insert("status".to_string(), json!("active"));

    Config {
        metadata_conns: vec![MetadataConn {
            name: "default".to_string(),
            path: dir.join("chronos.redb").to_string_lossy().to_string(),
            max_pool_size: 10,
        }],
        blob_conns,
        databases: DatabasesConfig {
            metadata: DatabaseTypeConfig {
                generic: Some(TierAssignment {
                    metadata_conn: "default".to_string(),
                    blob_conn: "default".to_string(),
                    resolved_db_name: "chronos_metadata".to_string(),
                    analytics_db_name: None,
                }),
                ..Default::default()
            },
            ..Default::default()
        },
        counter_rules: CounterRulesConfig {
            rules: vec![CounterRule {
                name: "active".to_string(),
                on: vec![CounterOp::Create, CounterOp::Update],
                scope: PredicateScope::Payload,
                when,
                count_unique: None,
            }],
        },
        ..Default::default()
    }
}

fn engine(dir: &std::path::Path) -> Engine {
    let mut blob_by_bucket: HashMap<String, Arc<dyn BlobStore>> = HashMap::new();
    blob_by_bucket.insert("chronos-bucket".to_string(), Arc::new(InMemoryBlobStore::new()));
    Engine::new(config(dir), blob_by_bucket).unwrap()
}

fn ctx(collection: &str) -> chronos_db::RouteContext {
    chronos_db::RouteContext {
        collection: collection.to_string(),
        database_type: Some(chronos_db::DatabaseType::Metadata),
        ..Default::default()
    }
}

#[tokio::test]
async fn scenario_create_then_read() {
    let dir = tempdir().unwrap();
    let engine = engine(dir.path());
    let ctx = ctx("users");

    let outcome = engine
        .create(&ctx, json!({"email": "a@x", "status": "active"}), WriteOptions::default())
        .await
        .unwrap();
    assert_eq!(outcome.ov, chronos_db::Ov(0));

    let latest = engine.get_latest(&ctx, outcome.id).await.unwrap().unwrap();
    assert_eq!(latest.payload["email"], json!("a@x"));
    assert_eq!(latest.system.inserted_at, latest.system.updated_at);
    assert!(!latest.deleted);
}

#[tokio::test]
async fn scenario_optimistic_conflict() {
    let dir = tempdir().unwrap();
    let engine = engine(dir.path());
    let ctx = ctx("users");

    let created = engine.create(&ctx, json!({"status": "active"}), WriteOptions::default()).await.unwrap();

    let first = engine.update(&ctx, created.id, json!({"status": "x"}), chronos_db::Ov(0), WriteOptions::default()).await;
    let second = engine.update(&ctx, created.id, json!({"status": "y"}), chronos_db::Ov(0), WriteOptions::default()).await;

    let results = [first, second];
    let ok_count = results.iter().filter(|r| r.is_ok()).count();
    assert_eq!(ok_count, 1);
    let failure = results.iter().find(|r| r.is_err()).unwrap();
    assert!(matches!(failure.as_ref().unwrap_err(), chronos_db::ChronosError::OptimisticLock { .. }));
}

#[tokio::test]
async fn scenario_enrichment_merge() {
    let dir = tempdir().unwrap();
    let engine = engine(dir.path());
    let ctx = ctx("users");

    let created = engine.create(&ctx, json!({"status": "active"}), WriteOptions::default()).await.unwrap();
    engine
        .enrich(&ctx, created.id, vec![json!({"tags": ["vip"], "meta": {"score": 1}})], Some("tagger-1"), WriteOptions::default())
        .await
        .unwrap();
    engine
        .enrich(
            &ctx,
            created.id,
            vec![json!({"tags": ["verified"], "meta": {"score": 2, "note": "n"}})],
            Some("tagger-2"),
            WriteOptions::default(),
        )
        .await
        .unwrap();

    let latest = engine.get_latest(&ctx, created.id).await.unwrap().unwrap();
    assert_eq!(latest.payload["tags"], json!(["vip", "verified"]));
    assert_eq!(latest.payload["meta"], json!({"score": 2, "note": "n"}));
    assert!(latest.system.function_ids.contains(&"tagger-1".to_string()));
    assert!(latest.system.function_ids.contains(&"tagger-2".to_string()));
}

#[tokio::test]
async fn scenario_restore_by_ov() {
    let dir = tempdir().unwrap();
    let engine = engine(dir.path());
    let ctx = ctx("users");

    let created = engine.create(&ctx, json!({"status": "v0"}), WriteOptions::default()).await.unwrap();
    engine.update(&ctx, created.id, json!({"status": "v1"}), chronos_db::Ov(0), WriteOptions::default()).await.unwrap();
    engine.update(&ctx, created.id, json!({"status": "v2"}), chronos_db::Ov(1), WriteOptions::default()).await.unwrap();
    engine.update(&ctx, created.id, json!({"status": "v3"}), chronos_db::Ov(2), WriteOptions::default()).await.unwrap();

    let new_ov = engine.restore_object(&ctx, created.id, RestoreTarget::Ov(chronos_db::Ov(1))).await.unwrap();
    assert_eq!(new_ov, chronos_db::Ov(4));

    let latest = engine.get_latest(&ctx, created.id).await.unwrap().unwrap();
    let v1 = engine.get_version(&ctx, created.id, chronos_db::Ov(1)).await.unwrap().unwrap();
    assert_eq!(latest.payload["status"], v1.payload["status"]);
}

#[tokio::test]
async fn scenario_counter_rule() {
    let dir = tempdir().unwrap();
    let engine = engine(dir.path());
    let ctx = ctx("users");

    let a = engine.create(&ctx, json!({"status": "active"}), WriteOptions::default()).await.unwrap();
    engine.create(&ctx, json!({"status": "active"}), WriteOptions::default()).await.unwrap();
    let c = engine.create(&ctx, json!({"status": "pending"}), WriteOptions::default()).await.unwrap();
    engine.update(&ctx, c.id, json!({"status": "active"}), chronos_db::Ov(0), WriteOptions::default()).await.unwrap();

    let scope = chronos_db::model::scope_key(None, "chronos_metadata", "users");
    let metadata = engine.metadata_store(&ctx).unwrap();
    let totals = metadata.get_counter_totals(&scope).unwrap().unwrap();
    assert_eq!(totals.created, 3);
    assert_eq!(totals.updated, 1);
    let rule = totals.rules.get("active").unwrap();
    assert_eq!(rule.created, 2);
    assert_eq!(rule.updated, 1);

    let _ = a;
}

#[tokio::test]
async fn scenario_fallback_replay_on_transient_failure() {
    // A failing blob store that errors on the first put only, grounded on
    // the same one-shot-failure shape used to drive fallback tests in
    // `src/fallback/wrapper.rs`.
    use async_trait::async_trait;
    use chronos_db::storage::{HeadResult, ListPage, PutResult};
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct FlakyOnce {
        inner: InMemoryBlobStore,
        calls: AtomicUsize,
    }

    #[async_trait]
    impl BlobStore for FlakyOnce {
        async fn put_json(&self, bucket: &str, key: &str, value: &serde_json::Value) -> chronos_db::Result<PutResult> {
            if self.calls.fetch_add(1, Ordering::SeqCst) == 0 {
                return Err(chronos_db::ChronosError::txn("injected outage"));
            }
            self.inner.put_json(bucket, key, value).await
        }
        async fn put_raw(&self, bucket: &str, key: &str, bytes: Vec<u8>, content_type: Option<&str>) -> chronos_db::Result<PutResult> {
            self.inner.put_raw(bucket, key, bytes, content_type).await
        }
        async fn get(&self, bucket: &str, key: &str) -> chronos_db::Result<Vec<u8>> {
            self.inner.get(bucket, key).await
        }
        async fn head(&self, bucket: &str, key: &str) -> chronos_db::Result<HeadResult> {
            self.inner.head(bucket, key).await
        }
        async fn del(&self, bucket: &str, key: &str) -> chronos_db::Result<()> {
            self.inner.del(bucket, key).await
        }
        async fn list(&self, bucket: &str, prefix: &str, max_keys: usize, continuation_token: Option<&str>) -> chronos_db::Result<ListPage> {
            self.inner.list(bucket, prefix, max_keys, continuation_token).await
        }
        async fn presign_get(&self, bucket: &str, key: &str, ttl_seconds: u64) -> chronos_db::Result<String> {
            self.inner.presign_get(bucket, key, ttl_seconds).await
        }
        async fn copy(&self, bucket: &str, src_key: &str, dst_key: &str) -> chronos_db::Result<()> {
            self.inner.copy(bucket, src_key, dst_key).await
        }
    }

    let dir = tempdir().unwrap();
    let mut blob_by_bucket: HashMap<String, Arc<dyn BlobStore>> = HashMap::new();
    blob_by_bucket.insert(
        "chronos-bucket".to_string(),
        Arc::new(FlakyOnce { inner: InMemoryBlobStore::new(), calls: AtomicUsize::new(0) }),
    );
    let mut cfg = config(dir.path());
    cfg.fallback.base_delay_ms = 10;
    cfg.fallback.poll_interval_ms = 20;
    let engine = Arc::new(Engine::new(cfg, blob_by_bucket).unwrap());
    let ctx = ctx("users");

    let outcome = engine.execute_create(&ctx, json!({"status": "active"}), None).await.unwrap();
    let request_id = match outcome {
        chronos_db::fallback::ExecuteOutcome::Queued { request_id } => request_id,
        chronos_db::fallback::ExecuteOutcome::Completed(_) => panic!("expected the first attempt to be queued"),
    };

    let worker = engine.spawn_fallback_worker();
    tokio::time::sleep(std::time::Duration::from_millis(500)).await;
    worker.stop().await;

    let scope = chronos_db::model::scope_key(None, "chronos_metadata", "users");
    let metadata = engine.metadata_store(&ctx).unwrap();
    assert!(metadata.get_fallback_op(request_id).unwrap().is_none(), "op should be drained from the queue after replay");
    let totals = metadata.get_counter_totals(&scope).unwrap().unwrap();
    assert_eq!(totals.created, 1);
}
