//! Top-level `Engine`: the explicit, constructed replacement for the
//! "global singleton configuration" anti-pattern (`spec.md` §9). Wires the
//! router, per-connection stores, the write pipeline, the restore engine,
//! and the fallback queue/worker behind one façade.
//!
//! Blob batching (`optimizer::WriteOptimizer`) is deliberately NOT threaded
//! through the per-record commit path: the commit protocol (`spec.md` §4.6
//! step 5, "write blob before index update") needs the blob put to have
//! completed before the head commit observes it, and a debounced write
//! would break that ordering for the call that most needs it. The
//! optimizer is exposed as a standalone utility for bulk/backfill paths
//! instead (see [`Engine::optimizer`]).

use std::collections::HashMap;
use std::path::Path;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use serde_json::Value;

use crate::config::Config;
use crate::error::{ChronosError, NotFoundError, Result};
use crate::fallback::{self, ExecuteOutcome, ReplayAdapter, Worker};
use crate::model::{scope_key, FallbackOp, FallbackOpType};
use crate::optimizer::WriteOptimizer;
use crate::pipeline::{CommitOutcome, RecordView, WriteOptions, WritePipeline};
use crate::restore::{self, RestoreCollectionReport, RestoreTarget};
use crate::router::{ResolvedRoute, RouteContext, Router};
use crate::storage::{CompositeBlobStore, MetadataStore, RedbMetadataStore};
use crate::types::{ItemId, Ov, RequestId, Timestamp};

/// The composed engine: owns routing, storage handles, and the write
/// pipeline/restore/fallback building blocks layered on top of them.
pub struct Engine {
    config: Arc<Config>,
    router: Router,
    metadata_by_path: Mutex<HashMap<String, Arc<dyn MetadataStore>>>,
    blob: Arc<CompositeBlobStore>,
    optimizer: Arc<WriteOptimizer>,
}

impl Engine {
    /// `blob_by_bucket` maps every bucket name referenced by `config` to an
    /// already-configured blob handle — provisioning credentials/clients is
    /// an out-of-scope external collaborator (`storage::ObjectStoreBlobStore`
    /// doc comment). Metadata connections are opened lazily since `redb`
    /// needs only a local path, no credentials.
    pub fn new(config: Config, blob_by_bucket: HashMap<String, Arc<dyn crate::storage::BlobStore>>) -> Result<Self> {
        config.validate().map_err(|reason| ChronosError::config(reason.to_string()))?;
        let config = Arc::new(config);
        let router = Router::new(config.clone());
        let blob = Arc::new(CompositeBlobStore::new(blob_by_bucket));
        let optimizer = Arc::new(WriteOptimizer::new(config.write_optimization.clone(), blob.clone(), Arc::new(|_, _, _| Ok(()))));
        Ok(Self {
            config,
            router,
            metadata_by_path: Mutex::new(HashMap::new()),
            blob,
            optimizer,
        })
    }

    pub fn optimizer(&self) -> &Arc<WriteOptimizer> {
        &self.optimizer
    }

    pub fn router(&self) -> &Router {
        &self.router
    }

    /// Returns the metadata store backing `ctx`'s resolved route. An escape
    /// hatch for diagnostics and admin tooling that need to inspect counter
    /// totals, dead letters, or fallback ops directly.
    pub fn metadata_store(&self, ctx: &RouteContext) -> Result<Arc<dyn MetadataStore>> {
        let resolved = self.router.route(ctx)?;
        self.metadata_for(&resolved.metadata_path)
    }

    fn metadata_for(&self, path: &str) -> Result<Arc<dyn MetadataStore>> {
        let mut guard = self.metadata_by_path.lock().expect("metadata registry mutex poisoned");
        if let Some(store) = guard.get(path) {
            return Ok(store.clone());
        }
        let store: Arc<dyn MetadataStore> = Arc::new(RedbMetadataStore::open(Path::new(path))?);
        guard.insert(path.to_string(), store.clone());
        Ok(store)
    }

    fn pipeline_for(&self, ctx: &RouteContext) -> Result<(WritePipeline, ResolvedRoute)> {
        let resolved = self.router.route(ctx)?;
        let metadata = self.metadata_for(&resolved.metadata_path)?;
        let map = self.config.collection_maps.get(&ctx.collection).cloned().unwrap_or_default();
        let scope = scope_key(ctx.tenant_id.as_deref(), &resolved.resolved_db_name, &ctx.collection);
        let pipeline = WritePipeline::new(
            metadata,
            self.blob.clone(),
            resolved.resolved_buckets.clone(),
            ctx.collection.clone(),
            map,
            self.config.counter_rules.clone(),
            scope,
            self.config.dev_shadow.clone(),
        );
        Ok((pipeline, resolved))
    }

    pub async fn create(&self, ctx: &RouteContext, data: Value, opts: WriteOptions) -> Result<CommitOutcome> {
        let (pipeline, _) = self.pipeline_for(ctx)?;
        pipeline.create(data, opts).await
    }

    pub async fn update(&self, ctx: &RouteContext, id: ItemId, data: Value, expected_ov: Ov, opts: WriteOptions) -> Result<CommitOutcome> {
        let (pipeline, _) = self.pipeline_for(ctx)?;
        pipeline.update(id, data, expected_ov, opts).await
    }

    pub async fn delete(&self, ctx: &RouteContext, id: ItemId, expected_ov: Ov, opts: WriteOptions) -> Result<CommitOutcome> {
        let (pipeline, _) = self.pipeline_for(ctx)?;
        pipeline.delete(id, expected_ov, opts).await
    }

    pub async fn enrich(&self, ctx: &RouteContext, id: ItemId, patches: Vec<Value>, function_id: Option<&str>, opts: WriteOptions) -> Result<CommitOutcome> {
        let (pipeline, _) = self.pipeline_for(ctx)?;
        pipeline.enrich(id, patches, function_id, opts).await
    }

    pub async fn get_latest(&self, ctx: &RouteContext, id: ItemId) -> Result<Option<RecordView>> {
        let (pipeline, _) = self.pipeline_for(ctx)?;
        pipeline.get_latest(id).await
    }

    pub async fn get_version(&self, ctx: &RouteContext, id: ItemId, ov: Ov) -> Result<Option<RecordView>> {
        let (pipeline, _) = self.pipeline_for(ctx)?;
        pipeline.get_version(id, ov).await
    }

    pub async fn get_as_of(&self, ctx: &RouteContext, id: ItemId, at: Timestamp) -> Result<Option<RecordView>> {
        let (pipeline, _) = self.pipeline_for(ctx)?;
        pipeline.get_as_of(id, at).await
    }

    pub async fn restore_object(&self, ctx: &RouteContext, id: ItemId, target: RestoreTarget) -> Result<Ov> {
        let (pipeline, _) = self.pipeline_for(ctx)?;
        restore::restore_object(&pipeline, id, target).await
    }

    pub async fn restore_collection(&self, ctx: &RouteContext, at: Timestamp) -> Result<RestoreCollectionReport> {
        let (pipeline, _) = self.pipeline_for(ctx)?;
        restore::restore_collection(&pipeline, at).await
    }

    /// Runs `create`/`update`/`delete`/`enrich`/`restore_object` through the
    /// fallback wrapper (`spec.md` §4.9): on a retryable failure the call is
    /// durably queued instead of propagating the error.
    pub async fn execute_create(&self, ctx: &RouteContext, data: Value, request_id: Option<RequestId>) -> Result<ExecuteOutcome<CommitOutcome>> {
        let (pipeline, _) = self.pipeline_for(ctx)?;
        let metadata = self.metadata_for(&self.router.route(ctx)?.metadata_path)?;
        fallback::execute(
            metadata.as_ref(),
            &self.config.fallback,
            FallbackOpType::Create,
            serde_json::to_value(ctx_snapshot(ctx)).unwrap_or(Value::Null),
            data.clone(),
            Value::Null,
            request_id,
            move || async move { pipeline.create(data, WriteOptions::default()).await },
        )
        .await
    }

    pub async fn execute_update(
        &self,
        ctx: &RouteContext,
        id: ItemId,
        data: Value,
        expected_ov: Ov,
        request_id: Option<RequestId>,
    ) -> Result<ExecuteOutcome<CommitOutcome>> {
        let (pipeline, _) = self.pipeline_for(ctx)?;
        let metadata = self.metadata_for(&self.router.route(ctx)?.metadata_path)?;
        let opts = serde_json::to_value(ReplayMeta { id, expected_ov: Some(expected_ov), function_id: None, restore_target: None })
            .unwrap_or(Value::Null);
        fallback::execute(
            metadata.as_ref(),
            &self.config.fallback,
            FallbackOpType::Update,
            serde_json::to_value(ctx_snapshot(ctx)).unwrap_or(Value::Null),
            data.clone(),
            opts,
            request_id,
            move || async move { pipeline.update(id, data, expected_ov, WriteOptions::default()).await },
        )
        .await
    }

    pub async fn execute_delete(
        &self,
        ctx: &RouteContext,
        id: ItemId,
        expected_ov: Ov,
        request_id: Option<RequestId>,
    ) -> Result<ExecuteOutcome<CommitOutcome>> {
        let (pipeline, _) = self.pipeline_for(ctx)?;
        let metadata = self.metadata_for(&self.router.route(ctx)?.metadata_path)?;
        let opts = serde_json::to_value(ReplayMeta { id, expected_ov: Some(expected_ov), function_id: None, restore_target: None })
            .unwrap_or(Value::Null);
        fallback::execute(
            metadata.as_ref(),
            &self.config.fallback,
            FallbackOpType::Delete,
            serde_json::to_value(ctx_snapshot(ctx)).unwrap_or(Value::Null),
            Value::Null,
            opts,
            request_id,
            move || async move { pipeline.delete(id, expected_ov, WriteOptions::default()).await },
        )
        .await
    }

    pub async fn execute_enrich(
        &self,
        ctx: &RouteContext,
        id: ItemId,
        patches: Vec<Value>,
        function_id: Option<String>,
        request_id: Option<RequestId>,
    ) -> Result<ExecuteOutcome<CommitOutcome>> {
        let (pipeline, _) = self.pipeline_for(ctx)?;
        let metadata = self.metadata_for(&self.router.route(ctx)?.metadata_path)?;
        let opts = serde_json::to_value(ReplayMeta { id, expected_ov: None, function_id: function_id.clone(), restore_target: None })
            .unwrap_or(Value::Null);
        let payload = Value::Array(patches.clone());
        let fn_id = function_id;
        fallback::execute(
            metadata.as_ref(),
            &self.config.fallback,
            FallbackOpType::Enrich,
            serde_json::to_value(ctx_snapshot(ctx)).unwrap_or(Value::Null),
            payload,
            opts,
            request_id,
            move || async move { pipeline.enrich(id, patches, fn_id.as_deref(), WriteOptions::default()).await },
        )
        .await
    }

    pub async fn execute_restore_object(
        &self,
        ctx: &RouteContext,
        id: ItemId,
        target: RestoreTarget,
        request_id: Option<RequestId>,
    ) -> Result<ExecuteOutcome<Ov>> {
        let (pipeline, _) = self.pipeline_for(ctx)?;
        let metadata = self.metadata_for(&self.router.route(ctx)?.metadata_path)?;
        let opts = serde_json::to_value(ReplayMeta { id, expected_ov: None, function_id: None, restore_target: Some(target) })
            .unwrap_or(Value::Null);
        fallback::execute(
            metadata.as_ref(),
            &self.config.fallback,
            FallbackOpType::Restore,
            serde_json::to_value(ctx_snapshot(ctx)).unwrap_or(Value::Null),
            Value::Null,
            opts,
            request_id,
            move || async move { restore::restore_object(&pipeline, id, target).await },
        )
        .await
    }

    /// Spawns the fallback worker as a background task; returns a handle
    /// whose `stop` drains in-flight replays cooperatively.
    pub fn spawn_fallback_worker(self: &Arc<Self>) -> Arc<Worker> {
        let adapter: Arc<dyn ReplayAdapter> = self.clone();
        let metadata_path = self.config.metadata_conns.first().map(|c| c.path.clone());
        let metadata = metadata_path
            .and_then(|p| self.metadata_for(&p).ok())
            .expect("at least one metadata connection must be configured");
        let worker = Arc::new(Worker::new(metadata, adapter, self.config.fallback.clone()));
        let run_handle = worker.clone();
        tokio::spawn(async move { run_handle.run().await });
        worker
    }
}

/// Minimal JSON-serializable snapshot of a route context, for fallback
/// replay (`FallbackOp.ctx`).
#[derive(serde::Serialize, serde::Deserialize)]
struct RouteContextSnapshot {
    db_name: Option<String>,
    collection: String,
    tenant_id: Option<String>,
}

fn ctx_snapshot(ctx: &RouteContext) -> RouteContextSnapshot {
    RouteContextSnapshot {
        db_name: ctx.db_name.clone(),
        collection: ctx.collection.clone(),
        tenant_id: ctx.tenant_id.clone(),
    }
}

/// Everything a replay needs beyond `op.payload` to reconstruct the
/// original call: the target item, the optimistic-lock precondition, and
/// the op-specific extras (`enrich`'s function id, `restore`'s target).
#[derive(serde::Serialize, serde::Deserialize)]
struct ReplayMeta {
    id: ItemId,
    expected_ov: Option<Ov>,
    function_id: Option<String>,
    restore_target: Option<RestoreTarget>,
}

#[async_trait]
impl ReplayAdapter for Engine {
    async fn replay(&self, op: &FallbackOp) -> Result<()> {
        let snapshot: RouteContextSnapshot =
            serde_json::from_value(op.ctx.clone()).map_err(|e| crate::error::StorageError::serialization(e.to_string()))?;
        let ctx = RouteContext {
            db_name: snapshot.db_name,
            collection: snapshot.collection,
            tenant_id: snapshot.tenant_id,
            ..Default::default()
        };

        if op.op_type == FallbackOpType::Create {
            self.create(&ctx, op.payload.clone(), WriteOptions::default()).await?;
            return Ok(());
        }

        let meta: ReplayMeta =
            serde_json::from_value(op.opts.clone()).map_err(|e| crate::error::StorageError::serialization(e.to_string()))?;
        match op.op_type {
            FallbackOpType::Create => unreachable!("handled above"),
            FallbackOpType::Update => {
                let expected_ov = meta.expected_ov.ok_or_else(|| ChronosError::from(NotFoundError::item(meta.id)))?;
                self.update(&ctx, meta.id, op.payload.clone(), expected_ov, WriteOptions::default()).await?;
            }
            FallbackOpType::Delete => {
                let expected_ov = meta.expected_ov.ok_or_else(|| ChronosError::from(NotFoundError::item(meta.id)))?;
                self.delete(&ctx, meta.id, expected_ov, WriteOptions::default()).await?;
            }
            FallbackOpType::Enrich => {
                let patches: Vec<Value> = serde_json::from_value(op.payload.clone())
                    .map_err(|e| crate::error::StorageError::serialization(e.to_string()))?;
                self.enrich(&ctx, meta.id, patches, meta.function_id.as_deref(), WriteOptions::default()).await?;
            }
            FallbackOpType::Restore => {
                let target = meta.restore_target.ok_or_else(|| ChronosError::from(NotFoundError::item(meta.id)))?;
                self.restore_object(&ctx, meta.id, target).await?;
            }
        }
        Ok(())
    }
}
