//! Versioned write pipeline (`spec.md` §4.6): `create`/`update`/`delete`/
//! `enrich` over a resolved `(metadata store, blob store, buckets,
//! collection)`, plus the read operations `getLatest`/`getVersion`/
//! `getAsOf`/`listByMeta`.
//!
//! Commit protocol per record: validate → acquire lock → externalize base64
//! properties → allocate `cv` → write the JSON blob → commit head+version
//! transactionally → bump counters (best-effort) → release lock.

pub mod lock;

use std::sync::Arc;

use serde_json::Value;
use tracing::instrument;

use crate::blob_key;
use crate::config::{CollectionMap, CounterRulesConfig, DevShadowConfig, ResolvedBuckets};
use crate::counters;
use crate::error::{ChronosError, NotFoundError, Result};
use crate::metadata_map::{self, MappedPayload};
use crate::model::{FullShadow, Head, Version};
use crate::storage::{BlobStore, MetadataStore};
use crate::system::{deep_merge, Lineage, SystemHeader};
use crate::types::{ActorId, Cv, ItemId, Ov, Timestamp};

pub use crate::config::CounterOp;

/// Outcome of a successful commit (`spec.md` §4.6 return shapes, unified).
#[derive(Clone, Debug, PartialEq)]
pub struct CommitOutcome {
    pub id: ItemId,
    pub ov: Ov,
    pub cv: Cv,
    pub at: Timestamp,
}

/// A record as read back through `getLatest`/`getVersion`/`getAsOf`: the
/// sanitized payload (base64 properties replaced by ref-objects) plus the
/// lifecycle header.
#[derive(Clone, Debug, PartialEq)]
pub struct RecordView {
    pub id: ItemId,
    pub ov: Ov,
    pub cv: Cv,
    pub payload: Value,
    pub system: SystemHeader,
    pub deleted: bool,
}

/// Per-call write options. `actor`/`reason` are audit-only: they are not
/// persisted on any entity in the data model, only attached to the tracing
/// span for this commit.
#[derive(Clone, Debug, Default)]
pub struct WriteOptions {
    pub actor: Option<ActorId>,
    pub reason: Option<String>,
    pub lineage: Option<Lineage>,
}

/// Filter closure passed to `list_by_meta` — a paginated query over head
/// `metaIndexed`, never a full query language (`spec.md` §1 Non-goals).
pub type MetaFilter<'a> = dyn Fn(&Value) -> bool + Send + Sync + 'a;

/// The versioned write pipeline over one resolved `(db, collection)`.
pub struct WritePipeline {
    metadata: Arc<dyn MetadataStore>,
    blob: Arc<dyn BlobStore>,
    buckets: ResolvedBuckets,
    collection: String,
    map: CollectionMap,
    counter_rules: CounterRulesConfig,
    scope_key: String,
    dev_shadow: DevShadowConfig,
}

impl WritePipeline {
    pub fn new(
        metadata: Arc<dyn MetadataStore>,
        blob: Arc<dyn BlobStore>,
        buckets: ResolvedBuckets,
        collection: impl Into<String>,
        map: CollectionMap,
        counter_rules: CounterRulesConfig,
        scope_key: impl Into<String>,
        dev_shadow: DevShadowConfig,
    ) -> Self {
        Self {
            metadata,
            blob,
            buckets,
            collection: collection.into(),
            map,
            counter_rules,
            scope_key: scope_key.into(),
            dev_shadow,
        }
    }

    #[instrument(skip(self, payload, opts), fields(collection = %self.collection))]
    pub async fn create(&self, payload: Value, opts: WriteOptions) -> Result<CommitOutcome> {
        let now = Timestamp::now();
        let id = ItemId::new();
        let system = SystemHeader::on_create(now, opts.lineage);
        self.write_version(id, None, payload, system, CounterOp::Create, now).await
    }

    #[instrument(skip(self, payload, opts), fields(collection = %self.collection, %id, %expected_ov))]
    pub async fn update(&self, id: ItemId, payload: Value, expected_ov: Ov, opts: WriteOptions) -> Result<CommitOutcome> {
        let _ = opts;
        let now = Timestamp::now();
        let current = self
            .metadata
            .get_head(&self.collection, id)?
            .ok_or_else(|| ChronosError::from(NotFoundError::item(id)))?;
        let system = current.system.on_update(now, None);
        self.write_version(id, Some(expected_ov), payload, system, CounterOp::Update, now)
            .await
    }

    #[instrument(skip(self, opts), fields(collection = %self.collection, %id, %expected_ov))]
    pub async fn delete(&self, id: ItemId, expected_ov: Ov, opts: WriteOptions) -> Result<CommitOutcome> {
        let _ = opts;
        let now = Timestamp::now();
        let current = self
            .metadata
            .get_head(&self.collection, id)?
            .ok_or_else(|| ChronosError::from(NotFoundError::item(id)))?;
        let system = current.system.on_delete(now);
        let payload = self.fetch_record_payload(&current.json_key).await?;
        self.write_version(id, Some(expected_ov), payload, system, CounterOp::Delete, now)
            .await
    }

    /// Applies one or more patches, in order, via deep-merge-with-array-union
    /// (`spec.md` §4.5). The caller batches patches to get a deterministic
    /// merge order.
    #[instrument(skip(self, patches, opts), fields(collection = %self.collection, %id))]
    pub async fn enrich(&self, id: ItemId, patches: Vec<Value>, function_id: Option<&str>, opts: WriteOptions) -> Result<CommitOutcome> {
        let _ = opts;
        let now = Timestamp::now();
        let owner = lock::acquire(self.metadata.as_ref(), &self.collection, id, lock::DEFAULT_LOCK_TTL_MS).await?;

        let result = async {
            let current = self
                .metadata
                .get_head(&self.collection, id)?
                .ok_or_else(|| ChronosError::from(NotFoundError::item(id)))?;
            let mut payload = self.fetch_record_payload(&current.json_key).await?;
            for patch in &patches {
                deep_merge(&mut payload, patch);
            }
            let mut system = current.system.on_update(now, None);
            if let Some(fid) = function_id {
                system.record_function_id(fid);
            }
            self.commit_locked(id, Some(current.ov), payload, system, CounterOp::Update, now)
                .await
        }
        .await;

        lock::release(self.metadata.as_ref(), &self.collection, id, &owner).await;
        result
    }

    async fn write_version(
        &self,
        id: ItemId,
        expected_ov: Option<Ov>,
        payload: Value,
        system: SystemHeader,
        op: CounterOp,
        now: Timestamp,
    ) -> Result<CommitOutcome> {
        let owner = lock::acquire(self.metadata.as_ref(), &self.collection, id, lock::DEFAULT_LOCK_TTL_MS).await?;
        let result = self.commit_locked(id, expected_ov, payload, system, op, now).await;
        lock::release(self.metadata.as_ref(), &self.collection, id, &owner).await;
        result
    }

    /// Steps 1, 3–8 of the commit protocol; the caller holds the record lock.
    async fn commit_locked(
        &self,
        id: ItemId,
        expected_ov: Option<Ov>,
        payload: Value,
        system: SystemHeader,
        op: CounterOp,
        now: Timestamp,
    ) -> Result<CommitOutcome> {
        let meta_indexed = metadata_map::extract_indexed(&self.map, &payload);
        metadata_map::validate_required(&self.map, &meta_indexed)?;

        let new_ov = match expected_ov {
            Some(ov) => ov.next(),
            None => Ov::zero(),
        };

        let mut mapped = metadata_map::externalize_base64_props(&self.map, &payload)?;
        self.put_externalized(id, new_ov, &mut mapped).await?;

        let cv = self.metadata.next_cv(&self.collection)?;
        let json_key = blob_key::build_record_key(&self.collection, id, new_ov);
        let record_value = attach_system(mapped.sanitized_payload.clone(), &system);

        if let Err(e) = self.blob.put_json(&self.buckets.records, &json_key, &record_value).await {
            self.rollback_externalized(&mapped).await;
            return Err(e);
        }

        let deleted = matches!(op, CounterOp::Delete);
        let full_shadow = self.build_shadow(&record_value, now);

        let head = Head {
            id,
            ov: new_ov,
            cv,
            meta_indexed: meta_indexed.clone(),
            json_key: json_key.clone(),
            deleted,
            deleted_at: if deleted { Some(now) } else { None },
            full_shadow,
            system: system.clone(),
        };
        let version = Version {
            item_id: id,
            ov: new_ov,
            cv,
            json_key,
            meta_indexed: meta_indexed.clone(),
            committed_at: now,
            system,
            deleted,
        };

        match expected_ov {
            None => self.metadata.commit_create(&self.collection, head, version)?,
            Some(ov) => self.metadata.commit_mutation(&self.collection, id, ov, head, version)?,
        }

        if let Err(e) = counters::record_operation(
            self.metadata.as_ref(),
            &self.counter_rules,
            &self.scope_key,
            op,
            &meta_indexed,
            &mapped.sanitized_payload,
            now,
        ) {
            tracing::warn!(error = %e, %id, "counter bump failed");
        }

        Ok(CommitOutcome { id, ov: new_ov, cv, at: now })
    }

    async fn put_externalized(&self, id: ItemId, ov: Ov, mapped: &mut MappedPayload) -> Result<()> {
        let mut written = Vec::new();
        for ext in mapped.externalized.clone() {
            let blob_key = blob_key::build_content_key(&self.collection, &ext.prop, id, ov, false);
            if let Err(e) = self
                .blob
                .put_raw(&self.buckets.content, &blob_key, ext.bytes.clone(), Some(&ext.content_type))
                .await
            {
                self.delete_written(&written).await;
                return Err(e);
            }
            written.push(blob_key.clone());

            let text_key = if ext.is_text {
                let key = blob_key::build_content_key(&self.collection, &ext.prop, id, ov, true);
                if let Err(e) = self.blob.put_raw(&self.buckets.content, &key, ext.bytes.clone(), Some("text/plain")).await {
                    self.delete_written(&written).await;
                    return Err(e);
                }
                written.push(key.clone());
                Some(key)
            } else {
                None
            };

            set_ref(&mut mapped.sanitized_payload, &ext.prop, &self.buckets.content, &blob_key, text_key);
        }
        Ok(())
    }

    async fn delete_written(&self, keys: &[String]) {
        for key in keys {
            let _ = self.blob.del(&self.buckets.content, key).await;
        }
    }

    async fn rollback_externalized(&self, mapped: &MappedPayload) {
        for ext in &mapped.externalized {
            if let Some(obj) = lookup_ref(&mapped.sanitized_payload, &ext.prop) {
                if let Some(key) = obj.get("blobKey").and_then(Value::as_str) {
                    let _ = self.blob.del(&self.buckets.content, key).await;
                }
                if let Some(key) = obj.get("textKey").and_then(Value::as_str) {
                    let _ = self.blob.del(&self.buckets.content, key).await;
                }
            }
        }
    }

    fn build_shadow(&self, record_value: &Value, now: Timestamp) -> Option<FullShadow> {
        if !self.dev_shadow.enabled {
            return None;
        }
        let bytes = serde_json::to_vec(record_value).ok()?;
        if bytes.len() > self.dev_shadow.max_bytes_per_doc {
            return None;
        }
        Some(FullShadow { at: now, bytes })
    }

    async fn fetch_record_payload(&self, json_key: &str) -> Result<Value> {
        let bytes = self.blob.get(&self.buckets.records, json_key).await?;
        let mut value: Value = serde_json::from_slice(&bytes)
            .map_err(|e| crate::error::StorageError::serialization(e.to_string()))?;
        if let Some(obj) = value.as_object_mut() {
            obj.remove("_system");
        }
        Ok(value)
    }

    async fn hydrate(&self, head: &Head) -> Result<RecordView> {
        let payload = self.fetch_record_payload(&head.json_key).await?;
        Ok(RecordView {
            id: head.id,
            ov: head.ov,
            cv: head.cv,
            payload,
            system: head.system.clone(),
            deleted: head.deleted,
        })
    }

    pub async fn get_latest(&self, id: ItemId) -> Result<Option<RecordView>> {
        match self.metadata.get_head(&self.collection, id)? {
            Some(head) => Ok(Some(self.hydrate(&head).await?)),
            None => Ok(None),
        }
    }

    pub async fn get_version(&self, id: ItemId, ov: Ov) -> Result<Option<RecordView>> {
        match self.metadata.get_version(&self.collection, id, ov)? {
            Some(version) => {
                let payload = self.fetch_record_payload(&version.json_key).await?;
                Ok(Some(RecordView {
                    id: version.item_id,
                    ov: version.ov,
                    cv: version.cv,
                    payload,
                    system: version.system,
                    deleted: version.deleted,
                }))
            }
            None => Ok(None),
        }
    }

    pub async fn get_as_of(&self, id: ItemId, at: Timestamp) -> Result<Option<RecordView>> {
        match self.metadata.get_version_as_of(&self.collection, id, at)? {
            Some(version) => {
                let payload = self.fetch_record_payload(&version.json_key).await?;
                Ok(Some(RecordView {
                    id: version.item_id,
                    ov: version.ov,
                    cv: version.cv,
                    payload,
                    system: version.system,
                    deleted: version.deleted,
                }))
            }
            None => Ok(None),
        }
    }

    /// Paginated scan over head `metaIndexed`, filtered in-process — the
    /// core does simple metadata filters, not a query planner.
    pub fn list_by_meta(&self, filter: &MetaFilter<'_>, limit: usize, after_id: Option<ItemId>) -> Result<Vec<Head>> {
        let mut out = Vec::new();
        let mut cursor = after_id;
        loop {
            let page = self.metadata.list_heads(&self.collection, 256, cursor)?;
            if page.is_empty() {
                break;
            }
            cursor = page.last().map(|h| h.id);
            for head in page {
                if filter(&head.meta_indexed) {
                    out.push(head);
                    if out.len() >= limit {
                        return Ok(out);
                    }
                }
            }
        }
        Ok(out)
    }

    pub(crate) fn metadata(&self) -> &Arc<dyn MetadataStore> {
        &self.metadata
    }

    pub(crate) fn blob(&self) -> &Arc<dyn BlobStore> {
        &self.blob
    }

    pub(crate) fn buckets(&self) -> &ResolvedBuckets {
        &self.buckets
    }

    pub(crate) fn collection(&self) -> &str {
        &self.collection
    }

    pub(crate) fn counter_rules(&self) -> &CounterRulesConfig {
        &self.counter_rules
    }

    pub(crate) fn scope_key(&self) -> &str {
        &self.scope_key
    }
}

fn attach_system(mut payload: Value, system: &SystemHeader) -> Value {
    if let Some(obj) = payload.as_object_mut() {
        obj.insert(
            "_system".to_string(),
            serde_json::to_value(system).expect("SystemHeader always serializes"),
        );
    }
    payload
}

fn set_ref(payload: &mut Value, prop: &str, content_bucket: &str, blob_key: &str, text_key: Option<String>) {
    let mut ref_obj = serde_json::Map::new();
    ref_obj.insert("contentBucket".to_string(), Value::String(content_bucket.to_string()));
    ref_obj.insert("blobKey".to_string(), Value::String(blob_key.to_string()));
    if let Some(tk) = text_key {
        ref_obj.insert("textKey".to_string(), Value::String(tk));
    }
    let mut wrapper = serde_json::Map::new();
    wrapper.insert("ref".to_string(), Value::Object(ref_obj));
    set_nested(payload, prop, Value::Object(wrapper));
}

fn set_nested(payload: &mut Value, path: &str, value: Value) {
    let Some(obj) = payload.as_object_mut() else { return };
    let mut segments = path.splitn(2, '.');
    let Some(first) = segments.next() else { return };
    match segments.next() {
        Some(rest) => {
            let entry = obj.entry(first.to_string()).or_insert_with(|| Value::Object(Default::default()));
            if !entry.is_object() {
                *entry = Value::Object(Default::default());
            }
            set_nested(entry, rest, value);
        }
        None => {
            obj.insert(first.to_string(), value);
        }
    }
}

fn lookup_ref<'a>(payload: &'a Value, path: &str) -> Option<&'a serde_json::Map<String, Value>> {
    let mut current = payload;
    for segment in path.split('.') {
        current = current.as_object()?.get(segment)?;
    }
    current.get("ref")?.as_object()
}
