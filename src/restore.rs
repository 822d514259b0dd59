//! Restore engine (`spec.md` §4.7): `restore_object` and `restore_collection`.
//!
//! A restore is a normal commit whose payload is copied from a prior
//! version — it always advances `ov`, it never rewrites history.

use serde_json::Value;

use crate::blob_key;
use crate::config::CounterOp;
use crate::counters;
use crate::error::{NotFoundError, Result};
use crate::model::Version;
use crate::pipeline::{lock, WritePipeline};
use crate::system::SystemHeader;
use crate::types::{Cv, ItemId, Ov, Timestamp};

/// Which prior version to restore from.
#[derive(Clone, Copy, Debug, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum RestoreTarget {
    Ov(Ov),
    Cv(Cv),
    At(Timestamp),
}

/// Result of `restore_collection`: how many records were restored before an
/// optional first failure stopped the scan. The already-restored prefix is
/// left in place — a partial failure is not rolled back.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct RestoreCollectionReport {
    pub items_restored: u64,
    pub first_failure: Option<(ItemId, String)>,
}

/// Restores `id` to the state at `target`, appending a new version whose
/// payload equals the target version's (`spec.md` §8, "Restore equivalence").
pub async fn restore_object(pipeline: &WritePipeline, id: ItemId, target: RestoreTarget) -> Result<Ov> {
    let owner = lock::acquire(pipeline.metadata().as_ref(), pipeline.collection(), id, lock::DEFAULT_LOCK_TTL_MS).await?;
    let result = restore_object_locked(pipeline, id, target).await;
    lock::release(pipeline.metadata().as_ref(), pipeline.collection(), id, &owner).await;
    result
}

async fn restore_object_locked(pipeline: &WritePipeline, id: ItemId, target: RestoreTarget) -> Result<Ov> {
    let target_version = resolve_target_version(pipeline, id, target).await?;
    let current = pipeline
        .metadata()
        .get_head(pipeline.collection(), id)?
        .ok_or_else(|| NotFoundError::item(id))?;

    let now = Timestamp::now();
    let system = SystemHeader::on_restore(&target_version.system, now);
    let new_ov = current.ov.next();

    let payload = fetch_payload(pipeline, &target_version.json_key).await?;
    let record_value = attach_system(payload.clone(), &system);
    let json_key = blob_key::build_record_key(pipeline.collection(), id, new_ov);
    pipeline.blob().put_json(pipeline.buckets().records.as_str(), &json_key, &record_value).await?;

    let cv = pipeline.metadata().next_cv(pipeline.collection())?;
    let head = crate::model::Head {
        id,
        ov: new_ov,
        cv,
        meta_indexed: target_version.meta_indexed.clone(),
        json_key: json_key.clone(),
        deleted: target_version.deleted,
        deleted_at: if target_version.deleted { Some(now) } else { None },
        full_shadow: None,
        system: system.clone(),
    };
    let version = Version {
        item_id: id,
        ov: new_ov,
        cv,
        json_key,
        meta_indexed: target_version.meta_indexed,
        committed_at: now,
        system,
        deleted: target_version.deleted,
    };
    let meta_indexed = head.meta_indexed.clone();
    let deleted = head.deleted;
    pipeline
        .metadata()
        .commit_mutation(pipeline.collection(), id, current.ov, head, version)?;

    let op = if deleted { CounterOp::Delete } else { CounterOp::Update };
    if let Err(e) = counters::record_operation(
        pipeline.metadata().as_ref(),
        pipeline.counter_rules(),
        pipeline.scope_key(),
        op,
        &meta_indexed,
        &payload,
        now,
    ) {
        tracing::warn!(error = %e, %id, "counter bump failed during restore");
    }

    Ok(new_ov)
}

/// Restores every record whose latest commit is strictly after `at`
/// (`spec.md` §4.7); records committed at or before `at` — including ones
/// created after `at` but never touched again — are left unchanged per
/// the rule that records created strictly after the target time remain
/// untouched.
pub async fn restore_collection(pipeline: &WritePipeline, at: Timestamp) -> Result<RestoreCollectionReport> {
    let ids = pipeline.metadata().heads_committed_after(pipeline.collection(), at)?;
    let mut report = RestoreCollectionReport::default();

    for id in ids {
        let head = match pipeline.metadata().get_head(pipeline.collection(), id)? {
            Some(h) => h,
            None => continue,
        };
        if head.system.inserted_at.as_millis() > at.as_millis() {
            continue;
        }
        match restore_object(pipeline, id, RestoreTarget::At(at)).await {
            Ok(_) => report.items_restored += 1,
            Err(e) => {
                report.first_failure = Some((id, e.to_string()));
                break;
            }
        }
    }

    Ok(report)
}

async fn resolve_target_version(pipeline: &WritePipeline, id: ItemId, target: RestoreTarget) -> Result<Version> {
    let version = match target {
        RestoreTarget::Ov(ov) => pipeline.metadata().get_version(pipeline.collection(), id, ov)?,
        RestoreTarget::Cv(cv) => find_version_by_cv(pipeline, id, cv)?,
        RestoreTarget::At(at) => pipeline.metadata().get_version_as_of(pipeline.collection(), id, at)?,
    };
    version.ok_or_else(|| crate::error::ChronosError::from(NotFoundError::version(id, Ov(0))))
}

/// Linear scan over `id`'s version chain by `ov`, since `cv` is a
/// collection-wide sequence with no per-item index. `cv` rises monotonically
/// with `ov` for a single item, so the scan stops as soon as it overshoots.
fn find_version_by_cv(pipeline: &WritePipeline, id: ItemId, cv: Cv) -> Result<Option<Version>> {
    let mut ov = Ov::zero();
    loop {
        let version = pipeline.metadata().get_version(pipeline.collection(), id, ov)?;
        match version {
            Some(v) if v.cv == cv => return Ok(Some(v)),
            Some(v) if v.cv > cv => return Ok(None),
            Some(_) => ov = ov.next(),
            None => return Ok(None),
        }
    }
}

async fn fetch_payload(pipeline: &WritePipeline, json_key: &str) -> Result<Value> {
    let bytes = pipeline.blob().get(pipeline.buckets().records.as_str(), json_key).await?;
    let mut value: Value =
        serde_json::from_slice(&bytes).map_err(|e| crate::error::StorageError::serialization(e.to_string()))?;
    if let Some(obj) = value.as_object_mut() {
        obj.remove("_system");
    }
    Ok(value)
}

fn attach_system(mut payload: Value, system: &SystemHeader) -> Value {
    if let Some(obj) = payload.as_object_mut() {
        obj.insert("_system".to_string(), serde_json::to_value(system).expect("SystemHeader always serializes"));
    }
    payload
}
