//! `_system` lifecycle header and deep-merge-with-array-union semantics
//! (`spec.md` §3, §4.5).

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::types::Timestamp;

/// Lifecycle state of a record, per `spec.md` §3.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RecordState {
    NewNotSynched,
    New,
    Processed,
}

/// Lineage pointer embedded in `_system` when a record was produced from a
/// restore or a cross-collection derivation.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Lineage {
    pub parent_id: Option<String>,
    pub parent_collection: Option<String>,
    pub origin_id: Option<String>,
    pub origin_collection: Option<String>,
}

/// The `_system` header embedded in every payload.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SystemHeader {
    pub inserted_at: Timestamp,
    pub updated_at: Timestamp,
    pub deleted_at: Option<Timestamp>,
    pub deleted: bool,
    /// Unique set of enrichment source tags; preserves insertion order.
    pub function_ids: Vec<String>,
    pub lineage: Option<Lineage>,
    pub state: RecordState,
}

impl SystemHeader {
    /// Builds the header for a CREATE.
    pub fn on_create(now: Timestamp, lineage: Option<Lineage>) -> Self {
        Self {
            inserted_at: now,
            updated_at: now,
            deleted_at: None,
            deleted: false,
            function_ids: Vec::new(),
            lineage,
            state: RecordState::NewNotSynched,
        }
    }

    /// Applies an UPDATE: preserves `inserted_at`, refreshes `updated_at`,
    /// leaves `state` unchanged unless `override_state` is given.
    pub fn on_update(&self, now: Timestamp, override_state: Option<RecordState>) -> Self {
        Self {
            updated_at: now,
            state: override_state.unwrap_or(self.state),
            ..self.clone()
        }
    }

    /// Applies a DELETE: preserves `inserted_at`, sets
    /// `updated_at = deleted_at = now`, `deleted = true`.
    pub fn on_delete(&self, now: Timestamp) -> Self {
        Self {
            updated_at: now,
            deleted_at: Some(now),
            deleted: true,
            ..self.clone()
        }
    }

    /// Applies a RESTORE: preserves `inserted_at` from the *target*, refreshes
    /// `updated_at`, preserves `deleted` iff the target was deleted.
    pub fn on_restore(target: &SystemHeader, now: Timestamp) -> Self {
        Self {
            inserted_at: target.inserted_at,
            updated_at: now,
            deleted_at: if target.deleted { target.deleted_at } else { None },
            deleted: target.deleted,
            function_ids: target.function_ids.clone(),
            lineage: target.lineage.clone(),
            state: target.state,
        }
    }

    /// Records `function_id` in the unique, insertion-ordered tag set.
    pub fn record_function_id(&mut self, function_id: &str) {
        if !self.function_ids.iter().any(|f| f == function_id) {
            self.function_ids.push(function_id.to_string());
        }
    }
}

/// Deep-merges `patch` into `target` in place, per `spec.md` §4.5:
/// - `null` in the patch overrides the target value with `null`.
/// - object + object recurses key by key.
/// - array + (array | singleton) unions: primitives deduped by equality,
///   objects matched by `id`/`_id` when present (recursive merge on match),
///   else by deep equality (merge), else appended.
/// - anything else: the patch value replaces the target value.
///
/// `undefined` fields (fields simply absent from the patch object) are
/// ignored — Rust's `serde_json::Value` has no `undefined`, so "absent key"
/// is the faithful analogue.
pub fn deep_merge(target: &mut Value, patch: &Value) {
    match (target.as_object_mut(), patch.as_object()) {
        (Some(target_obj), Some(patch_obj)) => {
            for (key, patch_value) in patch_obj {
                match target_obj.get_mut(key) {
                    Some(target_value) => deep_merge(target_value, patch_value),
                    None => {
                        target_obj.insert(key.clone(), patch_value.clone());
                    }
                }
            }
            return;
        }
        _ => {}
    }

    if let Some(target_arr) = target.as_array().cloned() {
        if let Some(merged) = merge_array(&target_arr, patch) {
            *target = Value::Array(merged);
            return;
        }
    }

    *target = patch.clone();
}

fn merge_array(target_arr: &[Value], patch: &Value) -> Option<Vec<Value>> {
    let patch_items: Vec<Value> = match patch {
        Value::Array(items) => items.clone(),
        Value::Null => return None,
        other => vec![other.clone()],
    };

    let mut result = target_arr.to_vec();
    for item in patch_items {
        match item_id(&item) {
            Some(id) => {
                if let Some(existing) = result.iter_mut().find(|v| item_id(v).as_deref() == Some(id.as_str())) {
                    deep_merge(existing, &item);
                } else {
                    result.push(item);
                }
            }
            None => {
                if let Some(existing) = result.iter_mut().find(|v| **v == item) {
                    deep_merge(existing, &item);
                } else if !result.iter().any(|v| *v == item) {
                    result.push(item);
                }
            }
        }
    }
    Some(result)
}

fn item_id(value: &Value) -> Option<String> {
    let obj = value.as_object()?;
    obj.get("id")
        .or_else(|| obj.get("_id"))
        .map(|v| v.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_on_create_sets_new_not_synched() {
        let now = Timestamp::from_millis(1000);
        let header = SystemHeader::on_create(now, None);
        assert_eq!(header.inserted_at, header.updated_at);
        assert_eq!(header.state, RecordState::NewNotSynched);
        assert!(!header.deleted);
    }

    #[test]
    fn test_on_update_preserves_inserted_at() {
        let created = SystemHeader::on_create(Timestamp::from_millis(100), None);
        let updated = created.on_update(Timestamp::from_millis(200), None);
        assert_eq!(updated.inserted_at, Timestamp::from_millis(100));
        assert_eq!(updated.updated_at, Timestamp::from_millis(200));
        assert_eq!(updated.state, RecordState::NewNotSynched);
    }

    #[test]
    fn test_on_delete_sets_deleted_and_deleted_at() {
        let created = SystemHeader::on_create(Timestamp::from_millis(100), None);
        let deleted = created.on_delete(Timestamp::from_millis(300));
        assert!(deleted.deleted);
        assert_eq!(deleted.deleted_at, Some(Timestamp::from_millis(300)));
        assert_eq!(deleted.inserted_at, Timestamp::from_millis(100));
    }

    #[test]
    fn test_on_restore_preserves_inserted_at_from_target() {
        let target = SystemHeader::on_create(Timestamp::from_millis(50), None);
        let restored = SystemHeader::on_restore(&target, Timestamp::from_millis(900));
        assert_eq!(restored.inserted_at, Timestamp::from_millis(50));
        assert_eq!(restored.updated_at, Timestamp::from_millis(900));
        assert!(!restored.deleted);
    }

    #[test]
    fn test_on_restore_preserves_deleted_state() {
        let mut target = SystemHeader::on_create(Timestamp::from_millis(50), None);
        target = target.on_delete(Timestamp::from_millis(60));
        let restored = SystemHeader::on_restore(&target, Timestamp::from_millis(900));
        assert!(restored.deleted);
        assert_eq!(restored.deleted_at, Some(Timestamp::from_millis(60)));
    }

    #[test]
    fn test_record_function_id_dedups_and_preserves_order() {
        let mut header = SystemHeader::on_create(Timestamp::from_millis(0), None);
        header.record_function_id("fn-a");
        header.record_function_id("fn-b");
        header.record_function_id("fn-a");
        assert_eq!(header.function_ids, vec!["fn-a", "fn-b"]);
    }

    #[test]
    fn test_merge_identity_law() {
        let mut target = json!({"a": 1, "b": {"c": 2}});
        let original = target.clone();
        deep_merge(&mut target, &json!(null));
        assert_eq!(target, Value::Null);
        let mut target2 = original.clone();
        deep_merge(&mut target2, &json!({}));
        assert_eq!(target2, original);
    }

    #[test]
    fn test_merge_object_recurses() {
        let mut target = json!({"a": 1, "nested": {"x": 1, "y": 2}});
        let patch = json!({"nested": {"y": 20, "z": 3}});
        deep_merge(&mut target, &patch);
        assert_eq!(target, json!({"a": 1, "nested": {"x": 1, "y": 20, "z": 3}}));
    }

    #[test]
    fn test_merge_array_primitives_union_deduped() {
        let mut target = json!({"tags": ["vip"]});
        deep_merge(&mut target, &json!({"tags": ["verified"]}));
        assert_eq!(target, json!({"tags": ["vip", "verified"]}));
        deep_merge(&mut target, &json!({"tags": ["vip"]}));
        assert_eq!(target, json!({"tags": ["vip", "verified"]}));
    }

    #[test]
    fn test_merge_array_objects_matched_by_id() {
        let mut target = json!({"items": [{"id": "1", "qty": 1}]});
        let patch = json!({"items": [{"id": "1", "qty": 2}, {"id": "2", "qty": 5}]});
        deep_merge(&mut target, &patch);
        assert_eq!(
            target,
            json!({"items": [{"id": "1", "qty": 2}, {"id": "2", "qty": 5}]})
        );
    }

    #[test]
    fn test_merge_scenario_from_spec() {
        let mut target = json!({});
        deep_merge(&mut target, &json!({"tags": ["vip"], "meta": {"score": 1}}));
        deep_merge(
            &mut target,
            &json!({"tags": ["verified"], "meta": {"score": 2, "note": "n"}}),
        );
        assert_eq!(
            target,
            json!({"tags": ["vip", "verified"], "meta": {"score": 2, "note": "n"}})
        );
    }

    #[test]
    fn test_merge_idempotent_without_arrays_of_objects() {
        let mut target = json!({"a": 1, "b": {"c": 2}});
        let patch = json!({"b": {"c": 3}});
        deep_merge(&mut target, &patch);
        let after_first = target.clone();
        deep_merge(&mut target, &patch);
        assert_eq!(target, after_first);
    }

    #[test]
    fn test_merge_scalar_replaces() {
        let mut target = json!({"a": 1});
        deep_merge(&mut target, &json!({"a": "now a string"}));
        assert_eq!(target, json!({"a": "now a string"}));
    }
}
