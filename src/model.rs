//! Shared entity types from the data model (`spec.md` §3): [`Head`],
//! [`Version`], [`CounterTotals`], and [`FallbackOp`]. Kept free of any
//! storage-trait dependency so both `storage` and the higher-level modules
//! (`pipeline`, `counters`, `fallback`) can depend on them without a cycle.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::system::SystemHeader;
use crate::types::{Cv, ItemId, Ov, Timestamp};

/// Latest pointer for one logical record.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Head {
    pub id: ItemId,
    pub ov: Ov,
    pub cv: Cv,
    /// Indexed projection of the payload (`spec.md` §4.4).
    pub meta_indexed: Value,
    /// Blob path of the JSON payload for this `ov`.
    pub json_key: String,
    pub deleted: bool,
    pub deleted_at: Option<Timestamp>,
    /// Optional inline snapshot for recent-access speed.
    pub full_shadow: Option<FullShadow>,
    pub system: SystemHeader,
}

/// Optional inline payload snapshot stored on the head.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct FullShadow {
    pub at: Timestamp,
    pub bytes: Vec<u8>,
}

/// Immutable row of the append-only version index.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Version {
    pub item_id: ItemId,
    pub ov: Ov,
    pub cv: Cv,
    pub json_key: String,
    pub meta_indexed: Value,
    pub committed_at: Timestamp,
    pub system: SystemHeader,
    pub deleted: bool,
}

/// A resolved scope `(tenant?, dbName, collection)` for counter totals, as a
/// single opaque string key (`"{tenant}\u{0}{dbName}\u{0}{collection}"`,
/// using a separator that cannot appear in any of the three fields).
pub fn scope_key(tenant: Option<&str>, db_name: &str, collection: &str) -> String {
    format!("{}\u{0}{db_name}\u{0}{collection}", tenant.unwrap_or(""))
}

/// Global and rule-indexed counts for one scope.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct CounterTotals {
    pub created: u64,
    pub updated: u64,
    pub deleted: u64,
    pub rules: std::collections::BTreeMap<String, RuleTotals>,
    pub last_at: Option<Timestamp>,
}

/// Per-rule totals, including the resolved representation of `unique[prop]`
/// decided in `SPEC_FULL.md` §3.9: a sorted, deduplicated `Vec<String>`
/// stored directly on the totals document.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct RuleTotals {
    pub created: u64,
    pub updated: u64,
    pub deleted: u64,
    pub unique: std::collections::BTreeMap<String, Vec<String>>,
}

impl RuleTotals {
    /// Inserts `value` into the unique-value set for `prop`, keeping it
    /// sorted and deduplicated.
    pub fn record_unique(&mut self, prop: &str, value: String) {
        let set = self.unique.entry(prop.to_string()).or_default();
        if let Err(idx) = set.binary_search(&value) {
            set.insert(idx, value);
        }
    }
}

/// Operation type a [`FallbackOp`] replays.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum FallbackOpType {
    Create,
    Update,
    Delete,
    Enrich,
    Restore,
}

/// Durable replay intent (`spec.md` §3, §4.9).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct FallbackOp {
    pub request_id: crate::types::RequestId,
    pub op_type: FallbackOpType,
    /// Serialized route context the op should replay against.
    pub ctx: Value,
    pub payload: Value,
    pub opts: Value,
    pub attempt: u32,
    pub next_attempt_at: Timestamp,
    pub last_error: Option<String>,
    pub created_at: Timestamp,
}

/// A terminally failed op moved to the dead-letter collection.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct DeadLetterEntry {
    pub op: FallbackOp,
    pub final_error: String,
    pub failed_at: Timestamp,
}
