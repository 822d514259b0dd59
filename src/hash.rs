//! Hashing & key derivation.
//!
//! Deterministic 64-bit hash, Rendezvous (HRW) backend selection,
//! jump-consistent hashing, and the pipe-separated key DSL (`spec.md` §4.1).
//! Pure functions, no I/O, so the HRW stability property in §8 can be
//! checked with `proptest`.

use std::collections::HashMap;

use sha2::{Digest, Sha256};

/// SHA-256 of the UTF-8 bytes of `key`, truncated to the leading 8 bytes
/// read as big-endian `u64`.
pub fn hash64(key: &str) -> u64 {
    let digest = Sha256::digest(key.as_bytes());
    let mut buf = [0u8; 8];
    buf.copy_from_slice(&digest[0..8]);
    u64::from_be_bytes(buf)
}

/// Rendezvous (highest random weight) selection: picks the backend id
/// maximizing `hash64(key || "|" || backendId)`, tie-breaking on the
/// lowest index.
pub fn rendezvous_select<'a>(key: &str, backend_ids: &[&'a str]) -> Option<&'a str> {
    backend_ids
        .iter()
        .enumerate()
        .map(|(idx, id)| {
            let score = hash64(&format!("{key}|{id}"));
            (score, idx, *id)
        })
        .max_by(|a, b| a.0.cmp(&b.0).then(b.1.cmp(&a.1)))
        .map(|(_, _, id)| id)
}

/// Classical two-line jump-consistent-hash recurrence, mapping a 64-bit key
/// to one of `num_buckets` buckets.
pub fn jump_consistent_hash(key: u64, num_buckets: i64) -> i64 {
    if num_buckets <= 0 {
        return 0;
    }
    let mut key = key;
    let mut b: i64 = -1;
    let mut j: i64 = 0;
    while j < num_buckets {
        b = j;
        key = key.wrapping_mul(2862933555777941757).wrapping_add(1);
        j = ((b.wrapping_add(1)) as f64 * ((1i64 << 31) as f64 / (((key >> 33).wrapping_add(1)) as f64)))
            as i64;
    }
    b
}

/// Fields resolvable by the pipe-separated key DSL (`spec.md` §4.1).
#[derive(Clone, Copy, Debug)]
pub enum KeyField {
    TenantId,
    DbName,
    Collection,
    ObjectId,
    CollectionObjectId,
}

/// Context the key DSL resolves fields against. `ctx` backs the DSL's fifth
/// field form, `<path.in.ctx>` — any field name not matching one of the four
/// literals is looked up here verbatim.
#[derive(Clone, Debug, Default)]
pub struct KeyContext<'a> {
    pub tenant_id: Option<&'a str>,
    pub db_name: Option<&'a str>,
    pub collection: Option<&'a str>,
    pub object_id: Option<&'a str>,
    pub ctx: HashMap<&'a str, &'a str>,
}

/// Resolves a pipe-separated field spec against `ctx`, returning the first
/// non-empty resolution. Falls back to `collection:objectId` when nothing
/// resolves.
pub fn resolve_key(spec: &str, ctx: &KeyContext<'_>) -> String {
    for field in spec.split('|') {
        let field = field.trim();
        if field.is_empty() {
            continue;
        }
        let resolved = match field {
            "tenantId" => ctx.tenant_id.map(str::to_string),
            "dbName" => ctx.db_name.map(str::to_string),
            "collection" => ctx.collection.map(str::to_string),
            "objectId" => ctx.object_id.map(str::to_string),
            "collection:objectId" => match (ctx.collection, ctx.object_id) {
                (Some(c), Some(o)) => Some(format!("{c}:{o}")),
                _ => None,
            },
            path => ctx.ctx.get(path).map(|v| v.to_string()),
        };
        if let Some(value) = resolved {
            if !value.is_empty() {
                return value;
            }
        }
    }
    fallback_key(ctx)
}

fn fallback_key(ctx: &KeyContext<'_>) -> String {
    format!(
        "{}:{}",
        ctx.collection.unwrap_or_default(),
        ctx.object_id.unwrap_or_default()
    )
}
