//! Blob key layout — bit-exact path scheme (`spec.md` §6).
//!
//! ```text
//! {recordsBucket}/{collection}/{id}/v{ov}/item.json
//! {contentBucket}/{collection}/{prop}/{id}/v{ov}/blob.bin
//! {contentBucket}/{collection}/{prop}/{id}/v{ov}/text.txt        (optional)
//! {backupsBucket}/__manifests__/{collection}/{YYYY}/{MM}/snapshot-{cv}.json.gz
//! ```
//!
//! Collection and id segments are always lowercased on build. `ov`/`cv` are
//! unsigned; `MM` is always two digits.

use crate::types::{ItemId, Ov};

/// Parsed `item.json` record-blob key.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RecordKey {
    pub collection: String,
    pub id: ItemId,
    pub ov: Ov,
}

/// Builds the record-blob key, relative to the records bucket.
pub fn build_record_key(collection: &str, id: ItemId, ov: Ov) -> String {
    format!(
        "{}/{}/v{}/item.json",
        collection.to_lowercase(),
        id.to_hex(),
        ov.0
    )
}

/// Parses a key produced by [`build_record_key`].
pub fn parse_record_key(key: &str) -> Option<RecordKey> {
    let parts: Vec<&str> = key.split('/').collect();
    let [collection, id, v_ov, file] = parts.as_slice() else {
        return None;
    };
    if *file != "item.json" {
        return None;
    }
    let ov = parse_v_segment(v_ov)?;
    let id = ItemId::from_hex(id)?;
    Some(RecordKey {
        collection: collection.to_string(),
        id,
        ov: Ov(ov),
    })
}

/// Parsed content-blob key (`blob.bin` or its optional `text.txt` sibling).
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ContentKey {
    pub collection: String,
    pub prop: String,
    pub id: ItemId,
    pub ov: Ov,
    pub is_text: bool,
}

/// Builds the content-blob key (`blob.bin` when `is_text` is false,
/// `text.txt` otherwise), relative to the content bucket.
pub fn build_content_key(collection: &str, prop: &str, id: ItemId, ov: Ov, is_text: bool) -> String {
    let file = if is_text { "text.txt" } else { "blob.bin" };
    format!(
        "{}/{}/{}/v{}/{}",
        collection.to_lowercase(),
        prop,
        id.to_hex(),
        ov.0,
        file
    )
}

/// Parses a key produced by [`build_content_key`].
pub fn parse_content_key(key: &str) -> Option<ContentKey> {
    let parts: Vec<&str> = key.split('/').collect();
    let [collection, prop, id, v_ov, file] = parts.as_slice() else {
        return None;
    };
    let is_text = match *file {
        "blob.bin" => false,
        "text.txt" => true,
        _ => return None,
    };
    let ov = parse_v_segment(v_ov)?;
    let id = ItemId::from_hex(id)?;
    Some(ContentKey {
        collection: collection.to_string(),
        prop: prop.to_string(),
        id,
        ov: Ov(ov),
        is_text,
    })
}

/// Parsed manifest-snapshot key.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ManifestKey {
    pub collection: String,
    pub year: u32,
    pub month: u32,
    pub cv: u64,
}

/// Builds a collection backup manifest key, relative to the backups bucket.
pub fn build_manifest_key(collection: &str, year: u32, month: u32, cv: u64) -> String {
    format!(
        "__manifests__/{}/{year:04}/{month:02}/snapshot-{cv}.json.gz",
        collection.to_lowercase()
    )
}

/// Parses a key produced by [`build_manifest_key`].
pub fn parse_manifest_key(key: &str) -> Option<ManifestKey> {
    let parts: Vec<&str> = key.split('/').collect();
    let [prefix, collection, year, month, file] = parts.as_slice() else {
        return None;
    };
    if *prefix != "__manifests__" {
        return None;
    }
    let file = file.strip_prefix("snapshot-")?.strip_suffix(".json.gz")?;
    let cv: u64 = file.parse().ok()?;
    let year: u32 = year.parse().ok()?;
    let month: u32 = month.parse().ok()?;
    if month_str(month).len() != 2 {
        return None;
    }
    Some(ManifestKey {
        collection: collection.to_string(),
        year,
        month,
        cv,
    })
}

fn month_str(month: u32) -> String {
    format!("{month:02}")
}

fn parse_v_segment(segment: &str) -> Option<u64> {
    segment.strip_prefix('v')?.parse().ok()
}
