//! Core identifier and timestamp types shared across chronos-db.
//!
//! Record identifiers are opaque 12-byte values (the same shape as a
//! Mongo-style `ObjectId`): a 4-byte big-endian seconds timestamp followed by
//! 8 bytes of process-local randomness. This keeps ids roughly time-ordered
//! (useful for range scans) without requiring a coordinated counter.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Opaque 12-byte record identifier (`spec.md` §3: "identifiers are opaque
/// 12-byte IDs").
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ItemId(pub [u8; 12]);

/// Process-local counter mixed into generated ids so that two ids minted in
/// the same millisecond never collide within this process.
static ITEM_ID_COUNTER: AtomicU64 = AtomicU64::new(0);

impl ItemId {
    /// Generates a new id: 4-byte big-endian unix-seconds timestamp, then
    /// 5 bytes of randomness, then a 3-byte wrapping counter.
    pub fn new() -> Self {
        let secs = Timestamp::now().as_millis() / 1000;
        let mut bytes = [0u8; 12];
        bytes[0..4].copy_from_slice(&(secs as u32).to_be_bytes());

        let random: [u8; 16] = *Uuid::new_v4().as_bytes();
        bytes[4..9].copy_from_slice(&random[0..5]);

        let counter = ITEM_ID_COUNTER.fetch_add(1, Ordering::Relaxed);
        bytes[9..12].copy_from_slice(&counter.to_be_bytes()[5..8]);

        Self(bytes)
    }

    /// The all-zero id. Useful as a sentinel in tests.
    #[inline]
    pub const fn nil() -> Self {
        Self([0u8; 12])
    }

    #[inline]
    pub fn as_bytes(&self) -> &[u8; 12] {
        &self.0
    }

    #[inline]
    pub fn from_bytes(bytes: [u8; 12]) -> Self {
        Self(bytes)
    }

    /// Lowercase hex representation, used when an id must appear in a blob
    /// key path (`spec.md` §6: "lowercase collection, lowercase id").
    pub fn to_hex(&self) -> String {
        self.0.iter().map(|b| format!("{b:02x}")).collect()
    }

    /// Parses a lowercase hex id as produced by [`to_hex`](Self::to_hex).
    pub fn from_hex(s: &str) -> Option<Self> {
        if s.len() != 24 {
            return None;
        }
        let mut bytes = [0u8; 12];
        for (i, chunk) in s.as_bytes().chunks(2).enumerate() {
            let hex = std::str::from_utf8(chunk).ok()?;
            bytes[i] = u8::from_str_radix(hex, 16).ok()?;
        }
        Some(Self(bytes))
    }
}

impl Default for ItemId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for ItemId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ItemId({})", self.to_hex())
    }
}

impl fmt::Display for ItemId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

/// Object version: per-record monotonic counter starting at 0.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Ov(pub u64);

impl Ov {
    #[inline]
    pub const fn zero() -> Self {
        Self(0)
    }

    #[inline]
    pub fn next(self) -> Self {
        Self(self.0 + 1)
    }
}

impl fmt::Display for Ov {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Collection version: per-collection monotonic counter allocated at commit.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Cv(pub u64);

impl fmt::Display for Cv {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Unix timestamp in milliseconds.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Timestamp(pub i64);

impl Timestamp {
    /// Returns the current instant. If the system clock somehow reports a
    /// time before the Unix epoch, returns the epoch rather than panicking.
    #[inline]
    pub fn now() -> Self {
        use std::time::{SystemTime, UNIX_EPOCH};
        let duration = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default();
        Self(duration.as_millis() as i64)
    }

    #[inline]
    pub const fn from_millis(millis: i64) -> Self {
        Self(millis)
    }

    #[inline]
    pub const fn as_millis(&self) -> i64 {
        self.0
    }

    #[inline]
    pub fn to_be_bytes(&self) -> [u8; 8] {
        self.0.to_be_bytes()
    }
}

impl fmt::Display for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Durable replay intent identifier. Unique per [`crate::fallback::FallbackOp`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RequestId(pub Uuid);

impl RequestId {
    #[inline]
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for RequestId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Opaque actor identifier attached to writes for audit/lineage purposes.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ActorId(pub String);

impl ActorId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ActorId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_item_id_unique() {
        let a = ItemId::new();
        let b = ItemId::new();
        assert_ne!(a, b);
    }

    #[test]
    fn test_item_id_hex_roundtrip() {
        let id = ItemId::new();
        let hex = id.to_hex();
        assert_eq!(hex.len(), 24);
        assert_eq!(ItemId::from_hex(&hex), Some(id));
    }

    #[test]
    fn test_item_id_hex_is_lowercase() {
        let id = ItemId::new();
        let hex = id.to_hex();
        assert_eq!(hex, hex.to_lowercase());
    }

    #[test]
    fn test_item_id_from_hex_rejects_bad_length() {
        assert_eq!(ItemId::from_hex("abc"), None);
    }

    #[test]
    fn test_item_id_serialization() {
        let id = ItemId::new();
        let bytes = bincode::serialize(&id).unwrap();
        let restored: ItemId = bincode::deserialize(&bytes).unwrap();
        assert_eq!(id, restored);
    }

    #[test]
    fn test_ov_next_is_monotonic() {
        let ov = Ov::zero();
        assert_eq!(ov.next(), Ov(1));
        assert_eq!(ov.next().next(), Ov(2));
    }

    #[test]
    fn test_timestamp_ordering() {
        let t1 = Timestamp::from_millis(1000);
        let t2 = Timestamp::from_millis(2000);
        assert!(t1 < t2);
    }

    #[test]
    fn test_timestamp_be_bytes_preserve_order() {
        let t1 = Timestamp::from_millis(100);
        let t2 = Timestamp::from_millis(200);
        assert!(t1.to_be_bytes() < t2.to_be_bytes());
    }

    #[test]
    fn test_request_id_unique() {
        assert_ne!(RequestId::new(), RequestId::new());
    }

    #[test]
    fn test_actor_id_display() {
        let actor = ActorId::new("sys");
        assert_eq!(actor.to_string(), "sys");
    }
}
