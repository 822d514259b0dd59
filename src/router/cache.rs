//! Tenant resolution cache: LRU with TTL eviction, per `spec.md` §4.3.
//! Invalidation is per-tenant; overflow eviction is oldest-first (the LRU's
//! natural eviction order).

use std::num::NonZeroUsize;

use lru::LruCache;

use crate::types::Timestamp;

struct Entry<V> {
    value: V,
    inserted_at: Timestamp,
}

/// LRU cache of resolved tenant routes, with a TTL applied on read.
pub struct TenantCache<V> {
    entries: LruCache<String, Entry<V>>,
    ttl_secs: u64,
}

impl<V: Clone> TenantCache<V> {
    pub fn new(max_size: usize, ttl_secs: u64) -> Self {
        let capacity = NonZeroUsize::new(max_size.max(1)).expect("max_size clamped to >= 1");
        Self {
            entries: LruCache::new(capacity),
            ttl_secs,
        }
    }

    /// Returns the cached value for `tenant_id` if present and not expired
    /// as of `now`. An expired entry is evicted on lookup.
    pub fn get(&mut self, tenant_id: &str, now: Timestamp) -> Option<V> {
        let expired = match self.entries.peek(tenant_id) {
            Some(entry) => now.as_millis() - entry.inserted_at.as_millis() > (self.ttl_secs as i64) * 1000,
            None => return None,
        };
        if expired {
            self.entries.pop(tenant_id);
            return None;
        }
        self.entries.get(tenant_id).map(|e| e.value.clone())
    }

    pub fn put(&mut self, tenant_id: String, value: V, now: Timestamp) {
        self.entries.put(
            tenant_id,
            Entry {
                value,
                inserted_at: now,
            },
        );
    }

    /// Invalidates one tenant's cached resolution.
    pub fn invalidate(&mut self, tenant_id: &str) {
        self.entries.pop(tenant_id);
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_put_then_get() {
        let mut cache: TenantCache<String> = TenantCache::new(10, 3600);
        cache.put("acme".to_string(), "db_acme".to_string(), Timestamp::from_millis(0));
        assert_eq!(
            cache.get("acme", Timestamp::from_millis(1000)),
            Some("db_acme".to_string())
        );
    }

    #[test]
    fn test_entry_expires_after_ttl() {
        let mut cache: TenantCache<String> = TenantCache::new(10, 10);
        cache.put("acme".to_string(), "db_acme".to_string(), Timestamp::from_millis(0));
        assert_eq!(cache.get("acme", Timestamp::from_millis(20_000)), None);
    }

    #[test]
    fn test_invalidate_removes_entry() {
        let mut cache: TenantCache<String> = TenantCache::new(10, 3600);
        cache.put("acme".to_string(), "db_acme".to_string(), Timestamp::from_millis(0));
        cache.invalidate("acme");
        assert_eq!(cache.get("acme", Timestamp::from_millis(1)), None);
    }

    #[test]
    fn test_overflow_evicts_oldest() {
        let mut cache: TenantCache<String> = TenantCache::new(2, 3600);
        cache.put("a".to_string(), "da".to_string(), Timestamp::from_millis(0));
        cache.put("b".to_string(), "db".to_string(), Timestamp::from_millis(1));
        cache.put("c".to_string(), "dc".to_string(), Timestamp::from_millis(2));
        assert_eq!(cache.get("a", Timestamp::from_millis(3)), None);
        assert_eq!(cache.len(), 2);
    }
}
