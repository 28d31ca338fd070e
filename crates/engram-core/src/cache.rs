//! Bounded query-result cache
//!
//! LRU over (table, query text, canonicalized options) fingerprints with a
//! lazy TTL. The retrieval paths (text, vector, hybrid search) read through
//! this cache; mutations bypass it and drop the mutated table's entries.
//! The lock is never held across an I/O suspension.

use std::num::NonZeroUsize;
use std::sync::Arc;
use std::sync::Mutex;

use chrono::{DateTime, Duration, Utc};
use lru::LruCache;
use sha3::{Digest, Sha3_256};
use tracing::debug;

use crate::query::SearchHit;

/// Cache fingerprint: SHA3-256 of the canonical query description
pub type Fingerprint = [u8; 32];

/// Cache hit/miss accounting
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, serde::Serialize)]
pub struct CacheMetrics {
    /// Lookups, hit or miss
    pub total_queries: u64,
    /// Lookups answered without invoking the backing query
    pub cache_hits: u64,
    /// Entries currently cached
    pub entries: usize,
}

struct CacheEntry {
    results: Arc<Vec<SearchHit>>,
    inserted_at: DateTime<Utc>,
    table: String,
}

struct CacheInner {
    entries: LruCache<Fingerprint, CacheEntry>,
    total_queries: u64,
    cache_hits: u64,
}

/// LRU query cache with TTL and metrics
pub struct QueryCache {
    inner: Mutex<CacheInner>,
    ttl: Duration,
}

impl std::fmt::Debug for QueryCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QueryCache")
            .field("metrics", &self.metrics())
            .field("ttl_ms", &self.ttl.num_milliseconds())
            .finish()
    }
}

impl QueryCache {
    /// Cache bounded at `max_entries` with entries living at most `ttl_ms`
    pub fn new(max_entries: usize, ttl_ms: u64) -> Self {
        let cap = NonZeroUsize::new(max_entries.max(1)).unwrap_or(NonZeroUsize::MIN);
        Self {
            inner: Mutex::new(CacheInner {
                entries: LruCache::new(cap),
                total_queries: 0,
                cache_hits: 0,
            }),
            ttl: Duration::milliseconds(ttl_ms as i64),
        }
    }

    /// Fingerprint for a (table, query, options) triple.
    ///
    /// Options arrive as sorted-key JSON so equivalent queries share an
    /// entry regardless of option declaration order.
    pub fn fingerprint(table: &str, query: &str, options_json: &str) -> Fingerprint {
        let mut hasher = Sha3_256::new();
        hasher.update(table.as_bytes());
        hasher.update([0]);
        hasher.update(query.as_bytes());
        hasher.update([0]);
        hasher.update(options_json.as_bytes());
        hasher.finalize().into()
    }

    /// Look up a fresh entry, counting the query and marking the entry
    /// recently used on a hit
    pub fn lookup(&self, key: &Fingerprint, now: DateTime<Utc>) -> Option<Arc<Vec<SearchHit>>> {
        let Ok(mut inner) = self.inner.lock() else {
            return None;
        };
        inner.total_queries += 1;

        let fresh = match inner.entries.get(key) {
            Some(entry) if now - entry.inserted_at <= self.ttl => {
                Some(Arc::clone(&entry.results))
            }
            Some(_) => None,
            None => return None,
        };
        match fresh {
            Some(results) => {
                inner.cache_hits += 1;
                Some(results)
            }
            None => {
                // expired: discard lazily
                inner.entries.pop(key);
                None
            }
        }
    }

    /// Insert a result set, evicting the least-recently-used entry at
    /// capacity
    pub fn insert(
        &self,
        key: Fingerprint,
        table: &str,
        results: Arc<Vec<SearchHit>>,
        now: DateTime<Utc>,
    ) {
        if let Ok(mut inner) = self.inner.lock() {
            inner.entries.put(
                key,
                CacheEntry {
                    results,
                    inserted_at: now,
                    table: table.to_string(),
                },
            );
        }
    }

    /// Drop every entry computed from `table`; called after mutations
    pub fn invalidate_table(&self, table: &str) {
        if let Ok(mut inner) = self.inner.lock() {
            let stale: Vec<Fingerprint> = inner
                .entries
                .iter()
                .filter(|(_, entry)| entry.table == table)
                .map(|(key, _)| *key)
                .collect();
            if !stale.is_empty() {
                debug!(table = %table, dropped = stale.len(), "query cache invalidated");
            }
            for key in stale {
                inner.entries.pop(&key);
            }
        }
    }

    /// Drop everything
    pub fn clear(&self) {
        if let Ok(mut inner) = self.inner.lock() {
            inner.entries.clear();
        }
    }

    /// Current metrics snapshot
    pub fn metrics(&self) -> CacheMetrics {
        self.inner.lock().map_or_else(
            |_| CacheMetrics::default(),
            |inner| CacheMetrics {
                total_queries: inner.total_queries,
                cache_hits: inner.cache_hits,
                entries: inner.entries.len(),
            },
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(name: &str) -> Fingerprint {
        QueryCache::fingerprint("t", name, "{}")
    }

    fn results() -> Arc<Vec<SearchHit>> {
        Arc::new(Vec::new())
    }

    #[test]
    fn test_lru_evicts_least_recently_used() {
        let cache = QueryCache::new(2, 60_000);
        let now = Utc::now();

        cache.insert(key("alpha"), "t", results(), now);
        cache.insert(key("beta"), "t", results(), now);
        cache.insert(key("gamma"), "t", results(), now);

        assert!(cache.lookup(&key("alpha"), now).is_none());
        assert!(cache.lookup(&key("beta"), now).is_some());
        assert!(cache.lookup(&key("gamma"), now).is_some());
    }

    #[test]
    fn test_hit_protects_from_eviction() {
        let cache = QueryCache::new(2, 60_000);
        let now = Utc::now();

        cache.insert(key("a"), "t", results(), now);
        cache.insert(key("b"), "t", results(), now);
        // touch "a" so "b" becomes the eviction victim
        assert!(cache.lookup(&key("a"), now).is_some());
        cache.insert(key("c"), "t", results(), now);

        assert!(cache.lookup(&key("a"), now).is_some());
        assert!(cache.lookup(&key("b"), now).is_none());
    }

    #[test]
    fn test_ttl_expires_lazily() {
        let cache = QueryCache::new(4, 1_000);
        let now = Utc::now();
        cache.insert(key("a"), "t", results(), now);

        assert!(cache.lookup(&key("a"), now).is_some());
        let later = now + Duration::milliseconds(1_500);
        assert!(cache.lookup(&key("a"), later).is_none());
        assert_eq!(cache.metrics().entries, 0);
    }

    #[test]
    fn test_metrics_count_hits() {
        let cache = QueryCache::new(4, 60_000);
        let now = Utc::now();
        cache.insert(key("a"), "t", results(), now);

        cache.lookup(&key("a"), now);
        cache.lookup(&key("a"), now);
        cache.lookup(&key("missing"), now);

        let metrics = cache.metrics();
        assert_eq!(metrics.total_queries, 3);
        assert_eq!(metrics.cache_hits, 2);
    }

    #[test]
    fn test_invalidate_by_table() {
        let cache = QueryCache::new(4, 60_000);
        let now = Utc::now();
        cache.insert(QueryCache::fingerprint("t1", "q", "{}"), "t1", results(), now);
        cache.insert(QueryCache::fingerprint("t2", "q", "{}"), "t2", results(), now);

        cache.invalidate_table("t1");
        assert!(cache
            .lookup(&QueryCache::fingerprint("t1", "q", "{}"), now)
            .is_none());
        assert!(cache
            .lookup(&QueryCache::fingerprint("t2", "q", "{}"), now)
            .is_some());
    }
}
