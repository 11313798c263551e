//! Query-result cache
//!
//! LRU keyed by normalized query text, with TTL expiry and per-table
//! invalidation on writes.

use std::collections::HashSet;
use std::num::NonZeroUsize;
use std::sync::atomic::Ordering;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use lru::LruCache;

use crate::metrics::Metrics;
use crate::plan::logical::Schema;
use crate::storage::value::Row;

/// A cached result set.
#[derive(Debug, Clone)]
pub struct CachedResult {
    pub schema: Schema,
    pub rows: Vec<Row>,
    pub tables: Vec<String>,
    created: Instant,
}

pub struct QueryCache {
    inner: Mutex<LruCache<String, CachedResult>>,
    ttl: Duration,
    metrics: Arc<Metrics>,
}

impl QueryCache {
    pub fn new(max_size: usize, ttl: Duration, metrics: Arc<Metrics>) -> Self {
        let capacity = NonZeroUsize::new(max_size.max(1)).expect("max_size >= 1");
        Self {
            inner: Mutex::new(LruCache::new(capacity)),
            ttl,
            metrics,
        }
    }

    /// Cache key: session database + query text. Only deterministic,
    /// parameter-free SELECT results belong here.
    pub fn key(database: &str, sql: &str) -> String {
        format!("{database}\u{1}{}", sql.trim())
    }

    pub fn get(&self, key: &str) -> Option<CachedResult> {
        let mut cache = self.inner.lock().unwrap();
        match cache.get(key) {
            Some(entry) if entry.created.elapsed() <= self.ttl => {
                self.metrics.cache_hits.fetch_add(1, Ordering::Relaxed);
                Some(entry.clone())
            }
            Some(_) => {
                cache.pop(key);
                self.metrics.cache_misses.fetch_add(1, Ordering::Relaxed);
                None
            }
            None => {
                self.metrics.cache_misses.fetch_add(1, Ordering::Relaxed);
                None
            }
        }
    }

    pub fn put(&self, key: String, schema: Schema, rows: Vec<Row>, tables: Vec<String>) {
        let entry = CachedResult {
            schema,
            rows,
            tables,
            created: Instant::now(),
        };
        self.inner.lock().unwrap().put(key, entry);
    }

    /// Drop every cached result that read from any of the given tables.
    pub fn invalidate_tables(&self, tables: &[String]) {
        let affected: HashSet<&str> = tables.iter().map(String::as_str).collect();
        let mut cache = self.inner.lock().unwrap();
        let stale: Vec<String> = cache
            .iter()
            .filter(|(_, entry)| entry.tables.iter().any(|t| affected.contains(t.as_str())))
            .map(|(k, _)| k.clone())
            .collect();
        for key in stale {
            cache.pop(&key);
        }
    }

    pub fn clear(&self) {
        self.inner.lock().unwrap().clear();
    }

    pub fn len(&self) -> usize {
        self.inner.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::value::Value;

    fn cache(ttl: Duration) -> QueryCache {
        QueryCache::new(4, ttl, Arc::new(Metrics::new()))
    }

    fn row(i: i64) -> Row {
        Row::from_pairs(vec![("id".into(), Value::Int(i))])
    }

    #[test]
    fn test_put_get_round_trip() {
        let c = cache(Duration::from_secs(60));
        let key = QueryCache::key("db", "SELECT * FROM t");
        c.put(key.clone(), vec![], vec![row(1)], vec!["t".into()]);
        let hit = c.get(&key).expect("hit");
        assert_eq!(hit.rows.len(), 1);
        assert!(c.get(&QueryCache::key("db", "SELECT other")).is_none());
    }

    #[test]
    fn test_ttl_expiry() {
        let c = cache(Duration::from_millis(0));
        let key = QueryCache::key("db", "q");
        c.put(key.clone(), vec![], vec![row(1)], vec![]);
        std::thread::sleep(Duration::from_millis(2));
        assert!(c.get(&key).is_none());
    }

    #[test]
    fn test_invalidate_by_table() {
        let c = cache(Duration::from_secs(60));
        let k1 = QueryCache::key("db", "q1");
        let k2 = QueryCache::key("db", "q2");
        c.put(k1.clone(), vec![], vec![row(1)], vec!["users".into()]);
        c.put(k2.clone(), vec![], vec![row(2)], vec!["orders".into()]);
        c.invalidate_tables(&["users".into()]);
        assert!(c.get(&k1).is_none());
        assert!(c.get(&k2).is_some());
    }

    #[test]
    fn test_lru_eviction() {
        let c = cache(Duration::from_secs(60));
        for i in 0..6 {
            c.put(format!("k{i}"), vec![], vec![row(i)], vec![]);
        }
        assert_eq!(c.len(), 4);
        assert!(c.get("k0").is_none(), "oldest entry evicted");
        assert!(c.get("k5").is_some());
    }
}
