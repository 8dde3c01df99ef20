//! Result cache for read queries.
//!
//! Entries are keyed by the literal SQL text plus bound parameters and tagged
//! with every table the statement reads. A write to a table drops all entries
//! tagged with it. When the cache is full the least-recently-used entry is
//! evicted.

use std::collections::HashMap;
use std::hash::{Hash, Hasher};
use std::time::Instant;

use relmodel_core::{Row, Value};

/// A cached query result.
#[derive(Debug, Clone)]
pub struct CachedResult {
    pub sql: String,
    pub params: Vec<Value>,
    pub rows: Vec<Row>,
    pub tables: Vec<String>,
    pub last_used: Instant,
    pub hit_count: u64,
}

/// LRU cache of read results.
#[derive(Debug)]
pub struct QueryCache {
    cache: HashMap<u64, CachedResult>,
    max_size: usize,
    hits: u64,
    misses: u64,
}

impl QueryCache {
    /// Create a new cache with the given maximum number of entries.
    pub fn new(max_size: usize) -> Self {
        Self {
            cache: HashMap::with_capacity(max_size.min(256)),
            max_size,
            hits: 0,
            misses: 0,
        }
    }

    /// Look up the rows cached for `sql` + `params`.
    pub fn get(&mut self, sql: &str, params: &[Value]) -> Option<Vec<Row>> {
        let key = cache_key(&(sql, params));
        match self.cache.get_mut(&key) {
            Some(entry) if entry.sql == sql && entry.params == params => {
                entry.last_used = Instant::now();
                entry.hit_count += 1;
                self.hits += 1;
                tracing::trace!(sql = %sql, hits = entry.hit_count, "query cache hit");
                Some(entry.rows.clone())
            }
            _ => {
                self.misses += 1;
                None
            }
        }
    }

    /// Store the rows produced by `sql` + `params`, reading from `tables`.
    pub fn insert(&mut self, sql: &str, params: &[Value], tables: Vec<String>, rows: Vec<Row>) {
        let key = cache_key(&(sql, params));
        if !self.cache.contains_key(&key) && self.cache.len() >= self.max_size {
            self.evict_lru();
        }
        self.cache.insert(
            key,
            CachedResult {
                sql: sql.to_string(),
                params: params.to_vec(),
                rows,
                tables,
                last_used: Instant::now(),
                hit_count: 0,
            },
        );
    }

    /// Drop every entry that reads from `table`.
    pub fn invalidate(&mut self, table: &str) -> usize {
        let before = self.cache.len();
        self.cache
            .retain(|_, entry| !entry.tables.iter().any(|t| t == table));
        let removed = before - self.cache.len();
        if removed > 0 {
            tracing::trace!(table = table, removed, "query cache invalidated");
        }
        removed
    }

    pub fn len(&self) -> usize {
        self.cache.len()
    }

    pub fn is_empty(&self) -> bool {
        self.cache.is_empty()
    }

    /// (hits, misses) since creation.
    pub fn stats(&self) -> (u64, u64) {
        (self.hits, self.misses)
    }

    /// Clear all cached results.
    pub fn clear(&mut self) {
        self.cache.clear();
    }

    fn evict_lru(&mut self) {
        if let Some((&lru_key, _)) = self.cache.iter().min_by_key(|(_, entry)| entry.last_used) {
            self.cache.remove(&lru_key);
        }
    }
}

impl Default for QueryCache {
    fn default() -> Self {
        Self::new(1024)
    }
}

/// Compute a hash key from any hashable value.
pub fn cache_key(value: &impl Hash) -> u64 {
    let mut hasher = std::collections::hash_map::DefaultHasher::new();
    value.hash(&mut hasher);
    hasher.finish()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rows(n: i64) -> Vec<Row> {
        vec![Row::new(vec!["id".to_string()], vec![Value::Int(n)])]
    }

    #[test]
    fn test_hit_requires_same_params() {
        let mut cache = QueryCache::new(10);
        let sql = "SELECT * FROM posts WHERE id = ?1";
        cache.insert(sql, &[Value::Int(1)], vec!["posts".to_string()], rows(1));

        assert!(cache.get(sql, &[Value::Int(1)]).is_some());
        assert!(cache.get(sql, &[Value::Int(2)]).is_none());
        assert_eq!(cache.stats(), (1, 1));
    }

    #[test]
    fn test_invalidate_by_table() {
        let mut cache = QueryCache::new(10);
        cache.insert("q1", &[], vec!["posts".to_string(), "users".to_string()], rows(1));
        cache.insert("q2", &[], vec!["tags".to_string()], rows(2));

        assert_eq!(cache.invalidate("users"), 1);
        assert!(cache.get("q1", &[]).is_none());
        assert!(cache.get("q2", &[]).is_some());
    }

    #[test]
    fn test_eviction() {
        let mut cache = QueryCache::new(2);
        cache.insert("q1", &[], vec![], rows(1));
        cache.insert("q2", &[], vec![], rows(2));
        // touch q1 so q2 becomes least recently used
        assert!(cache.get("q1", &[]).is_some());
        cache.insert("q3", &[], vec![], rows(3));

        assert_eq!(cache.len(), 2);
        assert!(cache.get("q1", &[]).is_some());
        assert!(cache.get("q2", &[]).is_none());
    }

    #[test]
    fn test_cache_key_function() {
        assert_eq!(cache_key(&"SELECT 1"), cache_key(&"SELECT 1"));
        assert_ne!(cache_key(&"SELECT 1"), cache_key(&"SELECT 2"));
    }
}
