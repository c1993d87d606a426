//! Prepared statement cache.
//!
//! Keyed by connection and [`StatementShape`], so queries that differ only in
//! their literal values share one prepared statement per connection. The
//! cache is `Send + Sync` and can be shared between sessions through an
//! `Arc`; a session on another connection prepares its own copy, since a
//! prepared handle is only valid where it was prepared.

use crate::compile::{CompiledStatement, StatementShape};
use std::collections::HashMap;
use std::sync::RwLock;
use std::sync::atomic::{AtomicU64, Ordering};
use ydborm_core::{Cx, Driver, Error, Outcome, PreparedStatement};

/// Default number of cached statements.
pub const DEFAULT_CAPACITY: usize = 5000;

/// Connection id plus statement shape.
type CacheKey = (u64, StatementShape);

#[derive(Debug)]
struct CacheEntry {
    statement: PreparedStatement,
    hits: AtomicU64,
    last_used: AtomicU64,
}

/// Counters describing cache effectiveness.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CacheStats {
    pub entries: usize,
    pub capacity: usize,
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
}

/// LRU cache of prepared statements.
///
/// Lookups take the read lock and bump atomic counters; only inserts take the
/// write lock. When the cache is full the least-recently-used entry is evicted.
#[derive(Debug)]
pub struct StatementCache {
    entries: RwLock<HashMap<CacheKey, CacheEntry>>,
    capacity: usize,
    clock: AtomicU64,
    hits: AtomicU64,
    misses: AtomicU64,
    evictions: AtomicU64,
}

impl StatementCache {
    /// Create a cache holding at most `capacity` statements (minimum 1).
    pub fn new(capacity: usize) -> Self {
        Self {
            entries: RwLock::new(HashMap::with_capacity(capacity.min(256))),
            capacity: capacity.max(1),
            clock: AtomicU64::new(0),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            evictions: AtomicU64::new(0),
        }
    }

    fn tick(&self) -> u64 {
        self.clock.fetch_add(1, Ordering::Relaxed) + 1
    }

    /// Look up the statement `connection` prepared for `shape`, counting a
    /// hit when found.
    pub fn lookup(&self, connection: u64, shape: &StatementShape) -> Option<PreparedStatement> {
        let entries = self.entries.read().unwrap_or_else(|e| e.into_inner());
        let entry = entries.get(&(connection, shape.clone()))?;
        entry.hits.fetch_add(1, Ordering::Relaxed);
        entry.last_used.store(self.tick(), Ordering::Relaxed);
        self.hits.fetch_add(1, Ordering::Relaxed);
        Some(entry.statement.clone())
    }

    /// Insert a freshly prepared statement.
    ///
    /// If another caller inserted the same shape first, that entry is kept
    /// and returned.
    pub fn insert(
        &self,
        connection: u64,
        shape: StatementShape,
        statement: PreparedStatement,
    ) -> PreparedStatement {
        let key = (connection, shape);
        let mut entries = self.entries.write().unwrap_or_else(|e| e.into_inner());
        if let Some(existing) = entries.get(&key) {
            return existing.statement.clone();
        }
        if entries.len() >= self.capacity {
            let lru = entries
                .iter()
                .min_by_key(|(_, entry)| entry.last_used.load(Ordering::Relaxed))
                .map(|(key, _)| key.clone());
            if let Some(lru) = lru {
                entries.remove(&lru);
                self.evictions.fetch_add(1, Ordering::Relaxed);
                tracing::debug!(
                    connection = lru.0,
                    table = lru.1.table,
                    kind = ?lru.1.kind,
                    "Evicted least recently used statement"
                );
            }
        }
        entries.insert(
            key,
            CacheEntry {
                statement: statement.clone(),
                hits: AtomicU64::new(0),
                last_used: AtomicU64::new(self.tick()),
            },
        );
        statement
    }

    /// Return `driver`'s cached statement for `compiled`, preparing it on a
    /// miss. The flag is `true` for a cache hit.
    pub async fn get_or_prepare<D: Driver>(
        &self,
        cx: &Cx,
        driver: &D,
        compiled: &CompiledStatement,
    ) -> Outcome<(PreparedStatement, bool), Error> {
        let connection = driver.connection_id();
        if let Some(statement) = self.lookup(connection, &compiled.shape) {
            tracing::trace!(connection, table = compiled.shape.table, "Statement cache hit");
            return Outcome::Ok((statement, true));
        }
        self.misses.fetch_add(1, Ordering::Relaxed);
        tracing::debug!(
            connection,
            table = compiled.shape.table,
            kind = ?compiled.shape.kind,
            "Statement cache miss, preparing"
        );
        match driver.prepare(cx, &compiled.text).await {
            Outcome::Ok(statement) => {
                Outcome::Ok((self.insert(connection, compiled.shape.clone(), statement), false))
            }
            Outcome::Err(e) => Outcome::Err(e),
            Outcome::Cancelled(r) => Outcome::Cancelled(r),
            Outcome::Panicked(p) => Outcome::Panicked(p),
        }
    }

    /// Hits recorded for `shape` across connections, if cached anywhere.
    pub fn hit_count(&self, shape: &StatementShape) -> Option<u64> {
        let entries = self.entries.read().unwrap_or_else(|e| e.into_inner());
        entries
            .iter()
            .filter(|((_, cached), _)| cached == shape)
            .map(|(_, entry)| entry.hits.load(Ordering::Relaxed))
            .reduce(|a, b| a + b)
    }

    /// Whether any connection has `shape` cached.
    pub fn contains(&self, shape: &StatementShape) -> bool {
        self.entries
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .keys()
            .any(|(_, cached)| cached == shape)
    }

    /// Whether `connection` has `shape` cached.
    pub fn contains_for(&self, connection: u64, shape: &StatementShape) -> bool {
        self.entries
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .contains_key(&(connection, shape.clone()))
    }

    pub fn len(&self) -> usize {
        self.entries.read().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub const fn capacity(&self) -> usize {
        self.capacity
    }

    /// Drop every cached statement. Counters are kept.
    pub fn clear(&self) {
        self.entries
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .clear();
    }

    pub fn stats(&self) -> CacheStats {
        CacheStats {
            entries: self.len(),
            capacity: self.capacity,
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            evictions: self.evictions.load(Ordering::Relaxed),
        }
    }
}

impl Default for StatementCache {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compile::StatementKind;

    fn shape(table: &'static str) -> StatementShape {
        StatementShape {
            kind: StatementKind::Select,
            table,
            columns: vec!["id"],
            predicates: Vec::new(),
            order: Vec::new(),
            distinct: false,
            has_limit: false,
            has_offset: false,
        }
    }

    fn stmt(id: u64) -> PreparedStatement {
        PreparedStatement::new(id, format!("SELECT {id}"), 0)
    }

    #[test]
    fn test_cache_hit() {
        let cache = StatementCache::new(10);
        assert!(cache.lookup(1, &shape("a")).is_none());
        cache.insert(1, shape("a"), stmt(1));

        assert_eq!(cache.lookup(1, &shape("a")).map(|s| s.id()), Some(1));
        assert_eq!(cache.hit_count(&shape("a")), Some(1));
        assert_eq!(cache.stats().hits, 1);
    }

    #[test]
    fn test_first_insert_wins() {
        let cache = StatementCache::new(10);
        cache.insert(1, shape("a"), stmt(1));
        let kept = cache.insert(1, shape("a"), stmt(2));
        assert_eq!(kept.id(), 1);
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn test_eviction() {
        let cache = StatementCache::new(2);
        cache.insert(1, shape("a"), stmt(1));
        cache.insert(1, shape("b"), stmt(2));
        // This should evict "a" (LRU)
        cache.insert(1, shape("c"), stmt(3));

        assert_eq!(cache.len(), 2);
        assert!(!cache.contains(&shape("a")));
        assert!(cache.contains(&shape("b")));
        assert!(cache.contains(&shape("c")));
        assert_eq!(cache.stats().evictions, 1);
    }

    #[test]
    fn test_lru_ordering() {
        let cache = StatementCache::new(2);
        cache.insert(1, shape("a"), stmt(1));
        cache.insert(1, shape("b"), stmt(2));

        // Access "a" to make it recently used
        assert!(cache.lookup(1, &shape("a")).is_some());

        // Eviction should remove "b" (now LRU)
        cache.insert(1, shape("c"), stmt(3));

        assert!(cache.contains(&shape("a")));
        assert!(!cache.contains(&shape("b")));
        assert!(cache.contains(&shape("c")));
    }

    #[test]
    fn test_entries_are_per_connection() {
        let cache = StatementCache::new(10);
        cache.insert(1, shape("a"), stmt(1));

        assert!(cache.lookup(2, &shape("a")).is_none());
        assert!(cache.contains(&shape("a")));
        assert!(!cache.contains_for(2, &shape("a")));

        cache.insert(2, shape("a"), stmt(1));
        assert_eq!(cache.len(), 2);
        cache.lookup(1, &shape("a"));
        cache.lookup(2, &shape("a"));
        assert_eq!(cache.hit_count(&shape("a")), Some(2));
    }

    #[test]
    fn test_clear_keeps_counters() {
        let cache = StatementCache::default();
        assert_eq!(cache.capacity(), DEFAULT_CAPACITY);
        cache.insert(1, shape("a"), stmt(1));
        cache.lookup(1, &shape("a"));
        cache.clear();
        assert!(cache.is_empty());
        assert_eq!(cache.stats().hits, 1);
    }
}
