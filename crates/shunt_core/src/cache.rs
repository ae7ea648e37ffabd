//! Per-worker parsed-statement cache.
//!
//! Maps the canonical form of a statement to a shared, immutable parse
//! result. Strictly worker-local: no locks, no cross-worker sharing. A
//! lookup whose entry carries a stale version tag (dialect or parser
//! options changed) evicts the entry and reports a miss. When inserting
//! would exceed the byte budget, random victims are evicted until the
//! entry fits; if it cannot fit, the insert is silently dropped.

use std::collections::HashMap;

use rand::Rng;
use serde::Serialize;

use shunt_protocol::{SharedParse, VersionTag};

/// Fixed bookkeeping cost accounted per entry on top of the parse
/// result's own size.
const ENTRY_OVERHEAD: u64 = 96;

/// Absolute ceiling on a single entry, imposed by the largest statement
/// any supported wire protocol can carry.
const MAX_ENTRY_SIZE: u64 = 16 * 1024 * 1024;

/// Fraction of the nominal budget actually used. Parse results own heap
/// the accounting cannot see; the headroom absorbs it.
const BUDGET_SAFETY_FACTOR: f64 = 0.65;

/// Cache counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CacheStats {
    pub size: u64,
    pub entries: usize,
    pub inserts: u64,
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
}

/// One cached statement, for introspection snapshots.
#[derive(Debug, Clone, Serialize)]
pub struct CacheEntrySnapshot {
    pub canonical: String,
    pub hits: u64,
    pub size: u64,
}

struct Entry {
    parse: SharedParse,
    version: VersionTag,
    size: u64,
    hits: u64,
    /// Back-reference into `keys` for O(1) random eviction.
    key_slot: usize,
}

/// Worker-local statement cache with random eviction.
pub struct StatementCache {
    entries: HashMap<String, Entry>,
    /// Dense key index; a uniform random pick here is a uniform random
    /// entry.
    keys: Vec<String>,
    budget: u64,
    stats: CacheStats,
}

impl StatementCache {
    /// Build a cache from this worker's share of the global budget.
    pub fn new(per_worker_budget: u64) -> Self {
        Self {
            entries: HashMap::new(),
            keys: Vec::new(),
            budget: (per_worker_budget as f64 * BUDGET_SAFETY_FACTOR) as u64,
            stats: CacheStats::default(),
        }
    }

    /// Whether any entry can ever be retained.
    pub fn enabled(&self) -> bool {
        self.budget > 0
    }

    /// Look up the parse result for a canonical statement. A version
    /// mismatch evicts the stale entry and reports a miss.
    pub fn get(&mut self, canonical: &str, version: VersionTag) -> Option<SharedParse> {
        match self.entries.get_mut(canonical) {
            Some(entry) if entry.version == version => {
                entry.hits += 1;
                self.stats.hits += 1;
                Some(entry.parse.clone())
            }
            Some(_) => {
                self.remove(canonical);
                self.stats.misses += 1;
                None
            }
            None => {
                self.stats.misses += 1;
                None
            }
        }
    }

    /// Insert a freshly produced parse result. Oversized entries and
    /// entries that cannot fit after eviction are dropped silently:
    /// correctness is preserved, only cache effectiveness is reduced.
    pub fn insert(&mut self, canonical: &str, version: VersionTag, parse: SharedParse) {
        if self.entries.contains_key(canonical) {
            return;
        }
        let size = parse.size_bytes() as u64 + canonical.len() as u64 + ENTRY_OVERHEAD;
        if size > MAX_ENTRY_SIZE || size > self.budget {
            return;
        }
        while self.stats.size + size > self.budget && !self.entries.is_empty() {
            self.evict_random();
        }
        if self.stats.size + size > self.budget {
            return;
        }
        self.keys.push(canonical.to_string());
        self.entries.insert(
            canonical.to_string(),
            Entry {
                parse,
                version,
                size,
                hits: 0,
                key_slot: self.keys.len() - 1,
            },
        );
        self.stats.size += size;
        self.stats.inserts += 1;
        self.stats.entries = self.entries.len();
    }

    /// Shrink (or grow) the budget at runtime, evicting until the
    /// accounted size fits the new budget.
    pub fn set_budget(&mut self, per_worker_budget: u64) {
        self.budget = (per_worker_budget as f64 * BUDGET_SAFETY_FACTOR) as u64;
        while self.stats.size > self.budget && !self.entries.is_empty() {
            self.evict_random();
        }
    }

    fn evict_random(&mut self) {
        let victim_slot = rand::thread_rng().gen_range(0..self.keys.len());
        let victim = self.keys[victim_slot].clone();
        self.remove(&victim);
    }

    fn remove(&mut self, canonical: &str) {
        if let Some(entry) = self.entries.remove(canonical) {
            self.stats.size -= entry.size;
            self.stats.evictions += 1;
            self.stats.entries = self.entries.len();
            // Swap-remove the key and fix the moved entry's back-reference.
            self.keys.swap_remove(entry.key_slot);
            if let Some(moved) = self.keys.get(entry.key_slot) {
                let moved = moved.clone();
                if let Some(e) = self.entries.get_mut(&moved) {
                    e.key_slot = entry.key_slot;
                }
            }
        }
    }

    /// Drop every entry.
    pub fn clear(&mut self) {
        let n = self.entries.len() as u64;
        self.entries.clear();
        self.keys.clear();
        self.stats.size = 0;
        self.stats.entries = 0;
        self.stats.evictions += n;
    }

    pub fn stats(&self) -> CacheStats {
        self.stats
    }

    /// Accounted memory, for the worker's memory usage report.
    pub fn memory_bytes(&self) -> u64 {
        self.stats.size
    }

    /// Full entry listing for introspection. Collected per worker via a
    /// serial broadcast to bound peak memory.
    pub fn snapshot(&self) -> Vec<CacheEntrySnapshot> {
        self.entries
            .iter()
            .map(|(canonical, entry)| CacheEntrySnapshot {
                canonical: canonical.clone(),
                hits: entry.hits,
                size: entry.size,
            })
            .collect()
    }
}

/// Ties one statement's lookup to its eventual insertion.
///
/// On construction the scope performs the lookup; if the statement was
/// not cached the caller parses and hands the result to `produced`. When
/// the scope drops, a newly parsed result is inserted unless the
/// statement is in the exclusion class (connection-state mutators must
/// not be served from cache).
pub struct CacheScope<'a> {
    cache: &'a mut StatementCache,
    canonical: String,
    version: VersionTag,
    hit: Option<SharedParse>,
    pending: Option<SharedParse>,
    excluded: bool,
}

impl<'a> CacheScope<'a> {
    pub fn enter(cache: &'a mut StatementCache, canonical: &str, version: VersionTag) -> Self {
        let hit = cache.get(canonical, version);
        Self {
            cache,
            canonical: canonical.to_string(),
            version,
            hit,
            pending: None,
            excluded: false,
        }
    }

    /// The cached result, when the lookup hit.
    pub fn hit(&self) -> Option<SharedParse> {
        self.hit.clone()
    }

    /// Record the freshly parsed result for insertion at scope end.
    pub fn produced(&mut self, parse: SharedParse, excluded: bool) {
        self.pending = Some(parse);
        self.excluded = excluded;
    }
}

impl Drop for CacheScope<'_> {
    fn drop(&mut self) {
        if self.hit.is_none() && !self.excluded {
            if let Some(parse) = self.pending.take() {
                self.cache.insert(&self.canonical, self.version, parse);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use shunt_protocol::{ParseInfo, SqlDialect};

    struct FakeParse {
        size: usize,
    }

    impl ParseInfo for FakeParse {
        fn size_bytes(&self) -> usize {
            self.size
        }
        fn as_any(&self) -> &dyn std::any::Any {
            self
        }
    }

    fn parse(size: usize) -> SharedParse {
        Arc::new(FakeParse { size })
    }

    fn cache(budget: u64) -> StatementCache {
        // Undo the safety factor so tests can reason in exact bytes.
        StatementCache::new((budget as f64 / BUDGET_SAFETY_FACTOR).ceil() as u64)
    }

    #[test]
    fn test_insert_then_get() {
        let mut c = cache(10_000);
        c.insert("select ?", VersionTag::default(), parse(100));
        assert!(c.get("select ?", VersionTag::default()).is_some());
        let stats = c.stats();
        assert_eq!(stats.inserts, 1);
        assert_eq!(stats.hits, 1);
        assert!(stats.size > 0);
    }

    #[test]
    fn test_miss_recorded() {
        let mut c = cache(10_000);
        assert!(c.get("select ?", VersionTag::default()).is_none());
        assert_eq!(c.stats().misses, 1);
    }

    #[test]
    fn test_repeated_hits_do_not_grow() {
        let mut c = cache(10_000);
        c.insert("select ?", VersionTag::default(), parse(100));
        let size = c.stats().size;
        for _ in 0..20 {
            assert!(c.get("select ?", VersionTag::default()).is_some());
        }
        assert_eq!(c.stats().hits, 20);
        assert_eq!(c.stats().size, size);
    }

    #[test]
    fn test_version_mismatch_evicts_and_misses() {
        let mut c = cache(10_000);
        let v1 = VersionTag::new(SqlDialect::Default, 0);
        let v2 = VersionTag::new(SqlDialect::Oracle, 0);
        c.insert("select x", v1, parse(100));
        assert!(c.get("select x", v2).is_none());
        let stats = c.stats();
        assert_eq!(stats.misses, 1);
        assert_eq!(stats.evictions, 1);
        assert_eq!(stats.entries, 0);
        assert_eq!(stats.size, 0);
    }

    #[test]
    fn test_zero_budget_retains_nothing() {
        let mut c = StatementCache::new(0);
        assert!(!c.enabled());
        c.insert("select ?", VersionTag::default(), parse(100));
        assert!(c.get("select ?", VersionTag::default()).is_none());
        assert_eq!(c.stats().entries, 0);
        assert_eq!(c.stats().inserts, 0);
        assert_eq!(c.stats().misses, 1);
    }

    #[test]
    fn test_oversized_entry_dropped_silently() {
        let mut c = cache(10_000);
        c.insert("big", VersionTag::default(), parse(20_000));
        assert_eq!(c.stats().inserts, 0);
        c.insert("huge", VersionTag::default(), parse(MAX_ENTRY_SIZE as usize + 1));
        assert_eq!(c.stats().inserts, 0);
    }

    #[test]
    fn test_eviction_keeps_size_within_budget() {
        let mut c = cache(4_000);
        for i in 0..40 {
            c.insert(&format!("stmt {i}"), VersionTag::default(), parse(500));
        }
        let stats = c.stats();
        assert!(stats.evictions > 0, "budget pressure must evict");
        assert!(stats.size <= 4_000, "size {} over budget", stats.size);
        assert_eq!(stats.entries, c.snapshot().len());
    }

    #[test]
    fn test_budget_shrink_evicts_to_fit() {
        let mut c = cache(10_000);
        for i in 0..10 {
            c.insert(&format!("stmt {i}"), VersionTag::default(), parse(500));
        }
        let before = c.stats().size;
        c.set_budget(2_000);
        assert!(c.stats().size < before);
        assert!(c.stats().size <= (2_000f64 * BUDGET_SAFETY_FACTOR) as u64);
    }

    #[test]
    fn test_scope_inserts_on_drop() {
        let mut c = cache(10_000);
        {
            let mut scope = CacheScope::enter(&mut c, "select ?", VersionTag::default());
            assert!(scope.hit().is_none());
            scope.produced(parse(64), false);
        }
        assert_eq!(c.stats().inserts, 1);
        assert!(c.get("select ?", VersionTag::default()).is_some());
    }

    #[test]
    fn test_scope_respects_exclusion_class() {
        let mut c = cache(10_000);
        {
            let mut scope = CacheScope::enter(&mut c, "set autocommit=?", VersionTag::default());
            scope.produced(parse(64), true);
        }
        assert_eq!(c.stats().inserts, 0);
    }

    #[test]
    fn test_scope_hit_does_not_reinsert() {
        let mut c = cache(10_000);
        c.insert("select ?", VersionTag::default(), parse(64));
        let inserts = c.stats().inserts;
        {
            let scope = CacheScope::enter(&mut c, "select ?", VersionTag::default());
            assert!(scope.hit().is_some());
        }
        assert_eq!(c.stats().inserts, inserts);
    }

    #[test]
    fn test_clear() {
        let mut c = cache(10_000);
        c.insert("a", VersionTag::default(), parse(10));
        c.insert("b", VersionTag::default(), parse(10));
        c.clear();
        assert_eq!(c.stats().entries, 0);
        assert_eq!(c.stats().size, 0);
        assert_eq!(c.memory_bytes(), 0);
    }
}
