//! Bounded cache of assembled rule-sets.
//!
//! Thread-safe LRU keyed by rule-set id, with an optional per-entry TTL and
//! hit/miss/eviction counters. Reload events invalidate entries; the TTL is
//! a backstop for deployments running without a reload strategy.

use crate::rule_set::RateLimitRuleSet;
use lru::LruCache;
use parking_lot::Mutex;
use std::num::NonZeroUsize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

struct Entry {
    rule_set: Arc<RateLimitRuleSet>,
    inserted_at: Instant,
}

/// Point-in-time cache counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
    pub size: usize,
}

/// Thread-safe, bounded rule-set cache with approximate LRU eviction.
pub struct RuleCache {
    entries: Mutex<LruCache<String, Entry>>,
    ttl: Option<Duration>,
    hits: AtomicU64,
    misses: AtomicU64,
    evictions: AtomicU64,
}

impl RuleCache {
    /// `max_size` bounds the entry count; `ttl == None` disables expiry.
    pub fn new(max_size: usize, ttl: Option<Duration>) -> Self {
        let cap = NonZeroUsize::new(max_size.max(1)).expect("max(1) is non-zero");
        Self {
            entries: Mutex::new(LruCache::new(cap)),
            ttl,
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            evictions: AtomicU64::new(0),
        }
    }

    pub fn get(&self, rule_set_id: &str) -> Option<Arc<RateLimitRuleSet>> {
        let mut entries = self.entries.lock();
        if let Some(entry) = entries.get(rule_set_id) {
            if let Some(ttl) = self.ttl {
                if entry.inserted_at.elapsed() >= ttl {
                    entries.pop(rule_set_id);
                    self.misses.fetch_add(1, Ordering::Relaxed);
                    return None;
                }
            }
            self.hits.fetch_add(1, Ordering::Relaxed);
            return Some(Arc::clone(&entry.rule_set));
        }
        self.misses.fetch_add(1, Ordering::Relaxed);
        None
    }

    pub fn put(&self, rule_set: Arc<RateLimitRuleSet>) {
        let mut entries = self.entries.lock();
        let evicting = entries.len() == usize::from(entries.cap())
            && !entries.contains(rule_set.id.as_str());
        if evicting {
            self.evictions.fetch_add(1, Ordering::Relaxed);
        }
        entries.put(
            rule_set.id.clone(),
            Entry {
                rule_set,
                inserted_at: Instant::now(),
            },
        );
    }

    /// Drops one entry; absent ids are a no-op.
    pub fn invalidate(&self, rule_set_id: &str) -> bool {
        self.entries.lock().pop(rule_set_id).is_some()
    }

    pub fn invalidate_all(&self) {
        self.entries.lock().clear();
    }

    /// Snapshot of the currently cached ids.
    pub fn cached_rule_set_ids(&self) -> Vec<String> {
        self.entries
            .lock()
            .iter()
            .map(|(id, _)| id.clone())
            .collect()
    }

    pub fn size(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn stats(&self) -> CacheStats {
        CacheStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            evictions: self.evictions.load(Ordering::Relaxed),
            size: self.size(),
        }
    }
}
