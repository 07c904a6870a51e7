//! Bounded, concurrent address cache with score decay and LRU fallback (§4.3).

use crate::config::Config;
use dashmap::DashMap;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use sysinfo::System;

/// Snapshot of cache statistics, as returned by `/batch/status` (§6).
#[derive(Debug, Clone, serde::Serialize)]
pub struct CacheStats {
    pub size: usize,
    pub max_size: usize,
    pub hits: u64,
    pub misses: u64,
    pub skipped_db_ops: u64,
    pub utilization_percent: f64,
}

struct CacheTuning {
    enabled: bool,
    max_size: usize,
    default_value: i64,
    decay_amount: i64,
    lru_eviction_enabled: bool,
    batch_eviction_size: usize,
    memory_check_enabled: bool,
    target_memory_percent: f64,
    min_cache_size: usize,
}

impl From<&Config> for CacheTuning {
    fn from(cfg: &Config) -> Self {
        Self {
            enabled: cfg.cache_enabled,
            max_size: cfg.cache_max_size,
            default_value: cfg.cache_default_value,
            decay_amount: cfg.cache_decay_amount,
            lru_eviction_enabled: cfg.cache_lru_eviction_enabled,
            batch_eviction_size: cfg.cache_batch_eviction_size,
            memory_check_enabled: cfg.cache_memory_check_enabled,
            target_memory_percent: cfg.cache_target_memory_percent,
            min_cache_size: cfg.cache_min_cache_size,
        }
    }
}

/// Concurrent `address -> score` map with a separately-locked LRU order list.
///
/// The map (`DashMap`) supports concurrent readers/writers and per-key
/// atomic score updates without taking the LRU lock; the LRU list is the
/// only lock in the structure, and every touch is an O(1) remove-then-append.
pub struct AddressCache {
    tuning: CacheTuning,
    scores: DashMap<String, AtomicI64>,
    lru: Mutex<VecDeque<String>>,
    hits: AtomicU64,
    misses: AtomicU64,
    skipped_db_ops: AtomicU64,
}

impl AddressCache {
    pub fn new(config: &Config) -> Self {
        Self {
            tuning: CacheTuning::from(config),
            scores: DashMap::new(),
            lru: Mutex::new(VecDeque::new()),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            skipped_db_ops: AtomicU64::new(0),
        }
    }

    fn touch_lru(&self, address: &str) {
        let mut lru = self.lru.lock();
        if let Some(pos) = lru.iter().position(|a| a == address) {
            lru.remove(pos);
        }
        lru.push_back(address.to_string());
    }

    /// If present: boost the score, mark most-recently-used, count a hit and
    /// a skipped DB op, return true. If absent: count a miss, return false.
    pub fn check_and_boost(&self, address: &str) -> bool {
        if !self.tuning.enabled {
            self.misses.fetch_add(1, Ordering::Relaxed);
            return false;
        }
        match self.scores.get(address) {
            Some(score) => {
                score.fetch_add(self.tuning.default_value, Ordering::AcqRel);
                self.touch_lru(address);
                self.hits.fetch_add(1, Ordering::Relaxed);
                self.skipped_db_ops.fetch_add(1, Ordering::Relaxed);
                true
            }
            None => {
                self.misses.fetch_add(1, Ordering::Relaxed);
                false
            }
        }
    }

    /// Insert `address` with the default score if absent. No-op if present.
    /// If the cache is at capacity, runs a decay-and-evict pass first;
    /// existing entries keep priority if that pass doesn't free headroom.
    pub fn add_if_absent(&self, address: &str) {
        if !self.tuning.enabled || self.scores.contains_key(address) {
            return;
        }
        if self.scores.len() >= self.tuning.max_size {
            self.decay_and_evict();
            if self.scores.len() >= self.tuning.max_size {
                return;
            }
        }
        if let dashmap::mapref::entry::Entry::Vacant(entry) = self.scores.entry(address.to_string())
        {
            entry.insert(AtomicI64::new(self.tuning.default_value));
            self.lru.lock().push_back(address.to_string());
        }
    }

    /// Bulk form of [`AddressCache::add_if_absent`].
    pub fn add_all<'a>(&self, addresses: impl IntoIterator<Item = &'a String>) {
        for address in addresses {
            self.add_if_absent(address);
        }
    }

    /// One decay sweep: subtract `decay_amount` from every score; remove
    /// entries that reach `<= 0`. If still at capacity and LRU eviction is
    /// enabled, remove the oldest entries in a batch. If memory-pressure
    /// monitoring is enabled and the process is over its heap-use threshold,
    /// shrink aggressively down to 80% of size (never below the floor).
    pub fn decay_and_evict(&self) {
        let mut expired = Vec::new();
        for entry in self.scores.iter() {
            let new_score = entry
                .value()
                .fetch_sub(self.tuning.decay_amount, Ordering::AcqRel)
                - self.tuning.decay_amount;
            if new_score <= 0 {
                expired.push(entry.key().clone());
            }
        }
        if !expired.is_empty() {
            for key in &expired {
                self.scores.remove(key);
            }
            let mut lru = self.lru.lock();
            lru.retain(|k| !expired.contains(k));
        }

        if self.scores.len() >= self.tuning.max_size && self.tuning.lru_eviction_enabled {
            self.evict_lru_batch(self.tuning.batch_eviction_size);
        }

        if self.tuning.memory_check_enabled {
            if let Some(ratio) = self.heap_use_ratio() {
                if ratio > self.tuning.target_memory_percent / 100.0 {
                    let target = std::cmp::max(
                        self.tuning.min_cache_size,
                        (self.scores.len() as f64 * 0.8) as usize,
                    );
                    self.shrink_to(target);
                }
            }
        }
    }

    fn evict_lru_batch(&self, count: usize) {
        let victims: Vec<String> = {
            let mut lru = self.lru.lock();
            let n = std::cmp::min(count, lru.len());
            lru.drain(..n).collect()
        };
        for victim in victims {
            self.scores.remove(&victim);
        }
    }

    fn shrink_to(&self, target_size: usize) {
        while self.scores.len() > target_size {
            let oldest = { self.lru.lock().pop_front() };
            match oldest {
                Some(address) => {
                    self.scores.remove(&address);
                }
                None => break,
            }
        }
    }

    fn heap_use_ratio(&self) -> Option<f64> {
        let mut system = System::new();
        system.refresh_memory();
        let total = system.total_memory();
        if total == 0 {
            return None;
        }
        Some(system.used_memory() as f64 / total as f64)
    }

    /// Zero the per-batch hit/miss/skip counters without touching entries.
    pub fn reset_batch_counters(&self) {
        self.hits.store(0, Ordering::Relaxed);
        self.misses.store(0, Ordering::Relaxed);
        self.skipped_db_ops.store(0, Ordering::Relaxed);
    }

    pub fn stats_snapshot(&self) -> CacheStats {
        let size = self.scores.len();
        let max_size = self.tuning.max_size;
        CacheStats {
            size,
            max_size,
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            skipped_db_ops: self.skipped_db_ops.load(Ordering::Relaxed),
            utilization_percent: if max_size == 0 {
                0.0
            } else {
                100.0 * size as f64 / max_size as f64
            },
        }
    }

    #[cfg(test)]
    pub fn lru_keys(&self) -> Vec<String> {
        self.lru.lock().iter().cloned().collect()
    }

    #[cfg(test)]
    pub fn score_of(&self, address: &str) -> Option<i64> {
        self.scores.get(address).map(|s| s.load(Ordering::Acquire))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    fn cache_with(max_size: usize, default_value: i64, decay_amount: i64) -> AddressCache {
        let mut config = Config::for_testing();
        config.cache_max_size = max_size;
        config.cache_default_value = default_value;
        config.cache_decay_amount = decay_amount;
        AddressCache::new(&config)
    }

    #[test]
    fn miss_then_add_then_hit() {
        let cache = cache_with(10, 50, 2);
        assert!(!cache.check_and_boost("0xA"));
        cache.add_if_absent("0xA");
        assert!(cache.check_and_boost("0xA"));
        assert_eq!(cache.score_of("0xA"), Some(100));
        let stats = cache.stats_snapshot();
        assert_eq!(stats.hits, 1);
        assert_eq!(stats.misses, 1);
        assert_eq!(stats.skipped_db_ops, 1);
    }

    #[test]
    fn lru_key_set_matches_map_key_set() {
        let cache = cache_with(100, 50, 2);
        for addr in ["0xA", "0xB", "0xC"] {
            cache.add_if_absent(addr);
        }
        let lru: HashSet<String> = cache.lru_keys().into_iter().collect();
        let expected: HashSet<String> = ["0xA", "0xB", "0xC"]
            .iter()
            .map(|s| s.to_string())
            .collect();
        assert_eq!(lru, expected);
    }

    #[test]
    fn decay_removes_entries_at_or_below_zero() {
        let cache = cache_with(100, 4, 5);
        cache.add_if_absent("0xA");
        cache.decay_and_evict();
        assert!(cache.score_of("0xA").is_none());
    }

    #[test]
    fn decay_eviction_scenario_s5() {
        let cache = cache_with(4, 10, 5);
        for addr in ["A", "B", "C", "D"] {
            cache.add_if_absent(addr);
        }
        assert!(cache.check_and_boost("A")); // score 20
        assert!(cache.check_and_boost("B")); // score 20
        cache.add_if_absent("E"); // triggers decay: C, D drop to 5 -> 0 and are removed
        assert!(cache.score_of("C").is_none());
        assert!(cache.score_of("D").is_none());
        assert!(cache.score_of("E").is_some());
        assert!(cache.stats_snapshot().size <= 4);
    }

    #[test]
    fn size_never_exceeds_capacity() {
        let cache = cache_with(3, 10, 1);
        for i in 0..20 {
            cache.add_if_absent(&format!("addr-{i}"));
            assert!(cache.stats_snapshot().size <= 3);
        }
    }

    #[test]
    fn disabled_cache_always_misses() {
        let mut config = Config::for_testing();
        config.cache_enabled = false;
        let cache = AddressCache::new(&config);
        cache.add_if_absent("0xA");
        assert!(!cache.check_and_boost("0xA"));
    }

    #[test]
    fn reset_batch_counters_does_not_touch_entries() {
        let cache = cache_with(10, 50, 2);
        cache.add_if_absent("0xA");
        cache.check_and_boost("0xA");
        cache.reset_batch_counters();
        let stats = cache.stats_snapshot();
        assert_eq!(stats.hits, 0);
        assert_eq!(stats.misses, 0);
        assert_eq!(stats.skipped_db_ops, 0);
        assert_eq!(cache.score_of("0xA"), Some(100));
    }
}
