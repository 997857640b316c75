#![forbid(unsafe_code)]

use crate::clock::Clock;
use crate::domain::Symbol;
use parking_lot::Mutex;
use rustc_hash::FxHashMap;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

#[derive(Debug, Clone)]
struct CacheEntry {
    symbol: Symbol,
    cached_at: Instant,
    last_used: u64,
}

#[derive(Debug, Default)]
struct Inner {
    entries: FxHashMap<u64, CacheEntry>,
    /// Use stamp -> instruction pointer, oldest first.
    recency: BTreeMap<u64, u64>,
    tick: u64,
}

impl Inner {
    fn touch(&mut self, ip: u64) {
        self.tick += 1;
        let tick = self.tick;
        if let Some(entry) = self.entries.get_mut(&ip) {
            self.recency.remove(&entry.last_used);
            entry.last_used = tick;
            self.recency.insert(tick, ip);
        }
    }

    fn remove(&mut self, ip: u64) {
        if let Some(entry) = self.entries.remove(&ip) {
            self.recency.remove(&entry.last_used);
        }
    }

    fn evict_oldest(&mut self) -> Option<u64> {
        let (_, ip) = self.recency.pop_first()?;
        self.entries.remove(&ip);
        Some(ip)
    }
}

/// Resolved symbols keyed by instruction pointer.
///
/// Entries older than the TTL are dropped when looked up; when the cache
/// grows past its capacity the least recently used entry goes.
pub struct SymbolCache {
    inner: Mutex<Inner>,
    capacity: usize,
    ttl: Duration,
    clock: Arc<dyn Clock>,
}

impl std::fmt::Debug for SymbolCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SymbolCache")
            .field("len", &self.len())
            .field("capacity", &self.capacity)
            .field("ttl", &self.ttl)
            .finish()
    }
}

impl SymbolCache {
    pub const DEFAULT_CAPACITY: usize = 1000;
    pub const DEFAULT_TTL: Duration = Duration::from_secs(3600);

    pub fn new(capacity: usize, ttl: Duration, clock: Arc<dyn Clock>) -> Self {
        Self {
            inner: Mutex::new(Inner::default()),
            capacity: capacity.max(1),
            ttl,
            clock,
        }
    }

    pub fn get(&self, ip: u64) -> Option<Symbol> {
        let now = self.clock.now();
        let mut inner = self.inner.lock();
        let cached_at = inner.entries.get(&ip)?.cached_at;
        if now.saturating_duration_since(cached_at) > self.ttl {
            inner.remove(ip);
            return None;
        }
        inner.touch(ip);
        inner.entries.get(&ip).map(|e| e.symbol.clone())
    }

    pub fn set(&self, ip: u64, symbol: Symbol) {
        let cached_at = self.clock.now();
        let mut inner = self.inner.lock();
        inner.remove(ip);
        inner.entries.insert(
            ip,
            CacheEntry {
                symbol,
                cached_at,
                last_used: 0,
            },
        );
        inner.touch(ip);
        while inner.entries.len() > self.capacity {
            if inner.evict_oldest().is_none() {
                break;
            }
        }
    }

    pub fn len(&self) -> usize {
        self.inner.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn clear(&self) {
        *self.inner.lock() = Inner::default();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;

    fn symbol(name: &str) -> Symbol {
        Symbol {
            function: name.into(),
            file: "lib.rs".into(),
            line: 1,
        }
    }

    fn cache(capacity: usize) -> (SymbolCache, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::new());
        (
            SymbolCache::new(capacity, SymbolCache::DEFAULT_TTL, clock.clone()),
            clock,
        )
    }

    #[test]
    fn entries_expire_after_ttl() {
        let (cache, clock) = cache(10);
        cache.set(0x1000, symbol("f"));

        clock.advance(Duration::from_secs(100));
        assert_eq!(cache.get(0x1000), Some(symbol("f")));

        clock.advance(Duration::from_secs(3501));
        assert_eq!(cache.get(0x1000), None);
        assert!(cache.is_empty());
    }

    #[test]
    fn least_recently_used_is_evicted() {
        let (cache, _) = cache(3);
        for ip in 1..=3 {
            cache.set(ip, symbol(&format!("f{ip}")));
        }
        cache.set(4, symbol("f4"));

        assert_eq!(cache.len(), 3);
        assert_eq!(cache.get(1), None);
        assert!(cache.get(2).is_some());
        assert!(cache.get(4).is_some());
    }

    #[test]
    fn access_refreshes_recency() {
        let (cache, _) = cache(2);
        cache.set(1, symbol("a"));
        cache.set(2, symbol("b"));
        assert!(cache.get(1).is_some());
        cache.set(3, symbol("c"));

        assert!(cache.get(1).is_some());
        assert_eq!(cache.get(2), None);
    }

    #[test]
    fn reinsert_replaces_and_restarts_ttl() {
        let (cache, clock) = cache(2);
        cache.set(7, symbol("old"));
        clock.advance(Duration::from_secs(3000));
        cache.set(7, symbol("new"));
        clock.advance(Duration::from_secs(3000));
        assert_eq!(cache.get(7), Some(symbol("new")));
        assert_eq!(cache.len(), 1);
    }
}
