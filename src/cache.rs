//! Result Cache (spec §4.C). Two-tier TTL+LRU map keyed on
//! `(HostKey, canonicalized command, shaping spec)`. Dynamic entries are
//! evicted before static ones regardless of recency.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use crate::model::{CacheTier, CommandResult, HostKey};

struct Entry {
    host: HostKey,
    value: CommandResult,
    inserted_at: Instant,
    ttl: Duration,
    tier: CacheTier,
    accessed_at: Instant,
}

impl Entry {
    fn is_expired(&self, now: Instant) -> bool {
        now.duration_since(self.inserted_at) > self.ttl
    }
}

pub struct ResultCache {
    inner: Mutex<Inner>,
    max_entries: usize,
}

struct Inner {
    entries: HashMap<String, Entry>,
}

impl ResultCache {
    pub fn new(max_entries: usize) -> Self {
        Self { inner: Mutex::new(Inner { entries: HashMap::new() }), max_entries: max_entries.max(1) }
    }

    /// Returns the cached value iff present and not expired; an expired
    /// entry is removed and treated as a miss.
    pub fn get(&self, key: &str) -> Option<CommandResult> {
        let mut inner = self.inner.lock().expect("cache mutex poisoned");
        let now = Instant::now();
        let expired = inner.entries.get(key).is_some_and(|e| e.is_expired(now));
        if expired {
            inner.entries.remove(key);
            return None;
        }
        if let Some(entry) = inner.entries.get_mut(key) {
            entry.accessed_at = now;
            Some(entry.value.clone())
        } else {
            None
        }
    }

    pub fn put(&self, key: String, host: HostKey, value: CommandResult, tier: CacheTier, ttl: Duration) {
        let mut inner = self.inner.lock().expect("cache mutex poisoned");
        let now = Instant::now();
        evict_expired(&mut inner.entries, now);
        while inner.entries.len() >= self.max_entries && !inner.entries.contains_key(&key) {
            if !evict_one_lru(&mut inner.entries) {
                break;
            }
        }
        inner.entries.insert(
            key,
            Entry { host, value, inserted_at: now, ttl, tier, accessed_at: now },
        );
    }

    pub fn invalidate_host(&self, host: &HostKey) {
        let mut inner = self.inner.lock().expect("cache mutex poisoned");
        inner.entries.retain(|_, entry| &entry.host != host);
    }

    pub fn invalidate_all(&self) {
        let mut inner = self.inner.lock().expect("cache mutex poisoned");
        inner.entries.clear();
    }

    pub fn len(&self) -> usize {
        self.inner.lock().expect("cache mutex poisoned").entries.len()
    }
}

fn evict_expired(entries: &mut HashMap<String, Entry>, now: Instant) {
    entries.retain(|_, entry| !entry.is_expired(now));
}

/// Evicts the least-recently-used dynamic entry; only once no dynamic
/// entries remain does a static entry become eligible (spec invariant).
fn evict_one_lru(entries: &mut HashMap<String, Entry>) -> bool {
    let dynamic_victim = entries
        .iter()
        .filter(|(_, e)| e.tier == CacheTier::Dynamic)
        .min_by_key(|(_, e)| e.accessed_at)
        .map(|(k, _)| k.clone());

    let victim = dynamic_victim.or_else(|| entries.iter().min_by_key(|(_, e)| e.accessed_at).map(|(k, _)| k.clone()));

    match victim {
        Some(key) => {
            entries.remove(&key);
            true
        }
        None => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::ShapingMode;

    fn result(stdout: &str) -> CommandResult {
        CommandResult {
            stdout: stdout.to_string(),
            stderr: String::new(),
            exit_code: Some(0),
            duration_ms: 1,
            truncated: false,
            shaping_mode_used: ShapingMode::Full,
            from_cache: false,
            warnings: vec![],
        }
    }

    #[test]
    fn hit_returns_most_recent_put_within_ttl() {
        let cache = ResultCache::new(10);
        let host = HostKey::new("h", 22, "u");
        cache.put("k".into(), host.clone(), result("first"), CacheTier::Dynamic, Duration::from_secs(60));
        cache.put("k".into(), host, result("second"), CacheTier::Dynamic, Duration::from_secs(60));
        let hit = cache.get("k").expect("expected hit");
        assert_eq!(hit.stdout, "second");
    }

    #[test]
    fn miss_on_expired_ttl() {
        let cache = ResultCache::new(10);
        let host = HostKey::new("h", 22, "u");
        cache.put("k".into(), host, result("x"), CacheTier::Dynamic, Duration::from_millis(1));
        std::thread::sleep(Duration::from_millis(20));
        assert!(cache.get("k").is_none());
    }

    #[test]
    fn dynamic_evicted_before_static_at_capacity() {
        let cache = ResultCache::new(2);
        let host = HostKey::new("h", 22, "u");
        cache.put("static".into(), host.clone(), result("s"), CacheTier::Static, Duration::from_secs(60));
        cache.put("dynamic".into(), host.clone(), result("d"), CacheTier::Dynamic, Duration::from_secs(60));
        // Inserting a third entry must evict the dynamic one, not the static one.
        cache.put("dynamic2".into(), host, result("d2"), CacheTier::Dynamic, Duration::from_secs(60));
        assert!(cache.get("static").is_some());
        assert!(cache.get("dynamic").is_none());
        assert!(cache.get("dynamic2").is_some());
    }

    #[test]
    fn invalidate_host_removes_only_that_hosts_entries() {
        let cache = ResultCache::new(10);
        let h1 = HostKey::new("h1", 22, "u");
        let h2 = HostKey::new("h2", 22, "u");
        cache.put("a".into(), h1.clone(), result("a"), CacheTier::Dynamic, Duration::from_secs(60));
        cache.put("b".into(), h2, result("b"), CacheTier::Dynamic, Duration::from_secs(60));
        cache.invalidate_host(&h1);
        assert!(cache.get("a").is_none());
        assert!(cache.get("b").is_some());
    }

    #[test]
    fn max_entries_is_clamped_to_at_least_one() {
        let cache = ResultCache::new(0);
        let host = HostKey::new("h", 22, "u");
        cache.put("a".into(), host, result("a"), CacheTier::Dynamic, Duration::from_secs(60));
        assert_eq!(cache.len(), 1);
    }
}
