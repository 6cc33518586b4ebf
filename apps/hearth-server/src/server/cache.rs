use std::{
    collections::HashMap,
    hash::Hash,
    sync::{Arc, RwLock},
    time::{Duration, Instant},
};

use tokio::sync::watch;

#[derive(Debug, Clone)]
struct Entry<V> {
    value: V,
    expires_at: Instant,
}

/// Generic in-memory key/value store with per-entry expiry.
///
/// Reads take the shared side of the lock and treat a lapsed entry as a
/// miss without evicting it; physical removal happens in a background sweep
/// whose interval is decoupled from the TTL so sweeps run less often than
/// entries expire. Call [`TtlCache::close`] when the cache is discarded so
/// the sweep task is not leaked.
pub(crate) struct TtlCache<K, V> {
    entries: RwLock<HashMap<K, Entry<V>>>,
    ttl: Duration,
    stop_tx: watch::Sender<bool>,
}

impl<K, V> TtlCache<K, V>
where
    K: Eq + Hash + Clone + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
{
    fn new(ttl: Duration) -> Self {
        let (stop_tx, _stop_rx) = watch::channel(false);
        Self {
            entries: RwLock::new(HashMap::new()),
            ttl,
            stop_tx,
        }
    }

    /// Build the cache and spawn its sweep task. Must run inside a tokio
    /// runtime.
    pub(crate) fn start(ttl: Duration, sweep_interval: Duration) -> Arc<Self> {
        let cache = Arc::new(Self::new(ttl));
        let sweeper = Arc::clone(&cache);
        let mut stop_rx = cache.stop_tx.subscribe();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(sweep_interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = ticker.tick() => sweeper.evict_expired(Instant::now()),
                    changed = stop_rx.changed() => {
                        if changed.is_err() || *stop_rx.borrow() {
                            break;
                        }
                    }
                }
            }
        });
        cache
    }

    pub(crate) fn get(&self, key: &K) -> Option<V> {
        self.get_at(key, Instant::now())
    }

    fn get_at(&self, key: &K, now: Instant) -> Option<V> {
        let entries = self
            .entries
            .read()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        let entry = entries.get(key)?;
        if now >= entry.expires_at {
            return None;
        }
        Some(entry.value.clone())
    }

    pub(crate) fn set(&self, key: K, value: V) {
        self.set_at(key, value, Instant::now());
    }

    fn set_at(&self, key: K, value: V, now: Instant) {
        let mut entries = self
            .entries
            .write()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        entries.insert(
            key,
            Entry {
                value,
                expires_at: now + self.ttl,
            },
        );
    }

    pub(crate) fn delete(&self, key: &K) {
        let mut entries = self
            .entries
            .write()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        entries.remove(key);
    }

    /// Bulk invalidation: remove every entry whose key matches the
    /// predicate. Used when one upstream mutation invalidates many derived
    /// entries at once.
    pub(crate) fn delete_func(&self, predicate: impl Fn(&K) -> bool) {
        let mut entries = self
            .entries
            .write()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        entries.retain(|key, _| !predicate(key));
    }

    pub(crate) fn clear(&self) {
        let mut entries = self
            .entries
            .write()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        entries.clear();
    }

    /// Total entry count, lapsed entries included.
    pub(crate) fn len(&self) -> usize {
        self.entries
            .read()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .len()
    }

    /// Stop the background sweep task.
    pub(crate) fn close(&self) {
        let _ = self.stop_tx.send(true);
    }

    fn evict_expired(&self, now: Instant) {
        let mut entries = self
            .entries
            .write()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        entries.retain(|_, entry| entry.expires_at > now);
    }
}

#[cfg(test)]
mod tests {
    use std::time::{Duration, Instant};

    use super::TtlCache;

    #[test]
    fn set_then_get_returns_value_until_ttl_elapses() {
        let cache: TtlCache<String, u64> = TtlCache::new(Duration::from_secs(30));
        let now = Instant::now();

        cache.set_at(String::from("user:tenant"), 48, now);
        assert_eq!(
            cache.get_at(&String::from("user:tenant"), now + Duration::from_secs(29)),
            Some(48)
        );
        assert_eq!(
            cache.get_at(&String::from("user:tenant"), now + Duration::from_secs(30)),
            None
        );
    }

    #[test]
    fn lapsed_entries_stay_resident_until_swept() {
        let cache: TtlCache<String, u64> = TtlCache::new(Duration::from_secs(1));
        let now = Instant::now();

        cache.set_at(String::from("k"), 1, now);
        assert_eq!(cache.get_at(&String::from("k"), now + Duration::from_secs(2)), None);
        assert_eq!(cache.len(), 1);

        cache.evict_expired(now + Duration::from_secs(2));
        assert_eq!(cache.len(), 0);
    }

    #[test]
    fn delete_and_clear_remove_entries() {
        let cache: TtlCache<String, u64> = TtlCache::new(Duration::from_secs(30));
        cache.set(String::from("a"), 1);
        cache.set(String::from("b"), 2);

        cache.delete(&String::from("a"));
        assert_eq!(cache.get(&String::from("a")), None);
        assert_eq!(cache.get(&String::from("b")), Some(2));

        cache.clear();
        assert_eq!(cache.len(), 0);
    }

    #[test]
    fn delete_func_invalidates_by_predicate() {
        let cache: TtlCache<String, u64> = TtlCache::new(Duration::from_secs(30));
        cache.set(String::from("u1:t1"), 1);
        cache.set(String::from("u1:t1:c9"), 2);
        cache.set(String::from("u2:t1"), 3);

        cache.delete_func(|key| key.starts_with("u1:t1"));
        assert_eq!(cache.get(&String::from("u1:t1")), None);
        assert_eq!(cache.get(&String::from("u1:t1:c9")), None);
        assert_eq!(cache.get(&String::from("u2:t1")), Some(3));
    }

    #[test]
    fn overwrite_refreshes_expiry() {
        let cache: TtlCache<String, u64> = TtlCache::new(Duration::from_secs(10));
        let now = Instant::now();

        cache.set_at(String::from("k"), 1, now);
        cache.set_at(String::from("k"), 2, now + Duration::from_secs(8));
        assert_eq!(
            cache.get_at(&String::from("k"), now + Duration::from_secs(15)),
            Some(2)
        );
    }

    #[tokio::test]
    async fn background_sweep_evicts_and_stops_on_close() {
        let cache: std::sync::Arc<TtlCache<String, u64>> =
            TtlCache::start(Duration::from_millis(10), Duration::from_millis(20));
        cache.set(String::from("ephemeral"), 7);
        tokio::time::sleep(Duration::from_millis(60)).await;
        assert_eq!(cache.len(), 0);
        cache.close();
    }
}
