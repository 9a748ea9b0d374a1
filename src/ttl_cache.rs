// SPDX-License-Identifier: GPL-3.0-or-later

//! In-memory memoisation of async results with optional per-entry expiry.
//!
//! Each memoised call site owns one [`TtlCache`]; its key is the call's
//! arguments. Concurrent callers asking for the same key share a single
//! computation, and only successful results are stored.

use std::collections::HashMap;
use std::future::Future;
use std::hash::Hash;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use tokio::sync::OnceCell;

static GENERATION: AtomicU64 = AtomicU64::new(0);

/// Invalidate every entry of every cache in the process.
pub fn clear_all() {
    GENERATION.fetch_add(1, Ordering::SeqCst);
}

struct Entry<V> {
    cell: Arc<OnceCell<Stored<V>>>,
    generation: u64,
}

struct Stored<V> {
    value: V,
    expires_at: Option<Instant>,
}

impl<V> Entry<V> {
    fn is_stale(&self, now: Instant) -> bool {
        if self.generation != GENERATION.load(Ordering::SeqCst) {
            return true;
        }
        matches!(
            self.cell.get(),
            Some(Stored { expires_at: Some(at), .. }) if *at <= now
        )
    }
}

pub struct TtlCache<K, V> {
    ttl: Option<Duration>,
    entries: Mutex<HashMap<K, Entry<V>>>,
}

impl<K, V> TtlCache<K, V>
where
    K: Eq + Hash + Clone,
    V: Clone,
{
    /// `ttl = None` keeps entries until [`clear`](Self::clear) or [`clear_all`].
    pub fn new(ttl: Option<Duration>) -> Self {
        Self {
            ttl,
            entries: Mutex::new(HashMap::new()),
        }
    }

    /// Return the cached value for `key`, computing it with `init` on a miss.
    ///
    /// Callers that arrive while a computation for the same key is in flight
    /// wait for it instead of starting their own. A failed computation is not
    /// stored; the next waiter retries.
    pub async fn get_or_try_init<F, Fut, E>(&self, key: K, init: F) -> Result<V, E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<V, E>>,
    {
        let cell = self.cell_for(key);
        let ttl = self.ttl;
        let stored = cell
            .get_or_try_init(|| async move {
                let value = init().await?;
                Ok::<_, E>(Stored {
                    value,
                    expires_at: ttl.map(|ttl| Instant::now() + ttl),
                })
            })
            .await?;
        Ok(stored.value.clone())
    }

    /// Cached value for `key`, if present and fresh.
    pub fn get(&self, key: &K) -> Option<V> {
        let entries = self.lock();
        let entry = entries.get(key)?;
        if entry.is_stale(Instant::now()) {
            return None;
        }
        entry.cell.get().map(|stored| stored.value.clone())
    }

    pub fn invalidate(&self, key: &K) {
        self.lock().remove(key);
    }

    pub fn clear(&self) {
        self.lock().clear();
    }

    /// Number of stored entries, stale ones included until the next lookup.
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn cell_for(&self, key: K) -> Arc<OnceCell<Stored<V>>> {
        let mut entries = self.lock();
        let now = Instant::now();
        entries.retain(|_, entry| !entry.is_stale(now));
        if !entries.contains_key(&key) {
            entries.insert(
                key.clone(),
                Entry {
                    cell: Arc::new(OnceCell::new()),
                    generation: GENERATION.load(Ordering::SeqCst),
                },
            );
        }
        entries[&key].cell.clone()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<K, Entry<V>>> {
        self.entries.lock().unwrap_or_else(|p| p.into_inner())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[tokio::test]
    async fn concurrent_calls_share_one_computation() {
        let cache: TtlCache<String, u32> = TtlCache::new(None);
        let calls = AtomicUsize::new(0);
        let calls = &calls;

        let compute = move || async move {
            calls.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(20)).await;
            Ok::<_, ()>(7)
        };

        let (a, b) = tokio::join!(
            cache.get_or_try_init("k".to_string(), compute),
            cache.get_or_try_init("k".to_string(), compute),
        );
        assert_eq!(a, Ok(7));
        assert_eq!(b, Ok(7));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn failures_are_not_cached() {
        let cache: TtlCache<u8, u32> = TtlCache::new(None);
        let first = cache.get_or_try_init(1, || async { Err::<u32, _>("boom") }).await;
        assert_eq!(first, Err("boom"));

        let second = cache.get_or_try_init(1, || async { Ok::<_, &str>(3) }).await;
        assert_eq!(second, Ok(3));
        assert_eq!(cache.get(&1), Some(3));
    }

    #[tokio::test]
    async fn entries_expire_after_ttl() {
        let cache: TtlCache<u8, u32> = TtlCache::new(Some(Duration::from_millis(20)));
        cache
            .get_or_try_init(1, || async { Ok::<_, ()>(1) })
            .await
            .unwrap();
        assert_eq!(cache.get(&1), Some(1));

        tokio::time::sleep(Duration::from_millis(40)).await;
        assert_eq!(cache.get(&1), None);

        let again = cache.get_or_try_init(1, || async { Ok::<_, ()>(2) }).await;
        assert_eq!(again, Ok(2));
    }

    #[tokio::test]
    async fn expired_entries_are_dropped() {
        let cache: TtlCache<u8, u32> = TtlCache::new(Some(Duration::from_millis(20)));
        for key in 0..4 {
            cache
                .get_or_try_init(key, || async { Ok::<_, ()>(1) })
                .await
                .unwrap();
        }
        assert_eq!(cache.len(), 4);

        tokio::time::sleep(Duration::from_millis(40)).await;
        cache
            .get_or_try_init(9, || async { Ok::<_, ()>(1) })
            .await
            .unwrap();
        assert_eq!(cache.len(), 1);
    }

    #[tokio::test]
    async fn clear_forces_recomputation() {
        let cache: TtlCache<u8, u32> = TtlCache::new(None);
        cache
            .get_or_try_init(1, || async { Ok::<_, ()>(1) })
            .await
            .unwrap();
        cache.clear();
        assert_eq!(cache.get(&1), None);

        cache
            .get_or_try_init(1, || async { Ok::<_, ()>(5) })
            .await
            .unwrap();
        assert_eq!(cache.get(&1), Some(5));
    }

    #[tokio::test]
    async fn distinct_keys_are_independent() {
        let cache: TtlCache<&'static str, u32> = TtlCache::new(None);
        cache.get_or_try_init("a", || async { Ok::<_, ()>(1) }).await.unwrap();
        cache.get_or_try_init("b", || async { Ok::<_, ()>(2) }).await.unwrap();
        assert_eq!(cache.get(&"a"), Some(1));
        assert_eq!(cache.get(&"b"), Some(2));
        cache.invalidate(&"a");
        assert_eq!(cache.get(&"a"), None);
        assert_eq!(cache.get(&"b"), Some(2));
    }
}
