use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{Mutex, OnceCell};
use tokio::time::Instant;

/// Per-thread values bounded by capacity (least recently used goes first) and
/// idle time. Each key owns an init cell: concurrent callers with the same key
/// always end up with the same value, and building one key's value does not
/// hold up lookups for other keys.
pub struct SessionCache<T> {
    inner: Mutex<Slots<T>>,
    capacity: usize,
    ttl: Duration,
}

struct Slots<T> {
    entries: HashMap<String, Slot<T>>,
    clock: u64,
}

struct Slot<T> {
    cell: Arc<OnceCell<Arc<Mutex<T>>>>,
    last_used: Instant,
    recency: u64,
}

impl<T> SessionCache<T> {
    pub fn new(capacity: usize, ttl: Duration) -> Self {
        Self {
            inner: Mutex::new(Slots { entries: HashMap::new(), clock: 0 }),
            capacity: capacity.max(1),
            ttl,
        }
    }

    /// Returns the live value for `key`, building it with `factory` when it is
    /// absent or expired. The flag is `true` when this call built the value.
    pub async fn get_or_create<F, Fut>(&self, key: &str, factory: F) -> (Arc<Mutex<T>>, bool)
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = T>,
    {
        let cell = self.claim(key).await;

        let mut created = false;
        let built = &mut created;
        let value = cell
            .get_or_init(|| async move {
                *built = true;
                Arc::new(Mutex::new(factory().await))
            })
            .await;
        (Arc::clone(value), created)
    }

    /// Finds or reserves the slot for `key` under the map lock.
    async fn claim(&self, key: &str) -> Arc<OnceCell<Arc<Mutex<T>>>> {
        let mut slots = self.inner.lock().await;
        let now = Instant::now();
        slots.clock += 1;
        let recency = slots.clock;

        if let Some(slot) = slots.entries.get_mut(key) {
            if now.duration_since(slot.last_used) <= self.ttl {
                slot.last_used = now;
                slot.recency = recency;
                return Arc::clone(&slot.cell);
            }
            tracing::debug!(event_name = "agent.session.expired", thread_id = key, "session expired");
        }
        slots.entries.remove(key);

        if slots.entries.len() >= self.capacity {
            let ttl = self.ttl;
            slots.entries.retain(|_, slot| now.duration_since(slot.last_used) <= ttl);
        }
        while slots.entries.len() >= self.capacity {
            let oldest = slots
                .entries
                .iter()
                .min_by_key(|(_, slot)| slot.recency)
                .map(|(key, _)| key.clone());
            match oldest {
                Some(oldest) => {
                    tracing::debug!(event_name = "agent.session.evicted", thread_id = %oldest, "session evicted");
                    slots.entries.remove(&oldest);
                }
                None => break,
            }
        }

        let cell = Arc::new(OnceCell::new());
        slots.entries.insert(
            key.to_string(),
            Slot { cell: Arc::clone(&cell), last_used: now, recency },
        );
        cell
    }

    pub async fn len(&self) -> usize {
        self.inner.lock().await.entries.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    pub async fn contains(&self, key: &str) -> bool {
        self.inner.lock().await.entries.contains_key(key)
    }

    pub async fn remove(&self, key: &str) -> bool {
        self.inner.lock().await.entries.remove(key).is_some()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::time::Duration;

    use tokio::sync::Notify;

    use super::SessionCache;

    #[tokio::test]
    async fn same_key_returns_same_value() {
        let cache = SessionCache::new(4, Duration::from_secs(60));

        let (first, created) = cache.get_or_create("100.1", || async { 1 }).await;
        assert!(created);
        let (second, created) = cache.get_or_create("100.1", || async { 2 }).await;
        assert!(!created);

        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(*second.lock().await, 1);
    }

    #[tokio::test]
    async fn least_recently_used_entry_is_evicted() {
        let cache = SessionCache::new(2, Duration::from_secs(60));
        cache.get_or_create("a", || async { "a" }).await;
        cache.get_or_create("b", || async { "b" }).await;
        cache.get_or_create("a", || async { "a2" }).await;

        cache.get_or_create("c", || async { "c" }).await;

        assert_eq!(cache.len().await, 2);
        assert!(cache.contains("a").await);
        assert!(!cache.contains("b").await);
        assert!(cache.contains("c").await);
    }

    #[tokio::test(start_paused = true)]
    async fn idle_entries_expire() {
        let cache = SessionCache::new(4, Duration::from_secs(30));
        cache.get_or_create("t", || async { "old" }).await;

        tokio::time::advance(Duration::from_secs(20)).await;
        let (value, created) = cache.get_or_create("t", || async { "new" }).await;
        assert!(!created);
        assert_eq!(*value.lock().await, "old");

        tokio::time::advance(Duration::from_secs(31)).await;
        let (value, created) = cache.get_or_create("t", || async { "new" }).await;
        assert!(created);
        assert_eq!(*value.lock().await, "new");
    }

    #[tokio::test(start_paused = true)]
    async fn expired_entries_are_reclaimed_before_live_ones() {
        let cache = SessionCache::new(2, Duration::from_secs(30));
        cache.get_or_create("stale", || async { 0 }).await;
        tokio::time::advance(Duration::from_secs(40)).await;
        cache.get_or_create("live", || async { 1 }).await;

        cache.get_or_create("fresh", || async { 2 }).await;

        assert!(!cache.contains("stale").await);
        assert!(cache.contains("live").await);
        assert!(cache.contains("fresh").await);
    }

    #[tokio::test]
    async fn slow_build_does_not_block_other_keys() {
        let cache = Arc::new(SessionCache::new(8, Duration::from_secs(60)));
        let release = Arc::new(Notify::new());

        let slow = {
            let cache = Arc::clone(&cache);
            let release = Arc::clone(&release);
            tokio::spawn(async move {
                let (value, created) = cache
                    .get_or_create("slow", || async move {
                        release.notified().await;
                        "slow"
                    })
                    .await;
                let result = (*value.lock().await, created);
                result
            })
        };
        tokio::task::yield_now().await;

        let (other, created) = tokio::time::timeout(
            Duration::from_secs(1),
            cache.get_or_create("other", || async { "other" }),
        )
        .await
        .expect("another key must not wait for the slow build");
        assert!(created);
        assert_eq!(*other.lock().await, "other");

        release.notify_one();
        assert_eq!(slow.await.expect("slow task"), ("slow", true));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_first_mentions_build_one_value() {
        let cache = Arc::new(SessionCache::new(8, Duration::from_secs(60)));
        let builds = Arc::new(AtomicUsize::new(0));

        let mut handles = Vec::new();
        for _ in 0..16 {
            let cache = Arc::clone(&cache);
            let builds = Arc::clone(&builds);
            handles.push(tokio::spawn(async move {
                let (value, _) = cache
                    .get_or_create("100.1", || async move {
                        builds.fetch_add(1, Ordering::SeqCst);
                        tokio::task::yield_now().await;
                        7
                    })
                    .await;
                let guard = value.lock().await;
                *guard
            }));
        }

        for handle in handles {
            assert_eq!(handle.await.expect("task"), 7);
        }
        assert_eq!(builds.load(Ordering::SeqCst), 1);
        assert!(!cache.is_empty().await);
        assert!(cache.remove("100.1").await);
    }
}
