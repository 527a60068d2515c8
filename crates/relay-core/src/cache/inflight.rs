//! Per-key coalescing of concurrent upstream fetches.
//!
//! The first caller for a key acquires its guard and goes upstream; concurrent callers for the
//! same key wait on the guard and re-check the cache once it is released. A waiter that still
//! misses can tell from [`InflightGuard::waited`] that the leader stored nothing and release
//! the guard before going upstream itself. Map entries are removed by the last guard holder so
//! the map only holds keys with fetches in flight.

use dashmap::DashMap;
use std::sync::Arc;
use tokio::sync::{Mutex, OwnedMutexGuard};

#[derive(Debug, Default)]
pub struct InflightMap {
    inflight: Arc<DashMap<String, Arc<Mutex<()>>>>,
}

/// Held for the duration of a fetch; releasing it wakes the next waiter for the key.
#[derive(Debug)]
pub struct InflightGuard {
    key: String,
    lock: Arc<Mutex<()>>,
    inflight: Arc<DashMap<String, Arc<Mutex<()>>>>,
    guard: Option<OwnedMutexGuard<()>>,
    waited: bool,
}

impl InflightMap {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Waits until no other fetch for `key` is in flight and claims it.
    pub async fn acquire(&self, key: &str) -> InflightGuard {
        let lock = self
            .inflight
            .entry(key.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone();

        let (guard, waited) = match lock.clone().try_lock_owned() {
            Ok(guard) => (guard, false),
            Err(_) => (lock.clone().lock_owned().await, true),
        };

        InflightGuard {
            key: key.to_string(),
            lock,
            inflight: self.inflight.clone(),
            guard: Some(guard),
            waited,
        }
    }

    /// Number of keys with a fetch in flight or waiters queued.
    #[must_use]
    pub fn len(&self) -> usize {
        self.inflight.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.inflight.is_empty()
    }
}

impl InflightGuard {
    /// True when another fetch for the key held the guard first.
    #[must_use]
    pub fn waited(&self) -> bool {
        self.waited
    }
}

impl Drop for InflightGuard {
    fn drop(&mut self) {
        self.guard.take();
        // One reference is ours, one is the map's; anything above that is a queued waiter.
        self.inflight.remove_if(&self.key, |_, lock| {
            Arc::ptr_eq(lock, &self.lock) && Arc::strong_count(lock) <= 2
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::{
        sync::atomic::{AtomicUsize, Ordering},
        time::Duration,
    };

    #[tokio::test]
    async fn test_guard_removes_entry_on_drop() {
        let map = InflightMap::new();
        {
            let _guard = map.acquire("k").await;
            assert_eq!(map.len(), 1);
        }
        assert!(map.is_empty());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_same_key_is_serialised() {
        let map = Arc::new(InflightMap::new());
        let active = Arc::new(AtomicUsize::new(0));
        let max_active = Arc::new(AtomicUsize::new(0));

        let mut handles = Vec::new();
        for _ in 0..8 {
            let map = map.clone();
            let active = active.clone();
            let max_active = max_active.clone();
            handles.push(tokio::spawn(async move {
                let _guard = map.acquire("same").await;
                let now = active.fetch_add(1, Ordering::SeqCst) + 1;
                max_active.fetch_max(now, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(5)).await;
                active.fetch_sub(1, Ordering::SeqCst);
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }

        assert_eq!(max_active.load(Ordering::SeqCst), 1);
        assert!(map.is_empty());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_waiters_are_flagged_and_can_release_early() {
        let map = Arc::new(InflightMap::new());
        let leader = map.acquire("k").await;
        assert!(!leader.waited());

        let mut waiters = Vec::new();
        for _ in 0..3 {
            let map = map.clone();
            waiters.push(tokio::spawn(async move {
                let guard = map.acquire("k").await;
                let waited = guard.waited();
                drop(guard);
                tokio::time::sleep(Duration::from_millis(100)).await;
                waited
            }));
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
        drop(leader);

        let started = std::time::Instant::now();
        for waiter in waiters {
            assert!(waiter.await.unwrap());
        }
        // Released waiters run their work side by side instead of one after another.
        assert!(started.elapsed() < Duration::from_millis(250));
        assert!(map.is_empty());
    }

    #[tokio::test]
    async fn test_distinct_keys_do_not_block() {
        let map = InflightMap::new();
        let _a = map.acquire("a").await;
        let b = tokio::time::timeout(Duration::from_millis(50), map.acquire("b")).await;
        assert!(b.is_ok());
    }
}
