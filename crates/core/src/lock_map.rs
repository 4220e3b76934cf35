//! Keyed asynchronous locks.
//!
//! The cache needs mutual exclusion per cache entry and per storage object
//! without holding one big lock across I/O. A `LockMap` hands out owned
//! guards keyed by an arbitrary hashable value, so a guard can travel through
//! the upload queue into a worker task. The map entry is dropped again once
//! the last interested task releases its guard.

use dashmap::DashMap;
use std::hash::Hash;
use std::sync::Arc;
use tokio::sync::{Mutex, OwnedMutexGuard};

pub struct LockMap<K: Eq + Hash + Clone + Send + Sync + 'static> {
    locks: DashMap<K, Arc<Mutex<()>>>,
}

pub struct LockGuard<K: Eq + Hash + Clone + Send + Sync + 'static> {
    key: K,
    map: Arc<LockMap<K>>,
    guard: Option<OwnedMutexGuard<()>>,
}

impl<K: Eq + Hash + Clone + Send + Sync + 'static> LockMap<K> {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            locks: DashMap::new(),
        })
    }

    pub async fn lock(self: &Arc<Self>, key: K) -> LockGuard<K> {
        let mutex = self
            .locks
            .entry(key.clone())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone();
        let guard = mutex.lock_owned().await;
        LockGuard {
            key,
            map: self.clone(),
            guard: Some(guard),
        }
    }

    /// Acquire without waiting; `None` if the key is currently locked.
    pub fn try_lock(self: &Arc<Self>, key: K) -> Option<LockGuard<K>> {
        let mutex = self
            .locks
            .entry(key.clone())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone();
        let guard = mutex.try_lock_owned().ok()?;
        Some(LockGuard {
            key,
            map: self.clone(),
            guard: Some(guard),
        })
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.locks.len()
    }
}

impl<K: Eq + Hash + Clone + Send + Sync + 'static> Drop for LockGuard<K> {
    fn drop(&mut self) {
        self.guard.take();
        // Remove the map entry once nobody else holds a handle to the mutex.
        // A concurrent lock() that already cloned the Arc keeps it alive.
        self.map
            .locks
            .remove_if(&self.key, |_, m| Arc::strong_count(m) == 1);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[tokio::test]
    async fn test_same_key_excludes() {
        let map = LockMap::new();
        let counter = Arc::new(AtomicU32::new(0));

        let mut handles = Vec::new();
        for _ in 0..8 {
            let map = map.clone();
            let counter = counter.clone();
            handles.push(tokio::spawn(async move {
                let _g = map.lock(7u64).await;
                let active = counter.fetch_add(1, Ordering::SeqCst);
                assert_eq!(active, 0, "two tasks inside the same keyed lock");
                tokio::task::yield_now().await;
                counter.fetch_sub(1, Ordering::SeqCst);
            }));
        }
        for h in handles {
            h.await.unwrap();
        }
        assert_eq!(counter.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_distinct_keys_do_not_block() {
        let map = LockMap::new();
        let _a = map.lock(1u64).await;
        let _b = map.lock(2u64).await;
    }

    #[tokio::test]
    async fn test_entry_is_cleaned_up() {
        let map = LockMap::new();
        {
            let _g = map.lock("key".to_string()).await;
            assert_eq!(map.len(), 1);
        }
        assert_eq!(map.len(), 0);
    }

    #[tokio::test]
    async fn test_guard_moves_across_tasks() {
        let map = LockMap::new();
        let guard = map.lock(5u8).await;
        let map2 = map.clone();
        let handle = tokio::spawn(async move {
            drop(guard);
        });
        handle.await.unwrap();
        assert!(map2.try_lock(5u8).is_some());
    }

    #[tokio::test]
    async fn test_try_lock() {
        let map = LockMap::new();
        let g = map.lock(1u32).await;
        assert!(map.try_lock(1u32).is_none());
        drop(g);
        assert!(map.try_lock(1u32).is_some());
    }
}
