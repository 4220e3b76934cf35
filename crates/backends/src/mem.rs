//! In-memory backend used by the test suites.
//!
//! Supports injecting transient failures so that retry behavior can be
//! exercised without a real network.

use async_trait::async_trait;
use bytes::Bytes;
use dashmap::DashMap;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::time::Duration;

use crate::{BackendError, ObjectBackend, RetryPolicy};

#[derive(Default)]
pub struct MemBackend {
    objects: DashMap<String, Bytes>,
    fail_puts: AtomicU32,
    fail_gets: AtomicU32,
    put_count: AtomicU64,
    get_count: AtomicU64,
}

impl MemBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next `n` calls to `put` fail with a transient error.
    pub fn fail_next_puts(&self, n: u32) {
        self.fail_puts.store(n, Ordering::SeqCst);
    }

    /// Make the next `n` calls to `get` fail with a transient error.
    pub fn fail_next_gets(&self, n: u32) {
        self.fail_gets.store(n, Ordering::SeqCst);
    }

    pub fn put_count(&self) -> u64 {
        self.put_count.load(Ordering::SeqCst)
    }

    pub fn get_count(&self) -> u64 {
        self.get_count.load(Ordering::SeqCst)
    }

    /// Overwrite a stored object without going through `put` accounting.
    /// Lets tests corrupt data in place.
    pub fn tamper(&self, key: &str, data: Bytes) {
        self.objects.insert(key.to_string(), data);
    }

    fn take_failure(counter: &AtomicU32) -> bool {
        counter
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }
}

#[async_trait]
impl ObjectBackend for MemBackend {
    async fn lookup(&self, key: &str) -> Result<u64, BackendError> {
        self.objects
            .get(key)
            .map(|v| v.len() as u64)
            .ok_or_else(|| BackendError::NoSuchObject(key.to_string()))
    }

    async fn get(&self, key: &str) -> Result<Bytes, BackendError> {
        if Self::take_failure(&self.fail_gets) {
            return Err(BackendError::Temporary("injected get failure".into()));
        }
        self.get_count.fetch_add(1, Ordering::SeqCst);
        self.objects
            .get(key)
            .map(|v| v.clone())
            .ok_or_else(|| BackendError::NoSuchObject(key.to_string()))
    }

    async fn put(&self, key: &str, data: Bytes) -> Result<u64, BackendError> {
        if Self::take_failure(&self.fail_puts) {
            return Err(BackendError::Temporary("injected put failure".into()));
        }
        self.put_count.fetch_add(1, Ordering::SeqCst);
        let len = data.len() as u64;
        self.objects.insert(key.to_string(), data);
        Ok(len)
    }

    async fn delete(&self, key: &str) -> Result<(), BackendError> {
        self.objects
            .remove(key)
            .map(|_| ())
            .ok_or_else(|| BackendError::NoSuchObject(key.to_string()))
    }

    async fn list(&self, prefix: &str) -> Result<Vec<String>, BackendError> {
        let mut keys: Vec<String> = self
            .objects
            .iter()
            .filter(|e| e.key().starts_with(prefix))
            .map(|e| e.key().clone())
            .collect();
        keys.sort();
        Ok(keys)
    }

    async fn copy(&self, src: &str, dst: &str) -> Result<(), BackendError> {
        let data = self
            .objects
            .get(src)
            .map(|v| v.clone())
            .ok_or_else(|| BackendError::NoSuchObject(src.to_string()))?;
        self.objects.insert(dst.to_string(), data);
        Ok(())
    }

    fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            initial_interval: Duration::from_millis(1),
            max_interval: Duration::from_millis(5),
            timeout: Duration::from_secs(5),
        }
    }
}
