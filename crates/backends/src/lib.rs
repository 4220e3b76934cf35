//! Object-store backends.
//!
//! Everything above this crate talks to storage through the [`ObjectBackend`]
//! trait: a flat key → bytes namespace with read-after-write consistency on
//! individual keys. Listings may lag behind writes, so callers must never use
//! `list` for correctness, only for enumeration (fsck, mount protocol).
//!
//! [`ComprencBackend`] wraps any raw backend and adds compression, encryption
//! and integrity protection; [`RetryBackend`] adds exponential-backoff retry
//! for transient failures.

use async_trait::async_trait;
use bytes::Bytes;
use rand::Rng;
use std::time::{Duration, Instant};
use thiserror::Error;

mod comprenc;
mod local;
mod mem;

pub use comprenc::{
    Compression, MasterKey, ComprencBackend, object_id_for_key, unwrap_master_key,
    wrap_master_key,
};
pub use local::LocalBackend;
pub use mem::MemBackend;

#[derive(Error, Debug)]
pub enum BackendError {
    #[error("object does not exist: {0}")]
    NoSuchObject(String),

    #[error("authentication failed: {0}")]
    Auth(String),

    #[error("corrupted object: {0}")]
    Corrupted(String),

    #[error("unsupported object format version {0}")]
    VersionMismatch(u8),

    #[error("temporary backend failure: {0}")]
    Temporary(String),

    #[error("invalid storage url: {0}")]
    InvalidUrl(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl BackendError {
    /// Whether the operation may succeed if repeated after a delay.
    pub fn is_temp_failure(&self) -> bool {
        matches!(self, BackendError::Temporary(_))
    }
}

/// Per-backend retry parameters. Drivers for flaky transports (network object
/// stores) use longer horizons than local ones.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub initial_interval: Duration,
    pub max_interval: Duration,
    pub timeout: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            initial_interval: Duration::from_millis(20),
            max_interval: Duration::from_secs(300),
            timeout: Duration::from_secs(600),
        }
    }
}

/// A flat key → bytes object store.
///
/// Implementations must provide read-after-write consistency for single keys.
/// `put` returns the number of bytes actually stored (wrappers that transform
/// the payload report the transformed size).
#[async_trait]
pub trait ObjectBackend: Send + Sync + 'static {
    /// Return the stored size of `key`, or `NoSuchObject`.
    async fn lookup(&self, key: &str) -> Result<u64, BackendError>;

    async fn get(&self, key: &str) -> Result<Bytes, BackendError>;

    async fn put(&self, key: &str, data: Bytes) -> Result<u64, BackendError>;

    async fn delete(&self, key: &str) -> Result<(), BackendError>;

    /// Delete several keys. Keys that do not exist are skipped with a warning
    /// rather than aborting the batch.
    async fn delete_multi(&self, keys: &[String]) -> Result<(), BackendError> {
        for key in keys {
            match self.delete(key).await {
                Ok(()) => {}
                Err(BackendError::NoSuchObject(_)) => {
                    tracing::warn!(%key, "backend lost object scheduled for deletion");
                }
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }

    /// List all keys starting with `prefix`, in unspecified order.
    async fn list(&self, prefix: &str) -> Result<Vec<String>, BackendError>;

    async fn contains(&self, key: &str) -> Result<bool, BackendError> {
        match self.lookup(key).await {
            Ok(_) => Ok(true),
            Err(BackendError::NoSuchObject(_)) => Ok(false),
            Err(e) => Err(e),
        }
    }

    async fn copy(&self, src: &str, dst: &str) -> Result<(), BackendError>;

    async fn rename(&self, src: &str, dst: &str) -> Result<(), BackendError> {
        self.copy(src, dst).await?;
        self.delete(src).await
    }

    async fn close(&self) -> Result<(), BackendError> {
        Ok(())
    }

    fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::default()
    }
}

#[async_trait]
impl<B: ObjectBackend + ?Sized> ObjectBackend for std::sync::Arc<B> {
    async fn lookup(&self, key: &str) -> Result<u64, BackendError> {
        (**self).lookup(key).await
    }

    async fn get(&self, key: &str) -> Result<Bytes, BackendError> {
        (**self).get(key).await
    }

    async fn put(&self, key: &str, data: Bytes) -> Result<u64, BackendError> {
        (**self).put(key, data).await
    }

    async fn delete(&self, key: &str) -> Result<(), BackendError> {
        (**self).delete(key).await
    }

    async fn delete_multi(&self, keys: &[String]) -> Result<(), BackendError> {
        (**self).delete_multi(keys).await
    }

    async fn list(&self, prefix: &str) -> Result<Vec<String>, BackendError> {
        (**self).list(prefix).await
    }

    async fn contains(&self, key: &str) -> Result<bool, BackendError> {
        (**self).contains(key).await
    }

    async fn copy(&self, src: &str, dst: &str) -> Result<(), BackendError> {
        (**self).copy(src, dst).await
    }

    async fn rename(&self, src: &str, dst: &str) -> Result<(), BackendError> {
        (**self).rename(src, dst).await
    }

    async fn close(&self) -> Result<(), BackendError> {
        (**self).close().await
    }

    fn retry_policy(&self) -> RetryPolicy {
        (**self).retry_policy()
    }
}

/// Run `f` until it succeeds, fails permanently, or `policy.timeout` elapses.
///
/// Waits grow exponentially with random variation so that many concurrent
/// clients do not hammer a struggling server in lockstep.
pub async fn retry<T, F, Fut>(policy: &RetryPolicy, op: &str, mut f: F) -> Result<T, BackendError>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = Result<T, BackendError>>,
{
    let start = Instant::now();
    let mut interval = policy.initial_interval;
    let mut attempt = 0u32;
    loop {
        let err = match f().await {
            Ok(v) => return Ok(v),
            Err(e) if e.is_temp_failure() => e,
            Err(e) => return Err(e),
        };

        if start.elapsed() > policy.timeout {
            tracing::error!(op, error = %err, "retry timeout exceeded");
            return Err(err);
        }

        attempt += 1;
        if attempt <= 2 {
            tracing::debug!(op, attempt, error = %err, "retrying backend operation");
        } else if attempt <= 4 {
            tracing::info!(op, attempt, error = %err, "retrying backend operation");
        } else {
            tracing::warn!(op, attempt, error = %err, "retrying backend operation");
        }

        let jitter = rand::thread_rng().gen_range(1.0..1.5);
        tokio::time::sleep(interval.mul_f64(jitter)).await;
        interval = std::cmp::min(interval * 2, policy.max_interval);
    }
}

/// Wraps a backend so that every operation is retried per the inner
/// backend's [`RetryPolicy`]. Permanent errors surface immediately.
pub struct RetryBackend<B> {
    inner: B,
    policy: RetryPolicy,
}

impl<B: ObjectBackend> RetryBackend<B> {
    pub fn new(inner: B) -> Self {
        let policy = inner.retry_policy();
        Self { inner, policy }
    }
}

#[async_trait]
impl<B: ObjectBackend> ObjectBackend for RetryBackend<B> {
    async fn lookup(&self, key: &str) -> Result<u64, BackendError> {
        retry(&self.policy, "lookup", || self.inner.lookup(key)).await
    }

    async fn get(&self, key: &str) -> Result<Bytes, BackendError> {
        retry(&self.policy, "get", || self.inner.get(key)).await
    }

    async fn put(&self, key: &str, data: Bytes) -> Result<u64, BackendError> {
        retry(&self.policy, "put", || self.inner.put(key, data.clone())).await
    }

    async fn delete(&self, key: &str) -> Result<(), BackendError> {
        retry(&self.policy, "delete", || self.inner.delete(key)).await
    }

    async fn list(&self, prefix: &str) -> Result<Vec<String>, BackendError> {
        retry(&self.policy, "list", || self.inner.list(prefix)).await
    }

    async fn copy(&self, src: &str, dst: &str) -> Result<(), BackendError> {
        retry(&self.policy, "copy", || self.inner.copy(src, dst)).await
    }

    async fn rename(&self, src: &str, dst: &str) -> Result<(), BackendError> {
        retry(&self.policy, "rename", || self.inner.rename(src, dst)).await
    }

    async fn close(&self) -> Result<(), BackendError> {
        self.inner.close().await
    }

    fn retry_policy(&self) -> RetryPolicy {
        self.policy
    }
}

/// Open the raw backend for a storage URL.
///
/// Only the `local://` driver is built in; network drivers plug in behind the
/// same trait.
pub fn open_backend(storage_url: &str) -> Result<std::sync::Arc<dyn ObjectBackend>, BackendError> {
    if let Some(path) = storage_url.strip_prefix("local://") {
        let backend = LocalBackend::open(std::path::Path::new(path))?;
        return Ok(std::sync::Arc::new(RetryBackend::new(backend)));
    }
    for scheme in ["s3", "gs", "swift", "b2", "rackspace", "sftp"] {
        if storage_url.starts_with(&format!("{scheme}://")) {
            return Err(BackendError::InvalidUrl(format!(
                "backend driver '{scheme}' is not compiled in"
            )));
        }
    }
    Err(BackendError::InvalidUrl(storage_url.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_retry_eventually_succeeds() {
        let backend = MemBackend::new();
        backend.fail_next_puts(2);
        let retrying = RetryBackend::new(backend);

        retrying
            .put("some_key", Bytes::from_static(b"payload"))
            .await
            .unwrap();
        assert_eq!(
            retrying.get("some_key").await.unwrap(),
            Bytes::from_static(b"payload")
        );
    }

    #[tokio::test]
    async fn test_retry_does_not_mask_permanent_errors() {
        let backend = RetryBackend::new(MemBackend::new());
        let err = backend.get("missing").await.unwrap_err();
        assert!(matches!(err, BackendError::NoSuchObject(_)));
    }

    #[tokio::test]
    async fn test_open_backend_rejects_unknown_scheme() {
        assert!(matches!(
            open_backend("carrier-pigeon://coop"),
            Err(BackendError::InvalidUrl(_))
        ));
    }
}
