//! Block and object reference management.
//!
//! Blocks are content-addressed: the cache registers dirty data here, and a
//! hash hit relinks to the existing block instead of creating a new object.
//! When the last reference to an object goes away it is not deleted
//! immediately but parked in the `objects_to_delete` table, which a
//! background task drains in batches. Short-lived temporary files therefore
//! never touch the backend, and transient delete failures are retried on the
//! next sweep.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::sync::Notify;

use crate::database::MetaDb;
use crate::error::FsResult;
use crate::lock_map::LockMap;
use s3ql_backends::{BackendError, ObjectBackend};

pub fn data_key(obj_id: i64) -> String {
    format!("{}{}", crate::DATA_PREFIX, obj_id)
}

pub struct BlockManager {
    db: Arc<MetaDb>,
    backend: Arc<dyn ObjectBackend>,
    /// Serializes uploads, downloads and removals of the same object.
    pub(crate) object_locks: Arc<LockMap<i64>>,
    removal_pending: Notify,
    shutdown: AtomicBool,
}

impl BlockManager {
    pub fn new(db: Arc<MetaDb>, backend: Arc<dyn ObjectBackend>) -> Self {
        Self {
            db,
            backend,
            object_locks: LockMap::new(),
            removal_pending: Notify::new(),
            shutdown: AtomicBool::new(false),
        }
    }

    /// Drop one reference to `block_id`, cascading to the object table and
    /// the deferred-removal queue. Must be called *without* the metadata
    /// lock held.
    pub async fn deref_block(&self, block_id: i64) -> FsResult<()> {
        let obj_id = {
            let mut conn = self.db.lock().await;
            let Some(block) = conn.get_block(block_id).await? else {
                tracing::warn!(block_id, "deref of unknown block");
                return Ok(());
            };
            if block.refcount > 1 {
                conn.adjust_block_refcount(block_id, -1).await?;
                return Ok(());
            }
            conn.delete_block(block_id).await?;

            let Some(object) = conn.get_object(block.obj_id).await? else {
                return Ok(());
            };
            if object.refcount > 1 {
                conn.adjust_object_refcount(block.obj_id, -1).await?;
                return Ok(());
            }
            conn.delete_object_row(block.obj_id).await?;
            if object.phys_size < 0 {
                // Never finished uploading. Either the upload failed (nothing
                // to delete) or it is still in flight; waiting on the object
                // lock below covers the latter.
                tracing::debug!(obj_id = block.obj_id, "dropping never-uploaded object");
                None
            } else {
                Some(block.obj_id)
            }
        };

        if let Some(obj_id) = obj_id {
            // Taking and releasing the lock ensures any in-flight transfer of
            // this object has finished before it becomes eligible for
            // deletion.
            drop(self.object_locks.lock(obj_id).await);
            let mut conn = self.db.lock().await;
            conn.queue_object_deletion(obj_id).await?;
            drop(conn);
            self.removal_pending.notify_one();
        }
        Ok(())
    }

    /// Download and decode the object backing a block. Waits for a pending
    /// upload of the same object to finish first.
    pub async fn fetch_object(&self, obj_id: i64) -> FsResult<bytes::Bytes> {
        drop(self.object_locks.lock(obj_id).await);
        Ok(self.backend.get(&data_key(obj_id)).await?)
    }

    /// Drain the removal queue until it is empty. Used by unmount, fsck and
    /// the background sweeper.
    pub async fn drain_removals(&self) -> FsResult<usize> {
        let mut total = 0;
        loop {
            let ids = {
                let mut conn = self.db.lock().await;
                conn.pop_object_deletions(128).await?
            };
            if ids.is_empty() {
                return Ok(total);
            }
            total += ids.len();
            let keys: Vec<String> = ids.iter().map(|id| data_key(*id)).collect();
            if let Err(e) = self.backend.delete_multi(&keys).await {
                // Put them back so a later sweep can retry.
                let mut conn = self.db.lock().await;
                for id in &ids {
                    conn.queue_object_deletion(*id).await?;
                }
                return Err(e.into());
            }
            tracing::debug!(count = ids.len(), "removed backend objects");
        }
    }

    pub fn request_shutdown(&self) {
        self.shutdown.store(true, Ordering::SeqCst);
        self.removal_pending.notify_waiters();
        self.removal_pending.notify_one();
    }

    /// Background sweep loop for deferred removals.
    pub async fn removal_loop(self: Arc<Self>) {
        loop {
            if self.shutdown.load(Ordering::SeqCst) {
                return;
            }
            tokio::select! {
                _ = self.removal_pending.notified() => {}
                _ = tokio::time::sleep(Duration::from_secs(10)) => {}
            }
            if self.shutdown.load(Ordering::SeqCst) {
                return;
            }
            match self.drain_removals().await {
                Ok(0) => {}
                Ok(n) => tracing::debug!(count = n, "removal sweep finished"),
                Err(e) => {
                    tracing::warn!(error = %e, "removal sweep failed, will retry");
                    tokio::time::sleep(Duration::from_secs(5)).await;
                }
            }
        }
    }

    pub fn backend(&self) -> &Arc<dyn ObjectBackend> {
        &self.backend
    }

    /// Detect whether the backend still has the object. Used by fsck.
    pub async fn object_exists(&self, obj_id: i64) -> FsResult<bool> {
        match self.backend.lookup(&data_key(obj_id)).await {
            Ok(_) => Ok(true),
            Err(BackendError::NoSuchObject(_)) => Ok(false),
            Err(e) => Err(e.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database::{Connection, MetaDb, init_filesystem_db};
    use s3ql_backends::MemBackend;

    async fn setup() -> (Arc<BlockManager>, Arc<MetaDb>, Arc<MemBackend>, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("meta.db");
        let mut conn = Connection::open(&path).await.unwrap();
        init_filesystem_db(&mut conn, 0, 0).await.unwrap();
        drop(conn);

        let db = Arc::new(MetaDb::open(&path).await.unwrap());
        let backend = Arc::new(MemBackend::new());
        let mgr = Arc::new(BlockManager::new(
            db.clone(),
            backend.clone() as Arc<dyn ObjectBackend>,
        ));
        (mgr, db, backend, dir)
    }

    #[tokio::test]
    async fn test_deref_shared_block_keeps_object() {
        let (mgr, db, backend, _dir) = setup().await;
        let hash = [1u8; 32];
        let block_id = {
            let mut conn = db.lock().await;
            let obj_id = conn.create_object(&hash, 10).await.unwrap();
            conn.set_object_phys_size(obj_id, 10).await.unwrap();
            let block_id = conn.create_block(&hash, 10, obj_id).await.unwrap();
            conn.adjust_block_refcount(block_id, 1).await.unwrap();
            block_id
        };
        backend
            .put(&data_key(1), bytes::Bytes::from_static(b"x"))
            .await
            .unwrap();

        mgr.deref_block(block_id).await.unwrap();

        let mut conn = db.lock().await;
        assert!(conn.get_block(block_id).await.unwrap().is_some());
        assert_eq!(conn.deletion_queue_len().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_deref_last_reference_queues_removal() {
        let (mgr, db, backend, _dir) = setup().await;
        let hash = [2u8; 32];
        let (block_id, obj_id) = {
            let mut conn = db.lock().await;
            let obj_id = conn.create_object(&hash, 10).await.unwrap();
            conn.set_object_phys_size(obj_id, 10).await.unwrap();
            let block_id = conn.create_block(&hash, 10, obj_id).await.unwrap();
            (block_id, obj_id)
        };
        backend
            .put(&data_key(obj_id), bytes::Bytes::from_static(b"x"))
            .await
            .unwrap();

        mgr.deref_block(block_id).await.unwrap();
        {
            let mut conn = db.lock().await;
            assert!(conn.get_block(block_id).await.unwrap().is_none());
            assert_eq!(conn.deletion_queue_len().await.unwrap(), 1);
        }

        assert_eq!(mgr.drain_removals().await.unwrap(), 1);
        assert!(!mgr.object_exists(obj_id).await.unwrap());
    }

    #[tokio::test]
    async fn test_drain_tolerates_lost_objects() {
        let (mgr, db, _backend, _dir) = setup().await;
        {
            let mut conn = db.lock().await;
            conn.queue_object_deletion(999).await.unwrap();
        }
        // The backend never had object 999; the sweep logs and moves on.
        assert_eq!(mgr.drain_removals().await.unwrap(), 1);
        let mut conn = db.lock().await;
        assert_eq!(conn.deletion_queue_len().await.unwrap(), 0);
    }
}
