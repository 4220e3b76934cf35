//! Local block cache with write-back upload pipeline.
//!
//! Cache entries are plain files named `<inode>-<blockno>` under the cache
//! directory. An entry moves through `downloading → clean → dirty →
//! uploading` states; dirty entries are registered with the block manager
//! (deduplicating by content hash) and shipped to the backend by a pool of
//! upload workers.
//!
//! Locking rules, in acquisition order:
//!   1. per-entry lock (held for the whole download or upload of that entry)
//!   2. per-object lock (held for the whole transfer of that object)
//!   3. metadata lock (never held across backend I/O)
//! The internal state mutex is leaf-level and never held across `.await`.

use bytes::Bytes;
use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, HashMap};
use std::io::SeekFrom;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};
use tokio::sync::{Notify, mpsc};

use crate::blocks::{BlockManager, data_key};
use crate::database::MetaDb;
use crate::error::{FsError, FsResult};
use crate::lock_map::{LockGuard, LockMap};
use s3ql_backends::ObjectBackend;

type EntryKey = (i64, i64);

#[derive(Clone, Copy, Debug)]
struct EntryInfo {
    size: u64,
    dirty: bool,
    errored: bool,
    in_transit: bool,
    seq: u64,
}

#[derive(Default)]
struct CacheState {
    entries: HashMap<EntryKey, EntryInfo>,
    recency: BTreeMap<u64, EntryKey>,
    total_size: u64,
    next_seq: u64,
    in_transit_count: usize,
}

impl CacheState {
    fn touch(&mut self, key: EntryKey) {
        let Some(info) = self.entries.get_mut(&key) else {
            return;
        };
        self.recency.remove(&info.seq);
        info.seq = self.next_seq;
        self.recency.insert(self.next_seq, key);
        self.next_seq += 1;
    }

    fn insert(&mut self, key: EntryKey, size: u64, dirty: bool) {
        let seq = self.next_seq;
        self.next_seq += 1;
        self.entries.insert(
            key,
            EntryInfo {
                size,
                dirty,
                errored: false,
                in_transit: false,
                seq,
            },
        );
        self.recency.insert(seq, key);
        self.total_size += size;
    }

    fn remove(&mut self, key: EntryKey) -> Option<EntryInfo> {
        let info = self.entries.remove(&key)?;
        self.recency.remove(&info.seq);
        self.total_size -= info.size;
        Some(info)
    }

    fn resize(&mut self, key: EntryKey, new_size: u64) {
        if let Some(info) = self.entries.get_mut(&key) {
            self.total_size = self.total_size - info.size + new_size;
            info.size = new_size;
        }
    }
}

struct UploadJob {
    key: EntryKey,
    obj_id: i64,
    size: u64,
    // Both locks stay held until the transfer is acknowledged: the entry may
    // not be written or evicted, and the object may not be fetched or
    // deleted, while the upload is in flight.
    _entry_guard: LockGuard<EntryKey>,
    _obj_guard: LockGuard<i64>,
}

pub struct BlockCache {
    dir: PathBuf,
    max_size: u64,
    max_entries: usize,
    state: std::sync::Mutex<CacheState>,
    entry_locks: Arc<LockMap<EntryKey>>,
    db: Arc<MetaDb>,
    blocks: Arc<BlockManager>,
    backend: Arc<dyn ObjectBackend>,
    upload_tx: std::sync::Mutex<Option<mpsc::Sender<UploadJob>>>,
    transfer_done: Notify,
    shutting_down: AtomicBool,
    workers: std::sync::Mutex<Vec<tokio::task::JoinHandle<()>>>,
}

impl BlockCache {
    /// Create the cache, recover any entries left behind by a previous mount,
    /// and start the upload workers.
    pub async fn new(
        dir: PathBuf,
        max_size: u64,
        max_entries: usize,
        upload_threads: usize,
        db: Arc<MetaDb>,
        blocks: Arc<BlockManager>,
        backend: Arc<dyn ObjectBackend>,
    ) -> FsResult<Arc<Self>> {
        tokio::fs::create_dir_all(&dir).await?;

        let (tx, rx) = mpsc::channel(upload_threads * 2);
        let cache = Arc::new(Self {
            dir,
            max_size,
            max_entries,
            state: std::sync::Mutex::new(CacheState::default()),
            entry_locks: LockMap::new(),
            db,
            blocks,
            backend,
            upload_tx: std::sync::Mutex::new(Some(tx)),
            transfer_done: Notify::new(),
            shutting_down: AtomicBool::new(false),
            workers: std::sync::Mutex::new(Vec::new()),
        });

        cache.recover_entries().await?;

        let rx = Arc::new(tokio::sync::Mutex::new(rx));
        let mut workers = cache.workers.lock().unwrap();
        for _ in 0..upload_threads {
            let cache2 = cache.clone();
            let rx2 = rx.clone();
            workers.push(tokio::spawn(async move {
                loop {
                    let job = rx2.lock().await.recv().await;
                    match job {
                        Some(job) => cache2.process_upload(job).await,
                        None => return,
                    }
                }
            }));
        }
        drop(workers);

        Ok(cache)
    }

    async fn recover_entries(&self) -> FsResult<()> {
        let mut dir = tokio::fs::read_dir(&self.dir).await?;
        let mut count = 0usize;
        while let Some(entry) = dir.next_entry().await? {
            let name = entry.file_name();
            let Some(name) = name.to_str() else { continue };
            let Some((inode, blockno)) = parse_entry_name(name) else {
                continue;
            };
            let size = entry.metadata().await?.len();
            let mut state = self.state.lock().unwrap();
            state.insert((inode, blockno), size, false);
            count += 1;
        }
        if count > 0 {
            tracing::info!(count, "recovered cache entries from previous mount");
        }
        Ok(())
    }

    fn entry_path(&self, key: EntryKey) -> PathBuf {
        self.dir.join(format!("{}-{}", key.0, key.1))
    }

    fn is_full(&self) -> bool {
        let state = self.state.lock().unwrap();
        state.total_size > self.max_size || state.entries.len() > self.max_entries
    }

    /// Read part of a block. `Ok(None)` means the block is a hole: no cache
    /// entry and no database row, so the caller produces zeros without any
    /// backend traffic. Short or empty results past the end of the stored
    /// block are zero-padded by the caller as well.
    pub async fn read(
        &self,
        inode: i64,
        blockno: i64,
        offset: u64,
        len: usize,
    ) -> FsResult<Option<Bytes>> {
        if self.is_full() {
            self.expire().await?;
        }
        let key = (inode, blockno);
        let _guard = self.entry_locks.lock(key).await;

        if !self.has_entry(key) {
            let block_id = {
                let mut conn = self.db.lock().await;
                conn.get_block_of(inode, blockno).await?
            };
            let Some(block_id) = block_id else {
                return Ok(None);
            };
            self.download_entry(key, block_id).await?;
        }

        {
            let mut state = self.state.lock().unwrap();
            state.touch(key);
        }

        let mut fh = tokio::fs::File::open(self.entry_path(key)).await?;
        fh.seek(SeekFrom::Start(offset)).await?;
        let mut buf = vec![0u8; len];
        let mut filled = 0;
        while filled < len {
            let n = fh.read(&mut buf[filled..]).await?;
            if n == 0 {
                break;
            }
            filled += n;
        }
        buf.truncate(filled);
        Ok(Some(Bytes::from(buf)))
    }

    /// Write into a block, creating the cache entry (and fetching the old
    /// content for a partial overwrite) as needed.
    pub async fn write(&self, inode: i64, blockno: i64, offset: u64, data: &[u8]) -> FsResult<()> {
        if self.is_full() {
            self.expire().await?;
        }
        let key = (inode, blockno);
        let _guard = self.entry_locks.lock(key).await;

        if !self.has_entry(key) {
            let block_id = {
                let mut conn = self.db.lock().await;
                conn.get_block_of(inode, blockno).await?
            };
            match block_id {
                Some(block_id) => self.download_entry(key, block_id).await?,
                None => {
                    tokio::fs::File::create(self.entry_path(key)).await?;
                    let mut state = self.state.lock().unwrap();
                    state.insert(key, 0, false);
                }
            }
        }

        let path = self.entry_path(key);
        let mut fh = tokio::fs::OpenOptions::new().write(true).open(&path).await?;
        fh.seek(SeekFrom::Start(offset)).await?;
        fh.write_all(data).await?;
        fh.flush().await?;
        let new_size = fh.metadata().await?.len();

        let mut state = self.state.lock().unwrap();
        state.resize(key, new_size);
        if let Some(info) = state.entries.get_mut(&key) {
            info.dirty = true;
        }
        state.touch(key);
        Ok(())
    }

    /// Clip a block to `len` bytes (truncate of a partially covered last
    /// block). A hole stays a hole.
    pub async fn truncate_block(&self, inode: i64, blockno: i64, len: u64) -> FsResult<()> {
        let key = (inode, blockno);
        let _guard = self.entry_locks.lock(key).await;

        if !self.has_entry(key) {
            let block_id = {
                let mut conn = self.db.lock().await;
                conn.get_block_of(inode, blockno).await?
            };
            let Some(block_id) = block_id else {
                return Ok(());
            };
            self.download_entry(key, block_id).await?;
        }

        let fh = tokio::fs::OpenOptions::new()
            .write(true)
            .open(self.entry_path(key))
            .await?;
        fh.set_len(len).await?;

        let mut state = self.state.lock().unwrap();
        state.resize(key, len);
        if let Some(info) = state.entries.get_mut(&key) {
            info.dirty = true;
        }
        state.touch(key);
        Ok(())
    }

    fn has_entry(&self, key: EntryKey) -> bool {
        self.state.lock().unwrap().entries.contains_key(&key)
    }

    /// Populate a cache entry from the backend. Caller holds the entry lock.
    async fn download_entry(&self, key: EntryKey, block_id: i64) -> FsResult<()> {
        let (obj_id, expected_hash, expected_size) = {
            let mut conn = self.db.lock().await;
            let block = conn
                .get_block(block_id)
                .await?
                .ok_or_else(|| FsError::Corruption(format!("block {block_id} has no row")))?;
            (block.obj_id, block.hash, block.size as u64)
        };

        let payload = self.blocks.fetch_object(obj_id).await?;

        if let Some(hash) = expected_hash {
            let digest = Sha256::digest(&payload);
            if digest.as_slice() != hash.as_slice() {
                return Err(FsError::Corruption(format!(
                    "content digest mismatch for object {obj_id}"
                )));
            }
        }
        if payload.len() as u64 != expected_size {
            return Err(FsError::Corruption(format!(
                "object {obj_id} has length {} but block says {expected_size}",
                payload.len()
            )));
        }

        let path = self.entry_path(key);
        let tmp = path.with_extension("tmp");
        let mut fh = tokio::fs::File::create(&tmp).await?;
        fh.write_all(&payload).await?;
        fh.sync_data().await?;
        tokio::fs::rename(&tmp, &path).await?;

        let mut state = self.state.lock().unwrap();
        state.insert(key, payload.len() as u64, false);
        Ok(())
    }

    /// Register a dirty entry with the block table and, unless it
    /// deduplicated against an existing block, hand it to the upload workers.
    /// Returns whether an upload is now in flight for this entry.
    pub async fn upload_if_dirty(&self, key: EntryKey) -> FsResult<bool> {
        // Entries whose upload already failed stay pinned until fsck; retrying
        // them here would wedge every flush behind a broken backend.
        {
            let state = self.state.lock().unwrap();
            match state.entries.get(&key) {
                Some(info) if info.in_transit => return Ok(true),
                Some(info) if info.dirty && !info.errored => {}
                _ => return Ok(false),
            }
        }

        let entry_guard = self.entry_locks.lock(key).await;

        // Things may have moved while we waited for the lock.
        {
            let state = self.state.lock().unwrap();
            match state.entries.get(&key) {
                Some(info) if info.in_transit => return Ok(true),
                Some(info) if info.dirty && !info.errored => {}
                _ => return Ok(false),
            }
        }

        let content = tokio::fs::read(self.entry_path(key)).await?;
        let hash: [u8; 32] = Sha256::digest(&content).into();
        let size = content.len() as i64;
        drop(content);

        let (inode, blockno) = key;
        let mut conn = self.db.lock().await;
        let old_block_id = conn.get_block_of(inode, blockno).await?;

        if let Some(block_id) = conn.find_block_by_hash(&hash).await? {
            let existing = conn
                .get_block(block_id)
                .await?
                .ok_or_else(|| FsError::Corruption(format!("block {block_id} has no row")))?;
            if existing.size != size {
                // Equal hashes with different lengths: a digest collision.
                return Err(FsError::Corruption(format!(
                    "hash collision between block {block_id} and new content of {inode}-{blockno}"
                )));
            }
            // Dedup hit: relink, nothing to transfer.
            if old_block_id != Some(block_id) {
                conn.adjust_block_refcount(block_id, 1).await?;
                conn.link_block(inode, blockno, block_id).await?;
            }
            drop(conn);
            {
                let mut state = self.state.lock().unwrap();
                if let Some(info) = state.entries.get_mut(&key) {
                    info.dirty = false;
                }
            }
            drop(entry_guard);
            if let Some(old) = old_block_id
                && old != block_id
            {
                self.blocks.deref_block(old).await?;
            }
            return Ok(false);
        }

        let obj_id = conn.create_object(&hash, size).await?;
        let block_id = conn.create_block(&hash, size, obj_id).await?;
        conn.link_block(inode, blockno, block_id).await?;
        drop(conn);

        {
            let mut state = self.state.lock().unwrap();
            if let Some(info) = state.entries.get_mut(&key) {
                info.in_transit = true;
            }
            state.in_transit_count += 1;
        }

        let obj_guard = self.blocks.object_locks.lock(obj_id).await;
        let job = UploadJob {
            key,
            obj_id,
            size: size as u64,
            _entry_guard: entry_guard,
            _obj_guard: obj_guard,
        };

        let tx = self.upload_tx.lock().unwrap().clone();
        match tx {
            Some(tx) => {
                if tx.send(job).await.is_err() {
                    self.abort_transfer(key, obj_id).await?;
                    return Err(FsError::ShuttingDown);
                }
            }
            None => {
                self.abort_transfer(key, obj_id).await?;
                return Err(FsError::ShuttingDown);
            }
        }

        if let Some(old) = old_block_id {
            self.blocks.deref_block(old).await?;
        }
        Ok(true)
    }

    async fn abort_transfer(&self, key: EntryKey, obj_id: i64) -> FsResult<()> {
        {
            let mut state = self.state.lock().unwrap();
            if let Some(info) = state.entries.get_mut(&key) {
                info.in_transit = false;
            }
            state.in_transit_count -= 1;
        }
        let mut conn = self.db.lock().await;
        conn.invalidate_object_hash(obj_id).await?;
        Ok(())
    }

    async fn process_upload(self: &Arc<Self>, job: UploadJob) {
        let result = self.do_upload(&job).await;
        {
            let mut state = self.state.lock().unwrap();
            if let Some(info) = state.entries.get_mut(&job.key) {
                info.in_transit = false;
                match result {
                    Ok(_) => info.dirty = false,
                    Err(_) => info.errored = true,
                }
            }
            state.in_transit_count -= 1;
        }
        if let Err(e) = result {
            tracing::error!(
                inode = job.key.0,
                blockno = job.key.1,
                obj_id = job.obj_id,
                error = %e,
                "block upload failed"
            );
            let mut conn = self.db.lock().await;
            if let Err(e2) = conn.invalidate_object_hash(job.obj_id).await {
                tracing::error!(error = %e2, "could not invalidate hash of failed upload");
            }
        }
        self.transfer_done.notify_waiters();
    }

    async fn do_upload(&self, job: &UploadJob) -> FsResult<u64> {
        let content = tokio::fs::read(self.entry_path(job.key)).await?;
        debug_assert_eq!(content.len() as u64, job.size);
        let phys_size = self
            .backend
            .put(&data_key(job.obj_id), Bytes::from(content))
            .await?;
        let mut conn = self.db.lock().await;
        conn.set_object_phys_size(job.obj_id, phys_size as i64).await?;
        Ok(phys_size)
    }

    /// Wait until some in-flight transfer completes (or none remain).
    async fn wait_for_transfer(&self) {
        let notified = self.transfer_done.notified();
        if self.state.lock().unwrap().in_transit_count == 0 {
            return;
        }
        tokio::select! {
            _ = notified => {}
            _ = tokio::time::sleep(Duration::from_secs(5)) => {}
        }
    }

    /// Bring the cache back under its size caps: schedule uploads for dirty
    /// LRU entries, evict clean ones, and block until enough room exists.
    /// This is the write-path backpressure mechanism.
    pub async fn expire(&self) -> FsResult<()> {
        loop {
            let candidates: Vec<EntryKey> = {
                let state = self.state.lock().unwrap();
                let mut need_size = state.total_size as i64 - self.max_size as i64;
                let mut need_entries = state.entries.len() as i64 - self.max_entries as i64;
                if need_size <= 0 && need_entries <= 0 {
                    return Ok(());
                }
                let mut picked = Vec::new();
                for key in state.recency.values() {
                    if need_size <= 0 && need_entries <= 0 {
                        break;
                    }
                    let info = &state.entries[key];
                    need_size -= info.size as i64;
                    need_entries -= 1;
                    picked.push(*key);
                }
                picked
            };

            let mut transfers = false;
            let mut progressed = false;
            for key in candidates {
                if self.upload_if_dirty(key).await? {
                    transfers = true;
                    continue;
                }
                let Some(_guard) = self.entry_locks.try_lock(key) else {
                    transfers = true;
                    continue;
                };
                let removable = {
                    let state = self.state.lock().unwrap();
                    matches!(
                        state.entries.get(&key),
                        Some(info) if !info.dirty && !info.in_transit
                    )
                };
                if !removable {
                    continue;
                }
                {
                    let mut state = self.state.lock().unwrap();
                    state.remove(key);
                }
                tokio::fs::remove_file(self.entry_path(key)).await?;
                progressed = true;
            }

            if transfers {
                self.wait_for_transfer().await;
            } else if !progressed {
                // Nothing could be uploaded or evicted; the cache is pinned
                // by failing entries and the writer has to hear about it.
                return Err(FsError::OutOfSpace);
            }
        }
    }

    /// Remove blocks `start_no..end_no` of an inode: drop cache entries,
    /// detach the database rows and release the block references.
    pub async fn remove(&self, inode: i64, start_no: i64, end_no: i64) -> FsResult<()> {
        for blockno in start_no..end_no {
            let key = (inode, blockno);
            let guard = self.entry_locks.lock(key).await;

            if self.has_entry(key) {
                {
                    let mut state = self.state.lock().unwrap();
                    state.remove(key);
                }
                tokio::fs::remove_file(self.entry_path(key)).await?;
            }

            let block_id = {
                let mut conn = self.db.lock().await;
                match conn.get_block_of(inode, blockno).await? {
                    Some(id) => {
                        conn.unlink_block(inode, blockno).await?;
                        Some(id)
                    }
                    None => None,
                }
            };
            drop(guard);

            if let Some(block_id) = block_id {
                self.blocks.deref_block(block_id).await?;
            }
        }
        Ok(())
    }

    /// Highest block number with a cache entry for this inode. Catches dirty
    /// blocks that were never registered in the database.
    pub fn max_cached_blockno(&self, inode: i64) -> Option<i64> {
        let state = self.state.lock().unwrap();
        state
            .entries
            .keys()
            .filter(|(ino, _)| *ino == inode)
            .map(|(_, blockno)| *blockno)
            .max()
    }

    fn keys_of_inode(&self, inode: i64) -> Vec<EntryKey> {
        let state = self.state.lock().unwrap();
        state
            .entries
            .keys()
            .filter(|(ino, _)| *ino == inode)
            .copied()
            .collect()
    }

    fn inode_has_state(&self, inode: i64, dirty: bool, in_transit: bool, errored: bool) -> bool {
        let state = self.state.lock().unwrap();
        state.entries.iter().any(|((ino, _), info)| {
            *ino == inode
                && ((dirty && info.dirty && !info.in_transit && !info.errored)
                    || (in_transit && info.in_transit)
                    || (errored && info.errored))
        })
    }

    /// Upload every dirty block of one inode and wait for acknowledgement.
    /// Surfaces errors recorded by earlier background uploads of this inode.
    pub async fn flush_inode(&self, inode: i64) -> FsResult<()> {
        loop {
            for key in self.keys_of_inode(inode) {
                self.upload_if_dirty(key).await?;
            }
            if !self.inode_has_state(inode, true, true, false) {
                break;
            }
            self.wait_for_transfer().await;
        }
        if self.inode_has_state(inode, false, false, true) {
            return Err(FsError::Io(std::io::Error::from_raw_os_error(libc::EIO)));
        }
        Ok(())
    }

    /// Schedule uploads for all dirty blocks without waiting for completion.
    pub async fn start_flush(&self) -> FsResult<()> {
        let keys: Vec<EntryKey> = {
            let state = self.state.lock().unwrap();
            state.entries.keys().copied().collect()
        };
        for key in keys {
            self.upload_if_dirty(key).await?;
        }
        Ok(())
    }

    /// Upload all dirty blocks and wait until nothing is in flight.
    pub async fn flush_all(&self) -> FsResult<()> {
        loop {
            let mut transfers = false;
            let keys: Vec<EntryKey> = {
                let state = self.state.lock().unwrap();
                state.entries.keys().copied().collect()
            };
            for key in keys {
                if self.upload_if_dirty(key).await? {
                    transfers = true;
                }
            }
            if !transfers && self.state.lock().unwrap().in_transit_count == 0 {
                return Ok(());
            }
            self.wait_for_transfer().await;
        }
    }

    pub fn dirty_stats(&self) -> (usize, u64) {
        let state = self.state.lock().unwrap();
        let mut count = 0;
        let mut bytes = 0;
        for info in state.entries.values() {
            if info.dirty {
                count += 1;
                bytes += info.size;
            }
        }
        (count, bytes)
    }

    /// Stop the workers immediately, abandoning queued uploads. Dirty entry
    /// files stay on disk for fsck. Crash-recovery testing only.
    pub fn abort_workers(&self) {
        self.shutting_down.store(true, Ordering::SeqCst);
        drop(self.upload_tx.lock().unwrap().take());
        let workers: Vec<_> = std::mem::take(&mut *self.workers.lock().unwrap());
        for worker in workers {
            worker.abort();
        }
    }

    /// Flush everything and stop the workers. With `keep_entries` the clean
    /// entry files stay behind for the next mount of this cache directory.
    pub async fn shutdown(&self, keep_entries: bool) -> FsResult<()> {
        self.shutting_down.store(true, Ordering::SeqCst);
        let flush_result = self.flush_all().await;

        let tx = self.upload_tx.lock().unwrap().take();
        drop(tx);
        let workers: Vec<_> = std::mem::take(&mut *self.workers.lock().unwrap());
        for worker in workers {
            let _ = worker.await;
        }
        flush_result?;

        if !keep_entries {
            let keys: Vec<EntryKey> = {
                let state = self.state.lock().unwrap();
                state.entries.keys().copied().collect()
            };
            for key in keys {
                let removable = {
                    let state = self.state.lock().unwrap();
                    matches!(state.entries.get(&key), Some(info) if !info.dirty)
                };
                if !removable {
                    // Unflushed data must survive for fsck to pick up.
                    tracing::error!(
                        inode = key.0,
                        blockno = key.1,
                        "leaving unflushed cache entry behind"
                    );
                    continue;
                }
                {
                    let mut state = self.state.lock().unwrap();
                    state.remove(key);
                }
                tokio::fs::remove_file(self.entry_path(key)).await?;
            }
        }
        Ok(())
    }
}

fn parse_entry_name(name: &str) -> Option<(i64, i64)> {
    let (inode, blockno) = name.split_once('-')?;
    Some((inode.parse().ok()?, blockno.parse().ok()?))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database::{Connection, init_filesystem_db};
    use s3ql_backends::MemBackend;

    struct Fixture {
        cache: Arc<BlockCache>,
        db: Arc<MetaDb>,
        backend: Arc<MemBackend>,
        _dir: tempfile::TempDir,
    }

    async fn setup(max_size: u64, max_entries: usize) -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let db_path = dir.path().join("meta.db");
        let mut conn = Connection::open(&db_path).await.unwrap();
        init_filesystem_db(&mut conn, 0, 0).await.unwrap();
        drop(conn);

        let db = Arc::new(MetaDb::open(&db_path).await.unwrap());
        let backend = Arc::new(MemBackend::new());
        let blocks = Arc::new(BlockManager::new(
            db.clone(),
            backend.clone() as Arc<dyn ObjectBackend>,
        ));
        let cache = BlockCache::new(
            dir.path().join("cache"),
            max_size,
            max_entries,
            2,
            db.clone(),
            blocks,
            backend.clone() as Arc<dyn ObjectBackend>,
        )
        .await
        .unwrap();
        Fixture {
            cache,
            db,
            backend,
            _dir: dir,
        }
    }

    #[tokio::test]
    async fn test_hole_reads_do_not_touch_backend() {
        let fx = setup(1 << 20, 16).await;
        let got = fx.cache.read(1, 0, 0, 100).await.unwrap();
        assert!(got.is_none());
        assert_eq!(fx.backend.get_count(), 0);
    }

    #[tokio::test]
    async fn test_write_flush_read_roundtrip() {
        let fx = setup(1 << 20, 16).await;
        fx.cache.write(1, 0, 0, b"hello world").await.unwrap();
        fx.cache.flush_inode(1).await.unwrap();

        // Registered in the database and uploaded to the backend.
        {
            let mut conn = fx.db.lock().await;
            let block_id = conn.get_block_of(1, 0).await.unwrap().unwrap();
            let block = conn.get_block(block_id).await.unwrap().unwrap();
            assert_eq!(block.size, 11);
            let object = conn.get_object(block.obj_id).await.unwrap().unwrap();
            assert!(object.phys_size > 0);
        }
        assert_eq!(fx.backend.put_count(), 1);

        let got = fx.cache.read(1, 0, 0, 11).await.unwrap().unwrap();
        assert_eq!(&got[..], b"hello world");
    }

    #[tokio::test]
    async fn test_identical_content_dedups() {
        let fx = setup(1 << 20, 16).await;
        fx.cache.write(1, 0, 0, b"same bytes").await.unwrap();
        fx.cache.flush_inode(1).await.unwrap();
        fx.cache.write(2, 0, 0, b"same bytes").await.unwrap();
        fx.cache.flush_inode(2).await.unwrap();

        assert_eq!(fx.backend.put_count(), 1);
        let mut conn = fx.db.lock().await;
        let b1 = conn.get_block_of(1, 0).await.unwrap().unwrap();
        let b2 = conn.get_block_of(2, 0).await.unwrap().unwrap();
        assert_eq!(b1, b2);
        assert_eq!(conn.get_block(b1).await.unwrap().unwrap().refcount, 2);
    }

    #[tokio::test]
    async fn test_eviction_downloads_again_on_read() {
        let fx = setup(1 << 20, 2).await;
        for blockno in 0..4i64 {
            fx.cache
                .write(1, blockno, 0, format!("block {blockno}").as_bytes())
                .await
                .unwrap();
        }
        fx.cache.flush_inode(1).await.unwrap();
        fx.cache.expire().await.unwrap();

        assert!(fx.cache.state.lock().unwrap().entries.len() <= 2);

        // Evicted blocks come back from the backend.
        for blockno in 0..4i64 {
            let got = fx.cache.read(1, blockno, 0, 64).await.unwrap().unwrap();
            assert_eq!(&got[..], format!("block {blockno}").as_bytes());
        }
    }

    #[tokio::test]
    async fn test_upload_failure_marks_entry_errored() {
        let fx = setup(1 << 20, 16).await;
        fx.cache.write(1, 0, 0, b"doomed").await.unwrap();
        fx.backend.fail_next_puts(100_000);

        let err = fx.cache.flush_inode(1).await.unwrap_err();
        assert_eq!(err.errno(), libc::EIO);

        // The failed block's hash must be gone so nothing dedups against it.
        let mut conn = fx.db.lock().await;
        let block_id = conn.get_block_of(1, 0).await.unwrap().unwrap();
        assert!(conn.get_block(block_id).await.unwrap().unwrap().hash.is_none());
    }

    #[tokio::test]
    async fn test_remove_releases_blocks() {
        let fx = setup(1 << 20, 16).await;
        fx.cache.write(1, 0, 0, b"going away").await.unwrap();
        fx.cache.flush_inode(1).await.unwrap();

        fx.cache.remove(1, 0, 1).await.unwrap();

        let mut conn = fx.db.lock().await;
        assert!(conn.get_block_of(1, 0).await.unwrap().is_none());
        assert_eq!(conn.deletion_queue_len().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_partial_write_preserves_existing_content() {
        // A zero entry cap forces every touched block back out to the
        // backend, so the overwrite below has to read-modify-write.
        let fx = setup(1 << 20, 0).await;
        fx.cache.write(1, 0, 0, &[b'a'; 100]).await.unwrap();
        fx.cache.flush_inode(1).await.unwrap();
        fx.cache.expire().await.unwrap();

        // Overwrite the middle; the rest must survive the read-modify-write.
        fx.cache.write(1, 0, 10, b"BBBB").await.unwrap();
        let got = fx.cache.read(1, 0, 0, 100).await.unwrap().unwrap();
        assert_eq!(&got[..10], &[b'a'; 10]);
        assert_eq!(&got[10..14], b"BBBB");
        assert_eq!(&got[14..], &[b'a'; 86]);
    }
}
