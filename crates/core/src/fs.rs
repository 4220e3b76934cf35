//! Filesystem operation dispatcher and inode layer.
//!
//! [`S3qlFs`] services FUSE-shaped operations against the metadata database
//! and the block cache. Every operation takes the global metadata lock for
//! its database transaction and releases it before any slow I/O (downloads,
//! upload waits, backpressure), per the concurrency model.
//!
//! The fuse3 trait impl lives in [`crate::fuse`]; keeping the core operations
//! free of FUSE types lets the test suites drive them directly.

use bytes::{Bytes, BytesMut};
use dashmap::DashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use crate::blocks::BlockManager;
use crate::cache::BlockCache;
use crate::database::{Connection, InodeRow, MetaDb, NewInode, ROOT_INODE, now_ns};
use crate::error::{FsError, FsResult};

/// Equivalent to the standard library's (currently unstable for signed
/// integers) `i64::div_ceil`.
fn div_ceil_i64(lhs: i64, rhs: i64) -> i64 {
    let d = lhs / rhs;
    let r = lhs % rhs;
    if (r > 0 && rhs > 0) || (r < 0 && rhs < 0) {
        d + 1
    } else {
        d
    }
}

pub const NAME_MAX: usize = 255;

/// Identity of the requesting process, for ownership of new inodes.
#[derive(Clone, Copy, Debug, Default)]
pub struct RequestCtx {
    pub uid: u32,
    pub gid: u32,
}

/// Attribute changes for `setattr`. `None` fields stay untouched.
#[derive(Clone, Copy, Debug, Default)]
pub struct AttrChanges {
    pub mode: Option<u32>,
    pub uid: Option<u32>,
    pub gid: Option<u32>,
    pub size: Option<u64>,
    pub atime_ns: Option<i64>,
    pub mtime_ns: Option<i64>,
}

#[derive(Clone, Copy, Debug)]
pub struct FsStats {
    pub used_bytes: u64,
    pub free_bytes: u64,
    pub inode_count: u64,
}

struct OpenFile {
    inode: i64,
}

pub struct S3qlFs {
    db: Arc<MetaDb>,
    cache: Arc<BlockCache>,
    blocks: Arc<BlockManager>,
    block_size: u64,
    open_files: DashMap<u64, OpenFile>,
    open_counts: DashMap<i64, u64>,
    /// Inodes whose last directory entry is gone but that still have open
    /// handles; destroyed on final release.
    unlinked: DashMap<i64, ()>,
    next_fh: AtomicU64,
    shutting_down: AtomicBool,
}

fn validate_name(name: &[u8]) -> FsResult<()> {
    if name.is_empty() || name.len() > NAME_MAX {
        return Err(FsError::InvalidArgument("invalid name length".into()));
    }
    if name.contains(&0) || name.contains(&b'/') {
        return Err(FsError::InvalidArgument(
            "name contains NUL or slash".into(),
        ));
    }
    Ok(())
}

impl S3qlFs {
    pub fn new(
        db: Arc<MetaDb>,
        cache: Arc<BlockCache>,
        blocks: Arc<BlockManager>,
        block_size: u64,
    ) -> Arc<Self> {
        Arc::new(Self {
            db,
            cache,
            blocks,
            block_size,
            open_files: DashMap::new(),
            open_counts: DashMap::new(),
            unlinked: DashMap::new(),
            next_fh: AtomicU64::new(1),
            shutting_down: AtomicBool::new(false),
        })
    }

    pub fn block_size(&self) -> u64 {
        self.block_size
    }

    pub fn cache(&self) -> &Arc<BlockCache> {
        &self.cache
    }

    pub fn block_manager(&self) -> &Arc<BlockManager> {
        &self.blocks
    }

    pub fn begin_shutdown(&self) {
        self.shutting_down.store(true, Ordering::SeqCst);
    }

    fn check_running(&self) -> FsResult<()> {
        if self.shutting_down.load(Ordering::SeqCst) {
            return Err(FsError::ShuttingDown);
        }
        Ok(())
    }

    fn open_count(&self, inode: i64) -> u64 {
        self.open_counts.get(&inode).map(|c| *c).unwrap_or(0)
    }

    fn register_handle(&self, inode: i64) -> u64 {
        *self.open_counts.entry(inode).or_insert(0) += 1;
        let fh = self.next_fh.fetch_add(1, Ordering::Relaxed);
        self.open_files.insert(fh, OpenFile { inode });
        fh
    }

    async fn require_inode(conn: &mut Connection, inode: i64) -> FsResult<InodeRow> {
        conn.get_inode(inode).await?.ok_or(FsError::NotFound)
    }

    // ------------------------------------------------------------------
    // lookup and attributes

    pub async fn lookup(&self, parent: i64, name: &[u8]) -> FsResult<InodeRow> {
        self.check_running()?;
        let mut conn = self.db.lock().await;
        let inode = match name {
            b"." => parent,
            b".." => {
                if parent == ROOT_INODE {
                    ROOT_INODE
                } else {
                    conn.parent_of(parent).await?.ok_or(FsError::NotFound)?
                }
            }
            _ => {
                validate_name(name)?;
                conn.lookup_entry(parent, name)
                    .await?
                    .ok_or(FsError::NotFound)?
            }
        };
        Self::require_inode(&mut conn, inode).await
    }

    pub async fn getattr(&self, inode: i64) -> FsResult<InodeRow> {
        let mut conn = self.db.lock().await;
        Self::require_inode(&mut conn, inode).await
    }

    pub async fn setattr(&self, inode: i64, changes: AttrChanges) -> FsResult<InodeRow> {
        self.check_running()?;

        let (mut row, old_size) = {
            let mut conn = self.db.lock().await;
            let row = Self::require_inode(&mut conn, inode).await?;
            if row.locked {
                return Err(FsError::Locked);
            }
            if changes.size.is_some() && !row.is_file() {
                return Err(FsError::InvalidArgument(
                    "cannot truncate non-regular file".into(),
                ));
            }
            let old_size = row.size;
            (row, old_size)
        };

        // Truncation changes block state and must run without the metadata
        // lock held.
        if let Some(new_size) = changes.size {
            let new_size = new_size as i64;
            if new_size < old_size {
                self.shrink_file(inode, old_size, new_size).await?;
            }
            row.size = new_size;
        }

        if let Some(mode) = changes.mode {
            // Preserve the file type bits; chmod only changes permissions.
            row.mode = (row.mode & libc::S_IFMT) | (mode & !libc::S_IFMT);
        }
        if let Some(uid) = changes.uid {
            row.uid = uid;
        }
        if let Some(gid) = changes.gid {
            row.gid = gid;
        }
        if let Some(atime) = changes.atime_ns {
            row.atime_ns = atime;
        }
        if let Some(mtime) = changes.mtime_ns {
            row.mtime_ns = mtime;
        }
        row.ctime_ns = now_ns();

        let mut conn = self.db.lock().await;
        conn.update_inode(&row).await?;
        Ok(row)
    }

    async fn shrink_file(&self, inode: i64, old_size: i64, new_size: i64) -> FsResult<()> {
        let bs = self.block_size as i64;
        let cutoff = div_ceil_i64(new_size, bs);
        let old_last = div_ceil_i64(old_size, bs);
        if old_last > cutoff {
            self.cache.remove(inode, cutoff, old_last).await?;
        }
        if new_size % bs != 0 {
            self.cache
                .truncate_block(inode, new_size / bs, (new_size % bs) as u64)
                .await?;
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // creating entries

    async fn create_entry(
        &self,
        parent: i64,
        name: &[u8],
        new: NewInode,
        symlink_target: Option<&[u8]>,
    ) -> FsResult<InodeRow> {
        self.check_running()?;
        validate_name(name)?;

        let mut conn = self.db.lock().await;
        let parent_row = Self::require_inode(&mut conn, parent).await?;
        if !parent_row.is_dir() {
            return Err(FsError::NotDir);
        }
        if parent_row.locked {
            return Err(FsError::Locked);
        }
        if conn.lookup_entry(parent, name).await?.is_some() {
            return Err(FsError::Exists);
        }

        conn.begin().await?;
        let result: FsResult<i64> = async {
            let inode = conn.create_inode(new).await?;
            let name_id = conn.intern_name(name).await?;
            conn.insert_entry(parent, name_id, inode).await?;
            if let Some(target) = symlink_target {
                conn.set_symlink_target(inode, target).await?;
            }
            conn.touch_mtime(parent).await?;
            Ok(inode)
        }
        .await;
        let inode = match result {
            Ok(inode) => {
                conn.commit().await?;
                inode
            }
            Err(e) => {
                conn.rollback().await?;
                return Err(e);
            }
        };
        Self::require_inode(&mut conn, inode).await
    }

    pub async fn mknod(
        &self,
        ctx: RequestCtx,
        parent: i64,
        name: &[u8],
        mode: u32,
        rdev: u32,
    ) -> FsResult<InodeRow> {
        self.create_entry(
            parent,
            name,
            NewInode {
                mode,
                uid: ctx.uid,
                gid: ctx.gid,
                rdev,
                refcount: 1,
                size: 0,
            },
            None,
        )
        .await
    }

    pub async fn mkdir(
        &self,
        ctx: RequestCtx,
        parent: i64,
        name: &[u8],
        mode: u32,
    ) -> FsResult<InodeRow> {
        self.create_entry(
            parent,
            name,
            NewInode {
                mode: (mode & !libc::S_IFMT) | libc::S_IFDIR,
                uid: ctx.uid,
                gid: ctx.gid,
                rdev: 0,
                refcount: 1,
                size: 0,
            },
            None,
        )
        .await
    }

    pub async fn symlink(
        &self,
        ctx: RequestCtx,
        parent: i64,
        name: &[u8],
        target: &[u8],
    ) -> FsResult<InodeRow> {
        self.create_entry(
            parent,
            name,
            NewInode {
                mode: libc::S_IFLNK | 0o777,
                uid: ctx.uid,
                gid: ctx.gid,
                rdev: 0,
                refcount: 1,
                size: target.len() as i64,
            },
            Some(target),
        )
        .await
    }

    pub async fn readlink(&self, inode: i64) -> FsResult<Vec<u8>> {
        let mut conn = self.db.lock().await;
        conn.get_symlink_target(inode)
            .await?
            .ok_or(FsError::InvalidArgument("not a symlink".into()))
    }

    pub async fn create(
        &self,
        ctx: RequestCtx,
        parent: i64,
        name: &[u8],
        mode: u32,
    ) -> FsResult<(u64, InodeRow)> {
        let row = self
            .mknod(
                ctx,
                parent,
                name,
                (mode & !libc::S_IFMT) | libc::S_IFREG,
                0,
            )
            .await?;
        let fh = self.register_handle(row.id);
        Ok((fh, row))
    }

    // ------------------------------------------------------------------
    // link management

    pub async fn link(&self, inode: i64, new_parent: i64, new_name: &[u8]) -> FsResult<InodeRow> {
        self.check_running()?;
        validate_name(new_name)?;

        let mut conn = self.db.lock().await;
        let row = Self::require_inode(&mut conn, inode).await?;
        if row.is_dir() {
            // Hard links to directories would make the tree a graph.
            return Err(FsError::Locked);
        }
        if row.locked {
            return Err(FsError::Locked);
        }
        let parent_row = Self::require_inode(&mut conn, new_parent).await?;
        if !parent_row.is_dir() {
            return Err(FsError::NotDir);
        }
        if parent_row.locked {
            return Err(FsError::Locked);
        }
        if conn.lookup_entry(new_parent, new_name).await?.is_some() {
            return Err(FsError::Exists);
        }

        conn.begin().await?;
        let result: FsResult<()> = async {
            let name_id = conn.intern_name(new_name).await?;
            conn.insert_entry(new_parent, name_id, inode).await?;
            conn.adjust_inode_refcount(inode, 1).await?;
            conn.touch_ctime(inode).await?;
            conn.touch_mtime(new_parent).await?;
            Ok(())
        }
        .await;
        match result {
            Ok(()) => conn.commit().await?,
            Err(e) => {
                conn.rollback().await?;
                return Err(e);
            }
        }
        Self::require_inode(&mut conn, inode).await
    }

    pub async fn unlink(&self, parent: i64, name: &[u8]) -> FsResult<()> {
        self.check_running()?;
        validate_name(name)?;

        let (inode, refcount) = {
            let mut conn = self.db.lock().await;
            let parent_row = Self::require_inode(&mut conn, parent).await?;
            if parent_row.locked {
                return Err(FsError::Locked);
            }

            let inode = conn
                .lookup_entry(parent, name)
                .await?
                .ok_or(FsError::NotFound)?;
            let row = Self::require_inode(&mut conn, inode).await?;
            if row.is_dir() {
                return Err(FsError::IsDir);
            }
            if row.locked {
                return Err(FsError::Locked);
            }

            conn.begin().await?;
            let result: FsResult<i64> = async {
                let (name_id, _) = conn
                    .remove_entry(parent, name)
                    .await?
                    .ok_or(FsError::NotFound)?;
                conn.release_name(name_id).await?;
                let refcount = conn.adjust_inode_refcount(inode, -1).await?;
                conn.touch_ctime(inode).await?;
                conn.touch_mtime(parent).await?;
                Ok(refcount)
            }
            .await;
            match result {
                Ok(refcount) => {
                    conn.commit().await?;
                    (inode, refcount)
                }
                Err(e) => {
                    conn.rollback().await?;
                    return Err(e);
                }
            }
        };

        if refcount <= 0 {
            if self.open_count(inode) > 0 {
                // Keep the data alive until the last handle closes.
                self.unlinked.insert(inode, ());
            } else {
                self.destroy_inode(inode).await?;
            }
        }
        Ok(())
    }

    pub async fn rmdir(&self, parent: i64, name: &[u8]) -> FsResult<()> {
        self.check_running()?;
        validate_name(name)?;

        let inode = {
            let mut conn = self.db.lock().await;
            let parent_row = Self::require_inode(&mut conn, parent).await?;
            if parent_row.locked {
                return Err(FsError::Locked);
            }
            let inode = conn
                .lookup_entry(parent, name)
                .await?
                .ok_or(FsError::NotFound)?;
            let row = Self::require_inode(&mut conn, inode).await?;
            if !row.is_dir() {
                return Err(FsError::NotDir);
            }
            if row.locked {
                return Err(FsError::Locked);
            }
            if conn.dir_has_entries(inode).await? {
                return Err(FsError::NotEmpty);
            }

            conn.begin().await?;
            let result: FsResult<()> = async {
                let (name_id, _) = conn
                    .remove_entry(parent, name)
                    .await?
                    .ok_or(FsError::NotFound)?;
                conn.release_name(name_id).await?;
                conn.touch_mtime(parent).await?;
                Ok(())
            }
            .await;
            match result {
                Ok(()) => conn.commit().await?,
                Err(e) => {
                    conn.rollback().await?;
                    return Err(e);
                }
            }
            inode
        };

        self.destroy_inode(inode).await
    }

    /// Tear down an inode whose last link and last handle are gone: release
    /// every block, then drop the metadata rows.
    async fn destroy_inode(&self, inode: i64) -> FsResult<()> {
        let db_max = {
            let mut conn = self.db.lock().await;
            conn.blocks_of_inode(inode)
                .await?
                .last()
                .map(|(blockno, _)| *blockno)
        };
        // Never-flushed blocks exist only as cache entries.
        let cache_max = self.cache.max_cached_blockno(inode);
        if let Some(max_blockno) = db_max.max(cache_max) {
            self.cache.remove(inode, 0, max_blockno + 1).await?;
        }

        let mut conn = self.db.lock().await;
        conn.begin().await?;
        let result: FsResult<()> = async {
            for name_id in conn.remove_all_xattrs(inode).await? {
                conn.release_name(name_id).await?;
            }
            conn.delete_symlink_target(inode).await?;
            conn.delete_inode_row(inode).await?;
            Ok(())
        }
        .await;
        match result {
            Ok(()) => conn.commit().await,
            Err(e) => {
                conn.rollback().await?;
                Err(e)
            }
        }
    }

    pub async fn rename(
        &self,
        parent: i64,
        name: &[u8],
        new_parent: i64,
        new_name: &[u8],
    ) -> FsResult<()> {
        self.check_running()?;
        validate_name(name)?;
        validate_name(new_name)?;

        let replaced = {
            let mut conn = self.db.lock().await;
            let src_parent = Self::require_inode(&mut conn, parent).await?;
            let dst_parent = Self::require_inode(&mut conn, new_parent).await?;
            if src_parent.locked || dst_parent.locked {
                return Err(FsError::Locked);
            }
            if !dst_parent.is_dir() {
                return Err(FsError::NotDir);
            }

            let inode = conn
                .lookup_entry(parent, name)
                .await?
                .ok_or(FsError::NotFound)?;
            let row = Self::require_inode(&mut conn, inode).await?;
            if row.locked {
                return Err(FsError::Locked);
            }

            if row.is_dir() {
                // Reject moving a directory into its own subtree.
                let mut ancestor = new_parent;
                loop {
                    if ancestor == inode {
                        return Err(FsError::InvalidArgument(
                            "cannot move a directory below itself".into(),
                        ));
                    }
                    if ancestor == ROOT_INODE {
                        break;
                    }
                    ancestor = conn.parent_of(ancestor).await?.ok_or(FsError::NotFound)?;
                }
            }

            // An existing target is replaced, with the usual constraints.
            let target = conn.lookup_entry(new_parent, new_name).await?;
            let mut replaced = None;
            if let Some(target_ino) = target {
                if target_ino == inode {
                    return Ok(());
                }
                let target_row = Self::require_inode(&mut conn, target_ino).await?;
                if target_row.locked {
                    return Err(FsError::Locked);
                }
                if target_row.is_dir() {
                    if !row.is_dir() {
                        return Err(FsError::IsDir);
                    }
                    if conn.dir_has_entries(target_ino).await? {
                        return Err(FsError::NotEmpty);
                    }
                } else if row.is_dir() {
                    return Err(FsError::NotDir);
                }
                replaced = Some((target_ino, target_row.is_dir()));
            }

            conn.begin().await?;
            let result: FsResult<i64> = async {
                if replaced.is_some() {
                    let (name_id, _) = conn
                        .remove_entry(new_parent, new_name)
                        .await?
                        .ok_or(FsError::NotFound)?;
                    conn.release_name(name_id).await?;
                }
                let (name_id, _) = conn
                    .remove_entry(parent, name)
                    .await?
                    .ok_or(FsError::NotFound)?;
                conn.release_name(name_id).await?;
                let new_name_id = conn.intern_name(new_name).await?;
                conn.insert_entry(new_parent, new_name_id, inode).await?;
                let refcount = if let Some((target_ino, is_dir)) = replaced {
                    if is_dir {
                        0
                    } else {
                        conn.adjust_inode_refcount(target_ino, -1).await?
                    }
                } else {
                    1
                };
                conn.touch_mtime(parent).await?;
                conn.touch_mtime(new_parent).await?;
                conn.touch_ctime(inode).await?;
                Ok(refcount)
            }
            .await;
            match result {
                Ok(remaining) => {
                    conn.commit().await?;
                    replaced.filter(|_| remaining <= 0)
                }
                Err(e) => {
                    conn.rollback().await?;
                    return Err(e);
                }
            }
        };

        if let Some((target_ino, _)) = replaced {
            if self.open_count(target_ino) > 0 {
                self.unlinked.insert(target_ino, ());
            } else {
                self.destroy_inode(target_ino).await?;
            }
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // open files and data I/O

    pub async fn open(&self, inode: i64, write: bool) -> FsResult<u64> {
        self.check_running()?;
        let mut conn = self.db.lock().await;
        let row = Self::require_inode(&mut conn, inode).await?;
        if row.is_dir() {
            return Err(FsError::IsDir);
        }
        if write && row.locked {
            return Err(FsError::Locked);
        }
        drop(conn);
        Ok(self.register_handle(inode))
    }

    fn resolve_fh(&self, fh: u64) -> FsResult<i64> {
        self.open_files
            .get(&fh)
            .map(|f| f.inode)
            .ok_or(FsError::InvalidArgument("bad file handle".into()))
    }

    pub async fn read(&self, fh: u64, offset: u64, size: u32) -> FsResult<Bytes> {
        let inode = self.resolve_fh(fh)?;
        self.read_inode(inode, offset, size).await
    }

    pub async fn read_inode(&self, inode: i64, offset: u64, size: u32) -> FsResult<Bytes> {
        let file_size = {
            let mut conn = self.db.lock().await;
            Self::require_inode(&mut conn, inode).await?.size as u64
        };

        if size == 0 || offset >= file_size {
            return Ok(Bytes::new());
        }
        let read_end = std::cmp::min(offset + size as u64, file_size);
        let mut remaining = (read_end - offset) as usize;
        let mut pos = offset;
        let mut out = BytesMut::with_capacity(remaining);

        while remaining > 0 {
            let blockno = (pos / self.block_size) as i64;
            let off_in_block = pos % self.block_size;
            let chunk = std::cmp::min(remaining as u64, self.block_size - off_in_block) as usize;

            match self
                .cache
                .read(inode, blockno, off_in_block, chunk)
                .await?
            {
                Some(data) => {
                    out.extend_from_slice(&data);
                    // Stored block may be shorter than the logical span when
                    // the tail was never written.
                    out.resize(out.len() + (chunk - data.len()), 0);
                }
                None => out.resize(out.len() + chunk, 0),
            }
            pos += chunk as u64;
            remaining -= chunk;
        }

        Ok(out.freeze())
    }

    pub async fn write(&self, fh: u64, offset: u64, data: &[u8]) -> FsResult<u32> {
        self.check_running()?;
        let inode = self.resolve_fh(fh)?;

        let mut pos = offset;
        let mut rest = data;
        while !rest.is_empty() {
            let blockno = (pos / self.block_size) as i64;
            let off_in_block = pos % self.block_size;
            let chunk = std::cmp::min(rest.len() as u64, self.block_size - off_in_block) as usize;
            self.cache
                .write(inode, blockno, off_in_block, &rest[..chunk])
                .await?;
            pos += chunk as u64;
            rest = &rest[chunk..];
        }

        let end = offset + data.len() as u64;
        let mut conn = self.db.lock().await;
        let row = Self::require_inode(&mut conn, inode).await?;
        if (row.size as u64) < end {
            conn.set_inode_size(inode, end as i64).await?;
        } else {
            conn.touch_mtime(inode).await?;
        }
        Ok(data.len() as u32)
    }

    /// Waits until every dirty block of the handle's inode has an
    /// acknowledged upload.
    pub async fn flush(&self, fh: u64) -> FsResult<()> {
        let inode = self.resolve_fh(fh)?;
        self.cache.flush_inode(inode).await
    }

    pub async fn fsync(&self, inode: i64) -> FsResult<()> {
        self.cache.flush_inode(inode).await
    }

    pub async fn release(&self, fh: u64) -> FsResult<()> {
        let Some((_, open)) = self.open_files.remove(&fh) else {
            return Ok(());
        };
        let inode = open.inode;
        let remaining = {
            let mut entry = self
                .open_counts
                .get_mut(&inode)
                .expect("open count missing for open handle");
            *entry -= 1;
            *entry
        };
        if remaining == 0 {
            self.open_counts.remove(&inode);
            if self.unlinked.remove(&inode).is_some() {
                self.destroy_inode(inode).await?;
            }
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // directories

    /// Entries after `offset` previously returned ones, as
    /// `(name, inode, mode)`. `.` and `..` are synthesized by the caller.
    pub async fn readdir(&self, inode: i64, offset: i64) -> FsResult<Vec<(Vec<u8>, i64, u32)>> {
        let mut conn = self.db.lock().await;
        let row = Self::require_inode(&mut conn, inode).await?;
        if !row.is_dir() {
            return Err(FsError::NotDir);
        }
        conn.list_dir(inode, offset).await
    }

    /// Like [`Self::readdir`], with full attributes per entry.
    pub async fn readdir_attrs(
        &self,
        inode: i64,
        offset: i64,
    ) -> FsResult<Vec<(Vec<u8>, InodeRow)>> {
        let mut conn = self.db.lock().await;
        let row = Self::require_inode(&mut conn, inode).await?;
        if !row.is_dir() {
            return Err(FsError::NotDir);
        }
        conn.list_dir_attrs(inode, offset).await
    }

    // ------------------------------------------------------------------
    // extended attributes

    pub async fn getxattr(&self, inode: i64, name: &[u8]) -> FsResult<Vec<u8>> {
        let mut conn = self.db.lock().await;
        conn.get_xattr(inode, name).await?.ok_or(FsError::NotFound)
    }

    pub async fn setxattr(&self, inode: i64, name: &[u8], value: &[u8]) -> FsResult<()> {
        self.check_running()?;
        validate_name(name)?;
        let mut conn = self.db.lock().await;
        let row = Self::require_inode(&mut conn, inode).await?;
        if row.locked {
            return Err(FsError::Locked);
        }
        let name_id = conn.intern_name(name).await?;
        let replaced = conn.set_xattr(inode, name_id, value).await?;
        if replaced {
            // The attribute row already held a reference to this name.
            conn.release_name(name_id).await?;
        }
        conn.touch_ctime(inode).await?;
        Ok(())
    }

    pub async fn listxattr(&self, inode: i64) -> FsResult<Vec<Vec<u8>>> {
        let mut conn = self.db.lock().await;
        Self::require_inode(&mut conn, inode).await?;
        conn.list_xattrs(inode).await
    }

    pub async fn removexattr(&self, inode: i64, name: &[u8]) -> FsResult<()> {
        self.check_running()?;
        let mut conn = self.db.lock().await;
        let row = Self::require_inode(&mut conn, inode).await?;
        if row.locked {
            return Err(FsError::Locked);
        }
        let name_id = conn
            .remove_xattr(inode, name)
            .await?
            .ok_or(FsError::NotFound)?;
        conn.release_name(name_id).await?;
        conn.touch_ctime(inode).await?;
        Ok(())
    }

    // ------------------------------------------------------------------
    // statistics

    /// Free space is reported as `max(used, 1 TiB)` so that the filesystem
    /// always looks half full but never smaller than 2 TiB.
    pub async fn statfs(&self) -> FsResult<FsStats> {
        let mut conn = self.db.lock().await;
        let used = conn.stored_bytes().await? as u64;
        let inodes = conn.entry_count().await? as u64;
        Ok(FsStats {
            used_bytes: used,
            free_bytes: std::cmp::max(used, 1 << 40),
            inode_count: inodes,
        })
    }
}
