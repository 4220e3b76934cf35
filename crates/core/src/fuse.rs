//! FUSE bridge: translates fuse3 requests into [`S3qlFs`] operations.

use bytes::Bytes;
use fuse3::raw::reply::{
    DirectoryEntry, DirectoryEntryPlus, FileAttr, ReplyAttr, ReplyCreated, ReplyData,
    ReplyDirectory, ReplyDirectoryPlus, ReplyEntry, ReplyInit, ReplyLSeek, ReplyOpen,
    ReplyStatFs, ReplyWrite, ReplyXAttr,
};
use fuse3::raw::{Filesystem, Request, Session};
use fuse3::{Errno, FileType, MountOptions, SetAttr, Timestamp};
use futures::stream;
use std::ffi::OsStr;
use std::num::NonZeroU32;
use std::os::unix::ffi::{OsStrExt, OsStringExt};
use std::sync::Arc;
use std::time::Duration;

use crate::config::Config;
use crate::database::InodeRow;
use crate::error::FsResult;
use crate::fs::{AttrChanges, RequestCtx, S3qlFs};
use crate::mount::MountedFs;

const TTL: Duration = Duration::from_secs(1);
const STATFS_BSIZE: u32 = 4096;

pub struct FuseFs {
    fs: Arc<S3qlFs>,
}

impl FuseFs {
    pub fn new(fs: Arc<S3qlFs>) -> Self {
        Self { fs }
    }

    fn attr_from_row(&self, row: &InodeRow) -> FileAttr {
        let kind = match row.mode & libc::S_IFMT {
            libc::S_IFDIR => FileType::Directory,
            libc::S_IFLNK => FileType::Symlink,
            libc::S_IFBLK => FileType::BlockDevice,
            libc::S_IFCHR => FileType::CharDevice,
            libc::S_IFIFO => FileType::NamedPipe,
            libc::S_IFSOCK => FileType::Socket,
            _ => FileType::RegularFile,
        };
        FileAttr {
            ino: row.id as u64,
            size: row.size as u64,
            blocks: (row.size as u64).div_ceil(512),
            atime: ts_from_ns(row.atime_ns),
            mtime: ts_from_ns(row.mtime_ns),
            ctime: ts_from_ns(row.ctime_ns),
            kind,
            perm: (row.mode & 0o7777) as u16,
            nlink: row.refcount as u32,
            uid: row.uid,
            gid: row.gid,
            rdev: row.rdev,
            blksize: self.fs.block_size() as u32,
        }
    }

    fn entry_reply(&self, row: &InodeRow) -> ReplyEntry {
        ReplyEntry {
            ttl: TTL,
            attr: self.attr_from_row(row),
            generation: 0,
        }
    }
}

fn ts_from_ns(ns: i64) -> Timestamp {
    Timestamp::new(ns.div_euclid(1_000_000_000), ns.rem_euclid(1_000_000_000) as u32)
}

fn ns_from_ts(ts: Timestamp) -> i64 {
    ts.sec * 1_000_000_000 + ts.nsec as i64
}

fn ctx_of(req: &Request) -> RequestCtx {
    RequestCtx {
        uid: req.uid,
        gid: req.gid,
    }
}

impl Filesystem for FuseFs {
    type DirEntryStream<'a> = stream::Iter<std::vec::IntoIter<Result<DirectoryEntry, Errno>>>;
    type DirEntryPlusStream<'a> =
        stream::Iter<std::vec::IntoIter<Result<DirectoryEntryPlus, Errno>>>;

    async fn init(&self, _req: Request) -> fuse3::Result<ReplyInit> {
        tracing::info!("FUSE file system mounted");
        Ok(ReplyInit {
            max_write: NonZeroU32::new(1024 * 1024).unwrap(),
        })
    }

    async fn destroy(&self, _req: Request) {
        tracing::info!("FUSE file system unmounted");
    }

    async fn lookup(&self, _req: Request, parent: u64, name: &OsStr) -> fuse3::Result<ReplyEntry> {
        let row = self.fs.lookup(parent as i64, name.as_bytes()).await?;
        Ok(self.entry_reply(&row))
    }

    async fn forget(&self, _req: Request, _inode: u64, _nlookup: u64) {}

    async fn getattr(
        &self,
        _req: Request,
        inode: u64,
        _fh: Option<u64>,
        _flags: u32,
    ) -> fuse3::Result<ReplyAttr> {
        let row = self.fs.getattr(inode as i64).await?;
        Ok(ReplyAttr {
            ttl: TTL,
            attr: self.attr_from_row(&row),
        })
    }

    async fn setattr(
        &self,
        _req: Request,
        inode: u64,
        _fh: Option<u64>,
        set_attr: SetAttr,
    ) -> fuse3::Result<ReplyAttr> {
        let changes = AttrChanges {
            mode: set_attr.mode,
            uid: set_attr.uid,
            gid: set_attr.gid,
            size: set_attr.size,
            atime_ns: set_attr.atime.map(ns_from_ts),
            mtime_ns: set_attr.mtime.map(ns_from_ts),
        };
        let row = self.fs.setattr(inode as i64, changes).await?;
        Ok(ReplyAttr {
            ttl: TTL,
            attr: self.attr_from_row(&row),
        })
    }

    async fn mknod(
        &self,
        req: Request,
        parent: u64,
        name: &OsStr,
        mode: u32,
        rdev: u32,
    ) -> fuse3::Result<ReplyEntry> {
        let row = self
            .fs
            .mknod(ctx_of(&req), parent as i64, name.as_bytes(), mode, rdev)
            .await?;
        Ok(self.entry_reply(&row))
    }

    async fn mkdir(
        &self,
        req: Request,
        parent: u64,
        name: &OsStr,
        mode: u32,
        _umask: u32,
    ) -> fuse3::Result<ReplyEntry> {
        let row = self
            .fs
            .mkdir(ctx_of(&req), parent as i64, name.as_bytes(), mode)
            .await?;
        Ok(self.entry_reply(&row))
    }

    async fn unlink(&self, _req: Request, parent: u64, name: &OsStr) -> fuse3::Result<()> {
        Ok(self.fs.unlink(parent as i64, name.as_bytes()).await?)
    }

    async fn rmdir(&self, _req: Request, parent: u64, name: &OsStr) -> fuse3::Result<()> {
        Ok(self.fs.rmdir(parent as i64, name.as_bytes()).await?)
    }

    async fn symlink(
        &self,
        req: Request,
        parent: u64,
        name: &OsStr,
        link: &OsStr,
    ) -> fuse3::Result<ReplyEntry> {
        let row = self
            .fs
            .symlink(ctx_of(&req), parent as i64, name.as_bytes(), link.as_bytes())
            .await?;
        Ok(self.entry_reply(&row))
    }

    async fn readlink(&self, _req: Request, inode: u64) -> fuse3::Result<ReplyData> {
        let target = self.fs.readlink(inode as i64).await?;
        Ok(ReplyData {
            data: Bytes::from(target),
        })
    }

    async fn rename(
        &self,
        _req: Request,
        parent: u64,
        name: &OsStr,
        new_parent: u64,
        new_name: &OsStr,
    ) -> fuse3::Result<()> {
        Ok(self
            .fs
            .rename(
                parent as i64,
                name.as_bytes(),
                new_parent as i64,
                new_name.as_bytes(),
            )
            .await?)
    }

    async fn link(
        &self,
        _req: Request,
        inode: u64,
        new_parent: u64,
        new_name: &OsStr,
    ) -> fuse3::Result<ReplyEntry> {
        let row = self
            .fs
            .link(inode as i64, new_parent as i64, new_name.as_bytes())
            .await?;
        Ok(self.entry_reply(&row))
    }

    async fn open(&self, _req: Request, inode: u64, flags: u32) -> fuse3::Result<ReplyOpen> {
        let write_flags = libc::O_WRONLY as u32 | libc::O_RDWR as u32;
        let write = flags & write_flags != 0;
        let fh = self.fs.open(inode as i64, write).await?;
        Ok(ReplyOpen { fh, flags: 0 })
    }

    async fn read(
        &self,
        _req: Request,
        _inode: u64,
        fh: u64,
        offset: u64,
        size: u32,
    ) -> fuse3::Result<ReplyData> {
        let data = self.fs.read(fh, offset, size).await?;
        Ok(ReplyData { data })
    }

    async fn write(
        &self,
        _req: Request,
        _inode: u64,
        fh: u64,
        offset: u64,
        data: &[u8],
        _write_flags: u32,
        _flags: u32,
    ) -> fuse3::Result<ReplyWrite> {
        let written = self.fs.write(fh, offset, data).await?;
        Ok(ReplyWrite { written })
    }

    async fn flush(&self, _req: Request, _inode: u64, fh: u64, _lock_owner: u64) -> fuse3::Result<()> {
        Ok(self.fs.flush(fh).await?)
    }

    async fn release(
        &self,
        _req: Request,
        _inode: u64,
        fh: u64,
        _flags: u32,
        _lock_owner: u64,
        _flush: bool,
    ) -> fuse3::Result<()> {
        Ok(self.fs.release(fh).await?)
    }

    async fn fsync(&self, _req: Request, inode: u64, _fh: u64, _datasync: bool) -> fuse3::Result<()> {
        Ok(self.fs.fsync(inode as i64).await?)
    }

    async fn create(
        &self,
        req: Request,
        parent: u64,
        name: &OsStr,
        mode: u32,
        _flags: u32,
    ) -> fuse3::Result<ReplyCreated> {
        let (fh, row) = self
            .fs
            .create(ctx_of(&req), parent as i64, name.as_bytes(), mode)
            .await?;
        Ok(ReplyCreated {
            ttl: TTL,
            attr: self.attr_from_row(&row),
            generation: 0,
            fh,
            flags: 0,
        })
    }

    async fn opendir(&self, _req: Request, inode: u64, _flags: u32) -> fuse3::Result<ReplyOpen> {
        self.fs.getattr(inode as i64).await?;
        Ok(ReplyOpen { fh: 0, flags: 0 })
    }

    async fn readdir(
        &self,
        _req: Request,
        parent: u64,
        _fh: u64,
        offset: i64,
    ) -> fuse3::Result<ReplyDirectory<Self::DirEntryStream<'_>>> {
        let parent = parent as i64;
        let mut all: Vec<(Vec<u8>, i64, FileType)> = vec![
            (b".".to_vec(), parent, FileType::Directory),
            (b"..".to_vec(), parent, FileType::Directory),
        ];
        for (name, ino, mode) in self.fs.readdir(parent, 0).await? {
            let kind = if mode & libc::S_IFMT == libc::S_IFDIR {
                FileType::Directory
            } else if mode & libc::S_IFMT == libc::S_IFLNK {
                FileType::Symlink
            } else {
                FileType::RegularFile
            };
            all.push((name, ino, kind));
        }

        let offset = offset as usize;
        let entries: Vec<Result<DirectoryEntry, Errno>> = all
            .into_iter()
            .skip(offset)
            .enumerate()
            .map(|(idx, (name, ino, kind))| {
                Ok(DirectoryEntry {
                    inode: ino as u64,
                    kind,
                    name: std::ffi::OsString::from_vec(name),
                    offset: (offset + idx + 1) as i64,
                })
            })
            .collect();

        Ok(ReplyDirectory {
            entries: stream::iter(entries),
        })
    }

    async fn readdirplus(
        &self,
        _req: Request,
        parent: u64,
        _fh: u64,
        offset: u64,
        _lock_owner: u64,
    ) -> fuse3::Result<ReplyDirectoryPlus<Self::DirEntryPlusStream<'_>>> {
        let parent = parent as i64;
        let parent_row = self.fs.getattr(parent).await?;

        let mut all: Vec<(Vec<u8>, InodeRow)> = vec![
            (b".".to_vec(), parent_row.clone()),
            (b"..".to_vec(), parent_row),
        ];
        for (name, row) in self.fs.readdir_attrs(parent, 0).await? {
            all.push((name, row));
        }

        let offset = offset as usize;
        let entries: Vec<Result<DirectoryEntryPlus, Errno>> = all
            .into_iter()
            .skip(offset)
            .enumerate()
            .map(|(idx, (name, row))| {
                let attr = self.attr_from_row(&row);
                Ok(DirectoryEntryPlus {
                    inode: row.id as u64,
                    generation: 0,
                    kind: attr.kind,
                    name: std::ffi::OsString::from_vec(name),
                    offset: (offset + idx + 1) as i64,
                    attr,
                    entry_ttl: TTL,
                    attr_ttl: TTL,
                })
            })
            .collect();

        Ok(ReplyDirectoryPlus {
            entries: stream::iter(entries),
        })
    }

    async fn releasedir(&self, _req: Request, _inode: u64, _fh: u64, _flags: u32) -> fuse3::Result<()> {
        Ok(())
    }

    async fn fsyncdir(&self, _req: Request, _inode: u64, _fh: u64, _datasync: bool) -> fuse3::Result<()> {
        Ok(())
    }

    async fn access(&self, _req: Request, inode: u64, _mask: u32) -> fuse3::Result<()> {
        self.fs.getattr(inode as i64).await?;
        Ok(())
    }

    async fn getxattr(
        &self,
        _req: Request,
        inode: u64,
        name: &OsStr,
        size: u32,
    ) -> fuse3::Result<ReplyXAttr> {
        let value = self.fs.getxattr(inode as i64, name.as_bytes()).await?;
        if size == 0 {
            return Ok(ReplyXAttr::Size(value.len() as u32));
        }
        if value.len() as u32 > size {
            return Err(Errno::from(libc::ERANGE));
        }
        Ok(ReplyXAttr::Data(Bytes::from(value)))
    }

    async fn setxattr(
        &self,
        _req: Request,
        inode: u64,
        name: &OsStr,
        value: &[u8],
        _flags: u32,
        _position: u32,
    ) -> fuse3::Result<()> {
        Ok(self
            .fs
            .setxattr(inode as i64, name.as_bytes(), value)
            .await?)
    }

    async fn listxattr(&self, _req: Request, inode: u64, size: u32) -> fuse3::Result<ReplyXAttr> {
        let names = self.fs.listxattr(inode as i64).await?;
        let mut buf = Vec::new();
        for name in names {
            buf.extend_from_slice(&name);
            buf.push(0);
        }
        if size == 0 {
            return Ok(ReplyXAttr::Size(buf.len() as u32));
        }
        if buf.len() as u32 > size {
            return Err(Errno::from(libc::ERANGE));
        }
        Ok(ReplyXAttr::Data(Bytes::from(buf)))
    }

    async fn removexattr(&self, _req: Request, inode: u64, name: &OsStr) -> fuse3::Result<()> {
        Ok(self.fs.removexattr(inode as i64, name.as_bytes()).await?)
    }

    async fn statfs(&self, _req: Request, _inode: u64) -> fuse3::Result<ReplyStatFs> {
        let stats = self.fs.statfs().await?;
        let total = stats.used_bytes + stats.free_bytes;
        Ok(ReplyStatFs {
            blocks: total / STATFS_BSIZE as u64,
            bfree: stats.free_bytes / STATFS_BSIZE as u64,
            bavail: stats.free_bytes / STATFS_BSIZE as u64,
            files: stats.inode_count + (1 << 32),
            ffree: 1 << 32,
            bsize: STATFS_BSIZE,
            namelen: crate::fs::NAME_MAX as u32,
            frsize: STATFS_BSIZE,
        })
    }

    async fn lseek(
        &self,
        _req: Request,
        _inode: u64,
        _fh: u64,
        offset: u64,
        _whence: u32,
    ) -> fuse3::Result<ReplyLSeek> {
        Ok(ReplyLSeek { offset })
    }
}

/// Mount the filesystem at `mountpoint` and serve until unmounted or
/// interrupted, then perform a clean shutdown.
pub async fn mount_and_serve(
    config: Config,
    storage_url: &str,
    mountpoint: &str,
) -> FsResult<()> {
    let raw = s3ql_backends::open_backend(storage_url)?;
    let mounted = MountedFs::init(&config, raw).await?;
    let fuse_fs = FuseFs::new(mounted.fs.clone());

    let mut mount_options = MountOptions::default();
    mount_options.fs_name("s3ql");
    if config.allow_other {
        mount_options.allow_other(true);
    }

    let mount_handle = Session::new(mount_options)
        .mount_with_unprivileged(fuse_fs, mountpoint)
        .await?;

    let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())?;
    let mut sigint = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::interrupt())?;

    tokio::select! {
        res = mount_handle => {
            res?;
        }
        _ = sigterm.recv() => {
            tracing::info!("received SIGTERM, unmounting");
        }
        _ = sigint.recv() => {
            tracing::info!("received SIGINT, unmounting");
        }
    }

    mounted.shutdown().await
}
