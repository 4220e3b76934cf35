use fuse3::Errno;
use s3ql_backends::BackendError;
use std::io;
use thiserror::Error;

pub type FsResult<T> = Result<T, FsError>;

#[derive(Error, Debug)]
pub enum FsError {
    #[error("no such entry")]
    NotFound,

    #[error("entry already exists")]
    Exists,

    #[error("directory not empty")]
    NotEmpty,

    #[error("is a directory")]
    IsDir,

    #[error("not a directory")]
    NotDir,

    #[error("inode is immutable")]
    Locked,

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("not supported: {0}")]
    Unsupported(String),

    #[error("file system is shutting down")]
    ShuttingDown,

    #[error("no space left in cache directory")]
    OutOfSpace,

    #[error("file system was not unmounted cleanly, run fsck first")]
    NotClean,

    #[error("file system is mounted elsewhere (or a stale mount marker exists)")]
    AlreadyMounted,

    #[error("cache directory is in use: {0}")]
    CacheInUse(String),

    #[error("authentication failed: {0}")]
    Auth(String),

    #[error("file system damaged: {0}")]
    Corruption(String),

    #[error("file system revision {0} is not supported by this version")]
    VersionMismatch(u32),

    #[error("backend error: {0}")]
    Backend(BackendError),

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error(transparent)]
    Io(#[from] io::Error),
}

impl From<BackendError> for FsError {
    fn from(e: BackendError) -> Self {
        match e {
            BackendError::Auth(msg) => FsError::Auth(msg),
            BackendError::Corrupted(msg) => FsError::Corruption(msg),
            BackendError::VersionMismatch(v) => FsError::VersionMismatch(v as u32),
            other => FsError::Backend(other),
        }
    }
}

impl FsError {
    pub fn errno(&self) -> i32 {
        match self {
            FsError::NotFound => libc::ENOENT,
            FsError::Exists => libc::EEXIST,
            FsError::NotEmpty => libc::ENOTEMPTY,
            FsError::IsDir => libc::EISDIR,
            FsError::NotDir => libc::ENOTDIR,
            FsError::Locked => libc::EPERM,
            FsError::InvalidArgument(_) => libc::EINVAL,
            FsError::Unsupported(_) => libc::ENOTSUP,
            FsError::ShuttingDown => libc::EIO,
            FsError::OutOfSpace => libc::ENOSPC,
            FsError::Backend(e) if e.is_temp_failure() => libc::EAGAIN,
            _ => libc::EIO,
        }
    }

    /// Process exit code for the command-line tools.
    pub fn exit_code(&self) -> i32 {
        match self {
            FsError::NotClean => 10,
            FsError::AlreadyMounted | FsError::CacheInUse(_) => 11,
            FsError::Auth(_) => 12,
            FsError::VersionMismatch(_) => 13,
            FsError::Backend(_) => 14,
            _ => 1,
        }
    }
}

impl From<FsError> for io::Error {
    fn from(e: FsError) -> Self {
        io::Error::from_raw_os_error(e.errno())
    }
}

impl From<FsError> for Errno {
    fn from(e: FsError) -> Self {
        let io_err: io::Error = e.into();
        Errno::from(io_err)
    }
}
