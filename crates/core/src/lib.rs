//! Storage engine for a deduplicating, encrypting FUSE filesystem backed by
//! an object store.
//!
//! Files are split into fixed-size blocks. Each block is content-addressed,
//! compressed and encrypted, and stored as one backend object. Filesystem
//! structure lives in an embedded SQLite database that is snapshotted to the
//! backend periodically and on unmount.

pub mod blocks;
pub mod cache;
pub mod config;
pub mod database;
pub mod error;
pub mod fs;
pub mod fsck;
pub mod fuse;
pub mod metadata;
pub mod mkfs;
pub mod mount;
pub mod params;
pub mod seq;

mod lock_map;

pub use config::Config;
pub use error::{FsError, FsResult};

/// On-disk format revision; bumped on incompatible changes.
pub const CURRENT_FS_REV: u32 = 1;

// Backend key namespace.
pub const KEY_PARAMS: &str = "s3ql_params";
pub const KEY_PASSPHRASE: &str = "s3ql_passphrase";
pub const KEY_METADATA: &str = "s3ql_metadata";
pub const METADATA_BAK_PREFIX: &str = "s3ql_metadata_bak";
pub const METADATA_DELTA_PREFIX: &str = "s3ql_metadata_delta_";
pub const SEQNO_PREFIX: &str = "s3ql_seq_no_";
pub const DATA_PREFIX: &str = "s3ql_data_";
