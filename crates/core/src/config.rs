use serde::Deserialize;
use std::path::PathBuf;
use std::time::Duration;

use crate::error::{FsError, FsResult};

pub const MIN_BLOCK_SIZE: u64 = 64 * 1024;

#[derive(Deserialize, Debug, Clone)]
pub struct Config {
    #[serde(default = "default_cachedir")]
    pub cachedir: PathBuf,

    #[serde(default = "default_max_cache_size")]
    pub max_cache_size: u64,
    #[serde(default = "default_max_cache_entries")]
    pub max_cache_entries: usize,

    #[serde(default = "default_upload_threads")]
    pub upload_threads: usize,
    #[serde(default = "default_worker_threads")]
    pub worker_threads: usize,

    #[serde(default = "default_compression_algorithm")]
    pub compression_algorithm: String,
    #[serde(default = "default_compression_level")]
    pub compression_level: u32,

    #[serde(default = "default_metadata_upload_interval")]
    pub metadata_upload_interval_secs: u64,

    /// How long to wait for backend listings to settle during the
    /// mount-exclusion handshake.
    #[serde(default = "default_consistency_delay")]
    pub consistency_delay_secs: u64,

    #[serde(default)]
    pub allow_other: bool,

    /// Passphrase for the wrapped master key. Usually supplied via the
    /// S3QL_PASSPHRASE environment variable rather than the config file.
    #[serde(default)]
    pub passphrase: Option<String>,
}

fn default_cachedir() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".s3ql")
}
fn default_max_cache_size() -> u64 {
    256 * 1024 * 1024
}
fn default_max_cache_entries() -> usize {
    768
}
fn default_upload_threads() -> usize {
    4
}
fn default_worker_threads() -> usize {
    2
}
fn default_compression_algorithm() -> String {
    "zlib".to_string()
}
fn default_compression_level() -> u32 {
    6
}
fn default_metadata_upload_interval() -> u64 {
    24 * 60 * 60
}
fn default_consistency_delay() -> u64 {
    1
}

impl Config {
    pub fn metadata_upload_interval(&self) -> Duration {
        Duration::from_secs(self.metadata_upload_interval_secs)
    }

    pub fn consistency_delay(&self) -> Duration {
        Duration::from_secs(self.consistency_delay_secs)
    }

    /// Reject combinations the cache cannot operate under.
    pub fn validate(&self, data_block_size: u64) -> FsResult<()> {
        if self.max_cache_size < data_block_size {
            return Err(FsError::InvalidArgument(format!(
                "max_cache_size ({}) must be at least the data block size ({})",
                self.max_cache_size, data_block_size
            )));
        }
        if self.max_cache_entries == 0 {
            return Err(FsError::InvalidArgument(
                "max_cache_entries must be positive".into(),
            ));
        }
        if self.upload_threads == 0 {
            return Err(FsError::InvalidArgument(
                "upload_threads must be positive".into(),
            ));
        }
        Ok(())
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            cachedir: default_cachedir(),
            max_cache_size: default_max_cache_size(),
            max_cache_entries: default_max_cache_entries(),
            upload_threads: default_upload_threads(),
            worker_threads: default_worker_threads(),
            compression_algorithm: default_compression_algorithm(),
            compression_level: default_compression_level(),
            metadata_upload_interval_secs: default_metadata_upload_interval(),
            consistency_delay_secs: default_consistency_delay(),
            allow_other: false,
            passphrase: None,
        }
    }
}

/// Default data block size chosen at mkfs time.
pub const DEFAULT_BLOCK_SIZE: u64 = 10 * 1024 * 1024;

/// Validate a block size chosen at mkfs time: at least 64 KiB and a multiple
/// of it (so the cache can slice I/O on aligned boundaries).
pub fn check_block_size(data_block_size: u64) -> FsResult<()> {
    if data_block_size < MIN_BLOCK_SIZE || data_block_size % MIN_BLOCK_SIZE != 0 {
        return Err(FsError::InvalidArgument(format!(
            "data block size must be a multiple of {MIN_BLOCK_SIZE}, got {data_block_size}"
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_block_size_validation() {
        assert!(check_block_size(64 * 1024).is_ok());
        assert!(check_block_size(DEFAULT_BLOCK_SIZE).is_ok());
        assert!(check_block_size(4096).is_err());
        assert!(check_block_size(65 * 1024).is_err());
    }

    #[test]
    fn test_cache_smaller_than_block_rejected() {
        let cfg = Config {
            max_cache_size: 1024,
            ..Config::default()
        };
        assert!(matches!(
            cfg.validate(65536),
            Err(FsError::InvalidArgument(_))
        ));
    }
}
