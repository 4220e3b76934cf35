//! The filesystem parameter document.
//!
//! A small JSON object stored unencrypted at `s3ql_params` and mirrored into
//! `<cachedir>/<uuid>.params`. It carries everything a mount needs before the
//! master key is available, plus the state used to decide whether local or
//! remote metadata is fresher.

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use uuid::Uuid;

use crate::error::{FsError, FsResult};
use crate::{CURRENT_FS_REV, KEY_PARAMS};
use s3ql_backends::{BackendError, ObjectBackend};

#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct FsParams {
    pub revision: u32,
    pub uuid: Uuid,
    pub label: String,
    pub data_block_size: u64,
    pub metadata_page_size: u64,
    pub encrypted: bool,

    /// Sequence number of the last mount that wrote these params.
    pub seq_no: u64,
    /// Set while a mount is live; a crashed mount leaves it set.
    pub needs_fsck: bool,

    /// Size and digest of the database image described by the current
    /// snapshot + deltas.
    pub db_size: u64,
    pub db_sha256: String,
    /// Number of the next metadata delta object.
    pub delta_seq: u64,
}

impl FsParams {
    pub fn new(label: String, data_block_size: u64, encrypted: bool) -> Self {
        Self {
            revision: CURRENT_FS_REV,
            uuid: Uuid::new_v4(),
            label,
            data_block_size,
            metadata_page_size: 64 * 1024,
            encrypted,
            seq_no: 0,
            needs_fsck: false,
            db_size: 0,
            db_sha256: String::new(),
            delta_seq: 0,
        }
    }

    pub fn check_revision(&self) -> FsResult<()> {
        if self.revision != CURRENT_FS_REV {
            return Err(FsError::VersionMismatch(self.revision));
        }
        Ok(())
    }

    fn to_bytes(&self) -> FsResult<Bytes> {
        let buf = serde_json::to_vec_pretty(self)
            .map_err(|e| FsError::Corruption(format!("cannot serialize params: {e}")))?;
        Ok(Bytes::from(buf))
    }

    fn from_bytes(buf: &[u8]) -> FsResult<Self> {
        serde_json::from_slice(buf)
            .map_err(|e| FsError::Corruption(format!("invalid parameter object: {e}")))
    }

    /// Fetch the parameter object from the backend root.
    pub async fn fetch(backend: &dyn ObjectBackend) -> FsResult<Self> {
        match backend.get(KEY_PARAMS).await {
            Ok(buf) => Self::from_bytes(&buf),
            Err(BackendError::NoSuchObject(_)) => Err(FsError::Corruption(
                "no file system found at this storage location".into(),
            )),
            Err(e) => Err(e.into()),
        }
    }

    /// Store the parameter object remotely and mirror it to the local params
    /// file. The local copy is written first via rename so a crash between
    /// the two writes leaves the local sequence number no older than the
    /// remote one.
    pub async fn store(&self, backend: &dyn ObjectBackend, cachedir: &Path) -> FsResult<()> {
        self.store_local(cachedir)?;
        backend.put(KEY_PARAMS, self.to_bytes()?).await?;
        Ok(())
    }

    pub fn local_path(cachedir: &Path, uuid: &Uuid) -> PathBuf {
        cachedir.join(format!("{uuid}.params"))
    }

    /// Update only the local mirror. A live mount does this right after
    /// claiming its sequence number: the remote copy keeps the last clean
    /// state until unmount, which is what crash detection relies on.
    pub fn store_local(&self, cachedir: &Path) -> FsResult<()> {
        let buf = self.to_bytes()?;
        let path = Self::local_path(cachedir, &self.uuid);
        let tmp = path.with_extension("params.tmp");
        std::fs::write(&tmp, &buf)?;
        let fh = std::fs::File::open(&tmp)?;
        fh.sync_all()?;
        std::fs::rename(&tmp, &path)?;
        Ok(())
    }

    /// Read the local mirror, if one exists for this filesystem.
    pub fn load_local(cachedir: &Path, uuid: &Uuid) -> FsResult<Option<Self>> {
        let path = Self::local_path(cachedir, uuid);
        match std::fs::read(&path) {
            Ok(buf) => Ok(Some(Self::from_bytes(&buf)?)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use s3ql_backends::MemBackend;

    #[tokio::test]
    async fn test_store_and_fetch() {
        let backend = MemBackend::new();
        let dir = tempfile::tempdir().unwrap();
        let params = FsParams::new("testfs".into(), 65536, true);

        params.store(&backend, dir.path()).await.unwrap();

        let fetched = FsParams::fetch(&backend).await.unwrap();
        assert_eq!(fetched.uuid, params.uuid);
        assert_eq!(fetched.data_block_size, 65536);

        let local = FsParams::load_local(dir.path(), &params.uuid)
            .unwrap()
            .unwrap();
        assert_eq!(local.seq_no, params.seq_no);
    }

    #[tokio::test]
    async fn test_missing_params_is_not_a_filesystem() {
        let backend = MemBackend::new();
        assert!(matches!(
            FsParams::fetch(&backend).await,
            Err(FsError::Corruption(_))
        ));
    }

    #[test]
    fn test_revision_check() {
        let mut params = FsParams::new("x".into(), 65536, false);
        params.revision = 999;
        assert!(matches!(
            params.check_revision(),
            Err(FsError::VersionMismatch(999))
        ));
    }
}
