//! Metadata snapshots and incremental deltas.
//!
//! The database file is shipped to the backend in two ways: a full encrypted
//! image at `s3ql_metadata` (written on clean unmount, with the previous
//! copies rotated through `s3ql_metadata_bak0..bak9`), and periodic
//! `s3ql_metadata_delta_<N>` objects carrying only the pages that changed
//! since the last upload. A mount downloads the snapshot, replays the deltas
//! in order and verifies the digest recorded in the parameter object.

use rkyv::api::high::to_bytes_in;
use rkyv::{Archive, Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::io::{Seek, SeekFrom, Write};
use std::path::Path;
use std::sync::Arc;

use crate::database::MetaDb;
use crate::error::{FsError, FsResult};
use crate::params::FsParams;
use crate::{KEY_METADATA, METADATA_BAK_PREFIX, METADATA_DELTA_PREFIX};
use s3ql_backends::{BackendError, ObjectBackend};

pub const METADATA_BAK_COUNT: usize = 10;

#[derive(Archive, Serialize, Deserialize, Debug)]
pub struct DeltaPage {
    pub pageno: u64,
    pub data: Vec<u8>,
}

#[derive(Archive, Serialize, Deserialize, Debug)]
pub struct MetadataDelta {
    pub db_size: u64,
    pub pages: Vec<DeltaPage>,
}

/// Remembers the per-page digests of the database image as of the last
/// upload, so the next incremental upload ships only what changed.
pub struct PageTracker {
    page_size: usize,
    hashes: Vec<[u8; 32]>,
}

impl PageTracker {
    pub fn from_image(page_size: usize, image: &[u8]) -> Self {
        let hashes = image
            .chunks(page_size)
            .map(|chunk| Sha256::digest(chunk).into())
            .collect();
        Self { page_size, hashes }
    }

    fn changed_pages(&self, image: &[u8]) -> Vec<DeltaPage> {
        let mut pages = Vec::new();
        for (pageno, chunk) in image.chunks(self.page_size).enumerate() {
            let digest: [u8; 32] = Sha256::digest(chunk).into();
            if self.hashes.get(pageno) != Some(&digest) {
                pages.push(DeltaPage {
                    pageno: pageno as u64,
                    data: chunk.to_vec(),
                });
            }
        }
        pages
    }
}

fn delta_key(seq: u64) -> String {
    format!("{METADATA_DELTA_PREFIX}{seq}")
}

fn bak_key(n: usize) -> String {
    format!("{METADATA_BAK_PREFIX}{n}")
}

/// Checkpoint the WAL and read the complete database image. Holds the
/// metadata lock for the duration so the image is a consistent transaction
/// boundary.
pub async fn read_db_image(db: &MetaDb) -> FsResult<Vec<u8>> {
    let mut conn = db.lock().await;
    conn.checkpoint().await?;
    let image = std::fs::read(conn.path())?;
    Ok(image)
}

fn digest_hex(image: &[u8]) -> String {
    hex::encode(Sha256::digest(image))
}

/// Upload a full snapshot, rotating the previous one into the backup chain
/// and retiring all delta objects it superseded. Updates and stores
/// `params`. Returns the fresh page tracker.
pub async fn upload_full(
    backend: &dyn ObjectBackend,
    db: &MetaDb,
    params: &mut FsParams,
    cachedir: &Path,
) -> FsResult<PageTracker> {
    let image = read_db_image(db).await?;

    for n in (0..METADATA_BAK_COUNT - 1).rev() {
        match backend.rename(&bak_key(n), &bak_key(n + 1)).await {
            Ok(()) | Err(BackendError::NoSuchObject(_)) => {}
            Err(e) => return Err(e.into()),
        }
    }
    match backend.copy(KEY_METADATA, &bak_key(0)).await {
        Ok(()) | Err(BackendError::NoSuchObject(_)) => {}
        Err(e) => return Err(e.into()),
    }

    tracing::info!(bytes = image.len(), "uploading metadata snapshot");
    backend
        .put(KEY_METADATA, bytes::Bytes::from(image.clone()))
        .await?;

    // The snapshot includes everything the deltas carried.
    let stale: Vec<String> = backend.list(METADATA_DELTA_PREFIX).await?;
    backend.delete_multi(&stale).await?;

    params.db_size = image.len() as u64;
    params.db_sha256 = digest_hex(&image);
    params.delta_seq = 0;
    params.store(backend, cachedir).await?;

    Ok(PageTracker::from_image(
        params.metadata_page_size as usize,
        &image,
    ))
}

/// Upload the pages changed since `tracker` was built as one delta object.
/// No-op when nothing changed.
pub async fn upload_delta(
    backend: &dyn ObjectBackend,
    db: &MetaDb,
    params: &mut FsParams,
    cachedir: &Path,
    tracker: &mut PageTracker,
) -> FsResult<bool> {
    let image = read_db_image(db).await?;
    let pages = tracker.changed_pages(&image);
    if pages.is_empty() {
        return Ok(false);
    }

    let delta = MetadataDelta {
        db_size: image.len() as u64,
        pages,
    };
    tracing::info!(
        pages = delta.pages.len(),
        seq = params.delta_seq,
        "uploading metadata delta"
    );
    let buf = to_bytes_in::<_, rkyv::rancor::Error>(&delta, Vec::new())
        .map_err(|e| FsError::Corruption(format!("cannot serialize metadata delta: {e}")))?;
    backend
        .put(&delta_key(params.delta_seq), bytes::Bytes::from(buf))
        .await?;

    params.delta_seq += 1;
    params.db_size = image.len() as u64;
    params.db_sha256 = digest_hex(&image);
    params.store(backend, cachedir).await?;

    *tracker = PageTracker::from_image(params.metadata_page_size as usize, &image);
    Ok(true)
}

/// Download the snapshot, replay all deltas in order and verify the digest
/// from the parameter object. Leaves the database image at `db_path`.
pub async fn download_metadata(
    backend: &dyn ObjectBackend,
    params: &FsParams,
    db_path: &Path,
) -> FsResult<()> {
    // Stale sidecar files from an earlier mount would shadow the fresh image.
    crate::database::remove_db_sidecars(db_path)?;

    tracing::info!("downloading metadata...");
    let image = backend.get(KEY_METADATA).await?;
    let mut fh = std::fs::File::create(db_path)?;
    fh.write_all(&image)?;

    let mut delta_seqs = Vec::new();
    for key in backend.list(METADATA_DELTA_PREFIX).await? {
        match key[METADATA_DELTA_PREFIX.len()..].parse::<u64>() {
            Ok(seq) => delta_seqs.push(seq),
            Err(_) => tracing::warn!(key, "ignoring unparseable metadata delta"),
        }
    }
    delta_seqs.sort_unstable();

    for seq in delta_seqs {
        let buf = backend.get(&delta_key(seq)).await?;
        let delta = rkyv::from_bytes::<MetadataDelta, rkyv::rancor::Error>(&buf)
            .map_err(|e| FsError::Corruption(format!("invalid metadata delta {seq}: {e}")))?;
        for page in &delta.pages {
            fh.seek(SeekFrom::Start(page.pageno * params.metadata_page_size))?;
            fh.write_all(&page.data)?;
        }
        fh.set_len(delta.db_size)?;
    }
    fh.sync_all()?;
    drop(fh);

    let image = std::fs::read(db_path)?;
    if image.len() as u64 != params.db_size {
        return Err(FsError::Corruption(format!(
            "metadata image has {} bytes, expected {}",
            image.len(),
            params.db_size
        )));
    }
    let digest = digest_hex(&image);
    if digest != params.db_sha256 {
        return Err(FsError::Corruption(format!(
            "metadata image has digest {digest}, expected {}",
            params.db_sha256
        )));
    }
    Ok(())
}

/// Periodic incremental uploader, spawned for the lifetime of a mount.
pub async fn uploader_loop(
    backend: Arc<dyn ObjectBackend>,
    db: Arc<MetaDb>,
    cache: Arc<crate::cache::BlockCache>,
    params: Arc<tokio::sync::Mutex<FsParams>>,
    cachedir: std::path::PathBuf,
    interval: std::time::Duration,
    mut tracker: PageTracker,
    mut shutdown: tokio::sync::watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            _ = tokio::time::sleep(interval) => {}
            _ = shutdown.changed() => return,
        }
        if *shutdown.borrow() {
            return;
        }
        // Push out dirty data first so the uploaded metadata references
        // objects that actually exist.
        if let Err(e) = cache.flush_all().await {
            tracing::error!(error = %e, "periodic flush failed");
            continue;
        }
        let mut params = params.lock().await;
        match upload_delta(&*backend, &db, &mut params, &cachedir, &mut tracker).await {
            Ok(true) => tracing::debug!("periodic metadata upload complete"),
            Ok(false) => tracing::debug!("metadata unchanged, nothing to upload"),
            Err(e) => tracing::error!(error = %e, "periodic metadata upload failed"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database::{Connection, init_filesystem_db};
    use s3ql_backends::MemBackend;

    async fn fresh_db(dir: &Path) -> Arc<MetaDb> {
        let path = dir.join("meta.db");
        let mut conn = Connection::open(&path).await.unwrap();
        init_filesystem_db(&mut conn, 0, 0).await.unwrap();
        drop(conn);
        Arc::new(MetaDb::open(&path).await.unwrap())
    }

    #[tokio::test]
    async fn test_snapshot_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let backend = MemBackend::new();
        let db = fresh_db(dir.path()).await;
        let mut params = FsParams::new("t".into(), 65536, false);

        upload_full(&backend, &db, &mut params, dir.path())
            .await
            .unwrap();

        let restored = dir.path().join("restored.db");
        download_metadata(&backend, &params, &restored).await.unwrap();
        assert_eq!(
            std::fs::read(restored).unwrap(),
            std::fs::read(db.path()).unwrap()
        );
    }

    #[tokio::test]
    async fn test_delta_replay() {
        let dir = tempfile::tempdir().unwrap();
        let backend = MemBackend::new();
        let db = fresh_db(dir.path()).await;
        let mut params = FsParams::new("t".into(), 65536, false);

        let mut tracker = upload_full(&backend, &db, &mut params, dir.path())
            .await
            .unwrap();

        // Mutate the database, then ship only the changed pages.
        {
            let mut conn = db.lock().await;
            for i in 0..50 {
                conn.intern_name(format!("name-{i}").as_bytes())
                    .await
                    .unwrap();
            }
        }
        let uploaded = upload_delta(&backend, &db, &mut params, dir.path(), &mut tracker)
            .await
            .unwrap();
        assert!(uploaded);
        assert_eq!(params.delta_seq, 1);

        let restored = dir.path().join("restored.db");
        download_metadata(&backend, &params, &restored).await.unwrap();

        let mut conn = Connection::open(&restored).await.unwrap();
        assert!(conn.name_id(b"name-49").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_unchanged_database_uploads_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let backend = MemBackend::new();
        let db = fresh_db(dir.path()).await;
        let mut params = FsParams::new("t".into(), 65536, false);

        let mut tracker = upload_full(&backend, &db, &mut params, dir.path())
            .await
            .unwrap();
        let uploaded = upload_delta(&backend, &db, &mut params, dir.path(), &mut tracker)
            .await
            .unwrap();
        assert!(!uploaded);
        assert_eq!(params.delta_seq, 0);
    }

    #[tokio::test]
    async fn test_snapshot_rotation() {
        let dir = tempfile::tempdir().unwrap();
        let backend = MemBackend::new();
        let db = fresh_db(dir.path()).await;
        let mut params = FsParams::new("t".into(), 65536, false);

        for _ in 0..3 {
            {
                let mut conn = db.lock().await;
                conn.intern_name(b"churn").await.unwrap();
            }
            upload_full(&backend, &db, &mut params, dir.path())
                .await
                .unwrap();
        }

        let baks = backend.list(METADATA_BAK_PREFIX).await.unwrap();
        assert!(baks.contains(&"s3ql_metadata_bak0".to_string()));
        assert!(baks.contains(&"s3ql_metadata_bak1".to_string()));
    }

    #[tokio::test]
    async fn test_corrupted_download_detected() {
        let dir = tempfile::tempdir().unwrap();
        let backend = MemBackend::new();
        let db = fresh_db(dir.path()).await;
        let mut params = FsParams::new("t".into(), 65536, false);
        upload_full(&backend, &db, &mut params, dir.path())
            .await
            .unwrap();

        let mut raw = backend.get(KEY_METADATA).await.unwrap().to_vec();
        raw[100] ^= 0xff;
        backend.tamper(KEY_METADATA, bytes::Bytes::from(raw));

        let restored = dir.path().join("restored.db");
        assert!(matches!(
            download_metadata(&backend, &params, &restored).await,
            Err(FsError::Corruption(_))
        ));
    }
}
