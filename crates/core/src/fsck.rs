//! Offline consistency check and repair.
//!
//! Walks every invariant of the metadata schema, reconciles the object table
//! against the backend, ingests stray cache entries left behind by a crashed
//! mount, and finishes by uploading a fresh metadata snapshot with the
//! `needs_fsck` flag cleared. When the backend is missing objects the
//! metadata references, the checker first falls back to the newest metadata
//! snapshot whose objects all still exist; files whose data no snapshot can
//! restore are relocated under `/lost+found`.

use sha2::{Digest, Sha256};
use sqlx::Row;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::blocks::data_key;
use crate::config::Config;
use crate::database::{Connection, MetaDb, NewInode, ROOT_INODE, remove_db_sidecars};
use crate::error::{FsError, FsResult};
use crate::metadata::{self, METADATA_BAK_COUNT};
use crate::mount::{compression_from_config, resolve_master_key};
use crate::params::FsParams;
use crate::seq;
use crate::{DATA_PREFIX, KEY_METADATA, METADATA_BAK_PREFIX};
use s3ql_backends::{BackendError, ComprencBackend, ObjectBackend};

#[derive(Debug, Default)]
pub struct FsckReport {
    pub errors_fixed: u64,
    pub data_lost: bool,
}

pub struct FsckOptions {
    /// Download and verify the content digest of every object.
    pub deep: bool,
}

pub async fn fsck(
    config: &Config,
    raw_backend: Arc<dyn ObjectBackend>,
    opts: FsckOptions,
) -> FsResult<FsckReport> {
    let remote = FsParams::fetch(&raw_backend).await?;
    remote.check_revision()?;

    let key = resolve_master_key(&raw_backend, &remote, config.passphrase.as_deref()).await?;
    let backend: Arc<dyn ObjectBackend> = Arc::new(ComprencBackend::new(
        raw_backend.clone(),
        key,
        compression_from_config(config)?,
    ));

    let our_seq = seq::claim_next_seq_no(&raw_backend, config.consistency_delay()).await?;

    std::fs::create_dir_all(&config.cachedir)?;
    let local = FsParams::load_local(&config.cachedir, &remote.uuid)?;
    let local_is_newer = local
        .as_ref()
        .map(|l| l.seq_no >= remote.seq_no)
        .unwrap_or(false);
    let mut params = if local_is_newer {
        local.unwrap()
    } else {
        remote.clone()
    };

    // A crashed mount leaves a stale lock file behind; take the lock over
    // (refusing if a live mount still holds it).
    let lockfile = config.cachedir.join(format!("{}.lock", params.uuid));
    crate::mount::acquire_cachedir_lock(&lockfile)?;

    let db_path = config.cachedir.join(format!("{}.db", params.uuid));
    let used_local = local_is_newer && db_path.exists();
    if used_local {
        tracing::info!("checking with cached metadata (newer than remote copy)");
    } else {
        metadata::download_metadata(&backend, &params, &db_path).await?;
    }

    let recovered = recover_missing_objects(&backend, &remote, &db_path, used_local).await?;

    let db = Arc::new(MetaDb::open(&db_path).await?);
    let mut check = Check {
        db: db.clone(),
        backend: backend.clone(),
        cachedir: config.cachedir.clone(),
        uuid: params.uuid,
        block_size: params.data_block_size,
        report: FsckReport::default(),
    };
    if let Some(snapshot) = recovered {
        // Everything newer than the restored snapshot is gone unless the
        // block cache still holds it.
        check.report.data_lost = true;
        check.fixed(&format!("metadata restored from {snapshot}"));
    }

    check.ensure_lost_found().await?;
    check.ingest_cache_leftovers().await?;
    check.check_contents().await?;
    check.check_name_refcounts().await?;
    check.check_unreachable().await?;
    check.check_inode_refcounts().await?;
    check.check_inode_blocks().await?;
    check.check_lost_blocks().await?;
    check.check_block_refcounts().await?;
    check.check_object_refcounts().await?;
    check.check_backend_objects().await?;
    check.check_file_sizes().await?;
    if opts.deep {
        check.deep_verify().await?;
    }
    check.drain_deletions().await?;

    let report = check.report;
    if report.errors_fixed > 0 {
        tracing::warn!(count = report.errors_fixed, "fsck repaired inconsistencies");
    } else {
        tracing::info!("file system is consistent");
    }

    params.seq_no = our_seq;
    params.needs_fsck = false;
    metadata::upload_full(&backend, &db, &mut params, &config.cachedir).await?;

    std::fs::remove_file(&lockfile)?;
    Ok(report)
}

/// Objects with a recorded upload that the backend cannot produce. Listings
/// may lag behind writes, so every candidate is double-checked with a point
/// lookup before it counts as missing.
async fn missing_objects(
    conn: &mut Connection,
    backend: &dyn ObjectBackend,
) -> FsResult<Vec<i64>> {
    let mut present = std::collections::HashSet::new();
    for key in backend.list(DATA_PREFIX).await? {
        if let Ok(id) = key[DATA_PREFIX.len()..].parse::<i64>() {
            present.insert(id);
        }
    }
    let known: Vec<i64> = sqlx::query("SELECT id FROM objects WHERE phys_size >= 0")
        .fetch_all(conn.raw())
        .await?
        .into_iter()
        .map(|r| r.get(0))
        .collect();
    let mut missing = Vec::new();
    for obj_id in known {
        if present.contains(&obj_id) {
            continue;
        }
        if backend.contains(&data_key(obj_id)).await? {
            continue;
        }
        missing.push(obj_id);
    }
    Ok(missing)
}

async fn probe_missing(path: &Path, backend: &dyn ObjectBackend) -> FsResult<usize> {
    let mut conn = Connection::open(path).await?;
    let missing = missing_objects(&mut conn, backend).await?;
    conn.checkpoint().await?;
    Ok(missing.len())
}

/// Objects the metadata records as uploaded but the backend cannot produce
/// mean the database has outlived its data. Walk the snapshot chain, newest
/// first, and continue from the most recent copy whose object inventory is
/// intact; anything written after it survives only where the block cache
/// still holds it. Returns a description of the snapshot used, if any.
async fn recover_missing_objects(
    backend: &Arc<dyn ObjectBackend>,
    remote: &FsParams,
    db_path: &Path,
    try_current: bool,
) -> FsResult<Option<String>> {
    let missing = {
        let mut conn = Connection::open(db_path).await?;
        missing_objects(&mut conn, backend.as_ref()).await?
    };
    if missing.is_empty() {
        return Ok(None);
    }
    tracing::warn!(
        count = missing.len(),
        "backend is missing objects the metadata references; \
         looking for a snapshot that still has all of its data"
    );

    let probe_path = db_path.with_extension("fsck-probe.db");
    let mut chosen: Option<String> = None;

    if try_current
        && metadata::download_metadata(backend.as_ref(), remote, &probe_path)
            .await
            .is_ok()
        && matches!(probe_missing(&probe_path, backend.as_ref()).await, Ok(0))
    {
        chosen = Some("the last uploaded metadata".to_string());
    }

    if chosen.is_none() {
        let mut keys = vec![KEY_METADATA.to_string()];
        keys.extend((0..METADATA_BAK_COUNT).map(|n| format!("{METADATA_BAK_PREFIX}{n}")));
        for key in keys {
            let image = match backend.get(&key).await {
                Ok(buf) => buf,
                Err(BackendError::NoSuchObject(_)) => continue,
                Err(e) => return Err(e.into()),
            };
            remove_db_sidecars(&probe_path)?;
            std::fs::write(&probe_path, &image)?;
            match probe_missing(&probe_path, backend.as_ref()).await {
                Ok(0) => {
                    chosen = Some(format!("snapshot {key}"));
                    break;
                }
                Ok(n) => {
                    tracing::warn!(
                        snapshot = %key,
                        still_missing = n,
                        "snapshot also references lost objects"
                    );
                }
                Err(e) => {
                    tracing::warn!(snapshot = %key, error = %e, "snapshot is unusable");
                }
            }
        }
    }

    match &chosen {
        Some(snapshot) => {
            remove_db_sidecars(db_path)?;
            std::fs::rename(&probe_path, db_path)?;
            tracing::warn!(snapshot = %snapshot, "recovered metadata from snapshot");
        }
        None => {
            tracing::error!(
                "no metadata snapshot covers the lost objects; \
                 affected files will be moved to /lost+found"
            );
            match std::fs::remove_file(&probe_path) {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(e.into()),
            }
        }
    }
    remove_db_sidecars(&probe_path)?;
    Ok(chosen)
}

struct Check {
    db: Arc<MetaDb>,
    backend: Arc<dyn ObjectBackend>,
    cachedir: PathBuf,
    uuid: uuid::Uuid,
    block_size: u64,
    report: FsckReport,
}

impl Check {
    fn fixed(&mut self, what: &str) {
        self.report.errors_fixed += 1;
        tracing::warn!("fsck: {what}");
    }

    async fn lost_found(&self, conn: &mut Connection) -> FsResult<i64> {
        match conn.lookup_entry(ROOT_INODE, b"lost+found").await? {
            Some(ino) => Ok(ino),
            None => {
                let ino = conn
                    .create_inode(NewInode {
                        mode: libc::S_IFDIR | 0o700,
                        uid: 0,
                        gid: 0,
                        rdev: 0,
                        refcount: 1,
                        size: 0,
                    })
                    .await?;
                let name_id = conn.intern_name(b"lost+found").await?;
                conn.insert_entry(ROOT_INODE, name_id, ino).await?;
                Ok(ino)
            }
        }
    }

    /// Detach an inode from every directory entry referencing it and relink
    /// it as a single entry under /lost+found, so the user can see what fsck
    /// touched.
    async fn move_to_lost_found(&mut self, conn: &mut Connection, inode: i64) -> FsResult<()> {
        if inode == ROOT_INODE {
            return Ok(());
        }
        let lf = self.lost_found(conn).await?;
        if inode == lf {
            return Ok(());
        }

        let rows = sqlx::query("SELECT name_id FROM contents WHERE inode=?")
            .bind(inode)
            .fetch_all(conn.raw())
            .await?;
        for row in rows {
            let name_id: i64 = row.get(0);
            conn.release_name(name_id).await?;
        }
        sqlx::query("DELETE FROM contents WHERE inode=?")
            .bind(inode)
            .execute(conn.raw())
            .await?;

        let mut name = format!("inode-{inode}");
        let mut suffix = 0;
        while conn.lookup_entry(lf, name.as_bytes()).await?.is_some() {
            suffix += 1;
            name = format!("inode-{inode}-{suffix}");
        }
        let name_id = conn.intern_name(name.as_bytes()).await?;
        conn.insert_entry(lf, name_id, inode).await?;

        if let Some(row) = conn.get_inode(inode).await?
            && !row.is_dir()
        {
            sqlx::query("UPDATE inodes SET refcount=1 WHERE id=?")
                .bind(inode)
                .execute(conn.raw())
                .await?;
        }
        Ok(())
    }

    async fn ensure_lost_found(&mut self) -> FsResult<()> {
        let db = self.db.clone();
        let mut conn = db.lock().await;
        if conn.lookup_entry(ROOT_INODE, b"lost+found").await?.is_none() {
            self.lost_found(&mut conn).await?;
            self.fixed("recreated /lost+found");
        }
        Ok(())
    }

    /// Blocks that were dirty in the cache when the mount died carry data
    /// that may not exist anywhere else: register and upload them.
    async fn ingest_cache_leftovers(&mut self) -> FsResult<()> {
        let cache_dir = self.cachedir.join(format!("{}-cache", self.uuid));
        if !cache_dir.is_dir() {
            return Ok(());
        }
        let mut entries = std::fs::read_dir(&cache_dir)?
            .collect::<Result<Vec<_>, _>>()?;
        entries.sort_by_key(|e| e.file_name());

        for entry in entries {
            let name = entry.file_name();
            let Some(name) = name.to_str() else { continue };
            let Some((inode_s, blockno_s)) = name.split_once('-') else {
                continue;
            };
            let (Ok(inode), Ok(blockno)) = (inode_s.parse::<i64>(), blockno_s.parse::<i64>())
            else {
                continue;
            };

            let content = std::fs::read(entry.path())?;
            let hash: [u8; 32] = Sha256::digest(&content).into();
            let size = content.len() as i64;

            let db = self.db.clone();
            let upload = {
                let mut conn = db.lock().await;
                if conn.get_inode(inode).await?.is_none() {
                    std::fs::remove_file(entry.path())?;
                    self.fixed(&format!("dropped cache entry of deleted inode {inode}"));
                    continue;
                }
                let old_block = conn.get_block_of(inode, blockno).await?;
                match conn.find_block_by_hash(&hash).await? {
                    Some(block_id) if old_block == Some(block_id) => None,
                    Some(block_id) => {
                        conn.adjust_block_refcount(block_id, 1).await?;
                        conn.link_block(inode, blockno, block_id).await?;
                        self.fixed(&format!(
                            "relinked cache entry {inode}-{blockno} to block {block_id}"
                        ));
                        None
                    }
                    None => {
                        let obj_id = conn.create_object(&hash, size).await?;
                        let block_id = conn.create_block(&hash, size, obj_id).await?;
                        conn.link_block(inode, blockno, block_id).await?;
                        self.fixed(&format!(
                            "recovered cache entry {inode}-{blockno} as object {obj_id}"
                        ));
                        Some(obj_id)
                    }
                }
            };

            if let Some(obj_id) = upload {
                let phys = self
                    .backend
                    .put(&data_key(obj_id), bytes::Bytes::from(content))
                    .await?;
                let mut conn = db.lock().await;
                conn.set_object_phys_size(obj_id, phys as i64).await?;
            }
            std::fs::remove_file(entry.path())?;
        }
        Ok(())
    }

    /// Directory entries must reference existing inodes on both ends.
    async fn check_contents(&mut self) -> FsResult<()> {
        let db = self.db.clone();
        let mut conn = db.lock().await;
        let rows = sqlx::query(
            "SELECT c.rowid FROM contents c \
             LEFT JOIN inodes i ON i.id = c.inode \
             LEFT JOIN inodes p ON p.id = c.parent_inode \
             WHERE i.id IS NULL OR p.id IS NULL",
        )
        .fetch_all(conn.raw())
        .await?;
        for row in rows {
            let rowid: i64 = row.get(0);
            sqlx::query("DELETE FROM contents WHERE rowid=?")
                .bind(rowid)
                .execute(conn.raw())
                .await?;
            self.fixed(&format!("dropped dangling directory entry {rowid}"));
        }
        Ok(())
    }

    async fn check_name_refcounts(&mut self) -> FsResult<()> {
        let db = self.db.clone();
        let mut conn = db.lock().await;
        let rows = sqlx::query(
            "SELECT id, refcount, actual FROM ( \
               SELECT n.id AS id, n.refcount AS refcount, \
                 (SELECT COUNT(*) FROM contents c WHERE c.name_id = n.id) + \
                 (SELECT COUNT(*) FROM ext_attributes x WHERE x.name_id = n.id) AS actual \
               FROM names n) WHERE refcount != actual",
        )
        .fetch_all(conn.raw())
        .await?;
        for row in rows {
            let id: i64 = row.get(0);
            let actual: i64 = row.get(2);
            if actual == 0 {
                sqlx::query("DELETE FROM names WHERE id=?")
                    .bind(id)
                    .execute(conn.raw())
                    .await?;
            } else {
                sqlx::query("UPDATE names SET refcount=? WHERE id=?")
                    .bind(actual)
                    .bind(id)
                    .execute(conn.raw())
                    .await?;
            }
            self.fixed(&format!("corrected refcount of name {id}"));
        }
        Ok(())
    }

    /// Inodes not reachable from the root are linked into /lost+found.
    async fn check_unreachable(&mut self) -> FsResult<()> {
        let db = self.db.clone();
        let mut conn = db.lock().await;

        let mut reachable = std::collections::HashSet::from([ROOT_INODE]);
        let mut frontier = vec![ROOT_INODE];
        while let Some(dir) = frontier.pop() {
            let rows = sqlx::query("SELECT inode FROM contents WHERE parent_inode=?")
                .bind(dir)
                .fetch_all(conn.raw())
                .await?;
            for row in rows {
                let child: i64 = row.get(0);
                if reachable.insert(child) {
                    frontier.push(child);
                }
            }
        }

        let all: Vec<i64> = sqlx::query("SELECT id FROM inodes")
            .fetch_all(conn.raw())
            .await?
            .into_iter()
            .map(|r| r.get(0))
            .collect();

        for inode in all {
            if reachable.contains(&inode) {
                continue;
            }
            self.move_to_lost_found(&mut conn, inode).await?;
            self.fixed(&format!("moved unreachable inode {inode} to /lost+found"));
        }
        Ok(())
    }

    async fn check_inode_refcounts(&mut self) -> FsResult<()> {
        let db = self.db.clone();
        let mut conn = db.lock().await;
        let rows = sqlx::query(
            "SELECT i.id, i.refcount, i.mode, \
               (SELECT COUNT(*) FROM contents c WHERE c.inode = i.id) AS links \
             FROM inodes i",
        )
        .fetch_all(conn.raw())
        .await?;
        for row in rows {
            let id: i64 = row.get(0);
            let refcount: i64 = row.get(1);
            let mode: u32 = row.get(2);
            let links: i64 = row.get(3);
            let expected = if mode & libc::S_IFMT == libc::S_IFDIR {
                1
            } else if id == ROOT_INODE {
                1
            } else {
                links
            };
            if refcount != expected {
                sqlx::query("UPDATE inodes SET refcount=? WHERE id=?")
                    .bind(expected)
                    .bind(id)
                    .execute(conn.raw())
                    .await?;
                self.fixed(&format!(
                    "corrected refcount of inode {id} ({refcount} -> {expected})"
                ));
            }
        }
        Ok(())
    }

    /// Mapping rows must reference existing blocks.
    async fn check_inode_blocks(&mut self) -> FsResult<()> {
        let db = self.db.clone();
        let mut conn = db.lock().await;
        let rows = sqlx::query(
            "SELECT ib.inode, ib.blockno FROM inode_blocks ib \
             LEFT JOIN blocks b ON b.id = ib.block_id WHERE b.id IS NULL",
        )
        .fetch_all(conn.raw())
        .await?;
        for row in rows {
            let inode: i64 = row.get(0);
            let blockno: i64 = row.get(1);
            conn.unlink_block(inode, blockno).await?;
            self.report.data_lost = true;
            self.fixed(&format!(
                "dropped mapping of inode {inode} block {blockno} to a missing block"
            ));
        }
        Ok(())
    }

    /// Blocks whose upload never completed (NULL hash) hold no data anywhere.
    /// The owning files are damaged and go to /lost+found.
    async fn check_lost_blocks(&mut self) -> FsResult<()> {
        let db = self.db.clone();
        let mut conn = db.lock().await;
        let rows = sqlx::query("SELECT id FROM blocks WHERE hash IS NULL")
            .fetch_all(conn.raw())
            .await?;
        for row in rows {
            let block_id: i64 = row.get(0);
            let affected: Vec<i64> =
                sqlx::query("SELECT DISTINCT inode FROM inode_blocks WHERE block_id=?")
                    .bind(block_id)
                    .fetch_all(conn.raw())
                    .await?
                    .into_iter()
                    .map(|r| r.get(0))
                    .collect();
            sqlx::query("DELETE FROM inode_blocks WHERE block_id=?")
                .bind(block_id)
                .execute(conn.raw())
                .await?;
            sqlx::query("DELETE FROM blocks WHERE id=?")
                .bind(block_id)
                .execute(conn.raw())
                .await?;
            for inode in affected {
                self.move_to_lost_found(&mut conn, inode).await?;
            }
            self.report.data_lost = true;
            self.fixed(&format!(
                "discarded block {block_id} whose upload never finished; \
                 owning files moved to /lost+found"
            ));
        }
        Ok(())
    }

    async fn check_block_refcounts(&mut self) -> FsResult<()> {
        let db = self.db.clone();
        let mut conn = db.lock().await;
        let rows = sqlx::query(
            "SELECT id, refcount, actual FROM ( \
               SELECT b.id AS id, b.refcount AS refcount, \
                 (SELECT COUNT(*) FROM inode_blocks ib WHERE ib.block_id = b.id) AS actual \
               FROM blocks b) WHERE refcount != actual",
        )
        .fetch_all(conn.raw())
        .await?;
        for row in rows {
            let id: i64 = row.get(0);
            let actual: i64 = row.get(2);
            if actual == 0 {
                sqlx::query("DELETE FROM blocks WHERE id=?")
                    .bind(id)
                    .execute(conn.raw())
                    .await?;
            } else {
                sqlx::query("UPDATE blocks SET refcount=? WHERE id=?")
                    .bind(actual)
                    .bind(id)
                    .execute(conn.raw())
                    .await?;
            }
            self.fixed(&format!("corrected refcount of block {id}"));
        }
        Ok(())
    }

    async fn check_object_refcounts(&mut self) -> FsResult<()> {
        let db = self.db.clone();
        let mut conn = db.lock().await;
        let rows = sqlx::query(
            "SELECT id, refcount, actual FROM ( \
               SELECT o.id AS id, o.refcount AS refcount, \
                 (SELECT COUNT(*) FROM blocks b WHERE b.obj_id = o.id) AS actual \
               FROM objects o) WHERE refcount != actual",
        )
        .fetch_all(conn.raw())
        .await?;
        for row in rows {
            let id: i64 = row.get(0);
            let actual: i64 = row.get(2);
            if actual == 0 {
                conn.delete_object_row(id).await?;
                conn.queue_object_deletion(id).await?;
            } else {
                sqlx::query("UPDATE objects SET refcount=? WHERE id=?")
                    .bind(actual)
                    .bind(id)
                    .execute(conn.raw())
                    .await?;
            }
            self.fixed(&format!("corrected refcount of object {id}"));
        }
        Ok(())
    }

    /// Reconcile the objects table against what the backend actually has.
    async fn check_backend_objects(&mut self) -> FsResult<()> {
        let listed = self.backend.list(DATA_PREFIX).await?;
        let mut present = std::collections::HashSet::new();
        for key in &listed {
            if let Ok(id) = key[DATA_PREFIX.len()..].parse::<i64>() {
                present.insert(id);
            } else {
                tracing::warn!(key, "unexpected object in backend, ignoring");
            }
        }

        let db = self.db.clone();
        let (known, queued): (Vec<i64>, Vec<i64>) = {
            let mut conn = db.lock().await;
            let known = sqlx::query("SELECT id FROM objects WHERE phys_size >= 0")
                .fetch_all(conn.raw())
                .await?
                .into_iter()
                .map(|r| r.get(0))
                .collect();
            let queued = sqlx::query("SELECT obj_id FROM objects_to_delete")
                .fetch_all(conn.raw())
                .await?
                .into_iter()
                .map(|r| r.get(0))
                .collect();
            (known, queued)
        };

        // Orphans: on the backend but referenced by nothing. Listings may
        // trail reality, so double-check before touching anything.
        let known_set: std::collections::HashSet<i64> = known.iter().copied().collect();
        for &obj_id in present.iter() {
            if known_set.contains(&obj_id) || queued.contains(&obj_id) {
                continue;
            }
            match self.backend.delete(&data_key(obj_id)).await {
                Ok(()) | Err(BackendError::NoSuchObject(_)) => {
                    self.fixed(&format!("deleted orphan backend object {obj_id}"));
                }
                Err(e) => return Err(e.into()),
            }
        }

        // Objects no snapshot could restore: the referencing blocks are gone
        // for good, and the damaged files go to /lost+found.
        for obj_id in known {
            if present.contains(&obj_id) {
                continue;
            }
            if self.backend.contains(&data_key(obj_id)).await? {
                continue; // listing lagged behind
            }
            let mut conn = db.lock().await;
            let affected: Vec<i64> = sqlx::query(
                "SELECT DISTINCT inode FROM inode_blocks WHERE block_id IN \
                 (SELECT id FROM blocks WHERE obj_id=?)",
            )
            .bind(obj_id)
            .fetch_all(conn.raw())
            .await?
            .into_iter()
            .map(|r| r.get(0))
            .collect();
            sqlx::query(
                "DELETE FROM inode_blocks WHERE block_id IN \
                 (SELECT id FROM blocks WHERE obj_id=?)",
            )
            .bind(obj_id)
            .execute(conn.raw())
            .await?;
            sqlx::query("DELETE FROM blocks WHERE obj_id=?")
                .bind(obj_id)
                .execute(conn.raw())
                .await?;
            conn.delete_object_row(obj_id).await?;
            for inode in affected {
                self.move_to_lost_found(&mut conn, inode).await?;
            }
            drop(conn);
            self.report.data_lost = true;
            self.fixed(&format!(
                "backend lost object {obj_id}; affected files moved to /lost+found"
            ));
        }
        Ok(())
    }

    /// A file must be at least as long as its highest mapped block requires;
    /// holes may make it longer, never shorter.
    async fn check_file_sizes(&mut self) -> FsResult<()> {
        let bs = self.block_size as i64;
        let db = self.db.clone();
        let mut conn = db.lock().await;
        let rows = sqlx::query(
            "SELECT i.id, i.size, m.maxno, b.size FROM inodes i \
             JOIN (SELECT inode, MAX(blockno) AS maxno FROM inode_blocks GROUP BY inode) m \
               ON m.inode = i.id \
             JOIN inode_blocks ib ON ib.inode = i.id AND ib.blockno = m.maxno \
             JOIN blocks b ON b.id = ib.block_id",
        )
        .fetch_all(conn.raw())
        .await?;
        for row in rows {
            let inode: i64 = row.get(0);
            let size: i64 = row.get(1);
            let maxno: i64 = row.get(2);
            let last_len: i64 = row.get(3);
            let min_size = maxno * bs + last_len;
            if size < min_size {
                sqlx::query("UPDATE inodes SET size=? WHERE id=?")
                    .bind(min_size)
                    .bind(inode)
                    .execute(conn.raw())
                    .await?;
                self.fixed(&format!(
                    "grew size of inode {inode} to cover its last block ({size} -> {min_size})"
                ));
            }
        }
        Ok(())
    }

    /// Download every object and verify its content digest.
    async fn deep_verify(&mut self) -> FsResult<()> {
        let ids: Vec<(i64, Option<Vec<u8>>)> = {
            let mut conn = self.db.lock().await;
            sqlx::query("SELECT id, hash FROM objects WHERE phys_size >= 0")
                .fetch_all(conn.raw())
                .await?
                .into_iter()
                .map(|r| (r.get(0), r.get(1)))
                .collect()
        };
        for (obj_id, hash) in ids {
            let payload = self.backend.get(&data_key(obj_id)).await?;
            if let Some(hash) = hash {
                let digest = Sha256::digest(&payload);
                if digest.as_slice() != hash.as_slice() {
                    return Err(FsError::Corruption(format!(
                        "object {obj_id} content does not match its recorded digest"
                    )));
                }
            }
        }
        tracing::info!("deep verification passed");
        Ok(())
    }

    async fn drain_deletions(&mut self) -> FsResult<()> {
        loop {
            let ids = {
                let mut conn = self.db.lock().await;
                conn.pop_object_deletions(128).await?
            };
            if ids.is_empty() {
                return Ok(());
            }
            let keys: Vec<String> = ids.iter().map(|id| data_key(*id)).collect();
            self.backend.delete_multi(&keys).await?;
        }
    }
}
