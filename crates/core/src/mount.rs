//! Mount lifecycle.
//!
//! A mount moves through three phases: init (parameter checks, sequence
//! number handshake, metadata download), active (serve operations, periodic
//! metadata deltas, background removals), and shutdown (drain uploads, final
//! snapshot, release the cache directory).
//!
//! No ambient globals: everything a layer needs is passed in explicitly and
//! owned by [`MountedFs`].

use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::watch;

use crate::blocks::BlockManager;
use crate::cache::BlockCache;
use crate::config::Config;
use crate::database::MetaDb;
use crate::error::{FsError, FsResult};
use crate::fs::S3qlFs;
use crate::metadata::{self, PageTracker};
use crate::params::FsParams;
use crate::seq;
use crate::KEY_PASSPHRASE;
use s3ql_backends::{
    BackendError, Compression, ComprencBackend, MasterKey, ObjectBackend, unwrap_master_key,
};

pub struct MountedFs {
    pub fs: Arc<S3qlFs>,
    pub db: Arc<MetaDb>,
    pub cache: Arc<BlockCache>,
    pub blocks: Arc<BlockManager>,
    /// Codec-wrapped backend for data and metadata objects.
    pub backend: Arc<dyn ObjectBackend>,
    pub raw_backend: Arc<dyn ObjectBackend>,
    pub params: Arc<tokio::sync::Mutex<FsParams>>,
    cachedir: PathBuf,
    lockfile: PathBuf,
    shutdown_tx: watch::Sender<bool>,
    tasks: Vec<tokio::task::JoinHandle<()>>,
}

/// Resolve the master key for an encrypted filesystem.
pub async fn resolve_master_key(
    raw_backend: &dyn ObjectBackend,
    params: &FsParams,
    passphrase: Option<&str>,
) -> FsResult<Option<MasterKey>> {
    if !params.encrypted {
        return Ok(None);
    }
    let Some(passphrase) = passphrase else {
        return Err(FsError::Auth(
            "file system is encrypted but no passphrase was supplied".into(),
        ));
    };
    let wrapped = match raw_backend.get(KEY_PASSPHRASE).await {
        Ok(buf) => buf,
        Err(BackendError::NoSuchObject(_)) => {
            return Err(FsError::Corruption("master key object is missing".into()));
        }
        Err(e) => return Err(e.into()),
    };
    Ok(Some(unwrap_master_key(passphrase.as_bytes(), &wrapped)?))
}

pub fn compression_from_config(config: &Config) -> FsResult<Compression> {
    Ok(Compression::from_name(
        &config.compression_algorithm,
        config.compression_level,
    )?)
}

/// Take the cache-directory lock. A lock file belonging to a live process
/// means the cache is in use; one left behind by a dead process is removed
/// (the parameter check will then demand fsck).
pub(crate) fn acquire_cachedir_lock(lockfile: &std::path::Path) -> FsResult<()> {
    loop {
        match std::fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(lockfile)
        {
            Ok(mut fh) => {
                use std::io::Write;
                write!(fh, "{}", std::process::id())?;
                return Ok(());
            }
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
                let owner: Option<u32> = std::fs::read_to_string(lockfile)
                    .ok()
                    .and_then(|s| s.trim().parse().ok());
                if let Some(pid) = owner
                    && std::path::Path::new(&format!("/proc/{pid}")).exists()
                {
                    return Err(FsError::CacheInUse(format!(
                        "cache directory is locked by running process {pid}"
                    )));
                }
                tracing::warn!(
                    lockfile = %lockfile.display(),
                    "removing lock file of dead process"
                );
                std::fs::remove_file(lockfile)?;
            }
            Err(e) => return Err(e.into()),
        }
    }
}

impl MountedFs {
    /// Bring up the filesystem: verify parameters, claim the next sequence
    /// number, obtain current metadata and start the background tasks.
    pub async fn init(config: &Config, raw_backend: Arc<dyn ObjectBackend>) -> FsResult<Self> {
        let remote = FsParams::fetch(&raw_backend).await?;
        remote.check_revision()?;
        config.validate(remote.data_block_size)?;

        std::fs::create_dir_all(&config.cachedir)?;
        let lockfile = config.cachedir.join(format!("{}.lock", remote.uuid));
        acquire_cachedir_lock(&lockfile)?;

        match Self::init_locked(config, raw_backend, remote).await {
            Ok(mut mounted) => {
                mounted.lockfile = lockfile;
                Ok(mounted)
            }
            Err(e) => {
                let _ = std::fs::remove_file(&lockfile);
                Err(e)
            }
        }
    }

    async fn init_locked(
        config: &Config,
        raw_backend: Arc<dyn ObjectBackend>,
        remote: FsParams,
    ) -> FsResult<Self> {
        let key =
            resolve_master_key(&raw_backend, &remote, config.passphrase.as_deref()).await?;
        let compression = compression_from_config(config)?;
        let backend: Arc<dyn ObjectBackend> = Arc::new(ComprencBackend::new(
            raw_backend.clone(),
            key,
            compression,
        ));

        let our_seq = seq::claim_next_seq_no(&raw_backend, config.consistency_delay()).await?;
        match Self::init_claimed(config, raw_backend.clone(), backend, remote, our_seq).await {
            Ok(mounted) => Ok(mounted),
            Err(e) => {
                let _ = seq::release_seq_no(&raw_backend, our_seq).await;
                Err(e)
            }
        }
    }

    async fn init_claimed(
        config: &Config,
        raw_backend: Arc<dyn ObjectBackend>,
        backend: Arc<dyn ObjectBackend>,
        remote: FsParams,
        our_seq: u64,
    ) -> FsResult<Self> {
        // A crashed mount leaves its mark in whichever params copy is newer:
        // either the sequence trail has a gap, or needs_fsck is still set.
        let local = FsParams::load_local(&config.cachedir, &remote.uuid)?;
        let local_is_newer = local
            .as_ref()
            .map(|l| l.seq_no >= remote.seq_no)
            .unwrap_or(false);
        let mut params = if local_is_newer {
            local.unwrap()
        } else {
            remote
        };
        if params.needs_fsck {
            tracing::error!("file system was not unmounted cleanly");
            return Err(FsError::NotClean);
        }
        if params.seq_no + 1 != our_seq {
            // Someone else holds sequence markers beyond the last clean
            // unmount we know about: either a live mount elsewhere, or a
            // crash on a machine whose cache we cannot see.
            tracing::error!(
                params_seq = params.seq_no,
                claimed_seq = our_seq,
                "file system is mounted elsewhere or was not unmounted cleanly"
            );
            return Err(FsError::AlreadyMounted);
        }

        let db_path = config.cachedir.join(format!("{}.db", params.uuid));
        if local_is_newer && db_path.exists() {
            tracing::info!("using cached metadata");
        } else {
            metadata::download_metadata(&backend, &params, &db_path).await?;
        }

        // Record locally that this mount is live; the remote copy keeps the
        // last clean state until unmount.
        params.seq_no = our_seq;
        params.needs_fsck = true;
        params.store_local(&config.cachedir)?;

        let db = Arc::new(MetaDb::open(&db_path).await?);
        let blocks = Arc::new(BlockManager::new(db.clone(), backend.clone()));
        let cache_dir = config.cachedir.join(format!("{}-cache", params.uuid));
        let cache = BlockCache::new(
            cache_dir,
            config.max_cache_size,
            config.max_cache_entries,
            config.upload_threads,
            db.clone(),
            blocks.clone(),
            backend.clone(),
        )
        .await?;
        let fs = S3qlFs::new(
            db.clone(),
            cache.clone(),
            blocks.clone(),
            params.data_block_size,
        );

        let tracker = PageTracker::from_image(
            params.metadata_page_size as usize,
            &metadata::read_db_image(&db).await?,
        );
        let params = Arc::new(tokio::sync::Mutex::new(params));

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let mut tasks = Vec::new();
        tasks.push(tokio::spawn(blocks.clone().removal_loop()));
        tasks.push(tokio::spawn(metadata::uploader_loop(
            backend.clone(),
            db.clone(),
            cache.clone(),
            params.clone(),
            config.cachedir.clone(),
            config.metadata_upload_interval(),
            tracker,
            shutdown_rx,
        )));

        Ok(Self {
            fs,
            db,
            cache,
            blocks,
            backend,
            raw_backend,
            params,
            cachedir: config.cachedir.clone(),
            lockfile: PathBuf::new(),
            shutdown_tx,
            tasks,
        })
    }

    /// Tear everything down the way a crash would: no flush, no final
    /// snapshot. The next mount will demand fsck. Only the lock file is
    /// released, since an in-process "crash" keeps the pid alive.
    pub async fn abort(mut self) {
        let _ = self.shutdown_tx.send(true);
        self.blocks.request_shutdown();
        self.cache.abort_workers();
        for task in self.tasks.drain(..) {
            task.abort();
            let _ = task.await;
        }
        let _ = std::fs::remove_file(&self.lockfile);
    }

    /// Clean unmount: flush all dirty state, stop the workers, write the
    /// final metadata snapshot and release the cache directory.
    pub async fn shutdown(mut self) -> FsResult<()> {
        tracing::info!("unmounting file system...");
        self.fs.begin_shutdown();

        let flush_result = self.cache.shutdown(true).await;
        if let Err(e) = &flush_result {
            tracing::error!(error = %e, "could not flush all dirty blocks");
        }

        let _ = self.shutdown_tx.send(true);
        self.blocks.request_shutdown();
        for task in self.tasks.drain(..) {
            let _ = task.await;
        }
        let drain_result = self.blocks.drain_removals().await;
        if let Err(e) = &drain_result {
            tracing::warn!(error = %e, "deferred removals left in queue");
        }

        {
            let mut params = self.params.lock().await;
            // A failed flush leaves data only in the local cache; force the
            // next mount through fsck rather than pretend it never existed.
            params.needs_fsck = flush_result.is_err();
            metadata::upload_full(&self.backend, &self.db, &mut params, &self.cachedir).await?;
        }

        std::fs::remove_file(&self.lockfile)?;
        self.backend.close().await?;
        flush_result?;
        drain_result?;
        tracing::info!("file system unmounted cleanly");
        Ok(())
    }
}
