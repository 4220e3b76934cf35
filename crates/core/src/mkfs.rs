//! File system creation.

use std::sync::Arc;

use crate::config::{Config, check_block_size};
use crate::database::{Connection, MetaDb, init_filesystem_db, remove_db_sidecars};
use crate::error::{FsError, FsResult};
use crate::metadata;
use crate::mount::compression_from_config;
use crate::params::FsParams;
use crate::seq;
use crate::{KEY_PARAMS, KEY_PASSPHRASE};
use s3ql_backends::{
    BackendError, ComprencBackend, MasterKey, ObjectBackend, wrap_master_key,
};

pub struct MkfsOptions {
    pub label: String,
    pub data_block_size: u64,
    pub force: bool,
}

/// Create a new file system at the backend: wrapped master key, empty
/// metadata database, initial snapshot and sequence marker zero.
pub async fn mkfs(
    config: &Config,
    raw_backend: Arc<dyn ObjectBackend>,
    opts: MkfsOptions,
) -> FsResult<FsParams> {
    check_block_size(opts.data_block_size)?;
    config.validate(opts.data_block_size)?;

    match raw_backend.contains(KEY_PARAMS).await {
        Ok(true) if !opts.force => {
            return Err(FsError::Exists);
        }
        Ok(_) => {}
        Err(e) => return Err(e.into()),
    }

    let key = match config.passphrase.as_deref() {
        Some(passphrase) => {
            let master = MasterKey::generate();
            let wrapped = wrap_master_key(passphrase.as_bytes(), &master)?;
            raw_backend.put(KEY_PASSPHRASE, wrapped).await?;
            Some(master)
        }
        None => {
            match raw_backend.delete(KEY_PASSPHRASE).await {
                Ok(()) | Err(BackendError::NoSuchObject(_)) => {}
                Err(e) => return Err(e.into()),
            }
            None
        }
    };

    let mut params = FsParams::new(opts.label, opts.data_block_size, key.is_some());
    tracing::info!(uuid = %params.uuid, "creating file system");

    std::fs::create_dir_all(&config.cachedir)?;
    let db_path = config.cachedir.join(format!("{}.db", params.uuid));
    match std::fs::remove_file(&db_path) {
        Ok(()) => {}
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => return Err(e.into()),
    }
    remove_db_sidecars(&db_path)?;

    let mut conn = Connection::open(&db_path).await?;
    init_filesystem_db(&mut conn, unsafe { libc::getuid() }, unsafe {
        libc::getgid()
    })
    .await?;
    drop(conn);
    let db = MetaDb::open(&db_path).await?;

    let backend = ComprencBackend::new(
        raw_backend.clone(),
        key,
        compression_from_config(config)?,
    );
    metadata::upload_full(&backend, &db, &mut params, &config.cachedir).await?;
    seq::write_initial_seq_no(&raw_backend).await?;

    tracing::info!(uuid = %params.uuid, "file system created");
    Ok(params)
}
