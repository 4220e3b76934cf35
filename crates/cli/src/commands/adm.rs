use clap::Subcommand;
use std::path::PathBuf;

use s3ql_core::mount::resolve_master_key;
use s3ql_core::params::FsParams;
use s3ql_core::{Config, FsError, FsResult, KEY_PASSPHRASE, metadata};
use s3ql_backends::{Compression, ComprencBackend, wrap_master_key};

#[derive(Subcommand)]
pub enum AdmCommand {
    /// Change the passphrase protecting the master key
    Passphrase {
        storage_url: String,
        #[arg(long = "new", env = "S3QL_NEW_PASSPHRASE", help = "New passphrase")]
        new_passphrase: String,
    },
    /// Delete all file system objects at the storage location
    Clear {
        storage_url: String,
        #[arg(long, help = "Required to confirm the deletion")]
        force: bool,
    },
    /// Download the current metadata snapshot for disaster recovery
    DownloadMetadata {
        storage_url: String,
        #[arg(long, default_value = "s3ql_metadata.db")]
        output: PathBuf,
    },
}

pub async fn execute(config: &Config, cmd: AdmCommand) -> FsResult<()> {
    match cmd {
        AdmCommand::Passphrase {
            storage_url,
            new_passphrase,
        } => {
            let backend = s3ql_backends::open_backend(&storage_url)?;
            let params = FsParams::fetch(&backend).await?;
            params.check_revision()?;
            let key = resolve_master_key(&backend, &params, config.passphrase.as_deref())
                .await?
                .ok_or_else(|| {
                    FsError::InvalidArgument("file system is not encrypted".into())
                })?;
            let wrapped = wrap_master_key(new_passphrase.as_bytes(), &key)?;
            backend.put(KEY_PASSPHRASE, wrapped).await?;
            println!("Passphrase changed.");
            Ok(())
        }
        AdmCommand::Clear { storage_url, force } => {
            if !force {
                return Err(FsError::InvalidArgument(
                    "refusing to delete the file system without --force".into(),
                ));
            }
            let backend = s3ql_backends::open_backend(&storage_url)?;
            let keys = backend.list("s3ql_").await?;
            let count = keys.len();
            backend.delete_multi(&keys).await?;
            println!("Deleted {count} objects.");
            Ok(())
        }
        AdmCommand::DownloadMetadata {
            storage_url,
            output,
        } => {
            let backend = s3ql_backends::open_backend(&storage_url)?;
            let params = FsParams::fetch(&backend).await?;
            params.check_revision()?;
            let key = resolve_master_key(&backend, &params, config.passphrase.as_deref()).await?;
            let codec = ComprencBackend::new(
                backend,
                key,
                Compression::from_name(
                    &config.compression_algorithm,
                    config.compression_level,
                )?,
            );
            metadata::download_metadata(&codec, &params, &output).await?;
            println!("Metadata written to {}.", output.display());
            Ok(())
        }
    }
}
