use s3ql_core::mkfs::{MkfsOptions, mkfs};
use s3ql_core::{Config, FsResult};

pub async fn execute(
    config: &Config,
    storage_url: &str,
    label: String,
    block_size: u64,
    force: bool,
) -> FsResult<()> {
    let backend = s3ql_backends::open_backend(storage_url)?;
    let params = mkfs(
        config,
        backend,
        MkfsOptions {
            label,
            data_block_size: block_size,
            force,
        },
    )
    .await?;
    println!("Created file system {} (label '{}')", params.uuid, params.label);
    if !params.encrypted {
        println!("Warning: no passphrase set, data will not be encrypted");
    }
    Ok(())
}
