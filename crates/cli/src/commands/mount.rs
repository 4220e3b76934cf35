use s3ql_core::fuse::mount_and_serve;
use s3ql_core::{Config, FsError, FsResult};

pub async fn execute(config: Config, storage_url: &str, mountpoint: &str) -> FsResult<()> {
    tracing::info!(storage_url, mountpoint, "mounting file system");
    let crit_log = config.cachedir.join("mount.s3ql_crit.log");
    match mount_and_serve(config, storage_url, mountpoint).await {
        Err(e @ FsError::Corruption(_)) => {
            if let Err(log_err) = std::fs::write(&crit_log, format!("{e}\n")) {
                tracing::error!(error = %log_err, "could not write crash log");
            } else {
                tracing::error!("fatal error, details in {}", crit_log.display());
            }
            Err(e)
        }
        other => other,
    }
}
