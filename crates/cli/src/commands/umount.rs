use s3ql_core::{FsError, FsResult};

/// Ask the kernel to unmount; the mount process then flushes its cache,
/// uploads the final metadata snapshot and exits on its own.
pub async fn execute(mountpoint: &str) -> FsResult<()> {
    for tool in ["fusermount3", "fusermount"] {
        match tokio::process::Command::new(tool)
            .arg("-u")
            .arg(mountpoint)
            .status()
            .await
        {
            Ok(status) if status.success() => return Ok(()),
            Ok(status) => {
                return Err(FsError::InvalidArgument(format!(
                    "{tool} -u {mountpoint} failed with {status}"
                )));
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => continue,
            Err(e) => return Err(e.into()),
        }
    }
    Err(FsError::Unsupported(
        "no fusermount binary found".into(),
    ))
}
