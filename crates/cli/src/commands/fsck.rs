use s3ql_core::fsck::{FsckOptions, fsck};
use s3ql_core::{Config, FsResult};

pub async fn execute(config: &Config, storage_url: &str, deep: bool) -> FsResult<()> {
    let backend = s3ql_backends::open_backend(storage_url)?;
    let report = fsck(config, backend, FsckOptions { deep }).await?;
    if report.errors_fixed == 0 {
        println!("File system is clean.");
    } else {
        println!("Repaired {} inconsistencies.", report.errors_fixed);
        if report.data_lost {
            println!("Some file data could not be recovered.");
        }
    }
    Ok(())
}
