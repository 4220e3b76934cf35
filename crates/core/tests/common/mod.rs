use rand::RngCore;
use std::sync::Arc;

use s3ql_backends::{MemBackend, ObjectBackend};
use s3ql_core::Config;
use s3ql_core::mkfs::{MkfsOptions, mkfs};
use s3ql_core::mount::MountedFs;

pub const BLOCK_SIZE: u64 = 64 * 1024;

pub struct TestEnv {
    pub backend: Arc<MemBackend>,
    pub config: Config,
    _dir: tempfile::TempDir,
}

impl TestEnv {
    /// A fresh, empty filesystem on an in-memory backend.
    pub async fn new() -> Self {
        let dir = tempfile::tempdir().unwrap();
        let config = Config {
            cachedir: dir.path().join("cache"),
            max_cache_size: 4 * BLOCK_SIZE,
            max_cache_entries: 16,
            upload_threads: 2,
            consistency_delay_secs: 0,
            passphrase: Some("test passphrase".into()),
            ..Config::default()
        };
        let backend = Arc::new(MemBackend::new());
        mkfs(
            &config,
            backend.clone() as Arc<dyn ObjectBackend>,
            MkfsOptions {
                label: "test".into(),
                data_block_size: BLOCK_SIZE,
                force: false,
            },
        )
        .await
        .unwrap();
        Self {
            backend,
            config,
            _dir: dir,
        }
    }

    pub async fn mount(&self) -> MountedFs {
        MountedFs::init(&self.config, self.backend.clone() as Arc<dyn ObjectBackend>)
            .await
            .unwrap()
    }

    pub async fn try_mount(&self) -> Result<MountedFs, s3ql_core::FsError> {
        MountedFs::init(&self.config, self.backend.clone() as Arc<dyn ObjectBackend>).await
    }

    pub async fn data_object_count(&self) -> usize {
        self.backend.list("s3ql_data_").await.unwrap().len()
    }
}

pub fn random_bytes(len: usize) -> Vec<u8> {
    let mut buf = vec![0u8; len];
    rand::thread_rng().fill_bytes(&mut buf);
    buf
}
