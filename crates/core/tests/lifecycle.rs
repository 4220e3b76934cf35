//! Mount lifecycle: remount fidelity, mount exclusion, crash recovery.

mod common;

use common::{BLOCK_SIZE, TestEnv, random_bytes};
use s3ql_core::FsError;
use s3ql_core::database::ROOT_INODE;
use s3ql_core::fs::RequestCtx;
use s3ql_core::fsck::{FsckOptions, fsck};
use s3ql_core::mount::MountedFs;
use s3ql_backends::ObjectBackend;
use std::sync::Arc;

fn ctx() -> RequestCtx {
    RequestCtx { uid: 1000, gid: 1000 }
}

#[tokio::test]
async fn test_remount_yields_identical_tree() {
    let env = TestEnv::new().await;
    let payload = random_bytes(BLOCK_SIZE as usize * 2 + 17);

    let mounted = env.mount().await;
    let fs = mounted.fs.clone();
    let dir = fs.mkdir(ctx(), ROOT_INODE, b"docs", 0o755).await.unwrap();
    let (fh, file) = fs.create(ctx(), dir.id, b"report", 0o600).await.unwrap();
    fs.write(fh, 0, &payload).await.unwrap();
    fs.flush(fh).await.unwrap();
    fs.release(fh).await.unwrap();
    fs.symlink(ctx(), ROOT_INODE, b"latest", b"docs/report")
        .await
        .unwrap();
    mounted.shutdown().await.unwrap();

    let mounted = env.mount().await;
    let fs = mounted.fs.clone();
    let dir2 = fs.lookup(ROOT_INODE, b"docs").await.unwrap();
    assert_eq!(dir2.id, dir.id);
    let file2 = fs.lookup(dir2.id, b"report").await.unwrap();
    assert_eq!(file2.id, file.id);
    assert_eq!(file2.mode, file.mode);
    assert_eq!(file2.size, payload.len() as i64);
    let got = fs
        .read_inode(file2.id, 0, payload.len() as u32)
        .await
        .unwrap();
    assert_eq!(&got[..], &payload[..]);
    assert_eq!(
        fs.readlink(fs.lookup(ROOT_INODE, b"latest").await.unwrap().id)
            .await
            .unwrap(),
        b"docs/report".to_vec()
    );
    mounted.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_second_client_cannot_mount() {
    let env = TestEnv::new().await;
    let mounted = env.mount().await;

    // A second client (fresh cache directory) sees a sequence marker beyond
    // the last clean unmount and must refuse.
    let other_dir = tempfile::tempdir().unwrap();
    let mut other_config = env.config.clone();
    other_config.cachedir = other_dir.path().join("cache");

    let err = MountedFs::init(
        &other_config,
        env.backend.clone() as Arc<dyn ObjectBackend>,
    )
    .await
    .err()
    .expect("second mount must fail");
    assert!(matches!(err, FsError::AlreadyMounted));
    assert_eq!(err.exit_code(), 11);

    mounted.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_concurrent_claims_collide() {
    let env = TestEnv::new().await;

    let mut config_a = env.config.clone();
    config_a.consistency_delay_secs = 1;
    let dir_b = tempfile::tempdir().unwrap();
    let mut config_b = config_a.clone();
    config_b.cachedir = dir_b.path().join("cache");

    let backend_a = env.backend.clone() as Arc<dyn ObjectBackend>;
    let backend_b = env.backend.clone() as Arc<dyn ObjectBackend>;
    let (res_a, res_b) = tokio::join!(
        MountedFs::init(&config_a, backend_a),
        async {
            // Start the second claim inside the first one's window.
            tokio::time::sleep(std::time::Duration::from_millis(100)).await;
            MountedFs::init(&config_b, backend_b).await
        }
    );

    // At most one side may win, and at least one must see the conflict.
    let failures = [&res_a, &res_b]
        .iter()
        .filter(|r| r.is_err())
        .count();
    assert!(failures >= 1);

    for res in [res_a, res_b] {
        match res {
            Ok(mounted) => mounted.shutdown().await.unwrap(),
            Err(e) => assert!(matches!(
                e,
                FsError::AlreadyMounted | FsError::NotClean
            )),
        }
    }
}

#[tokio::test]
async fn test_crash_requires_fsck_and_recovers() {
    let env = TestEnv::new().await;
    let payload = random_bytes(BLOCK_SIZE as usize + 100);

    let mounted = env.mount().await;
    let fs = mounted.fs.clone();
    let (fh, file) = fs.create(ctx(), ROOT_INODE, b"precious", 0o644).await.unwrap();
    fs.write(fh, 0, &payload).await.unwrap();
    // fsync acknowledged: this data must survive the crash.
    fs.fsync(file.id).await.unwrap();
    let ino = file.id;
    mounted.abort().await;

    // Without fsck the mount is refused.
    let err = env.try_mount().await.err().expect("mount after crash");
    assert!(matches!(err, FsError::NotClean));
    assert_eq!(err.exit_code(), 10);

    let report = fsck(
        &env.config,
        env.backend.clone() as Arc<dyn ObjectBackend>,
        FsckOptions { deep: true },
    )
    .await
    .unwrap();
    assert!(!report.data_lost);

    let mounted = env.mount().await;
    let got = mounted
        .fs
        .read_inode(ino, 0, payload.len() as u32)
        .await
        .unwrap();
    assert_eq!(&got[..], &payload[..]);
    mounted.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_crash_with_unflushed_data_recovers_from_cache() {
    let env = TestEnv::new().await;
    let payload = random_bytes(4000);

    let mounted = env.mount().await;
    let fs = mounted.fs.clone();
    let (fh, file) = fs.create(ctx(), ROOT_INODE, b"dirty", 0o644).await.unwrap();
    fs.write(fh, 0, &payload).await.unwrap();
    // No flush: the data exists only as a dirty cache entry and a row in the
    // local (not yet uploaded) metadata.
    let ino = file.id;
    mounted.abort().await;

    fsck(
        &env.config,
        env.backend.clone() as Arc<dyn ObjectBackend>,
        FsckOptions { deep: false },
    )
    .await
    .unwrap();

    let mounted = env.mount().await;
    let got = mounted.fs.read_inode(ino, 0, 4000).await.unwrap();
    assert_eq!(&got[..], &payload[..]);
    mounted.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_wrong_passphrase_rejected() {
    let env = TestEnv::new().await;
    let mut bad_config = env.config.clone();
    bad_config.passphrase = Some("not the passphrase".into());

    let err = MountedFs::init(&bad_config, env.backend.clone() as Arc<dyn ObjectBackend>)
        .await
        .err()
        .expect("mount with wrong passphrase");
    assert!(matches!(err, FsError::Auth(_)));
    assert_eq!(err.exit_code(), 12);
}

#[tokio::test]
async fn test_fsck_repairs_refcount_drift() {
    let env = TestEnv::new().await;

    let mounted = env.mount().await;
    let fs = mounted.fs.clone();
    let (fh, file) = fs.create(ctx(), ROOT_INODE, b"f", 0o644).await.unwrap();
    fs.write(fh, 0, b"payload").await.unwrap();
    fs.flush(fh).await.unwrap();
    fs.release(fh).await.unwrap();

    // Corrupt a refcount behind the filesystem's back, then crash.
    {
        let mut conn = mounted.db.lock().await;
        let block_id = conn.get_block_of(file.id, 0).await.unwrap().unwrap();
        conn.adjust_block_refcount(block_id, 5).await.unwrap();
    }
    mounted.abort().await;

    let report = fsck(
        &env.config,
        env.backend.clone() as Arc<dyn ObjectBackend>,
        FsckOptions { deep: false },
    )
    .await
    .unwrap();
    assert!(report.errors_fixed > 0);

    // And the filesystem is consistent again afterwards.
    let mounted = env.mount().await;
    let mut conn = mounted.db.lock().await;
    let block_id = conn.get_block_of(file.id, 0).await.unwrap().unwrap();
    assert_eq!(conn.get_block(block_id).await.unwrap().unwrap().refcount, 1);
    drop(conn);
    mounted.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_fsck_recovers_from_snapshot_when_backend_loses_objects() {
    let env = TestEnv::new().await;
    let payload = random_bytes(BLOCK_SIZE as usize);

    // File a becomes part of the last clean snapshot.
    let mounted = env.mount().await;
    let fs = mounted.fs.clone();
    let (fh, a) = fs.create(ctx(), ROOT_INODE, b"a", 0o644).await.unwrap();
    fs.write(fh, 0, &payload).await.unwrap();
    fs.flush(fh).await.unwrap();
    fs.release(fh).await.unwrap();
    mounted.shutdown().await.unwrap();

    // File b is written afterwards; the backend then loses its object and
    // the mount dies.
    let before: std::collections::HashSet<String> = env
        .backend
        .list("s3ql_data_")
        .await
        .unwrap()
        .into_iter()
        .collect();
    let mounted = env.mount().await;
    let fs = mounted.fs.clone();
    let (fh, _) = fs.create(ctx(), ROOT_INODE, b"b", 0o644).await.unwrap();
    fs.write(fh, 0, &random_bytes(1000)).await.unwrap();
    fs.flush(fh).await.unwrap();
    let lost = env
        .backend
        .list("s3ql_data_")
        .await
        .unwrap()
        .into_iter()
        .find(|k| !before.contains(k))
        .unwrap();
    env.backend.delete(&lost).await.unwrap();
    mounted.abort().await;

    let report = fsck(
        &env.config,
        env.backend.clone() as Arc<dyn ObjectBackend>,
        FsckOptions { deep: false },
    )
    .await
    .unwrap();
    assert!(report.errors_fixed > 0);
    assert!(report.data_lost);

    // The snapshot state is back: a intact, b rolled away with its data.
    let mounted = env.mount().await;
    let fs = mounted.fs.clone();
    let got = fs.read_inode(a.id, 0, BLOCK_SIZE as u32).await.unwrap();
    assert_eq!(&got[..], &payload[..]);
    assert!(matches!(
        fs.lookup(ROOT_INODE, b"b").await,
        Err(FsError::NotFound)
    ));
    mounted.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_fsck_moves_files_with_lost_objects_to_lost_found() {
    let env = TestEnv::new().await;

    let mounted = env.mount().await;
    let fs = mounted.fs.clone();
    let (fh, file) = fs.create(ctx(), ROOT_INODE, b"damaged", 0o644).await.unwrap();
    fs.write(fh, 0, &random_bytes(1000)).await.unwrap();
    fs.flush(fh).await.unwrap();
    fs.release(fh).await.unwrap();
    mounted.shutdown().await.unwrap();

    // The backend loses the data object along with every snapshot that
    // could restore a consistent older state.
    for key in env.backend.list("s3ql_data_").await.unwrap() {
        env.backend.delete(&key).await.unwrap();
    }
    for key in env.backend.list("s3ql_metadata_bak").await.unwrap() {
        env.backend.delete(&key).await.unwrap();
    }

    // Check from a machine without the local cache, so nothing can be
    // re-ingested.
    let other_dir = tempfile::tempdir().unwrap();
    let mut config = env.config.clone();
    config.cachedir = other_dir.path().join("cache");

    let report = fsck(
        &config,
        env.backend.clone() as Arc<dyn ObjectBackend>,
        FsckOptions { deep: false },
    )
    .await
    .unwrap();
    assert!(report.errors_fixed > 0);
    assert!(report.data_lost);

    // The file lost its data but is still visible, parked in /lost+found.
    let mounted = MountedFs::init(&config, env.backend.clone() as Arc<dyn ObjectBackend>)
        .await
        .unwrap();
    let fs = mounted.fs.clone();
    assert!(matches!(
        fs.lookup(ROOT_INODE, b"damaged").await,
        Err(FsError::NotFound)
    ));
    let lf = fs.lookup(ROOT_INODE, b"lost+found").await.unwrap();
    let moved = fs
        .lookup(lf.id, format!("inode-{}", file.id).as_bytes())
        .await
        .unwrap();
    assert_eq!(moved.id, file.id);
    mounted.shutdown().await.unwrap();
}
