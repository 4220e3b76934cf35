//! File-level behavior driven through the dispatcher.

mod common;

use common::{BLOCK_SIZE, TestEnv, random_bytes};
use s3ql_backends::ObjectBackend;
use s3ql_core::FsError;
use s3ql_core::database::ROOT_INODE;
use s3ql_core::fs::{AttrChanges, RequestCtx};

fn ctx() -> RequestCtx {
    RequestCtx { uid: 1000, gid: 1000 }
}

#[tokio::test]
async fn test_write_read_roundtrip_single_object() {
    let env = TestEnv::new().await;
    let mounted = env.mount().await;
    let fs = mounted.fs.clone();

    let payload = random_bytes(BLOCK_SIZE as usize);
    let (fh, row) = fs.create(ctx(), ROOT_INODE, b"data.bin", 0o644).await.unwrap();
    fs.write(fh, 0, &payload).await.unwrap();
    fs.flush(fh).await.unwrap();

    let got = fs.read(fh, 0, BLOCK_SIZE as u32).await.unwrap();
    assert_eq!(&got[..], &payload[..]);

    fs.release(fh).await.unwrap();
    let ino = row.id;
    mounted.shutdown().await.unwrap();

    // One 64 KiB file at a 64 KiB block size: exactly one data object.
    assert_eq!(env.data_object_count().await, 1);
    assert!(
        env.backend
            .list("s3ql_metadata")
            .await
            .unwrap()
            .contains(&"s3ql_metadata".to_string())
    );

    // Everything survives a remount.
    let mounted = env.mount().await;
    let row = mounted.fs.lookup(ROOT_INODE, b"data.bin").await.unwrap();
    assert_eq!(row.id, ino);
    assert_eq!(row.size, BLOCK_SIZE as i64);
    let got = mounted.fs.read_inode(ino, 0, BLOCK_SIZE as u32).await.unwrap();
    assert_eq!(&got[..], &payload[..]);
    mounted.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_identical_files_share_one_object() {
    let env = TestEnv::new().await;
    let mounted = env.mount().await;
    let fs = mounted.fs.clone();
    let payload = random_bytes(BLOCK_SIZE as usize);

    let (fh_a, _) = fs.create(ctx(), ROOT_INODE, b"a", 0o644).await.unwrap();
    fs.write(fh_a, 0, &payload).await.unwrap();
    fs.flush(fh_a).await.unwrap();
    fs.release(fh_a).await.unwrap();

    let puts_before = env.backend.put_count();

    let (fh_b, _) = fs.create(ctx(), ROOT_INODE, b"b", 0o644).await.unwrap();
    fs.write(fh_b, 0, &payload).await.unwrap();
    fs.flush(fh_b).await.unwrap();
    fs.release(fh_b).await.unwrap();

    // The copy deduplicated: no further data object was uploaded.
    assert_eq!(env.backend.put_count(), puts_before);
    assert_eq!(env.data_object_count().await, 1);

    let a = fs.lookup(ROOT_INODE, b"a").await.unwrap();
    let b = fs.lookup(ROOT_INODE, b"b").await.unwrap();
    let got_a = fs.read_inode(a.id, 0, BLOCK_SIZE as u32).await.unwrap();
    let got_b = fs.read_inode(b.id, 0, BLOCK_SIZE as u32).await.unwrap();
    assert_eq!(got_a, got_b);

    mounted.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_truncate_unshares_block() {
    let env = TestEnv::new().await;
    let mounted = env.mount().await;
    let fs = mounted.fs.clone();
    let payload = random_bytes(BLOCK_SIZE as usize);

    for name in [b"a".as_slice(), b"b".as_slice()] {
        let (fh, _) = fs.create(ctx(), ROOT_INODE, name, 0o644).await.unwrap();
        fs.write(fh, 0, &payload).await.unwrap();
        fs.flush(fh).await.unwrap();
        fs.release(fh).await.unwrap();
    }

    let a = fs.lookup(ROOT_INODE, b"a").await.unwrap();
    let b = fs.lookup(ROOT_INODE, b"b").await.unwrap();

    fs.setattr(
        a.id,
        AttrChanges {
            size: Some(BLOCK_SIZE / 2),
            ..AttrChanges::default()
        },
    )
    .await
    .unwrap();
    fs.fsync(a.id).await.unwrap();

    // First half reads back, reads past the new end return nothing.
    let got = fs
        .read_inode(a.id, 0, (BLOCK_SIZE / 2) as u32)
        .await
        .unwrap();
    assert_eq!(&got[..], &payload[..BLOCK_SIZE as usize / 2]);
    let past = fs
        .read_inode(a.id, BLOCK_SIZE / 2 + 8192, 4096)
        .await
        .unwrap();
    assert!(past.is_empty());

    // The original full block now belongs to b alone; a grew its own block.
    let mut conn = mounted.db.lock().await;
    let b_block = conn.get_block_of(b.id, 0).await.unwrap().unwrap();
    let a_block = conn.get_block_of(a.id, 0).await.unwrap().unwrap();
    assert_ne!(a_block, b_block);
    assert_eq!(conn.get_block(b_block).await.unwrap().unwrap().refcount, 1);
    drop(conn);

    mounted.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_unlink_with_open_handle() {
    let env = TestEnv::new().await;
    let mounted = env.mount().await;
    let fs = mounted.fs.clone();
    let payload = random_bytes(1000);

    let (fh, _) = fs.create(ctx(), ROOT_INODE, b"victim", 0o644).await.unwrap();
    fs.write(fh, 0, &payload).await.unwrap();
    fs.flush(fh).await.unwrap();
    assert_eq!(env.data_object_count().await, 1);

    fs.unlink(ROOT_INODE, b"victim").await.unwrap();
    assert!(matches!(
        fs.lookup(ROOT_INODE, b"victim").await,
        Err(FsError::NotFound)
    ));

    // The open handle still reads the full content.
    let got = fs.read(fh, 0, 1000).await.unwrap();
    assert_eq!(&got[..], &payload[..]);

    // Closing the last handle releases the block; the object disappears
    // once the deferred-removal queue drains.
    fs.release(fh).await.unwrap();
    mounted.blocks.drain_removals().await.unwrap();
    assert_eq!(env.data_object_count().await, 0);

    mounted.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_holes_read_as_zeros() {
    let env = TestEnv::new().await;
    let mounted = env.mount().await;
    let fs = mounted.fs.clone();

    let (fh, row) = fs.create(ctx(), ROOT_INODE, b"sparse", 0o644).await.unwrap();
    // Write one byte in block 3, leaving blocks 0..3 as holes.
    fs.write(fh, 3 * BLOCK_SIZE, b"x").await.unwrap();
    fs.flush(fh).await.unwrap();

    let row = fs.getattr(row.id).await.unwrap();
    assert_eq!(row.size, (3 * BLOCK_SIZE + 1) as i64);

    let got = fs.read(fh, BLOCK_SIZE, BLOCK_SIZE as u32).await.unwrap();
    assert_eq!(got.len(), BLOCK_SIZE as usize);
    assert!(got.iter().all(|&b| b == 0));

    // Only the written block became an object.
    fs.release(fh).await.unwrap();
    assert_eq!(env.data_object_count().await, 1);

    mounted.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_partial_overwrite_across_blocks() {
    let env = TestEnv::new().await;
    let mounted = env.mount().await;
    let fs = mounted.fs.clone();

    let payload = random_bytes(3 * BLOCK_SIZE as usize);
    let (fh, row) = fs.create(ctx(), ROOT_INODE, b"big", 0o644).await.unwrap();
    fs.write(fh, 0, &payload).await.unwrap();
    fs.flush(fh).await.unwrap();

    // Overwrite a span straddling the block 1 / block 2 boundary.
    let patch = random_bytes(1024);
    let patch_off = 2 * BLOCK_SIZE - 512;
    fs.write(fh, patch_off, &patch).await.unwrap();
    fs.flush(fh).await.unwrap();

    let mut expected = payload.clone();
    expected[patch_off as usize..patch_off as usize + 1024].copy_from_slice(&patch);
    let got = fs.read(fh, 0, 3 * BLOCK_SIZE as u32).await.unwrap();
    assert_eq!(&got[..], &expected[..]);

    assert_eq!(fs.getattr(row.id).await.unwrap().size, 3 * BLOCK_SIZE as i64);
    fs.release(fh).await.unwrap();
    mounted.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_rename_into_own_subtree_rejected() {
    let env = TestEnv::new().await;
    let mounted = env.mount().await;
    let fs = mounted.fs.clone();

    let a = fs.mkdir(ctx(), ROOT_INODE, b"a", 0o755).await.unwrap();
    let b = fs.mkdir(ctx(), a.id, b"b", 0o755).await.unwrap();

    assert!(matches!(
        fs.rename(ROOT_INODE, b"a", b.id, b"a").await,
        Err(FsError::InvalidArgument(_))
    ));

    // Legal renames still work.
    fs.rename(a.id, b"b", ROOT_INODE, b"c").await.unwrap();
    assert!(fs.lookup(ROOT_INODE, b"c").await.is_ok());
    mounted.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_rename_replaces_target() {
    let env = TestEnv::new().await;
    let mounted = env.mount().await;
    let fs = mounted.fs.clone();

    for (name, content) in [(b"src".as_slice(), b"new".as_slice()), (b"dst", b"old")] {
        let (fh, _) = fs.create(ctx(), ROOT_INODE, name, 0o644).await.unwrap();
        fs.write(fh, 0, content).await.unwrap();
        fs.flush(fh).await.unwrap();
        fs.release(fh).await.unwrap();
    }

    fs.rename(ROOT_INODE, b"src", ROOT_INODE, b"dst").await.unwrap();
    assert!(matches!(
        fs.lookup(ROOT_INODE, b"src").await,
        Err(FsError::NotFound)
    ));
    let dst = fs.lookup(ROOT_INODE, b"dst").await.unwrap();
    let got = fs.read_inode(dst.id, 0, 16).await.unwrap();
    assert_eq!(&got[..], b"new");

    mounted.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_hardlinks_share_data() {
    let env = TestEnv::new().await;
    let mounted = env.mount().await;
    let fs = mounted.fs.clone();

    let (fh, row) = fs.create(ctx(), ROOT_INODE, b"orig", 0o644).await.unwrap();
    fs.write(fh, 0, b"shared content").await.unwrap();
    fs.flush(fh).await.unwrap();
    fs.release(fh).await.unwrap();

    let linked = fs.link(row.id, ROOT_INODE, b"alias").await.unwrap();
    assert_eq!(linked.refcount, 2);

    fs.unlink(ROOT_INODE, b"orig").await.unwrap();
    let alias = fs.lookup(ROOT_INODE, b"alias").await.unwrap();
    assert_eq!(alias.refcount, 1);
    let got = fs.read_inode(alias.id, 0, 64).await.unwrap();
    assert_eq!(&got[..], b"shared content");

    mounted.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_symlink_roundtrip() {
    let env = TestEnv::new().await;
    let mounted = env.mount().await;
    let fs = mounted.fs.clone();

    let row = fs
        .symlink(ctx(), ROOT_INODE, b"ptr", b"/somewhere/else")
        .await
        .unwrap();
    assert!(row.is_symlink());
    assert_eq!(
        fs.readlink(row.id).await.unwrap(),
        b"/somewhere/else".to_vec()
    );
    mounted.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_xattr_roundtrip() {
    let env = TestEnv::new().await;
    let mounted = env.mount().await;
    let fs = mounted.fs.clone();

    let (fh, row) = fs.create(ctx(), ROOT_INODE, b"f", 0o644).await.unwrap();
    fs.release(fh).await.unwrap();

    fs.setxattr(row.id, b"user.comment", b"hello").await.unwrap();
    fs.setxattr(row.id, b"user.other", b"world").await.unwrap();
    assert_eq!(fs.getxattr(row.id, b"user.comment").await.unwrap(), b"hello");

    // Overwrite keeps a single attribute.
    fs.setxattr(row.id, b"user.comment", b"replaced").await.unwrap();
    assert_eq!(
        fs.getxattr(row.id, b"user.comment").await.unwrap(),
        b"replaced"
    );

    let names = fs.listxattr(row.id).await.unwrap();
    assert_eq!(names.len(), 2);

    fs.removexattr(row.id, b"user.comment").await.unwrap();
    assert!(matches!(
        fs.getxattr(row.id, b"user.comment").await,
        Err(FsError::NotFound)
    ));
    mounted.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_readdir_lists_entries() {
    let env = TestEnv::new().await;
    let mounted = env.mount().await;
    let fs = mounted.fs.clone();

    fs.mkdir(ctx(), ROOT_INODE, b"subdir", 0o755).await.unwrap();
    let (fh, _) = fs.create(ctx(), ROOT_INODE, b"file", 0o644).await.unwrap();
    fs.release(fh).await.unwrap();

    let entries = fs.readdir(ROOT_INODE, 0).await.unwrap();
    let names: Vec<&[u8]> = entries.iter().map(|(n, _, _)| n.as_slice()).collect();
    // mkfs pre-creates lost+found.
    assert!(names.contains(&b"lost+found".as_slice()));
    assert!(names.contains(&b"subdir".as_slice()));
    assert!(names.contains(&b"file".as_slice()));

    mounted.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_statfs_reports_headroom() {
    let env = TestEnv::new().await;
    let mounted = env.mount().await;
    let fs = mounted.fs.clone();

    let (fh, _) = fs.create(ctx(), ROOT_INODE, b"f", 0o644).await.unwrap();
    fs.write(fh, 0, &random_bytes(BLOCK_SIZE as usize)).await.unwrap();
    fs.flush(fh).await.unwrap();
    fs.release(fh).await.unwrap();

    let stats = fs.statfs().await.unwrap();
    assert!(stats.used_bytes > 0);
    assert_eq!(stats.free_bytes, 1 << 40);

    mounted.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_locked_inode_rejects_modification() {
    let env = TestEnv::new().await;
    let mounted = env.mount().await;
    let fs = mounted.fs.clone();

    let (fh, row) = fs.create(ctx(), ROOT_INODE, b"frozen", 0o644).await.unwrap();
    fs.release(fh).await.unwrap();

    {
        let mut conn = mounted.db.lock().await;
        let mut locked = conn.get_inode(row.id).await.unwrap().unwrap();
        locked.locked = true;
        conn.update_inode(&locked).await.unwrap();
    }

    assert!(matches!(
        fs.setattr(
            row.id,
            AttrChanges {
                size: Some(0),
                ..AttrChanges::default()
            }
        )
        .await,
        Err(FsError::Locked)
    ));
    assert!(matches!(
        fs.setxattr(row.id, b"user.x", b"y").await,
        Err(FsError::Locked)
    ));
    assert!(matches!(
        fs.unlink(ROOT_INODE, b"frozen").await,
        Err(FsError::Locked)
    ));
    assert!(matches!(
        fs.rename(ROOT_INODE, b"frozen", ROOT_INODE, b"thawed").await,
        Err(FsError::Locked)
    ));

    // A locked rename *target* may not be replaced either.
    let (fh, _) = fs.create(ctx(), ROOT_INODE, b"loose", 0o644).await.unwrap();
    fs.release(fh).await.unwrap();
    assert!(matches!(
        fs.rename(ROOT_INODE, b"loose", ROOT_INODE, b"frozen").await,
        Err(FsError::Locked)
    ));

    mounted.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_locked_directory_rejects_removal() {
    let env = TestEnv::new().await;
    let mounted = env.mount().await;
    let fs = mounted.fs.clone();

    let dir = fs.mkdir(ctx(), ROOT_INODE, b"sealed", 0o755).await.unwrap();
    {
        let mut conn = mounted.db.lock().await;
        let mut locked = conn.get_inode(dir.id).await.unwrap().unwrap();
        locked.locked = true;
        conn.update_inode(&locked).await.unwrap();
    }

    assert!(matches!(
        fs.rmdir(ROOT_INODE, b"sealed").await,
        Err(FsError::Locked)
    ));

    mounted.shutdown().await.unwrap();
}
