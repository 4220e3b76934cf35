//! Embedded metadata database.
//!
//! All structural filesystem state lives in a single SQLite file under the
//! cache directory. A [`MetaDb`] wraps the one connection in a mutex; holding
//! the connection guard *is* the global metadata write lock from the
//! concurrency model, so callers must not perform slow backend I/O while
//! holding it.

use sqlx::sqlite::{
    SqliteConnectOptions, SqliteConnection, SqliteJournalMode, SqliteSynchronous,
};
use sqlx::{Connection as _, Row};
use std::path::{Path, PathBuf};
use tokio::sync::{Mutex, MutexGuard};

use crate::error::FsResult;

/// Reserved inode number of the filesystem root.
pub const ROOT_INODE: i64 = 1;

const SCHEMA: &[&str] = &[
    // One row per backend storage object. phys_size is the encoded size in
    // the backend; -1 means the object has not finished uploading. hash
    // mirrors the hash of the block stored in it and goes NULL when an
    // upload fails, so nothing ever dedups against a lost object.
    "CREATE TABLE objects (
        id          INTEGER PRIMARY KEY AUTOINCREMENT,
        refcount    INT NOT NULL,
        hash        BLOB(32),
        phys_size   INT NOT NULL,
        length      INT NOT NULL
    )",
    // Content-addressed blocks. size is the plaintext length.
    "CREATE TABLE blocks (
        id          INTEGER PRIMARY KEY AUTOINCREMENT,
        hash        BLOB(32) UNIQUE,
        refcount    INT NOT NULL,
        size        INT NOT NULL,
        obj_id      INTEGER NOT NULL REFERENCES objects(id)
    )",
    // The id alias for the rowid must be spelled exactly like this.
    "CREATE TABLE inodes (
        id        INTEGER PRIMARY KEY AUTOINCREMENT,
        mode      INT NOT NULL,
        uid       INT NOT NULL,
        gid       INT NOT NULL,
        mtime_ns  INT NOT NULL,
        atime_ns  INT NOT NULL,
        ctime_ns  INT NOT NULL,
        refcount  INT NOT NULL,
        size      INT NOT NULL DEFAULT 0,
        rdev      INT NOT NULL DEFAULT 0,
        locked    BOOLEAN NOT NULL DEFAULT 0
    )",
    "CREATE TABLE inode_blocks (
        inode     INTEGER NOT NULL REFERENCES inodes(id),
        blockno   INT NOT NULL,
        block_id  INTEGER NOT NULL REFERENCES blocks(id),
        PRIMARY KEY (inode, blockno)
    )",
    "CREATE TABLE symlink_targets (
        inode     INTEGER PRIMARY KEY REFERENCES inodes(id),
        target    BLOB NOT NULL
    )",
    // Interned entry and xattr names.
    "CREATE TABLE names (
        id        INTEGER PRIMARY KEY,
        name      BLOB NOT NULL,
        refcount  INT NOT NULL,
        UNIQUE (name)
    )",
    // rowid is used by readdir to restart at the correct position.
    "CREATE TABLE contents (
        rowid        INTEGER PRIMARY KEY AUTOINCREMENT,
        name_id      INT NOT NULL REFERENCES names(id),
        inode        INT NOT NULL REFERENCES inodes(id),
        parent_inode INT NOT NULL REFERENCES inodes(id),
        UNIQUE (parent_inode, name_id)
    )",
    "CREATE TABLE ext_attributes (
        inode     INTEGER NOT NULL REFERENCES inodes(id),
        name_id   INTEGER NOT NULL REFERENCES names(id),
        value     BLOB NOT NULL,
        PRIMARY KEY (inode, name_id)
    )",
    // Persistent queue of backend objects awaiting deletion.
    "CREATE TABLE objects_to_delete (
        obj_id    INTEGER PRIMARY KEY
    )",
    "CREATE INDEX ix_blocks_hash ON blocks(hash)",
    "CREATE INDEX ix_contents_inode ON contents(inode)",
    "CREATE INDEX ix_inode_blocks_block ON inode_blocks(block_id)",
    "CREATE INDEX ix_blocks_obj ON blocks(obj_id)",
];

#[derive(sqlx::FromRow, Clone, Debug)]
pub struct InodeRow {
    pub id: i64,
    pub mode: u32,
    pub uid: u32,
    pub gid: u32,
    pub mtime_ns: i64,
    pub atime_ns: i64,
    pub ctime_ns: i64,
    pub refcount: i64,
    pub size: i64,
    pub rdev: u32,
    pub locked: bool,
}

impl InodeRow {
    pub fn is_dir(&self) -> bool {
        self.mode & libc::S_IFMT == libc::S_IFDIR
    }

    pub fn is_symlink(&self) -> bool {
        self.mode & libc::S_IFMT == libc::S_IFLNK
    }

    pub fn is_file(&self) -> bool {
        self.mode & libc::S_IFMT == libc::S_IFREG
    }
}

#[derive(sqlx::FromRow, Clone, Debug)]
pub struct BlockRow {
    pub id: i64,
    pub hash: Option<Vec<u8>>,
    pub refcount: i64,
    pub size: i64,
    pub obj_id: i64,
}

#[derive(sqlx::FromRow, Clone, Debug)]
pub struct ObjectRow {
    pub id: i64,
    pub refcount: i64,
    pub hash: Option<Vec<u8>>,
    pub phys_size: i64,
    pub length: i64,
}

pub struct NewInode {
    pub mode: u32,
    pub uid: u32,
    pub gid: u32,
    pub rdev: u32,
    pub refcount: i64,
    pub size: i64,
}

/// Remove the WAL sidecar files next to a database image, so a freshly
/// written image is not shadowed by stale journal state.
pub fn remove_db_sidecars(db_path: &Path) -> std::io::Result<()> {
    for suffix in ["-wal", "-shm"] {
        let mut sidecar = db_path.as_os_str().to_owned();
        sidecar.push(suffix);
        match std::fs::remove_file(Path::new(&sidecar)) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(e),
        }
    }
    Ok(())
}

/// Nanosecond wall-clock timestamp for inode times.
pub fn now_ns() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_nanos() as i64)
        .unwrap_or(0)
}

pub struct Connection {
    conn: SqliteConnection,
    path: PathBuf,
}

pub struct MetaDb {
    inner: Mutex<Connection>,
    path: PathBuf,
}

impl MetaDb {
    pub async fn open(path: &Path) -> FsResult<Self> {
        let conn = Connection::open(path).await?;
        Ok(Self {
            inner: Mutex::new(conn),
            path: path.to_path_buf(),
        })
    }

    /// Acquire the global metadata lock.
    pub async fn lock(&self) -> MutexGuard<'_, Connection> {
        self.inner.lock().await
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Connection {
    pub async fn open(path: &Path) -> FsResult<Self> {
        let opts = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .synchronous(SqliteSynchronous::Normal)
            .foreign_keys(false);
        let conn = SqliteConnection::connect_with(&opts).await?;
        Ok(Self {
            conn,
            path: path.to_path_buf(),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Direct access for callers with one-off queries (fsck).
    pub fn raw(&mut self) -> &mut SqliteConnection {
        &mut self.conn
    }

    pub async fn create_tables(&mut self) -> FsResult<()> {
        for stmt in SCHEMA {
            sqlx::query(stmt).execute(&mut self.conn).await?;
        }
        Ok(())
    }

    /// Move everything from the WAL into the main database file so that the
    /// file on disk is a complete, uploadable image.
    pub async fn checkpoint(&mut self) -> FsResult<()> {
        sqlx::query("PRAGMA wal_checkpoint(TRUNCATE)")
            .execute(&mut self.conn)
            .await?;
        Ok(())
    }

    pub async fn begin(&mut self) -> FsResult<()> {
        sqlx::query("BEGIN IMMEDIATE").execute(&mut self.conn).await?;
        Ok(())
    }

    pub async fn commit(&mut self) -> FsResult<()> {
        sqlx::query("COMMIT").execute(&mut self.conn).await?;
        Ok(())
    }

    pub async fn rollback(&mut self) -> FsResult<()> {
        sqlx::query("ROLLBACK").execute(&mut self.conn).await?;
        Ok(())
    }

    // ------------------------------------------------------------------
    // inodes

    pub async fn get_inode(&mut self, id: i64) -> FsResult<Option<InodeRow>> {
        let row = sqlx::query_as::<_, InodeRow>("SELECT * FROM inodes WHERE id = ?")
            .bind(id)
            .fetch_optional(&mut self.conn)
            .await?;
        Ok(row)
    }

    pub async fn create_inode(&mut self, new: NewInode) -> FsResult<i64> {
        let now = now_ns();
        let res = sqlx::query(
            "INSERT INTO inodes (mode, uid, gid, mtime_ns, atime_ns, ctime_ns, \
             refcount, size, rdev, locked) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, 0)",
        )
        .bind(new.mode)
        .bind(new.uid)
        .bind(new.gid)
        .bind(now)
        .bind(now)
        .bind(now)
        .bind(new.refcount)
        .bind(new.size)
        .bind(new.rdev)
        .execute(&mut self.conn)
        .await?;
        Ok(res.last_insert_rowid())
    }

    pub async fn update_inode(&mut self, inode: &InodeRow) -> FsResult<()> {
        sqlx::query(
            "UPDATE inodes SET mode=?, uid=?, gid=?, mtime_ns=?, atime_ns=?, \
             ctime_ns=?, refcount=?, size=?, rdev=?, locked=? WHERE id=?",
        )
        .bind(inode.mode)
        .bind(inode.uid)
        .bind(inode.gid)
        .bind(inode.mtime_ns)
        .bind(inode.atime_ns)
        .bind(inode.ctime_ns)
        .bind(inode.refcount)
        .bind(inode.size)
        .bind(inode.rdev)
        .bind(inode.locked)
        .bind(inode.id)
        .execute(&mut self.conn)
        .await?;
        Ok(())
    }

    pub async fn set_inode_size(&mut self, id: i64, size: i64) -> FsResult<()> {
        sqlx::query("UPDATE inodes SET size=?, mtime_ns=?, ctime_ns=? WHERE id=?")
            .bind(size)
            .bind(now_ns())
            .bind(now_ns())
            .bind(id)
            .execute(&mut self.conn)
            .await?;
        Ok(())
    }

    pub async fn touch_mtime(&mut self, id: i64) -> FsResult<()> {
        let now = now_ns();
        sqlx::query("UPDATE inodes SET mtime_ns=?, ctime_ns=? WHERE id=?")
            .bind(now)
            .bind(now)
            .bind(id)
            .execute(&mut self.conn)
            .await?;
        Ok(())
    }

    pub async fn touch_ctime(&mut self, id: i64) -> FsResult<()> {
        sqlx::query("UPDATE inodes SET ctime_ns=? WHERE id=?")
            .bind(now_ns())
            .bind(id)
            .execute(&mut self.conn)
            .await?;
        Ok(())
    }

    pub async fn adjust_inode_refcount(&mut self, id: i64, delta: i64) -> FsResult<i64> {
        sqlx::query("UPDATE inodes SET refcount = refcount + ? WHERE id=?")
            .bind(delta)
            .bind(id)
            .execute(&mut self.conn)
            .await?;
        let row = sqlx::query("SELECT refcount FROM inodes WHERE id=?")
            .bind(id)
            .fetch_one(&mut self.conn)
            .await?;
        Ok(row.get::<i64, _>(0))
    }

    pub async fn delete_inode_row(&mut self, id: i64) -> FsResult<()> {
        sqlx::query("DELETE FROM inodes WHERE id=?")
            .bind(id)
            .execute(&mut self.conn)
            .await?;
        Ok(())
    }

    // ------------------------------------------------------------------
    // names

    pub async fn intern_name(&mut self, name: &[u8]) -> FsResult<i64> {
        let existing = sqlx::query("SELECT id FROM names WHERE name=?")
            .bind(name)
            .fetch_optional(&mut self.conn)
            .await?;
        if let Some(row) = existing {
            let id: i64 = row.get(0);
            sqlx::query("UPDATE names SET refcount = refcount + 1 WHERE id=?")
                .bind(id)
                .execute(&mut self.conn)
                .await?;
            return Ok(id);
        }
        let res = sqlx::query("INSERT INTO names (name, refcount) VALUES (?, 1)")
            .bind(name)
            .execute(&mut self.conn)
            .await?;
        Ok(res.last_insert_rowid())
    }

    pub async fn release_name(&mut self, name_id: i64) -> FsResult<()> {
        let row = sqlx::query("SELECT refcount FROM names WHERE id=?")
            .bind(name_id)
            .fetch_optional(&mut self.conn)
            .await?;
        let Some(row) = row else { return Ok(()) };
        if row.get::<i64, _>(0) > 1 {
            sqlx::query("UPDATE names SET refcount = refcount - 1 WHERE id=?")
                .bind(name_id)
                .execute(&mut self.conn)
                .await?;
        } else {
            sqlx::query("DELETE FROM names WHERE id=?")
                .bind(name_id)
                .execute(&mut self.conn)
                .await?;
        }
        Ok(())
    }

    pub async fn name_id(&mut self, name: &[u8]) -> FsResult<Option<i64>> {
        let row = sqlx::query("SELECT id FROM names WHERE name=?")
            .bind(name)
            .fetch_optional(&mut self.conn)
            .await?;
        Ok(row.map(|r| r.get(0)))
    }

    // ------------------------------------------------------------------
    // directory contents

    pub async fn lookup_entry(&mut self, parent: i64, name: &[u8]) -> FsResult<Option<i64>> {
        let row = sqlx::query(
            "SELECT c.inode FROM contents c JOIN names n ON n.id = c.name_id \
             WHERE c.parent_inode=? AND n.name=?",
        )
        .bind(parent)
        .bind(name)
        .fetch_optional(&mut self.conn)
        .await?;
        Ok(row.map(|r| r.get(0)))
    }

    /// Insert a directory entry; the caller has already interned the name.
    pub async fn insert_entry(&mut self, parent: i64, name_id: i64, inode: i64) -> FsResult<()> {
        sqlx::query("INSERT INTO contents (name_id, inode, parent_inode) VALUES (?, ?, ?)")
            .bind(name_id)
            .bind(inode)
            .bind(parent)
            .execute(&mut self.conn)
            .await?;
        Ok(())
    }

    /// Remove an entry, returning `(name_id, inode)`. The name refcount is
    /// *not* released here.
    pub async fn remove_entry(&mut self, parent: i64, name: &[u8]) -> FsResult<Option<(i64, i64)>> {
        let row = sqlx::query(
            "SELECT c.name_id, c.inode FROM contents c JOIN names n ON n.id = c.name_id \
             WHERE c.parent_inode=? AND n.name=?",
        )
        .bind(parent)
        .bind(name)
        .fetch_optional(&mut self.conn)
        .await?;
        let Some(row) = row else { return Ok(None) };
        let name_id: i64 = row.get(0);
        let inode: i64 = row.get(1);
        sqlx::query("DELETE FROM contents WHERE parent_inode=? AND name_id=?")
            .bind(parent)
            .bind(name_id)
            .execute(&mut self.conn)
            .await?;
        Ok(Some((name_id, inode)))
    }

    /// Directory listing starting after `offset` previously returned rows.
    pub async fn list_dir(
        &mut self,
        parent: i64,
        offset: i64,
    ) -> FsResult<Vec<(Vec<u8>, i64, u32)>> {
        let rows = sqlx::query(
            "SELECT n.name, c.inode, i.mode FROM contents c \
             JOIN names n ON n.id = c.name_id \
             JOIN inodes i ON i.id = c.inode \
             WHERE c.parent_inode=? ORDER BY c.rowid LIMIT -1 OFFSET ?",
        )
        .bind(parent)
        .bind(offset)
        .fetch_all(&mut self.conn)
        .await?;
        Ok(rows
            .into_iter()
            .map(|r| (r.get::<Vec<u8>, _>(0), r.get::<i64, _>(1), r.get::<u32, _>(2)))
            .collect())
    }

    /// Like [`Self::list_dir`], but with the complete inode row per entry
    /// (for readdirplus).
    pub async fn list_dir_attrs(
        &mut self,
        parent: i64,
        offset: i64,
    ) -> FsResult<Vec<(Vec<u8>, InodeRow)>> {
        let rows = sqlx::query(
            "SELECT n.name, i.id, i.mode, i.uid, i.gid, i.mtime_ns, i.atime_ns, \
                    i.ctime_ns, i.refcount, i.size, i.rdev, i.locked \
             FROM contents c \
             JOIN names n ON n.id = c.name_id \
             JOIN inodes i ON i.id = c.inode \
             WHERE c.parent_inode=? ORDER BY c.rowid LIMIT -1 OFFSET ?",
        )
        .bind(parent)
        .bind(offset)
        .fetch_all(&mut self.conn)
        .await?;
        Ok(rows
            .into_iter()
            .map(|r| {
                let name: Vec<u8> = r.get(0);
                let row = InodeRow {
                    id: r.get(1),
                    mode: r.get(2),
                    uid: r.get(3),
                    gid: r.get(4),
                    mtime_ns: r.get(5),
                    atime_ns: r.get(6),
                    ctime_ns: r.get(7),
                    refcount: r.get(8),
                    size: r.get(9),
                    rdev: r.get(10),
                    locked: r.get(11),
                };
                (name, row)
            })
            .collect())
    }

    pub async fn dir_has_entries(&mut self, parent: i64) -> FsResult<bool> {
        let row = sqlx::query("SELECT 1 FROM contents WHERE parent_inode=? LIMIT 1")
            .bind(parent)
            .fetch_optional(&mut self.conn)
            .await?;
        Ok(row.is_some())
    }

    /// Parent directory of an inode (any one entry referencing it).
    pub async fn parent_of(&mut self, inode: i64) -> FsResult<Option<i64>> {
        let row = sqlx::query("SELECT parent_inode FROM contents WHERE inode=? LIMIT 1")
            .bind(inode)
            .fetch_optional(&mut self.conn)
            .await?;
        Ok(row.map(|r| r.get(0)))
    }

    // ------------------------------------------------------------------
    // symlinks and xattrs

    pub async fn set_symlink_target(&mut self, inode: i64, target: &[u8]) -> FsResult<()> {
        sqlx::query("INSERT INTO symlink_targets (inode, target) VALUES (?, ?)")
            .bind(inode)
            .bind(target)
            .execute(&mut self.conn)
            .await?;
        Ok(())
    }

    pub async fn get_symlink_target(&mut self, inode: i64) -> FsResult<Option<Vec<u8>>> {
        let row = sqlx::query("SELECT target FROM symlink_targets WHERE inode=?")
            .bind(inode)
            .fetch_optional(&mut self.conn)
            .await?;
        Ok(row.map(|r| r.get(0)))
    }

    pub async fn delete_symlink_target(&mut self, inode: i64) -> FsResult<()> {
        sqlx::query("DELETE FROM symlink_targets WHERE inode=?")
            .bind(inode)
            .execute(&mut self.conn)
            .await?;
        Ok(())
    }

    pub async fn get_xattr(&mut self, inode: i64, name: &[u8]) -> FsResult<Option<Vec<u8>>> {
        let row = sqlx::query(
            "SELECT x.value FROM ext_attributes x JOIN names n ON n.id = x.name_id \
             WHERE x.inode=? AND n.name=?",
        )
        .bind(inode)
        .bind(name)
        .fetch_optional(&mut self.conn)
        .await?;
        Ok(row.map(|r| r.get(0)))
    }

    /// Returns true if the attribute already existed (name refcount must then
    /// be released by the caller, who interned it optimistically).
    pub async fn set_xattr(&mut self, inode: i64, name_id: i64, value: &[u8]) -> FsResult<bool> {
        let existing = sqlx::query("SELECT 1 FROM ext_attributes WHERE inode=? AND name_id=?")
            .bind(inode)
            .bind(name_id)
            .fetch_optional(&mut self.conn)
            .await?;
        sqlx::query(
            "INSERT OR REPLACE INTO ext_attributes (inode, name_id, value) VALUES (?, ?, ?)",
        )
        .bind(inode)
        .bind(name_id)
        .bind(value)
        .execute(&mut self.conn)
        .await?;
        Ok(existing.is_some())
    }

    pub async fn list_xattrs(&mut self, inode: i64) -> FsResult<Vec<Vec<u8>>> {
        let rows = sqlx::query(
            "SELECT n.name FROM ext_attributes x JOIN names n ON n.id = x.name_id \
             WHERE x.inode=? ORDER BY n.name",
        )
        .bind(inode)
        .fetch_all(&mut self.conn)
        .await?;
        Ok(rows.into_iter().map(|r| r.get(0)).collect())
    }

    /// Remove one xattr; returns its name_id so the caller can release it.
    pub async fn remove_xattr(&mut self, inode: i64, name: &[u8]) -> FsResult<Option<i64>> {
        let row = sqlx::query(
            "SELECT x.name_id FROM ext_attributes x JOIN names n ON n.id = x.name_id \
             WHERE x.inode=? AND n.name=?",
        )
        .bind(inode)
        .bind(name)
        .fetch_optional(&mut self.conn)
        .await?;
        let Some(row) = row else { return Ok(None) };
        let name_id: i64 = row.get(0);
        sqlx::query("DELETE FROM ext_attributes WHERE inode=? AND name_id=?")
            .bind(inode)
            .bind(name_id)
            .execute(&mut self.conn)
            .await?;
        Ok(Some(name_id))
    }

    /// Remove all xattrs of an inode; returns the released name ids.
    pub async fn remove_all_xattrs(&mut self, inode: i64) -> FsResult<Vec<i64>> {
        let rows = sqlx::query("SELECT name_id FROM ext_attributes WHERE inode=?")
            .bind(inode)
            .fetch_all(&mut self.conn)
            .await?;
        sqlx::query("DELETE FROM ext_attributes WHERE inode=?")
            .bind(inode)
            .execute(&mut self.conn)
            .await?;
        Ok(rows.into_iter().map(|r| r.get(0)).collect())
    }

    // ------------------------------------------------------------------
    // blocks and objects

    pub async fn get_block_of(&mut self, inode: i64, blockno: i64) -> FsResult<Option<i64>> {
        let row = sqlx::query("SELECT block_id FROM inode_blocks WHERE inode=? AND blockno=?")
            .bind(inode)
            .bind(blockno)
            .fetch_optional(&mut self.conn)
            .await?;
        Ok(row.map(|r| r.get(0)))
    }

    pub async fn blocks_of_inode(&mut self, inode: i64) -> FsResult<Vec<(i64, i64)>> {
        let rows = sqlx::query(
            "SELECT blockno, block_id FROM inode_blocks WHERE inode=? ORDER BY blockno",
        )
        .bind(inode)
        .fetch_all(&mut self.conn)
        .await?;
        Ok(rows
            .into_iter()
            .map(|r| (r.get::<i64, _>(0), r.get::<i64, _>(1)))
            .collect())
    }

    pub async fn find_block_by_hash(&mut self, hash: &[u8]) -> FsResult<Option<i64>> {
        let row = sqlx::query("SELECT id FROM blocks WHERE hash=?")
            .bind(hash)
            .fetch_optional(&mut self.conn)
            .await?;
        Ok(row.map(|r| r.get(0)))
    }

    pub async fn get_block(&mut self, block_id: i64) -> FsResult<Option<BlockRow>> {
        let row = sqlx::query_as::<_, BlockRow>("SELECT * FROM blocks WHERE id=?")
            .bind(block_id)
            .fetch_optional(&mut self.conn)
            .await?;
        Ok(row)
    }

    pub async fn create_object(&mut self, hash: &[u8], length: i64) -> FsResult<i64> {
        let res = sqlx::query(
            "INSERT INTO objects (refcount, hash, phys_size, length) VALUES (1, ?, -1, ?)",
        )
        .bind(hash)
        .bind(length)
        .execute(&mut self.conn)
        .await?;
        Ok(res.last_insert_rowid())
    }

    pub async fn create_block(&mut self, hash: &[u8], size: i64, obj_id: i64) -> FsResult<i64> {
        let res =
            sqlx::query("INSERT INTO blocks (hash, refcount, size, obj_id) VALUES (?, 1, ?, ?)")
                .bind(hash)
                .bind(size)
                .bind(obj_id)
                .execute(&mut self.conn)
                .await?;
        Ok(res.last_insert_rowid())
    }

    pub async fn link_block(&mut self, inode: i64, blockno: i64, block_id: i64) -> FsResult<()> {
        sqlx::query(
            "INSERT OR REPLACE INTO inode_blocks (inode, blockno, block_id) VALUES (?, ?, ?)",
        )
        .bind(inode)
        .bind(blockno)
        .bind(block_id)
        .execute(&mut self.conn)
        .await?;
        Ok(())
    }

    pub async fn unlink_block(&mut self, inode: i64, blockno: i64) -> FsResult<()> {
        sqlx::query("DELETE FROM inode_blocks WHERE inode=? AND blockno=?")
            .bind(inode)
            .bind(blockno)
            .execute(&mut self.conn)
            .await?;
        Ok(())
    }

    pub async fn adjust_block_refcount(&mut self, block_id: i64, delta: i64) -> FsResult<()> {
        sqlx::query("UPDATE blocks SET refcount = refcount + ? WHERE id=?")
            .bind(delta)
            .bind(block_id)
            .execute(&mut self.conn)
            .await?;
        Ok(())
    }

    pub async fn delete_block(&mut self, block_id: i64) -> FsResult<()> {
        sqlx::query("DELETE FROM blocks WHERE id=?")
            .bind(block_id)
            .execute(&mut self.conn)
            .await?;
        Ok(())
    }

    pub async fn get_object(&mut self, obj_id: i64) -> FsResult<Option<ObjectRow>> {
        let row = sqlx::query_as::<_, ObjectRow>("SELECT * FROM objects WHERE id=?")
            .bind(obj_id)
            .fetch_optional(&mut self.conn)
            .await?;
        Ok(row)
    }

    pub async fn adjust_object_refcount(&mut self, obj_id: i64, delta: i64) -> FsResult<()> {
        sqlx::query("UPDATE objects SET refcount = refcount + ? WHERE id=?")
            .bind(delta)
            .bind(obj_id)
            .execute(&mut self.conn)
            .await?;
        Ok(())
    }

    pub async fn delete_object_row(&mut self, obj_id: i64) -> FsResult<()> {
        sqlx::query("DELETE FROM objects WHERE id=?")
            .bind(obj_id)
            .execute(&mut self.conn)
            .await?;
        Ok(())
    }

    pub async fn set_object_phys_size(&mut self, obj_id: i64, phys_size: i64) -> FsResult<()> {
        sqlx::query("UPDATE objects SET phys_size=? WHERE id=?")
            .bind(phys_size)
            .bind(obj_id)
            .execute(&mut self.conn)
            .await?;
        Ok(())
    }

    /// Forget the content hash of an object whose upload failed, so no new
    /// block ever dedups against it. The rows themselves must stay: their
    /// ids may be referenced from inode_blocks.
    pub async fn invalidate_object_hash(&mut self, obj_id: i64) -> FsResult<()> {
        sqlx::query("UPDATE blocks SET hash=NULL WHERE obj_id=?")
            .bind(obj_id)
            .execute(&mut self.conn)
            .await?;
        sqlx::query("UPDATE objects SET hash=NULL WHERE id=?")
            .bind(obj_id)
            .execute(&mut self.conn)
            .await?;
        Ok(())
    }

    // ------------------------------------------------------------------
    // deferred deletions

    pub async fn queue_object_deletion(&mut self, obj_id: i64) -> FsResult<()> {
        sqlx::query("INSERT OR IGNORE INTO objects_to_delete (obj_id) VALUES (?)")
            .bind(obj_id)
            .execute(&mut self.conn)
            .await?;
        Ok(())
    }

    /// Pop up to `limit` queued deletions.
    pub async fn pop_object_deletions(&mut self, limit: i64) -> FsResult<Vec<i64>> {
        let rows = sqlx::query("SELECT obj_id FROM objects_to_delete LIMIT ?")
            .bind(limit)
            .fetch_all(&mut self.conn)
            .await?;
        let ids: Vec<i64> = rows.into_iter().map(|r| r.get(0)).collect();
        for id in &ids {
            sqlx::query("DELETE FROM objects_to_delete WHERE obj_id=?")
                .bind(id)
                .execute(&mut self.conn)
                .await?;
        }
        Ok(ids)
    }

    pub async fn deletion_queue_len(&mut self) -> FsResult<i64> {
        let row = sqlx::query("SELECT COUNT(*) FROM objects_to_delete")
            .fetch_one(&mut self.conn)
            .await?;
        Ok(row.get(0))
    }

    // ------------------------------------------------------------------
    // statistics

    pub async fn entry_count(&mut self) -> FsResult<i64> {
        let row = sqlx::query("SELECT COUNT(*) FROM inodes")
            .fetch_one(&mut self.conn)
            .await?;
        Ok(row.get(0))
    }

    /// Total bytes stored in the backend (encoded object sizes).
    pub async fn stored_bytes(&mut self) -> FsResult<i64> {
        let row = sqlx::query(
            "SELECT COALESCE(SUM(CASE WHEN phys_size > 0 THEN phys_size ELSE length END), 0) \
             FROM objects",
        )
        .fetch_one(&mut self.conn)
        .await?;
        Ok(row.get(0))
    }
}

/// Create a fresh metadata database: schema, root directory and `lost+found`.
pub async fn init_filesystem_db(conn: &mut Connection, uid: u32, gid: u32) -> FsResult<()> {
    conn.create_tables().await?;
    conn.begin().await?;
    let root = conn
        .create_inode(NewInode {
            mode: libc::S_IFDIR | 0o755,
            uid,
            gid,
            rdev: 0,
            refcount: 1,
            size: 0,
        })
        .await?;
    debug_assert_eq!(root, ROOT_INODE);
    let lf = conn
        .create_inode(NewInode {
            mode: libc::S_IFDIR | 0o700,
            uid,
            gid,
            rdev: 0,
            refcount: 1,
            size: 0,
        })
        .await?;
    let name_id = conn.intern_name(b"lost+found").await?;
    conn.insert_entry(ROOT_INODE, name_id, lf).await?;
    conn.commit().await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn test_db() -> (Connection, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("meta.db");
        let mut conn = Connection::open(&path).await.unwrap();
        init_filesystem_db(&mut conn, 0, 0).await.unwrap();
        (conn, dir)
    }

    #[tokio::test]
    async fn test_init_creates_root_and_lost_found() {
        let (mut conn, _dir) = test_db().await;
        let root = conn.get_inode(ROOT_INODE).await.unwrap().unwrap();
        assert!(root.is_dir());

        let lf = conn
            .lookup_entry(ROOT_INODE, b"lost+found")
            .await
            .unwrap()
            .unwrap();
        assert!(conn.get_inode(lf).await.unwrap().unwrap().is_dir());
    }

    #[tokio::test]
    async fn test_name_interning_refcounts() {
        let (mut conn, _dir) = test_db().await;
        let a = conn.intern_name(b"shared").await.unwrap();
        let b = conn.intern_name(b"shared").await.unwrap();
        assert_eq!(a, b);

        conn.release_name(a).await.unwrap();
        assert_eq!(conn.name_id(b"shared").await.unwrap(), Some(a));
        conn.release_name(a).await.unwrap();
        assert_eq!(conn.name_id(b"shared").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_block_dedup_lookup() {
        let (mut conn, _dir) = test_db().await;
        let hash = [0xabu8; 32];
        let obj = conn.create_object(&hash, 100).await.unwrap();
        let block = conn.create_block(&hash, 100, obj).await.unwrap();

        assert_eq!(
            conn.find_block_by_hash(&hash).await.unwrap(),
            Some(block)
        );
        conn.invalidate_object_hash(obj).await.unwrap();
        assert_eq!(conn.find_block_by_hash(&hash).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_deletion_queue_roundtrip() {
        let (mut conn, _dir) = test_db().await;
        for id in [3i64, 5, 9] {
            conn.queue_object_deletion(id).await.unwrap();
        }
        assert_eq!(conn.deletion_queue_len().await.unwrap(), 3);
        let popped = conn.pop_object_deletions(2).await.unwrap();
        assert_eq!(popped.len(), 2);
        assert_eq!(conn.deletion_queue_len().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_transaction_rollback() {
        let (mut conn, _dir) = test_db().await;
        conn.begin().await.unwrap();
        let id = conn.intern_name(b"doomed").await.unwrap();
        conn.rollback().await.unwrap();
        assert_eq!(conn.name_id(b"doomed").await.unwrap(), None);
        let _ = id;
    }
}
