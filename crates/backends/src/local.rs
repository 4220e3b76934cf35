//! Backend storing objects as files in a local directory.
//!
//! Mostly useful for testing and for network filesystems mounted by other
//! means. Keys are escaped so that arbitrary printable keys map to a flat set
//! of file names; writes go to a temporary file that is renamed into place so
//! that readers never observe a partial object.

use async_trait::async_trait;
use bytes::Bytes;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::{BackendError, ObjectBackend, RetryPolicy};

pub struct LocalBackend {
    root: PathBuf,
}

impl LocalBackend {
    /// Open a backend rooted at an existing directory.
    pub fn open(root: &Path) -> Result<Self, BackendError> {
        if !root.is_dir() {
            return Err(BackendError::InvalidUrl(format!(
                "no such directory: {}",
                root.display()
            )));
        }
        Ok(Self {
            root: root.to_path_buf(),
        })
    }

    fn key_to_path(&self, key: &str) -> PathBuf {
        self.root.join(escape(key))
    }
}

fn escape(key: &str) -> String {
    let mut out = String::with_capacity(key.len());
    for b in key.bytes() {
        match b {
            b'a'..=b'z' | b'A'..=b'Z' | b'0'..=b'9' | b'_' | b'-' | b'.' => {
                out.push(b as char);
            }
            _ => out.push_str(&format!("%{b:02x}")),
        }
    }
    out
}

fn unescape(name: &str) -> Option<String> {
    let mut out = Vec::with_capacity(name.len());
    let mut bytes = name.bytes();
    while let Some(b) = bytes.next() {
        if b == b'%' {
            let hi = bytes.next()?;
            let lo = bytes.next()?;
            let hex = [hi, lo];
            let hex = std::str::from_utf8(&hex).ok()?;
            out.push(u8::from_str_radix(hex, 16).ok()?);
        } else {
            out.push(b);
        }
    }
    String::from_utf8(out).ok()
}

// '#' never appears in an escaped key, so temporary files cannot collide
// with stored objects or with writes to other keys.
fn tmp_path(path: &Path) -> PathBuf {
    let mut name = path.as_os_str().to_owned();
    name.push(format!("#{}.tmp", std::process::id()));
    PathBuf::from(name)
}

fn map_not_found(e: std::io::Error, key: &str) -> BackendError {
    if e.kind() == std::io::ErrorKind::NotFound {
        BackendError::NoSuchObject(key.to_string())
    } else {
        BackendError::Io(e)
    }
}

#[async_trait]
impl ObjectBackend for LocalBackend {
    async fn lookup(&self, key: &str) -> Result<u64, BackendError> {
        let meta = tokio::fs::metadata(self.key_to_path(key))
            .await
            .map_err(|e| map_not_found(e, key))?;
        Ok(meta.len())
    }

    async fn get(&self, key: &str) -> Result<Bytes, BackendError> {
        let data = tokio::fs::read(self.key_to_path(key))
            .await
            .map_err(|e| map_not_found(e, key))?;
        Ok(Bytes::from(data))
    }

    async fn put(&self, key: &str, data: Bytes) -> Result<u64, BackendError> {
        let path = self.key_to_path(key);
        let tmp = tmp_path(&path);
        tokio::fs::write(&tmp, &data).await?;
        tokio::fs::rename(&tmp, &path).await?;
        Ok(data.len() as u64)
    }

    async fn delete(&self, key: &str) -> Result<(), BackendError> {
        tokio::fs::remove_file(self.key_to_path(key))
            .await
            .map_err(|e| map_not_found(e, key))
    }

    async fn list(&self, prefix: &str) -> Result<Vec<String>, BackendError> {
        let mut keys = Vec::new();
        let mut dir = tokio::fs::read_dir(&self.root).await?;
        while let Some(entry) = dir.next_entry().await? {
            let name = entry.file_name();
            let Some(name) = name.to_str() else { continue };
            if name.contains('#') {
                // In-flight or orphaned temporary file.
                continue;
            }
            let Some(key) = unescape(name) else {
                tracing::warn!(name, "ignoring unparseable file in backend directory");
                continue;
            };
            if key.starts_with(prefix) {
                keys.push(key);
            }
        }
        Ok(keys)
    }

    async fn copy(&self, src: &str, dst: &str) -> Result<(), BackendError> {
        let dst_path = self.key_to_path(dst);
        let tmp = tmp_path(&dst_path);
        tokio::fs::copy(self.key_to_path(src), &tmp)
            .await
            .map_err(|e| map_not_found(e, src))?;
        tokio::fs::rename(&tmp, &dst_path).await?;
        Ok(())
    }

    async fn rename(&self, src: &str, dst: &str) -> Result<(), BackendError> {
        tokio::fs::rename(self.key_to_path(src), self.key_to_path(dst))
            .await
            .map_err(|e| map_not_found(e, src))
    }

    fn retry_policy(&self) -> RetryPolicy {
        // Local I/O errors are never transient, so retries would only delay
        // the inevitable.
        RetryPolicy {
            initial_interval: Duration::from_millis(1),
            max_interval: Duration::from_millis(1),
            timeout: Duration::ZERO,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_put_get_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let backend = LocalBackend::open(dir.path()).unwrap();

        backend
            .put("s3ql_data_42", Bytes::from_static(b"hello"))
            .await
            .unwrap();
        assert_eq!(
            backend.get("s3ql_data_42").await.unwrap(),
            Bytes::from_static(b"hello")
        );
        assert_eq!(backend.lookup("s3ql_data_42").await.unwrap(), 5);
    }

    #[tokio::test]
    async fn test_missing_object() {
        let dir = tempfile::tempdir().unwrap();
        let backend = LocalBackend::open(dir.path()).unwrap();
        assert!(matches!(
            backend.get("nope").await,
            Err(BackendError::NoSuchObject(_))
        ));
        assert!(matches!(
            backend.delete("nope").await,
            Err(BackendError::NoSuchObject(_))
        ));
    }

    #[tokio::test]
    async fn test_list_with_funny_keys() {
        let dir = tempfile::tempdir().unwrap();
        let backend = LocalBackend::open(dir.path()).unwrap();

        backend
            .put("s3ql_seq_no_3", Bytes::new())
            .await
            .unwrap();
        backend
            .put("with space/and slash", Bytes::from_static(b"x"))
            .await
            .unwrap();

        let mut all = backend.list("").await.unwrap();
        all.sort();
        assert_eq!(all, vec!["s3ql_seq_no_3", "with space/and slash"]);

        let seq = backend.list("s3ql_seq_no_").await.unwrap();
        assert_eq!(seq, vec!["s3ql_seq_no_3"]);
    }

    #[tokio::test]
    async fn test_rename_and_copy() {
        let dir = tempfile::tempdir().unwrap();
        let backend = LocalBackend::open(dir.path()).unwrap();

        backend.put("a", Bytes::from_static(b"1")).await.unwrap();
        backend.copy("a", "b").await.unwrap();
        backend.rename("a", "c").await.unwrap();

        assert!(!backend.contains("a").await.unwrap());
        assert_eq!(backend.get("b").await.unwrap(), Bytes::from_static(b"1"));
        assert_eq!(backend.get("c").await.unwrap(), Bytes::from_static(b"1"));
    }
}
