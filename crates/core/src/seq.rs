//! Mount-exclusion protocol.
//!
//! Every mount (and every fsck) claims the next sequence number by writing a
//! zero-byte marker object `s3ql_seq_no_<N>`. After a consistency-window
//! delay the listing is checked again: a higher marker we did not write means
//! another client mounted concurrently. The parameter object records the
//! sequence number of the last *clean* shutdown, so a gap between the two
//! reveals a crashed mount.

use crate::SEQNO_PREFIX;
use crate::error::{FsError, FsResult};
use s3ql_backends::ObjectBackend;

fn seq_key(n: u64) -> String {
    format!("{SEQNO_PREFIX}{n}")
}

fn parse_seq_keys(keys: &[String]) -> Vec<u64> {
    keys.iter()
        .filter_map(|k| k[SEQNO_PREFIX.len()..].parse().ok())
        .collect()
}

/// Highest sequence marker present at the backend.
pub async fn highest_seq_no(backend: &dyn ObjectBackend) -> FsResult<u64> {
    let keys = backend.list(SEQNO_PREFIX).await?;
    parse_seq_keys(&keys)
        .into_iter()
        .max()
        .ok_or_else(|| FsError::Corruption("no sequence markers found".into()))
}

/// Claim the next sequence number. Returns the claimed number, or
/// `AlreadyMounted` if another client claimed a higher one inside the
/// consistency window.
pub async fn claim_next_seq_no(
    backend: &dyn ObjectBackend,
    consistency_delay: std::time::Duration,
) -> FsResult<u64> {
    let highest = highest_seq_no(backend).await?;
    let ours = highest + 1;
    backend.put(&seq_key(ours), bytes::Bytes::new()).await?;

    tokio::time::sleep(consistency_delay).await;

    let seen = parse_seq_keys(&backend.list(SEQNO_PREFIX).await?);
    if seen.iter().any(|&n| n > ours) {
        return Err(FsError::AlreadyMounted);
    }

    // Garbage-collect markers that are well in the past.
    let stale: Vec<String> = seen
        .iter()
        .filter(|&&n| n + 10 < ours)
        .map(|&n| seq_key(n))
        .collect();
    if !stale.is_empty() {
        backend.delete_multi(&stale).await?;
    }

    Ok(ours)
}

/// Write the very first marker of a fresh filesystem.
pub async fn write_initial_seq_no(backend: &dyn ObjectBackend) -> FsResult<()> {
    backend.put(&seq_key(0), bytes::Bytes::new()).await?;
    Ok(())
}

/// Retract a claimed marker again. A mount that is *refused* (rather than
/// crashed) must not leave a gap in the sequence trail.
pub async fn release_seq_no(backend: &dyn ObjectBackend, n: u64) -> FsResult<()> {
    match backend.delete(&seq_key(n)).await {
        Ok(()) | Err(s3ql_backends::BackendError::NoSuchObject(_)) => Ok(()),
        Err(e) => Err(e.into()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use s3ql_backends::MemBackend;
    use std::time::Duration;

    #[tokio::test]
    async fn test_claim_increments() {
        let backend = MemBackend::new();
        write_initial_seq_no(&backend).await.unwrap();

        let a = claim_next_seq_no(&backend, Duration::ZERO).await.unwrap();
        assert_eq!(a, 1);
        let b = claim_next_seq_no(&backend, Duration::ZERO).await.unwrap();
        assert_eq!(b, 2);
        assert_eq!(highest_seq_no(&backend).await.unwrap(), 2);
    }

    #[tokio::test]
    async fn test_concurrent_claim_detected() {
        let backend = MemBackend::new();
        write_initial_seq_no(&backend).await.unwrap();

        // A second mounter writes a higher marker inside our consistency
        // window; the claim must abort.
        let claim = claim_next_seq_no(&backend, Duration::from_millis(50));
        let inject = async {
            tokio::time::sleep(Duration::from_millis(10)).await;
            backend
                .put("s3ql_seq_no_9", bytes::Bytes::new())
                .await
                .unwrap();
        };
        let (res, ()) = tokio::join!(claim, inject);
        assert!(matches!(res, Err(FsError::AlreadyMounted)));
    }

    #[tokio::test]
    async fn test_old_markers_are_collected() {
        let backend = MemBackend::new();
        for n in 0..15u64 {
            backend
                .put(&format!("s3ql_seq_no_{n}"), bytes::Bytes::new())
                .await
                .unwrap();
        }
        let claimed = claim_next_seq_no(&backend, Duration::ZERO).await.unwrap();
        assert_eq!(claimed, 15);

        let left = backend.list(SEQNO_PREFIX).await.unwrap();
        assert!(!left.contains(&"s3ql_seq_no_0".to_string()));
        assert!(left.contains(&"s3ql_seq_no_15".to_string()));
    }
}
