//! File-state fingerprints and the stat snapshot they are derived from.

use sha2::{Digest, Sha256};
use std::fs::Metadata;
use std::io;
use std::path::Path;
use std::time::{Duration, UNIX_EPOCH};

const FIELD_SEPARATOR: [u8; 1] = [0x1f];

/// The two stat fields that define a file's state for change detection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FileStat {
    pub mtime_ns: i64,
    pub size: u64,
}

impl FileStat {
    pub fn from_metadata(metadata: &Metadata) -> io::Result<Self> {
        let modified = metadata.modified()?;
        let mtime_ns = match modified.duration_since(UNIX_EPOCH) {
            Ok(d) => d.as_nanos() as i64,
            Err(e) => -(e.duration().as_nanos() as i64),
        };
        Ok(Self {
            mtime_ns,
            size: metadata.len(),
        })
    }

    /// Stat `path` now, following symlinks.
    pub fn read(path: &Path) -> io::Result<Self> {
        Self::from_metadata(&std::fs::metadata(path)?)
    }
}

/// Digest of (path, mtime-nanoseconds, size).
///
/// Keys both the change journal and the metadata cache, so it must stay
/// stable across releases.
pub fn fingerprint(path: &str, mtime_ns: i64, size: u64) -> String {
    let mut hasher = Sha256::new();
    hasher.update(path.as_bytes());
    hasher.update(FIELD_SEPARATOR);
    hasher.update(mtime_ns.to_string().as_bytes());
    hasher.update(FIELD_SEPARATOR);
    hasher.update(size.to_string().as_bytes());
    format!("{:x}", hasher.finalize())
}

pub fn fingerprint_stat(path_key: &str, stat: &FileStat) -> String {
    fingerprint(path_key, stat.mtime_ns, stat.size)
}

/// Catalog identity of a path. Case-folded on platforms whose default
/// filesystems compare names case-insensitively.
pub fn path_key(path: &Path) -> String {
    let raw = path.to_string_lossy();
    if cfg!(any(windows, target_os = "macos")) {
        raw.replace('\\', "/").to_lowercase()
    } else {
        raw.into_owned()
    }
}

fn is_transient(err: &io::Error) -> bool {
    matches!(
        err.kind(),
        io::ErrorKind::Interrupted | io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut
    ) || err.raw_os_error() == Some(16) // EBUSY
}

/// Stat with bounded retry on transient OS errors, using linear backoff.
pub async fn stat_with_retry(path: &Path, attempts: u32, backoff: Duration) -> io::Result<FileStat> {
    let attempts = attempts.max(1);
    let mut attempt = 1;
    loop {
        match tokio::fs::metadata(path).await {
            Ok(metadata) => return FileStat::from_metadata(&metadata),
            Err(e) if attempt < attempts && is_transient(&e) => {
                tracing::debug!(path = %path.display(), attempt, error = %e, "Retrying stat");
                tokio::time::sleep(backoff * attempt).await;
                attempt += 1;
            }
            Err(e) => return Err(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_fingerprint_is_deterministic() {
        let a = fingerprint("/media/a.png", 1_700_000_000_123_456_789, 42);
        let b = fingerprint("/media/a.png", 1_700_000_000_123_456_789, 42);
        assert_eq!(a, b);
        assert_eq!(a.len(), 64);
    }

    #[test]
    fn test_fingerprint_changes_with_each_field() {
        let base = fingerprint("/media/a.png", 100, 42);
        assert_ne!(base, fingerprint("/media/b.png", 100, 42));
        assert_ne!(base, fingerprint("/media/a.png", 101, 42));
        assert_ne!(base, fingerprint("/media/a.png", 100, 43));
    }

    #[test]
    fn test_separator_prevents_field_bleed() {
        // "/x1" + "23" must not collide with "/x" + "123".
        assert_ne!(fingerprint("/x1", 23, 0), fingerprint("/x", 123, 0));
    }

    #[tokio::test]
    async fn test_stat_reports_size() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("a.png");
        std::fs::write(&path, b"12345").unwrap();

        let stat = stat_with_retry(&path, 3, Duration::from_millis(1)).await.unwrap();
        assert_eq!(stat.size, 5);
        assert_eq!(stat, FileStat::read(&path).unwrap());
    }

    #[tokio::test]
    async fn test_stat_missing_file_fails_without_retry_loop() {
        let dir = tempdir().unwrap();
        let err = stat_with_retry(&dir.path().join("gone.png"), 3, Duration::from_secs(10))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::NotFound);
    }
}
