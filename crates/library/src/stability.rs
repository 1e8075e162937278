//! Waiting for a download to finish.
//!
//! Browsers keep writing to a file for a while after it first shows up. A
//! file is considered finished once two consecutive samples of its size and
//! modification time agree and it isn't empty.

use std::io::ErrorKind as IoErrorKind;
use std::path::Path;
use std::time::{Duration, SystemTime};
use tokio::fs;
use tracing::instrument;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Readiness {
    Stable { size: u64, modified: Option<SystemTime> },
    /// Still changing (or still empty) after every attempt.
    Unstable,
    Missing,
    NotAFile,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Sample {
    size: u64,
    modified: Option<SystemTime>,
}

async fn sample(path: &Path) -> Result<Sample, Readiness> {
    match fs::metadata(path).await {
        Ok(metadata) if metadata.is_file() => Ok(Sample { size: metadata.len(), modified: metadata.modified().ok() }),
        Ok(_) => Err(Readiness::NotAFile),
        Err(e) if e.kind() == IoErrorKind::NotFound => Err(Readiness::Missing),
        // Most likely a permission problem; treat like a file that isn't ready.
        Err(_) => Err(Readiness::Unstable),
    }
}

/// Samples `path` every `interval`, up to `attempts` times after the first
/// sample.
#[instrument(level = "debug", skip(interval))]
pub async fn wait_until_stable(path: &Path, interval: Duration, attempts: u32) -> Readiness {
    let mut previous = match sample(path).await {
        Ok(sample) => sample,
        Err(readiness) => return readiness,
    };
    for _ in 0..attempts {
        tokio::time::sleep(interval).await;
        let current = match sample(path).await {
            Ok(sample) => sample,
            Err(readiness) => return readiness,
        };
        if current == previous && current.size > 0 {
            return Readiness::Stable { size: current.size, modified: current.modified };
        }
        previous = current;
    }
    Readiness::Unstable
}

/// One more look right before acting: still there and unchanged since
/// `expected`?
pub async fn unchanged_since(path: &Path, expected: Readiness) -> bool {
    match (sample(path).await, expected) {
        (Ok(now), Readiness::Stable { size, modified }) => now == Sample { size, modified },
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;
    use tokio::io::AsyncWriteExt;

    const INTERVAL: Duration = Duration::from_millis(20);

    #[tokio::test]
    async fn test_finished_file_is_stable() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("done.pdf");
        fs::write(&path, b"%PDF-1.7").await.unwrap();

        let readiness = wait_until_stable(&path, INTERVAL, 3).await;
        assert!(matches!(readiness, Readiness::Stable { size: 8, .. }));
        assert!(unchanged_since(&path, readiness).await);
    }

    #[tokio::test]
    async fn test_empty_file_never_stabilizes() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("empty.pdf");
        fs::write(&path, b"").await.unwrap();
        assert_eq!(wait_until_stable(&path, INTERVAL, 2).await, Readiness::Unstable);
    }

    #[tokio::test]
    async fn test_missing_and_directory() {
        let temp = TempDir::new().unwrap();
        assert_eq!(wait_until_stable(&temp.path().join("nope"), INTERVAL, 2).await, Readiness::Missing);
        assert_eq!(wait_until_stable(temp.path(), INTERVAL, 2).await, Readiness::NotAFile);
    }

    #[tokio::test]
    async fn test_growing_file_is_unstable() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("growing.bin");
        let mut file = fs::File::create(&path).await.unwrap();
        file.write_all(b"start").await.unwrap();
        file.flush().await.unwrap();

        let writer = tokio::spawn(async move {
            for _ in 0..20 {
                file.write_all(b"more").await.unwrap();
                file.flush().await.unwrap();
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        });
        assert_eq!(wait_until_stable(&path, INTERVAL, 2).await, Readiness::Unstable);
        writer.await.unwrap();
    }

    #[tokio::test]
    async fn test_change_after_stable_is_noticed() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("a.txt");
        fs::write(&path, b"one").await.unwrap();
        let readiness = wait_until_stable(&path, INTERVAL, 3).await;
        fs::write(&path, b"three").await.unwrap();
        assert!(!unchanged_since(&path, readiness).await);
    }
}
