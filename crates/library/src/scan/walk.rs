use crate::error::{ErrorKind, Result};
use crate::event::{EventKind, MonitoredEvent};
use crate::filter::Filter;
use async_stream::stream;
use exn::ResultExt;
use futures::Stream;
use std::path::PathBuf;
use tokio::fs;

/// Yields every regular file below `directory` that passes `filter`, sorted by
/// name within each directory.
///
/// Subdirectories are only entered when `recursive` is set (and never hidden
/// ones). Symlinks are not followed. A directory that can't be read yields an
/// `Err` item; the walk carries on with the rest.
pub fn scan(directory: PathBuf, filter: Filter, recursive: bool) -> impl Stream<Item = Result<MonitoredEvent>> {
    stream!({
        let mut pending = vec![directory];
        while let Some(directory) = pending.pop() {
            let mut entries = match fs::read_dir(&directory).await {
                Ok(entries) => entries,
                Err(e) => {
                    yield Err::<MonitoredEvent, _>(e).or_raise(|| ErrorKind::Scan);
                    continue;
                },
            };
            let mut files = Vec::new();
            let mut subdirectories = Vec::new();
            loop {
                let entry = match entries.next_entry().await {
                    Ok(Some(entry)) => entry,
                    Ok(None) => break,
                    Err(e) => {
                        yield Err::<MonitoredEvent, _>(e).or_raise(|| ErrorKind::Scan);
                        break;
                    },
                };
                let path = entry.path();
                if !filter.accepts(&path) {
                    continue;
                }
                match entry.file_type().await {
                    Ok(t) if t.is_file() => files.push(path),
                    Ok(t) if t.is_dir() && recursive => subdirectories.push(path),
                    _ => {},
                }
            }
            files.sort();
            for path in files {
                yield Ok(MonitoredEvent::new(path, EventKind::Scanned));
            }
            // Reversed so that popping visits them in name order.
            subdirectories.sort_by(|a, b| b.cmp(a));
            pending.extend(subdirectories);
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::StreamExt;
    use std::path::Path;
    use tempfile::TempDir;

    fn tree() -> TempDir {
        let temp = TempDir::new().unwrap();
        let root = temp.path();
        for dir in ["a", "b", ".hidden", "a/nested"] {
            std::fs::create_dir_all(root.join(dir)).unwrap();
        }
        let files = [
            "z.pdf",
            "m.pdf",
            ".secret",
            "big.iso.crdownload",
            "a/one.pdf",
            "a/nested/two.pdf",
            "b/three.pdf",
            ".hidden/four.pdf",
        ];
        for file in files {
            std::fs::write(root.join(file), "x").unwrap();
        }
        temp
    }

    async fn names(root: &Path, recursive: bool) -> Vec<String> {
        scan(root.to_path_buf(), Filter::default(), recursive)
            .map(|event| {
                let event = event.unwrap();
                assert_eq!(event.kind, EventKind::Scanned);
                event.path.strip_prefix(root).unwrap().to_string_lossy().replace('\\', "/")
            })
            .collect()
            .await
    }

    #[tokio::test]
    async fn test_top_level_only() {
        let temp = tree();
        assert_eq!(names(temp.path(), false).await, ["m.pdf", "z.pdf"]);
    }

    #[tokio::test]
    async fn test_recursive() {
        let temp = tree();
        assert_eq!(names(temp.path(), true).await, ["m.pdf", "z.pdf", "a/one.pdf", "a/nested/two.pdf", "b/three.pdf"]);
    }

    #[tokio::test]
    async fn test_restartable() {
        let temp = tree();
        assert_eq!(names(temp.path(), false).await, names(temp.path(), false).await);
    }

    #[tokio::test]
    async fn test_missing_directory_yields_error() {
        let temp = TempDir::new().unwrap();
        let results: Vec<_> = scan(temp.path().join("missing"), Filter::default(), false).collect().await;
        assert_eq!(results.len(), 1);
        assert_eq!(**results[0].as_ref().unwrap_err(), ErrorKind::Scan);
    }
}
