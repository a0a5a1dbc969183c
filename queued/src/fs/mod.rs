//! File-system-related stuff.

use futures::{future::BoxFuture, FutureExt, StreamExt};
use std::path::Path;
use tokio::fs::read_dir;
use tokio_stream::wrappers::ReadDirStream;

/// Remove `path` and everything below it. A missing directory counts as
/// removed.
pub fn ensure_removed_dir(path: &Path) -> BoxFuture<Result<(), std::io::Error>> {
    async move {
        let dir = match read_dir(path).await {
            Ok(dir) => dir,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
            Err(e) => return Err(e),
        };
        ReadDirStream::new(dir)
            .filter_map(|x| async move {
                let x = x.ok()?;
                // Symlinks are removed as plain entries, never followed.
                match x.file_type().await {
                    Ok(t) if t.is_dir() => Some(x.path()),
                    _ => None,
                }
            })
            .map(|x| async move { ensure_removed_dir(&x).await })
            .buffered(16usize)
            .for_each(|_| async {})
            .await;
        let res = match tokio::fs::remove_dir_all(path).await {
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            res => res,
        };
        if let Err(e) = &res {
            tracing::error!("{:?}: {}", path, e);
        }
        res
    }
    .boxed()
}
