//! Operations related to TAR archives

use std::{
    future::Future,
    io,
    path::{Path, PathBuf},
    pin::Pin,
};

use futures::FutureExt;
use tokio::io::AsyncWrite;
use tokio_tar::{Builder, Header};

/// Pack everything below `root` into an in-memory tar archive.
///
/// Entries are named relative to `root`. Symbolic links are skipped.
pub async fn archive_dir(root: &Path) -> io::Result<Vec<u8>> {
    let mut tar = Builder::new(Vec::new());
    add_dir(root, root.to_owned(), &mut tar).await?;
    tar.into_inner().await
}

fn add_dir<'a, W: AsyncWrite + Send + Unpin + 'static>(
    root: &'a Path,
    dir: PathBuf,
    tar: &'a mut Builder<W>,
) -> Pin<Box<dyn Future<Output = io::Result<()>> + Send + 'a>> {
    async move {
        let mut read_dir = tokio::fs::read_dir(&dir).await?;
        let mut entries = vec![];
        while let Some(next) = read_dir.next_entry().await? {
            entries.push(next.path());
        }
        entries.sort();

        for path in entries {
            let meta = tokio::fs::symlink_metadata(&path).await?;
            let name = path
                .strip_prefix(root)
                .map_err(|e| io::Error::new(io::ErrorKind::Other, e))?;

            if meta.file_type().is_symlink() {
                tracing::debug!("Skipping symlink {} in archive", path.display());
            } else if meta.is_dir() {
                let mut header = Header::new_gnu();
                header.set_metadata(&meta);
                tar.append_data(&mut header, name, tokio::io::empty()).await?;
                add_dir(root, path, tar).await?;
            } else if meta.is_file() {
                let mut file = tokio::fs::File::open(&path).await?;
                let mut header = Header::new_gnu();
                header.set_metadata(&meta);
                tar.append_data(&mut header, name, &mut file).await?;
            }
        }
        Ok(())
    }
    .boxed()
}
