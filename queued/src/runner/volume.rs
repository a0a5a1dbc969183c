//! Host directories shared with sandboxes.

use std::{
    collections::BTreeMap,
    io,
    path::{Path, PathBuf},
};

use crate::util::path_security::enforce_plain_file_name;

/// Prefix of every volume directory created under the volume root.
pub const VOLUME_PREFIX: &str = "dockerVolume";

/// A freshly created host directory that is removed again on teardown.
///
/// [`HostVolume::teardown`] should be called explicitly; dropping the volume
/// removes the directory synchronously as a last resort.
#[derive(Debug)]
pub struct HostVolume {
    path: PathBuf,
    removed: bool,
}

impl HostVolume {
    /// Create a uniquely named directory below `root` with permissions `mode`.
    pub async fn create(root: &Path, mode: u32) -> io::Result<HostVolume> {
        tokio::fs::create_dir_all(root).await?;
        let path = loop {
            let path = root.join(format!("{}{:016x}", VOLUME_PREFIX, rand::random::<u64>()));
            match tokio::fs::create_dir(&path).await {
                Ok(()) => break path,
                Err(e) if e.kind() == io::ErrorKind::AlreadyExists => continue,
                Err(e) => return Err(e),
            }
        };
        let vol = HostVolume {
            path,
            removed: false,
        };
        set_mode(&vol.path, mode).await?;
        tracing::debug!("Created volume directory {}", vol.path.display());
        Ok(vol)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Write every `name -> content` pair directly into the volume root.
    pub async fn write_files(&self, files: &BTreeMap<String, String>) -> io::Result<()> {
        for (name, content) in files {
            enforce_plain_file_name(name)
                .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))?;
            tokio::fs::write(self.path.join(name), content).await?;
        }
        Ok(())
    }

    pub async fn teardown(&mut self) -> io::Result<()> {
        if self.removed {
            return Ok(());
        }
        self.removed = true;
        crate::fs::ensure_removed_dir(&self.path).await
    }
}

impl Drop for HostVolume {
    fn drop(&mut self) {
        if self.removed {
            return;
        }
        if let Err(e) = std::fs::remove_dir_all(&self.path) {
            if e.kind() != io::ErrorKind::NotFound {
                tracing::error!("Cannot remove volume {}: {}", self.path.display(), e);
            }
        }
    }
}

#[cfg(unix)]
async fn set_mode(path: &Path, mode: u32) -> io::Result<()> {
    use std::os::unix::fs::PermissionsExt;
    tokio::fs::set_permissions(path, std::fs::Permissions::from_mode(mode)).await
}

#[cfg(not(unix))]
async fn set_mode(_path: &Path, _mode: u32) -> io::Result<()> {
    Ok(())
}
