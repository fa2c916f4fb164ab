//! Transient local storage for uploads in flight.
//!
//! Every upload is written to its own UUID-named file before being handed to
//! the storage provider. A [`StagedFile`] owns that file: `release` removes it,
//! and dropping an unreleased one (error paths, cancelled requests) removes
//! it synchronously.

use std::io;
use std::path::{Path, PathBuf};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use uuid::Uuid;

/// Directory holding staged uploads.
#[derive(Debug)]
pub struct StagingArea {
    dir: PathBuf,
}

impl StagingArea {
    pub async fn new(dir: impl Into<PathBuf>) -> io::Result<Self> {
        let dir = dir.into();
        fs::create_dir_all(&dir).await?;
        Ok(Self { dir })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Write `bytes` to a fresh file in the staging directory.
    pub async fn stage(
        &self,
        bytes: &[u8],
        mime_type: &str,
        original_name: &str,
    ) -> io::Result<StagedFile> {
        let path = self.dir.join(Uuid::new_v4().simple().to_string());

        let mut file = fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&path)
            .await?;

        // Owned from here on, so a failed write is cleaned up too.
        let staged = StagedFile {
            path,
            mime_type: mime_type.to_string(),
            original_name: original_name.to_string(),
            size: bytes.len() as u64,
            released: false,
        };

        file.write_all(bytes).await?;
        file.flush().await?;

        tracing::debug!(path = %staged.path.display(), size = staged.size, "Staged upload");

        Ok(staged)
    }

    /// Remove files left behind by a previous process. Staged files never
    /// outlive a request, so anything present at startup is stale.
    pub async fn remove_leftovers(&self) -> io::Result<usize> {
        let mut removed = 0;
        let mut entries = fs::read_dir(&self.dir).await?;
        while let Some(entry) = entries.next_entry().await? {
            if entry.file_type().await?.is_file() {
                match fs::remove_file(entry.path()).await {
                    Ok(()) => removed += 1,
                    Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                    Err(e) => return Err(e),
                }
            }
        }
        Ok(removed)
    }
}

/// A staged upload. Removed from disk when released or dropped.
#[derive(Debug)]
pub struct StagedFile {
    path: PathBuf,
    mime_type: String,
    original_name: String,
    size: u64,
    released: bool,
}

impl StagedFile {
    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn mime_type(&self) -> &str {
        &self.mime_type
    }

    pub fn original_name(&self) -> &str {
        &self.original_name
    }

    pub fn size(&self) -> u64 {
        self.size
    }

    /// Delete the local copy.
    pub async fn release(mut self) -> io::Result<()> {
        self.released = true;
        match fs::remove_file(&self.path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e),
        }
    }
}

impl Drop for StagedFile {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        match std::fs::remove_file(&self.path) {
            Ok(()) => {
                tracing::debug!(path = %self.path.display(), "Removed staged upload on drop");
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => {
                tracing::warn!(
                    path = %self.path.display(),
                    error = %e,
                    "Failed to remove staged upload"
                );
            }
        }
    }
}
