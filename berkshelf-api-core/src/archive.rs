//! On-demand cookbook archives for the download endpoint.
//!
//! Archives are cached as `{root}/{name}-{version}.tar.gz`. A miss downloads the cookbook
//! through its owning worker into a scratch directory, packages it as `name/...`, and
//! moves the finished tarball into place in one rename.

use std::path::{Component, Path, PathBuf};

use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use tempfile::NamedTempFile;
use tracing::{debug, info};

use crate::error::ArchiveError;
use crate::model::{is_valid_cookbook_name, RemoteCookbook};
use crate::worker::WorkerHandle;

#[derive(Debug, Clone)]
pub struct ArchiveStore {
    root: PathBuf,
}

impl ArchiveStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn archive_path(&self, name: &str, version: &str) -> PathBuf {
        self.root.join(archive_file_name(name, version))
    }

    /// Path to a tarball of `remote`, downloading it first on a miss or when `nocache` is set.
    pub async fn fetch(
        &self,
        worker: &WorkerHandle,
        remote: &RemoteCookbook,
        nocache: bool,
    ) -> Result<PathBuf, ArchiveError> {
        for part in [remote.name(), remote.version()] {
            if !is_valid_cookbook_name(part) {
                return Err(ArchiveError::UnsafeName(part.to_string()));
            }
        }
        let target = self.archive_path(remote.name(), remote.version());
        if !nocache && tokio::fs::try_exists(&target).await? {
            debug!(path = %target.display(), "Archive cache hit");
            return Ok(target);
        }
        tokio::fs::create_dir_all(&self.root).await?;

        // Dropping the TempDir removes the scratch tree on every exit path.
        let scratch = tempfile::Builder::new()
            .prefix(&format!("{}-{}_", remote.name(), remote.version()))
            .tempdir_in(&self.root)?;
        let source_dir = scratch.path().join(remote.name());
        tokio::fs::create_dir_all(&source_dir).await?;

        info!(worker = %worker.name(), name = remote.name(), version = remote.version(), "Downloading cookbook for archive");
        worker.download(remote.clone(), source_dir.clone()).await?;

        let name = remote.name().to_string();
        let root = self.root.clone();
        let destination = target.clone();
        tokio::task::spawn_blocking(move || {
            let packaged = package(&source_dir, &name, &root)?;
            packaged
                .persist(&destination)
                .map_err(|e| ArchiveError::Io(e.error))?;
            Ok::<_, ArchiveError>(())
        })
        .await
        .map_err(|e| ArchiveError::Download(format!("packaging task failed: {e}")))??;
        drop(scratch);

        info!(path = %target.display(), "Archive ready");
        Ok(target)
    }
}

pub fn archive_file_name(name: &str, version: &str) -> String {
    format!("{name}-{version}.tar.gz")
}

/// Package `source_dir` as a gzip tarball whose entries live under `name/`.
///
/// The tarball is written to a temporary file in `temp_dir` and returned unpersisted.
pub fn package(source_dir: &Path, name: &str, temp_dir: &Path) -> Result<NamedTempFile, ArchiveError> {
    let file = NamedTempFile::new_in(temp_dir)?;
    let encoder = GzEncoder::new(file.reopen()?, Compression::default());
    let mut builder = tar::Builder::new(encoder);
    builder.follow_symlinks(false);
    builder.append_dir_all(name, source_dir)?;
    builder.into_inner()?.finish()?.sync_all()?;
    Ok(file)
}

/// Unpack a gzip tarball into `destination`, dropping the first path component of every entry.
///
/// Entries that would land outside `destination` are skipped.
pub fn unpack_stripped(bytes: &[u8], destination: &Path) -> Result<(), std::io::Error> {
    let mut archive = tar::Archive::new(GzDecoder::new(bytes));
    for entry in archive.entries()? {
        let mut entry = entry?;
        let path = entry.path()?.into_owned();
        let Some(relative) = strip_first_component(&path) else {
            continue;
        };
        let target = destination.join(&relative);
        if entry.header().entry_type().is_dir() {
            std::fs::create_dir_all(&target)?;
            continue;
        }
        if let Some(parent) = target.parent() {
            std::fs::create_dir_all(parent)?;
        }
        entry.unpack(&target)?;
    }
    Ok(())
}

fn strip_first_component(path: &Path) -> Option<PathBuf> {
    let mut components = path.components();
    components.next()?;
    let mut relative = PathBuf::new();
    for component in components {
        match component {
            Component::Normal(part) => relative.push(part),
            Component::CurDir => {}
            _ => return None,
        }
    }
    (!relative.as_os_str().is_empty()).then_some(relative)
}
