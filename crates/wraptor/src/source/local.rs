//! Files from a local directory.

use std::path::{Path, PathBuf};

use walkdir::WalkDir;
use wraptor_common::{WrapError, WrapResult};
use wraptor_image::NamedStream;

/// Every regular file below a directory.
#[derive(Debug, Clone)]
pub struct LocalSource {
    root: PathBuf,
}

impl LocalSource {
    /// Source rooted at `root`.
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Root directory.
    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Relative (`/` separated) names and paths of all files, sorted by name.
    pub fn files(&self) -> WrapResult<Vec<(String, PathBuf)>> {
        let display = self.root.display().to_string();
        if !self.root.is_dir() {
            return Err(WrapError::source_error(display, "not a directory"));
        }

        let mut files = Vec::new();
        for entry in WalkDir::new(&self.root).follow_links(true) {
            let entry = entry.map_err(|e| WrapError::source_error(&display, e.to_string()))?;
            if !entry.file_type().is_file() {
                continue;
            }
            let relative = entry
                .path()
                .strip_prefix(&self.root)
                .map_err(|e| WrapError::source_error(&display, e.to_string()))?;
            let name = relative
                .components()
                .map(|c| c.as_os_str().to_string_lossy())
                .collect::<Vec<_>>()
                .join("/");
            files.push((name, entry.into_path()));
        }
        files.sort_by(|a, b| a.0.cmp(&b.0));

        if files.is_empty() {
            return Err(WrapError::source_error(display, "no files found"));
        }
        Ok(files)
    }

    /// Open every file as a stream.
    pub async fn load(&self) -> WrapResult<Vec<NamedStream>> {
        let files = self.files()?;
        tracing::info!(root = %self.root.display(), files = files.len(), "Loading local files");

        let mut streams = Vec::with_capacity(files.len());
        for (name, path) in files {
            tracing::debug!(name = %name, path = %path.display(), "Opening file");
            streams.push(NamedStream::open(&path, name).await?);
        }
        Ok(streams)
    }
}
