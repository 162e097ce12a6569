//! Where the files to wrap come from.

pub mod huggingface;
pub mod local;

use std::path::Path;

use tokio_util::sync::CancellationToken;
use wraptor_common::{WrapError, WrapResult};
use wraptor_image::NamedStream;

pub use huggingface::HuggingFaceSource;
pub use local::LocalSource;

/// A set of files to wrap.
#[derive(Debug, Clone)]
pub enum Source {
    /// A directory on disk.
    Local(LocalSource),
    /// A Hugging Face model repository.
    HuggingFace(HuggingFaceSource),
}

/// Options for remote sources.
#[derive(Debug, Clone)]
pub struct SourceOptions {
    /// Cache directory for downloads.
    pub cache_dir: std::path::PathBuf,
    /// Revision of a remote repository.
    pub revision: String,
    /// Access token for a remote repository.
    pub token: Option<String>,
    /// Parallel downloads.
    pub max_concurrency: usize,
}

impl Source {
    /// An existing path is a local directory; anything else is taken as a
    /// Hugging Face repository id.
    pub fn detect(source: &str, options: &SourceOptions) -> WrapResult<Self> {
        if source.trim().is_empty() {
            return Err(WrapError::source_error(source, "source is empty"));
        }
        if Path::new(source).exists() {
            return Ok(Self::Local(LocalSource::new(source)));
        }

        let hf = HuggingFaceSource::new(source, &options.cache_dir)?
            .with_revision(&options.revision)
            .with_token(options.token.clone())
            .with_max_concurrency(options.max_concurrency);
        Ok(Self::HuggingFace(hf))
    }

    /// Open every file of the source.
    pub async fn load(&self, cancel: &CancellationToken) -> WrapResult<Vec<NamedStream>> {
        match self {
            Self::Local(local) => local.load().await,
            Self::HuggingFace(hf) => hf.load(cancel).await,
        }
    }
}
