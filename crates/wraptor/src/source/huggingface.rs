//! Files from a Hugging Face model repository.
//!
//! Files are downloaded into a cache directory unique to the repository and
//! revision, then opened as streams. Files already in the cache with the
//! expected size are not downloaded again.

use std::path::{Component, Path, PathBuf};

use futures::{StreamExt, TryStreamExt};
use reqwest::Client;
use serde::Deserialize;
use sha2::{Digest, Sha256};
use tokio::io::AsyncWriteExt;
use tokio_util::sync::CancellationToken;
use wraptor_common::{WrapError, WrapResult};
use wraptor_image::NamedStream;

/// Hub endpoint used unless `HF_ENDPOINT` says otherwise.
pub const DEFAULT_ENDPOINT: &str = "https://huggingface.co";
/// Branch downloaded by default.
pub const DEFAULT_REVISION: &str = "main";
/// Parallel downloads by default.
pub const DEFAULT_MAX_CONCURRENCY: usize = 5;

#[derive(Debug, Deserialize)]
struct ModelInfo {
    #[serde(default)]
    siblings: Vec<Sibling>,
}

#[derive(Debug, Deserialize)]
struct Sibling {
    rfilename: String,
    #[serde(default)]
    size: Option<u64>,
}

/// A file listed in the repository.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteFile {
    /// Path inside the repository.
    pub name: String,
    /// Size, when the hub reports it.
    pub size: Option<u64>,
}

/// Cache subdirectory for one repository revision.
#[must_use]
pub fn cache_key(repo_id: &str, revision: &str) -> String {
    let hash = Sha256::digest(format!("{repo_id}:{revision}").as_bytes());
    hex::encode(&hash[..16])
}

/// A Hugging Face model repository at a fixed revision.
#[derive(Debug, Clone)]
pub struct HuggingFaceSource {
    repo_id: String,
    revision: String,
    endpoint: String,
    cache_root: PathBuf,
    max_concurrency: usize,
    token: Option<String>,
    client: Client,
}

impl HuggingFaceSource {
    /// Source for `repo_id`, caching under `cache_root`.
    pub fn new(repo_id: impl Into<String>, cache_root: impl Into<PathBuf>) -> WrapResult<Self> {
        let client = Client::builder()
            .user_agent(concat!("wraptor/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| WrapError::Internal {
                message: format!("Failed to build HTTP client: {e}"),
            })?;
        let endpoint = std::env::var("HF_ENDPOINT").unwrap_or_else(|_| DEFAULT_ENDPOINT.to_string());

        Ok(Self {
            repo_id: repo_id.into(),
            revision: DEFAULT_REVISION.to_string(),
            endpoint,
            cache_root: cache_root.into(),
            max_concurrency: DEFAULT_MAX_CONCURRENCY,
            token: None,
            client,
        })
    }

    /// Download a branch, tag or commit other than `main`.
    #[must_use]
    pub fn with_revision(mut self, revision: impl Into<String>) -> Self {
        self.revision = revision.into();
        self
    }

    /// Access token for gated or private repositories.
    #[must_use]
    pub fn with_token(mut self, token: Option<String>) -> Self {
        self.token = token.filter(|t| !t.is_empty());
        self
    }

    /// Maximum parallel downloads (at least one).
    #[must_use]
    pub fn with_max_concurrency(mut self, max: usize) -> Self {
        self.max_concurrency = max.max(1);
        self
    }

    /// Hub endpoint (`https://huggingface.co` or a mirror).
    #[must_use]
    pub fn with_endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.endpoint = endpoint.into().trim_end_matches('/').to_string();
        self
    }

    /// HTTP client to use.
    #[must_use]
    pub fn with_client(mut self, client: Client) -> Self {
        self.client = client;
        self
    }

    /// Repository id (`org/name`).
    #[must_use]
    pub fn repo_id(&self) -> &str {
        &self.repo_id
    }

    /// Cache directory of this repository revision.
    #[must_use]
    pub fn cache_dir(&self) -> PathBuf {
        self.cache_root
            .join(cache_key(&self.repo_id, &self.revision))
    }

    fn error(&self, message: impl Into<String>) -> WrapError {
        WrapError::source_error(&self.repo_id, message)
    }

    fn get(&self, url: &str) -> reqwest::RequestBuilder {
        let request = self.client.get(url);
        match &self.token {
            Some(token) => request.bearer_auth(token),
            None => request,
        }
    }

    /// Files in the repository at this revision, sorted by name.
    pub async fn list_files(&self) -> WrapResult<Vec<RemoteFile>> {
        let url = format!(
            "{}/api/models/{}/revision/{}?blobs=true",
            self.endpoint, self.repo_id, self.revision
        );
        tracing::debug!(url = %url, "Listing repository files");

        let response = self
            .get(&url)
            .send()
            .await
            .map_err(|e| self.error(format!("failed to list files: {e}")))?;
        let status = response.status();
        if !status.is_success() {
            return Err(self.error(format!("listing files returned {status}")));
        }
        let info: ModelInfo = response
            .json()
            .await
            .map_err(|e| self.error(format!("unexpected repository info: {e}")))?;

        let mut files: Vec<RemoteFile> = info
            .siblings
            .into_iter()
            .map(|s| RemoteFile {
                name: s.rfilename,
                size: s.size,
            })
            .collect();
        files.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(files)
    }

    /// Download every file (reusing cached ones) and open them as streams.
    pub async fn load(&self, cancel: &CancellationToken) -> WrapResult<Vec<NamedStream>> {
        tokio::select! {
            biased;
            () = cancel.cancelled() => Err(WrapError::cancelled("source download")),
            result = self.load_inner() => result,
        }
    }

    async fn load_inner(&self) -> WrapResult<Vec<NamedStream>> {
        let files = self.list_files().await?;
        if files.is_empty() {
            return Err(self.error("no files found in repository"));
        }

        let dir = self.cache_dir();
        tokio::fs::create_dir_all(&dir).await.map_err(|e| {
            self.error(format!("failed to create cache directory {}: {e}", dir.display()))
        })?;

        tracing::info!(
            repo = %self.repo_id,
            revision = %self.revision,
            files = files.len(),
            cache = %dir.display(),
            "Downloading repository"
        );

        let paths: Vec<PathBuf> = futures::stream::iter(&files)
            .map(|file| self.fetch(file, &dir))
            .buffered(self.max_concurrency)
            .try_collect()
            .await?;

        let mut streams = Vec::with_capacity(files.len());
        for (file, path) in files.iter().zip(paths) {
            streams.push(NamedStream::open(&path, file.name.clone()).await?);
        }
        Ok(streams)
    }

    async fn fetch(&self, file: &RemoteFile, dir: &Path) -> WrapResult<PathBuf> {
        let relative = Path::new(&file.name);
        if file.name.is_empty()
            || !relative
                .components()
                .all(|c| matches!(c, Component::Normal(_)))
        {
            return Err(self.error(format!("refusing unsafe file name '{}'", file.name)));
        }
        let path = dir.join(relative);

        if let (Some(size), Ok(meta)) = (file.size, tokio::fs::metadata(&path).await) {
            if meta.is_file() && meta.len() == size {
                tracing::debug!(file = %file.name, "Using cached file");
                return Ok(path);
            }
        }
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await.map_err(|e| {
                self.error(format!("failed to create {}: {e}", parent.display()))
            })?;
        }

        let url = format!(
            "{}/{}/resolve/{}/{}",
            self.endpoint, self.repo_id, self.revision, file.name
        );
        tracing::debug!(file = %file.name, url = %url, "Downloading file");

        let response = self
            .get(&url)
            .send()
            .await
            .map_err(|e| self.error(format!("failed to download {}: {e}", file.name)))?;
        let status = response.status();
        if !status.is_success() {
            return Err(self.error(format!("downloading {} returned {status}", file.name)));
        }

        let mut partial = path.clone().into_os_string();
        partial.push(".partial");
        let partial = PathBuf::from(partial);
        let write_err = |e: std::io::Error| self.error(format!("failed to write {}: {e}", file.name));

        let mut out = tokio::fs::File::create(&partial).await.map_err(write_err)?;
        let mut body = response.bytes_stream();
        let mut written = 0u64;
        while let Some(chunk) = body.next().await {
            let chunk =
                chunk.map_err(|e| self.error(format!("failed to download {}: {e}", file.name)))?;
            written += chunk.len() as u64;
            out.write_all(&chunk).await.map_err(write_err)?;
        }
        out.flush().await.map_err(write_err)?;
        drop(out);

        if let Some(size) = file.size {
            if written != size {
                let _ = tokio::fs::remove_file(&partial).await;
                return Err(self.error(format!(
                    "{}: downloaded {written} bytes, expected {size}",
                    file.name
                )));
            }
        }
        tokio::fs::rename(&partial, &path).await.map_err(write_err)?;

        tracing::debug!(file = %file.name, bytes = written, "Downloaded file");
        Ok(path)
    }

    /// Remove this revision's cache directory.
    pub async fn cleanup(&self) -> WrapResult<()> {
        let dir = self.cache_dir();
        match tokio::fs::remove_dir_all(&dir).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(self.error(format!("failed to remove {}: {e}", dir.display()))),
        }
    }
}
