//! OCI image layout writer.
//!
//! Produces the directory form of the OCI image layout: `oci-layout`,
//! `blobs/sha256/<hex>` and `index.json`. Writing into an existing layout
//! keeps its blobs but replaces the index with one naming only the new
//! image.

use std::path::{Path, PathBuf};

use sha2::{Digest, Sha256};
use tempfile::TempPath;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use wraptor_common::{WrapError, WrapResult};
use wraptor_oci::digest::{format_digest, sha256_hex};
use wraptor_oci::image::ManifestDescriptor;
use wraptor_oci::{Descriptor, ImageIndex};

use crate::image::{BlobForm, BlobInfo, FreshLayer, Image, LayerClaim};
use crate::stream::BoxReader;

const OCI_LAYOUT_FILE: &str = "oci-layout";
const OCI_LAYOUT_CONTENT: &str = r#"{"imageLayoutVersion":"1.0.0"}"#;
const INDEX_FILE: &str = "index.json";
const BLOBS_DIR: &str = "blobs/sha256";
const SINK: &str = "archive";

fn publish_error(message: impl Into<String>) -> WrapError {
    WrapError::publish(SINK, message)
}

/// A directory holding an OCI image layout.
#[derive(Debug, Clone)]
pub struct OciLayout {
    root: PathBuf,
}

impl OciLayout {
    /// Layout rooted at `root`. Nothing is touched until something is written.
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Root directory.
    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Path of a blob inside the layout.
    pub fn blob_path(&self, digest: &str) -> WrapResult<PathBuf> {
        let hex = sha256_hex(digest)
            .ok_or_else(|| publish_error(format!("unsupported digest {digest}")))?;
        Ok(self.root.join(BLOBS_DIR).join(hex))
    }

    /// Write every blob of `image` and a fresh `index.json` pointing at it.
    ///
    /// Layers nobody has streamed yet are compressed straight into the
    /// layout; the manifest and config follow once their digests are known.
    pub async fn write_image(&self, image: &Image) -> WrapResult<()> {
        tracing::info!(path = %self.root.display(), layers = image.layer_count(), "Writing OCI layout");

        let blobs = self.root.join(BLOBS_DIR);
        tokio::fs::create_dir_all(&blobs)
            .await
            .map_err(|e| publish_error(format!("failed to create {}: {e}", blobs.display())))?;
        self.write_file(OCI_LAYOUT_FILE, OCI_LAYOUT_CONTENT.as_bytes())
            .await?;

        for layer in image.base_layers() {
            let digest = &layer.info.descriptor.digest;
            if !self.has_blob(digest).await? {
                self.write_blob(digest, layer.open(SINK).await?).await?;
            }
        }

        let mut appended = Vec::with_capacity(image.appended_count());
        for index in 0..image.appended_count() {
            let info = match image.claim_layer(index).await? {
                LayerClaim::Fresh(fresh) => self.write_fresh(fresh).await?,
                LayerClaim::Streamed(streamed) => {
                    let digest = &streamed.info.descriptor.digest;
                    if !self.has_blob(digest).await? {
                        self.write_blob(digest, streamed.open(SINK).await?).await?;
                    }
                    streamed.info
                }
            };
            appended.push(info);
        }

        let documents = image.finalize(appended)?;
        self.write_blob(
            &documents.config_descriptor().digest,
            Box::pin(std::io::Cursor::new(documents.config_bytes().to_vec())),
        )
        .await?;
        self.write_blob(
            documents.digest(),
            Box::pin(std::io::Cursor::new(documents.manifest_bytes().to_vec())),
        )
        .await?;

        let mut index = ImageIndex::empty();
        #[allow(clippy::cast_possible_wrap)]
        index.manifests.push(ManifestDescriptor {
            descriptor: Descriptor::new(
                documents.manifest_media_type(),
                documents.digest(),
                documents.manifest_bytes().len() as i64,
            ),
            platform: Some(documents.platform()),
        });
        let bytes = serde_json::to_vec_pretty(&index)?;
        self.write_file(INDEX_FILE, &bytes).await?;

        tracing::info!(
            path = %self.root.display(),
            digest = %documents.digest(),
            "OCI layout written"
        );
        Ok(())
    }

    async fn has_blob(&self, digest: &str) -> WrapResult<bool> {
        let path = self.blob_path(digest)?;
        Ok(tokio::fs::try_exists(&path).await.unwrap_or(false))
    }

    async fn write_file(&self, name: &str, bytes: &[u8]) -> WrapResult<()> {
        let path = self.root.join(name);
        tokio::fs::write(&path, bytes)
            .await
            .map_err(|e| publish_error(format!("failed to write {}: {e}", path.display())))
    }

    /// A temporary file next to the blobs. It is removed unless persisted.
    fn partial_file(&self) -> WrapResult<(tokio::fs::File, TempPath)> {
        let blobs = self.root.join(BLOBS_DIR);
        let partial = tempfile::Builder::new()
            .prefix(".blob-")
            .suffix(".partial")
            .tempfile_in(&blobs)
            .map_err(|e| publish_error(format!("failed to create a file in {}: {e}", blobs.display())))?;
        let (file, path) = partial.into_parts();
        Ok((tokio::fs::File::from_std(file), path))
    }

    fn persist(&self, partial: TempPath, digest: &str) -> WrapResult<()> {
        let path = self.blob_path(digest)?;
        partial
            .persist(&path)
            .map_err(|e| publish_error(format!("failed to move blob {digest} into place: {e}")))
    }

    /// Compress a layer nobody has read yet into the layout.
    async fn write_fresh(&self, fresh: FreshLayer<'_>) -> WrapResult<BlobInfo> {
        let (mut file, partial) = self.partial_file()?;
        let info = fresh.stream_into(BlobForm::Compressed, &mut file, SINK).await?;
        file.flush()
            .await
            .map_err(|e| publish_error(format!("failed to write layer: {e}")))?;
        drop(file);

        self.persist(partial, &info.descriptor.digest)?;
        tracing::debug!(digest = %info.descriptor.digest, "Layer written");
        Ok(info)
    }

    /// Copy a blob into the layout, checking it against its digest.
    ///
    /// Data goes to a temporary file first and is renamed into place, so a
    /// blob path never holds partial content.
    async fn write_blob(&self, digest: &str, mut reader: BoxReader) -> WrapResult<()> {
        if self.has_blob(digest).await? {
            tracing::debug!(digest, "Blob already in layout");
            return Ok(());
        }

        let io_err = |e: std::io::Error| {
            publish_error(format!("failed to write blob {digest}: {e}"))
        };
        let (mut file, partial) = self.partial_file()?;
        let mut hasher = Sha256::new();
        let mut buf = vec![0u8; 64 * 1024];

        loop {
            let n = reader.read(&mut buf).await.map_err(io_err)?;
            if n == 0 {
                break;
            }
            hasher.update(&buf[..n]);
            file.write_all(&buf[..n]).await.map_err(io_err)?;
        }
        file.flush().await.map_err(io_err)?;
        drop(file);

        let actual = format_digest(&hasher.finalize());
        if actual != digest {
            return Err(publish_error(format!(
                "blob content hashes to {actual}, expected {digest}"
            )));
        }

        self.persist(partial, digest)?;
        tracing::debug!(digest, "Blob written");
        Ok(())
    }
}
