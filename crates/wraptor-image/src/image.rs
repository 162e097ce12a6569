//! Image composition: a base image plus the appended layers.
//!
//! Composing an [`Image`] resolves nothing but the base. Appended layers are
//! gzip-compressed and hashed while the first sink streams them, and the
//! manifest and config come into existence once every layer digest is known.
//! Base layers stay in their registry and are streamed from there (or
//! mounted) when a sink asks for them.
//!
//! A layer's bytes can be read only once. With spooling enabled the first
//! sink also keeps a compressed copy in a temporary directory owned by the
//! image, so later sinks of another kind can replay it.

use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use flate2::Compression;
use flate2::write::GzEncoder;
use once_cell::sync::OnceCell;
use sha2::{Digest, Sha256};
use tempfile::TempDir;
use tokio::io::{AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::{Mutex, MutexGuard};
use tokio_util::io::StreamReader;
use wraptor_common::{WrapError, WrapResult};
use wraptor_oci::image::HistoryEntry;
use wraptor_oci::{
    Descriptor, ImageConfig, ImageIndex, ImageManifest, Platform, digest, media_types,
    sha256_digest,
};

use crate::credentials::AuthProvider;
use crate::layer::{Layer, stream_error};
use crate::reference::{ImageReference, ImageTag};
use crate::registry::{RegistryClient, RegistryError, is_image_manifest};
use crate::stream::BoxReader;

const READ_BUFFER: usize = 64 * 1024;

/// Identity of a compressed layer blob.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlobInfo {
    /// Descriptor of the compressed blob as it appears in the manifest.
    pub descriptor: Descriptor,
    /// Digest of the uncompressed tar.
    pub diff_id: String,
}

/// A layer inherited from the base image, still in its registry.
#[derive(Debug, Clone)]
pub struct BaseLayer {
    /// Blob identity from the base manifest and config.
    pub info: BlobInfo,
    client: Arc<RegistryClient>,
    repository: String,
}

impl BaseLayer {
    /// Registry holding the blob.
    #[must_use]
    pub fn registry(&self) -> &str {
        self.client.registry()
    }

    /// Repository holding the blob.
    #[must_use]
    pub fn repository(&self) -> &str {
        &self.repository
    }

    /// Stream the compressed blob from its registry.
    pub async fn open(&self, sink: &str) -> WrapResult<BoxReader> {
        let stream = self
            .client
            .blob_stream(&self.repository, &self.info.descriptor.digest)
            .await
            .map_err(|e| e.into_wrap(|m| WrapError::publish(sink, format!("base layer: {m}"))))?;
        Ok(Box::pin(StreamReader::new(stream)))
    }
}

/// Manifest and config of the image layers are appended to.
#[derive(Debug, Clone)]
pub struct BaseImage {
    manifest: ImageManifest,
    config: ImageConfig,
    source: Option<(Arc<RegistryClient>, String)>,
}

impl BaseImage {
    /// An image with no layers for `platform`.
    #[must_use]
    pub fn empty(platform: &Platform) -> Self {
        Self {
            manifest: ImageManifest {
                schema_version: 2,
                media_type: Some(media_types::MANIFEST.to_string()),
                config: Descriptor::new(media_types::CONFIG, String::new(), 0),
                layers: Vec::new(),
                annotations: std::collections::BTreeMap::new(),
            },
            config: ImageConfig::empty(platform),
            source: None,
        }
    }

    /// Fetch the manifest and config of `reference` from its registry.
    ///
    /// An index is followed to the manifest for `platform`. A malformed
    /// reference is a resolution failure like an unreachable one.
    pub async fn resolve(
        reference: &str,
        platform: &Platform,
        auth: Arc<dyn AuthProvider>,
    ) -> WrapResult<Self> {
        let resolution = |message: String| WrapError::Resolution {
            reference: reference.to_string(),
            message,
        };
        let fetch_err = |e: RegistryError| e.into_wrap(resolution);

        let parsed = ImageReference::parse(reference).map_err(|e| resolution(e.to_string()))?;
        let client = Arc::new(
            RegistryClient::new(&parsed, auth).map_err(|e| resolution(e.to_string()))?,
        );
        let repository = parsed.repository.clone();

        tracing::info!(base = %parsed, platform = %platform, "Resolving base image");

        let (mut bytes, header_type) = client
            .get_manifest(&repository, parsed.reference.as_str())
            .await
            .map_err(fetch_err)?;
        if let ImageTag::Digest(expected) = &parsed.reference {
            let actual = sha256_digest(&bytes);
            if &actual != expected {
                return Err(resolution(format!(
                    "manifest digest {actual} does not match {expected}"
                )));
            }
        }

        let mut media_type = detect_media_type(&header_type, &bytes);
        if media_types::is_index(&media_type) {
            let index: ImageIndex = serde_json::from_slice(&bytes)
                .map_err(|e| WrapError::composition(format!("malformed base index: {e}")))?;
            let entry = index.find_platform(platform).ok_or_else(|| {
                resolution(format!("no manifest for platform {platform} in index"))
            })?;
            tracing::debug!(digest = %entry.descriptor.digest, "Selected manifest from index");

            let (manifest_bytes, header_type) = client
                .get_manifest(&repository, &entry.descriptor.digest)
                .await
                .map_err(fetch_err)?;
            let actual = sha256_digest(&manifest_bytes);
            if actual != entry.descriptor.digest {
                return Err(resolution(format!(
                    "platform manifest digest {actual} does not match {}",
                    entry.descriptor.digest
                )));
            }
            media_type = detect_media_type(&header_type, &manifest_bytes);
            bytes = manifest_bytes;
        }
        if !is_image_manifest(&media_type) {
            return Err(resolution(format!("unsupported manifest type {media_type}")));
        }

        let manifest: ImageManifest = serde_json::from_slice(&bytes)
            .map_err(|e| WrapError::composition(format!("malformed base manifest: {e}")))?;
        let config_bytes = client
            .get_blob(&repository, &manifest.config.digest)
            .await
            .map_err(fetch_err)?;
        let config: ImageConfig = serde_json::from_slice(&config_bytes)
            .map_err(|e| WrapError::composition(format!("malformed base config: {e}")))?;

        tracing::debug!(
            layers = manifest.layers.len(),
            os = %config.os,
            architecture = %config.architecture,
            "Base image resolved"
        );

        Ok(Self {
            manifest,
            config,
            source: Some((client, repository)),
        })
    }

    /// Base manifest.
    #[must_use]
    pub const fn manifest(&self) -> &ImageManifest {
        &self.manifest
    }

    /// Base config.
    #[must_use]
    pub const fn config(&self) -> &ImageConfig {
        &self.config
    }
}

/// Media type from the response header, or from the document itself when
/// the registry sent a generic content type.
fn detect_media_type(header: &str, bytes: &[u8]) -> String {
    if header.starts_with("application/vnd.") {
        return header.to_string();
    }
    let value: serde_json::Value = serde_json::from_slice(bytes).unwrap_or_default();
    if let Some(media_type) = value.get("mediaType").and_then(|v| v.as_str()) {
        return media_type.to_string();
    }
    if value.get("manifests").is_some() {
        media_types::INDEX.to_string()
    } else {
        media_types::MANIFEST.to_string()
    }
}

/// Byte form a sink wants an appended layer in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlobForm {
    /// The gzip blob named by the manifest.
    Compressed,
    /// The plain tar. The compressed digest is still computed.
    Uncompressed,
}

enum Slot {
    Pending(Layer),
    Streamed {
        info: BlobInfo,
        spooled: Option<PathBuf>,
    },
    Lost(WrapError),
}

struct AppendedLayer {
    files: usize,
    slot: Mutex<Slot>,
}

/// Access to one appended layer, as handed out by [`Image::claim_layer`].
pub enum LayerClaim<'a> {
    /// Nobody has read the layer yet; the holder streams it.
    Fresh(FreshLayer<'a>),
    /// An earlier sink streamed the layer.
    Streamed(StreamedLayer),
}

/// An appended layer whose bytes have not been read yet.
///
/// Holding it keeps other sinks waiting for this layer. Dropping it without
/// streaming puts the layer back untouched.
pub struct FreshLayer<'a> {
    guard: MutexGuard<'a, Slot>,
    layer: Option<Layer>,
    index: usize,
    media_type: &'a str,
    spool: Option<PathBuf>,
}

impl FreshLayer<'_> {
    /// Length of the plain tar, for sinks that must declare it up front.
    pub fn tar_size(&self) -> WrapResult<u64> {
        self.layer
            .as_ref()
            .ok_or_else(|| WrapError::Internal {
                message: format!("layer {} was already taken", self.index),
            })?
            .tar_size()
    }

    /// Stream the layer into `out` in `form`, hashing it on the way.
    ///
    /// The outcome is recorded for the other sinks: the blob identity on
    /// success, the error otherwise.
    pub async fn stream_into<W>(mut self, form: BlobForm, out: &mut W, sink: &str) -> WrapResult<BlobInfo>
    where
        W: AsyncWrite + Unpin + ?Sized,
    {
        let layer = self.layer.take().ok_or_else(|| WrapError::Internal {
            message: format!("layer {} was already taken", self.index),
        })?;

        match pump(layer, form, out, self.spool.as_deref(), sink).await {
            Ok(pumped) => {
                #[allow(clippy::cast_possible_wrap)]
                let info = BlobInfo {
                    descriptor: Descriptor::new(self.media_type, pumped.digest, pumped.size as i64),
                    diff_id: pumped.diff_id,
                };
                tracing::debug!(
                    index = self.index,
                    digest = %info.descriptor.digest,
                    diff_id = %info.diff_id,
                    size = pumped.size,
                    sink,
                    "Layer streamed"
                );
                *self.guard = Slot::Streamed {
                    info: info.clone(),
                    spooled: self.spool.take(),
                };
                Ok(info)
            }
            Err(err) => {
                if let Some(path) = self.spool.take() {
                    let _ = tokio::fs::remove_file(path).await;
                }
                *self.guard = Slot::Lost(lost_layer(self.index, &err));
                Err(err)
            }
        }
    }
}

impl Drop for FreshLayer<'_> {
    fn drop(&mut self) {
        if let Some(layer) = self.layer.take() {
            *self.guard = Slot::Pending(layer);
        }
    }
}

/// Error later sinks see for a layer whose stream failed.
fn lost_layer(index: usize, err: &WrapError) -> WrapError {
    match err {
        WrapError::Encoding { .. } | WrapError::Cancelled { .. } => err.clone(),
        other => WrapError::composition(format!(
            "layer {index} was consumed by a publish that failed: {other}"
        )),
    }
}

/// An appended layer that an earlier sink already streamed.
#[derive(Debug, Clone)]
pub struct StreamedLayer {
    /// Identity of the compressed blob.
    pub info: BlobInfo,
    index: usize,
    spooled: Option<PathBuf>,
}

impl StreamedLayer {
    /// Reopen the compressed blob from the spool.
    ///
    /// Without spooling the bytes are gone and this fails.
    pub async fn open(&self, sink: &str) -> WrapResult<BoxReader> {
        let Some(path) = &self.spooled else {
            return Err(WrapError::publish(
                sink,
                format!(
                    "layer {} was streamed to an earlier sink and not spooled; \
                     enable layer spooling to publish to more than one destination",
                    self.index
                ),
            ));
        };
        let file = tokio::fs::File::open(path)
            .await
            .map_err(|e| WrapError::publish(sink, format!("failed to open {}: {e}", path.display())))?;
        Ok(Box::pin(file))
    }
}

/// Serialized manifest and config of a composed image.
#[derive(Debug)]
pub struct ImageDocuments {
    manifest: ImageManifest,
    manifest_bytes: Vec<u8>,
    manifest_media_type: String,
    digest: String,
    config: ImageConfig,
    config_bytes: Vec<u8>,
}

impl ImageDocuments {
    /// Manifest digest.
    #[must_use]
    pub fn digest(&self) -> &str {
        &self.digest
    }

    /// Composed manifest.
    #[must_use]
    pub const fn manifest(&self) -> &ImageManifest {
        &self.manifest
    }

    /// Serialized manifest, exactly as it is published.
    #[must_use]
    pub fn manifest_bytes(&self) -> &[u8] {
        &self.manifest_bytes
    }

    /// Media type of the manifest.
    #[must_use]
    pub fn manifest_media_type(&self) -> &str {
        &self.manifest_media_type
    }

    /// Composed config.
    #[must_use]
    pub const fn config(&self) -> &ImageConfig {
        &self.config
    }

    /// Serialized config, exactly as it is published.
    #[must_use]
    pub fn config_bytes(&self) -> &[u8] {
        &self.config_bytes
    }

    /// Descriptor of the config blob.
    #[must_use]
    pub const fn config_descriptor(&self) -> &Descriptor {
        &self.manifest.config
    }

    /// Platform the config describes.
    #[must_use]
    pub fn platform(&self) -> Platform {
        Platform {
            os: self.config.os.clone(),
            architecture: self.config.architecture.clone(),
            variant: self.config.variant.clone(),
        }
    }
}

/// A base image with appended layers stacked on top.
pub struct Image {
    manifest: ImageManifest,
    config: ImageConfig,
    base_layers: Vec<BaseLayer>,
    appended: Vec<AppendedLayer>,
    layer_media_type: &'static str,
    record_history: bool,
    documents: OnceCell<ImageDocuments>,
    // Removed with the image.
    spool: Option<TempDir>,
}

impl std::fmt::Debug for Image {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Image")
            .field("base_layers", &self.base_layers.len())
            .field("appended_layers", &self.appended.len())
            .field("digest", &self.digest())
            .field("spooling", &self.spool.is_some())
            .finish_non_exhaustive()
    }
}

impl Image {
    /// Stack `layers` on `base`, in order.
    ///
    /// No layer is read here. With `spool` set, the first sink to stream a
    /// layer keeps a compressed copy for later sinks.
    pub fn compose(base: BaseImage, layers: Vec<Layer>, spool: bool) -> WrapResult<Self> {
        let BaseImage {
            manifest,
            config,
            source,
        } = base;

        if manifest.layers.len() != config.rootfs.diff_ids.len() {
            return Err(WrapError::composition(format!(
                "base manifest has {} layers but config lists {} diff ids",
                manifest.layers.len(),
                config.rootfs.diff_ids.len()
            )));
        }

        let mut base_layers = Vec::with_capacity(manifest.layers.len());
        if !manifest.layers.is_empty() {
            let Some((client, repository)) = source else {
                return Err(WrapError::composition("base layers have no source registry"));
            };
            for (descriptor, diff_id) in manifest.layers.iter().zip(&config.rootfs.diff_ids) {
                base_layers.push(BaseLayer {
                    info: BlobInfo {
                        descriptor: descriptor.clone(),
                        diff_id: diff_id.clone(),
                    },
                    client: Arc::clone(&client),
                    repository: repository.clone(),
                });
            }
        }

        let spool = if spool {
            let dir = tempfile::Builder::new()
                .prefix("wraptor-layers-")
                .tempdir()
                .map_err(|e| {
                    WrapError::composition(format!("failed to create spool directory: {e}"))
                })?;
            Some(dir)
        } else {
            None
        };

        tracing::info!(
            base_layers = base_layers.len(),
            layers = layers.len(),
            spooling = spool.is_some(),
            "Composing image"
        );

        let image = Self {
            // History must line up with the layers; only extend it when it does.
            record_history: !config.history.is_empty() || manifest.layers.is_empty(),
            layer_media_type: manifest.layer_media_type(),
            manifest,
            config,
            base_layers,
            appended: layers
                .into_iter()
                .map(|layer| AppendedLayer {
                    files: layer.entries().len(),
                    slot: Mutex::new(Slot::Pending(layer)),
                })
                .collect(),
            documents: OnceCell::new(),
            spool,
        };
        if image.appended.is_empty() {
            image.finalize(Vec::new())?;
        }
        Ok(image)
    }

    /// Layers inherited from the base.
    #[must_use]
    pub fn base_layers(&self) -> &[BaseLayer] {
        &self.base_layers
    }

    /// Number of appended layers.
    #[must_use]
    pub fn appended_count(&self) -> usize {
        self.appended.len()
    }

    /// Base layers plus appended layers.
    #[must_use]
    pub fn layer_count(&self) -> usize {
        self.base_layers.len() + self.appended.len()
    }

    /// Whether streamed layers are kept for later sinks.
    #[must_use]
    pub fn is_spooling(&self) -> bool {
        self.spool.is_some()
    }

    /// Take appended layer `index`, waiting while another sink streams it.
    pub async fn claim_layer(&self, index: usize) -> WrapResult<LayerClaim<'_>> {
        let appended = self.appended.get(index).ok_or_else(|| WrapError::Internal {
            message: format!("no appended layer {index}"),
        })?;
        let mut guard = appended.slot.lock().await;

        let taken = Slot::Lost(WrapError::cancelled(format!("streaming layer {index}")));
        match std::mem::replace(&mut *guard, taken) {
            Slot::Pending(layer) => Ok(LayerClaim::Fresh(FreshLayer {
                guard,
                layer: Some(layer),
                index,
                media_type: self.layer_media_type,
                spool: self
                    .spool
                    .as_ref()
                    .map(|dir| dir.path().join(format!("layer-{index}.tar.gz"))),
            })),
            Slot::Streamed { info, spooled } => {
                *guard = Slot::Streamed {
                    info: info.clone(),
                    spooled: spooled.clone(),
                };
                Ok(LayerClaim::Streamed(StreamedLayer {
                    info,
                    index,
                    spooled,
                }))
            }
            Slot::Lost(err) => {
                *guard = Slot::Lost(err.clone());
                Err(err)
            }
        }
    }

    /// Manifest and config, once every appended layer has been streamed.
    #[must_use]
    pub fn documents(&self) -> Option<&ImageDocuments> {
        self.documents.get()
    }

    /// Manifest digest, once every appended layer has been streamed.
    #[must_use]
    pub fn digest(&self) -> Option<&str> {
        self.documents().map(ImageDocuments::digest)
    }

    /// Build the manifest and config from the appended blobs, in order.
    ///
    /// The documents are built once; later calls return the same ones.
    pub fn finalize(&self, appended: Vec<BlobInfo>) -> WrapResult<&ImageDocuments> {
        if appended.len() != self.appended.len() {
            return Err(WrapError::Internal {
                message: format!(
                    "{} appended layers but {} blobs",
                    self.appended.len(),
                    appended.len()
                ),
            });
        }
        self.documents.get_or_try_init(|| self.build_documents(appended))
    }

    fn build_documents(&self, appended: Vec<BlobInfo>) -> WrapResult<ImageDocuments> {
        let mut manifest = self.manifest.clone();
        let mut config = self.config.clone();

        for (info, layer) in appended.into_iter().zip(&self.appended) {
            manifest.layers.push(info.descriptor);
            config.rootfs.diff_ids.push(info.diff_id);
            if self.record_history {
                config.history.push(HistoryEntry {
                    created: None,
                    author: None,
                    created_by: Some("wraptor".to_string()),
                    comment: Some(format!("{} files", layer.files)),
                    empty_layer: false,
                });
            }
        }

        let config_bytes = serde_json::to_vec(&config)?;
        if manifest.config.media_type.is_empty() {
            manifest.config.media_type = media_types::CONFIG.to_string();
        }
        manifest.config.digest = sha256_digest(&config_bytes);
        #[allow(clippy::cast_possible_wrap)]
        {
            manifest.config.size = config_bytes.len() as i64;
        }

        let manifest_media_type = manifest
            .media_type
            .get_or_insert_with(|| media_types::MANIFEST.to_string())
            .clone();
        let manifest_bytes = serde_json::to_vec(&manifest)?;
        let digest = sha256_digest(&manifest_bytes);

        tracing::info!(digest = %digest, layers = manifest.layers.len(), "Image finalized");

        Ok(ImageDocuments {
            manifest,
            manifest_bytes,
            manifest_media_type,
            digest,
            config,
            config_bytes,
        })
    }
}

struct Pumped {
    diff_id: String,
    digest: String,
    size: u64,
}

/// Read one layer to the end, writing it to `out` (and the spool) while
/// hashing both the tar and its gzip form.
async fn pump<W>(
    layer: Layer,
    form: BlobForm,
    out: &mut W,
    spool: Option<&Path>,
    sink: &str,
) -> WrapResult<Pumped>
where
    W: AsyncWrite + Unpin + ?Sized,
{
    let (mut reader, producer) = layer.into_parts();
    let write_err = |e: std::io::Error| WrapError::publish(sink, format!("failed to write layer: {e}"));

    let mut spool_file = match spool {
        Some(path) => Some(
            tokio::fs::File::create(path)
                .await
                .map_err(|e| spool_error(path, &e))?,
        ),
        None => None,
    };
    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    let mut diff_hasher = Sha256::new();
    let mut blob_hasher = Sha256::new();
    let mut size = 0u64;
    let mut buf = vec![0u8; READ_BUFFER];

    loop {
        let n = reader.read(&mut buf).await.map_err(|e| stream_error(&e))?;
        if n == 0 {
            break;
        }
        let chunk = &buf[..n];
        diff_hasher.update(chunk);
        encoder
            .write_all(chunk)
            .map_err(|e| WrapError::composition(format!("failed to compress layer: {e}")))?;

        let compressed = std::mem::take(encoder.get_mut());
        blob_hasher.update(&compressed);
        size += compressed.len() as u64;
        if let (Some(file), Some(path)) = (spool_file.as_mut(), spool) {
            file.write_all(&compressed)
                .await
                .map_err(|e| spool_error(path, &e))?;
        }
        let bytes = match form {
            BlobForm::Compressed => compressed.as_slice(),
            BlobForm::Uncompressed => chunk,
        };
        out.write_all(bytes).await.map_err(write_err)?;
    }

    let tail = encoder
        .finish()
        .map_err(|e| WrapError::composition(format!("failed to compress layer: {e}")))?;
    blob_hasher.update(&tail);
    size += tail.len() as u64;
    if let (Some(file), Some(path)) = (spool_file.as_mut(), spool) {
        file.write_all(&tail)
            .await
            .map_err(|e| spool_error(path, &e))?;
        file.flush().await.map_err(|e| spool_error(path, &e))?;
    }
    if form == BlobForm::Compressed {
        out.write_all(&tail).await.map_err(write_err)?;
    }

    producer
        .await
        .map_err(|e| WrapError::encoding(format!("layer producer failed: {e}")))?;

    Ok(Pumped {
        diff_id: digest::format_digest(&diff_hasher.finalize()),
        digest: digest::format_digest(&blob_hasher.finalize()),
        size,
    })
}

fn spool_error(path: &Path, err: &std::io::Error) -> WrapError {
    WrapError::composition(format!("failed to spool {}: {err}", path.display()))
}

#[cfg(test)]
mod tests {
    use std::io::Read;

    use flate2::read::GzDecoder;

    use super::*;
    use crate::layer::LayerBuilder;
    use crate::stream::NamedStream;

    fn layers(builder: &LayerBuilder, batches: Vec<Vec<NamedStream>>) -> Vec<Layer> {
        batches
            .into_iter()
            .map(|batch| builder.build(batch).unwrap())
            .collect()
    }

    async fn stream_fresh(image: &Image, index: usize, form: BlobForm) -> (BlobInfo, Vec<u8>) {
        let LayerClaim::Fresh(fresh) = image.claim_layer(index).await.unwrap() else {
            panic!("layer {index} was already streamed");
        };
        let mut out = Vec::new();
        let info = fresh.stream_into(form, &mut out, "test").await.unwrap();
        (info, out)
    }

    fn tar_paths(tar: &[u8]) -> Vec<String> {
        tar::Archive::new(tar)
            .entries()
            .unwrap()
            .map(|e| e.unwrap().path().unwrap().to_string_lossy().into_owned())
            .collect()
    }

    #[tokio::test]
    async fn documents_follow_streamed_layers() {
        let builder = LayerBuilder::new("artifacts/");
        let layers = layers(
            &builder,
            vec![
                vec![NamedStream::from_bytes("model.bin", vec![7u8; 4096])],
                vec![
                    NamedStream::from_bytes("a.txt", "abc"),
                    NamedStream::from_bytes("b.txt", ""),
                ],
            ],
        );

        let image = Image::compose(BaseImage::empty(&Platform::linux_amd64()), layers, false).unwrap();
        assert_eq!(image.appended_count(), 2);
        assert!(image.documents().is_none());

        let mut infos = Vec::new();
        for index in 0..2 {
            let (info, blob) = stream_fresh(&image, index, BlobForm::Compressed).await;
            assert_eq!(blob.len() as i64, info.descriptor.size);
            assert_eq!(sha256_digest(&blob), info.descriptor.digest);
            assert_eq!(info.descriptor.media_type, media_types::LAYER_TAR_GZIP);

            let mut tar = Vec::new();
            GzDecoder::new(blob.as_slice()).read_to_end(&mut tar).unwrap();
            assert_eq!(sha256_digest(&tar), info.diff_id);
            if index == 1 {
                assert_eq!(tar_paths(&tar), vec!["artifacts/a.txt", "artifacts/b.txt"]);
            }
            infos.push(info);
        }

        let documents = image.finalize(infos.clone()).unwrap();
        assert_eq!(documents.manifest().layers.len(), 2);
        assert_eq!(documents.config().rootfs.diff_ids.len(), 2);
        assert_eq!(documents.config().history.len(), 2);
        assert_eq!(documents.config().architecture, "amd64");
        assert_eq!(documents.manifest_media_type(), media_types::MANIFEST);
        assert_eq!(documents.digest(), sha256_digest(documents.manifest_bytes()));
        assert_eq!(
            documents.config_descriptor().digest,
            sha256_digest(documents.config_bytes())
        );
        assert_eq!(image.digest(), Some(documents.digest()));

        // Finalizing again hands back the same documents.
        let again = image.finalize(infos).unwrap();
        assert!(std::ptr::eq(documents, again));
    }

    #[tokio::test]
    async fn uncompressed_form_has_the_same_identity() {
        let builder = LayerBuilder::default();
        let batch = || vec![NamedStream::from_bytes("weights.bin", vec![3u8; 70_000])];

        let plain = Image::compose(
            BaseImage::empty(&Platform::default()),
            layers(&builder, vec![batch()]),
            false,
        )
        .unwrap();
        let (plain_info, tar) = stream_fresh(&plain, 0, BlobForm::Uncompressed).await;
        assert_eq!(sha256_digest(&tar), plain_info.diff_id);
        assert_eq!(tar_paths(&tar), vec!["weights.bin"]);

        let gzip = Image::compose(
            BaseImage::empty(&Platform::default()),
            layers(&builder, vec![batch()]),
            false,
        )
        .unwrap();
        let (gzip_info, _) = stream_fresh(&gzip, 0, BlobForm::Compressed).await;
        assert_eq!(plain_info, gzip_info);
    }

    #[tokio::test]
    async fn streamed_layers_replay_only_from_the_spool() {
        let builder = LayerBuilder::default();
        for spool in [false, true] {
            let image = Image::compose(
                BaseImage::empty(&Platform::default()),
                layers(&builder, vec![vec![NamedStream::from_bytes("x", "y")]]),
                spool,
            )
            .unwrap();
            assert_eq!(image.is_spooling(), spool);
            let (info, blob) = stream_fresh(&image, 0, BlobForm::Compressed).await;

            let LayerClaim::Streamed(streamed) = image.claim_layer(0).await.unwrap() else {
                panic!("layer should be streamed");
            };
            assert_eq!(streamed.info, info);
            match streamed.open("test").await {
                Ok(mut reader) => {
                    assert!(spool);
                    let mut replay = Vec::new();
                    reader.read_to_end(&mut replay).await.unwrap();
                    assert_eq!(replay, blob);
                }
                Err(err) => {
                    assert!(!spool);
                    assert!(matches!(err, WrapError::Publish { .. }), "{err}");
                }
            }
        }
    }

    #[tokio::test]
    async fn unstreamed_claims_put_the_layer_back() {
        let layer = LayerBuilder::default()
            .build(vec![NamedStream::from_bytes("a.txt", "abc")])
            .unwrap();
        let image = Image::compose(BaseImage::empty(&Platform::default()), vec![layer], false).unwrap();

        match image.claim_layer(0).await.unwrap() {
            LayerClaim::Fresh(fresh) => drop(fresh),
            LayerClaim::Streamed(_) => panic!("nothing streamed yet"),
        }
        let (info, _) = stream_fresh(&image, 0, BlobForm::Compressed).await;
        assert!(info.descriptor.size > 0);
    }

    #[tokio::test]
    async fn layer_failure_is_kept_for_later_claims() {
        let layer = LayerBuilder::default()
            .build(vec![NamedStream::new(
                "short.bin",
                10,
                std::io::Cursor::new(b"abc".to_vec()),
            )])
            .unwrap();
        let image = Image::compose(BaseImage::empty(&Platform::default()), vec![layer], false).unwrap();

        let LayerClaim::Fresh(fresh) = image.claim_layer(0).await.unwrap() else {
            panic!("nothing streamed yet");
        };
        let err = fresh
            .stream_into(BlobForm::Compressed, &mut Vec::new(), "test")
            .await
            .unwrap_err();
        assert!(matches!(err, WrapError::Encoding { .. }), "{err}");

        let again = image.claim_layer(0).await.err().unwrap();
        assert_eq!(err.to_string(), again.to_string());
        assert!(image.documents().is_none());
    }

    #[test]
    fn empty_image_is_final_at_once() {
        let image = Image::compose(BaseImage::empty(&Platform::linux_arm64()), Vec::new(), false).unwrap();
        let documents = image.documents().unwrap();
        assert!(documents.manifest().layers.is_empty());
        assert_eq!(documents.platform(), Platform::linux_arm64());
        assert!(image.finalize(vec![]).is_ok());
    }

    #[test]
    fn media_type_detection() {
        assert_eq!(
            detect_media_type(media_types::DOCKER_MANIFEST, b"{}"),
            media_types::DOCKER_MANIFEST
        );
        assert_eq!(
            detect_media_type("application/json", br#"{"manifests": []}"#),
            media_types::INDEX
        );
        assert_eq!(
            detect_media_type("", br#"{"schemaVersion": 2, "layers": []}"#),
            media_types::MANIFEST
        );
    }

    #[tokio::test]
    async fn malformed_base_reference_is_a_resolution_error() {
        let err = BaseImage::resolve(
            "Not A Reference",
            &Platform::default(),
            Arc::new(crate::credentials::Anonymous),
        )
        .await
        .unwrap_err();
        assert!(matches!(err, WrapError::Resolution { .. }), "{err}");
    }
}
