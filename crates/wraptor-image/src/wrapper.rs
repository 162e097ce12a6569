//! The wrapper: collects layers, materializes the image once, and publishes
//! it to a registry, the local daemon, or an OCI layout on disk.

use std::path::Path;
use std::sync::Arc;

use futures::FutureExt;
use futures::future::{BoxFuture, Shared};
use parking_lot::Mutex;
use tokio::runtime::Handle;
use tokio_util::sync::CancellationToken;
use wraptor_common::{WrapError, WrapResult};
use wraptor_oci::Platform;

use crate::credentials::{AuthProvider, Keychain};
use crate::daemon::DaemonClient;
use crate::image::{BaseImage, Image};
use crate::layer::{Layer, LayerBuilder};
use crate::layout::OciLayout;
use crate::reference::ImageReference;
use crate::registry::RegistryClient;
use crate::stream::NamedStream;

type SharedImage = Shared<BoxFuture<'static, WrapResult<Arc<Image>>>>;

enum WrapperState {
    /// Layers recorded so far, in append order.
    Accumulating(Vec<Layer>),
    /// Materialization has started; the outcome is shared by every caller.
    Sealed {
        layer_count: usize,
        image: SharedImage,
    },
}

impl WrapperState {
    fn layer_count(&self) -> usize {
        match self {
            Self::Accumulating(layers) => layers.len(),
            Self::Sealed { layer_count, .. } => *layer_count,
        }
    }

    /// Seal on first use, starting materialization with the recorded layers.
    fn seal(&mut self, start: impl FnOnce(Vec<Layer>) -> SharedImage) -> SharedImage {
        match self {
            Self::Sealed { image, .. } => image.clone(),
            Self::Accumulating(layers) => {
                let layers = std::mem::take(layers);
                let layer_count = layers.len();
                let image = start(layers);
                *self = Self::Sealed {
                    layer_count,
                    image: image.clone(),
                };
                image
            }
        }
    }
}

/// Builder for [`Wrapper`].
pub struct WrapperBuilder {
    base_image: String,
    file_prefix: String,
    platform: Platform,
    auth: Option<Arc<dyn AuthProvider>>,
    cancel: CancellationToken,
    daemon: DaemonClient,
    spool_layers: bool,
    runtime: Option<Handle>,
}

impl WrapperBuilder {
    /// Image to stack layers on. Empty (the default) means no base.
    #[must_use]
    pub fn base_image(mut self, reference: impl Into<String>) -> Self {
        self.base_image = reference.into();
        self
    }

    /// Prefix prepended to every entry name.
    #[must_use]
    pub fn file_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.file_prefix = prefix.into();
        self
    }

    /// Platform picked when the base resolves to an index.
    #[must_use]
    pub fn platform(mut self, platform: Platform) -> Self {
        self.platform = platform;
        self
    }

    /// Credentials for registry access. Defaults to the ambient keychain.
    #[must_use]
    pub fn auth(mut self, auth: Arc<dyn AuthProvider>) -> Self {
        self.auth = Some(auth);
        self
    }

    /// Token that aborts layer encoding, materialization and publishing.
    #[must_use]
    pub fn cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    /// Daemon used by [`Wrapper::publish_to_daemon`].
    #[must_use]
    pub fn daemon(mut self, daemon: DaemonClient) -> Self {
        self.daemon = daemon;
        self
    }

    /// Keep a compressed copy of every layer the first sink streams, so the
    /// image can also be published to sinks that need the bytes again.
    ///
    /// Off by default: layers go straight from their streams into the first
    /// sink and are never staged on disk.
    #[must_use]
    pub const fn spool_layers(mut self, spool: bool) -> Self {
        self.spool_layers = spool;
        self
    }

    /// Runtime that layer producers and materialization run on. Defaults to
    /// the runtime `build` is called in.
    #[must_use]
    pub fn runtime(mut self, runtime: Handle) -> Self {
        self.runtime = Some(runtime);
        self
    }

    /// Create the wrapper.
    #[must_use]
    pub fn build(self) -> Wrapper {
        let runtime = self.runtime.or_else(|| Handle::try_current().ok());
        let mut layers = LayerBuilder::new(self.file_prefix).with_cancellation(self.cancel.clone());
        if let Some(runtime) = &runtime {
            layers = layers.with_runtime(runtime.clone());
        }
        Wrapper {
            base_image: self.base_image,
            platform: self.platform,
            auth: self.auth.unwrap_or_else(|| Arc::new(Keychain::default())),
            cancel: self.cancel,
            daemon: self.daemon,
            spool_layers: self.spool_layers,
            runtime,
            layers,
            state: Mutex::new(WrapperState::Accumulating(Vec::new())),
        }
    }
}

/// Wraps batches of named streams into image layers on top of a base image.
///
/// Layers can be appended from any number of tasks or threads until the
/// image is first requested, either directly through [`Wrapper::image`] or
/// by a publish call. From then on the wrapper is sealed: the layer list is
/// fixed, the image is composed exactly once, and every later request
/// (including a failed one) sees the same outcome.
pub struct Wrapper {
    base_image: String,
    platform: Platform,
    auth: Arc<dyn AuthProvider>,
    cancel: CancellationToken,
    daemon: DaemonClient,
    spool_layers: bool,
    runtime: Option<Handle>,
    layers: LayerBuilder,
    state: Mutex<WrapperState>,
}

impl std::fmt::Debug for Wrapper {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Wrapper")
            .field("base_image", &self.base_image)
            .field("platform", &self.platform)
            .field("layer_count", &self.layer_count())
            .field("sealed", &self.is_sealed())
            .finish_non_exhaustive()
    }
}

impl Default for Wrapper {
    fn default() -> Self {
        Self::builder().build()
    }
}

impl Wrapper {
    /// Start configuring a wrapper.
    #[must_use]
    pub fn builder() -> WrapperBuilder {
        WrapperBuilder {
            base_image: String::new(),
            file_prefix: String::new(),
            platform: Platform::default(),
            auth: None,
            cancel: CancellationToken::new(),
            daemon: DaemonClient::new(),
            spool_layers: false,
            runtime: None,
        }
    }

    /// Number of recorded layers (appended ones only, not the base's).
    #[must_use]
    pub fn layer_count(&self) -> usize {
        self.state.lock().layer_count()
    }

    /// Whether materialization has started.
    #[must_use]
    pub fn is_sealed(&self) -> bool {
        matches!(*self.state.lock(), WrapperState::Sealed { .. })
    }

    /// Encode `batch` into one new layer and record it.
    ///
    /// Encoding runs in the background on the wrapper's runtime, so this can
    /// be called from plain threads too. A bad stream is reported by the
    /// first sink that reads the layer.
    pub fn append(&self, batch: Vec<NamedStream>) -> WrapResult<()> {
        if self.is_sealed() {
            return Err(WrapError::Sealed);
        }
        let layer = self.layers.build(batch)?;
        self.append_layers(vec![layer])
    }

    /// Record prebuilt layers, keeping their order.
    ///
    /// Appending nothing is a no-op.
    pub fn append_layers(&self, layers: Vec<Layer>) -> WrapResult<()> {
        if layers.is_empty() {
            return Ok(());
        }

        let mut state = self.state.lock();
        match &mut *state {
            WrapperState::Accumulating(recorded) => {
                recorded.extend(layers);
                tracing::info!(layers = recorded.len(), "Appending layer");
                Ok(())
            }
            WrapperState::Sealed { .. } => Err(WrapError::Sealed),
        }
    }

    /// The composed image, materialized on the first call.
    ///
    /// The first call seals the wrapper. It resolves the base and records
    /// the layers without reading them; the first sink streams them.
    /// Composition runs as its own task, so dropping the caller does not
    /// abort it; concurrent and later calls wait for the same outcome.
    pub async fn image(&self) -> WrapResult<Arc<Image>> {
        let image = self.state.lock().seal(|layers| self.materialize(layers));
        image.await
    }

    fn materialize(&self, layers: Vec<Layer>) -> SharedImage {
        let base_image = self.base_image.clone();
        let platform = self.platform.clone();
        let auth = Arc::clone(&self.auth);
        let cancel = self.cancel.clone();
        let spool = self.spool_layers;

        let base = if base_image.is_empty() { "<none>" } else { base_image.as_str() };
        tracing::info!(base, layers = layers.len(), "Sealing wrapper");

        let work = async move {
            let compose = async {
                let base = if base_image.is_empty() {
                    BaseImage::empty(&platform)
                } else {
                    BaseImage::resolve(&base_image, &platform, auth).await?
                };
                Image::compose(base, layers, spool).map(Arc::new)
            };
            tokio::select! {
                biased;
                () = cancel.cancelled() => Err(WrapError::cancelled("image materialization")),
                result = compose => result,
            }
        };
        let task = match &self.runtime {
            Some(runtime) => runtime.spawn(work),
            None => tokio::spawn(work),
        };

        async move {
            task.await.unwrap_or_else(|e| {
                Err(WrapError::Internal {
                    message: format!("materialization task failed: {e}"),
                })
            })
        }
        .boxed()
        .shared()
    }

    async fn cancellable<T>(
        &self,
        operation: &str,
        work: impl Future<Output = WrapResult<T>>,
    ) -> WrapResult<T> {
        tokio::select! {
            result = work => result,
            () = self.cancel.cancelled() => Err(WrapError::cancelled(operation)),
        }
    }

    /// Push the image to `reference` and return the manifest digest.
    ///
    /// The reference is checked before anything else happens, so a
    /// malformed one neither seals the wrapper nor touches the network.
    /// Layers nobody has read yet are compressed straight into their
    /// uploads.
    pub async fn publish_to_registry(&self, reference: &str) -> WrapResult<String> {
        let target = ImageReference::parse(reference)?;
        let image = self.image().await?;
        let client = RegistryClient::new(&target, Arc::clone(&self.auth))?;
        self.cancellable("registry push", client.push_image(&image, &target))
            .await
    }

    /// Load the image into the local daemon under `tag`.
    pub async fn publish_to_daemon(&self, tag: &str) -> WrapResult<()> {
        let tag = ImageReference::parse_tag(tag)?;
        let image = self.image().await?;
        self.cancellable("daemon load", self.daemon.load(&image, &tag))
            .await
    }

    /// Write the image as an OCI layout directory at `path`.
    ///
    /// Without any recorded layers this writes nothing and leaves the
    /// wrapper unsealed.
    pub async fn write_archive(&self, path: impl AsRef<Path>) -> WrapResult<()> {
        if self.layer_count() == 0 {
            tracing::info!(path = %path.as_ref().display(), "No layers to write, skipping archive");
            return Ok(());
        }
        let image = self.image().await?;
        let layout = OciLayout::new(path.as_ref());
        self.cancellable("archive write", layout.write_image(&image))
            .await
    }
}
