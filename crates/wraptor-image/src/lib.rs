//! # wraptor-image
//!
//! Image assembly engine for Wraptor.
//!
//! This crate provides:
//! - Streaming layer encoding from named byte streams
//! - A [`Wrapper`] that records layers and composes the image exactly once
//! - Base image resolution and registry pushes (OCI distribution API)
//! - Loading into the local daemon and writing OCI image layouts
//!
//! ```no_run
//! # async fn run() -> wraptor_common::WrapResult<()> {
//! use wraptor_image::{NamedStream, Wrapper};
//!
//! let wrapper = Wrapper::builder()
//!     .base_image("alpine:3.19")
//!     .file_prefix("models/")
//!     .build();
//! wrapper.append(vec![NamedStream::open("model.safetensors", "model.safetensors").await?])?;
//! let digest = wrapper.publish_to_registry("ghcr.io/org/model:v1").await?;
//! # let _ = digest;
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]

pub mod archive;
pub mod credentials;
pub mod daemon;
pub mod image;
pub mod layer;
pub mod layout;
pub mod reference;
pub mod registry;
pub mod stream;
pub mod wrapper;

pub use credentials::{AuthProvider, Credential, CredentialManager, Keychain};
pub use daemon::DaemonClient;
pub use image::{BaseImage, BaseLayer, BlobInfo, Image, ImageDocuments};
pub use layer::{Layer, LayerBuilder, LayerEntry};
pub use layout::OciLayout;
pub use reference::{ImageReference, ImageTag};
pub use registry::RegistryClient;
pub use stream::NamedStream;
pub use wrapper::{Wrapper, WrapperBuilder};
