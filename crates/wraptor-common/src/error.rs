//! Common error types for the Wraptor workspace.

use std::sync::Arc;

use miette::Diagnostic;
use thiserror::Error;

/// Result type alias using [`WrapError`].
pub type WrapResult<T> = Result<T, WrapError>;

/// Errors produced while assembling and publishing images.
///
/// The type is `Clone` so that a cached failure can be handed to every
/// caller that asks for the same image.
#[derive(Error, Diagnostic, Debug, Clone)]
pub enum WrapError {
    /// Layers were appended after the image was materialized.
    #[error("Cannot append layers: image has already been materialized")]
    #[diagnostic(
        code(wraptor::wrapper::sealed),
        help("Append every batch before publishing or requesting the image")
    )]
    Sealed,

    /// A stream batch could not be encoded into a layer.
    #[error("Failed to encode layer: {message}")]
    #[diagnostic(code(wraptor::layer::encoding))]
    Encoding {
        /// The error message.
        message: String,
    },

    /// Malformed image reference or tag.
    #[error("Invalid image reference '{reference}': {message}")]
    #[diagnostic(
        code(wraptor::reference::invalid),
        help("Use references like 'alpine', 'ghcr.io/org/app:v1' or 'repo@sha256:<hex>'")
    )]
    Reference {
        /// The offending reference.
        reference: String,
        /// Why it was rejected.
        message: String,
    },

    /// The base image could not be resolved.
    #[error("Failed to resolve base image {reference}: {message}")]
    #[diagnostic(code(wraptor::image::resolution))]
    Resolution {
        /// The base image reference.
        reference: String,
        /// The error message.
        message: String,
    },

    /// Registry authentication failed.
    #[error("Authentication failed for {registry}: {message}")]
    #[diagnostic(
        code(wraptor::registry::auth),
        help("Check ~/.docker/config.json or the WRAPTOR_REGISTRY_<HOST>_* variables")
    )]
    Auth {
        /// Registry host.
        registry: String,
        /// The error message.
        message: String,
    },

    /// Base image and layers could not be composed.
    #[error("Failed to compose image: {message}")]
    #[diagnostic(code(wraptor::image::composition))]
    Composition {
        /// The error message.
        message: String,
    },

    /// Writing the image to a sink failed.
    #[error("Failed to publish image to {sink}: {message}")]
    #[diagnostic(code(wraptor::publish))]
    Publish {
        /// The sink (registry, daemon or archive).
        sink: String,
        /// The error message.
        message: String,
    },

    /// Input files could not be listed or fetched.
    #[error("Failed to load source {name}: {message}")]
    #[diagnostic(
        code(wraptor::source),
        help("Sources are local directories or Hugging Face repository ids like 'org/model'")
    )]
    Source {
        /// The source (path or repository id).
        name: String,
        /// The error message.
        message: String,
    },

    /// The operation was cancelled.
    #[error("Operation cancelled: {operation}")]
    #[diagnostic(code(wraptor::cancelled))]
    Cancelled {
        /// The operation that was interrupted.
        operation: String,
    },

    /// I/O error.
    #[error("I/O error: {0}")]
    #[diagnostic(code(wraptor::io))]
    Io(Arc<std::io::Error>),

    /// Serialization error.
    #[error("Serialization error: {0}")]
    #[diagnostic(code(wraptor::serialization))]
    Serialization(String),

    /// Configuration error.
    #[error("Configuration error: {message}")]
    #[diagnostic(code(wraptor::config))]
    Config {
        /// The error message.
        message: String,
    },

    /// Internal error (should not happen).
    #[error("Internal error: {message}")]
    #[diagnostic(
        code(wraptor::internal),
        help("This is a bug, please report it at https://github.com/yolocs/wraptor/issues")
    )]
    Internal {
        /// The error message.
        message: String,
    },
}

impl WrapError {
    /// Shorthand for an [`WrapError::Encoding`] error.
    pub fn encoding(message: impl Into<String>) -> Self {
        Self::Encoding {
            message: message.into(),
        }
    }

    /// Shorthand for a [`WrapError::Reference`] error.
    pub fn reference(reference: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Reference {
            reference: reference.into(),
            message: message.into(),
        }
    }

    /// Shorthand for a [`WrapError::Composition`] error.
    pub fn composition(message: impl Into<String>) -> Self {
        Self::Composition {
            message: message.into(),
        }
    }

    /// Shorthand for a [`WrapError::Publish`] error.
    pub fn publish(sink: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Publish {
            sink: sink.into(),
            message: message.into(),
        }
    }

    /// Shorthand for a [`WrapError::Source`] error.
    pub fn source_error(name: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Source {
            name: name.into(),
            message: message.into(),
        }
    }

    /// Shorthand for a [`WrapError::Cancelled`] error.
    pub fn cancelled(operation: impl Into<String>) -> Self {
        Self::Cancelled {
            operation: operation.into(),
        }
    }

    /// Whether retrying the same call could succeed.
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::Resolution { .. } | Self::Publish { .. } | Self::Source { .. } | Self::Io(_)
        )
    }
}

impl From<std::io::Error> for WrapError {
    fn from(err: std::io::Error) -> Self {
        Self::Io(Arc::new(err))
    }
}

impl From<serde_json::Error> for WrapError {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}
