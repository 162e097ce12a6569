//! # wraptor-oci
//!
//! OCI (Open Container Initiative) image specification types for Wraptor.
//!
//! This crate provides Rust types for:
//! - OCI Image Specification (manifests, indexes, configs)
//! - Content digests

#![warn(missing_docs)]

pub mod digest;
pub mod image;

pub use digest::sha256_digest;
pub use image::{Descriptor, ImageConfig, ImageIndex, ImageManifest, Platform, media_types};
