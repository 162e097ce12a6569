//! # wraptor
//!
//! Wrap files from a local directory or a Hugging Face repository into a
//! container image, one layer per file, and publish it to a registry, the
//! local daemon, or an OCI layout.

#![warn(missing_docs)]

pub mod cli;
pub mod source;

pub use source::{HuggingFaceSource, LocalSource, Source};
