//! # wraptor-common
//!
//! Shared utilities and types for Wraptor.
//!
//! This crate provides common functionality used across all Wraptor crates:
//! - Standard filesystem paths
//! - Common error types

#![warn(missing_docs)]

pub mod error;
pub mod paths;

pub use error::{WrapError, WrapResult};
pub use paths::WrapPaths;
