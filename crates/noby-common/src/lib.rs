//! # noby-common
//!
//! Shared utilities and types for the noby image builder.
//!
//! This crate provides common functionality used across all noby crates:
//! - Layer keys and tag names
//! - Standard filesystem paths
//! - Common error types

#![warn(missing_docs)]

pub mod error;
pub mod key;
pub mod paths;

pub use error::{NobyError, NobyResult};
pub use key::{LayerKey, SCRATCH, TagName};
pub use paths::NobyPaths;
