//! # noby-store
//!
//! Copy-on-write layer storage for noby.
//!
//! This crate provides:
//! - Snapshot backends (btrfs subvolumes, plain directories)
//! - The persisted layer index and content digests
//! - The tag registry
//! - Store-wide locking between processes

#![warn(missing_docs)]

pub mod backend;
/// Content digests of snapshot trees.
pub mod digest;
/// Persisted layer index.
pub mod index;
pub mod layer;
pub mod lock;
pub mod tags;

pub use backend::{BackendKind, BtrfsBackend, DirectoryBackend, SnapshotBackend};
pub use index::{LayerIndex, LayerRecord};
pub use layer::{Layer, LayerStore, SealRequest, WritableSnapshot};
pub use lock::{LockMode, StoreLock};
pub use tags::TagRegistry;
