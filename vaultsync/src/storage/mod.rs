//! Storage module
//!
//! Provides the filesystem content store for note bodies, snapshots,
//! history patches and file blobs.

pub mod content_store;

pub use content_store::{ContentKind, ContentStore};
