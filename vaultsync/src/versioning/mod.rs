//! Version tracking primitives
//!
//! Hashes used for change detection and path lookup, the diff patch
//! format stored with every history entry, and the merge used when two
//! devices edit the same note.

pub mod diff;
pub mod hash;
pub mod merge;

pub use diff::{apply_patch, compute_patch, Patch, PatchOp};
pub use hash::{bytes_hash, content_hash, path_hash};
pub use merge::merge_texts;
