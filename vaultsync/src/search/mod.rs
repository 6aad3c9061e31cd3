//! Full-text search over note content
//!
//! `tokenizer` turns raw user keywords into safe FTS5 expressions and LIKE
//! patterns; `index` owns the per-user `note_fts` table.

pub mod index;
pub mod tokenizer;

pub use index::{FtsIndex, SearchHit};
pub use tokenizer::{build_match_query, escape_like};
