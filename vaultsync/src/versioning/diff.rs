//! Character-level diff patches
//!
//! A patch is a JSON list of operations walked over the base text:
//! `equal`/`delete` consume `len` characters, `insert` emits `text`.

use crate::error::{EngineError, Result};
use serde::{Deserialize, Serialize};
use similar::{ChangeTag, TextDiff};
use std::time::Duration;

/// Bound on diff computation; past it the patch is valid but not minimal.
const DIFF_TIMEOUT: Duration = Duration::from_secs(2);

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "lowercase")]
pub enum PatchOp {
    Equal { len: usize },
    Delete { len: usize },
    Insert { text: String },
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Patch {
    pub ops: Vec<PatchOp>,
}

impl Patch {
    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn from_json(raw: &str) -> Result<Self> {
        if raw.trim().is_empty() {
            return Ok(Patch::default());
        }
        Ok(serde_json::from_str(raw)?)
    }

    /// True when applying the patch reproduces the base unchanged
    pub fn is_identity(&self) -> bool {
        self.ops.iter().all(|op| matches!(op, PatchOp::Equal { .. }))
    }
}

/// Compute the patch turning `old` into `new`.
pub fn compute_patch(old: &str, new: &str) -> Patch {
    let diff = TextDiff::configure()
        .timeout(DIFF_TIMEOUT)
        .diff_chars(old, new);

    let mut ops: Vec<PatchOp> = Vec::new();
    for change in diff.iter_all_changes() {
        push_change(&mut ops, change.tag(), change.value());
    }

    Patch { ops }
}

fn push_change(ops: &mut Vec<PatchOp>, tag: ChangeTag, value: &str) {
    let chars = value.chars().count();

    match (ops.last_mut(), tag) {
        (Some(PatchOp::Equal { len }), ChangeTag::Equal) => *len += chars,
        (Some(PatchOp::Delete { len }), ChangeTag::Delete) => *len += chars,
        (Some(PatchOp::Insert { text }), ChangeTag::Insert) => text.push_str(value),
        (_, ChangeTag::Equal) => ops.push(PatchOp::Equal { len: chars }),
        (_, ChangeTag::Delete) => ops.push(PatchOp::Delete { len: chars }),
        (_, ChangeTag::Insert) => ops.push(PatchOp::Insert {
            text: value.to_string(),
        }),
    }
}

/// Apply a patch to its base text.
///
/// Fails when the patch consumes more or fewer characters than `base` has.
pub fn apply_patch(base: &str, patch: &Patch) -> Result<String> {
    let chars: Vec<char> = base.chars().collect();
    let mut pos = 0usize;
    let mut out = String::with_capacity(base.len());

    for op in &patch.ops {
        match op {
            PatchOp::Equal { len } => {
                let end = checked_end(pos, *len, chars.len())?;
                out.extend(&chars[pos..end]);
                pos = end;
            }
            PatchOp::Delete { len } => {
                pos = checked_end(pos, *len, chars.len())?;
            }
            PatchOp::Insert { text } => out.push_str(text),
        }
    }

    if pos != chars.len() {
        return Err(EngineError::Patch(format!(
            "patch covers {} of {} base characters",
            pos,
            chars.len()
        )));
    }

    Ok(out)
}

fn checked_end(pos: usize, len: usize, total: usize) -> Result<usize> {
    let end = pos
        .checked_add(len)
        .ok_or_else(|| EngineError::Patch(format!("patch length {} overflows", len)))?;
    if end > total {
        return Err(EngineError::Patch(format!(
            "patch runs past end of base ({} > {})",
            end, total
        )));
    }
    Ok(end)
}
