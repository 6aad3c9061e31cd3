//! Three-way text merge
//!
//! Both sides are diffed against their common base and reduced to edits
//! over base character ranges. Edits that touch disjoint ranges are
//! combined; two different edits over the same range are a conflict.

use similar::{ChangeTag, TextDiff};
use std::time::Duration;

const MERGE_DIFF_TIMEOUT: Duration = Duration::from_secs(2);

/// Replacement of base characters `start..end` with `text`
#[derive(Debug, Clone, PartialEq, Eq)]
struct Edit {
    start: usize,
    end: usize,
    text: String,
}

impl Edit {
    fn overlaps(&self, other: &Edit) -> bool {
        self.start == other.start || (self.start < other.end && other.start < self.end)
    }
}

fn edits(base: &str, side: &str) -> Vec<Edit> {
    let diff = TextDiff::configure()
        .timeout(MERGE_DIFF_TIMEOUT)
        .diff_chars(base, side);

    let mut edits = Vec::new();
    let mut current: Option<Edit> = None;
    let mut pos = 0usize;

    for change in diff.iter_all_changes() {
        let value = change.value();
        match change.tag() {
            ChangeTag::Equal => {
                if let Some(edit) = current.take() {
                    edits.push(edit);
                }
                pos += value.chars().count();
            }
            ChangeTag::Delete => {
                let len = value.chars().count();
                current
                    .get_or_insert_with(|| Edit {
                        start: pos,
                        end: pos,
                        text: String::new(),
                    })
                    .end += len;
                pos += len;
            }
            ChangeTag::Insert => {
                current
                    .get_or_insert_with(|| Edit {
                        start: pos,
                        end: pos,
                        text: String::new(),
                    })
                    .text
                    .push_str(value);
            }
        }
    }

    if let Some(edit) = current {
        edits.push(edit);
    }
    edits
}

/// Merge `ours` and `theirs`, both derived from `base`.
///
/// Returns `None` when the two sides changed the same region differently.
pub fn merge_texts(base: &str, ours: &str, theirs: &str) -> Option<String> {
    if ours == theirs || theirs == base {
        return Some(ours.to_string());
    }
    if ours == base {
        return Some(theirs.to_string());
    }

    let chars: Vec<char> = base.chars().collect();
    let ours = edits(base, ours);
    let theirs = edits(base, theirs);

    let mut out = String::with_capacity(base.len());
    let mut pos = 0usize;
    let (mut i, mut j) = (0usize, 0usize);

    loop {
        let next = match (ours.get(i), theirs.get(j)) {
            (None, None) => break,
            (Some(a), None) => {
                i += 1;
                a
            }
            (None, Some(b)) => {
                j += 1;
                b
            }
            (Some(a), Some(b)) if a == b => {
                i += 1;
                j += 1;
                a
            }
            (Some(a), Some(b)) if a.overlaps(b) => return None,
            (Some(a), Some(b)) => {
                if (a.start, a.end) <= (b.start, b.end) {
                    i += 1;
                    a
                } else {
                    j += 1;
                    b
                }
            }
        };

        if next.start < pos || next.end > chars.len() {
            return None;
        }
        out.extend(&chars[pos..next.start]);
        out.push_str(&next.text);
        pos = next.end;
    }

    out.extend(&chars[pos..]);
    Some(out)
}
