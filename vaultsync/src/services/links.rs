//! Wiki-link extraction
//!
//! Recognizes `[[target]]`, `[[target|alias]]` and `![[embed]]`.

use crate::database::models::NewNoteLink;
use crate::error::{EngineError, Result};
use regex::Regex;
use std::collections::HashSet;

const WIKI_LINK: &str = r"(!?)\[\[([^\]|]+)(?:\|([^\]]+))?\]\]";

#[derive(Debug, Clone)]
pub struct LinkParser {
    pattern: Regex,
}

impl LinkParser {
    pub fn new() -> Result<Self> {
        let pattern = Regex::new(WIKI_LINK)
            .map_err(|e| EngineError::Generic(format!("invalid link pattern: {}", e)))?;
        Ok(Self { pattern })
    }

    /// Links in order of first appearance, one per (target, embed) pair.
    pub fn parse(&self, content: &str) -> Vec<NewNoteLink> {
        let mut seen = HashSet::new();
        let mut links = Vec::new();

        for caps in self.pattern.captures_iter(content) {
            let is_embed = caps.get(1).is_some_and(|m| !m.as_str().is_empty());
            let raw = caps.get(2).map_or("", |m| m.as_str());

            let target = raw.split('#').next().unwrap_or("").trim();
            if target.is_empty() {
                continue;
            }

            if !seen.insert((target.to_string(), is_embed)) {
                continue;
            }

            let link_text = caps
                .get(3)
                .map(|m| m.as_str().trim().to_string())
                .unwrap_or_default();

            links.push(NewNoteLink {
                target_path: target.to_string(),
                link_text,
                is_embed,
            });
        }

        links
    }
}

/// Path hashes a link to `path` may have been stored under (`x.md` and `x`).
pub fn link_targets(path: &str) -> Vec<String> {
    let mut targets = vec![path.to_string()];
    if let Some(stem) = path.strip_suffix(".md") {
        if !stem.is_empty() {
            targets.push(stem.to_string());
        }
    }
    targets
}
