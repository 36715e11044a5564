//! Structural diff between two core logic versions.

use serde::Serialize;
use serde_json::Value;

use corelogic_shared::{ContentCategory, CoreLogicVersion};

/// Changes within one content category.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CategoryDiff {
    pub category: ContentCategory,
    pub from_count: usize,
    pub to_count: usize,
    /// `to_count - from_count`.
    pub delta: i64,
    /// Entries in the newer side without a match in the older one.
    /// Duplicates count, so `[a]` against `[a, a]` adds one `a`.
    pub added: Vec<Value>,
    /// Entries in the older side without a match in the newer one.
    pub removed: Vec<Value>,
}

impl CategoryDiff {
    pub fn is_unchanged(&self) -> bool {
        self.delta == 0 && self.added.is_empty() && self.removed.is_empty()
    }
}

/// Result of comparing two versions of the same domain.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct VersionDiff {
    pub domain_id: String,
    pub from_version_id: String,
    pub to_version_id: String,
    pub from_version: u32,
    pub to_version: u32,
    /// Content hashes match.
    pub identical: bool,
    pub categories: Vec<CategoryDiff>,
}

impl VersionDiff {
    pub fn category(&self, category: ContentCategory) -> Option<&CategoryDiff> {
        self.categories.iter().find(|c| c.category == category)
    }

    /// No category changed at all.
    pub fn is_noop(&self) -> bool {
        self.categories.iter().all(CategoryDiff::is_unchanged)
    }
}

/// Compare `from` against `to`, category by category.
pub fn diff_versions(from: &CoreLogicVersion, to: &CoreLogicVersion) -> VersionDiff {
    let categories = ContentCategory::ALL
        .iter()
        .map(|&category| {
            let old = from.content.category(category);
            let new = to.content.category(category);
            CategoryDiff {
                category,
                from_count: old.len(),
                to_count: new.len(),
                delta: new.len() as i64 - old.len() as i64,
                added: unmatched(new, old),
                removed: unmatched(old, new),
            }
        })
        .collect();

    VersionDiff {
        domain_id: to.domain_id.clone(),
        from_version_id: from.id.clone(),
        to_version_id: to.id.clone(),
        from_version: from.version,
        to_version: to.version,
        identical: from.content_hash == to.content_hash,
        categories,
    }
}

/// Entries of `side` left over after pairing each one with an equal,
/// not yet paired entry of `other`.
fn unmatched(side: &[Value], other: &[Value]) -> Vec<Value> {
    let mut paired = vec![false; other.len()];
    side.iter()
        .filter(|entry| {
            let hit = other
                .iter()
                .enumerate()
                .position(|(i, candidate)| !paired[i] && candidate == *entry);
            match hit {
                Some(i) => {
                    paired[i] = true;
                    false
                }
                None => true,
            }
        })
        .cloned()
        .collect()
}
