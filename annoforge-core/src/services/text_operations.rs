//! Text Operations Engine
//!
//! Bulk find/replace over caption text in two steps: [`find_replace`] builds
//! a preview without touching the store, [`commit`] applies it with a
//! compare-and-swap per record so concurrent edits are never overwritten.
//! Also hosts the browsing filter [`search`].

use crate::error::{CoreError, CoreResult};
use crate::store::CaptionStore;
use annoforge_common::events::AnnotationEvent;
use chrono::Utc;
use regex::{NoExpand, Regex, RegexBuilder};
use serde::Serialize;
use std::collections::HashSet;
use tracing::{info, warn};

/// Literal substring to find
#[derive(Debug, Clone)]
pub struct FindPattern {
    needle: String,
    // Set for case-insensitive matching only
    folded: Option<Regex>,
}

impl FindPattern {
    /// Exact, case-sensitive substring
    pub fn exact(needle: &str) -> CoreResult<Self> {
        Self::new(needle, false)
    }

    pub fn new(needle: &str, ignore_case: bool) -> CoreResult<Self> {
        if needle.is_empty() {
            return Err(CoreError::InvalidPattern("pattern is empty".to_string()));
        }
        let folded = if ignore_case {
            let regex = RegexBuilder::new(&regex::escape(needle))
                .case_insensitive(true)
                .build()
                .map_err(|e| CoreError::InvalidPattern(e.to_string()))?;
            Some(regex)
        } else {
            None
        };
        Ok(Self {
            needle: needle.to_string(),
            folded,
        })
    }

    pub fn needle(&self) -> &str {
        &self.needle
    }

    pub fn ignores_case(&self) -> bool {
        self.folded.is_some()
    }

    pub fn is_match(&self, text: &str) -> bool {
        match &self.folded {
            Some(regex) => regex.is_match(text),
            None => text.contains(&self.needle),
        }
    }

    /// Replace every occurrence; `replacement` is inserted literally
    pub fn replace_all(&self, text: &str, replacement: &str) -> String {
        match &self.folded {
            Some(regex) => regex.replace_all(text, NoExpand(replacement)).into_owned(),
            None => text.replace(&self.needle, replacement),
        }
    }
}

/// Records a bulk operation applies to
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Scope {
    All,
    Ids(Vec<String>),
}

impl Scope {
    fn filter(&self) -> Option<HashSet<&str>> {
        match self {
            Scope::All => None,
            Scope::Ids(ids) => Some(ids.iter().map(String::as_str).collect()),
        }
    }
}

/// One record a find/replace would change
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PreviewEntry {
    pub id: String,
    pub before: String,
    pub after: String,
}

/// Proposed changes, in snapshot order
#[derive(Debug, Clone)]
pub struct FindReplacePreview {
    pub pattern: FindPattern,
    pub replacement: String,
    pub entries: Vec<PreviewEntry>,
}

impl FindReplacePreview {
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }
}

/// Outcome of [`commit`]
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct CommitReport {
    pub applied: Vec<String>,
    /// Caption changed since the preview; left as is
    pub skipped_stale: Vec<String>,
    /// Record removed since the preview
    pub not_found: Vec<String>,
    /// Caption file write failed: `(id, error)`
    pub failed: Vec<(String, String)>,
}

/// Compute the find/replace preview for `scope`
pub fn find_replace(
    store: &CaptionStore,
    pattern: &FindPattern,
    replacement: &str,
    scope: &Scope,
) -> FindReplacePreview {
    let only = scope.filter();
    let entries = store
        .snapshot()
        .into_iter()
        .filter(|record| only.as_ref().map_or(true, |ids| ids.contains(record.id.as_str())))
        .filter(|record| pattern.is_match(&record.caption_text))
        .filter_map(|record| {
            let after = pattern.replace_all(&record.caption_text, replacement);
            (after != record.caption_text).then(|| PreviewEntry {
                id: record.id,
                before: record.caption_text,
                after,
            })
        })
        .collect();

    FindReplacePreview {
        pattern: pattern.clone(),
        replacement: replacement.to_string(),
        entries,
    }
}

/// Apply a preview
///
/// Each entry is re-checked against the record's current caption; records
/// edited since the preview are reported in `skipped_stale`.
pub fn commit(store: &CaptionStore, preview: &FindReplacePreview) -> CommitReport {
    let mut report = CommitReport::default();

    for entry in &preview.entries {
        let current = match store.get(&entry.id) {
            Some(record) => record.caption_text,
            None => {
                report.not_found.push(entry.id.clone());
                continue;
            }
        };
        if current != entry.before {
            report.skipped_stale.push(entry.id.clone());
            continue;
        }

        let after = preview.pattern.replace_all(&current, &preview.replacement);
        match store.replace_caption_if(&entry.id, &entry.before, &after) {
            Ok(()) => report.applied.push(entry.id.clone()),
            Err(CoreError::StaleEdit(_)) => report.skipped_stale.push(entry.id.clone()),
            Err(CoreError::RecordNotFound(_)) => report.not_found.push(entry.id.clone()),
            Err(e) => {
                warn!(image_id = %entry.id, error = %e, "Find/replace write failed");
                report.failed.push((entry.id.clone(), e.to_string()));
            }
        }
    }

    info!(
        applied = report.applied.len(),
        skipped_stale = report.skipped_stale.len(),
        not_found = report.not_found.len(),
        failed = report.failed.len(),
        "Find/replace committed"
    );
    store.event_bus().emit_lossy(AnnotationEvent::FindReplaceCommitted {
        applied: report.applied.len(),
        skipped_stale: report.skipped_stale.len(),
        timestamp: Utc::now(),
    });

    report
}

/// Browsing filter over `"{id} {caption}"`
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SearchQuery {
    pub term: String,
    /// Interpret `term` as a regular expression
    pub regex: bool,
    /// Return records that do not match
    pub invert: bool,
}

impl SearchQuery {
    pub fn text(term: impl Into<String>) -> Self {
        Self {
            term: term.into(),
            ..Default::default()
        }
    }
}

/// Ids of matching records in snapshot order
///
/// Matching is case-insensitive. An invalid regex matches nothing.
pub fn search(store: &CaptionStore, query: &SearchQuery) -> Vec<String> {
    let matcher: Box<dyn Fn(&str) -> bool> = if query.regex {
        match RegexBuilder::new(&query.term).case_insensitive(true).build() {
            Ok(regex) => Box::new(move |haystack: &str| regex.is_match(haystack)),
            Err(e) => {
                warn!(term = %query.term, error = %e, "Invalid search regex");
                return Vec::new();
            }
        }
    } else {
        let needle = query.term.to_lowercase();
        Box::new(move |haystack: &str| haystack.to_lowercase().contains(&needle))
    };

    store
        .snapshot()
        .into_iter()
        .filter(|record| {
            let haystack = format!("{} {}", record.id, record.caption_text);
            matcher(&haystack) != query.invert
        })
        .map(|record| record.id)
        .collect()
}
