//! Resolution of raw extracted names to canonical catalog entries.
//!
//! Matching is a pure function of `(name, catalog, config)`: entries are held in a fixed
//! order and every tie is broken by that order, so repeated calls always agree.

use std::collections::BTreeSet;

use ceit_core::{CatalogEntry, ItemKind};
use serde::{Deserialize, Serialize};
use strsim::jaro_winkler;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct MatcherConfig {
    /// Minimum Jaro-Winkler similarity for a fuzzy match.
    pub fuzzy_threshold: f64,
    /// Shorter keywords are ignored for containment and decomposition.
    pub min_contained_keyword_chars: usize,
}

impl Default for MatcherConfig {
    fn default() -> Self {
        Self {
            fuzzy_threshold: 0.92,
            min_contained_keyword_chars: 2,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MatchMethod {
    Exact,
    Contained,
    Fuzzy,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CanonicalMatch {
    pub entry_id: Uuid,
    pub canonical_name: String,
    pub category: String,
    pub kind: ItemKind,
    pub method: MatchMethod,
    pub score: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NameMatch {
    pub raw: String,
    pub canonical: Option<CanonicalMatch>,
}

impl NameMatch {
    /// Canonical name when resolved, otherwise the raw name unchanged.
    pub fn display_name(&self) -> &str {
        self.canonical
            .as_ref()
            .map(|c| c.canonical_name.as_str())
            .unwrap_or(self.raw.as_str())
    }

    pub fn is_resolved(&self) -> bool {
        self.canonical.is_some()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MatchReport {
    pub kind: ItemKind,
    pub matches: Vec<NameMatch>,
}

impl MatchReport {
    pub fn total(&self) -> usize {
        self.matches.len()
    }

    pub fn matched(&self) -> usize {
        self.matches.iter().filter(|m| m.is_resolved()).count()
    }

    /// matched / total; an empty report has rate 0.0.
    pub fn match_rate(&self) -> f64 {
        if self.matches.is_empty() {
            0.0
        } else {
            self.matched() as f64 / self.total() as f64
        }
    }

    pub fn unresolved(&self) -> Vec<&str> {
        self.matches
            .iter()
            .filter(|m| !m.is_resolved())
            .map(|m| m.raw.as_str())
            .collect()
    }

    /// Sorted, de-duplicated canonical-or-raw names.
    pub fn display_names(&self) -> Vec<String> {
        self.matches
            .iter()
            .map(|m| m.display_name().to_string())
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect()
    }

    pub fn category_of(&self, display_name: &str) -> Option<&str> {
        self.matches
            .iter()
            .filter_map(|m| m.canonical.as_ref())
            .find(|c| c.canonical_name == display_name)
            .map(|c| c.category.as_str())
    }
}

/// Lowercase, alphanumerics only (Hangul included).
pub fn normalize_name(raw: &str) -> String {
    raw.chars()
        .filter(|c| c.is_alphanumeric())
        .flat_map(char::to_lowercase)
        .collect()
}

/// Outcome of resolving one name within a kind.
#[derive(Debug)]
enum Resolution {
    Matched(CanonicalMatch),
    /// Keywords of two or more entries; left unresolved for decomposition.
    Compound,
    Unmatched,
}

impl Resolution {
    fn into_match(self) -> Option<CanonicalMatch> {
        match self {
            Resolution::Matched(m) => Some(m),
            Resolution::Compound | Resolution::Unmatched => None,
        }
    }
}

#[derive(Debug, Clone)]
struct IndexedEntry {
    entry: CatalogEntry,
    terms: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct CatalogMatcher {
    entries: Vec<IndexedEntry>,
    config: MatcherConfig,
}

impl CatalogMatcher {
    pub fn new(catalog: &[CatalogEntry], config: MatcherConfig) -> Self {
        let mut entries: Vec<IndexedEntry> = catalog
            .iter()
            .map(|entry| {
                let terms = std::iter::once(entry.canonical_name.as_str())
                    .chain(entry.keywords.iter().map(String::as_str))
                    .map(normalize_name)
                    .filter(|t| !t.is_empty())
                    .collect::<BTreeSet<_>>()
                    .into_iter()
                    .collect();
                IndexedEntry {
                    entry: entry.clone(),
                    terms,
                }
            })
            .collect();
        entries.sort_by(|a, b| {
            (a.entry.kind, &a.entry.canonical_name, a.entry.id).cmp(&(
                b.entry.kind,
                &b.entry.canonical_name,
                b.entry.id,
            ))
        });
        Self { entries, config }
    }

    pub fn config(&self) -> &MatcherConfig {
        &self.config
    }

    fn of_kind(&self, kind: ItemKind) -> impl Iterator<Item = &IndexedEntry> {
        self.entries.iter().filter(move |e| e.entry.kind == kind)
    }

    fn resolved(entry: &CatalogEntry, method: MatchMethod, score: f64) -> CanonicalMatch {
        CanonicalMatch {
            entry_id: entry.id,
            canonical_name: entry.canonical_name.clone(),
            category: entry.category.clone(),
            kind: entry.kind,
            method,
            score,
        }
    }

    pub fn match_name(&self, kind: ItemKind, raw: &str) -> NameMatch {
        NameMatch {
            raw: raw.to_string(),
            canonical: self.resolve(kind, &normalize_name(raw)).into_match(),
        }
    }

    /// Equipment first, then treatments.
    pub fn match_any_kind(&self, raw: &str) -> NameMatch {
        let normalized = normalize_name(raw);
        let canonical = match self.resolve(ItemKind::Equipment, &normalized) {
            Resolution::Matched(m) => Some(m),
            Resolution::Compound => None,
            Resolution::Unmatched => self.resolve(ItemKind::Treatment, &normalized).into_match(),
        };
        NameMatch {
            raw: raw.to_string(),
            canonical,
        }
    }

    pub fn match_all(&self, kind: ItemKind, names: &[String]) -> MatchReport {
        MatchReport {
            kind,
            matches: names.iter().map(|n| self.match_name(kind, n)).collect(),
        }
    }

    fn resolve(&self, kind: ItemKind, normalized: &str) -> Resolution {
        if normalized.is_empty() {
            return Resolution::Unmatched;
        }

        if let Some(hit) = self
            .of_kind(kind)
            .find(|e| e.terms.iter().any(|t| t == normalized))
        {
            return Resolution::Matched(Self::resolved(&hit.entry, MatchMethod::Exact, 1.0));
        }

        match self.resolve_contained(kind, normalized) {
            Resolution::Unmatched => {}
            decided => return decided,
        }

        let mut best: Option<(&IndexedEntry, f64)> = None;
        for entry in self.of_kind(kind) {
            for term in &entry.terms {
                let score = jaro_winkler(normalized, term);
                if best.map_or(true, |(_, s)| score > s) {
                    best = Some((entry, score));
                }
            }
        }
        best.filter(|(_, score)| *score >= self.config.fuzzy_threshold)
            .map_or(Resolution::Unmatched, |(entry, score)| {
                Resolution::Matched(Self::resolved(&entry.entry, MatchMethod::Fuzzy, score))
            })
    }

    /// Resolves only when the contained keywords point at exactly one entry.
    fn resolve_contained(&self, kind: ItemKind, normalized: &str) -> Resolution {
        let min_chars = self.config.min_contained_keyword_chars.max(1);
        let mut hits: Vec<(&IndexedEntry, &str)> = Vec::new();
        for entry in self.of_kind(kind) {
            let longest = entry
                .terms
                .iter()
                .filter(|t| t.chars().count() >= min_chars && normalized.contains(t.as_str()))
                .max_by_key(|t| t.chars().count());
            if let Some(term) = longest {
                hits.push((entry, term.as_str()));
            }
        }
        // A keyword swallowed by another entry's longer keyword does not count.
        let surviving: Vec<_> = hits
            .iter()
            .filter(|(entry, term)| {
                !hits.iter().any(|(other, other_term)| {
                    other.entry.id != entry.entry.id
                        && other_term.len() > term.len()
                        && other_term.contains(term)
                })
            })
            .collect();
        match surviving.as_slice() {
            [] => Resolution::Unmatched,
            [(entry, term)] => {
                let score = term.chars().count() as f64 / normalized.chars().count() as f64;
                Resolution::Matched(Self::resolved(&entry.entry, MatchMethod::Contained, score))
            }
            _ => Resolution::Compound,
        }
    }
}
