//! Splits unresolved names into the catalog keywords they contain plus a residual.

use std::collections::BTreeSet;

use ceit_core::{CatalogEntry, CompoundCandidate, ItemKind};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Per-character lowercase fold. Unlike `str::to_lowercase` it never changes the
/// character count, so positions in the folded text line up with the original.
pub fn fold_case(text: &str) -> String {
    text.chars().map(fold_char).collect()
}

fn fold_char(c: char) -> char {
    c.to_lowercase().next().unwrap_or(c)
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Decomposition {
    pub raw: String,
    /// Keywords in order of first appearance in `raw`.
    pub matched_keywords: Vec<String>,
    pub matched_canonicals: Vec<String>,
    pub residual: String,
}

#[derive(Debug, Clone)]
struct Keyword {
    text: String,
    folded: Vec<char>,
    canonical: String,
}

#[derive(Debug, Clone)]
pub struct Decomposer {
    keywords: Vec<Keyword>,
}

impl Decomposer {
    /// Indexes canonical names and keywords of every kind. Keywords shorter than
    /// `min_chars` are ignored.
    pub fn new(catalog: &[CatalogEntry], min_chars: usize) -> Self {
        let mut seen = BTreeSet::new();
        let mut keywords: Vec<Keyword> = Vec::new();
        for entry in catalog {
            for term in std::iter::once(&entry.canonical_name).chain(entry.keywords.iter()) {
                let text = term.trim();
                let folded: Vec<char> = text.chars().map(fold_char).collect();
                if folded.len() < min_chars.max(1) {
                    continue;
                }
                let key: String = folded.iter().collect();
                if !seen.insert((key, entry.canonical_name.clone())) {
                    continue;
                }
                keywords.push(Keyword {
                    text: text.to_string(),
                    folded,
                    canonical: entry.canonical_name.clone(),
                });
            }
        }
        // Longest first so a longer keyword claims its span before any substring of it.
        keywords.sort_by(|a, b| {
            b.folded
                .len()
                .cmp(&a.folded.len())
                .then_with(|| a.folded.cmp(&b.folded))
                .then_with(|| a.canonical.cmp(&b.canonical))
        });
        Self { keywords }
    }

    pub fn decompose(&self, raw: &str) -> Decomposition {
        let chars: Vec<char> = raw.chars().collect();
        let folded: Vec<char> = chars.iter().copied().map(fold_char).collect();
        let mut claimed = vec![false; chars.len()];
        let mut found: Vec<(usize, &Keyword)> = Vec::new();

        for keyword in &self.keywords {
            let width = keyword.folded.len();
            if width > folded.len() {
                continue;
            }
            let mut first_hit = None;
            let mut start = 0;
            while start + width <= folded.len() {
                let span = start..start + width;
                if folded[span.clone()] == keyword.folded[..] && !claimed[span.clone()].contains(&true)
                {
                    claimed[span].iter_mut().for_each(|c| *c = true);
                    first_hit.get_or_insert(start);
                    start += width;
                } else {
                    start += 1;
                }
            }
            if let Some(pos) = first_hit {
                found.push((pos, keyword));
            }
        }
        found.sort_by_key(|(pos, _)| *pos);

        let mut matched_keywords = Vec::new();
        let mut matched_canonicals: Vec<String> = Vec::new();
        for (pos, keyword) in &found {
            // Report the text as it appears in the name.
            let literal: String = chars[*pos..*pos + keyword.folded.len()].iter().collect();
            if !matched_keywords.contains(&literal) {
                matched_keywords.push(literal);
            }
            if !matched_canonicals.contains(&keyword.canonical) {
                matched_canonicals.push(keyword.canonical.clone());
            }
        }

        let residual: String = chars
            .iter()
            .zip(&claimed)
            .map(|(c, taken)| if *taken || is_joiner(*c) { ' ' } else { *c })
            .collect();
        let residual = residual.split_whitespace().collect::<Vec<_>>().join(" ");

        Decomposition {
            raw: raw.to_string(),
            matched_keywords,
            matched_canonicals,
            residual,
        }
    }

    /// One candidate per distinct unresolved name, including names with no keyword
    /// at all.
    pub fn candidates<'a>(
        &self,
        kind: ItemKind,
        unresolved: impl IntoIterator<Item = &'a str>,
        site_id: Uuid,
        run_id: Uuid,
        at: DateTime<Utc>,
    ) -> Vec<CompoundCandidate> {
        let mut seen = BTreeSet::new();
        unresolved
            .into_iter()
            .map(str::trim)
            .filter(|name| !name.is_empty() && seen.insert(fold_case(name)))
            .map(|name| {
                let parts = self.decompose(name);
                CompoundCandidate {
                    id: Uuid::new_v4(),
                    site_id,
                    run_id,
                    kind,
                    raw_name: parts.raw,
                    matched_keywords: parts.matched_keywords,
                    matched_canonicals: parts.matched_canonicals,
                    residual: parts.residual,
                    created_at: at,
                }
            })
            .collect()
    }

    pub fn keyword_count(&self) -> usize {
        self.keywords.len()
    }

    pub fn keywords(&self) -> impl Iterator<Item = &str> {
        self.keywords.iter().map(|k| k.text.as_str())
    }
}

fn is_joiner(c: char) -> bool {
    matches!(c, '+' | '&' | '/' | ',' | '|' | '·' | '(' | ')' | '[' | ']')
}
