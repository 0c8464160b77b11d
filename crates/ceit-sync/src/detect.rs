//! Content hashing and the skip/extract/visual decision for a site run.

use std::collections::BTreeSet;

use ceit_adapters::strip_volatile;
use ceit_core::{Snapshot, Tier};
use ceit_extract::normalize_name;
use ceit_storage::sha256_hex;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::config::VisualIntervals;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "decision", rename_all = "snake_case")]
pub enum ChangeDecision {
    FirstCrawl { visual_pass: bool },
    Unchanged,
    Changed { visual_pass: bool },
}

impl ChangeDecision {
    pub fn proceeds(self) -> bool {
        !matches!(self, ChangeDecision::Unchanged)
    }

    pub fn visual_pass(self) -> bool {
        match self {
            ChangeDecision::FirstCrawl { visual_pass } | ChangeDecision::Changed { visual_pass } => {
                visual_pass
            }
            ChangeDecision::Unchanged => false,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ChangeDecision::FirstCrawl { .. } => "first_crawl",
            ChangeDecision::Unchanged => "unchanged",
            ChangeDecision::Changed { .. } => "changed",
        }
    }
}

/// Hash of the visible text after volatile fragments are removed.
pub fn text_hash(text: &str) -> String {
    sha256_hex(strip_volatile(text).as_bytes())
}

/// Hash of recognized names, independent of order, case and spacing.
pub fn ocr_hash<'a>(names: impl IntoIterator<Item = &'a str>) -> String {
    let normalized: BTreeSet<String> = names
        .into_iter()
        .map(normalize_name)
        .filter(|n| !n.is_empty())
        .collect();
    let joined = normalized.into_iter().collect::<Vec<_>>().join("\n");
    sha256_hex(joined.as_bytes())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChangeDetector {
    intervals: VisualIntervals,
}

impl ChangeDetector {
    pub fn new(intervals: VisualIntervals) -> Self {
        Self { intervals }
    }

    /// Whether a visual pass is due, ignoring the text hash.
    pub fn visual_due(
        &self,
        last_visual_pass: Option<DateTime<Utc>>,
        tier: Tier,
        text_only: bool,
        now: DateTime<Utc>,
    ) -> bool {
        if text_only {
            return false;
        }
        match last_visual_pass {
            None => true,
            Some(at) => (now - at).num_days() >= self.intervals.days_for(tier),
        }
    }

    pub fn decide(
        &self,
        previous: Option<&Snapshot>,
        current_text_hash: &str,
        tier: Tier,
        text_only: bool,
        now: DateTime<Utc>,
    ) -> ChangeDecision {
        match previous {
            None => ChangeDecision::FirstCrawl {
                visual_pass: self.visual_due(None, tier, text_only, now),
            },
            Some(prev) if prev.text_hash == current_text_hash => ChangeDecision::Unchanged,
            Some(prev) => ChangeDecision::Changed {
                visual_pass: self.visual_due(prev.visual_pass_at, tier, text_only, now),
            },
        }
    }
}

/// OCR state to store on the new snapshot: fresh when a pass ran, otherwise carried.
pub fn carry_visual_state(
    previous: Option<&Snapshot>,
    fresh: Option<(String, DateTime<Utc>)>,
) -> (Option<String>, Option<DateTime<Utc>>) {
    match fresh {
        Some((hash, at)) => (Some(hash), Some(at)),
        None => previous
            .map(|p| (p.ocr_hash.clone(), p.visual_pass_at))
            .unwrap_or((None, None)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};
    use uuid::Uuid;

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 30, 3, 0, 0).single().expect("ts")
    }

    fn previous(hash: &str, visual_days_ago: Option<i64>) -> Snapshot {
        Snapshot {
            id: Uuid::new_v4(),
            site_id: Uuid::new_v4(),
            run_id: Uuid::new_v4(),
            text_hash: hash.into(),
            ocr_hash: visual_days_ago.map(|_| "ocr".to_string()),
            visual_pass_at: visual_days_ago.map(|d| now() - Duration::days(d)),
            equipment: vec![],
            treatments: vec![],
            prices: vec![],
            event_prices: vec![],
            match_rate: 0.0,
            diff_summary: String::new(),
            created_at: now() - Duration::days(10),
        }
    }

    #[test]
    fn volatile_noise_does_not_change_the_text_hash() {
        let a = text_hash("인모드 150,000원\n오늘 방문자 12\n2026-03-01");
        let b = text_hash("인모드 150,000원\n오늘 방문자 97\n2026-03-29");
        assert_eq!(a, b);
        assert_ne!(a, text_hash("인모드 180,000원"));
    }

    #[test]
    fn ocr_hash_ignores_order_and_case() {
        assert_eq!(ocr_hash(["Ulthera", "인모드"]), ocr_hash(["인모드", "ulthera ", "ULTHERA"]));
        assert_ne!(ocr_hash(["인모드"]), ocr_hash(["울쎄라"]));
    }

    #[test]
    fn decision_table() {
        let detector = ChangeDetector::new(VisualIntervals::default());
        let prev = previous("h1", Some(10));

        assert_eq!(
            detector.decide(None, "h1", Tier::Tier3, false, now()),
            ChangeDecision::FirstCrawl { visual_pass: true }
        );
        assert_eq!(
            detector.decide(None, "h1", Tier::Tier3, true, now()),
            ChangeDecision::FirstCrawl { visual_pass: false }
        );
        assert_eq!(
            detector.decide(Some(&prev), "h1", Tier::Tier1, false, now()),
            ChangeDecision::Unchanged
        );
        assert_eq!(
            detector.decide(Some(&prev), "h2", Tier::Tier1, false, now()),
            ChangeDecision::Changed { visual_pass: true }
        );
        assert_eq!(
            detector.decide(Some(&prev), "h2", Tier::Tier3, false, now()),
            ChangeDecision::Changed { visual_pass: false }
        );
        let never_visual = previous("h1", None);
        assert!(detector
            .decide(Some(&never_visual), "h2", Tier::Tier3, false, now())
            .visual_pass());
    }

    #[test]
    fn visual_state_carries_forward_without_a_pass() {
        let prev = previous("h1", Some(10));
        let (hash, at) = carry_visual_state(Some(&prev), None);
        assert_eq!(hash.as_deref(), Some("ocr"));
        assert_eq!(at, prev.visual_pass_at);
        let (hash, at) = carry_visual_state(Some(&prev), Some(("fresh".into(), now())));
        assert_eq!(hash.as_deref(), Some("fresh"));
        assert_eq!(at, Some(now()));
        assert_eq!(carry_visual_state(None, None), (None, None));
    }
}
