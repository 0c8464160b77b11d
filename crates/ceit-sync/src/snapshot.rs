//! Diffing a run's extraction against the site's immediately preceding snapshot.

use std::collections::{BTreeMap, BTreeSet};

use ceit_core::{ChangeType, EquipmentChange, PriceRecord, Snapshot};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PriceChange {
    pub item: String,
    pub before: i64,
    pub after: i64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SnapshotDiff {
    pub baseline: bool,
    pub equipment_added: Vec<String>,
    pub equipment_removed: Vec<String>,
    pub treatments_added: Vec<String>,
    pub treatments_removed: Vec<String>,
    pub price_changes: Vec<PriceChange>,
    pub visual_changed: bool,
    equipment_count: usize,
    treatment_count: usize,
    price_count: usize,
}

/// Sorted and de-duplicated copy of `names`.
pub fn canonical_list(names: impl IntoIterator<Item = String>) -> Vec<String> {
    names
        .into_iter()
        .map(|n| n.trim().to_string())
        .filter(|n| !n.is_empty())
        .collect::<BTreeSet<_>>()
        .into_iter()
        .collect()
}

fn set_difference(left: &[String], right: &[String]) -> Vec<String> {
    let right: BTreeSet<&String> = right.iter().collect();
    left.iter()
        .filter(|item| !right.contains(item))
        .cloned()
        .collect::<BTreeSet<_>>()
        .into_iter()
        .collect()
}

fn price_index<'a>(records: impl Iterator<Item = &'a PriceRecord>) -> BTreeMap<String, i64> {
    let mut index = BTreeMap::new();
    for record in records.filter(|r| !r.is_outlier) {
        index
            .entry(record.display_name().to_string())
            .or_insert(record.total_price);
    }
    index
}

impl SnapshotDiff {
    /// `previous = None` produces a baseline with no equipment changes.
    pub fn compute(
        previous: Option<&Snapshot>,
        equipment: &[String],
        treatments: &[String],
        prices: &[PriceRecord],
        visual_changed: bool,
    ) -> Self {
        let mut diff = SnapshotDiff {
            equipment_count: equipment.len(),
            treatment_count: treatments.len(),
            price_count: prices.len(),
            visual_changed,
            ..Self::default()
        };
        let Some(prev) = previous else {
            diff.baseline = true;
            diff.visual_changed = false;
            return diff;
        };

        diff.equipment_added = set_difference(equipment, &prev.equipment);
        diff.equipment_removed = set_difference(&prev.equipment, equipment);
        diff.treatments_added = set_difference(treatments, &prev.treatments);
        diff.treatments_removed = set_difference(&prev.treatments, treatments);

        let before = price_index(prev.prices.iter().chain(prev.event_prices.iter()));
        let after = price_index(prices.iter());
        diff.price_changes = after
            .iter()
            .filter_map(|(item, now)| {
                let was = before.get(item)?;
                (was != now).then(|| PriceChange {
                    item: item.clone(),
                    before: *was,
                    after: *now,
                })
            })
            .collect();
        diff
    }

    pub fn has_equipment_changes(&self) -> bool {
        !self.equipment_added.is_empty() || !self.equipment_removed.is_empty()
    }

    pub fn summary(&self) -> String {
        if self.baseline {
            return format!(
                "baseline: {} equipment, {} treatments, {} prices",
                self.equipment_count, self.treatment_count, self.price_count
            );
        }
        let mut parts = Vec::new();
        if self.has_equipment_changes() {
            parts.push(format!(
                "equipment {}",
                signed_list(&self.equipment_added, &self.equipment_removed)
            ));
        }
        if !self.treatments_added.is_empty() || !self.treatments_removed.is_empty() {
            parts.push(format!(
                "treatments {}",
                signed_list(&self.treatments_added, &self.treatments_removed)
            ));
        }
        if !self.price_changes.is_empty() {
            let shown = self
                .price_changes
                .iter()
                .take(3)
                .map(|c| format!("{} {}→{}", c.item, c.before, c.after))
                .collect::<Vec<_>>()
                .join(", ");
            parts.push(format!("{} price changes ({shown})", self.price_changes.len()));
        }
        if self.visual_changed {
            parts.push("visual content changed".to_string());
        }
        if parts.is_empty() {
            "text changed; no structural changes".to_string()
        } else {
            parts.join("; ")
        }
    }

    /// Equipment change rows for the new snapshot. Baselines produce none.
    pub fn equipment_changes(
        &self,
        site_id: Uuid,
        snapshot_id: Uuid,
        detected_at: DateTime<Utc>,
        category_of: impl Fn(&str) -> Option<String>,
    ) -> Vec<EquipmentChange> {
        let added = self
            .equipment_added
            .iter()
            .map(|item| (ChangeType::Added, item));
        let removed = self
            .equipment_removed
            .iter()
            .map(|item| (ChangeType::Removed, item));
        added
            .chain(removed)
            .map(|(change_type, item)| EquipmentChange {
                id: Uuid::new_v4(),
                site_id,
                snapshot_id,
                change_type,
                item_name: item.clone(),
                category: category_of(item),
                detected_at,
            })
            .collect()
    }
}

fn signed_list(added: &[String], removed: &[String]) -> String {
    added
        .iter()
        .map(|item| format!("+{item}"))
        .chain(removed.iter().map(|item| format!("-{item}")))
        .collect::<Vec<_>>()
        .join(" ")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn snapshot(equipment: &[&str], prices: Vec<PriceRecord>) -> Snapshot {
        Snapshot {
            id: Uuid::new_v4(),
            site_id: Uuid::new_v4(),
            run_id: Uuid::new_v4(),
            text_hash: "h".into(),
            ocr_hash: None,
            visual_pass_at: None,
            equipment: equipment.iter().map(|s| s.to_string()).collect(),
            treatments: vec!["리프팅".into()],
            prices,
            event_prices: vec![],
            match_rate: 1.0,
            diff_summary: String::new(),
            created_at: Utc::now(),
        }
    }

    fn price(item: &str, total: i64, outlier: bool) -> PriceRecord {
        PriceRecord {
            item_name: item.into(),
            canonical_name: None,
            total_price: total,
            quantity: None,
            unit: None,
            unit_price: None,
            event: None,
            is_outlier: outlier,
            snippet: String::new(),
        }
    }

    #[test]
    fn swapped_equipment_is_reported_both_ways() {
        let prev = snapshot(&["울쎄라"], vec![]);
        let diff = SnapshotDiff::compute(
            Some(&prev),
            &["인모드".to_string()],
            &["리프팅".to_string()],
            &[],
            false,
        );
        assert_eq!(diff.equipment_added, vec!["인모드"]);
        assert_eq!(diff.equipment_removed, vec!["울쎄라"]);
        let summary = diff.summary();
        assert!(summary.contains("울쎄라") && summary.contains("인모드"), "{summary}");

        let site = Uuid::new_v4();
        let snap = Uuid::new_v4();
        let changes = diff.equipment_changes(site, snap, Utc::now(), |item| {
            (item == "인모드").then(|| "lifting".to_string())
        });
        assert_eq!(changes.len(), 2);
        assert_eq!(changes[0].change_type, ChangeType::Added);
        assert_eq!(changes[0].category.as_deref(), Some("lifting"));
        assert_eq!(changes[1].change_type, ChangeType::Removed);
        assert_eq!(changes[1].item_name, "울쎄라");
        assert!(changes.iter().all(|c| c.snapshot_id == snap && c.site_id == site));
    }

    #[test]
    fn first_crawl_is_a_baseline_without_changes() {
        let diff = SnapshotDiff::compute(None, &["울쎄라".to_string()], &[], &[], true);
        assert!(diff.baseline);
        assert!(diff.summary().starts_with("baseline: 1 equipment"));
        assert!(diff
            .equipment_changes(Uuid::new_v4(), Uuid::new_v4(), Utc::now(), |_| None)
            .is_empty());
    }

    #[test]
    fn price_changes_ignore_outliers() {
        let prev = snapshot(
            &["울쎄라"],
            vec![price("울쎄라 300샷", 990_000, false), price("상담", 500, true)],
        );
        let now = vec![price("울쎄라 300샷", 890_000, false), price("상담", 700, true)];
        let diff = SnapshotDiff::compute(
            Some(&prev),
            &["울쎄라".to_string()],
            &["리프팅".to_string()],
            &now,
            false,
        );
        assert!(!diff.has_equipment_changes());
        assert_eq!(
            diff.price_changes,
            vec![PriceChange {
                item: "울쎄라 300샷".into(),
                before: 990_000,
                after: 890_000
            }]
        );
        assert!(diff.summary().starts_with("1 price changes"));
    }

    #[test]
    fn unchanged_lists_summarize_as_text_only_change() {
        let prev = snapshot(&["울쎄라"], vec![]);
        let diff = SnapshotDiff::compute(
            Some(&prev),
            &["울쎄라".to_string()],
            &["리프팅".to_string()],
            &[],
            false,
        );
        assert_eq!(diff.summary(), "text changed; no structural changes");
    }

    #[test]
    fn canonical_lists_are_sorted_and_unique() {
        let list = canonical_list(vec!["인모드".into(), " 울쎄라".into(), "인모드".into(), "".into()]);
        assert_eq!(list, vec!["울쎄라", "인모드"]);
    }
}
