//! Tier assignment and crawl eligibility.

use ceit_core::{Tier, TrackedSite};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SiteFilter {
    pub tier: Option<Tier>,
    pub source: Option<String>,
    pub offset: usize,
    pub limit: Option<usize>,
}

impl SiteFilter {
    fn admits(&self, site: &TrackedSite) -> bool {
        self.tier.map_or(true, |t| site.tier == t)
            && self
                .source
                .as_deref()
                .map_or(true, |s| site.source.eq_ignore_ascii_case(s))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TierAssignment {
    pub site_id: Uuid,
    pub from: Tier,
    pub to: Tier,
}

/// Never-crawled sites are always eligible; otherwise whole elapsed days must reach
/// the tier's minimum interval.
pub fn is_eligible(site: &TrackedSite, now: DateTime<Utc>) -> bool {
    match site.last_crawled_at {
        None => true,
        Some(last) => (now - last).num_days() >= site.tier.min_interval_days(),
    }
}

/// Recomputes every site's tier from its grade and returns the sites that moved.
pub fn assign_tiers(sites: &mut [TrackedSite]) -> Vec<TierAssignment> {
    sites
        .iter_mut()
        .filter_map(|site| {
            let computed = Tier::from_grade(site.grade);
            (computed != site.tier).then(|| {
                let assignment = TierAssignment {
                    site_id: site.id,
                    from: site.tier,
                    to: computed,
                };
                site.tier = computed;
                assignment
            })
        })
        .collect()
}

#[derive(Debug, Clone, Default)]
pub struct SchedulePlan {
    /// The requested page of eligible sites, in crawl order.
    pub eligible: Vec<TrackedSite>,
    pub reassigned: Vec<TierAssignment>,
    pub filtered_out: usize,
    pub skipped_by_schedule: usize,
    /// Eligible, but outside the requested offset/limit window.
    pub deferred: usize,
}

pub fn plan(mut sites: Vec<TrackedSite>, filter: &SiteFilter, now: DateTime<Utc>) -> SchedulePlan {
    let reassigned = assign_tiers(&mut sites);
    let total = sites.len();
    let admitted: Vec<TrackedSite> = sites.into_iter().filter(|s| filter.admits(s)).collect();
    let filtered_out = total - admitted.len();

    let (mut eligible, waiting): (Vec<_>, Vec<_>) =
        admitted.into_iter().partition(|s| is_eligible(s, now));
    // Option orders None first, so never-crawled sites lead within a tier.
    eligible.sort_by(|a, b| {
        (a.tier, a.last_crawled_at, a.id).cmp(&(b.tier, b.last_crawled_at, b.id))
    });

    let eligible_count = eligible.len();
    let page: Vec<TrackedSite> = eligible
        .into_iter()
        .skip(filter.offset)
        .take(filter.limit.unwrap_or(usize::MAX))
        .collect();

    SchedulePlan {
        deferred: eligible_count - page.len(),
        eligible: page,
        reassigned,
        filtered_out,
        skipped_by_schedule: waiting.len(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ceit_core::ImportanceGrade;
    use chrono::{Duration, TimeZone};

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 30, 3, 0, 0).single().expect("ts")
    }

    fn site(grade: Option<ImportanceGrade>, days_ago: Option<i64>, source: &str) -> TrackedSite {
        TrackedSite {
            id: Uuid::new_v4(),
            name: "site".into(),
            url: "https://clinic.example".into(),
            source: source.into(),
            tier: Tier::from_grade(grade),
            grade,
            last_crawled_at: days_ago.map(|d| now() - Duration::days(d)),
        }
    }

    #[test]
    fn eligibility_follows_tier_intervals() {
        let cases = [
            (Some(ImportanceGrade::S), Some(6), false),
            (Some(ImportanceGrade::A), Some(7), true),
            (Some(ImportanceGrade::B), Some(13), false),
            (Some(ImportanceGrade::B), Some(14), true),
            (None, Some(29), false),
            (Some(ImportanceGrade::D), Some(30), true),
            (Some(ImportanceGrade::S), None, true),
            (None, None, true),
        ];
        for (grade, days_ago, expected) in cases {
            assert_eq!(
                is_eligible(&site(grade, days_ago, "naver"), now()),
                expected,
                "{grade:?} {days_ago:?}"
            );
        }
    }

    #[test]
    fn partial_days_do_not_count() {
        let mut s = site(Some(ImportanceGrade::S), None, "naver");
        s.last_crawled_at = Some(now() - Duration::days(7) + Duration::minutes(1));
        assert!(!is_eligible(&s, now()));
    }

    #[test]
    fn grade_changes_reassign_tiers() {
        let mut sites = vec![site(Some(ImportanceGrade::B), None, "naver")];
        sites[0].grade = Some(ImportanceGrade::S);
        let moved = assign_tiers(&mut sites);
        assert_eq!(moved.len(), 1);
        assert_eq!((moved[0].from, moved[0].to), (Tier::Tier2, Tier::Tier1));
        assert_eq!(sites[0].tier, Tier::Tier1);
        assert!(assign_tiers(&mut sites).is_empty());
    }

    #[test]
    fn plan_orders_filters_and_pages() {
        let fresh_t3 = site(None, None, "naver");
        let old_t1 = site(Some(ImportanceGrade::S), Some(20), "naver");
        let new_t1 = site(Some(ImportanceGrade::A), None, "naver");
        let recent_t2 = site(Some(ImportanceGrade::B), Some(3), "naver");
        let other_source = site(Some(ImportanceGrade::S), None, "gangnamunni");
        let sites = vec![
            fresh_t3.clone(),
            old_t1.clone(),
            new_t1.clone(),
            recent_t2,
            other_source,
        ];

        let filter = SiteFilter {
            source: Some("NAVER".into()),
            ..SiteFilter::default()
        };
        let plan_all = plan(sites.clone(), &filter, now());
        let order: Vec<Uuid> = plan_all.eligible.iter().map(|s| s.id).collect();
        assert_eq!(order, vec![new_t1.id, old_t1.id, fresh_t3.id]);
        assert_eq!(plan_all.filtered_out, 1);
        assert_eq!(plan_all.skipped_by_schedule, 1);
        assert_eq!(plan_all.deferred, 0);

        let paged = plan(
            sites.clone(),
            &SiteFilter {
                offset: 1,
                limit: Some(1),
                ..filter.clone()
            },
            now(),
        );
        assert_eq!(paged.eligible.len(), 1);
        assert_eq!(paged.eligible[0].id, old_t1.id);
        assert_eq!(paged.deferred, 2);

        let tier_only = plan(
            sites,
            &SiteFilter {
                tier: Some(Tier::Tier3),
                ..SiteFilter::default()
            },
            now(),
        );
        assert_eq!(tier_only.eligible.len(), 1);
        assert_eq!(tier_only.filtered_out, 4);
    }
}
