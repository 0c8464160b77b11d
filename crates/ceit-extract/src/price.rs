//! Structured price extraction from free text.

use std::collections::HashSet;
use std::sync::LazyLock;

use ceit_core::{EventPricing, PriceRecord};
use chrono::{Datelike, Duration, NaiveDate};
use regex::{Captures, Regex};
use serde::{Deserialize, Serialize};

use crate::matcher::normalize_name;

static PRICE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?P<num>\d{1,3}(?:,\d{3})+|\d+(?:\.\d+)?)\s*(?P<man>만)?\s*원")
        .expect("price pattern")
});
static QUANTITY: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)(\d{1,3}(?:,\d{3})+|\d+)\s*(샷|shot|회|cc|유닛|unit|줄|kj|부위)")
        .expect("quantity pattern")
});
static TILDE_DATE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"~\s*(?:(\d{4})\s*[./-]\s*)?(\d{1,2})\s*[./월-]\s*(\d{1,2})")
        .expect("tilde date pattern")
});
static UNTIL_DATE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?:(\d{4})\s*[./년-]\s*)?(\d{1,2})\s*[./월-]\s*(\d{1,2})\s*일?\s*까지")
        .expect("until date pattern")
});
static CONDITION: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)(첫\s*방문|신규\s*고객|신규|재방문|선착순\s*\d+\s*명|1인\s*1회|vat\s*별도|부가세\s*별도)")
        .expect("condition pattern")
});

const EVENT_MARKERS: [&str; 9] = [
    "이벤트", "할인", "특가", "프로모션", "한정", "오픈기념", "event", "promotion", "sale",
];
const TRAILING_QUALIFIERS: [&str; 12] = [
    "정상가", "이벤트가", "할인가", "특가", "판매가", "최저가", "시술가", "가격", "정가", "비용",
    "only", "단독",
];
const SEPARATORS: [char; 16] = [
    ':', '\u{ff1a}', '-', '\u{2013}', '\u{2014}', '~', '\u{2192}', '|', '/', '\u{b7}', ',', '=',
    '>', '*', '\u{2022}', '.',
];
const MAX_SNIPPET_CHARS: usize = 120;
const MAX_EVENT_LABEL_CHARS: usize = 60;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct OutlierPolicy {
    /// Factor away from the run median beyond which a price is an outlier.
    pub ratio: f64,
    /// The median test applies only with at least this many plausible prices.
    pub min_samples: usize,
    pub min_plausible_krw: i64,
    pub max_plausible_krw: i64,
}

impl Default for OutlierPolicy {
    fn default() -> Self {
        Self {
            ratio: 20.0,
            min_samples: 4,
            min_plausible_krw: 1_000,
            max_plausible_krw: 50_000_000,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PriceConfig {
    pub max_label_chars: usize,
    pub outlier: OutlierPolicy,
}

impl Default for PriceConfig {
    fn default() -> Self {
        Self {
            max_label_chars: 40,
            outlier: OutlierPolicy::default(),
        }
    }
}

/// Parses every (label, price) pair in `text`. Labels are unique in the output; the
/// first occurrence wins. `reference` anchors year-less event end dates.
pub fn extract_prices(text: &str, reference: NaiveDate, config: &PriceConfig) -> Vec<PriceRecord> {
    let mut records = Vec::new();
    let mut seen_labels = HashSet::new();
    let mut header: Option<&str> = None;

    for line in text.lines().map(str::trim).filter(|l| !l.is_empty()) {
        let mut cursor = 0;
        let mut priced = false;
        for caps in PRICE.captures_iter(line) {
            let Some(whole) = caps.get(0) else { continue };
            if line[whole.end()..].starts_with('장') {
                continue;
            }
            priced = true;
            let segment = &line[cursor..whole.start()];
            cursor = whole.end();

            let Some(total_price) = parse_amount(&caps) else {
                continue;
            };
            let Some(label) = clean_label(segment, config.max_label_chars) else {
                continue;
            };
            if !seen_labels.insert(normalize_name(&label)) {
                continue;
            }

            let (quantity, unit) = parse_quantity(&label);
            let unit_price = quantity
                .filter(|q| *q > 0)
                .map(|q| total_price as f64 / f64::from(q));
            records.push(PriceRecord {
                item_name: label,
                canonical_name: None,
                total_price,
                quantity,
                unit,
                unit_price,
                event: detect_event(line, header, reference),
                is_outlier: false,
                snippet: truncate_chars(line, MAX_SNIPPET_CHARS),
            });
        }
        // A banner only covers the line right after it.
        header = (!priced).then_some(line);
    }

    flag_outliers(&mut records, &config.outlier);
    records
}

/// Splits records into (regular, event) while keeping input order.
pub fn partition_event_prices(records: Vec<PriceRecord>) -> (Vec<PriceRecord>, Vec<PriceRecord>) {
    let (events, regular): (Vec<_>, Vec<_>) =
        records.into_iter().partition(PriceRecord::is_event);
    (regular, events)
}

/// Marks implausible prices. Records are flagged, never removed, and the result
/// depends only on the set of prices.
pub fn flag_outliers(records: &mut [PriceRecord], policy: &OutlierPolicy) {
    let plausible =
        |price: i64| price >= policy.min_plausible_krw && price <= policy.max_plausible_krw;

    let mut logs: Vec<f64> = records
        .iter()
        .map(|r| r.total_price)
        .filter(|p| plausible(*p))
        .map(|p| (p as f64).ln())
        .collect();
    logs.sort_by(f64::total_cmp);
    let median = (logs.len() >= policy.min_samples.max(1)).then(|| {
        let mid = logs.len() / 2;
        if logs.len() % 2 == 0 {
            (logs[mid - 1] + logs[mid]) / 2.0
        } else {
            logs[mid]
        }
    });
    let limit = policy.ratio.max(1.0).ln();

    for record in records.iter_mut() {
        record.is_outlier = !plausible(record.total_price)
            || median.is_some_and(|m| ((record.total_price as f64).ln() - m).abs() > limit);
    }
}

fn parse_amount(caps: &Captures<'_>) -> Option<i64> {
    let digits = caps.name("num")?.as_str().replace(',', "");
    let value = if caps.name("man").is_some() {
        (digits.parse::<f64>().ok()? * 10_000.0).round() as i64
    } else if digits.contains('.') {
        return None;
    } else {
        digits.parse::<i64>().ok()?
    };
    (value > 0).then_some(value)
}

fn trim_separators(text: &str) -> &str {
    text.trim_start_matches(|c: char| {
        c.is_whitespace() || SEPARATORS.contains(&c) || c == ')' || c == ']'
    })
    .trim_end_matches(|c: char| {
        c.is_whitespace() || SEPARATORS.contains(&c) || c == '(' || c == '['
    })
}

fn clean_label(segment: &str, max_chars: usize) -> Option<String> {
    let mut label = trim_separators(segment);
    loop {
        let lowered = label.to_lowercase();
        let Some(qualifier) = TRAILING_QUALIFIERS.iter().find(|q| lowered.ends_with(*q)) else {
            break;
        };
        let Some(cut) = label.len().checked_sub(qualifier.len()) else {
            break;
        };
        if !label.is_char_boundary(cut) {
            break;
        }
        label = trim_separators(&label[..cut]);
    }

    let count = label.chars().count();
    let label = if count > max_chars {
        let tail: String = label.chars().skip(count - max_chars).collect();
        trim_separators(&tail).to_string()
    } else {
        label.to_string()
    };
    let label = label.split_whitespace().collect::<Vec<_>>().join(" ");
    label.chars().any(char::is_alphabetic).then_some(label)
}

fn parse_quantity(label: &str) -> (Option<u32>, Option<String>) {
    QUANTITY
        .captures(label)
        .and_then(|caps| {
            let quantity = caps.get(1)?.as_str().replace(',', "").parse::<u32>().ok()?;
            let unit = caps.get(2)?.as_str().to_lowercase();
            Some((Some(quantity), Some(unit)))
        })
        .unwrap_or((None, None))
}

fn has_event_marker(text: &str) -> bool {
    let lowered = text.to_lowercase();
    EVENT_MARKERS.iter().any(|m| lowered.contains(m))
}

fn detect_event(line: &str, header: Option<&str>, reference: NaiveDate) -> Option<EventPricing> {
    let marker_line = if has_event_marker(line) {
        line
    } else {
        header.filter(|h| has_event_marker(h))?
    };
    let context = match header {
        Some(h) if h != marker_line => format!("{h}\n{line}"),
        _ => format!("{marker_line}\n{line}"),
    };

    let label = PRICE.replace_all(marker_line, "");
    let label = trim_separators(label.trim()).to_string();
    let label = label.split_whitespace().collect::<Vec<_>>().join(" ");

    let mut conditions: Vec<String> = Vec::new();
    for m in CONDITION.find_iter(&context) {
        let text = m.as_str().to_string();
        if !conditions.contains(&text) {
            conditions.push(text);
        }
    }

    Some(EventPricing {
        label: truncate_chars(&label, MAX_EVENT_LABEL_CHARS),
        ends_on: parse_end_date(&context, reference),
        condition: (!conditions.is_empty()).then(|| conditions.join(", ")),
    })
}

/// Year-less dates more than half a year in the past roll into the next year.
fn parse_end_date(context: &str, reference: NaiveDate) -> Option<NaiveDate> {
    let caps = TILDE_DATE
        .captures(context)
        .or_else(|| UNTIL_DATE.captures(context))?;
    let month: u32 = caps.get(2)?.as_str().parse().ok()?;
    let day: u32 = caps.get(3)?.as_str().parse().ok()?;
    if let Some(year) = caps.get(1) {
        return NaiveDate::from_ymd_opt(year.as_str().parse().ok()?, month, day);
    }
    let date = NaiveDate::from_ymd_opt(reference.year(), month, day)?;
    if date < reference - Duration::days(183) {
        NaiveDate::from_ymd_opt(reference.year() + 1, month, day)
    } else {
        Some(date)
    }
}

fn truncate_chars(text: &str, max: usize) -> String {
    text.chars().take(max).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn day(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).expect("date")
    }

    fn extract(text: &str) -> Vec<PriceRecord> {
        extract_prices(text, day(2026, 3, 2), &PriceConfig::default())
    }

    #[test]
    fn bare_won_price_with_colon_label() {
        let records = extract("써마지FLX: 500,000원");
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].item_name, "써마지FLX");
        assert_eq!(records[0].total_price, 500_000);
        assert_eq!(records[0].quantity, None);
        assert!(!records[0].is_event());
    }

    #[test]
    fn man_won_abbreviations_are_expanded() {
        let records = extract("인모드 리프팅 250만원\n슈링크 유니버스 1,250만 원\n리쥬란 12.5만원");
        let prices: Vec<_> = records
            .iter()
            .map(|r| (r.item_name.as_str(), r.total_price))
            .collect();
        assert_eq!(
            prices,
            vec![
                ("인모드 리프팅", 2_500_000),
                ("슈링크 유니버스", 12_500_000),
                ("리쥬란", 125_000),
            ]
        );
    }

    #[test]
    fn quantity_yields_unit_price() {
        let records = extract("울쎄라 300샷 990,000원");
        assert_eq!(records[0].quantity, Some(300));
        assert_eq!(records[0].unit.as_deref(), Some("샷"));
        assert_eq!(records[0].unit_price, Some(3_300.0));
    }

    #[test]
    fn duplicate_labels_keep_the_first_price() {
        let records = extract("써마지FLX 500,000원\n써마지 FLX: 450,000원\n인모드 150,000원");
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].total_price, 500_000);
    }

    #[test]
    fn qualifiers_and_follow_up_prices_are_not_labels() {
        let records = extract("울쎄라 300샷 정상가 990,000원 → 790,000원\n원장 직접 시술 2원장 상담");
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].item_name, "울쎄라 300샷");
        assert_eq!(records[0].total_price, 990_000);
    }

    #[test]
    fn event_header_carries_end_date_and_conditions() {
        let text = "[3월 이벤트] ~3/31까지 신규 고객 첫 방문\n울쎄라 300샷 790,000원\n써마지FLX 1,990,000원";
        let records = extract(text);
        assert_eq!(records.len(), 2);
        let event = records[0].event.as_ref().expect("event pricing");
        assert_eq!(event.ends_on, Some(day(2026, 3, 31)));
        assert_eq!(event.condition.as_deref(), Some("신규 고객, 첫 방문"));
        assert!(event.label.contains("3월 이벤트"));
        assert!(!records[1].is_event());

        let (regular, events) = partition_event_prices(records);
        assert_eq!(regular.len(), 1);
        assert_eq!(events.len(), 1);
    }

    #[test]
    fn event_banner_covers_only_the_next_line() {
        let text = "오픈기념 이벤트 안내\n울쎄라 300샷 790,000원\n인모드 150,000원\n보톡스 50,000원\n필러 1cc 200,000원";
        let flags: Vec<_> = extract(text)
            .iter()
            .map(|r| (r.item_name.clone(), r.is_event()))
            .collect();
        assert_eq!(
            flags,
            vec![
                ("울쎄라 300샷".to_string(), true),
                ("인모드".to_string(), false),
                ("보톡스".to_string(), false),
                ("필러 1cc".to_string(), false),
            ]
        );
    }

    #[test]
    fn end_dates_without_year_roll_forward_near_new_year() {
        assert_eq!(
            parse_end_date("연말 특가 ~1/15", day(2026, 12, 20)),
            Some(day(2027, 1, 15))
        );
        assert_eq!(
            parse_end_date("4월 30일까지 할인", day(2026, 3, 2)),
            Some(day(2026, 4, 30))
        );
        assert_eq!(
            parse_end_date("2026.05.10까지", day(2026, 3, 2)),
            Some(day(2026, 5, 10))
        );
    }

    #[test]
    fn priced_lines_do_not_leak_event_context() {
        let records = extract("보톡스 이벤트 49,000원\n필러 1cc 250,000원");
        assert!(records[0].is_event());
        assert!(!records[1].is_event());
        assert_eq!(records[1].quantity, Some(1));
    }

    #[test]
    fn outliers_are_flagged_not_removed() {
        let text = "보톡스 100,000원\n필러 120,000원\n리쥬란 90,000원\n스킨부스터 110,000원\n울쎄라 5,000,000원\n상담 500원";
        let records = extract(text);
        assert_eq!(records.len(), 6);
        let flagged: Vec<_> = records
            .iter()
            .filter(|r| r.is_outlier)
            .map(|r| r.item_name.as_str())
            .collect();
        assert_eq!(flagged, vec!["울쎄라", "상담"]);

        let mut reordered = records.clone();
        reordered.reverse();
        flag_outliers(&mut reordered, &OutlierPolicy::default());
        assert_eq!(reordered.iter().filter(|r| r.is_outlier).count(), 2);
    }

    #[test]
    fn few_samples_skip_the_median_test() {
        let records = extract("보톡스 100,000원\n울쎄라 5,000,000원");
        assert!(records.iter().all(|r| !r.is_outlier));
    }
}
