//! HTML to visible text, and removal of content that changes on every fetch.

use std::sync::LazyLock;

use regex::{Captures, Regex};
use scraper::{ElementRef, Html};

const SKIPPED: [&str; 6] = ["script", "style", "noscript", "template", "svg", "iframe"];
const BLOCK: [&str; 24] = [
    "p", "div", "li", "ul", "ol", "tr", "table", "section", "article", "header", "footer",
    "nav", "aside", "main", "h1", "h2", "h3", "h4", "h5", "h6", "dt", "dd", "blockquote", "form",
];
const CELL: [&str; 2] = ["td", "th"];

static DATE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\d{4}\s*[-./년]\s*\d{1,2}\s*[-./월]\s*\d{1,2}\s*일?").expect("date pattern")
});
static CLOCK_TIME: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\b\d{1,2}:\d{2}(?::\d{2})?(?:\s*[ap]m)?").expect("time pattern")
});
static VISITOR_COUNTER: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)(?:오늘|어제|전체|누적|today|total)\s*(?:방문자?|방문수|visitors?|views?)\s*[:：]?\s*[\d,]+")
        .expect("counter pattern")
});
static COPYRIGHT: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?im)(?:copyright|ⓒ|©).*$").expect("copyright pattern"));
static CACHE_BUSTER: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)[?&](?:v|ver|t|ts|_|jsessionid|phpsessid|sid)=[A-Za-z0-9]+")
        .expect("cache buster pattern")
});

/// Visible text with block elements on their own lines.
pub fn html_to_text(html: &str) -> String {
    let document = Html::parse_document(html);
    let mut out = String::new();
    walk(document.root_element(), &mut out);
    normalize_lines(&out)
}

fn walk(element: ElementRef<'_>, out: &mut String) {
    for child in element.children() {
        if let Some(text) = child.value().as_text() {
            out.push_str(text);
            continue;
        }
        let Some(child_el) = ElementRef::wrap(child) else {
            continue;
        };
        let name = child_el.value().name();
        if SKIPPED.contains(&name) {
            continue;
        }
        if name == "br" {
            out.push('\n');
            continue;
        }
        let block = BLOCK.contains(&name);
        if block {
            out.push('\n');
        } else if CELL.contains(&name) {
            out.push(' ');
        }
        walk(child_el, out);
        if block {
            out.push('\n');
        }
    }
}

fn normalize_lines(text: &str) -> String {
    text.lines()
        .map(|line| line.split_whitespace().collect::<Vec<_>>().join(" "))
        .filter(|line| !line.is_empty())
        .collect::<Vec<_>>()
        .join("\n")
}

/// Drops dates, clock times, visitor counters, copyright lines and cache busters.
pub fn strip_volatile(text: &str) -> String {
    let text = COPYRIGHT.replace_all(text, "");
    let text = VISITOR_COUNTER.replace_all(&text, "");
    let text = CACHE_BUSTER.replace_all(&text, "");
    let text = strip_dates(&text);
    let text = CLOCK_TIME.replace_all(&text, "");
    normalize_lines(&text)
}

/// Dates that bound a promotion (`~2026.05.10`, `2026.05.10까지`, `2026.03.01~`) are
/// page content and stay; every other date is dropped.
fn strip_dates(text: &str) -> String {
    DATE.replace_all(text, |caps: &Captures<'_>| {
        let Some(m) = caps.get(0) else {
            return String::new();
        };
        let before = text[..m.start()].trim_end();
        let after = text[m.end()..].trim_start();
        if before.ends_with('~') || after.starts_with('~') || after.starts_with("까지") {
            m.as_str().to_string()
        } else {
            String::new()
        }
    })
    .into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scripts_and_styles_are_not_visible_text() {
        let html = r#"<html><head><style>.x{}</style></head><body>
            <h1>라인의원</h1><script>var t = Date.now();</script>
            <ul><li><b>써마지FLX</b>: 500,000원</li><li>울쎄라 300샷</li></ul>
            </body></html>"#;
        let text = html_to_text(html);
        assert_eq!(text, "라인의원\n써마지FLX: 500,000원\n울쎄라 300샷");
    }

    #[test]
    fn table_cells_stay_on_one_line() {
        let html = "<table><tr><td>인모드</td><td>150,000원</td></tr></table>";
        assert_eq!(html_to_text(html), "인모드 150,000원");
    }

    #[test]
    fn volatile_fragments_do_not_change_the_stripped_text() {
        let monday = "울쎄라 300샷 990,000원\n오늘 방문자 1,204\n업데이트 2026-03-02 09:41\nCopyright 2026 라인의원";
        let tuesday = "울쎄라 300샷 990,000원\n오늘 방문자 1,377\n업데이트 2026.03.03 18:02:11\nⓒ 라인의원 all rights";
        assert_eq!(strip_volatile(monday), strip_volatile(tuesday));
        assert_eq!(strip_volatile(monday), "울쎄라 300샷 990,000원\n업데이트");
    }

    #[test]
    fn promotion_end_dates_are_content() {
        let before = strip_volatile("오픈 이벤트 2026.05.10까지\n울쎄라 790,000원");
        let after = strip_volatile("오픈 이벤트 2026.06.10까지\n울쎄라 790,000원");
        assert_ne!(before, after);
        assert_eq!(
            strip_volatile("이벤트 기간 2026.03.01 ~ 2026.03.31"),
            "이벤트 기간 2026.03.01 ~ 2026.03.31"
        );
        assert_eq!(strip_volatile("게시일 2026.03.01 인모드"), "게시일 인모드");
    }

    #[test]
    fn substantive_edits_survive_stripping() {
        let before = strip_volatile("울쎄라 300샷 990,000원");
        let after = strip_volatile("울쎄라 300샷 890,000원");
        assert_ne!(before, after);
    }
}
