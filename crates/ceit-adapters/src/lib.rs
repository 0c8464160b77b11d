//! Collaborator contracts for collection and recognition, plus the default HTTP/HTML implementations.

use std::collections::HashSet;
use std::sync::RwLock;

use async_trait::async_trait;
use ceit_core::{CatalogEntry, ItemKind};
use ceit_storage::{FetchError, HttpFetcher};
use chrono::{DateTime, Utc};
use regex::{Regex, RegexBuilder};
use scraper::{Html, Selector};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, warn};
use url::Url;

pub mod text;

pub use text::{html_to_text, strip_volatile};

pub const CRATE_NAME: &str = "ceit-adapters";

#[derive(Debug, Error)]
pub enum CollaboratorError {
    #[error(transparent)]
    Fetch(#[from] FetchError),
    #[error("{0}")]
    Message(String),
    #[error(transparent)]
    Anyhow(#[from] anyhow::Error),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RawContent {
    pub url: String,
    pub html: String,
    pub fetched_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PageTypeHint {
    Equipment,
    Treatment,
    Pricing,
    Event,
    Doctors,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Subpage {
    pub url: String,
    pub page_type: PageTypeHint,
}

/// Raw page fetching and discovery.
#[async_trait]
pub trait Collector: Send + Sync {
    /// `Ok(None)` when the page is gone or empty.
    async fn fetch(&self, url: &str) -> Result<Option<RawContent>, CollaboratorError>;
    fn find_subpages(&self, raw: &RawContent, base_url: &str) -> Vec<Subpage>;
    fn extract_images(&self, raw: &RawContent, base_url: &str) -> Vec<String>;
    async fn download_images(&self, urls: &[String], max_count: usize) -> Vec<ScreenshotInput>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScreenshotInput {
    pub source_url: String,
    pub bytes: Vec<u8>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct VisualRecognition {
    pub equipment_names: Vec<String>,
    pub treatment_names: Vec<String>,
    pub tokens_used: u64,
}

/// A scoped recognition session; `close` is called exactly once per batch.
#[async_trait]
pub trait VisualRecognizer: Send + Sync {
    async fn recognize(
        &self,
        inputs: &[ScreenshotInput],
    ) -> Result<VisualRecognition, CollaboratorError>;
    async fn close(&self) -> Result<(), CollaboratorError>;
}

#[async_trait]
pub trait VisualBackend: Send + Sync {
    async fn open_session(&self) -> Result<Box<dyn VisualRecognizer>, CollaboratorError>;
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContentAnalysis {
    pub doctors: Vec<String>,
    pub equipments: Vec<String>,
    pub treatments: Vec<String>,
}

/// Best-effort structured extraction from page text.
#[async_trait]
pub trait ContentAnalyzer: Send + Sync {
    async fn analyze(&self, text: &str) -> Result<ContentAnalysis, CollaboratorError>;

    /// Called with the catalog loaded at the start of every batch.
    fn refresh_catalog(&self, _catalog: &[CatalogEntry]) -> Result<(), CollaboratorError> {
        Ok(())
    }
}

/// Collector over plain HTTP GETs and HTML parsing.
#[derive(Debug, Clone)]
pub struct HttpCollector {
    http: HttpFetcher,
}

impl HttpCollector {
    pub fn new(http: HttpFetcher) -> Self {
        Self { http }
    }
}

fn resolve_same_host(base: &Url, href: &str) -> Option<Url> {
    let href = href.trim();
    if href.is_empty() || href.starts_with('#') || href.starts_with("javascript:") {
        return None;
    }
    let mut resolved = base.join(href).ok()?;
    if !matches!(resolved.scheme(), "http" | "https") || resolved.host_str() != base.host_str() {
        return None;
    }
    resolved.set_fragment(None);
    Some(resolved)
}

/// Page type from link text and target path; `None` for pages the pipeline does not read.
pub fn classify_link(href: &str, label: &str) -> Option<PageTypeHint> {
    let haystack = format!("{} {}", href.to_lowercase(), label.to_lowercase());
    let has = |needles: &[&str]| needles.iter().any(|n| haystack.contains(n));
    if has(&["이벤트", "event", "promotion", "프로모션", "특가"]) {
        Some(PageTypeHint::Event)
    } else if has(&["가격", "비용", "수가", "price", "pricing", "cost"]) {
        Some(PageTypeHint::Pricing)
    } else if has(&["장비", "equipment", "device", "machine"]) {
        Some(PageTypeHint::Equipment)
    } else if has(&["시술", "진료", "treatment", "program", "clinic"]) {
        Some(PageTypeHint::Treatment)
    } else if has(&["의료진", "원장", "doctor", "staff"]) {
        Some(PageTypeHint::Doctors)
    } else {
        None
    }
}

#[async_trait]
impl Collector for HttpCollector {
    async fn fetch(&self, url: &str) -> Result<Option<RawContent>, CollaboratorError> {
        match self.http.fetch_bytes(url).await {
            Ok(resp) if resp.body.is_empty() => Ok(None),
            Ok(resp) => Ok(Some(RawContent {
                url: resp.final_url.clone(),
                html: resp.text(),
                fetched_at: Utc::now(),
            })),
            Err(FetchError::HttpStatus { status: 404 | 410, .. }) => Ok(None),
            Err(err) => Err(err.into()),
        }
    }

    fn find_subpages(&self, raw: &RawContent, base_url: &str) -> Vec<Subpage> {
        let Ok(base) = Url::parse(base_url) else {
            return Vec::new();
        };
        let Ok(anchors) = Selector::parse("a[href]") else {
            return Vec::new();
        };
        let document = Html::parse_document(&raw.html);
        let mut seen = HashSet::new();
        let mut out = Vec::new();
        for anchor in document.select(&anchors) {
            let Some(href) = anchor.value().attr("href") else {
                continue;
            };
            let Some(url) = resolve_same_host(&base, href) else {
                continue;
            };
            let label = anchor.text().collect::<String>();
            let Some(page_type) = classify_link(url.path(), &label) else {
                continue;
            };
            if url.as_str() != base.as_str() && seen.insert(url.to_string()) {
                out.push(Subpage {
                    url: url.to_string(),
                    page_type,
                });
            }
        }
        out
    }

    fn extract_images(&self, raw: &RawContent, base_url: &str) -> Vec<String> {
        let Ok(base) = Url::parse(base_url) else {
            return Vec::new();
        };
        let Ok(images) = Selector::parse("img") else {
            return Vec::new();
        };
        let document = Html::parse_document(&raw.html);
        let mut seen = HashSet::new();
        document
            .select(&images)
            .filter_map(|img| {
                img.value()
                    .attr("data-src")
                    .or_else(|| img.value().attr("src"))
            })
            .filter(|src| !src.starts_with("data:"))
            .filter_map(|src| base.join(src.trim()).ok())
            .filter(|url| {
                let path = url.path().to_lowercase();
                !(path.ends_with(".svg")
                    || path.ends_with(".gif")
                    || path.contains("logo")
                    || path.contains("icon"))
            })
            .map(|url| url.to_string())
            .filter(|url| seen.insert(url.clone()))
            .collect()
    }

    async fn download_images(&self, urls: &[String], max_count: usize) -> Vec<ScreenshotInput> {
        let mut out = Vec::new();
        for url in urls.iter().take(max_count) {
            match self.http.fetch_bytes(url).await {
                Ok(resp) if !resp.body.is_empty() => out.push(ScreenshotInput {
                    source_url: url.clone(),
                    bytes: resp.body,
                }),
                Ok(_) => debug!(%url, "skipping empty image"),
                Err(err) => warn!(%url, error = %err, "image download failed"),
            }
        }
        out
    }
}

/// Analyzer that recognizes catalog names and keywords literally present in the text.
#[derive(Debug)]
pub struct KeywordContentAnalyzer {
    matchers: RwLock<Vec<(ItemKind, Regex)>>,
    doctor: Regex,
}

impl KeywordContentAnalyzer {
    pub fn new(catalog: &[CatalogEntry]) -> Result<Self, CollaboratorError> {
        let doctor = Regex::new(r"([가-힣]{2,4})\s*(?:대표원장|원장|전문의)")
            .map_err(|e| CollaboratorError::Message(e.to_string()))?;
        Ok(Self {
            matchers: RwLock::new(Self::build_matchers(catalog)?),
            doctor,
        })
    }

    fn build_matchers(
        catalog: &[CatalogEntry],
    ) -> Result<Vec<(ItemKind, Regex)>, CollaboratorError> {
        let mut terms: Vec<(ItemKind, String)> = catalog
            .iter()
            .flat_map(|entry| {
                std::iter::once(entry.canonical_name.clone())
                    .chain(entry.keywords.iter().cloned())
                    .map(move |term| (entry.kind, term.trim().to_string()))
            })
            .filter(|(_, term)| term.chars().count() >= 2)
            .collect();
        // Longest terms first so "써마지FLX" wins over "써마지" at the same position.
        terms.sort_by(|a, b| b.1.chars().count().cmp(&a.1.chars().count()).then(a.cmp(b)));
        terms.dedup();

        let mut matchers = Vec::new();
        for kind in [ItemKind::Equipment, ItemKind::Treatment] {
            let alternation = terms
                .iter()
                .filter(|(k, _)| *k == kind)
                .map(|(_, term)| regex::escape(term))
                .collect::<Vec<_>>()
                .join("|");
            if alternation.is_empty() {
                continue;
            }
            let regex = RegexBuilder::new(&alternation)
                .case_insensitive(true)
                .build()
                .map_err(|e| CollaboratorError::Message(e.to_string()))?;
            matchers.push((kind, regex));
        }
        Ok(matchers)
    }

    fn find_all(matchers: &[(ItemKind, Regex)], kind: ItemKind, text: &str) -> Vec<String> {
        let mut seen = HashSet::new();
        matchers
            .iter()
            .filter(|(k, _)| *k == kind)
            .flat_map(|(_, regex)| regex.find_iter(text).map(|m| m.as_str().to_string()))
            .filter(|name| seen.insert(name.to_lowercase()))
            .collect()
    }
}

#[async_trait]
impl ContentAnalyzer for KeywordContentAnalyzer {
    async fn analyze(&self, text: &str) -> Result<ContentAnalysis, CollaboratorError> {
        let mut seen = HashSet::new();
        let doctors = self
            .doctor
            .captures_iter(text)
            .filter_map(|c| c.get(1).map(|m| m.as_str().to_string()))
            .filter(|name| seen.insert(name.clone()))
            .collect();
        let matchers = self
            .matchers
            .read()
            .map_err(|_| CollaboratorError::Message("analyzer vocabulary lock poisoned".into()))?;
        Ok(ContentAnalysis {
            doctors,
            equipments: Self::find_all(&matchers, ItemKind::Equipment, text),
            treatments: Self::find_all(&matchers, ItemKind::Treatment, text),
        })
    }

    fn refresh_catalog(&self, catalog: &[CatalogEntry]) -> Result<(), CollaboratorError> {
        let rebuilt = Self::build_matchers(catalog)?;
        let mut matchers = self
            .matchers
            .write()
            .map_err(|_| CollaboratorError::Message("analyzer vocabulary lock poisoned".into()))?;
        *matchers = rebuilt;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ceit_storage::HttpClientConfig;
    use uuid::Uuid;

    fn collector() -> HttpCollector {
        HttpCollector::new(HttpFetcher::new(HttpClientConfig::default()).expect("http client"))
    }

    fn raw(html: &str) -> RawContent {
        RawContent {
            url: "https://line.example/".into(),
            html: html.into(),
            fetched_at: Utc::now(),
        }
    }

    fn entry(name: &str, kind: ItemKind, keywords: &[&str]) -> CatalogEntry {
        CatalogEntry {
            id: Uuid::new_v4(),
            canonical_name: name.into(),
            category: "lifting".into(),
            kind,
            keywords: keywords.iter().map(|k| k.to_string()).collect(),
        }
    }

    #[test]
    fn subpages_are_same_host_hinted_and_deduplicated() {
        let page = raw(r#"
            <a href="/equipment">보유장비</a>
            <a href="/price#top">비용안내</a>
            <a href="/price">가격</a>
            <a href="https://other.example/event">이벤트</a>
            <a href="/event/spring">봄 이벤트</a>
            <a href="/location">오시는 길</a>
            <a href="javascript:void(0)">시술</a>
        "#);
        let subpages = collector().find_subpages(&page, "https://line.example/");
        let got: Vec<_> = subpages
            .iter()
            .map(|s| (s.url.as_str(), s.page_type))
            .collect();
        assert_eq!(
            got,
            vec![
                ("https://line.example/equipment", PageTypeHint::Equipment),
                ("https://line.example/price", PageTypeHint::Pricing),
                ("https://line.example/event/spring", PageTypeHint::Event),
            ]
        );
    }

    #[test]
    fn images_skip_inline_logos_and_icons() {
        let page = raw(r#"
            <img src="/img/logo.png"><img src="data:image/png;base64,AAAA">
            <img data-src="/upload/ulthera_event.jpg" src="/blank.gif">
            <img src="/upload/price_table.png"><img src="/upload/price_table.png">
        "#);
        let images = collector().extract_images(&page, "https://line.example/");
        assert_eq!(
            images,
            vec![
                "https://line.example/upload/ulthera_event.jpg",
                "https://line.example/upload/price_table.png",
            ]
        );
    }

    #[tokio::test]
    async fn keyword_analyzer_prefers_longest_catalog_term() {
        let analyzer = KeywordContentAnalyzer::new(&[
            entry("써마지", ItemKind::Equipment, &["써마지FLX", "thermage"]),
            entry("인모드", ItemKind::Equipment, &["inmode"]),
            entry("리프팅", ItemKind::Treatment, &[]),
        ])
        .expect("analyzer");
        let analysis = analyzer
            .analyze("김하늘 대표원장\n써마지flx 이벤트\nInMode 리프팅\n써마지FLX 재입고")
            .await
            .expect("analysis");
        assert_eq!(analysis.doctors, vec!["김하늘"]);
        assert_eq!(analysis.equipments, vec!["써마지flx", "InMode"]);
        assert_eq!(analysis.treatments, vec!["리프팅"]);
    }

    #[tokio::test]
    async fn keyword_analyzer_picks_up_refreshed_catalog() {
        let analyzer =
            KeywordContentAnalyzer::new(&[entry("인모드", ItemKind::Equipment, &[])])
                .expect("analyzer");
        let text = "인모드 리프팅\n포텐자 신규 도입";
        let before = analyzer.analyze(text).await.expect("analysis");
        assert_eq!(before.equipments, vec!["인모드"]);
        assert!(before.treatments.is_empty());

        analyzer
            .refresh_catalog(&[
                entry("인모드", ItemKind::Equipment, &[]),
                entry("포텐자", ItemKind::Equipment, &["potenza"]),
                entry("리프팅", ItemKind::Treatment, &[]),
            ])
            .expect("refresh");
        let after = analyzer.analyze(text).await.expect("analysis");
        assert_eq!(after.equipments, vec!["인모드", "포텐자"]);
        assert_eq!(after.treatments, vec!["리프팅"]);
    }
}
