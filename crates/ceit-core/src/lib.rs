//! Core domain model for CEIT: tracked sites, catalog, snapshots, prices and sales signals.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, NaiveDate, Utc};
use regex::{Regex, RegexBuilder};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

pub const CRATE_NAME: &str = "ceit-core";

#[derive(Debug, Error, PartialEq, Eq)]
#[error("unrecognized {kind} value `{value}`")]
pub struct ParseEnumError {
    pub kind: &'static str,
    pub value: String,
}

/// Re-crawl frequency class.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Tier {
    Tier1,
    Tier2,
    Tier3,
}

impl Tier {
    pub const ALL: [Tier; 3] = [Tier::Tier1, Tier::Tier2, Tier::Tier3];

    /// Minimum whole days between crawls.
    pub fn min_interval_days(self) -> i64 {
        match self {
            Tier::Tier1 => 7,
            Tier::Tier2 => 14,
            Tier::Tier3 => 30,
        }
    }

    /// Unclassified and low grades fall back to the monthly tier.
    pub fn from_grade(grade: Option<ImportanceGrade>) -> Self {
        match grade {
            Some(ImportanceGrade::S | ImportanceGrade::A) => Tier::Tier1,
            Some(ImportanceGrade::B) => Tier::Tier2,
            Some(ImportanceGrade::C | ImportanceGrade::D) | None => Tier::Tier3,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Tier::Tier1 => "tier1",
            Tier::Tier2 => "tier2",
            Tier::Tier3 => "tier3",
        }
    }
}

impl fmt::Display for Tier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Tier {
    type Err = ParseEnumError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "tier1" | "1" => Ok(Tier::Tier1),
            "tier2" | "2" => Ok(Tier::Tier2),
            "tier3" | "3" => Ok(Tier::Tier3),
            _ => Err(ParseEnumError {
                kind: "tier",
                value: s.to_string(),
            }),
        }
    }
}

/// Business-importance grade produced by the profiling subsystem.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum ImportanceGrade {
    S,
    A,
    B,
    C,
    D,
}

impl ImportanceGrade {
    pub fn as_str(self) -> &'static str {
        match self {
            ImportanceGrade::S => "S",
            ImportanceGrade::A => "A",
            ImportanceGrade::B => "B",
            ImportanceGrade::C => "C",
            ImportanceGrade::D => "D",
        }
    }
}

impl FromStr for ImportanceGrade {
    type Err = ParseEnumError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().as_str() {
            "S" => Ok(ImportanceGrade::S),
            "A" => Ok(ImportanceGrade::A),
            "B" => Ok(ImportanceGrade::B),
            "C" => Ok(ImportanceGrade::C),
            "D" => Ok(ImportanceGrade::D),
            _ => Err(ParseEnumError {
                kind: "grade",
                value: s.to_string(),
            }),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrackedSite {
    pub id: Uuid,
    pub name: String,
    pub url: String,
    /// Acquisition channel the site was sourced from.
    pub source: String,
    pub tier: Tier,
    pub grade: Option<ImportanceGrade>,
    pub last_crawled_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ItemKind {
    Equipment,
    Treatment,
}

impl ItemKind {
    pub fn as_str(self) -> &'static str {
        match self {
            ItemKind::Equipment => "equipment",
            ItemKind::Treatment => "treatment",
        }
    }
}

impl FromStr for ItemKind {
    type Err = ParseEnumError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "equipment" => Ok(ItemKind::Equipment),
            "treatment" => Ok(ItemKind::Treatment),
            _ => Err(ParseEnumError {
                kind: "item kind",
                value: s.to_string(),
            }),
        }
    }
}

/// Curated canonical name with its recognition keywords. Read-only to the pipeline.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CatalogEntry {
    pub id: Uuid,
    pub canonical_name: String,
    pub category: String,
    pub kind: ItemKind,
    #[serde(default)]
    pub keywords: Vec<String>,
}

/// Unresolved raw name queued for human curation; never auto-promoted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompoundCandidate {
    pub id: Uuid,
    pub site_id: Uuid,
    pub run_id: Uuid,
    pub kind: ItemKind,
    pub raw_name: String,
    pub matched_keywords: Vec<String>,
    pub matched_canonicals: Vec<String>,
    pub residual: String,
    pub created_at: DateTime<Utc>,
}

impl CompoundCandidate {
    /// No known keyword occurs in the name at all.
    pub fn is_new_term(&self) -> bool {
        self.matched_keywords.is_empty()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventPricing {
    pub label: String,
    pub ends_on: Option<NaiveDate>,
    pub condition: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PriceRecord {
    pub item_name: String,
    pub canonical_name: Option<String>,
    /// Total advertised price in KRW.
    pub total_price: i64,
    pub quantity: Option<u32>,
    pub unit: Option<String>,
    pub unit_price: Option<f64>,
    pub event: Option<EventPricing>,
    /// Retained for audit, excluded from scoring and signals.
    pub is_outlier: bool,
    pub snippet: String,
}

impl PriceRecord {
    pub fn is_event(&self) -> bool {
        self.event.is_some()
    }

    pub fn display_name(&self) -> &str {
        self.canonical_name.as_deref().unwrap_or(&self.item_name)
    }
}

/// One immutable record of a site's extracted state for a run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Snapshot {
    pub id: Uuid,
    pub site_id: Uuid,
    pub run_id: Uuid,
    pub text_hash: String,
    pub ocr_hash: Option<String>,
    pub visual_pass_at: Option<DateTime<Utc>>,
    pub equipment: Vec<String>,
    pub treatments: Vec<String>,
    pub prices: Vec<PriceRecord>,
    pub event_prices: Vec<PriceRecord>,
    pub match_rate: f64,
    pub diff_summary: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChangeType {
    Added,
    Removed,
}

impl ChangeType {
    pub fn as_str(self) -> &'static str {
        match self {
            ChangeType::Added => "added",
            ChangeType::Removed => "removed",
        }
    }
}

impl FromStr for ChangeType {
    type Err = ParseEnumError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "added" => Ok(ChangeType::Added),
            "removed" => Ok(ChangeType::Removed),
            _ => Err(ParseEnumError {
                kind: "change type",
                value: s.to_string(),
            }),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EquipmentChange {
    pub id: Uuid,
    pub site_id: Uuid,
    pub snapshot_id: Uuid,
    pub change_type: ChangeType,
    pub item_name: String,
    pub category: Option<String>,
    pub detected_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClientProduct {
    pub id: Uuid,
    pub name: String,
    pub active: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SignalPriority {
    High,
    Medium,
    Low,
}

impl SignalPriority {
    pub fn as_str(self) -> &'static str {
        match self {
            SignalPriority::High => "high",
            SignalPriority::Medium => "medium",
            SignalPriority::Low => "low",
        }
    }
}

impl FromStr for SignalPriority {
    type Err = ParseEnumError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "high" => Ok(SignalPriority::High),
            "medium" => Ok(SignalPriority::Medium),
            "low" => Ok(SignalPriority::Low),
            _ => Err(ParseEnumError {
                kind: "priority",
                value: s.to_string(),
            }),
        }
    }
}

#[derive(Debug, Error)]
pub enum RuleError {
    #[error("invalid item pattern: {0}")]
    Pattern(#[from] regex::Error),
    #[error("title template references unknown placeholder `{{{0}}}`")]
    UnknownPlaceholder(String),
    #[error("title template has an unclosed placeholder")]
    UnclosedPlaceholder,
    #[error("rule `{rule}`: {reason}")]
    Invalid { rule: String, reason: String },
}

/// Case-insensitive regex over item names, compiled when the rule is loaded.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ItemPattern(Regex);

impl ItemPattern {
    pub fn new(pattern: &str) -> Result<Self, RuleError> {
        let regex = RegexBuilder::new(pattern).case_insensitive(true).build()?;
        Ok(Self(regex))
    }

    pub fn as_str(&self) -> &str {
        self.0.as_str()
    }

    pub fn is_match(&self, item: &str) -> bool {
        self.0.is_match(item)
    }
}

impl PartialEq for ItemPattern {
    fn eq(&self, other: &Self) -> bool {
        self.as_str() == other.as_str()
    }
}

impl TryFrom<String> for ItemPattern {
    type Error = RuleError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::new(&value)
    }
}

impl From<ItemPattern> for String {
    fn from(value: ItemPattern) -> Self {
        value.as_str().to_string()
    }
}

const TEMPLATE_PLACEHOLDERS: [&str; 5] = ["item", "change", "site", "product", "category"];

/// Signal title with `{item}`-style placeholders, checked when loaded.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct TitleTemplate(String);

#[derive(Debug, Clone, Copy)]
pub struct TemplateVars<'a> {
    pub item: &'a str,
    pub change: &'a str,
    pub site: &'a str,
    pub product: &'a str,
    pub category: &'a str,
}

impl TitleTemplate {
    pub fn new(template: impl Into<String>) -> Result<Self, RuleError> {
        let template = template.into();
        let mut rest = template.as_str();
        while let Some(open) = rest.find('{') {
            let after = &rest[open + 1..];
            let close = after.find('}').ok_or(RuleError::UnclosedPlaceholder)?;
            let name = &after[..close];
            if !TEMPLATE_PLACEHOLDERS.contains(&name) {
                return Err(RuleError::UnknownPlaceholder(name.to_string()));
            }
            rest = &after[close + 1..];
        }
        Ok(Self(template))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn render(&self, vars: &TemplateVars<'_>) -> String {
        self.0
            .replace("{item}", vars.item)
            .replace("{change}", vars.change)
            .replace("{site}", vars.site)
            .replace("{product}", vars.product)
            .replace("{category}", vars.category)
    }
}

impl TryFrom<String> for TitleTemplate {
    type Error = RuleError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<TitleTemplate> for String {
    fn from(value: TitleTemplate) -> Self {
        value.0
    }
}

/// Closed set of trigger conditions a sales-signal rule can carry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum RuleCondition {
    AnyChange {
        change_types: Vec<ChangeType>,
    },
    ItemContains {
        change_types: Vec<ChangeType>,
        keywords: Vec<String>,
    },
    ItemPattern {
        change_types: Vec<ChangeType>,
        pattern: ItemPattern,
    },
    Category {
        change_types: Vec<ChangeType>,
        categories: Vec<String>,
    },
}

impl RuleCondition {
    pub fn change_types(&self) -> &[ChangeType] {
        match self {
            RuleCondition::AnyChange { change_types }
            | RuleCondition::ItemContains { change_types, .. }
            | RuleCondition::ItemPattern { change_types, .. }
            | RuleCondition::Category { change_types, .. } => change_types,
        }
    }

    fn validate(&self) -> Result<(), String> {
        if self.change_types().is_empty() {
            return Err("condition lists no change types".to_string());
        }
        match self {
            RuleCondition::ItemContains { keywords, .. }
                if keywords.iter().all(|k| k.trim().is_empty()) =>
            {
                Err("item_contains needs at least one keyword".to_string())
            }
            RuleCondition::Category { categories, .. }
                if categories.iter().all(|c| c.trim().is_empty()) =>
            {
                Err("category needs at least one category".to_string())
            }
            _ => Ok(()),
        }
    }

    pub fn matches(&self, change: &EquipmentChange) -> bool {
        if !self.change_types().contains(&change.change_type) {
            return false;
        }
        match self {
            RuleCondition::AnyChange { .. } => true,
            RuleCondition::ItemContains { keywords, .. } => {
                let item = change.item_name.to_lowercase();
                keywords
                    .iter()
                    .map(|k| k.trim().to_lowercase())
                    .any(|k| !k.is_empty() && item.contains(&k))
            }
            RuleCondition::ItemPattern { pattern, .. } => pattern.is_match(&change.item_name),
            RuleCondition::Category { categories, .. } => change
                .category
                .as_deref()
                .map(|cat| categories.iter().any(|c| c.trim().eq_ignore_ascii_case(cat)))
                .unwrap_or(false),
        }
    }
}

/// Raw rule shape as stored or written by curators.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuleDefinition {
    pub id: Uuid,
    pub product_id: Uuid,
    pub name: String,
    pub priority: SignalPriority,
    pub condition: RuleCondition,
    pub title_template: TitleTemplate,
}

/// Validated sales-signal rule. Deserialization rejects unusable shapes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "RuleDefinition", into = "RuleDefinition")]
pub struct SalesSignalRule {
    pub id: Uuid,
    pub product_id: Uuid,
    pub name: String,
    pub priority: SignalPriority,
    pub condition: RuleCondition,
    pub title_template: TitleTemplate,
}

impl TryFrom<RuleDefinition> for SalesSignalRule {
    type Error = RuleError;

    fn try_from(def: RuleDefinition) -> Result<Self, Self::Error> {
        def.condition.validate().map_err(|reason| RuleError::Invalid {
            rule: def.name.clone(),
            reason,
        })?;
        Ok(Self {
            id: def.id,
            product_id: def.product_id,
            name: def.name,
            priority: def.priority,
            condition: def.condition,
            title_template: def.title_template,
        })
    }
}

impl From<SalesSignalRule> for RuleDefinition {
    fn from(rule: SalesSignalRule) -> Self {
        Self {
            id: rule.id,
            product_id: rule.product_id,
            name: rule.name,
            priority: rule.priority,
            condition: rule.condition,
            title_template: rule.title_template,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SalesSignal {
    pub id: Uuid,
    pub rule_id: Uuid,
    pub product_id: Uuid,
    pub site_id: Uuid,
    pub change_id: Uuid,
    pub priority: SignalPriority,
    pub title: String,
    pub change_type: ChangeType,
    pub item_name: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActivityOutcome {
    Succeeded,
    NoChange,
    Failed,
}

impl ActivityOutcome {
    pub fn as_str(self) -> &'static str {
        match self {
            ActivityOutcome::Succeeded => "succeeded",
            ActivityOutcome::NoChange => "no_change",
            ActivityOutcome::Failed => "failed",
        }
    }
}

/// Auditable per-site run outcome.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActivityEntry {
    pub id: Uuid,
    pub site_id: Uuid,
    pub run_id: Uuid,
    pub stage: String,
    pub outcome: ActivityOutcome,
    pub message: Option<String>,
    pub at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn change(change_type: ChangeType, item: &str, category: Option<&str>) -> EquipmentChange {
        EquipmentChange {
            id: Uuid::new_v4(),
            site_id: Uuid::new_v4(),
            snapshot_id: Uuid::new_v4(),
            change_type,
            item_name: item.to_string(),
            category: category.map(str::to_string),
            detected_at: Utc::now(),
        }
    }

    #[test]
    fn grades_map_to_tiers_with_tier3_fallback() {
        assert_eq!(Tier::from_grade(Some(ImportanceGrade::S)), Tier::Tier1);
        assert_eq!(Tier::from_grade(Some(ImportanceGrade::A)), Tier::Tier1);
        assert_eq!(Tier::from_grade(Some(ImportanceGrade::B)), Tier::Tier2);
        assert_eq!(Tier::from_grade(Some(ImportanceGrade::D)), Tier::Tier3);
        assert_eq!(Tier::from_grade(None), Tier::Tier3);
        assert_eq!("TIER2".parse::<Tier>(), Ok(Tier::Tier2));
        assert!("weekly".parse::<Tier>().is_err());
    }

    #[test]
    fn rule_yaml_loads_into_validated_condition() {
        let yaml = r#"
id: 6f1c7a38-5f0e-4c1e-9d5e-0a3c1f9b2a10
product_id: 0b8f9a44-3f62-4a52-9a4c-6d0f3b1e7c21
name: lifting-added
priority: high
condition:
  kind: item_pattern
  change_types: [added]
  pattern: "울쎄라|ulthera"
title_template: "{site} added {item}"
"#;
        let rule: SalesSignalRule = serde_yaml::from_str(yaml).expect("rule");
        assert_eq!(rule.priority, SignalPriority::High);
        assert!(rule.condition.matches(&change(ChangeType::Added, "ULTHERA", None)));
        assert!(!rule.condition.matches(&change(ChangeType::Removed, "울쎄라", None)));
    }

    #[test]
    fn unknown_condition_kind_is_rejected_at_load() {
        let json = serde_json::json!({
            "id": Uuid::new_v4(),
            "product_id": Uuid::new_v4(),
            "name": "mystery",
            "priority": "low",
            "condition": { "kind": "price_drop", "change_types": ["added"] },
            "title_template": "{item}"
        });
        assert!(serde_json::from_value::<SalesSignalRule>(json).is_err());
    }

    #[test]
    fn invalid_shapes_are_rejected_at_load() {
        let empty_types = serde_json::json!({
            "id": Uuid::new_v4(),
            "product_id": Uuid::new_v4(),
            "name": "empty",
            "priority": "low",
            "condition": { "kind": "any_change", "change_types": [] },
            "title_template": "{item}"
        });
        assert!(serde_json::from_value::<SalesSignalRule>(empty_types).is_err());

        let bad_regex = serde_json::json!({
            "id": Uuid::new_v4(),
            "product_id": Uuid::new_v4(),
            "name": "regex",
            "priority": "low",
            "condition": { "kind": "item_pattern", "change_types": ["added"], "pattern": "(" },
            "title_template": "{item}"
        });
        assert!(serde_json::from_value::<SalesSignalRule>(bad_regex).is_err());

        assert!(matches!(
            TitleTemplate::new("{clinic} bought {item}"),
            Err(RuleError::UnknownPlaceholder(name)) if name == "clinic"
        ));
        assert!(matches!(
            TitleTemplate::new("{item"),
            Err(RuleError::UnclosedPlaceholder)
        ));
    }

    #[test]
    fn category_and_keyword_conditions_match_case_insensitively() {
        let by_category = RuleCondition::Category {
            change_types: vec![ChangeType::Added, ChangeType::Removed],
            categories: vec!["Lifting".into()],
        };
        assert!(by_category.matches(&change(ChangeType::Removed, "울쎄라", Some("lifting"))));
        assert!(!by_category.matches(&change(ChangeType::Removed, "울쎄라", None)));

        let by_keyword = RuleCondition::ItemContains {
            change_types: vec![ChangeType::Added],
            keywords: vec!["Thermage".into()],
        };
        assert!(by_keyword.matches(&change(ChangeType::Added, "thermage flx", None)));
    }

    #[test]
    fn title_template_renders_all_placeholders() {
        let template = TitleTemplate::new("[{product}] {site}: {item} {change} ({category})")
            .expect("template");
        let title = template.render(&TemplateVars {
            item: "인모드",
            change: "added",
            site: "강남피부과",
            product: "Lift Pro",
            category: "lifting",
        });
        assert_eq!(title, "[Lift Pro] 강남피부과: 인모드 added (lifting)");
    }
}
