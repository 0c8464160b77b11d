//! Rule-driven sales signals over a run's equipment changes.

use std::collections::HashSet;

use ceit_core::{
    ClientProduct, EquipmentChange, SalesSignal, SalesSignalRule, TemplateVars, TrackedSite,
};
use chrono::{DateTime, Utc};
use uuid::Uuid;

#[derive(Debug, Clone)]
pub struct ProductRules {
    pub product: ClientProduct,
    pub rules: Vec<SalesSignalRule>,
}

/// Evaluates every rule of every active product against `changes`. A rule fires at
/// most once per underlying change; products without rules emit nothing.
pub fn classify(
    products: &[ProductRules],
    changes: &[EquipmentChange],
    site: &TrackedSite,
    at: DateTime<Utc>,
) -> Vec<SalesSignal> {
    let mut fired: HashSet<(Uuid, Uuid)> = HashSet::new();
    let mut signals = Vec::new();

    for entry in products.iter().filter(|p| p.product.active) {
        for rule in &entry.rules {
            for change in changes {
                if !rule.condition.matches(change) || !fired.insert((rule.id, change.id)) {
                    continue;
                }
                let title = rule.title_template.render(&TemplateVars {
                    item: &change.item_name,
                    change: change.change_type.as_str(),
                    site: &site.name,
                    product: &entry.product.name,
                    category: change.category.as_deref().unwrap_or(""),
                });
                signals.push(SalesSignal {
                    id: Uuid::new_v4(),
                    rule_id: rule.id,
                    product_id: entry.product.id,
                    site_id: site.id,
                    change_id: change.id,
                    priority: rule.priority,
                    title,
                    change_type: change.change_type,
                    item_name: change.item_name.clone(),
                    created_at: at,
                });
            }
        }
    }
    signals
}

#[cfg(test)]
mod tests {
    use super::*;
    use ceit_core::{ChangeType, SignalPriority, Tier};

    fn site() -> TrackedSite {
        TrackedSite {
            id: Uuid::new_v4(),
            name: "강남 라인의원".into(),
            url: "https://line.example".into(),
            source: "naver".into(),
            tier: Tier::Tier1,
            grade: None,
            last_crawled_at: None,
        }
    }

    fn product(name: &str) -> ClientProduct {
        ClientProduct {
            id: Uuid::new_v4(),
            name: name.into(),
            active: true,
        }
    }

    fn change(change_type: ChangeType, item: &str) -> EquipmentChange {
        EquipmentChange {
            id: Uuid::new_v4(),
            site_id: Uuid::new_v4(),
            snapshot_id: Uuid::new_v4(),
            change_type,
            item_name: item.into(),
            category: Some("lifting".into()),
            detected_at: Utc::now(),
        }
    }

    fn rule(product_id: Uuid, yaml_condition: &str, priority: &str, title: &str) -> SalesSignalRule {
        let yaml = format!(
            "id: {}\nproduct_id: {product_id}\nname: rule\npriority: {priority}\ncondition:\n{yaml_condition}\ntitle_template: \"{title}\"\n",
            Uuid::new_v4()
        );
        serde_yaml::from_str(&yaml).expect("rule")
    }

    #[test]
    fn product_without_rules_emits_nothing() {
        let products = vec![ProductRules {
            product: product("써마지 팁"),
            rules: vec![],
        }];
        let changes = vec![change(ChangeType::Added, "인모드")];
        assert!(classify(&products, &changes, &site(), Utc::now()).is_empty());
    }

    #[test]
    fn rules_fire_independently_and_once_per_change() {
        let p = product("인모드 카트리지");
        let rules = vec![
            rule(
                p.id,
                "  kind: item_contains\n  change_types: [added]\n  keywords: [인모드]",
                "high",
                "{site}: {item} {change} ({product})",
            ),
            rule(
                p.id,
                "  kind: any_change\n  change_types: [added, removed]",
                "low",
                "{item} {change} [{category}]",
            ),
        ];
        let products = vec![ProductRules { product: p, rules }];
        let added = change(ChangeType::Added, "인모드");
        let changes = vec![
            added.clone(),
            change(ChangeType::Removed, "울쎄라"),
            added,
        ];

        let signals = classify(&products, &changes, &site(), Utc::now());
        assert_eq!(signals.len(), 3);
        assert_eq!(signals[0].priority, SignalPriority::High);
        assert_eq!(signals[0].title, "강남 라인의원: 인모드 added (인모드 카트리지)");
        assert_eq!(signals[1].title, "인모드 added [lifting]");
        assert_eq!(signals[2].title, "울쎄라 removed [lifting]");
    }

    #[test]
    fn inactive_products_are_ignored() {
        let mut p = product("울쎄라 팁");
        p.active = false;
        let rules = vec![rule(
            p.id,
            "  kind: any_change\n  change_types: [added]",
            "medium",
            "{item}",
        )];
        let products = vec![ProductRules { product: p, rules }];
        let changes = vec![change(ChangeType::Added, "울쎄라")];
        assert!(classify(&products, &changes, &site(), Utc::now()).is_empty());
    }
}
