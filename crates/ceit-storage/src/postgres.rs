use std::str::FromStr;

use async_trait::async_trait;
use ceit_core::{
    ActivityEntry, CatalogEntry, ClientProduct, EventPricing, ImportanceGrade, ItemKind,
    PriceRecord, RuleDefinition, SalesSignal, SalesSignalRule, Snapshot, Tier, TrackedSite,
};
use chrono::{DateTime, NaiveDate, Utc};
use sqlx::postgres::{PgPool, PgPoolOptions, PgRow};
use sqlx::Row;
use tracing::warn;
use uuid::Uuid;

use crate::store::{RunWrite, Store, StoreError};

/// Postgres-backed store. Run writes are transactional.
#[derive(Debug, Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub async fn connect(database_url: &str) -> Result<Self, StoreError> {
        let pool = PgPoolOptions::new()
            .max_connections(4)
            .connect(database_url)
            .await?;
        Ok(Self { pool })
    }

    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn migrate(&self) -> Result<(), StoreError> {
        sqlx::migrate!("./migrations").run(&self.pool).await?;
        Ok(())
    }
}

fn parse_column<T: FromStr>(entity: &'static str, value: &str) -> Result<T, StoreError>
where
    T::Err: std::fmt::Display,
{
    value.parse::<T>().map_err(|e| StoreError::Invalid {
        entity,
        reason: e.to_string(),
    })
}

fn site_from_row(row: &PgRow) -> Result<TrackedSite, StoreError> {
    let tier: String = row.try_get("tier")?;
    let grade: Option<String> = row.try_get("grade")?;
    Ok(TrackedSite {
        id: row.try_get("id")?,
        name: row.try_get("name")?,
        url: row.try_get("url")?,
        source: row.try_get("source")?,
        tier: parse_column::<Tier>("tracked_site", &tier)?,
        grade: grade
            .as_deref()
            .map(|g| parse_column::<ImportanceGrade>("tracked_site", g))
            .transpose()?,
        last_crawled_at: row.try_get("last_crawled_at")?,
    })
}

/// One `price_records` row. Regular and event prices share the table; the event
/// columns tell them apart when read back.
#[derive(Debug, Clone, PartialEq, sqlx::FromRow)]
struct PriceRow {
    position: i32,
    item_name: String,
    canonical_name: Option<String>,
    total_price: i64,
    quantity: Option<i32>,
    unit: Option<String>,
    unit_price: Option<f64>,
    event_label: Option<String>,
    event_ends_on: Option<NaiveDate>,
    event_condition: Option<String>,
    is_outlier: bool,
    snippet: String,
}

impl PriceRow {
    fn new(position: usize, price: &PriceRecord) -> Self {
        let event = price.event.as_ref();
        Self {
            position: position as i32,
            item_name: price.item_name.clone(),
            canonical_name: price.canonical_name.clone(),
            total_price: price.total_price,
            quantity: price.quantity.and_then(|q| i32::try_from(q).ok()),
            unit: price.unit.clone(),
            unit_price: price.unit_price,
            event_label: event.map(|e| e.label.clone()),
            event_ends_on: event.and_then(|e| e.ends_on),
            event_condition: event.and_then(|e| e.condition.clone()),
            is_outlier: price.is_outlier,
            snippet: price.snippet.clone(),
        }
    }

    fn into_record(self) -> PriceRecord {
        let event = self.event_label.map(|label| EventPricing {
            label,
            ends_on: self.event_ends_on,
            condition: self.event_condition,
        });
        PriceRecord {
            item_name: self.item_name,
            canonical_name: self.canonical_name,
            total_price: self.total_price,
            quantity: self.quantity.and_then(|q| u32::try_from(q).ok()),
            unit: self.unit,
            unit_price: self.unit_price,
            event,
            is_outlier: self.is_outlier,
            snippet: self.snippet,
        }
    }
}

/// Regular prices first, then event prices, numbered in that order.
fn price_rows(snapshot: &Snapshot) -> Vec<PriceRow> {
    snapshot
        .prices
        .iter()
        .chain(&snapshot.event_prices)
        .enumerate()
        .map(|(position, price)| PriceRow::new(position, price))
        .collect()
}

/// Splits stored rows back into (regular, event) prices.
fn split_price_rows(mut rows: Vec<PriceRow>) -> (Vec<PriceRecord>, Vec<PriceRecord>) {
    rows.sort_by_key(|r| r.position);
    rows.into_iter()
        .map(PriceRow::into_record)
        .partition(|p| !p.is_event())
}

#[async_trait]
impl Store for PgStore {
    async fn list_sites(&self) -> Result<Vec<TrackedSite>, StoreError> {
        let rows = sqlx::query(
            "SELECT id, name, url, source, tier, grade, last_crawled_at FROM tracked_sites ORDER BY id",
        )
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(site_from_row).collect()
    }

    async fn update_site_tier(&self, site_id: Uuid, tier: Tier) -> Result<(), StoreError> {
        let result = sqlx::query("UPDATE tracked_sites SET tier = $2 WHERE id = $1")
            .bind(site_id)
            .bind(tier.as_str())
            .execute(&self.pool)
            .await?;
        if result.rows_affected() == 0 {
            return Err(StoreError::SiteNotFound(site_id));
        }
        Ok(())
    }

    async fn mark_crawled(&self, site_id: Uuid, at: DateTime<Utc>) -> Result<(), StoreError> {
        let result = sqlx::query("UPDATE tracked_sites SET last_crawled_at = $2 WHERE id = $1")
            .bind(site_id)
            .bind(at)
            .execute(&self.pool)
            .await?;
        if result.rows_affected() == 0 {
            return Err(StoreError::SiteNotFound(site_id));
        }
        Ok(())
    }

    async fn catalog(&self) -> Result<Vec<CatalogEntry>, StoreError> {
        let rows = sqlx::query(
            "SELECT id, canonical_name, category, kind, keywords FROM catalog_entries ORDER BY canonical_name",
        )
        .fetch_all(&self.pool)
        .await?;
        rows.iter()
            .map(|row| -> Result<CatalogEntry, StoreError> {
                let kind: String = row.try_get("kind")?;
                Ok(CatalogEntry {
                    id: row.try_get("id")?,
                    canonical_name: row.try_get("canonical_name")?,
                    category: row.try_get("category")?,
                    kind: parse_column::<ItemKind>("catalog_entry", &kind)?,
                    keywords: row.try_get("keywords")?,
                })
            })
            .collect()
    }

    async fn latest_snapshot(&self, site_id: Uuid) -> Result<Option<Snapshot>, StoreError> {
        let Some(row) = sqlx::query(
            "SELECT id, site_id, run_id, text_hash, ocr_hash, visual_pass_at, equipment, treatments, \
             match_rate, diff_summary, created_at \
             FROM snapshots WHERE site_id = $1 ORDER BY created_at DESC LIMIT 1",
        )
        .bind(site_id)
        .fetch_optional(&self.pool)
        .await?
        else {
            return Ok(None);
        };

        let snapshot_id: Uuid = row.try_get("id")?;
        let rows: Vec<PriceRow> = sqlx::query_as(
            "SELECT position, item_name, canonical_name, total_price, quantity, unit, unit_price, \
             event_label, event_ends_on, event_condition, is_outlier, snippet \
             FROM price_records WHERE snapshot_id = $1 ORDER BY position",
        )
        .bind(snapshot_id)
        .fetch_all(&self.pool)
        .await?;
        let (prices, event_prices) = split_price_rows(rows);

        Ok(Some(Snapshot {
            id: snapshot_id,
            site_id: row.try_get("site_id")?,
            run_id: row.try_get("run_id")?,
            text_hash: row.try_get("text_hash")?,
            ocr_hash: row.try_get("ocr_hash")?,
            visual_pass_at: row.try_get("visual_pass_at")?,
            equipment: row.try_get("equipment")?,
            treatments: row.try_get("treatments")?,
            prices,
            event_prices,
            match_rate: row.try_get("match_rate")?,
            diff_summary: row.try_get("diff_summary")?,
            created_at: row.try_get("created_at")?,
        }))
    }

    async fn persist_run(&self, write: &RunWrite) -> Result<(), StoreError> {
        let snapshot = &write.snapshot;
        let mut tx = self.pool.begin().await?;

        sqlx::query(
            "INSERT INTO snapshots (id, site_id, run_id, text_hash, ocr_hash, visual_pass_at, equipment, \
             treatments, match_rate, diff_summary, created_at) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)",
        )
        .bind(snapshot.id)
        .bind(snapshot.site_id)
        .bind(snapshot.run_id)
        .bind(&snapshot.text_hash)
        .bind(&snapshot.ocr_hash)
        .bind(snapshot.visual_pass_at)
        .bind(&snapshot.equipment)
        .bind(&snapshot.treatments)
        .bind(snapshot.match_rate)
        .bind(&snapshot.diff_summary)
        .bind(snapshot.created_at)
        .execute(&mut *tx)
        .await?;

        for row in price_rows(snapshot) {
            sqlx::query(
                "INSERT INTO price_records (id, snapshot_id, position, item_name, canonical_name, total_price, \
                 quantity, unit, unit_price, event_label, event_ends_on, event_condition, is_outlier, snippet) \
                 VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14)",
            )
            .bind(Uuid::new_v4())
            .bind(snapshot.id)
            .bind(row.position)
            .bind(&row.item_name)
            .bind(&row.canonical_name)
            .bind(row.total_price)
            .bind(row.quantity)
            .bind(&row.unit)
            .bind(row.unit_price)
            .bind(&row.event_label)
            .bind(row.event_ends_on)
            .bind(&row.event_condition)
            .bind(row.is_outlier)
            .bind(&row.snippet)
            .execute(&mut *tx)
            .await?;
        }

        for change in &write.changes {
            sqlx::query(
                "INSERT INTO equipment_changes (id, site_id, snapshot_id, change_type, item_name, category, detected_at) \
                 VALUES ($1, $2, $3, $4, $5, $6, $7)",
            )
            .bind(change.id)
            .bind(change.site_id)
            .bind(change.snapshot_id)
            .bind(change.change_type.as_str())
            .bind(&change.item_name)
            .bind(&change.category)
            .bind(change.detected_at)
            .execute(&mut *tx)
            .await?;
        }

        for candidate in &write.candidates {
            sqlx::query(
                "INSERT INTO compound_candidates (id, site_id, run_id, kind, raw_name, matched_keywords, \
                 matched_canonicals, residual, created_at) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)",
            )
            .bind(candidate.id)
            .bind(candidate.site_id)
            .bind(candidate.run_id)
            .bind(candidate.kind.as_str())
            .bind(&candidate.raw_name)
            .bind(&candidate.matched_keywords)
            .bind(&candidate.matched_canonicals)
            .bind(&candidate.residual)
            .bind(candidate.created_at)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        Ok(())
    }

    async fn active_products(&self) -> Result<Vec<ClientProduct>, StoreError> {
        let rows = sqlx::query("SELECT id, name, active FROM client_products WHERE active ORDER BY name")
            .fetch_all(&self.pool)
            .await?;
        rows.iter()
            .map(|row| -> Result<ClientProduct, StoreError> {
                Ok(ClientProduct {
                    id: row.try_get("id")?,
                    name: row.try_get("name")?,
                    active: row.try_get("active")?,
                })
            })
            .collect()
    }

    async fn rules_for_product(
        &self,
        product_id: Uuid,
    ) -> Result<Vec<SalesSignalRule>, StoreError> {
        let rows = sqlx::query(
            "SELECT id, product_id, name, priority, condition, title_template \
             FROM sales_signal_rules WHERE product_id = $1 AND active ORDER BY name",
        )
        .bind(product_id)
        .fetch_all(&self.pool)
        .await?;

        let mut rules = Vec::with_capacity(rows.len());
        for row in &rows {
            let id: Uuid = row.try_get("id")?;
            let raw = serde_json::json!({
                "id": id,
                "product_id": row.try_get::<Uuid, _>("product_id")?,
                "name": row.try_get::<String, _>("name")?,
                "priority": row.try_get::<String, _>("priority")?,
                "condition": row.try_get::<serde_json::Value, _>("condition")?,
                "title_template": row.try_get::<String, _>("title_template")?,
            });
            // Unusable rule shapes are dropped here rather than failing evaluation later.
            match serde_json::from_value::<RuleDefinition>(raw)
                .map_err(|e| e.to_string())
                .and_then(|def| SalesSignalRule::try_from(def).map_err(|e| e.to_string()))
            {
                Ok(rule) => rules.push(rule),
                Err(reason) => warn!(rule_id = %id, %reason, "skipping invalid sales signal rule"),
            }
        }
        Ok(rules)
    }

    async fn insert_signals(&self, signals: &[SalesSignal]) -> Result<(), StoreError> {
        let mut tx = self.pool.begin().await?;
        for signal in signals {
            sqlx::query(
                "INSERT INTO sales_signals (id, rule_id, product_id, site_id, change_id, priority, title, \
                 change_type, item_name, created_at) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10) \
                 ON CONFLICT (rule_id, change_id) DO NOTHING",
            )
            .bind(signal.id)
            .bind(signal.rule_id)
            .bind(signal.product_id)
            .bind(signal.site_id)
            .bind(signal.change_id)
            .bind(signal.priority.as_str())
            .bind(&signal.title)
            .bind(signal.change_type.as_str())
            .bind(&signal.item_name)
            .bind(signal.created_at)
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;
        Ok(())
    }

    async fn record_activity(&self, entry: &ActivityEntry) -> Result<(), StoreError> {
        sqlx::query(
            "INSERT INTO activity_log (id, site_id, run_id, stage, outcome, message, at) \
             VALUES ($1, $2, $3, $4, $5, $6, $7)",
        )
        .bind(entry.id)
        .bind(entry.site_id)
        .bind(entry.run_id)
        .bind(&entry.stage)
        .bind(entry.outcome.as_str())
        .bind(&entry.message)
        .bind(entry.at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn price(item: &str, total: i64, event: Option<EventPricing>) -> PriceRecord {
        PriceRecord {
            item_name: item.into(),
            canonical_name: Some(item.into()),
            total_price: total,
            quantity: Some(300),
            unit: Some("샷".into()),
            unit_price: Some(total as f64 / 300.0),
            event,
            is_outlier: false,
            snippet: format!("{item} {total}원"),
        }
    }

    fn snapshot(site_id: Uuid) -> Snapshot {
        let promo = EventPricing {
            label: "오픈기념 이벤트".into(),
            ends_on: NaiveDate::from_ymd_opt(2026, 3, 31),
            condition: Some("첫 방문".into()),
        };
        Snapshot {
            id: Uuid::new_v4(),
            site_id,
            run_id: Uuid::new_v4(),
            text_hash: "abc".into(),
            ocr_hash: None,
            visual_pass_at: None,
            equipment: vec!["울쎄라".into()],
            treatments: vec![],
            prices: vec![price("인모드", 150_000, None)],
            event_prices: vec![price("울쎄라", 790_000, Some(promo))],
            match_rate: 1.0,
            diff_summary: "baseline: 1 equipment, 0 treatments, 2 prices".into(),
            created_at: Utc.with_ymd_and_hms(2026, 3, 2, 3, 0, 0).single().expect("ts"),
        }
    }

    #[test]
    fn event_prices_are_stored_alongside_regular_prices() {
        let snapshot = snapshot(Uuid::new_v4());
        let rows = price_rows(&snapshot);
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].position, 0);
        assert_eq!(rows[0].event_label, None);
        assert_eq!(rows[1].position, 1);
        assert_eq!(rows[1].event_label.as_deref(), Some("오픈기념 이벤트"));
        assert_eq!(rows[1].event_ends_on, NaiveDate::from_ymd_opt(2026, 3, 31));
        assert_eq!(rows[1].quantity, Some(300));
    }

    #[test]
    fn stored_rows_split_back_into_regular_and_event_prices() {
        let snapshot = snapshot(Uuid::new_v4());
        let mut rows = price_rows(&snapshot);
        rows.reverse();
        let (prices, event_prices) = split_price_rows(rows);
        assert_eq!(prices, snapshot.prices);
        assert_eq!(event_prices, snapshot.event_prices);
    }

    /// Needs a reachable Postgres in `DATABASE_URL`; skipped otherwise.
    #[tokio::test]
    async fn run_write_round_trips_through_postgres() {
        let Ok(url) = std::env::var("DATABASE_URL") else {
            return;
        };
        let store = PgStore::connect(&url).await.expect("connect");
        store.migrate().await.expect("migrate");

        let site_id = Uuid::new_v4();
        sqlx::query("INSERT INTO tracked_sites (id, name, url) VALUES ($1, $2, $3)")
            .bind(site_id)
            .bind("round trip clinic")
            .bind(format!("https://{site_id}.example"))
            .execute(&store.pool)
            .await
            .expect("insert site");

        let snapshot = snapshot(site_id);
        let write = RunWrite {
            snapshot: snapshot.clone(),
            changes: vec![],
            candidates: vec![],
        };
        store.persist_run(&write).await.expect("persist");

        let loaded = store
            .latest_snapshot(site_id)
            .await
            .expect("read")
            .expect("snapshot");
        assert_eq!(loaded.prices, snapshot.prices);
        assert_eq!(loaded.event_prices, snapshot.event_prices);
        assert_eq!(loaded.equipment, snapshot.equipment);
        assert_eq!(loaded.text_hash, snapshot.text_hash);
    }
}
