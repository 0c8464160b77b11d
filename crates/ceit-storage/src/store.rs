use std::collections::BTreeMap;

use async_trait::async_trait;
use ceit_core::{
    ActivityEntry, CatalogEntry, ClientProduct, CompoundCandidate, EquipmentChange, SalesSignal,
    SalesSignalRule, Snapshot, Tier, TrackedSite,
};
use chrono::{DateTime, Utc};
use thiserror::Error;
use tokio::sync::Mutex;
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("migration error: {0}")]
    Migrate(#[from] sqlx::migrate::MigrateError),
    #[error("tracked site {0} not found")]
    SiteNotFound(Uuid),
    #[error("snapshot {0} already exists; snapshots are append-only")]
    DuplicateSnapshot(Uuid),
    #[error("invalid stored {entity}: {reason}")]
    Invalid { entity: &'static str, reason: String },
    #[error("store unavailable: {0}")]
    Unavailable(String),
}

/// Everything a successful run persists, written as one unit.
#[derive(Debug, Clone)]
pub struct RunWrite {
    pub snapshot: Snapshot,
    pub changes: Vec<EquipmentChange>,
    pub candidates: Vec<CompoundCandidate>,
}

/// Persistence handle threaded through the pipeline.
#[async_trait]
pub trait Store: Send + Sync {
    async fn list_sites(&self) -> Result<Vec<TrackedSite>, StoreError>;
    async fn update_site_tier(&self, site_id: Uuid, tier: Tier) -> Result<(), StoreError>;
    async fn mark_crawled(&self, site_id: Uuid, at: DateTime<Utc>) -> Result<(), StoreError>;
    async fn catalog(&self) -> Result<Vec<CatalogEntry>, StoreError>;
    async fn latest_snapshot(&self, site_id: Uuid) -> Result<Option<Snapshot>, StoreError>;
    async fn persist_run(&self, write: &RunWrite) -> Result<(), StoreError>;
    async fn active_products(&self) -> Result<Vec<ClientProduct>, StoreError>;
    async fn rules_for_product(&self, product_id: Uuid)
        -> Result<Vec<SalesSignalRule>, StoreError>;
    async fn insert_signals(&self, signals: &[SalesSignal]) -> Result<(), StoreError>;
    async fn record_activity(&self, entry: &ActivityEntry) -> Result<(), StoreError>;
}

#[derive(Debug, Clone, Default)]
pub struct MemorySeed {
    pub sites: Vec<TrackedSite>,
    pub catalog: Vec<CatalogEntry>,
    pub products: Vec<ClientProduct>,
    pub rules: Vec<SalesSignalRule>,
}

#[derive(Debug, Default)]
struct MemoryState {
    sites: BTreeMap<Uuid, TrackedSite>,
    catalog: Vec<CatalogEntry>,
    products: Vec<ClientProduct>,
    rules: Vec<SalesSignalRule>,
    snapshots: Vec<Snapshot>,
    changes: Vec<EquipmentChange>,
    candidates: Vec<CompoundCandidate>,
    signals: Vec<SalesSignal>,
    activity: Vec<ActivityEntry>,
    fail_persist: bool,
    fail_signals: bool,
}

/// In-process store used by tests and dry tooling.
#[derive(Debug, Default)]
pub struct MemoryStore {
    state: Mutex<MemoryState>,
}

impl MemoryStore {
    pub fn new(seed: MemorySeed) -> Self {
        let state = MemoryState {
            sites: seed.sites.into_iter().map(|s| (s.id, s)).collect(),
            catalog: seed.catalog,
            products: seed.products,
            rules: seed.rules,
            ..MemoryState::default()
        };
        Self {
            state: Mutex::new(state),
        }
    }

    pub async fn fail_persistence(&self, fail: bool) {
        self.state.lock().await.fail_persist = fail;
    }

    pub async fn fail_signal_writes(&self, fail: bool) {
        self.state.lock().await.fail_signals = fail;
    }

    pub async fn site(&self, site_id: Uuid) -> Option<TrackedSite> {
        self.state.lock().await.sites.get(&site_id).cloned()
    }

    pub async fn snapshots_for(&self, site_id: Uuid) -> Vec<Snapshot> {
        self.state
            .lock()
            .await
            .snapshots
            .iter()
            .filter(|s| s.site_id == site_id)
            .cloned()
            .collect()
    }

    pub async fn changes(&self) -> Vec<EquipmentChange> {
        self.state.lock().await.changes.clone()
    }

    pub async fn candidates(&self) -> Vec<CompoundCandidate> {
        self.state.lock().await.candidates.clone()
    }

    pub async fn signals(&self) -> Vec<SalesSignal> {
        self.state.lock().await.signals.clone()
    }

    pub async fn activity(&self) -> Vec<ActivityEntry> {
        self.state.lock().await.activity.clone()
    }

    pub async fn add_catalog_entry(&self, entry: CatalogEntry) {
        self.state.lock().await.catalog.push(entry);
    }

    pub async fn push_snapshot(&self, snapshot: Snapshot) {
        self.state.lock().await.snapshots.push(snapshot);
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn list_sites(&self) -> Result<Vec<TrackedSite>, StoreError> {
        Ok(self.state.lock().await.sites.values().cloned().collect())
    }

    async fn update_site_tier(&self, site_id: Uuid, tier: Tier) -> Result<(), StoreError> {
        let mut state = self.state.lock().await;
        let site = state
            .sites
            .get_mut(&site_id)
            .ok_or(StoreError::SiteNotFound(site_id))?;
        site.tier = tier;
        Ok(())
    }

    async fn mark_crawled(&self, site_id: Uuid, at: DateTime<Utc>) -> Result<(), StoreError> {
        let mut state = self.state.lock().await;
        let site = state
            .sites
            .get_mut(&site_id)
            .ok_or(StoreError::SiteNotFound(site_id))?;
        site.last_crawled_at = Some(at);
        Ok(())
    }

    async fn catalog(&self) -> Result<Vec<CatalogEntry>, StoreError> {
        Ok(self.state.lock().await.catalog.clone())
    }

    async fn latest_snapshot(&self, site_id: Uuid) -> Result<Option<Snapshot>, StoreError> {
        let state = self.state.lock().await;
        // Later insertion wins a timestamp tie.
        let latest = state
            .snapshots
            .iter()
            .enumerate()
            .filter(|(_, s)| s.site_id == site_id)
            .max_by_key(|(idx, s)| (s.created_at, *idx))
            .map(|(_, s)| s.clone());
        Ok(latest)
    }

    async fn persist_run(&self, write: &RunWrite) -> Result<(), StoreError> {
        let mut state = self.state.lock().await;
        if state.fail_persist {
            return Err(StoreError::Unavailable("persistence disabled".to_string()));
        }
        if !state.sites.contains_key(&write.snapshot.site_id) {
            return Err(StoreError::SiteNotFound(write.snapshot.site_id));
        }
        if state.snapshots.iter().any(|s| s.id == write.snapshot.id) {
            return Err(StoreError::DuplicateSnapshot(write.snapshot.id));
        }
        state.snapshots.push(write.snapshot.clone());
        state.changes.extend(write.changes.iter().cloned());
        state.candidates.extend(write.candidates.iter().cloned());
        Ok(())
    }

    async fn active_products(&self) -> Result<Vec<ClientProduct>, StoreError> {
        Ok(self
            .state
            .lock()
            .await
            .products
            .iter()
            .filter(|p| p.active)
            .cloned()
            .collect())
    }

    async fn rules_for_product(
        &self,
        product_id: Uuid,
    ) -> Result<Vec<SalesSignalRule>, StoreError> {
        Ok(self
            .state
            .lock()
            .await
            .rules
            .iter()
            .filter(|r| r.product_id == product_id)
            .cloned()
            .collect())
    }

    async fn insert_signals(&self, signals: &[SalesSignal]) -> Result<(), StoreError> {
        let mut state = self.state.lock().await;
        if state.fail_signals {
            return Err(StoreError::Unavailable("signal writes disabled".to_string()));
        }
        state.signals.extend(signals.iter().cloned());
        Ok(())
    }

    async fn record_activity(&self, entry: &ActivityEntry) -> Result<(), StoreError> {
        self.state.lock().await.activity.push(entry.clone());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn site() -> TrackedSite {
        TrackedSite {
            id: Uuid::new_v4(),
            name: "강남 라인의원".into(),
            url: "https://line.example".into(),
            source: "naver".into(),
            tier: Tier::Tier3,
            grade: None,
            last_crawled_at: None,
        }
    }

    fn snapshot(site_id: Uuid, day: u32, hash: &str) -> Snapshot {
        Snapshot {
            id: Uuid::new_v4(),
            site_id,
            run_id: Uuid::new_v4(),
            text_hash: hash.into(),
            ocr_hash: None,
            visual_pass_at: None,
            equipment: vec![],
            treatments: vec![],
            prices: vec![],
            event_prices: vec![],
            match_rate: 0.0,
            diff_summary: String::new(),
            created_at: Utc.with_ymd_and_hms(2026, 3, day, 0, 0, 0).single().expect("ts"),
        }
    }

    #[tokio::test]
    async fn latest_snapshot_follows_time_order() {
        let site = site();
        let store = MemoryStore::new(MemorySeed {
            sites: vec![site.clone()],
            ..MemorySeed::default()
        });
        for (day, hash) in [(3, "c"), (1, "a"), (2, "b")] {
            let write = RunWrite {
                snapshot: snapshot(site.id, day, hash),
                changes: vec![],
                candidates: vec![],
            };
            store.persist_run(&write).await.expect("persist");
        }
        let latest = store.latest_snapshot(site.id).await.expect("read");
        assert_eq!(latest.map(|s| s.text_hash), Some("c".to_string()));
    }

    #[tokio::test]
    async fn snapshots_cannot_be_rewritten() {
        let site = site();
        let store = MemoryStore::new(MemorySeed {
            sites: vec![site.clone()],
            ..MemorySeed::default()
        });
        let write = RunWrite {
            snapshot: snapshot(site.id, 1, "a"),
            changes: vec![],
            candidates: vec![],
        };
        store.persist_run(&write).await.expect("first write");
        let err = store.persist_run(&write).await.expect_err("second write");
        assert!(matches!(err, StoreError::DuplicateSnapshot(_)));
        assert_eq!(store.snapshots_for(site.id).await.len(), 1);
    }

    #[tokio::test]
    async fn failed_persist_writes_nothing() {
        let site = site();
        let store = MemoryStore::new(MemorySeed {
            sites: vec![site.clone()],
            ..MemorySeed::default()
        });
        store.fail_persistence(true).await;
        let write = RunWrite {
            snapshot: snapshot(site.id, 1, "a"),
            changes: vec![],
            candidates: vec![],
        };
        assert!(store.persist_run(&write).await.is_err());
        assert!(store.snapshots_for(site.id).await.is_empty());
    }
}
