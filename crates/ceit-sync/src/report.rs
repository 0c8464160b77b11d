//! Per-run artifacts: Markdown brief, JSON delta, Parquet exports and their manifest.

use std::fs::File;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use arrow_array::{
    BooleanArray, Float64Array, Int64Array, RecordBatch, StringArray, UInt32Array,
};
use arrow_schema::{DataType, Field as ArrowField, Schema};
use ceit_core::{EquipmentChange, PriceRecord, SalesSignal};
use ceit_storage::sha256_hex;
use parquet::arrow::ArrowWriter;
use serde::{Deserialize, Serialize};
use tokio::fs;
use uuid::Uuid;

use crate::pipeline::{BatchSummary, SiteReport};

pub const BRIEF_FILE: &str = "run_brief.md";
pub const DELTA_FILE: &str = "run_delta.json";
pub const MANIFEST_FILE: &str = "manifest.json";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReportManifest {
    pub schema_version: u32,
    pub run_id: Uuid,
    pub files: Vec<ManifestFile>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ManifestFile {
    pub name: String,
    pub path: String,
    pub sha256: String,
    pub bytes: u64,
}

#[derive(Debug, Clone)]
pub struct ReportWriter {
    root: PathBuf,
}

impl ReportWriter {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Writes `<root>/<run_id>/` and returns that directory.
    pub async fn write(&self, summary: &BatchSummary, sites: &[SiteReport]) -> Result<PathBuf> {
        let dir = self.root.join(summary.run_id.to_string());
        fs::create_dir_all(&dir)
            .await
            .with_context(|| format!("creating {}", dir.display()))?;

        fs::write(dir.join(BRIEF_FILE), render_brief(summary, sites))
            .await
            .with_context(|| format!("writing {BRIEF_FILE}"))?;

        let delta = serde_json::to_vec_pretty(&serde_json::json!({
            "summary": summary,
            "sites": sites,
        }))
        .context("serializing run delta")?;
        fs::write(dir.join(DELTA_FILE), delta)
            .await
            .with_context(|| format!("writing {DELTA_FILE}"))?;

        let exports = vec![
            ("price_records", prices_batch(sites)?),
            (
                "equipment_changes",
                changes_batch(sites.iter().flat_map(|s| s.changes.iter()).collect())?,
            ),
            (
                "signals",
                signals_batch(sites.iter().flat_map(|s| s.signals.iter()).collect())?,
            ),
        ];
        // Parquet encoding and manifest hashing use blocking file IO.
        let export_dir = dir.clone();
        let files = tokio::task::spawn_blocking(move || -> Result<Vec<ManifestFile>> {
            let mut files = vec![
                manifest_entry(BRIEF_FILE, &export_dir, &export_dir.join(BRIEF_FILE))?,
                manifest_entry(DELTA_FILE, &export_dir, &export_dir.join(DELTA_FILE))?,
            ];
            for (name, batch) in exports {
                let path = export_dir.join(format!("{name}.parquet"));
                write_parquet(&path, batch)?;
                files.push(manifest_entry(name, &export_dir, &path)?);
            }
            Ok(files)
        })
        .await
        .context("joining parquet export task")??;

        let manifest = ReportManifest {
            schema_version: 1,
            run_id: summary.run_id,
            files,
        };
        let bytes = serde_json::to_vec_pretty(&manifest).context("serializing manifest")?;
        fs::write(dir.join(MANIFEST_FILE), bytes)
            .await
            .with_context(|| format!("writing {MANIFEST_FILE}"))?;
        Ok(dir)
    }
}

pub fn render_brief(summary: &BatchSummary, sites: &[SiteReport]) -> String {
    let mut out = format!(
        "# CEIT Run Brief\n\n- Run ID: `{}`\n- Started: {}\n- Finished: {}\n- Processed: {}\n- Succeeded: {}\n- Failed: {}\n- Skipped (schedule): {}\n- Skipped (no change): {}\n- Visual passes: {} ({} tokens)\n- Match rate: {:.1}% ({}/{})\n- Compound candidates: {}\n- Sales signals: {}\n",
        summary.run_id,
        summary.started_at,
        summary.finished_at,
        summary.processed,
        summary.succeeded,
        summary.failed,
        summary.skipped_by_schedule,
        summary.skipped_no_change,
        summary.visual_passes,
        summary.tokens_used,
        summary.match_rate * 100.0,
        summary.names_matched,
        summary.names_total,
        summary.candidates,
        summary.signals,
    );
    if summary.cancelled {
        out.push_str("- Cancelled before all eligible sites ran\n");
    }

    if !sites.is_empty() {
        out.push_str("\n## Changes\n");
        for site in sites {
            out.push_str(&format!("- {}: {}\n", site.site_name, site.diff_summary));
            for signal in &site.signals {
                out.push_str(&format!(
                    "  - [{}] {}\n",
                    signal.priority.as_str(),
                    signal.title
                ));
            }
        }
    }
    if !summary.failures.is_empty() {
        out.push_str("\n## Failures\n");
        for failure in &summary.failures {
            out.push_str(&format!(
                "- {} ({}): {}\n",
                failure.site_name, failure.stage, failure.message
            ));
        }
    }
    out
}

fn write_parquet(path: &Path, batch: RecordBatch) -> Result<()> {
    let file = File::create(path).with_context(|| format!("creating {}", path.display()))?;
    let mut writer = ArrowWriter::try_new(file, batch.schema(), None)
        .with_context(|| format!("opening parquet writer {}", path.display()))?;
    writer
        .write(&batch)
        .with_context(|| format!("writing record batch {}", path.display()))?;
    writer
        .close()
        .with_context(|| format!("closing parquet writer {}", path.display()))?;
    Ok(())
}

fn prices_batch(sites: &[SiteReport]) -> Result<RecordBatch> {
    let rows: Vec<(&SiteReport, &PriceRecord)> = sites
        .iter()
        .flat_map(|s| s.prices.iter().map(move |p| (s, p)))
        .collect();
    let schema = Arc::new(Schema::new(vec![
        ArrowField::new("site_id", DataType::Utf8, false),
        ArrowField::new("item_name", DataType::Utf8, false),
        ArrowField::new("canonical_name", DataType::Utf8, true),
        ArrowField::new("total_price", DataType::Int64, false),
        ArrowField::new("quantity", DataType::UInt32, true),
        ArrowField::new("unit_price", DataType::Float64, true),
        ArrowField::new("is_event", DataType::Boolean, false),
        ArrowField::new("event_ends_on", DataType::Utf8, true),
        ArrowField::new("is_outlier", DataType::Boolean, false),
    ]));

    let site_ids = StringArray::from(
        rows.iter()
            .map(|(s, _)| Some(s.site_id.to_string()))
            .collect::<Vec<_>>(),
    );
    let items = StringArray::from(
        rows.iter()
            .map(|(_, p)| Some(p.item_name.as_str()))
            .collect::<Vec<_>>(),
    );
    let canonical = StringArray::from(
        rows.iter()
            .map(|(_, p)| p.canonical_name.as_deref())
            .collect::<Vec<_>>(),
    );
    let totals = Int64Array::from(rows.iter().map(|(_, p)| p.total_price).collect::<Vec<_>>());
    let quantities = UInt32Array::from(rows.iter().map(|(_, p)| p.quantity).collect::<Vec<_>>());
    let unit_prices =
        Float64Array::from(rows.iter().map(|(_, p)| p.unit_price).collect::<Vec<_>>());
    let events = BooleanArray::from(rows.iter().map(|(_, p)| p.is_event()).collect::<Vec<_>>());
    let ends_on = StringArray::from(
        rows.iter()
            .map(|(_, p)| {
                p.event
                    .as_ref()
                    .and_then(|e| e.ends_on)
                    .map(|d| d.to_string())
            })
            .collect::<Vec<_>>(),
    );
    let outliers = BooleanArray::from(rows.iter().map(|(_, p)| p.is_outlier).collect::<Vec<_>>());

    let batch = RecordBatch::try_new(
        schema,
        vec![
            Arc::new(site_ids),
            Arc::new(items),
            Arc::new(canonical),
            Arc::new(totals),
            Arc::new(quantities),
            Arc::new(unit_prices),
            Arc::new(events),
            Arc::new(ends_on),
            Arc::new(outliers),
        ],
    )
    .context("building price_records record batch");
    batch
}

fn changes_batch(changes: Vec<&EquipmentChange>) -> Result<RecordBatch> {
    let schema = Arc::new(Schema::new(vec![
        ArrowField::new("site_id", DataType::Utf8, false),
        ArrowField::new("snapshot_id", DataType::Utf8, false),
        ArrowField::new("change_type", DataType::Utf8, false),
        ArrowField::new("item_name", DataType::Utf8, false),
        ArrowField::new("category", DataType::Utf8, true),
        ArrowField::new("detected_at", DataType::Utf8, false),
    ]));
    let column = |f: fn(&EquipmentChange) -> Option<String>| {
        StringArray::from(changes.iter().map(|c| f(c)).collect::<Vec<_>>())
    };
    let batch = RecordBatch::try_new(
        schema,
        vec![
            Arc::new(column(|c| Some(c.site_id.to_string()))),
            Arc::new(column(|c| Some(c.snapshot_id.to_string()))),
            Arc::new(column(|c| Some(c.change_type.as_str().to_string()))),
            Arc::new(column(|c| Some(c.item_name.clone()))),
            Arc::new(column(|c| c.category.clone())),
            Arc::new(column(|c| Some(c.detected_at.to_rfc3339()))),
        ],
    )
    .context("building equipment_changes record batch");
    batch
}

fn signals_batch(signals: Vec<&SalesSignal>) -> Result<RecordBatch> {
    let schema = Arc::new(Schema::new(vec![
        ArrowField::new("site_id", DataType::Utf8, false),
        ArrowField::new("rule_id", DataType::Utf8, false),
        ArrowField::new("product_id", DataType::Utf8, false),
        ArrowField::new("priority", DataType::Utf8, false),
        ArrowField::new("title", DataType::Utf8, false),
        ArrowField::new("change_type", DataType::Utf8, false),
        ArrowField::new("item_name", DataType::Utf8, false),
        ArrowField::new("created_at", DataType::Utf8, false),
    ]));
    let column = |f: fn(&SalesSignal) -> String| {
        StringArray::from(signals.iter().map(|s| Some(f(s))).collect::<Vec<_>>())
    };
    let batch = RecordBatch::try_new(
        schema,
        vec![
            Arc::new(column(|s| s.site_id.to_string())),
            Arc::new(column(|s| s.rule_id.to_string())),
            Arc::new(column(|s| s.product_id.to_string())),
            Arc::new(column(|s| s.priority.as_str().to_string())),
            Arc::new(column(|s| s.title.clone())),
            Arc::new(column(|s| s.change_type.as_str().to_string())),
            Arc::new(column(|s| s.item_name.clone())),
            Arc::new(column(|s| s.created_at.to_rfc3339())),
        ],
    )
    .context("building signals record batch");
    batch
}

fn manifest_entry(name: &str, dir: &Path, path: &Path) -> Result<ManifestFile> {
    let bytes = std::fs::read(path).with_context(|| format!("reading {}", path.display()))?;
    let rel = path.strip_prefix(dir).unwrap_or(path).display().to_string();
    Ok(ManifestFile {
        name: name.to_string(),
        path: rel,
        sha256: sha256_hex(&bytes),
        bytes: bytes.len() as u64,
    })
}
