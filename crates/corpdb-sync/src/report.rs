//! Per-run report files under `reports/<run_id>/`.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::fs;
use uuid::Uuid;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceStats {
    pub source_id: String,
    pub files: usize,
    /// CSV rows read, or URLs attempted for page sources.
    pub rows: usize,
    pub candidates: usize,
    pub skipped_no_identity: usize,
    pub fetch_failures: usize,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutcomeCounts {
    pub created: usize,
    pub updated: usize,
    pub unchanged: usize,
    pub would_create: usize,
    pub would_update: usize,
    pub held_for_review: usize,
    pub ambiguous: usize,
    pub failed: usize,
    pub fields_filled: usize,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CleanupCounts {
    pub scanned: usize,
    pub affected: usize,
    pub batches: usize,
    pub committed_ops: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunSummary {
    pub run_id: Uuid,
    pub command: String,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub dry_run: bool,
    #[serde(default)]
    pub sources: Vec<SourceStats>,
    #[serde(default)]
    pub candidates: usize,
    #[serde(default)]
    pub counts: OutcomeCounts,
    /// Filled field key → number of documents it was filled on.
    #[serde(default)]
    pub fills_by_field: BTreeMap<String, usize>,
    #[serde(default)]
    pub cleanup: Option<CleanupCounts>,
    pub reports_dir: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct AmbiguousMatchRow {
    pub source_id: String,
    pub locator: String,
    pub name: Option<String>,
    pub corporate_number: Option<String>,
    pub strategy: String,
    pub match_count: usize,
    pub chosen_id: String,
    pub action: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct NoMatchRow {
    pub source_id: String,
    pub locator: String,
    pub name: Option<String>,
    pub corporate_number: Option<String>,
    pub prefecture: Option<String>,
    /// Created id, or the corporate number a dry run would use.
    pub id: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct FieldFillRow {
    pub id: String,
    pub field: String,
    pub source_id: String,
    pub locator: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct FailureRow {
    pub source_id: String,
    pub locator: String,
    pub name: Option<String>,
    pub error: String,
}

pub struct RunReportWriter {
    dir: PathBuf,
}

impl RunReportWriter {
    pub async fn create(workspace_root: &Path, run_id: Uuid) -> Result<Self> {
        let dir = workspace_root.join("reports").join(run_id.to_string());
        fs::create_dir_all(&dir)
            .await
            .with_context(|| format!("creating {}", dir.display()))?;
        Ok(Self { dir })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub async fn write_text(&self, name: &str, text: &str) -> Result<()> {
        let path = self.dir.join(name);
        fs::write(&path, text)
            .await
            .with_context(|| format!("writing {}", path.display()))
    }

    pub async fn write_json<T: Serialize>(&self, name: &str, value: &T) -> Result<()> {
        let bytes = serde_json::to_vec_pretty(value).with_context(|| format!("serializing {name}"))?;
        let path = self.dir.join(name);
        fs::write(&path, bytes)
            .await
            .with_context(|| format!("writing {}", path.display()))
    }

    /// Header comes from the row type; an empty report is an empty file.
    pub async fn write_csv<T: Serialize>(&self, name: &str, rows: &[T]) -> Result<()> {
        let mut writer = csv::Writer::from_writer(Vec::new());
        for row in rows {
            writer
                .serialize(row)
                .with_context(|| format!("serializing {name} row"))?;
        }
        let bytes = writer
            .into_inner()
            .map_err(|e| anyhow!("flushing {name}: {}", e.error()))?;
        let path = self.dir.join(name);
        fs::write(&path, bytes)
            .await
            .with_context(|| format!("writing {}", path.display()))
    }
}

pub fn daily_brief(summary: &RunSummary) -> String {
    let mut lines = vec![
        "# corpdb Daily Brief".to_string(),
        String::new(),
        format!("- Run ID: `{}`", summary.run_id),
        format!("- Command: {}", summary.command),
        format!("- Started: {}", summary.started_at),
        format!("- Finished: {}", summary.finished_at),
        format!("- Dry run: {}", summary.dry_run),
    ];

    if !summary.sources.is_empty() {
        let c = &summary.counts;
        lines.push(format!("- Candidates: {}", summary.candidates));
        lines.push(String::new());
        lines.push("## Outcomes".to_string());
        lines.push(format!("- created: {}", c.created + c.would_create));
        lines.push(format!("- updated: {}", c.updated + c.would_update));
        lines.push(format!("- unchanged: {}", c.unchanged));
        lines.push(format!("- held for review: {}", c.held_for_review));
        lines.push(format!("- ambiguous matches: {}", c.ambiguous));
        lines.push(format!("- failed: {}", c.failed));
        lines.push(format!("- fields filled: {}", c.fields_filled));
        lines.push(String::new());
        lines.push("## Sources".to_string());
        for s in &summary.sources {
            lines.push(format!(
                "- {}: {} rows, {} candidates, {} skipped, {} fetch failures",
                s.source_id, s.rows, s.candidates, s.skipped_no_identity, s.fetch_failures
            ));
        }
    }

    if let Some(cleanup) = &summary.cleanup {
        lines.push(String::new());
        lines.push("## Cleanup".to_string());
        lines.push(format!("- scanned: {}", cleanup.scanned));
        lines.push(format!("- affected: {}", cleanup.affected));
        lines.push(format!(
            "- committed: {} ops in {} batches",
            cleanup.committed_ops, cleanup.batches
        ));
    }

    lines.push(String::new());
    lines.join("\n")
}
