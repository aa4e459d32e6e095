//! Reconciliation pipeline: source registry, import and enrich runs, cleanup
//! runs and run reports.

use std::collections::{BTreeMap, HashSet};
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use chrono::Utc;
use corpdb_adapters::industry::DEFAULT_MIN_SCORE;
use corpdb_adapters::{
    discover_csv_files, fetch_page_candidate, read_csv_file, CandidateAssembler, HeaderMap,
    IndustryMaster, LabelValueExtractor, PageExtractor,
};
use corpdb_core::CandidateRecord;
use corpdb_storage::{CompanyStore, HttpClientConfig, HttpFetcher, DEFAULT_MAX_BATCH_SIZE};
use futures::stream::{self, StreamExt};
use serde::Deserialize;
use tokio::fs;
use tracing::{info, warn};
use uuid::Uuid;

pub mod backfill;
pub mod dedup;
pub mod matcher;
pub mod merge;
pub mod reconcile;
pub mod report;

pub use backfill::{BackfillOutcome, CorporateNumberBackfill, WebPresenceChange};
pub use dedup::{DuplicateGroup, NameReviewConfig, NameReviewEngine, NameReviewItem};
pub use matcher::{EntityMatch, EntityMatcher, LookupStrategy, MIN_ADDRESS_SIMILARITY};
pub use merge::{MergeDecision, MergePolicy};
pub use reconcile::{
    AmbiguityPolicy, ReconcileError, ReconcileOptions, ReconcileOutcome, Reconciled, Reconciler,
};
pub use report::{RunReportWriter, RunSummary, SourceStats};

use report::{
    AmbiguousMatchRow, CleanupCounts, FailureRow, FieldFillRow, NoMatchRow, OutcomeCounts,
};

pub const CRATE_NAME: &str = "corpdb-sync";

#[derive(Debug, Clone, Deserialize)]
pub struct SourceRegistry {
    pub sources: Vec<SourceConfig>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceKind {
    Csv,
    Pages,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SourceConfig {
    pub source_id: String,
    pub display_name: String,
    pub enabled: bool,
    pub kind: SourceKind,
    /// Workspace-relative glob of CSV exports.
    #[serde(default)]
    pub path_glob: Option<String>,
    /// Workspace-relative file with one page URL per line.
    #[serde(default)]
    pub url_list: Option<String>,
    #[serde(default)]
    pub notes: Option<String>,
}

#[derive(Debug, Clone)]
pub struct ImportConfig {
    pub database_url: Option<String>,
    pub workspace_root: PathBuf,
    pub max_batch_size: usize,
    pub concurrency: usize,
    pub http_timeout_secs: u64,
    pub request_delay_ms: u64,
    pub user_agent: String,
    pub industry_min_score: usize,
}

fn parsed<T: FromStr>(lookup: &impl Fn(&str) -> Option<String>, key: &str, default: T) -> T {
    lookup(key)
        .and_then(|v| v.trim().parse().ok())
        .unwrap_or(default)
}

impl ImportConfig {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        Self {
            database_url: lookup("DATABASE_URL").filter(|v| !v.trim().is_empty()),
            workspace_root: lookup("CORPDB_WORKSPACE")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from(".")),
            max_batch_size: parsed(&lookup, "CORPDB_BATCH_SIZE", DEFAULT_MAX_BATCH_SIZE).max(1),
            concurrency: parsed(&lookup, "CORPDB_CONCURRENCY", 1usize).max(1),
            http_timeout_secs: parsed(&lookup, "CORPDB_HTTP_TIMEOUT_SECS", 10),
            request_delay_ms: parsed(&lookup, "CORPDB_REQUEST_DELAY_MS", 1000),
            user_agent: lookup("CORPDB_USER_AGENT").unwrap_or_else(|| "corpdb-bot/0.1".to_string()),
            industry_min_score: parsed(&lookup, "CORPDB_INDUSTRY_MIN_SCORE", DEFAULT_MIN_SCORE),
        }
    }

    pub fn rules_dir(&self) -> PathBuf {
        self.workspace_root.join("rules")
    }

    pub fn require_database_url(&self) -> Result<&str> {
        match self.database_url.as_deref() {
            Some(url) => Ok(url),
            None => bail!("DATABASE_URL is not set"),
        }
    }

    pub fn http_client_config(&self) -> HttpClientConfig {
        HttpClientConfig {
            timeout: Duration::from_secs(self.http_timeout_secs),
            user_agent: Some(self.user_agent.clone()),
            request_interval: Duration::from_millis(self.request_delay_ms),
            ..Default::default()
        }
    }

    pub fn load_assembler(&self) -> Result<CandidateAssembler> {
        let rules = self.rules_dir();
        let headers_path = rules.join("headers.yaml");
        let headers = HeaderMap::load(&headers_path)
            .with_context(|| format!("loading {}", headers_path.display()))?;
        let industries_path = rules.join("industries.csv");
        let industries = IndustryMaster::load(&industries_path, self.industry_min_score)
            .with_context(|| format!("loading {}", industries_path.display()))?;
        info!(
            industries = industries.len(),
            min_score = industries.min_score(),
            "loaded header and industry rules"
        );
        Ok(CandidateAssembler::new(headers, industries))
    }

    pub fn load_merge_policy(&self) -> Result<MergePolicy> {
        MergePolicy::load(self.rules_dir().join("merge.yaml"))
    }

    pub async fn load_source_registry(&self) -> Result<SourceRegistry> {
        let path = self.workspace_root.join("sources.yaml");
        let text = fs::read_to_string(&path)
            .await
            .with_context(|| format!("reading {}", path.display()))?;
        serde_yaml::from_str(&text).with_context(|| format!("parsing {}", path.display()))
    }
}

pub async fn read_url_list(path: &Path) -> Result<Vec<String>> {
    let text = fs::read_to_string(path)
        .await
        .with_context(|| format!("reading {}", path.display()))?;
    Ok(text
        .lines()
        .map(str::trim)
        .filter(|l| !l.is_empty() && !l.starts_with('#'))
        .map(str::to_string)
        .collect())
}

/// Inputs resolved before any record is touched.
enum PlannedSource {
    Csv {
        source_id: String,
        files: Vec<PathBuf>,
    },
    Pages {
        source_id: String,
        urls: Vec<String>,
    },
}

pub struct ImportPipeline {
    config: ImportConfig,
    assembler: CandidateAssembler,
    reconciler: Arc<Reconciler>,
    http: HttpFetcher,
    extractor: Box<dyn PageExtractor>,
}

impl ImportPipeline {
    pub fn new(
        config: ImportConfig,
        assembler: CandidateAssembler,
        reconciler: Reconciler,
    ) -> Result<Self> {
        let http = HttpFetcher::new(config.http_client_config())?;
        Ok(Self {
            config,
            assembler,
            reconciler: Arc::new(reconciler),
            http,
            extractor: Box::new(LabelValueExtractor),
        })
    }

    pub fn with_extractor(mut self, extractor: Box<dyn PageExtractor>) -> Self {
        self.extractor = extractor;
        self
    }

    /// Imports every enabled source, or only `only_source` when given.
    pub async fn run_import(&self, only_source: Option<&str>) -> Result<RunSummary> {
        let started_at = Utc::now();
        let registry = self.config.load_source_registry().await?;
        let selected: Vec<SourceConfig> = match only_source {
            Some(id) => {
                let Some(source) = registry.sources.into_iter().find(|s| s.source_id == id) else {
                    bail!("source '{id}' is not in sources.yaml");
                };
                vec![source]
            }
            None => registry.sources.into_iter().filter(|s| s.enabled).collect(),
        };
        if selected.is_empty() {
            bail!("no enabled sources in sources.yaml");
        }

        let mut planned = Vec::new();
        for source in &selected {
            planned.push(self.plan_source(source).await?);
        }

        let mut candidates = Vec::new();
        let mut stats = Vec::new();
        let mut failures = Vec::new();
        for plan in planned {
            match plan {
                PlannedSource::Csv { source_id, files } => {
                    let mut s = SourceStats {
                        source_id: source_id.clone(),
                        files: files.len(),
                        ..Default::default()
                    };
                    for file in &files {
                        let (found, file_stats) = read_csv_file(&source_id, file, &self.assembler)
                            .with_context(|| format!("reading {}", file.display()))?;
                        s.rows += file_stats.rows;
                        s.candidates += file_stats.candidates;
                        s.skipped_no_identity += file_stats.skipped_no_identity;
                        candidates.extend(found);
                    }
                    stats.push(s);
                }
                PlannedSource::Pages { source_id, urls } => {
                    let (found, s, failed) = self.gather_pages(&source_id, &urls).await;
                    candidates.extend(found);
                    stats.push(s);
                    failures.extend(failed);
                }
            }
        }

        self.finish_run("import", started_at, stats, candidates, failures)
            .await
    }

    /// Fetches the listed pages and reconciles what they yield.
    pub async fn run_enrich(&self, source_id: &str, url_file: &Path) -> Result<RunSummary> {
        let started_at = Utc::now();
        let urls = read_url_list(url_file).await?;
        if urls.is_empty() {
            bail!("no URLs in {}", url_file.display());
        }
        let (candidates, stats, failures) = self.gather_pages(source_id, &urls).await;
        self.finish_run("enrich", started_at, vec![stats], candidates, failures)
            .await
    }

    async fn plan_source(&self, source: &SourceConfig) -> Result<PlannedSource> {
        let root = &self.config.workspace_root;
        match source.kind {
            SourceKind::Csv => {
                let Some(glob) = source.path_glob.as_deref() else {
                    bail!("csv source '{}' has no path_glob", source.source_id);
                };
                let pattern = root.join(glob).display().to_string();
                let files = discover_csv_files(&pattern)
                    .with_context(|| format!("source '{}'", source.source_id))?;
                Ok(PlannedSource::Csv {
                    source_id: source.source_id.clone(),
                    files,
                })
            }
            SourceKind::Pages => {
                let Some(list) = source.url_list.as_deref() else {
                    bail!("pages source '{}' has no url_list", source.source_id);
                };
                let urls = read_url_list(&root.join(list)).await?;
                Ok(PlannedSource::Pages {
                    source_id: source.source_id.clone(),
                    urls,
                })
            }
        }
    }

    async fn gather_pages(
        &self,
        source_id: &str,
        urls: &[String],
    ) -> (Vec<CandidateRecord>, SourceStats, Vec<FailureRow>) {
        let mut stats = SourceStats {
            source_id: source_id.to_string(),
            ..Default::default()
        };
        let mut candidates = Vec::new();
        let mut failures = Vec::new();
        for url in urls {
            stats.rows += 1;
            match fetch_page_candidate(
                &self.http,
                self.extractor.as_ref(),
                &self.assembler,
                source_id,
                url,
            )
            .await
            {
                Ok(Some(candidate)) => {
                    stats.candidates += 1;
                    candidates.push(candidate);
                }
                Ok(None) => stats.skipped_no_identity += 1,
                Err(err) => {
                    warn!(source_id, url = %url, error = %err, "page fetch failed; skipping");
                    stats.fetch_failures += 1;
                    failures.push(FailureRow {
                        source_id: source_id.to_string(),
                        locator: url.clone(),
                        name: None,
                        error: err.to_string(),
                    });
                }
            }
        }
        (candidates, stats, failures)
    }

    async fn reconcile_all(
        &self,
        candidates: Vec<CandidateRecord>,
    ) -> Vec<(CandidateRecord, Result<Reconciled, ReconcileError>)> {
        let reconciler = &self.reconciler;
        let mut results: Vec<_> = stream::iter(candidates.into_iter().enumerate())
            .map(|(index, candidate)| async move {
                let result = reconciler.reconcile(&candidate).await;
                (index, candidate, result)
            })
            .buffer_unordered(self.config.concurrency.max(1))
            .collect()
            .await;
        results.sort_by_key(|(index, _, _)| *index);
        results
            .into_iter()
            .map(|(_, candidate, result)| (candidate, result))
            .collect()
    }

    async fn finish_run(
        &self,
        command: &str,
        started_at: chrono::DateTime<Utc>,
        sources: Vec<SourceStats>,
        candidates: Vec<CandidateRecord>,
        mut failures: Vec<FailureRow>,
    ) -> Result<RunSummary> {
        let run_id = Uuid::new_v4();
        let dry_run = self.reconciler.options().dry_run;
        let total = candidates.len();
        info!(%run_id, command, candidates = total, dry_run, "reconciling candidates");
        let results = self.reconcile_all(candidates).await;

        let mut counts = OutcomeCounts::default();
        let mut fills_by_field: BTreeMap<String, usize> = BTreeMap::new();
        let mut ambiguous = Vec::new();
        let mut no_match = Vec::new();
        let mut fill_rows = Vec::new();

        for (candidate, result) in results {
            let source = &candidate.source;
            let record = &candidate.record;
            let reconciled = match result {
                Ok(reconciled) => reconciled,
                Err(err) => {
                    warn!(
                        source_id = %source.source_id,
                        locator = %source.locator,
                        error = %err,
                        "candidate failed; continuing"
                    );
                    counts.failed += 1;
                    failures.push(FailureRow {
                        source_id: source.source_id.clone(),
                        locator: source.locator.clone(),
                        name: record.name.clone(),
                        error: err.to_string(),
                    });
                    continue;
                }
            };

            let target_id = match &reconciled.outcome {
                ReconcileOutcome::Created { id } => {
                    counts.created += 1;
                    Some(id.clone())
                }
                ReconcileOutcome::Updated { id, .. } => {
                    counts.updated += 1;
                    Some(id.clone())
                }
                ReconcileOutcome::Unchanged { id } => {
                    counts.unchanged += 1;
                    Some(id.clone())
                }
                ReconcileOutcome::WouldCreate { id } => {
                    counts.would_create += 1;
                    id.clone()
                }
                ReconcileOutcome::WouldUpdate { id, .. } => {
                    counts.would_update += 1;
                    Some(id.clone())
                }
                ReconcileOutcome::HeldForReview { .. } => {
                    counts.held_for_review += 1;
                    None
                }
            };

            if let Some(found) = reconciled.matched.as_ref().filter(|m| m.is_ambiguous()) {
                counts.ambiguous += 1;
                let action = match reconciled.outcome {
                    ReconcileOutcome::HeldForReview { .. } => "held",
                    _ => "merged_first",
                };
                ambiguous.push(AmbiguousMatchRow {
                    source_id: source.source_id.clone(),
                    locator: source.locator.clone(),
                    name: record.name.clone(),
                    corporate_number: record.corporate_number.clone(),
                    strategy: found.strategy.label().to_string(),
                    match_count: found.match_count,
                    chosen_id: found.company.id.clone(),
                    action: action.to_string(),
                });
            }

            if reconciled.outcome.is_creation() {
                no_match.push(NoMatchRow {
                    source_id: source.source_id.clone(),
                    locator: source.locator.clone(),
                    name: record.name.clone(),
                    corporate_number: record.corporate_number.clone(),
                    prefecture: record.prefecture.clone(),
                    id: target_id.clone(),
                });
            }

            counts.fields_filled += reconciled.fills.len();
            for fill in &reconciled.fills {
                *fills_by_field.entry(fill.field.key().to_string()).or_default() += 1;
                fill_rows.push(FieldFillRow {
                    id: target_id.clone().unwrap_or_default(),
                    field: fill.field.key().to_string(),
                    source_id: fill.source.source_id.clone(),
                    locator: fill.source.locator.clone(),
                });
            }
        }

        let writer = RunReportWriter::create(&self.config.workspace_root, run_id).await?;
        let summary = RunSummary {
            run_id,
            command: command.to_string(),
            started_at,
            finished_at: Utc::now(),
            dry_run,
            sources,
            candidates: total,
            counts,
            fills_by_field,
            cleanup: None,
            reports_dir: writer.dir().display().to_string(),
        };
        writer.write_json("run_summary.json", &summary).await?;
        writer
            .write_text("daily_brief.md", &report::daily_brief(&summary))
            .await?;
        writer.write_csv("ambiguous_matches.csv", &ambiguous).await?;
        writer.write_csv("no_match.csv", &no_match).await?;
        writer.write_csv("field_fills.csv", &fill_rows).await?;
        writer.write_csv("failures.csv", &failures).await?;

        info!(
            %run_id,
            created = counts.created + counts.would_create,
            updated = counts.updated + counts.would_update,
            unchanged = counts.unchanged,
            held = counts.held_for_review,
            ambiguous = counts.ambiguous,
            failed = counts.failed,
            reports = %writer.dir().display(),
            "run complete"
        );
        Ok(summary)
    }
}

/// Store-wide maintenance runs.
pub struct CleanupRunner {
    config: ImportConfig,
    store: Arc<dyn CompanyStore>,
}

impl CleanupRunner {
    pub fn new(config: ImportConfig, store: Arc<dyn CompanyStore>) -> Self {
        Self { config, store }
    }

    async fn summarize(
        &self,
        command: &str,
        started_at: chrono::DateTime<Utc>,
        dry_run: bool,
        cleanup: CleanupCounts,
        writer: &RunReportWriter,
        run_id: Uuid,
    ) -> Result<RunSummary> {
        let summary = RunSummary {
            run_id,
            command: command.to_string(),
            started_at,
            finished_at: Utc::now(),
            dry_run,
            sources: Vec::new(),
            candidates: 0,
            counts: OutcomeCounts::default(),
            fills_by_field: BTreeMap::new(),
            cleanup: Some(cleanup),
            reports_dir: writer.dir().display().to_string(),
        };
        writer.write_json("run_summary.json", &summary).await?;
        writer
            .write_text("daily_brief.md", &report::daily_brief(&summary))
            .await?;
        info!(
            %run_id,
            command,
            scanned = cleanup.scanned,
            affected = cleanup.affected,
            committed_ops = cleanup.committed_ops,
            "cleanup complete"
        );
        Ok(summary)
    }

    pub async fn dedupe(&self, dry_run: bool) -> Result<RunSummary> {
        let started_at = Utc::now();
        let run_id = Uuid::new_v4();
        let records = dedup::load_all(self.store.as_ref(), dedup::SCAN_PAGE_SIZE)
            .await
            .context("scanning companies")?;
        let groups = dedup::plan_corporate_number_dedupe(&records);
        let mut cleanup = CleanupCounts {
            scanned: records.len(),
            affected: groups.iter().map(|g| g.duplicate_ids.len()).sum(),
            ..Default::default()
        };

        let writer = RunReportWriter::create(&self.config.workspace_root, run_id).await?;
        let rows: Vec<dedup::DuplicateGroupRow> = groups.iter().map(Into::into).collect();
        writer.write_csv("duplicate_groups.csv", &rows).await?;

        if !dry_run {
            let report = dedup::apply_dedupe(self.store.as_ref(), &groups, self.config.max_batch_size)
                .await
                .context("applying corporate-number dedupe")?;
            cleanup.batches = report.batches;
            cleanup.committed_ops = report.committed_ops;
        }
        self.summarize("dedupe", started_at, dry_run, cleanup, &writer, run_id)
            .await
    }

    pub async fn clean_corporate_numbers(&self, dry_run: bool) -> Result<RunSummary> {
        let started_at = Utc::now();
        let run_id = Uuid::new_v4();
        let records = dedup::load_all(self.store.as_ref(), dedup::SCAN_PAGE_SIZE)
            .await
            .context("scanning companies")?;
        let invalid = dedup::plan_invalid_corporate_numbers(&records);
        let mut cleanup = CleanupCounts {
            scanned: records.len(),
            affected: invalid.len(),
            ..Default::default()
        };

        let writer = RunReportWriter::create(&self.config.workspace_root, run_id).await?;
        writer
            .write_csv("invalid_corporate_numbers.csv", &invalid)
            .await?;

        if !dry_run {
            let report =
                dedup::apply_invalid_cleanup(self.store.as_ref(), &invalid, self.config.max_batch_size)
                    .await
                    .context("clearing invalid corporate numbers")?;
            cleanup.batches = report.batches;
            cleanup.committed_ops = report.committed_ops;
        }
        self.summarize(
            "clean-corporate-numbers",
            started_at,
            dry_run,
            cleanup,
            &writer,
            run_id,
        )
        .await
    }

    /// Fills blank corporate numbers from the national master file, matched
    /// on comparable name and settled by prefecture and address.
    pub async fn backfill_corporate_numbers(
        &self,
        master_file: &Path,
        min_address_similarity: f64,
        dry_run: bool,
    ) -> Result<RunSummary> {
        let started_at = Utc::now();
        let run_id = Uuid::new_v4();
        let records = dedup::load_all(self.store.as_ref(), dedup::SCAN_PAGE_SIZE)
            .await
            .context("scanning companies")?;
        let wanted: HashSet<String> = backfill::backfill_targets(&records).into_keys().collect();

        let path = master_file.to_path_buf();
        let (master, stats) = tokio::task::spawn_blocking(move || {
            let mut master = backfill::MasterIndex::default();
            let stats = corpdb_adapters::scan_master_file(&path, |entry| {
                master.insert_if_wanted(&wanted, entry)
            })?;
            Ok::<_, corpdb_adapters::AdapterError>((master, stats))
        })
        .await
        .context("master file scan task")?
        .with_context(|| format!("reading master file {}", master_file.display()))?;
        info!(
            rows = stats.rows,
            skipped = stats.skipped,
            name_hits = master.len(),
            "scanned corporate-number master"
        );

        let plan = backfill::plan_corporate_number_backfill(&records, &master, min_address_similarity);
        let mut cleanup = CleanupCounts {
            scanned: records.len(),
            affected: plan.iter().filter(|p| p.is_assigned()).count(),
            ..Default::default()
        };

        let writer = RunReportWriter::create(&self.config.workspace_root, run_id).await?;
        writer
            .write_csv("corporate_number_backfill.csv", &plan)
            .await?;

        if !dry_run {
            let report = backfill::apply_corporate_number_backfill(
                self.store.as_ref(),
                &plan,
                self.config.max_batch_size,
            )
            .await
            .context("writing backfilled corporate numbers")?;
            cleanup.batches = report.batches;
            cleanup.committed_ops = report.committed_ops;
        }
        self.summarize(
            "backfill-corporate-numbers",
            started_at,
            dry_run,
            cleanup,
            &writer,
            run_id,
        )
        .await
    }

    /// Recomputes `hasAnyWebPresence` from the web fields.
    pub async fn backfill_web_presence(&self, dry_run: bool) -> Result<RunSummary> {
        let started_at = Utc::now();
        let run_id = Uuid::new_v4();
        let records = dedup::load_all(self.store.as_ref(), dedup::SCAN_PAGE_SIZE)
            .await
            .context("scanning companies")?;
        let changes = backfill::plan_web_presence_backfill(&records);
        let mut cleanup = CleanupCounts {
            scanned: records.len(),
            affected: changes.len(),
            ..Default::default()
        };

        let writer = RunReportWriter::create(&self.config.workspace_root, run_id).await?;
        writer
            .write_csv("web_presence_backfill.csv", &changes)
            .await?;

        if !dry_run {
            let report = backfill::apply_web_presence_backfill(
                self.store.as_ref(),
                &changes,
                self.config.max_batch_size,
            )
            .await
            .context("writing hasAnyWebPresence")?;
            cleanup.batches = report.batches;
            cleanup.committed_ops = report.committed_ops;
        }
        self.summarize(
            "backfill-web-presence",
            started_at,
            dry_run,
            cleanup,
            &writer,
            run_id,
        )
        .await
    }

    /// Report-only: nothing is merged.
    pub async fn review_names(&self, config: NameReviewConfig) -> Result<RunSummary> {
        let started_at = Utc::now();
        let run_id = Uuid::new_v4();
        let records = dedup::load_all(self.store.as_ref(), dedup::SCAN_PAGE_SIZE)
            .await
            .context("scanning companies")?;
        let items = NameReviewEngine::new(config).review(&records);
        let writer = RunReportWriter::create(&self.config.workspace_root, run_id).await?;
        writer.write_csv("name_review.csv", &items).await?;
        let cleanup = CleanupCounts {
            scanned: records.len(),
            affected: items.len(),
            ..Default::default()
        };
        self.summarize("review-names", started_at, true, cleanup, &writer, run_id)
            .await
    }
}

/// Markdown digest of the most recent runs under `reports/`.
pub fn report_daily_markdown(runs: usize, workspace_root: Option<PathBuf>) -> Result<String> {
    let root = workspace_root.unwrap_or_else(|| PathBuf::from("."));
    let reports_root = root.join("reports");
    let mut summaries = Vec::new();
    for entry in std::fs::read_dir(&reports_root)
        .with_context(|| format!("reading {}", reports_root.display()))?
    {
        let entry = entry.with_context(|| format!("reading {}", reports_root.display()))?;
        let path = entry.path().join("run_summary.json");
        if !path.is_file() {
            continue;
        }
        let text = std::fs::read_to_string(&path)
            .with_context(|| format!("reading {}", path.display()))?;
        let summary: RunSummary =
            serde_json::from_str(&text).with_context(|| format!("parsing {}", path.display()))?;
        summaries.push(summary);
    }
    summaries.sort_by(|a, b| b.started_at.cmp(&a.started_at));

    let mut lines = vec!["# corpdb Report Daily".to_string(), String::new()];
    for summary in summaries.iter().take(runs.max(1)) {
        let c = &summary.counts;
        lines.push(format!("## Run `{}` ({})", summary.run_id, summary.command));
        lines.push(format!("- started: {}", summary.started_at));
        lines.push(format!("- dry run: {}", summary.dry_run));
        if summary.cleanup.is_none() {
            lines.push(format!("- candidates: {}", summary.candidates));
            lines.push(format!(
                "- created: {}, updated: {}, unchanged: {}",
                c.created + c.would_create,
                c.updated + c.would_update,
                c.unchanged
            ));
            lines.push(format!(
                "- ambiguous: {}, held: {}, failed: {}",
                c.ambiguous, c.held_for_review, c.failed
            ));
        }
        if let Some(cleanup) = &summary.cleanup {
            lines.push(format!(
                "- scanned: {}, affected: {}, committed ops: {}",
                cleanup.scanned, cleanup.affected, cleanup.committed_ops
            ));
        }
        lines.push(format!("- reports: `{}`", summary.reports_dir));
        lines.push(String::new());
    }
    Ok(lines.join("\n"))
}
