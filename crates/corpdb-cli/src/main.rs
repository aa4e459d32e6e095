use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{bail, Result};
use clap::{Parser, Subcommand};
use corpdb_storage::{CompanyStore, MemoryStore, PgCompanyStore};
use corpdb_sync::{
    AmbiguityPolicy, CleanupRunner, EntityMatcher, ImportConfig, ImportPipeline, NameReviewConfig,
    ReconcileOptions, Reconciler, RunSummary, MIN_ADDRESS_SIMILARITY,
};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "corpdb")]
#[command(about = "Reconcile company records from CSV exports and profile pages")]
struct Cli {
    /// Emit logs as JSON lines.
    #[arg(long, global = true)]
    json_logs: bool,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Import every enabled source in sources.yaml.
    Import {
        #[arg(long)]
        source: Option<String>,
        #[arg(long)]
        dry_run: bool,
        #[arg(long)]
        concurrency: Option<usize>,
        /// Report ambiguous matches instead of merging into the first one.
        #[arg(long)]
        hold_ambiguous: bool,
    },
    /// Fetch profile pages listed in a file and fill blanks from them.
    Enrich {
        #[arg(long)]
        urls: PathBuf,
        #[arg(long, default_value = "profile_pages")]
        source_id: String,
        #[arg(long)]
        dry_run: bool,
    },
    /// Collapse records sharing one valid corporate number.
    Dedupe {
        #[arg(long)]
        dry_run: bool,
    },
    /// Clear stored corporate numbers that fail validation.
    CleanCorporateNumbers {
        #[arg(long)]
        dry_run: bool,
    },
    /// Fill blank corporate numbers from the national master CSV.
    BackfillCorporateNumbers {
        #[arg(long)]
        master: PathBuf,
        #[arg(long, default_value_t = MIN_ADDRESS_SIMILARITY)]
        min_address_similarity: f64,
        #[arg(long)]
        dry_run: bool,
    },
    /// Recompute hasAnyWebPresence from the web fields.
    BackfillWebPresence {
        #[arg(long)]
        dry_run: bool,
    },
    /// List same-prefecture name pairs that look like one company.
    ReviewNames {
        #[arg(long, default_value_t = 0.92)]
        threshold: f64,
    },
    Migrate,
    Report {
        #[arg(long, default_value_t = 5)]
        runs: usize,
    },
}

fn init_tracing(json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}

async fn open_store(config: &ImportConfig, dry_run: bool) -> Result<Arc<dyn CompanyStore>> {
    match config.database_url.as_deref() {
        Some(url) => {
            let max_connections = u32::try_from(config.concurrency).unwrap_or(u32::MAX).saturating_add(1);
            let store = PgCompanyStore::connect(url, max_connections).await?;
            Ok(Arc::new(store))
        }
        None if dry_run => {
            warn!("DATABASE_URL is not set; dry run against an empty in-memory store");
            Ok(Arc::new(MemoryStore::new()))
        }
        None => bail!("DATABASE_URL is not set"),
    }
}

async fn pipeline(
    config: ImportConfig,
    dry_run: bool,
    ambiguity: AmbiguityPolicy,
) -> Result<ImportPipeline> {
    let store = open_store(&config, dry_run).await?;
    let assembler = config.load_assembler()?;
    let policy = config.load_merge_policy()?;
    let options = ReconcileOptions {
        dry_run,
        ambiguity,
        ..Default::default()
    };
    let reconciler = Reconciler::new(store, EntityMatcher::default(), policy, options);
    ImportPipeline::new(config, assembler, reconciler)
}

fn print_summary(summary: &RunSummary) {
    let c = &summary.counts;
    match &summary.cleanup {
        Some(cleanup) => println!(
            "{} complete: run_id={} scanned={} affected={} committed_ops={} dry_run={} reports={}",
            summary.command,
            summary.run_id,
            cleanup.scanned,
            cleanup.affected,
            cleanup.committed_ops,
            summary.dry_run,
            summary.reports_dir
        ),
        None => println!(
            "{} complete: run_id={} candidates={} created={} updated={} unchanged={} ambiguous={} held={} failed={} dry_run={} reports={}",
            summary.command,
            summary.run_id,
            summary.candidates,
            c.created + c.would_create,
            c.updated + c.would_update,
            c.unchanged,
            c.ambiguous,
            c.held_for_review,
            c.failed,
            summary.dry_run,
            summary.reports_dir
        ),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.json_logs);
    let mut config = ImportConfig::from_env();

    match cli.command {
        Commands::Import {
            source,
            dry_run,
            concurrency,
            hold_ambiguous,
        } => {
            if let Some(n) = concurrency {
                config.concurrency = n.max(1);
            }
            let ambiguity = if hold_ambiguous {
                AmbiguityPolicy::HoldForReview
            } else {
                AmbiguityPolicy::FirstMatch
            };
            let summary = pipeline(config, dry_run, ambiguity)
                .await?
                .run_import(source.as_deref())
                .await?;
            print_summary(&summary);
        }
        Commands::Enrich {
            urls,
            source_id,
            dry_run,
        } => {
            let summary = pipeline(config, dry_run, AmbiguityPolicy::default())
                .await?
                .run_enrich(&source_id, &urls)
                .await?;
            print_summary(&summary);
        }
        Commands::Dedupe { dry_run } => {
            let store = open_store(&config, dry_run).await?;
            let summary = CleanupRunner::new(config, store).dedupe(dry_run).await?;
            print_summary(&summary);
        }
        Commands::CleanCorporateNumbers { dry_run } => {
            let store = open_store(&config, dry_run).await?;
            let summary = CleanupRunner::new(config, store)
                .clean_corporate_numbers(dry_run)
                .await?;
            print_summary(&summary);
        }
        Commands::BackfillCorporateNumbers {
            master,
            min_address_similarity,
            dry_run,
        } => {
            let store = open_store(&config, dry_run).await?;
            let summary = CleanupRunner::new(config, store)
                .backfill_corporate_numbers(&master, min_address_similarity, dry_run)
                .await?;
            print_summary(&summary);
        }
        Commands::BackfillWebPresence { dry_run } => {
            let store = open_store(&config, dry_run).await?;
            let summary = CleanupRunner::new(config, store)
                .backfill_web_presence(dry_run)
                .await?;
            print_summary(&summary);
        }
        Commands::ReviewNames { threshold } => {
            let store = open_store(&config, false).await?;
            let summary = CleanupRunner::new(config, store)
                .review_names(NameReviewConfig {
                    review_threshold: threshold,
                })
                .await?;
            print_summary(&summary);
        }
        Commands::Migrate => {
            let url = config.require_database_url()?;
            let store = PgCompanyStore::connect(url, 1).await?;
            store.run_migrations().await?;
            info!("database migrations applied");
        }
        Commands::Report { runs } => {
            let markdown =
                corpdb_sync::report_daily_markdown(runs, Some(config.workspace_root.clone()))?;
            println!("{markdown}");
        }
    }

    Ok(())
}
