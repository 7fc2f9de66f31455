use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use incremental_collector::config::PipelineConfig;
use incremental_collector::jobs::build_registry;
use incremental_collector::pipeline::{Registry, RunReport};
use incremental_collector::store::{MemoryStore, PgStore, Store};
use incremental_collector::tracing::{init_tracing, DEFAULT_FILTER};
use incremental_collector::util::db::Db;
use incremental_collector::util::env;
use tracing::{info, warn};

/// Keys shown (redacted) by `check-env` and at startup.
const SNAPSHOT_KEYS: &[&str] = &[
    "DATABASE_URL",
    "DB_URL",
    "DB_HOST",
    "DB_MAX_CONNECTIONS",
    "RETRY_MAX_ATTEMPTS",
    "RETRY_BASE_MS",
    "RETRY_FACTOR",
    "NOTIFY_WEBHOOK_URL",
    "NOTICE_POLICY",
    "PIPELINE_MODE",
    "PIPELINE_QUEUE_CAPACITY",
    "RANKING_URL",
    "EVENT_LOG_URL",
    "LIST_SIZE_URL",
    "AUTO_MIGRATE",
];

#[derive(Parser, Debug)]
#[command(name = "collector", version, about = "Incremental collection pipeline runner")]
struct Cli {
    /// Optional override for the database URL
    #[arg(long, global = true)]
    db_url: Option<String>,
    /// Keep everything in memory; nothing is written to the database
    #[arg(long, global = true, default_value_t = false)]
    dry_run: bool,
    /// Print run reports as JSON lines instead of summaries
    #[arg(long, global = true, default_value_t = false)]
    json: bool,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
#[command(rename_all = "kebab-case")]
enum Commands {
    /// List configured jobs with their cron and collection
    List,
    /// Run the named jobs once, in the given order
    Run {
        #[arg(required = true)]
        jobs: Vec<String>,
    },
    /// Run every configured job concurrently
    RunAll,
    /// Validate configuration and log a redacted snapshot
    CheckEnv,
}

#[tokio::main]
async fn main() -> Result<()> {
    env::init_env();
    init_tracing(DEFAULT_FILTER)?;
    let cli = Cli::parse();
    let cfg = PipelineConfig::from_env().context("loading pipeline configuration")?;

    match &cli.command {
        Commands::List => {
            // Listing never needs the database.
            let registry = registry_for(Arc::new(MemoryStore::new()), &cfg)?;
            if registry.is_empty() {
                println!("no jobs configured (set <PREFIX>_URL, e.g. RANKING_URL)");
            }
            for job in registry.jobs() {
                println!("{:<24} {:<22} {}", job.name(), job.cron(), job.collection());
            }
        }
        Commands::CheckEnv => {
            env::preflight_check("collector", &[], SNAPSHOT_KEYS)?;
            if !cli.dry_run && cli.db_url.is_none() {
                env::db_url().context("resolving database URL")?;
            }
            let registry = registry_for(Arc::new(MemoryStore::new()), &cfg)?;
            info!(target = "preflight", jobs = registry.jobs().len(), "configuration ok");
        }
        Commands::Run { jobs } => {
            let registry = registry_for(open_store(&cli, &cfg).await?, &cfg)?;
            let reports = registry.run(jobs).await?;
            finish(&cli, &reports)?;
        }
        Commands::RunAll => {
            let registry = registry_for(open_store(&cli, &cfg).await?, &cfg)?;
            if registry.is_empty() {
                warn!("no jobs configured; nothing to run");
            }
            let reports = registry.run_all().await;
            finish(&cli, &reports)?;
        }
    }
    Ok(())
}

fn registry_for(store: Arc<dyn Store>, cfg: &PipelineConfig) -> Result<Registry> {
    build_registry(&cfg.context(store))
}

async fn open_store(cli: &Cli, cfg: &PipelineConfig) -> Result<Arc<dyn Store>> {
    if cli.dry_run {
        warn!(target = "bootstrap", "dry run: records are kept in memory only");
        return Ok(Arc::new(MemoryStore::new()));
    }
    env::preflight_check("collector", &[], SNAPSHOT_KEYS)?;
    let url = match &cli.db_url {
        Some(url) => url.clone(),
        None => env::db_url()?,
    };
    let db = Db::connect(&url, cfg.db_max_connections)
        .await
        .context("connecting to database")?;
    Ok(Arc::new(PgStore::new(db)))
}

fn finish(cli: &Cli, reports: &[RunReport]) -> Result<()> {
    for report in reports {
        if cli.json {
            println!("{}", serde_json::to_string(report)?);
        } else {
            println!("{}", report.summary());
        }
    }
    let failed = reports.iter().filter(|r| r.is_failed()).count();
    if failed > 0 {
        bail!("{failed} of {} run(s) failed", reports.len());
    }
    Ok(())
}
