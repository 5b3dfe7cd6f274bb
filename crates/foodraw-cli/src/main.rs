use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use foodraw_ingest::{
    build_source, build_store, read_checkpoint, run_ingest, Checkpoint, IngestConfig,
    IngestPipeline, IngestRunSummary, RunOutcome, RunParams, StoreKind, DEFAULT_DATABASE_URL,
};
use foodraw_storage::{MemoryRawStore, PgRawStore};
use tokio::io::AsyncReadExt;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

const EXIT_FAILED: u8 = 1;
const EXIT_USAGE: u8 = 2;

#[derive(Debug, Parser)]
#[command(name = "foodraw")]
#[command(about = "Open Food Facts RAW ingestion")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Fetch products and store each distinct payload once (default).
    Ingest(IngestArgs),
    /// Apply the raw_products migration.
    Migrate,
    /// Print the raw_hash of a JSON document.
    Fingerprint(FingerprintArgs),
}

#[derive(Debug, Args)]
struct IngestArgs {
    /// Products to process; with --resume, defaults to the rest of the failed
    /// run's window, otherwise to 300.
    #[arg(long)]
    limit: Option<u64>,
    #[arg(long, default_value_t = 100)]
    page_size: u32,
    #[arg(long, conflicts_with = "resume")]
    start_offset: Option<u64>,
    /// Continue from the last checkpoint when the previous run failed.
    #[arg(long)]
    resume: bool,
    #[arg(long)]
    category_en: Option<String>,
    #[arg(long, default_value_t = 50)]
    max_pages: u32,
    #[arg(long, default_value_t = 150)]
    sleep_ms: u64,
    #[arg(long, default_value_t = 1)]
    concurrency: usize,
    /// Overrides FOODRAW_STORE.
    #[arg(long)]
    store: Option<StoreKind>,
    /// Use an in-memory store and skip reports.
    #[arg(long)]
    dry_run: bool,
}

impl Default for IngestArgs {
    fn default() -> Self {
        let params = RunParams::default();
        Self {
            limit: None,
            page_size: params.page_size,
            start_offset: None,
            resume: false,
            category_en: None,
            max_pages: params.max_pages,
            sleep_ms: params.min_interval.as_millis() as u64,
            concurrency: params.concurrency,
            store: None,
            dry_run: false,
        }
    }
}

impl IngestArgs {
    /// Start offset and limit from the flags and, with `--resume`, the last
    /// checkpoint.
    fn window(&self, checkpoint: Option<&Checkpoint>) -> (u64, u64) {
        let default_limit = RunParams::default().limit;
        match (self.start_offset, checkpoint) {
            (Some(offset), _) => (offset, self.limit.unwrap_or(default_limit)),
            (None, Some(checkpoint)) if self.resume => {
                let limit = self
                    .limit
                    .or_else(|| checkpoint.remaining_limit_for(self.page_size))
                    .unwrap_or(default_limit);
                (checkpoint.resume_offset_for(self.page_size), limit)
            }
            (None, _) => (0, self.limit.unwrap_or(default_limit)),
        }
    }

    fn run_params(&self, start_offset: u64, limit: u64) -> RunParams {
        RunParams {
            limit,
            page_size: self.page_size,
            start_offset,
            max_pages: self.max_pages,
            concurrency: self.concurrency,
            min_interval: Duration::from_millis(self.sleep_ms),
            category_en: self.category_en.clone(),
        }
    }
}

#[derive(Debug, Args)]
struct FingerprintArgs {
    /// JSON file to read; `-` or nothing reads stdin.
    path: Option<PathBuf>,
    /// Also print the canonical bytes.
    #[arg(long)]
    canonical: bool,
}

#[tokio::main]
async fn main() -> ExitCode {
    dotenv::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let result = match cli.command.unwrap_or(Commands::Ingest(IngestArgs::default())) {
        Commands::Ingest(args) => ingest(args).await,
        Commands::Migrate => migrate().await,
        Commands::Fingerprint(args) => fingerprint(args).await,
    };
    match result {
        Ok(code) => code,
        Err(err) => {
            eprintln!("error: {err:#}");
            ExitCode::from(EXIT_FAILED)
        }
    }
}

async fn ingest(args: IngestArgs) -> Result<ExitCode> {
    let config = match IngestConfig::from_env() {
        Ok(config) => config,
        Err(err) => {
            eprintln!("configuration error: {err}");
            return Ok(ExitCode::from(EXIT_USAGE));
        }
    };

    let checkpoint = match resume_checkpoint(&args, &config.reports_dir).await {
        Ok(checkpoint) => checkpoint,
        Err(err) => {
            eprintln!("configuration error: {err:#}");
            return Ok(ExitCode::from(EXIT_USAGE));
        }
    };
    let (start_offset, limit) = args.window(checkpoint.as_ref());
    if let Some(checkpoint) = &checkpoint {
        info!(
            previous_run = %checkpoint.run_id,
            status = ?checkpoint.status,
            start_offset,
            limit,
            "resuming from checkpoint"
        );
    }
    let params = args.run_params(start_offset, limit);
    if let Err(err) = params.validate() {
        eprintln!("configuration error: {err}");
        return Ok(ExitCode::from(EXIT_USAGE));
    }

    let cancel = CancellationToken::new();
    let on_signal = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("interrupt received; stopping after the current record");
            on_signal.cancel();
        }
    });

    let summary = if args.dry_run {
        let source = build_source(&config, &params)?;
        IngestPipeline::new(MemoryRawStore::new(), source, config.backoff)
            .with_source_id(config.source_id.clone())
            .run(&params, &cancel)
            .await?
    } else {
        let store = build_store(&config, args.store.unwrap_or(config.store)).await?;
        run_ingest(&config, store, &params, &cancel).await?
    };

    print_summary(&summary);
    Ok(if summary.is_done() {
        ExitCode::SUCCESS
    } else {
        ExitCode::from(EXIT_FAILED)
    })
}

/// Checkpoint consulted by `--resume`. A missing one starts from offset 0.
async fn resume_checkpoint(args: &IngestArgs, reports_dir: &Path) -> Result<Option<Checkpoint>> {
    if !args.resume || args.start_offset.is_some() {
        return Ok(None);
    }
    let checkpoint = read_checkpoint(reports_dir).await?;
    if checkpoint.is_none() {
        warn!("no checkpoint found; starting from offset 0");
    }
    Ok(checkpoint)
}

fn print_summary(summary: &IngestRunSummary) {
    let counts = &summary.counts;
    match &summary.outcome {
        RunOutcome::Done { reason, next_offset } => println!(
            "ingest done: run_id={} store={} pages={} inserted={} already_exists={} rejected={} reason={:?} next_offset={}",
            summary.run_id,
            summary.store,
            counts.fetched_pages,
            counts.inserted,
            counts.already_exists,
            counts.rejected,
            reason,
            next_offset
        ),
        RunOutcome::Failed {
            cause,
            message,
            resume_offset,
            ..
        } => {
            println!(
                "ingest failed: run_id={} store={} pages={} inserted={} already_exists={} rejected={} cause={:?} resume_offset={}",
                summary.run_id,
                summary.store,
                counts.fetched_pages,
                counts.inserted,
                counts.already_exists,
                counts.rejected,
                cause,
                resume_offset
            );
            println!("  {message}");
            println!("  rerun with --resume or --start-offset {resume_offset}");
        }
    }
}

async fn migrate() -> Result<ExitCode> {
    let database_url = std::env::var("DATABASE_URL")
        .ok()
        .filter(|v| !v.trim().is_empty())
        .unwrap_or_else(|| DEFAULT_DATABASE_URL.to_string());
    let store = PgRawStore::connect(&database_url, 1)
        .await
        .context("connecting to postgres")?;
    store.migrate().await.context("running raw_products migrations")?;
    println!("migrations applied");
    Ok(ExitCode::SUCCESS)
}

async fn fingerprint(args: FingerprintArgs) -> Result<ExitCode> {
    let text = match &args.path {
        Some(path) if path.as_os_str() != "-" => tokio::fs::read_to_string(path)
            .await
            .with_context(|| format!("reading {}", path.display()))?,
        _ => {
            let mut text = String::new();
            tokio::io::stdin()
                .read_to_string(&mut text)
                .await
                .context("reading stdin")?;
            text
        }
    };

    match foodraw_core::fingerprint_json(&text) {
        Ok((canonical, raw_hash)) => {
            println!("{raw_hash}");
            if args.canonical {
                println!("{}", String::from_utf8_lossy(&canonical));
            }
            Ok(ExitCode::SUCCESS)
        }
        Err(err) => {
            eprintln!("cannot fingerprint: {err}");
            Ok(ExitCode::from(EXIT_USAGE))
        }
    }
}
