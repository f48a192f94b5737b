//! `contrap-etl` binary.
//!
//! Reads `contrap.toml` (or the file given with `--config`) plus `CONTRAP_*`
//! environment variables, opens the SQLite store, and runs one command.
//!
//! ```text
//! contrap-etl year 2024
//! contrap-etl --config /etc/contrap.toml incremental
//! contrap-etl status --json
//! ```
//!
//! Exit codes: 0 completed, 2 partial (uncommitted pages listed), 1 fatal.

use std::{
  path::{Path, PathBuf},
  process::ExitCode,
  sync::Arc,
};

use anyhow::Context as _;
use clap::{Parser, Subcommand};
use contrap_client::{Client, HttpTransport};
use contrap_core::{entity::TaxId, ledger::Source, store::ProcurementStore};
use contrap_etl::{EtlConfig, Mode, Pipeline, RawCache};
use contrap_store_sqlite::SqliteStore;
use serde_json::json;
use tokio_util::sync::CancellationToken;
use tracing::level_filters::LevelFilter;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(author, version, about = "Procurement data ETL")]
struct Cli {
  /// Path to the TOML configuration file.
  #[arg(short, long, env = "CONTRAP_CONFIG", value_name = "FILE")]
  config: Option<PathBuf>,

  /// Log at debug level unless `RUST_LOG` says otherwise.
  #[arg(short, long)]
  verbose: bool,

  /// Neither read nor write the raw response cache. Run reports are not
  /// written either.
  #[arg(long)]
  no_cache: bool,

  /// Print the summary as JSON.
  #[arg(long)]
  json: bool,

  #[command(subcommand)]
  command: Command,
}

#[derive(Subcommand)]
enum Command {
  /// From the last completed day to yesterday.
  Incremental,
  /// One calendar year.
  Year { year: i32 },
  /// Whole years, both ends included.
  Historical { start: i32, end: i32 },
  /// Fetch and enrich one organization by tax id.
  Entity { nif: TaxId },
  /// Row counts, watermarks and pages that never committed.
  Status,
  /// Scan for references that do not resolve.
  Verify,
}

#[tokio::main]
async fn main() -> anyhow::Result<ExitCode> {
  let cli = Cli::parse();

  let level = if cli.verbose { LevelFilter::DEBUG } else { LevelFilter::INFO };
  tracing_subscriber::fmt()
    .with_env_filter(
      EnvFilter::builder()
        .with_default_directive(level.into())
        .from_env_lossy(),
    )
    .with_writer(std::io::stderr)
    .init();

  let cfg = EtlConfig::load(cli.config.as_deref()).context("failed to load configuration")?;

  let store_path = expand_tilde(&cfg.store_path);
  let store = SqliteStore::open(&store_path)
    .await
    .with_context(|| format!("failed to open store at {store_path:?}"))?;

  let mode = match cli.command {
    Command::Status => return status(&store, cli.json).await,
    Command::Verify => return verify(&store, cli.json).await,
    Command::Incremental => Mode::Incremental,
    Command::Year { year } => Mode::Year(year),
    Command::Historical { start, end } => Mode::Historical { start, end },
    Command::Entity { nif } => Mode::Entity(nif),
  };

  let transport = HttpTransport::new().context("failed to build HTTP transport")?;
  let client = Client::new(cfg.client_config(), transport).context("invalid API configuration")?;

  let cancel = CancellationToken::new();
  tokio::spawn({
    let cancel = cancel.clone();
    async move {
      if tokio::signal::ctrl_c().await.is_ok() {
        tracing::warn!("interrupted; cancelling fetches and rolling back open batches");
        cancel.cancel();
      }
    }
  });

  let mut pipeline = Pipeline::new(Arc::new(store), client, cfg.settings()).with_cancel(cancel);
  if !cli.no_cache
    && let Some(dir) = &cfg.pipeline.cache_dir
  {
    let cache = RawCache::new(expand_tilde(dir), cfg.cache_ttl());
    tracing::debug!(dir = ?cache.dir(), "raw cache enabled");
    pipeline = pipeline.with_cache(cache);
  }

  let summary = pipeline.run(mode).await;
  if cli.json {
    println!("{}", serde_json::to_string_pretty(&summary)?);
  } else {
    print!("{summary}");
  }
  Ok(ExitCode::from(summary.exit_code() as u8))
}

async fn status(store: &SqliteStore, as_json: bool) -> anyhow::Result<ExitCode> {
  let counts = store.row_counts().await.context("failed to count rows")?;
  let failed = store.failed_pages().await.context("failed to read the ledger")?;
  let mut watermarks = Vec::new();
  for source in [Source::Announcements, Source::Contracts, Source::Modifications] {
    let watermark = store.watermark(source).await.context("failed to read the ledger")?;
    watermarks.push((source, watermark));
  }

  if as_json {
    let watermarks: serde_json::Map<String, serde_json::Value> = watermarks
      .iter()
      .map(|(source, w)| (source.to_string(), json!(w)))
      .collect();
    let out = json!({ "rows": counts, "watermarks": watermarks, "failed_pages": failed });
    println!("{}", serde_json::to_string_pretty(&out)?);
    return Ok(ExitCode::SUCCESS);
  }

  println!("rows: {} total", counts.total());
  println!("  entities:     {}", counts.entities);
  println!("  opportunities: {}", counts.opportunities);
  println!("  awards:       {}", counts.awards);
  println!("  categories:   {}", counts.coded_categories);
  println!("  party edges:  {}", counts.award_parties);
  for (source, watermark) in &watermarks {
    match watermark {
      Some(date) => println!("{source}: complete through {date}"),
      None => println!("{source}: no completed range"),
    }
  }
  if !failed.is_empty() {
    println!("pages never committed:");
    for f in &failed {
      println!("  {} ({} attempts): {}", f.page, f.attempts, f.last_error);
    }
  }
  Ok(ExitCode::SUCCESS)
}

async fn verify(store: &SqliteStore, as_json: bool) -> anyhow::Result<ExitCode> {
  let report = store.integrity_scan().await.context("integrity scan failed")?;
  if as_json {
    println!("{}", serde_json::to_string_pretty(&report)?);
  } else if report.is_clean() {
    println!("all references resolve");
  } else {
    println!("{} dangling references:", report.dangling.len());
    for d in &report.dangling {
      println!("  {}.{} = {}", d.table, d.column, d.value);
    }
  }
  Ok(if report.is_clean() { ExitCode::SUCCESS } else { ExitCode::FAILURE })
}

/// Expand a leading `~` to the user's home directory.
fn expand_tilde(path: &Path) -> PathBuf {
  let s = path.to_string_lossy();
  if let Some(rest) = s.strip_prefix("~/")
    && let Ok(home) = std::env::var("HOME")
  {
    return PathBuf::from(home).join(rest);
  }
  path.to_path_buf()
}
