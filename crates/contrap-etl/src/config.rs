//! Layered configuration: defaults, then an optional TOML file, then
//! `CONTRAP_*` environment variables (`__` separates nested keys, so
//! `CONTRAP_API__ACCESS_TOKEN` sets `api.access_token`).

use std::{path::Path, path::PathBuf, time::Duration};

use chrono::NaiveDate;
use contrap_client::{ClientConfig, DEFAULT_BASE_URL, FetchBudget};
use contrap_core::ledger::Source;
use serde::Deserialize;

use crate::{
  error::{Error, Result},
  orchestrator::Settings,
};

/// File looked up in the working directory when no `--config` is given.
const DEFAULT_FILE: &str = "contrap";

// ─── Shape ───────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct EtlConfig {
  pub store_path: PathBuf,
  pub api:        ApiConfig,
  pub pipeline:   PipelineConfig,
}

impl Default for EtlConfig {
  fn default() -> Self {
    Self {
      store_path: PathBuf::from("contrap.db"),
      api:        ApiConfig::default(),
      pipeline:   PipelineConfig::default(),
    }
  }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ApiConfig {
  pub base_url:             String,
  pub access_token:         String,
  pub rate_limit_per_sec:   u32,
  pub attempt_timeout_secs: u64,
  pub max_attempts:         u32,
  pub base_delay_ms:        u64,
  pub max_delay_ms:         u64,
  pub backoff_multiplier:   f32,
  pub deadline_secs:        u64,
}

impl Default for ApiConfig {
  fn default() -> Self {
    let slow = FetchBudget::slow_upstream();
    Self {
      base_url:             DEFAULT_BASE_URL.to_owned(),
      access_token:         String::new(),
      rate_limit_per_sec:   5,
      attempt_timeout_secs: slow.attempt_timeout.as_secs(),
      max_attempts:         slow.max_attempts,
      base_delay_ms:        slow.base_delay.as_millis() as u64,
      max_delay_ms:         slow.max_delay.as_millis() as u64,
      backoff_multiplier:   slow.multiplier,
      deadline_secs:        slow.deadline.as_secs(),
    }
  }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
  pub workers:                usize,
  pub batch_size:             usize,
  /// `0` fetches and ledgers one range per calendar year.
  pub chunk_days:             u32,
  /// Raw responses are kept here so a resumed run sees the same payload, and
  /// run reports go under `reports/`. `None` disables both.
  pub cache_dir:              Option<PathBuf>,
  /// `0` never expires an entry.
  pub cache_ttl_hours:        u64,
  /// Start of the first incremental window when nothing was completed yet.
  pub incremental_since:      Option<NaiveDate>,
  /// Stub entities enriched after each run.
  pub enrich_limit:           usize,
  pub commit_timeout_secs:    u64,
  pub strict_tax_id_checksum: bool,
  pub sources:                Vec<Source>,
}

impl Default for PipelineConfig {
  fn default() -> Self {
    Self {
      workers:                2,
      batch_size:             500,
      chunk_days:             0,
      cache_dir:              Some(PathBuf::from("cache")),
      cache_ttl_hours:        24,
      incremental_since:      None,
      enrich_limit:           100,
      commit_timeout_secs:    60,
      strict_tax_id_checksum: false,
      sources:                vec![
        Source::Announcements,
        Source::Contracts,
        Source::Modifications,
      ],
    }
  }
}

// ─── Loading ─────────────────────────────────────────────────────────────────

impl EtlConfig {
  /// Read `path` (required when given) or `contrap.toml` (optional), then
  /// the environment, and validate the result.
  pub fn load(path: Option<&Path>) -> Result<Self> {
    let file = match path {
      Some(path) => config::File::from(path).required(true),
      None => config::File::with_name(DEFAULT_FILE).required(false),
    };
    let settings = config::Config::builder()
      .add_source(file)
      .add_source(
        config::Environment::with_prefix("CONTRAP")
          .prefix_separator("_")
          .separator("__")
          .try_parsing(true),
      )
      .build()?;

    let cfg: Self = settings.try_deserialize()?;
    cfg.validate()?;
    Ok(cfg)
  }

  pub fn validate(&self) -> Result<()> {
    let p = &self.pipeline;
    if p.workers == 0 {
      return Err(Error::Config("pipeline.workers must be > 0".into()));
    }
    if p.batch_size == 0 {
      return Err(Error::Config("pipeline.batch_size must be > 0".into()));
    }
    if p.sources.is_empty() {
      return Err(Error::Config("pipeline.sources is empty".into()));
    }
    if p.sources.contains(&Source::Entities) {
      return Err(Error::Config(
        "entities are fetched per tax id, not by range; remove them from pipeline.sources"
          .into(),
      ));
    }
    if self.api.max_attempts == 0 {
      return Err(Error::Config("api.max_attempts must be > 0".into()));
    }
    if self.api.backoff_multiplier < 1.0 {
      return Err(Error::Config("api.backoff_multiplier must be >= 1".into()));
    }
    Ok(())
  }

  pub fn client_config(&self) -> ClientConfig {
    ClientConfig {
      base_url:           self.api.base_url.clone(),
      access_token:       self.api.access_token.clone(),
      rate_limit_per_sec: self.api.rate_limit_per_sec,
    }
  }

  /// Budget for the year-sized range fetches.
  pub fn range_budget(&self) -> FetchBudget {
    let a = &self.api;
    FetchBudget {
      max_attempts:    a.max_attempts,
      attempt_timeout: Duration::from_secs(a.attempt_timeout_secs),
      base_delay:      Duration::from_millis(a.base_delay_ms),
      max_delay:       Duration::from_millis(a.max_delay_ms),
      multiplier:      a.backoff_multiplier,
      deadline:        Duration::from_secs(a.deadline_secs),
    }
  }

  pub fn cache_ttl(&self) -> Option<Duration> {
    match self.pipeline.cache_ttl_hours {
      0 => None,
      hours => Some(Duration::from_secs(hours * 3600)),
    }
  }

  pub fn settings(&self) -> Settings {
    let p = &self.pipeline;
    Settings {
      sources:                p.sources.clone(),
      workers:                p.workers,
      batch_size:             p.batch_size,
      chunk_days:             p.chunk_days,
      incremental_since:      p.incremental_since,
      enrich_limit:           p.enrich_limit,
      commit_timeout:         Duration::from_secs(p.commit_timeout_secs),
      strict_tax_id_checksum: p.strict_tax_id_checksum,
      range_budget:           self.range_budget(),
      entity_budget:          FetchBudget::standard(),
    }
  }
}
