//! Error types for `contrap-core` and the pipeline-wide failure taxonomy.

use chrono::NaiveDate;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
  #[error("invalid tax identifier: {0:?}")]
  InvalidTaxId(String),

  #[error("invalid date range: {start} is after {end}")]
  InvalidRange { start: NaiveDate, end: NaiveDate },

  #[error("unknown source: {0:?}")]
  UnknownSource(String),

  #[error("unknown contract kind: {0:?}")]
  UnknownContractKind(String),
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

// ─── Taxonomy ────────────────────────────────────────────────────────────────

/// How the orchestrator should react to a failure.
///
/// Malformed fields never reach this level; the normalizer turns them into
/// warnings.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
  /// Network, timeout or 5xx. Retried by the client; surfaced only once the
  /// retry budget is spent.
  TransientRemote,
  /// A batch failed referential integrity at load time. Rolled back and
  /// retried once after re-deriving the batch.
  SchemaViolation,
  /// Bad token, bad request shape, bad config. Aborts the run.
  Configuration,
  /// The run was cancelled from above.
  Cancelled,
  /// Anything else that cannot be recovered locally.
  Fatal,
}

/// Implemented by every error type that crosses a crate boundary into the
/// orchestrator.
pub trait Classify {
  fn class(&self) -> ErrorClass;

  fn is_retryable(&self) -> bool {
    matches!(
      self.class(),
      ErrorClass::TransientRemote | ErrorClass::SchemaViolation
    )
  }

  fn is_fatal_for_run(&self) -> bool {
    matches!(self.class(), ErrorClass::Configuration | ErrorClass::Cancelled)
  }
}
