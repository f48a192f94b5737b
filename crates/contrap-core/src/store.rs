//! The `ProcurementStore` trait and the types it reports with.
//!
//! The trait is implemented by storage backends (e.g. `contrap-store-sqlite`).
//! The orchestrator depends on this abstraction, not on any concrete backend.

use std::{future::Future, time::Duration};

use serde::Serialize;
use tokio_util::sync::CancellationToken;

use crate::{
  Classify,
  entity::EntityStub,
  fragment::Batch,
  ledger::{DateRange, FailedPage, PageKey, Source},
};

// ─── Load limits & reports ───────────────────────────────────────────────────

/// Bounds on a single batch commit. Either one tripping rolls the batch back.
#[derive(Debug, Clone)]
pub struct LoadLimits {
  pub commit_timeout: Duration,
  pub cancel:         CancellationToken,
}

impl Default for LoadLimits {
  fn default() -> Self {
    Self {
      commit_timeout: Duration::from_secs(60),
      cancel:         CancellationToken::new(),
    }
  }
}

/// What one committed batch did to the store.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct CommitReport {
  pub opportunities:          usize,
  pub awards:                 usize,
  pub modifications:          usize,
  pub entities:               usize,
  pub stubs:                  usize,
  pub fragments_inserted:     usize,
  /// Awards whose opportunity reference did not resolve in this commit.
  pub unlinked_awards:        usize,
  /// Modifications whose award is not in the store yet. They are applied
  /// when the award arrives.
  pub unlinked_modifications: usize,
  /// Rows that did not exist before the commit.
  pub rows_added:             usize,
  /// Existing rows whose mutable columns were rewritten.
  pub rows_updated:           usize,
  /// The batch's page was already committed; nothing was written.
  pub already_committed:      bool,
}

/// Row counts for every table the pipeline writes.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RowCounts {
  pub entities:               u64,
  pub coded_categories:       u64,
  pub contract_kinds:         u64,
  pub opportunities:          u64,
  pub awards:                 u64,
  pub opportunity_categories: u64,
  pub opportunity_kinds:      u64,
  pub award_categories:       u64,
  pub award_kinds:            u64,
  pub award_parties:          u64,
  pub award_modifications:    u64,
}

impl RowCounts {
  pub fn total(&self) -> u64 {
    self.entities
      + self.coded_categories
      + self.contract_kinds
      + self.opportunities
      + self.awards
      + self.opportunity_categories
      + self.opportunity_kinds
      + self.award_categories
      + self.award_kinds
      + self.award_parties
      + self.award_modifications
  }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DanglingReference {
  pub table:  &'static str,
  pub column: &'static str,
  pub value:  String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct IntegrityReport {
  pub dangling: Vec<DanglingReference>,
}

impl IntegrityReport {
  pub fn is_clean(&self) -> bool { self.dangling.is_empty() }
}

// ─── Trait ───────────────────────────────────────────────────────────────────

/// Abstraction over a procurement store backend.
///
/// `load` is the only path that writes domain rows. Every batch is applied
/// atomically together with its ledger mark, so a page is committed if and
/// only if its rows are.
pub trait ProcurementStore: Send + Sync {
  type Error: std::error::Error + Classify + Send + Sync + 'static;

  // ── Loading ───────────────────────────────────────────────────────────

  /// Apply `batch` in one transaction: stubs, lookups, roots, fragments,
  /// counters, then the ledger mark. Loading a batch whose page is already
  /// committed writes nothing.
  fn load(
    &self,
    batch: Batch,
    limits: LoadLimits,
  ) -> impl Future<Output = Result<CommitReport, Self::Error>> + Send + '_;

  // ── Ledger ────────────────────────────────────────────────────────────

  fn is_committed(
    &self,
    page: PageKey,
  ) -> impl Future<Output = Result<bool, Self::Error>> + Send + '_;

  /// Page indices already committed for `(source, range)`.
  fn committed_indices(
    &self,
    source: Source,
    range: DateRange,
  ) -> impl Future<Output = Result<Vec<u32>, Self::Error>> + Send + '_;

  /// Whether the range was marked complete by an earlier run.
  fn is_range_complete(
    &self,
    source: Source,
    range: DateRange,
  ) -> impl Future<Output = Result<bool, Self::Error>> + Send + '_;

  /// Mark the range complete if every one of its `page_count` pages is
  /// committed. Returns whether it was marked.
  fn complete_range(
    &self,
    source: Source,
    range: DateRange,
    page_count: u32,
  ) -> impl Future<Output = Result<bool, Self::Error>> + Send + '_;

  /// The latest end date among completed ranges for `source`.
  fn watermark(
    &self,
    source: Source,
  ) -> impl Future<Output = Result<Option<chrono::NaiveDate>, Self::Error>>
  + Send
  + '_;

  /// Record a failed attempt for a page that did not commit.
  fn record_failure(
    &self,
    page: PageKey,
    error: String,
  ) -> impl Future<Output = Result<(), Self::Error>> + Send + '_;

  /// Pages with at least one recorded failure and no commit.
  fn failed_pages(
    &self,
  ) -> impl Future<Output = Result<Vec<FailedPage>, Self::Error>> + Send + '_;

  // ── Inspection ────────────────────────────────────────────────────────

  fn row_counts(
    &self,
  ) -> impl Future<Output = Result<RowCounts, Self::Error>> + Send + '_;

  /// Scan every foreign key and association table for references that do
  /// not resolve.
  fn integrity_scan(
    &self,
  ) -> impl Future<Output = Result<IntegrityReport, Self::Error>> + Send + '_;

  /// Entities still at stub freshness, least recently touched first.
  fn pending_stubs(
    &self,
    limit: usize,
  ) -> impl Future<Output = Result<Vec<EntityStub>, Self::Error>> + Send + '_;
}
