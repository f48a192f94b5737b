//! What a run did, for the operator and for the exit code.

use std::{collections::BTreeMap, fmt};

use chrono::{DateTime, Utc};
use contrap_client::{AttemptOutcome, FetchEvent};
use contrap_core::{
  fragment::{Batch, RootEntity},
  ledger::PageKey,
  store::CommitReport,
  warning::{FieldWarning, WarningKind},
};
use serde::Serialize;
use serde_json::Value;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
  /// Every planned page committed.
  Completed,
  /// The run finished but some pages did not commit.
  Partial,
  /// Aborted by a configuration error or cancellation.
  Failed,
}

/// Records loaded, by what they turned into.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RecordCounts {
  pub opportunities: u64,
  pub awards:        u64,
  pub modifications: u64,
  pub entities:      u64,
  /// Records with no usable primary key; only their stubs and lookups load.
  pub unkeyed:       u64,
  /// New stub entities created.
  pub stubs:         u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct UncommittedPage {
  pub page:  PageKey,
  pub error: String,
}

/// A committed record that produced warnings, kept as received.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct InvalidRecord {
  pub page:     PageKey,
  /// Position within the page.
  pub position: usize,
  pub warnings: Vec<FieldWarning>,
  pub record:   Value,
}

/// Counters one worker accumulates; merged at the end of a run.
#[derive(Debug, Clone, Default, Serialize)]
pub struct Tally {
  pub pages_committed:     u64,
  /// Already committed by an earlier run.
  pub pages_skipped:       u64,
  /// Already marked complete by an earlier run; not fetched.
  pub ranges_skipped:      u64,
  pub records:             RecordCounts,
  pub rows_added:          u64,
  pub rows_updated:        u64,
  pub warnings:            BTreeMap<WarningKind, u64>,
  /// Records dated inside the fetched year but outside the run's window.
  pub out_of_window:       u64,
  pub uncommitted:         Vec<UncommittedPage>,
  /// Written to the run's invalid-records file, not to the summary.
  #[serde(skip)]
  pub invalid:             Vec<InvalidRecord>,
  pub entities_enriched:   u64,
  pub enrichment_failures: u64,
  pub cache_hits:          u64,
}

impl Tally {
  pub fn merge(&mut self, other: Tally) {
    self.pages_committed += other.pages_committed;
    self.pages_skipped += other.pages_skipped;
    self.ranges_skipped += other.ranges_skipped;
    self.records.opportunities += other.records.opportunities;
    self.records.awards += other.records.awards;
    self.records.modifications += other.records.modifications;
    self.records.entities += other.records.entities;
    self.records.unkeyed += other.records.unkeyed;
    self.records.stubs += other.records.stubs;
    self.rows_added += other.rows_added;
    self.rows_updated += other.rows_updated;
    for (kind, n) in other.warnings {
      *self.warnings.entry(kind).or_default() += n;
    }
    self.out_of_window += other.out_of_window;
    self.uncommitted.extend(other.uncommitted);
    self.invalid.extend(other.invalid);
    self.entities_enriched += other.entities_enriched;
    self.enrichment_failures += other.enrichment_failures;
    self.cache_hits += other.cache_hits;
  }

  /// Count a batch that has just been written.
  pub fn add_commit(&mut self, batch: &Batch, report: &CommitReport) {
    for record in &batch.records {
      match &record.root {
        Some(RootEntity::Opportunity(_)) => self.records.opportunities += 1,
        Some(RootEntity::Award(_)) => self.records.awards += 1,
        Some(RootEntity::Modification(_)) => self.records.modifications += 1,
        Some(RootEntity::Entity(_)) => self.records.entities += 1,
        None => self.records.unkeyed += 1,
      }
      for w in &record.warnings {
        *self.warnings.entry(w.kind).or_default() += 1;
      }
    }
    self.records.stubs += report.stubs as u64;
    self.rows_added += report.rows_added as u64;
    self.rows_updated += report.rows_updated as u64;
  }

  /// Keep every record of a committed page that produced warnings, paired
  /// with the raw value it came from.
  pub fn add_invalid(&mut self, page: PageKey, raw: &[Value], batch: &Batch) {
    for (position, (value, record)) in raw.iter().zip(&batch.records).enumerate() {
      if !record.warnings.is_empty() {
        self.invalid.push(InvalidRecord {
          page,
          position,
          warnings: record.warnings.clone(),
          record: value.clone(),
        });
      }
    }
  }

  pub fn warning_total(&self) -> u64 { self.warnings.values().sum() }
}

// ─── Fetch statistics ────────────────────────────────────────────────────────

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct FetchStats {
  pub requests: u64,
  pub attempts: u64,
  pub retries:  u64,
  /// Requests that gave up.
  pub failures: u64,
}

impl FetchStats {
  pub fn record(&mut self, event: &FetchEvent) {
    self.attempts += 1;
    if event.attempt == 1 {
      self.requests += 1;
    }
    match event.outcome {
      AttemptOutcome::Success { .. } => {}
      AttemptOutcome::Retrying { .. } => self.retries += 1,
      AttemptOutcome::Failed { .. } => self.failures += 1,
    }
  }
}

// ─── Summary ─────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize)]
pub struct RunSummary {
  pub run_id:      Uuid,
  pub mode:        String,
  pub status:      RunStatus,
  pub started_at:  DateTime<Utc>,
  pub finished_at: DateTime<Utc>,
  #[serde(flatten)]
  pub tally:       Tally,
  pub fetches:     FetchStats,
  /// The error that aborted the run, if any.
  pub error:       Option<String>,
}

impl RunSummary {
  pub fn status_for(tally: &Tally, aborted: bool) -> RunStatus {
    if aborted {
      RunStatus::Failed
    } else if !tally.uncommitted.is_empty() || tally.enrichment_failures > 0 {
      RunStatus::Partial
    } else {
      RunStatus::Completed
    }
  }

  pub fn exit_code(&self) -> i32 {
    match self.status {
      RunStatus::Completed => 0,
      RunStatus::Partial => 2,
      RunStatus::Failed => 1,
    }
  }
}

impl fmt::Display for RunSummary {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    let t = &self.tally;
    let elapsed = self.finished_at - self.started_at;
    writeln!(f, "run {} ({}): {:?} in {}s", self.run_id, self.mode, self.status, elapsed.num_seconds())?;
    writeln!(
      f,
      "  pages:    {} committed, {} already committed, {} ranges already complete",
      t.pages_committed, t.pages_skipped, t.ranges_skipped
    )?;
    writeln!(
      f,
      "  records:  {} opportunities, {} awards, {} modifications, {} entities, {} unkeyed, {} new stubs",
      t.records.opportunities,
      t.records.awards,
      t.records.modifications,
      t.records.entities,
      t.records.unkeyed,
      t.records.stubs
    )?;
    writeln!(f, "  rows:     {} added, {} updated", t.rows_added, t.rows_updated)?;
    writeln!(
      f,
      "  fetches:  {} requests, {} attempts, {} retries, {} gave up, {} from cache",
      self.fetches.requests, self.fetches.attempts, self.fetches.retries, self.fetches.failures, t.cache_hits
    )?;
    if t.entities_enriched > 0 || t.enrichment_failures > 0 {
      writeln!(
        f,
        "  entities: {} enriched, {} failed",
        t.entities_enriched, t.enrichment_failures
      )?;
    }
    if t.out_of_window > 0 {
      writeln!(f, "  skipped {} records dated outside the window", t.out_of_window)?;
    }
    if !t.warnings.is_empty() {
      writeln!(f, "  warnings: {}", t.warning_total())?;
      for (kind, n) in &t.warnings {
        writeln!(f, "    {kind}: {n}")?;
      }
    }
    if !t.uncommitted.is_empty() {
      writeln!(f, "  uncommitted pages:")?;
      for u in &t.uncommitted {
        writeln!(f, "    {}: {}", u.page, u.error)?;
      }
    }
    if let Some(error) = &self.error {
      writeln!(f, "  error: {error}")?;
    }
    Ok(())
  }
}

#[cfg(test)]
mod tests {
  use contrap_core::{
    fragment::Transformed,
    ledger::{DateRange, Source},
    warning::FieldWarning,
  };

  use super::*;

  fn page() -> PageKey {
    PageKey {
      source: Source::Contracts,
      range:  DateRange::year(2024).unwrap(),
      index:  3,
    }
  }

  fn summary(tally: Tally, aborted: bool) -> RunSummary {
    let now = Utc::now();
    RunSummary {
      run_id: Uuid::new_v4(),
      mode: "year 2024".into(),
      status: RunSummary::status_for(&tally, aborted),
      started_at: now,
      finished_at: now,
      tally,
      fetches: FetchStats::default(),
      error: None,
    }
  }

  #[test]
  fn exit_codes_follow_status() {
    assert_eq!(summary(Tally::default(), false).exit_code(), 0);
    assert_eq!(summary(Tally::default(), true).exit_code(), 1);

    let partial = Tally {
      uncommitted: vec![UncommittedPage { page: page(), error: "HTTP 503".into() }],
      ..Tally::default()
    };
    let s = summary(partial, false);
    assert_eq!(s.status, RunStatus::Partial);
    assert_eq!(s.exit_code(), 2);
    assert!(s.to_string().contains("contracts[2024-01-01..2024-12-31]#3: HTTP 503"));
  }

  #[test]
  fn add_commit_counts_roots_and_warnings() {
    let batch = Batch {
      records: vec![
        Transformed {
          warnings: vec![
            FieldWarning::new("nifEntidade", WarningKind::InvalidTaxId),
            FieldWarning::new("PrecoBase", WarningKind::InvalidAmount),
          ],
          ..Transformed::default()
        },
        Transformed {
          warnings: vec![FieldWarning::new("nifEntidade", WarningKind::InvalidTaxId)],
          ..Transformed::default()
        },
      ],
      ..Batch::default()
    };
    let report = CommitReport { stubs: 2, rows_added: 5, ..CommitReport::default() };

    let mut tally = Tally::default();
    tally.add_commit(&batch, &report);
    assert_eq!(tally.records.unkeyed, 2);
    assert_eq!(tally.records.stubs, 2);
    assert_eq!(tally.warnings[&WarningKind::InvalidTaxId], 2);
    assert_eq!(tally.warning_total(), 3);

    let mut total = Tally::default();
    total.merge(tally.clone());
    total.merge(tally);
    assert_eq!(total.warnings[&WarningKind::InvalidTaxId], 4);
    assert_eq!(total.rows_added, 10);
  }

  #[test]
  fn add_invalid_keeps_only_records_with_warnings() {
    let raw = vec![
      serde_json::json!({ "idcontrato": "1" }),
      serde_json::json!({ "idcontrato": "2", "precoContratual": "muito" }),
    ];
    let batch = Batch {
      records: vec![
        Transformed::default(),
        Transformed {
          warnings: vec![FieldWarning::new("precoContratual", WarningKind::InvalidAmount)],
          ..Transformed::default()
        },
      ],
      ..Batch::default()
    };

    let mut tally = Tally::default();
    tally.add_invalid(page(), &raw, &batch);
    assert_eq!(tally.invalid.len(), 1);
    assert_eq!(tally.invalid[0].position, 1);
    assert_eq!(tally.invalid[0].record, raw[1]);

    let mut total = Tally::default();
    total.merge(tally);
    assert_eq!(total.invalid.len(), 1);
  }

  #[test]
  fn json_form_flattens_the_tally() {
    let tally = Tally {
      invalid: vec![InvalidRecord {
        page:     page(),
        position: 0,
        warnings: Vec::new(),
        record:   Value::Null,
      }],
      ..Tally::default()
    };
    let value = serde_json::to_value(summary(tally, false)).unwrap();
    assert_eq!(value["status"], "completed");
    assert_eq!(value["pages_committed"], 0);
    assert!(value["fetches"]["attempts"].is_number());
    assert!(value.get("invalid").is_none());
  }
}
