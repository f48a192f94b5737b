//! The ordered loader.
//!
//! One batch, one transaction, in a fixed order: entities (enriched rows,
//! then stubs), lookups, roots (opportunities, awards, then modifications),
//! fragments, counters, ledger mark. Each phase
//! only references rows written by an earlier one, so foreign keys hold at
//! every statement. Limits are checked between phases and before commit,
//! and a progress handler interrupts any single statement that runs past
//! them; returning early drops the transaction, which rolls it back.

use std::{
  collections::BTreeSet,
  panic::AssertUnwindSafe,
  str::FromStr,
  time::{Duration, Instant},
};

use chrono::Utc;
use contrap_core::{
  entity::{EntityStub, ReferenceEntity},
  fragment::{AssociationFragment, Batch, RootEntity},
  procurement::{
    Award, CodedCategory, ContractKind, Modification, Opportunity, OpportunityRef,
  },
  store::CommitReport,
};
use rusqlite::{Connection, ErrorCode, OptionalExtension as _, TransactionBehavior, params};
use rust_decimal::Decimal;
use tokio_util::sync::CancellationToken;

use crate::{
  encode::{encode_date, encode_decimal, encode_dt},
  ledger,
};

#[derive(Debug)]
pub enum LoadError {
  Sqlite(rusqlite::Error),
  Cancelled,
  Timeout(Duration),
}

impl From<rusqlite::Error> for LoadError {
  fn from(e: rusqlite::Error) -> Self { Self::Sqlite(e) }
}

type LoadResult<T> = std::result::Result<T, LoadError>;

/// SQLite virtual-machine instructions between progress handler calls.
const PROGRESS_OPS: i32 = 1_000;

/// Limits for one commit, started when the load was requested.
pub struct Guard {
  started: Instant,
  limit:   Duration,
  cancel:  CancellationToken,
}

impl Guard {
  pub fn new(limit: Duration, cancel: CancellationToken) -> Self {
    Self { started: Instant::now(), limit, cancel }
  }

  fn check(&self) -> LoadResult<()> {
    if self.cancel.is_cancelled() {
      return Err(LoadError::Cancelled);
    }
    if self.started.elapsed() >= self.limit {
      return Err(LoadError::Timeout(self.limit));
    }
    Ok(())
  }

  /// Run `f` with a progress handler installed that interrupts the current
  /// statement once the guard trips. An interrupted statement surfaces as
  /// the limit that tripped.
  pub fn run<T>(
    &self,
    conn: &mut Connection,
    f: impl FnOnce(&mut Connection) -> LoadResult<T>,
  ) -> LoadResult<T> {
    self.check()?;
    let cancel = AssertUnwindSafe(self.cancel.clone());
    let deadline = self.started.checked_add(self.limit);
    conn.progress_handler(
      PROGRESS_OPS,
      Some(move || {
        cancel.is_cancelled() || deadline.is_some_and(|d| Instant::now() >= d)
      }),
    );
    let result = f(conn);
    conn.progress_handler(0, None::<fn() -> bool>);

    result.map_err(|e| match e {
      LoadError::Sqlite(e)
        if e.sqlite_error_code() == Some(ErrorCode::OperationInterrupted) =>
      {
        self.check().err().unwrap_or(LoadError::Sqlite(e))
      }
      other => other,
    })
  }
}

pub fn apply(conn: &mut Connection, batch: &Batch, guard: &Guard) -> LoadResult<CommitReport> {
  guard.run(conn, |conn| write(conn, batch, guard))
}

fn write(conn: &mut Connection, batch: &Batch, guard: &Guard) -> LoadResult<CommitReport> {
  let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
  let now = encode_dt(Utc::now());
  let mut report = CommitReport::default();

  if let Some(page) = &batch.page {
    if ledger::is_committed(&tx, page)? {
      return Ok(CommitReport { already_committed: true, ..CommitReport::default() });
    }
  }

  let mut touched: BTreeSet<String> = BTreeSet::new();

  // Entities.
  for record in &batch.records {
    if let Some(RootEntity::Entity(entity)) = &record.root {
      upsert_entity(&tx, entity, &now, &mut report)?;
      touched.insert(entity.tax_id.to_string());
    }
  }
  for stub in batch.records.iter().flat_map(|r| &r.stubs) {
    upsert_stub(&tx, stub, &now, &mut report)?;
    touched.insert(stub.tax_id.to_string());
  }
  guard.check()?;

  // Lookups.
  for category in batch.records.iter().flat_map(|r| &r.categories) {
    upsert_category(&tx, category, &mut report)?;
  }
  for kind in batch.records.iter().flat_map(|r| &r.kinds) {
    insert_kind(&tx, *kind, &mut report)?;
  }
  guard.check()?;

  // Roots. Opportunities first so awards in the same batch can link to them.
  for record in &batch.records {
    if let Some(RootEntity::Opportunity(opportunity)) = &record.root {
      upsert_opportunity(&tx, opportunity, &now, &mut report)?;
    }
  }
  for record in &batch.records {
    if let Some(RootEntity::Award(award)) = &record.root {
      upsert_award(&tx, award, &now, &mut report)?;
    }
  }
  for record in &batch.records {
    if let Some(RootEntity::Modification(modification)) = &record.root {
      touched.extend(upsert_modification(&tx, modification, &now, &mut report)?);
    }
  }
  guard.check()?;

  // Fragments.
  for fragment in batch.records.iter().flat_map(|r| &r.fragments) {
    if insert_fragment(&tx, fragment)? {
      report.fragments_inserted += 1;
      report.rows_added += 1;
    }
  }
  guard.check()?;

  // Counters.
  for tax_id in &touched {
    refresh_counters(&tx, tax_id)?;
  }
  guard.check()?;

  if let Some(page) = &batch.page {
    ledger::mark_committed(&tx, page, batch.len(), batch.digest.as_deref(), &now)?;
  }
  guard.check()?;

  tx.commit()?;
  Ok(report)
}

// ─── Entities ────────────────────────────────────────────────────────────────

fn entity_exists(conn: &Connection, tax_id: &str) -> rusqlite::Result<bool> {
  Ok(
    conn
      .query_row("SELECT 1 FROM entities WHERE tax_id = ?1", params![tax_id], |_| {
        Ok(true)
      })
      .optional()?
      .unwrap_or(false),
  )
}

fn count_change(existed: bool, changed: usize, report: &mut CommitReport) {
  match (existed, changed) {
    (false, _) => report.rows_added += 1,
    (true, 0) => {}
    (true, _) => report.rows_updated += 1,
  }
}

/// Never lowers freshness, never erases a known attribute.
fn upsert_entity(
  conn: &Connection,
  entity: &ReferenceEntity,
  now: &str,
  report: &mut CommitReport,
) -> rusqlite::Result<()> {
  let tax_id = entity.tax_id.as_str();
  let existed = entity_exists(conn, tax_id)?;
  let changed = conn.execute(
    "INSERT INTO entities (
       tax_id, name, country, address, postal_code, locality, entity_type,
       freshness, created_at, updated_at
     ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?9)
     ON CONFLICT (tax_id) DO UPDATE SET
       name        = coalesce(excluded.name, entities.name),
       country     = coalesce(excluded.country, entities.country),
       address     = coalesce(excluded.address, entities.address),
       postal_code = coalesce(excluded.postal_code, entities.postal_code),
       locality    = coalesce(excluded.locality, entities.locality),
       entity_type = coalesce(excluded.entity_type, entities.entity_type),
       freshness   = max(entities.freshness, excluded.freshness),
       updated_at  = excluded.updated_at",
    params![
      tax_id,
      entity.name,
      entity.country,
      entity.address,
      entity.postal_code,
      entity.locality,
      entity.entity_type,
      entity.freshness.rank(),
      now,
    ],
  )?;
  count_change(existed, changed, report);
  report.entities += 1;
  Ok(())
}

/// Creates the row, or fills in a name the row does not have yet.
fn upsert_stub(
  conn: &Connection,
  stub: &EntityStub,
  now: &str,
  report: &mut CommitReport,
) -> rusqlite::Result<()> {
  let tax_id = stub.tax_id.as_str();
  let existed = entity_exists(conn, tax_id)?;
  let changed = conn.execute(
    "INSERT INTO entities (tax_id, name, freshness, created_at, updated_at)
     VALUES (?1, ?2, 0, ?3, ?3)
     ON CONFLICT (tax_id) DO UPDATE SET
       name       = excluded.name,
       updated_at = excluded.updated_at
     WHERE entities.name IS NULL AND excluded.name IS NOT NULL",
    params![tax_id, stub.name, now],
  )?;
  if !existed {
    report.stubs += 1;
  }
  count_change(existed, changed, report);
  Ok(())
}

// ─── Lookups ─────────────────────────────────────────────────────────────────

fn upsert_category(
  conn: &Connection,
  category: &CodedCategory,
  report: &mut CommitReport,
) -> rusqlite::Result<()> {
  let existed = conn
    .query_row(
      "SELECT 1 FROM coded_categories WHERE code = ?1",
      params![category.code],
      |_| Ok(true),
    )
    .optional()?
    .unwrap_or(false);
  let changed = conn.execute(
    "INSERT INTO coded_categories (code, check_digit, description, prefix)
     VALUES (?1, ?2, ?3, ?4)
     ON CONFLICT (code) DO UPDATE SET
       description = excluded.description,
       check_digit = coalesce(excluded.check_digit, coded_categories.check_digit)
     WHERE excluded.description IS NOT NULL
       AND excluded.description IS NOT coded_categories.description",
    params![
      category.code,
      category.check_digit,
      category.description,
      category.prefix(),
    ],
  )?;
  count_change(existed, changed, report);
  Ok(())
}

fn insert_kind(
  conn: &Connection,
  kind: ContractKind,
  report: &mut CommitReport,
) -> rusqlite::Result<()> {
  let added = conn.execute(
    "INSERT INTO contract_kinds (name) VALUES (?1) ON CONFLICT DO NOTHING",
    params![kind.to_string()],
  )?;
  report.rows_added += added;
  Ok(())
}

// ─── Roots ───────────────────────────────────────────────────────────────────

fn upsert_opportunity(
  conn: &Connection,
  o: &Opportunity,
  now: &str,
  report: &mut CommitReport,
) -> rusqlite::Result<()> {
  let existed = conn
    .query_row(
      "SELECT 1 FROM opportunities WHERE external_id = ?1 AND year = ?2",
      params![o.key.external_id, o.key.year],
      |_| Ok(true),
    )
    .optional()?
    .unwrap_or(false);

  let changed = conn.execute(
    "INSERT INTO opportunities (
       external_id, year, publication_date, issuer_tax_id, title, description,
       base_price, deadline_days, submission_deadline, environmental_criteria,
       procedure_type, url, updated_at
     ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)
     ON CONFLICT (external_id, year) DO UPDATE SET
       publication_date       = coalesce(excluded.publication_date, opportunities.publication_date),
       issuer_tax_id          = coalesce(excluded.issuer_tax_id, opportunities.issuer_tax_id),
       title                  = coalesce(excluded.title, opportunities.title),
       description            = coalesce(excluded.description, opportunities.description),
       base_price             = coalesce(excluded.base_price, opportunities.base_price),
       deadline_days          = coalesce(excluded.deadline_days, opportunities.deadline_days),
       submission_deadline    = coalesce(excluded.submission_deadline, opportunities.submission_deadline),
       environmental_criteria = excluded.environmental_criteria,
       procedure_type         = coalesce(excluded.procedure_type, opportunities.procedure_type),
       url                    = coalesce(excluded.url, opportunities.url),
       updated_at             = excluded.updated_at",
    params![
      o.key.external_id,
      o.key.year,
      o.publication_date.map(encode_date),
      o.issuer.as_ref().map(|t| t.as_str()),
      o.title,
      o.description,
      o.base_price.as_ref().map(encode_decimal),
      o.deadline_days,
      o.submission_deadline.map(encode_date),
      o.environmental_criteria,
      o.procedure_type,
      o.url,
      now,
    ],
  )?;
  count_change(existed, changed, report);
  report.opportunities += 1;

  // Awards that arrived before this opportunity.
  let relinked = conn.execute(
    "UPDATE awards SET opportunity_id = ?1, opportunity_year = ?2, updated_at = ?3
     WHERE opportunity_id IS NULL
       AND opportunity_ref = ?1
       AND (opportunity_ref_year IS NULL OR opportunity_ref_year = ?2)",
    params![o.key.external_id, o.key.year, now],
  )?;
  report.rows_updated += relinked;
  Ok(())
}

/// An exact `(id, year)` match, or the only opportunity with that id when
/// the reference carries no year.
fn resolve_link(
  conn: &Connection,
  reference: &OpportunityRef,
) -> rusqlite::Result<Option<(String, i32)>> {
  match reference.year {
    Some(year) => conn
      .query_row(
        "SELECT external_id, year FROM opportunities WHERE external_id = ?1 AND year = ?2",
        params![reference.external_id, year],
        |row| Ok((row.get(0)?, row.get(1)?)),
      )
      .optional(),
    None => {
      let mut stmt = conn.prepare(
        "SELECT external_id, year FROM opportunities WHERE external_id = ?1 LIMIT 2",
      )?;
      let matches = stmt
        .query_map(params![reference.external_id], |row| Ok((row.get(0)?, row.get(1)?)))?
        .collect::<rusqlite::Result<Vec<(String, i32)>>>()?;
      Ok(match <[_; 1]>::try_from(matches) {
        Ok([only]) => Some(only),
        Err(_) => None,
      })
    }
  }
}

fn upsert_award(
  conn: &Connection,
  a: &Award,
  now: &str,
  report: &mut CommitReport,
) -> rusqlite::Result<()> {
  let existed = conn
    .query_row("SELECT 1 FROM awards WHERE award_id = ?1", params![a.id], |_| Ok(true))
    .optional()?
    .unwrap_or(false);

  let link = match &a.opportunity_ref {
    Some(reference) => {
      let link = resolve_link(conn, reference)?;
      if link.is_none() {
        report.unlinked_awards += 1;
      }
      link
    }
    None => None,
  };
  let (link_id, link_year) = link.unzip();

  let changed = conn.execute(
    "INSERT INTO awards (
       award_id, opportunity_ref, opportunity_ref_year, opportunity_id,
       opportunity_year, issuer_tax_id, description, procedure_type, location,
       legal_basis, contract_price, base_price, publication_date, signing_date,
       decision_date, closure_date, execution_days, updated_at
     ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17, ?18)
     ON CONFLICT (award_id) DO UPDATE SET
       opportunity_ref      = coalesce(excluded.opportunity_ref, awards.opportunity_ref),
       opportunity_ref_year = coalesce(excluded.opportunity_ref_year, awards.opportunity_ref_year),
       opportunity_id       = coalesce(excluded.opportunity_id, awards.opportunity_id),
       opportunity_year     = coalesce(excluded.opportunity_year, awards.opportunity_year),
       issuer_tax_id        = coalesce(excluded.issuer_tax_id, awards.issuer_tax_id),
       description          = coalesce(excluded.description, awards.description),
       procedure_type       = coalesce(excluded.procedure_type, awards.procedure_type),
       location             = coalesce(excluded.location, awards.location),
       legal_basis          = coalesce(excluded.legal_basis, awards.legal_basis),
       contract_price       = coalesce(excluded.contract_price, awards.contract_price),
       base_price           = coalesce(excluded.base_price, awards.base_price),
       publication_date     = coalesce(excluded.publication_date, awards.publication_date),
       signing_date         = coalesce(excluded.signing_date, awards.signing_date),
       decision_date        = coalesce(excluded.decision_date, awards.decision_date),
       closure_date         = coalesce(excluded.closure_date, awards.closure_date),
       execution_days       = coalesce(excluded.execution_days, awards.execution_days),
       updated_at           = excluded.updated_at",
    params![
      a.id,
      a.opportunity_ref.as_ref().map(|r| r.external_id.as_str()),
      a.opportunity_ref.as_ref().and_then(|r| r.year),
      link_id,
      link_year,
      a.issuer.as_ref().map(|t| t.as_str()),
      a.description,
      a.procedure_type,
      a.location,
      a.legal_basis,
      a.contract_price.as_ref().map(encode_decimal),
      a.base_price.as_ref().map(encode_decimal),
      a.publication_date.map(encode_date),
      a.signing_date.map(encode_date),
      a.decision_date.map(encode_date),
      a.closure_date.map(encode_date),
      a.execution_days,
      now,
    ],
  )?;
  count_change(existed, changed, report);
  report.awards += 1;

  // The published price is the starting point; amendments loaded earlier
  // still apply on top of it.
  report.rows_updated += apply_modifications(conn, &a.id, now)?;
  Ok(())
}

/// Stores the modification and applies it to its award when the award is
/// loaded. Returns the parties whose counters the new price affects.
fn upsert_modification(
  conn: &Connection,
  m: &Modification,
  now: &str,
  report: &mut CommitReport,
) -> rusqlite::Result<Vec<String>> {
  let existed = conn
    .query_row(
      "SELECT 1 FROM award_modifications WHERE modification_id = ?1",
      params![m.id],
      |_| Ok(true),
    )
    .optional()?
    .unwrap_or(false);
  let changed = conn.execute(
    "INSERT INTO award_modifications (
       modification_id, award_id, modified_on, kind, description, justification,
       original_value, new_value, original_deadline, new_deadline, updated_at
     ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)
     ON CONFLICT (modification_id) DO UPDATE SET
       award_id          = excluded.award_id,
       modified_on       = coalesce(excluded.modified_on, award_modifications.modified_on),
       kind              = coalesce(excluded.kind, award_modifications.kind),
       description       = coalesce(excluded.description, award_modifications.description),
       justification     = coalesce(excluded.justification, award_modifications.justification),
       original_value    = coalesce(excluded.original_value, award_modifications.original_value),
       new_value         = coalesce(excluded.new_value, award_modifications.new_value),
       original_deadline = coalesce(excluded.original_deadline, award_modifications.original_deadline),
       new_deadline      = coalesce(excluded.new_deadline, award_modifications.new_deadline),
       updated_at        = excluded.updated_at",
    params![
      m.id,
      m.award_id,
      m.modified_on.map(encode_date),
      m.kind,
      m.description,
      m.justification,
      m.original_value.as_ref().map(encode_decimal),
      m.new_value.as_ref().map(encode_decimal),
      m.original_deadline.map(encode_date),
      m.new_deadline.map(encode_date),
      now,
    ],
  )?;
  count_change(existed, changed, report);
  report.modifications += 1;

  let award_exists = conn
    .query_row("SELECT 1 FROM awards WHERE award_id = ?1", params![m.award_id], |_| {
      Ok(true)
    })
    .optional()?
    .unwrap_or(false);
  if !award_exists {
    report.unlinked_modifications += 1;
    return Ok(Vec::new());
  }
  report.rows_updated += apply_modifications(conn, &m.award_id, now)?;

  let mut stmt = conn.prepare(
    "SELECT issuer_tax_id FROM awards WHERE award_id = ?1 AND issuer_tax_id IS NOT NULL
     UNION
     SELECT tax_id FROM award_parties WHERE award_id = ?1 AND role = 'winner'",
  )?;
  let parties = stmt
    .query_map(params![m.award_id], |row| row.get(0))?
    .collect::<rusqlite::Result<Vec<String>>>()?;
  Ok(parties)
}

/// Sets the award's price to the newest value any of its modifications
/// carries. Dated modifications outrank undated ones. Returns the number of
/// award rows changed.
fn apply_modifications(conn: &Connection, award_id: &str, now: &str) -> rusqlite::Result<usize> {
  conn.execute(
    "WITH latest AS (
       SELECT new_value FROM award_modifications
       WHERE award_id = ?1 AND new_value IS NOT NULL
       ORDER BY modified_on IS NULL, modified_on DESC, modification_id DESC
       LIMIT 1
     )
     UPDATE awards SET
       contract_price = (SELECT new_value FROM latest),
       updated_at     = ?2
     WHERE award_id = ?1
       AND EXISTS (SELECT 1 FROM latest)
       AND contract_price IS NOT (SELECT new_value FROM latest)",
    params![award_id, now],
  )
}

// ─── Fragments ───────────────────────────────────────────────────────────────

/// Returns whether a new edge was written.
fn insert_fragment(conn: &Connection, fragment: &AssociationFragment) -> rusqlite::Result<bool> {
  let inserted = match fragment {
    AssociationFragment::OpportunityCategory { opportunity, code } => conn.execute(
      "INSERT INTO opportunity_categories (external_id, year, code)
       VALUES (?1, ?2, ?3) ON CONFLICT DO NOTHING",
      params![opportunity.external_id, opportunity.year, code],
    )?,
    AssociationFragment::OpportunityKind { opportunity, kind } => conn.execute(
      "INSERT INTO opportunity_kinds (external_id, year, kind)
       VALUES (?1, ?2, ?3) ON CONFLICT DO NOTHING",
      params![opportunity.external_id, opportunity.year, kind.to_string()],
    )?,
    AssociationFragment::AwardCategory { award_id, code } => conn.execute(
      "INSERT INTO award_categories (award_id, code) VALUES (?1, ?2) ON CONFLICT DO NOTHING",
      params![award_id, code],
    )?,
    AssociationFragment::AwardKind { award_id, kind } => conn.execute(
      "INSERT INTO award_kinds (award_id, kind) VALUES (?1, ?2) ON CONFLICT DO NOTHING",
      params![award_id, kind.to_string()],
    )?,
    AssociationFragment::AwardParty { award_id, tax_id, role } => conn.execute(
      "INSERT INTO award_parties (award_id, tax_id, role)
       VALUES (?1, ?2, ?3) ON CONFLICT DO NOTHING",
      params![award_id, tax_id.as_str(), role.as_str()],
    )?,
  };
  Ok(inserted > 0)
}

// ─── Counters ────────────────────────────────────────────────────────────────

fn sum_prices(conn: &Connection, sql: &str, tax_id: &str) -> rusqlite::Result<(u64, Decimal)> {
  let mut stmt = conn.prepare(sql)?;
  let prices = stmt
    .query_map(params![tax_id], |row| row.get::<_, Option<String>>(0))?
    .collect::<rusqlite::Result<Vec<_>>>()?;
  let total = prices
    .iter()
    .flatten()
    .filter_map(|p| Decimal::from_str(p).ok())
    .sum();
  Ok((prices.len() as u64, total))
}

/// Recompute an entity's counters from its award edges.
fn refresh_counters(conn: &Connection, tax_id: &str) -> rusqlite::Result<()> {
  let (won, total_won) = sum_prices(
    conn,
    "SELECT a.contract_price FROM award_parties p
     JOIN awards a ON a.award_id = p.award_id
     WHERE p.tax_id = ?1 AND p.role = 'winner'",
    tax_id,
  )?;
  let (issued, total_issued) = sum_prices(
    conn,
    "SELECT contract_price FROM awards WHERE issuer_tax_id = ?1",
    tax_id,
  )?;
  conn.execute(
    "UPDATE entities SET
       contracts_won = ?2, contracts_issued = ?3, total_won = ?4, total_issued = ?5
     WHERE tax_id = ?1",
    params![
      tax_id,
      won as i64,
      issued as i64,
      encode_decimal(&total_won),
      encode_decimal(&total_issued),
    ],
  )?;
  Ok(())
}
