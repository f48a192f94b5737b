//! [`SqliteStore`], the SQLite implementation of [`ProcurementStore`].

use std::{path::Path, time::Duration};

use chrono::{NaiveDate, Utc};
use contrap_core::{
  entity::{EntityStub, ReferenceEntity, TaxId},
  fragment::{Batch, PartyRole},
  ledger::{DateRange, FailedPage, PageKey, Source},
  procurement::{ContractKind, Modification, Opportunity, OpportunityKey},
  store::{
    CommitReport, DanglingReference, IntegrityReport, LoadLimits, ProcurementStore,
    RowCounts,
  },
};
use rusqlite::{OptionalExtension as _, params};
use strum::IntoEnumIterator as _;

use crate::{
  Error, Result,
  encode::{
    RawAward, RawEntity, RawModification, RawOpportunity, StoredAward, decode_date,
    decode_tax_id, encode_dt,
  },
  ledger,
  loader::{self, Guard, LoadError},
  schema::SCHEMA,
};

/// How long a statement waits on a locked database before failing.
const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

/// Every foreign key in the schema, as `(table, column, query)`. Each query
/// returns the dangling values as text.
const FOREIGN_KEYS: &[(&str, &str, &str)] = &[
  (
    "opportunities",
    "issuer_tax_id",
    "SELECT o.issuer_tax_id FROM opportunities o
     LEFT JOIN entities e ON e.tax_id = o.issuer_tax_id
     WHERE o.issuer_tax_id IS NOT NULL AND e.tax_id IS NULL",
  ),
  (
    "awards",
    "issuer_tax_id",
    "SELECT a.issuer_tax_id FROM awards a
     LEFT JOIN entities e ON e.tax_id = a.issuer_tax_id
     WHERE a.issuer_tax_id IS NOT NULL AND e.tax_id IS NULL",
  ),
  (
    "awards",
    "opportunity_id",
    "SELECT a.opportunity_id || '@' || a.opportunity_year FROM awards a
     LEFT JOIN opportunities o
       ON o.external_id = a.opportunity_id AND o.year = a.opportunity_year
     WHERE a.opportunity_id IS NOT NULL AND o.external_id IS NULL",
  ),
  (
    "opportunity_categories",
    "external_id",
    "SELECT f.external_id || '@' || f.year FROM opportunity_categories f
     LEFT JOIN opportunities o ON o.external_id = f.external_id AND o.year = f.year
     WHERE o.external_id IS NULL",
  ),
  (
    "opportunity_categories",
    "code",
    "SELECT f.code FROM opportunity_categories f
     LEFT JOIN coded_categories c ON c.code = f.code WHERE c.code IS NULL",
  ),
  (
    "opportunity_kinds",
    "external_id",
    "SELECT f.external_id || '@' || f.year FROM opportunity_kinds f
     LEFT JOIN opportunities o ON o.external_id = f.external_id AND o.year = f.year
     WHERE o.external_id IS NULL",
  ),
  (
    "opportunity_kinds",
    "kind",
    "SELECT f.kind FROM opportunity_kinds f
     LEFT JOIN contract_kinds k ON k.name = f.kind WHERE k.name IS NULL",
  ),
  (
    "award_categories",
    "award_id",
    "SELECT f.award_id FROM award_categories f
     LEFT JOIN awards a ON a.award_id = f.award_id WHERE a.award_id IS NULL",
  ),
  (
    "award_categories",
    "code",
    "SELECT f.code FROM award_categories f
     LEFT JOIN coded_categories c ON c.code = f.code WHERE c.code IS NULL",
  ),
  (
    "award_kinds",
    "award_id",
    "SELECT f.award_id FROM award_kinds f
     LEFT JOIN awards a ON a.award_id = f.award_id WHERE a.award_id IS NULL",
  ),
  (
    "award_kinds",
    "kind",
    "SELECT f.kind FROM award_kinds f
     LEFT JOIN contract_kinds k ON k.name = f.kind WHERE k.name IS NULL",
  ),
  (
    "award_parties",
    "award_id",
    "SELECT f.award_id FROM award_parties f
     LEFT JOIN awards a ON a.award_id = f.award_id WHERE a.award_id IS NULL",
  ),
  (
    "award_parties",
    "tax_id",
    "SELECT f.tax_id FROM award_parties f
     LEFT JOIN entities e ON e.tax_id = f.tax_id WHERE e.tax_id IS NULL",
  ),
];

// ─── Store ───────────────────────────────────────────────────────────────────

/// A procurement store backed by a single SQLite file.
///
/// Cloning is cheap; the inner connection is reference-counted and every
/// clone shares the same database thread, so loads are serialised.
#[derive(Clone)]
pub struct SqliteStore {
  conn: tokio_rusqlite::Connection,
}

impl SqliteStore {
  /// Open (or create) a store at `path` and run schema initialisation.
  pub async fn open(path: impl AsRef<Path>) -> Result<Self> {
    let conn = tokio_rusqlite::Connection::open(path).await?;
    let store = Self { conn };
    store.init_schema().await?;
    Ok(store)
  }

  /// Open an in-memory store; useful for testing.
  pub async fn open_in_memory() -> Result<Self> {
    let conn = tokio_rusqlite::Connection::open_in_memory().await?;
    let store = Self { conn };
    store.init_schema().await?;
    Ok(store)
  }

  async fn init_schema(&self) -> Result<()> {
    let kinds: Vec<String> = ContractKind::iter().map(|k| k.to_string()).collect();
    self
      .conn
      .call(move |conn| {
        conn.busy_timeout(BUSY_TIMEOUT)?;
        conn.execute_batch(SCHEMA)?;
        for kind in &kinds {
          conn.execute(
            "INSERT INTO contract_kinds (name) VALUES (?1) ON CONFLICT DO NOTHING",
            params![kind],
          )?;
        }
        Ok(())
      })
      .await?;
    Ok(())
  }

  // ── Reads ─────────────────────────────────────────────────────────────

  pub async fn entity(&self, tax_id: &TaxId) -> Result<Option<ReferenceEntity>> {
    let id = tax_id.to_string();
    let raw: Option<RawEntity> = self
      .conn
      .call(move |conn| {
        Ok(
          conn
            .query_row(
              &format!("SELECT {} FROM entities WHERE tax_id = ?1", RawEntity::COLUMNS),
              params![id],
              RawEntity::from_row,
            )
            .optional()?,
        )
      })
      .await?;
    raw.map(RawEntity::into_entity).transpose()
  }

  pub async fn opportunity(&self, key: &OpportunityKey) -> Result<Option<Opportunity>> {
    let (id, year) = (key.external_id.clone(), key.year);
    let raw: Option<RawOpportunity> = self
      .conn
      .call(move |conn| {
        Ok(
          conn
            .query_row(
              &format!(
                "SELECT {} FROM opportunities WHERE external_id = ?1 AND year = ?2",
                RawOpportunity::COLUMNS
              ),
              params![id, year],
              RawOpportunity::from_row,
            )
            .optional()?,
        )
      })
      .await?;
    raw.map(RawOpportunity::into_opportunity).transpose()
  }

  pub async fn award(&self, award_id: &str) -> Result<Option<StoredAward>> {
    let id = award_id.to_owned();
    let raw: Option<RawAward> = self
      .conn
      .call(move |conn| {
        Ok(
          conn
            .query_row(
              &format!("SELECT {} FROM awards WHERE award_id = ?1", RawAward::COLUMNS),
              params![id],
              RawAward::from_row,
            )
            .optional()?,
        )
      })
      .await?;
    raw.map(RawAward::into_stored).transpose()
  }

  /// Modifications recorded against an award, oldest first. Undated ones
  /// come last.
  pub async fn modifications(&self, award_id: &str) -> Result<Vec<Modification>> {
    let id = award_id.to_owned();
    let raw: Vec<RawModification> = self
      .conn
      .call(move |conn| {
        let mut stmt = conn.prepare(&format!(
          "SELECT {} FROM award_modifications WHERE award_id = ?1
           ORDER BY modified_on IS NULL, modified_on, modification_id",
          RawModification::COLUMNS
        ))?;
        let rows = stmt
          .query_map(params![id], RawModification::from_row)?
          .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
      })
      .await?;
    raw.into_iter().map(RawModification::into_modification).collect()
  }

  /// The parties on an award, sorted by tax id then role.
  pub async fn award_parties(&self, award_id: &str) -> Result<Vec<(TaxId, PartyRole)>> {
    let id = award_id.to_owned();
    let rows: Vec<(String, String)> = self
      .conn
      .call(move |conn| {
        let mut stmt = conn.prepare(
          "SELECT tax_id, role FROM award_parties WHERE award_id = ?1 ORDER BY tax_id, role",
        )?;
        let rows = stmt
          .query_map(params![id], |row| Ok((row.get(0)?, row.get(1)?)))?
          .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
      })
      .await?;

    rows
      .into_iter()
      .map(|(tax_id, role)| {
        let role = match role.as_str() {
          "winner" => PartyRole::Winner,
          "competitor" => PartyRole::Competitor,
          _ => return Err(Error::Decode { column: "award_parties.role", value: role }),
        };
        Ok((decode_tax_id("award_parties.tax_id", &tax_id)?, role))
      })
      .collect()
  }
}

// ─── ProcurementStore impl ───────────────────────────────────────────────────

impl ProcurementStore for SqliteStore {
  type Error = Error;

  // ── Loading ───────────────────────────────────────────────────────────

  async fn load(&self, batch: Batch, limits: LoadLimits) -> Result<CommitReport> {
    let guard = Guard::new(limits.commit_timeout, limits.cancel);
    let page = batch.page;
    let outcome = self
      .conn
      .call(move |conn| Ok(loader::apply(conn, &batch, &guard)))
      .await?;

    match outcome {
      Ok(report) => {
        match page {
          Some(page) if report.already_committed => {
            tracing::debug!(%page, "page already committed, skipped");
          }
          Some(page) => tracing::debug!(
            %page,
            added = report.rows_added,
            updated = report.rows_updated,
            "page committed"
          ),
          None => tracing::debug!(added = report.rows_added, "batch committed"),
        }
        Ok(report)
      }
      Err(LoadError::Sqlite(e)) => Err(e.into()),
      Err(LoadError::Cancelled) => Err(Error::Cancelled),
      Err(LoadError::Timeout(limit)) => Err(Error::CommitTimeout(limit)),
    }
  }

  // ── Ledger ────────────────────────────────────────────────────────────

  async fn is_committed(&self, page: PageKey) -> Result<bool> {
    Ok(
      self
        .conn
        .call(move |conn| Ok(ledger::is_committed(conn, &page)?))
        .await?,
    )
  }

  async fn committed_indices(&self, source: Source, range: DateRange) -> Result<Vec<u32>> {
    Ok(
      self
        .conn
        .call(move |conn| Ok(ledger::committed_indices(conn, source, range)?))
        .await?,
    )
  }

  async fn is_range_complete(&self, source: Source, range: DateRange) -> Result<bool> {
    Ok(
      self
        .conn
        .call(move |conn| Ok(ledger::is_range_complete(conn, source, range)?))
        .await?,
    )
  }

  async fn complete_range(
    &self,
    source: Source,
    range: DateRange,
    page_count: u32,
  ) -> Result<bool> {
    let now = encode_dt(Utc::now());
    Ok(
      self
        .conn
        .call(move |conn| {
          Ok(ledger::complete_range(conn, source, range, page_count, &now)?)
        })
        .await?,
    )
  }

  async fn watermark(&self, source: Source) -> Result<Option<NaiveDate>> {
    let end = self
      .conn
      .call(move |conn| Ok(ledger::watermark(conn, source)?))
      .await?;
    end.as_deref().map(|s| decode_date("range_ledger.range_end", s)).transpose()
  }

  async fn record_failure(&self, page: PageKey, error: String) -> Result<()> {
    let now = encode_dt(Utc::now());
    self
      .conn
      .call(move |conn| Ok(ledger::record_failure(conn, &page, &error, &now)?))
      .await?;
    Ok(())
  }

  async fn failed_pages(&self) -> Result<Vec<FailedPage>> {
    let raws = self
      .conn
      .call(|conn| Ok(ledger::failed_pages(conn)?))
      .await?;
    raws.into_iter().map(|r| r.into_failed()).collect()
  }

  // ── Inspection ────────────────────────────────────────────────────────

  async fn row_counts(&self) -> Result<RowCounts> {
    Ok(
      self
        .conn
        .call(|conn| {
          let count = |table: &str| -> rusqlite::Result<u64> {
            conn
              .query_row(&format!("SELECT count(*) FROM {table}"), [], |row| {
                row.get::<_, i64>(0)
              })
              .map(|n| n.max(0) as u64)
          };
          Ok(RowCounts {
            entities:               count("entities")?,
            coded_categories:       count("coded_categories")?,
            contract_kinds:         count("contract_kinds")?,
            opportunities:          count("opportunities")?,
            awards:                 count("awards")?,
            opportunity_categories: count("opportunity_categories")?,
            opportunity_kinds:      count("opportunity_kinds")?,
            award_categories:       count("award_categories")?,
            award_kinds:            count("award_kinds")?,
            award_parties:          count("award_parties")?,
            award_modifications:    count("award_modifications")?,
          })
        })
        .await?,
    )
  }

  async fn integrity_scan(&self) -> Result<IntegrityReport> {
    Ok(
      self
        .conn
        .call(|conn| {
          let mut dangling = Vec::new();
          for &(table, column, sql) in FOREIGN_KEYS {
            let mut stmt = conn.prepare(sql)?;
            let values = stmt
              .query_map([], |row| row.get::<_, String>(0))?
              .collect::<rusqlite::Result<Vec<_>>>()?;
            dangling.extend(
              values
                .into_iter()
                .map(|value| DanglingReference { table, column, value }),
            );
          }
          Ok(IntegrityReport { dangling })
        })
        .await?,
    )
  }

  async fn pending_stubs(&self, limit: usize) -> Result<Vec<EntityStub>> {
    let limit = i64::try_from(limit).unwrap_or(i64::MAX);
    let rows: Vec<(String, Option<String>)> = self
      .conn
      .call(move |conn| {
        let mut stmt = conn.prepare(
          "SELECT tax_id, name FROM entities
           WHERE freshness = 0
           ORDER BY updated_at, tax_id
           LIMIT ?1",
        )?;
        let rows = stmt
          .query_map(params![limit], |row| Ok((row.get(0)?, row.get(1)?)))?
          .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
      })
      .await?;

    rows
      .into_iter()
      .map(|(tax_id, name)| {
        Ok(EntityStub { tax_id: decode_tax_id("entities.tax_id", &tax_id)?, name })
      })
      .collect()
  }
}
