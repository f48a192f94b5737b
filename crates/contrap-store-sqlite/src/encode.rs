//! Encoding and decoding helpers between domain types and the plain-text
//! representations stored in SQLite columns.
//!
//! The `Raw*` structs hold a row exactly as read, so that row mapping inside
//! `Connection::call` closures stays infallible and all parsing happens
//! afterwards, outside the database thread.

use std::str::FromStr;

use chrono::{DateTime, NaiveDate, Utc};
use contrap_core::{
  entity::{EntityCounters, Freshness, ReferenceEntity, TaxId},
  ledger::{DateRange, FailedPage, PageKey, Source},
  procurement::{Award, Modification, Opportunity, OpportunityKey, OpportunityRef},
};
use rust_decimal::Decimal;

use crate::{Error, Result};

fn decode_err(column: &'static str, value: &str) -> Error {
  Error::Decode { column, value: value.to_owned() }
}

// ─── Scalars ─────────────────────────────────────────────────────────────────

pub fn encode_date(d: NaiveDate) -> String { d.format("%Y-%m-%d").to_string() }

pub fn decode_date(column: &'static str, s: &str) -> Result<NaiveDate> {
  NaiveDate::parse_from_str(s, "%Y-%m-%d").map_err(|_| decode_err(column, s))
}

fn decode_opt_date(column: &'static str, s: Option<String>) -> Result<Option<NaiveDate>> {
  s.as_deref().map(|s| decode_date(column, s)).transpose()
}

pub fn encode_dt(dt: DateTime<Utc>) -> String { dt.to_rfc3339() }

pub fn decode_dt(column: &'static str, s: &str) -> Result<DateTime<Utc>> {
  DateTime::parse_from_rfc3339(s)
    .map(|dt| dt.with_timezone(&Utc))
    .map_err(|_| decode_err(column, s))
}

pub fn encode_decimal(d: &Decimal) -> String { d.normalize().to_string() }

pub fn decode_decimal(column: &'static str, s: &str) -> Result<Decimal> {
  Decimal::from_str(s).map_err(|_| decode_err(column, s))
}

fn decode_opt_decimal(column: &'static str, s: Option<String>) -> Result<Option<Decimal>> {
  s.as_deref().map(|s| decode_decimal(column, s)).transpose()
}

pub fn decode_tax_id(column: &'static str, s: &str) -> Result<TaxId> {
  TaxId::parse(s).ok_or_else(|| decode_err(column, s))
}

fn decode_opt_tax_id(column: &'static str, s: Option<String>) -> Result<Option<TaxId>> {
  s.as_deref().map(|s| decode_tax_id(column, s)).transpose()
}

pub fn decode_source(s: &str) -> Result<Source> {
  Source::from_str(s).map_err(|_| decode_err("source", s))
}

fn to_u32(column: &'static str, v: Option<i64>) -> Result<Option<u32>> {
  v.map(|v| u32::try_from(v).map_err(|_| decode_err(column, &v.to_string())))
    .transpose()
}

// ─── Entities ────────────────────────────────────────────────────────────────

pub struct RawEntity {
  pub tax_id:           String,
  pub name:             Option<String>,
  pub country:          Option<String>,
  pub address:          Option<String>,
  pub postal_code:      Option<String>,
  pub locality:         Option<String>,
  pub entity_type:      Option<String>,
  pub freshness:        i64,
  pub contracts_won:    i64,
  pub contracts_issued: i64,
  pub total_won:        String,
  pub total_issued:     String,
}

impl RawEntity {
  pub const COLUMNS: &'static str = "tax_id, name, country, address, postal_code, \
     locality, entity_type, freshness, contracts_won, contracts_issued, \
     total_won, total_issued";

  pub fn from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Self> {
    Ok(Self {
      tax_id:           row.get(0)?,
      name:             row.get(1)?,
      country:          row.get(2)?,
      address:          row.get(3)?,
      postal_code:      row.get(4)?,
      locality:         row.get(5)?,
      entity_type:      row.get(6)?,
      freshness:        row.get(7)?,
      contracts_won:    row.get(8)?,
      contracts_issued: row.get(9)?,
      total_won:        row.get(10)?,
      total_issued:     row.get(11)?,
    })
  }

  pub fn into_entity(self) -> Result<ReferenceEntity> {
    Ok(ReferenceEntity {
      tax_id:      decode_tax_id("entities.tax_id", &self.tax_id)?,
      name:        self.name,
      country:     self.country,
      address:     self.address,
      postal_code: self.postal_code,
      locality:    self.locality,
      entity_type: self.entity_type,
      freshness:   Freshness::from_rank(self.freshness),
      counters:    EntityCounters {
        contracts_won:    self.contracts_won.max(0) as u64,
        contracts_issued: self.contracts_issued.max(0) as u64,
        total_won:        decode_decimal("entities.total_won", &self.total_won)?,
        total_issued:     decode_decimal("entities.total_issued", &self.total_issued)?,
      },
    })
  }
}

// ─── Opportunities ───────────────────────────────────────────────────────────

pub struct RawOpportunity {
  pub external_id:            String,
  pub year:                   i32,
  pub publication_date:       Option<String>,
  pub issuer_tax_id:          Option<String>,
  pub title:                  Option<String>,
  pub description:            Option<String>,
  pub base_price:             Option<String>,
  pub deadline_days:          Option<i64>,
  pub submission_deadline:    Option<String>,
  pub environmental_criteria: bool,
  pub procedure_type:         Option<String>,
  pub url:                    Option<String>,
}

impl RawOpportunity {
  pub const COLUMNS: &'static str = "external_id, year, publication_date, \
     issuer_tax_id, title, description, base_price, deadline_days, \
     submission_deadline, environmental_criteria, procedure_type, url";

  pub fn from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Self> {
    Ok(Self {
      external_id:            row.get(0)?,
      year:                   row.get(1)?,
      publication_date:       row.get(2)?,
      issuer_tax_id:          row.get(3)?,
      title:                  row.get(4)?,
      description:            row.get(5)?,
      base_price:             row.get(6)?,
      deadline_days:          row.get(7)?,
      submission_deadline:    row.get(8)?,
      environmental_criteria: row.get(9)?,
      procedure_type:         row.get(10)?,
      url:                    row.get(11)?,
    })
  }

  pub fn into_opportunity(self) -> Result<Opportunity> {
    Ok(Opportunity {
      key:                    OpportunityKey {
        external_id: self.external_id,
        year:        self.year,
      },
      publication_date:       decode_opt_date(
        "opportunities.publication_date",
        self.publication_date,
      )?,
      issuer:                 decode_opt_tax_id(
        "opportunities.issuer_tax_id",
        self.issuer_tax_id,
      )?,
      title:                  self.title,
      description:            self.description,
      base_price:             decode_opt_decimal(
        "opportunities.base_price",
        self.base_price,
      )?,
      deadline_days:          to_u32("opportunities.deadline_days", self.deadline_days)?,
      submission_deadline:    decode_opt_date(
        "opportunities.submission_deadline",
        self.submission_deadline,
      )?,
      environmental_criteria: self.environmental_criteria,
      procedure_type:         self.procedure_type,
      url:                    self.url,
    })
  }
}

// ─── Awards ──────────────────────────────────────────────────────────────────

/// An award as stored, together with the opportunity it resolved to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredAward {
  pub award:       Award,
  /// `None` while the published reference has not matched an opportunity.
  pub opportunity: Option<OpportunityKey>,
}

pub struct RawAward {
  pub award_id:             String,
  pub opportunity_ref:      Option<String>,
  pub opportunity_ref_year: Option<i32>,
  pub opportunity_id:       Option<String>,
  pub opportunity_year:     Option<i32>,
  pub issuer_tax_id:        Option<String>,
  pub description:          Option<String>,
  pub procedure_type:       Option<String>,
  pub location:             Option<String>,
  pub legal_basis:          Option<String>,
  pub contract_price:       Option<String>,
  pub base_price:           Option<String>,
  pub publication_date:     Option<String>,
  pub signing_date:         Option<String>,
  pub decision_date:        Option<String>,
  pub closure_date:         Option<String>,
  pub execution_days:       Option<i64>,
}

impl RawAward {
  pub const COLUMNS: &'static str = "award_id, opportunity_ref, \
     opportunity_ref_year, opportunity_id, opportunity_year, issuer_tax_id, \
     description, procedure_type, location, legal_basis, contract_price, \
     base_price, publication_date, signing_date, decision_date, closure_date, \
     execution_days";

  pub fn from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Self> {
    Ok(Self {
      award_id:             row.get(0)?,
      opportunity_ref:      row.get(1)?,
      opportunity_ref_year: row.get(2)?,
      opportunity_id:       row.get(3)?,
      opportunity_year:     row.get(4)?,
      issuer_tax_id:        row.get(5)?,
      description:          row.get(6)?,
      procedure_type:       row.get(7)?,
      location:             row.get(8)?,
      legal_basis:          row.get(9)?,
      contract_price:       row.get(10)?,
      base_price:           row.get(11)?,
      publication_date:     row.get(12)?,
      signing_date:         row.get(13)?,
      decision_date:        row.get(14)?,
      closure_date:         row.get(15)?,
      execution_days:       row.get(16)?,
    })
  }

  pub fn into_stored(self) -> Result<StoredAward> {
    let opportunity = match (self.opportunity_id, self.opportunity_year) {
      (Some(external_id), Some(year)) => Some(OpportunityKey { external_id, year }),
      _ => None,
    };
    let opportunity_ref = self.opportunity_ref.map(|external_id| OpportunityRef {
      external_id,
      year: self.opportunity_ref_year,
    });

    let award = Award {
      id: self.award_id,
      opportunity_ref,
      issuer: decode_opt_tax_id("awards.issuer_tax_id", self.issuer_tax_id)?,
      description: self.description,
      procedure_type: self.procedure_type,
      location: self.location,
      legal_basis: self.legal_basis,
      contract_price: decode_opt_decimal("awards.contract_price", self.contract_price)?,
      base_price: decode_opt_decimal("awards.base_price", self.base_price)?,
      publication_date: decode_opt_date("awards.publication_date", self.publication_date)?,
      signing_date: decode_opt_date("awards.signing_date", self.signing_date)?,
      decision_date: decode_opt_date("awards.decision_date", self.decision_date)?,
      closure_date: decode_opt_date("awards.closure_date", self.closure_date)?,
      execution_days: to_u32("awards.execution_days", self.execution_days)?,
    };
    Ok(StoredAward { award, opportunity })
  }
}

// ─── Modifications ───────────────────────────────────────────────────────────

pub struct RawModification {
  pub modification_id:   String,
  pub award_id:          String,
  pub modified_on:       Option<String>,
  pub kind:              Option<String>,
  pub description:       Option<String>,
  pub justification:     Option<String>,
  pub original_value:    Option<String>,
  pub new_value:         Option<String>,
  pub original_deadline: Option<String>,
  pub new_deadline:      Option<String>,
}

impl RawModification {
  pub const COLUMNS: &'static str = "modification_id, award_id, modified_on, \
     kind, description, justification, original_value, new_value, \
     original_deadline, new_deadline";

  pub fn from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Self> {
    Ok(Self {
      modification_id:   row.get(0)?,
      award_id:          row.get(1)?,
      modified_on:       row.get(2)?,
      kind:              row.get(3)?,
      description:       row.get(4)?,
      justification:     row.get(5)?,
      original_value:    row.get(6)?,
      new_value:         row.get(7)?,
      original_deadline: row.get(8)?,
      new_deadline:      row.get(9)?,
    })
  }

  pub fn into_modification(self) -> Result<Modification> {
    Ok(Modification {
      id:                self.modification_id,
      award_id:          self.award_id,
      modified_on:       decode_opt_date("award_modifications.modified_on", self.modified_on)?,
      kind:              self.kind,
      description:       self.description,
      justification:     self.justification,
      original_value:    decode_opt_decimal(
        "award_modifications.original_value",
        self.original_value,
      )?,
      new_value:         decode_opt_decimal("award_modifications.new_value", self.new_value)?,
      original_deadline: decode_opt_date(
        "award_modifications.original_deadline",
        self.original_deadline,
      )?,
      new_deadline:      decode_opt_date(
        "award_modifications.new_deadline",
        self.new_deadline,
      )?,
    })
  }
}

// ─── Ledger ──────────────────────────────────────────────────────────────────

pub struct RawFailedPage {
  pub source:      String,
  pub range_start: String,
  pub range_end:   String,
  pub page_index:  i64,
  pub attempts:    i64,
  pub last_error:  Option<String>,
  pub updated_at:  String,
}

impl RawFailedPage {
  pub fn into_failed(self) -> Result<FailedPage> {
    let start = decode_date("page_ledger.range_start", &self.range_start)?;
    let end = decode_date("page_ledger.range_end", &self.range_end)?;
    let index = u32::try_from(self.page_index)
      .map_err(|_| decode_err("page_ledger.page_index", &self.page_index.to_string()))?;
    Ok(FailedPage {
      page:       PageKey {
        source: decode_source(&self.source)?,
        range: DateRange::new(start, end)?,
        index,
      },
      attempts:   self.attempts.max(0) as u32,
      last_error: self.last_error.unwrap_or_default(),
      updated_at: decode_dt("page_ledger.updated_at", &self.updated_at)?,
    })
  }
}
