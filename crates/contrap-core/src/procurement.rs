//! Opportunities, awards and the lookup vocabularies they reference.

use std::fmt;

use chrono::NaiveDate;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use strum::{AsRefStr, Display, EnumIter, EnumString, IntoEnumIterator};

use crate::entity::TaxId;

// ─── Opportunity ─────────────────────────────────────────────────────────────

/// Natural key of a published procurement notice.
#[derive(
  Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct OpportunityKey {
  pub external_id: String,
  pub year:        i32,
}

impl fmt::Display for OpportunityKey {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(f, "{}@{}", self.external_id, self.year)
  }
}

/// A published call for tenders.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Opportunity {
  pub key:                    OpportunityKey,
  pub publication_date:       Option<NaiveDate>,
  pub issuer:                 Option<TaxId>,
  pub title:                  Option<String>,
  pub description:            Option<String>,
  pub base_price:             Option<Decimal>,
  /// Submission window in days. Authoritative over `submission_deadline`.
  pub deadline_days:          Option<u32>,
  pub submission_deadline:    Option<NaiveDate>,
  pub environmental_criteria: bool,
  pub procedure_type:         Option<String>,
  pub url:                    Option<String>,
}

/// The reference an award carries to the notice it resulted from. The
/// upstream writes these as `"<n>/<year>"`; the year part is optional.
#[derive(
  Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct OpportunityRef {
  pub external_id: String,
  pub year:        Option<i32>,
}

impl OpportunityRef {
  pub fn parse(raw: &str) -> Option<Self> {
    let raw = raw.trim();
    if raw.is_empty() {
      return None;
    }
    let year = raw
      .rsplit_once('/')
      .and_then(|(_, y)| y.trim().parse::<i32>().ok())
      .filter(|y| (1900..=9999).contains(y));
    Some(Self { external_id: raw.to_owned(), year })
  }
}

impl fmt::Display for OpportunityRef {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(&self.external_id)
  }
}

// ─── Award ───────────────────────────────────────────────────────────────────

/// A concluded contract.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Award {
  pub id:               String,
  pub opportunity_ref:  Option<OpportunityRef>,
  pub issuer:           Option<TaxId>,
  pub description:      Option<String>,
  pub procedure_type:   Option<String>,
  pub location:         Option<String>,
  pub legal_basis:      Option<String>,
  pub contract_price:   Option<Decimal>,
  pub base_price:       Option<Decimal>,
  pub publication_date: Option<NaiveDate>,
  pub signing_date:     Option<NaiveDate>,
  pub decision_date:    Option<NaiveDate>,
  pub closure_date:     Option<NaiveDate>,
  pub execution_days:   Option<u32>,
}

// ─── Modification ────────────────────────────────────────────────────────────

/// An amendment to a concluded contract. It may change the contract value,
/// the execution deadline, or neither.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Modification {
  /// The upstream identifier when one is published, otherwise
  /// [`Modification::derived_id`].
  pub id:                String,
  /// The award this modification amends. Not required to exist yet.
  pub award_id:          String,
  pub modified_on:       Option<NaiveDate>,
  pub kind:              Option<String>,
  pub description:       Option<String>,
  pub justification:     Option<String>,
  pub original_value:    Option<Decimal>,
  pub new_value:         Option<Decimal>,
  pub original_deadline: Option<NaiveDate>,
  pub new_deadline:      Option<NaiveDate>,
}

impl Modification {
  /// A stable identity for modifications published without one: the same
  /// amendment always maps to the same id.
  pub fn derived_id(
    award_id: &str,
    modified_on: Option<NaiveDate>,
    kind: Option<&str>,
    new_value: Option<&Decimal>,
    new_deadline: Option<NaiveDate>,
  ) -> String {
    let part = |v: Option<String>| v.unwrap_or_default();
    format!(
      "{award_id}:{}:{}:{}:{}",
      part(modified_on.map(|d| d.to_string())),
      part(kind.map(str::to_owned)),
      part(new_value.map(|v| v.normalize().to_string())),
      part(new_deadline.map(|d| d.to_string())),
    )
  }
}

// ─── Coded category ──────────────────────────────────────────────────────────

/// An entry of the common procurement vocabulary (CPV).
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct CodedCategory {
  /// Always eight ASCII digits.
  pub code:        String,
  pub check_digit: Option<u8>,
  pub description: Option<String>,
}

impl CodedCategory {
  pub const CODE_LEN: usize = 8;

  pub fn is_valid_code(code: &str) -> bool {
    code.len() == Self::CODE_LEN && code.bytes().all(|b| b.is_ascii_digit())
  }

  /// The significant part of the code: trailing zeros stripped, never shorter
  /// than the two-digit division.
  pub fn prefix(&self) -> &str { category_prefix(&self.code) }
}

pub fn category_prefix(code: &str) -> &str {
  let trimmed = code.trim_end_matches('0');
  if trimmed.len() < 2 {
    code.get(..2).unwrap_or(code)
  } else {
    trimmed
  }
}

// ─── Contract kind ───────────────────────────────────────────────────────────

/// The closed set of contract categories used by Portuguese public
/// procurement. Serialised as the canonical Portuguese label.
#[derive(
  Debug,
  Clone,
  Copy,
  PartialEq,
  Eq,
  PartialOrd,
  Ord,
  Hash,
  Display,
  EnumString,
  EnumIter,
  AsRefStr,
  Serialize,
  Deserialize,
)]
pub enum ContractKind {
  #[strum(serialize = "Aquisição de Bens Móveis")]
  #[serde(rename = "Aquisição de Bens Móveis")]
  GoodsAcquisition,
  #[strum(serialize = "Aquisição de Serviços")]
  #[serde(rename = "Aquisição de Serviços")]
  ServicesAcquisition,
  #[strum(serialize = "Empreitadas de Obras Públicas")]
  #[serde(rename = "Empreitadas de Obras Públicas")]
  PublicWorks,
  #[strum(serialize = "Concessão de Obras Públicas")]
  #[serde(rename = "Concessão de Obras Públicas")]
  PublicWorksConcession,
  #[strum(serialize = "Concessão de Serviços Públicos")]
  #[serde(rename = "Concessão de Serviços Públicos")]
  PublicServicesConcession,
  #[strum(serialize = "Locação de Bens Móveis")]
  #[serde(rename = "Locação de Bens Móveis")]
  GoodsLease,
  #[strum(serialize = "Contrato de Sociedade")]
  #[serde(rename = "Contrato de Sociedade")]
  Partnership,
  #[strum(serialize = "Outros")]
  #[serde(rename = "Outros")]
  Other,
}

impl ContractKind {
  /// Resolve a free-text label: exact match, then case-insensitive match,
  /// then keyword. Returns `None` when nothing fits.
  pub fn resolve(label: &str) -> Option<Self> {
    let label = label.trim();
    if label.is_empty() {
      return None;
    }
    if let Ok(kind) = label.parse::<Self>() {
      return Some(kind);
    }
    let lower = label.to_lowercase();
    if let Some(kind) = Self::iter().find(|k| k.as_ref().to_lowercase() == lower)
    {
      return Some(kind);
    }
    Self::by_keyword(&lower)
  }

  fn by_keyword(lower: &str) -> Option<Self> {
    if lower.contains("concessão") || lower.contains("concessao") {
      return Some(if lower.contains("obra") {
        Self::PublicWorksConcession
      } else {
        Self::PublicServicesConcession
      });
    }
    if lower.contains("empreitada") || lower.contains("obras") {
      return Some(Self::PublicWorks);
    }
    if lower.contains("locação") || lower.contains("locacao") || lower.contains("aluguer") {
      return Some(Self::GoodsLease);
    }
    if lower.contains("serviço") || lower.contains("servico") {
      return Some(Self::ServicesAcquisition);
    }
    if lower.contains("bens") {
      return Some(Self::GoodsAcquisition);
    }
    if lower.contains("sociedade") {
      return Some(Self::Partnership);
    }
    None
  }
}
