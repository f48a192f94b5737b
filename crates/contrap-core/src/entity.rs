//! Reference entities: the organisations that issue, win, or compete for
//! public contracts.
//!
//! An entity has no notion of the role it plays. Whether an organisation is a
//! winner or a competitor on a given award is a property of the association
//! edge (see [`crate::fragment::PartyRole`]), not of the entity row.

use std::{fmt, str::FromStr};

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::{Error, Result};

// ─── Tax identifier ──────────────────────────────────────────────────────────

/// Length of a Portuguese tax identifier (NIF / NIPC).
pub const TAX_ID_LEN: usize = 9;

/// Leading digits assigned to individuals and legal persons. `0` and `4` are
/// never issued.
pub const ALLOWED_LEADING_DIGITS: &[u8] = b"12356789";

/// A format-validated tax identifier: nine ASCII digits with an allowed
/// leading digit.
#[derive(
  Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(try_from = "String", into = "String")]
pub struct TaxId(String);

impl TaxId {
  /// Format check only. Use [`TaxId::has_valid_check_digit`] for the mod-11
  /// checksum.
  pub fn is_valid(s: &str) -> bool {
    let bytes = s.as_bytes();
    bytes.len() == TAX_ID_LEN
      && bytes.iter().all(u8::is_ascii_digit)
      && ALLOWED_LEADING_DIGITS.contains(&bytes[0])
  }

  /// Parse after trimming surrounding whitespace. Returns `None` for anything
  /// that fails [`TaxId::is_valid`].
  pub fn parse(s: &str) -> Option<Self> {
    let trimmed = s.trim();
    Self::is_valid(trimmed).then(|| Self(trimmed.to_owned()))
  }

  /// The mod-11 check digit used by the Portuguese tax authority.
  pub fn has_valid_check_digit(&self) -> bool {
    let digits: Vec<u32> = self.0.bytes().map(|b| u32::from(b - b'0')).collect();
    let sum: u32 = digits[..8]
      .iter()
      .enumerate()
      .map(|(i, d)| d * (9 - i as u32))
      .sum();
    let check = match 11 - (sum % 11) {
      c if c >= 10 => 0,
      c => c,
    };
    digits[8] == check
  }

  pub fn as_str(&self) -> &str { &self.0 }
}

impl fmt::Display for TaxId {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(&self.0)
  }
}

impl FromStr for TaxId {
  type Err = Error;

  fn from_str(s: &str) -> Result<Self> {
    Self::parse(s).ok_or_else(|| Error::InvalidTaxId(s.to_owned()))
  }
}

impl TryFrom<String> for TaxId {
  type Error = Error;

  fn try_from(s: String) -> Result<Self> { s.parse() }
}

impl From<TaxId> for String {
  fn from(id: TaxId) -> Self { id.0 }
}

// ─── Freshness ───────────────────────────────────────────────────────────────

/// How much the store knows about an entity. Ordered: a write never lowers
/// the freshness of an existing row.
#[derive(
  Debug,
  Clone,
  Copy,
  PartialEq,
  Eq,
  PartialOrd,
  Ord,
  Default,
  Serialize,
  Deserialize,
)]
#[serde(rename_all = "lowercase")]
pub enum Freshness {
  /// Seen only as a counterparty; name at best.
  #[default]
  Stub,
  /// Populated from the dedicated entity endpoint.
  Enriched,
}

impl Freshness {
  /// Integer rank stored in the database; comparisons happen in SQL.
  pub fn rank(self) -> i64 {
    match self {
      Self::Stub => 0,
      Self::Enriched => 1,
    }
  }

  pub fn from_rank(rank: i64) -> Self {
    if rank >= 1 { Self::Enriched } else { Self::Stub }
  }
}

// ─── Entity ──────────────────────────────────────────────────────────────────

/// Aggregate counters, maintained by the store from award associations.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntityCounters {
  pub contracts_won:    u64,
  pub contracts_issued: u64,
  pub total_won:        Decimal,
  pub total_issued:     Decimal,
}

/// An organisation keyed by its tax identifier.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReferenceEntity {
  pub tax_id:      TaxId,
  pub name:        Option<String>,
  pub country:     Option<String>,
  pub address:     Option<String>,
  pub postal_code: Option<String>,
  pub locality:    Option<String>,
  pub entity_type: Option<String>,
  pub freshness:   Freshness,
  /// Ignored on write; the store recomputes counters itself.
  pub counters:    EntityCounters,
}

impl ReferenceEntity {
  /// An enriched entity with every optional attribute unset.
  pub fn enriched(tax_id: TaxId, name: Option<String>) -> Self {
    Self { freshness: Freshness::Enriched, ..Self::stub(tax_id, name) }
  }

  /// A stub-freshness entity. Loading one never changes an existing row's
  /// attributes; it only bumps its update time.
  pub fn stub(tax_id: TaxId, name: Option<String>) -> Self {
    Self {
      tax_id,
      name,
      country: None,
      address: None,
      postal_code: None,
      locality: None,
      entity_type: None,
      freshness: Freshness::Stub,
      counters: EntityCounters::default(),
    }
  }
}

/// A placeholder discovered while transforming a record. The loader decides
/// whether it creates a row, fills in a missing name, or is ignored because a
/// fresher row exists.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct EntityStub {
  pub tax_id: TaxId,
  pub name:   Option<String>,
}
