//! The output of the transformer: root rows, lookup rows, association
//! fragments and entity stubs, grouped into batches for the loader.

use serde::{Deserialize, Serialize};

use crate::{
  entity::{EntityStub, ReferenceEntity, TaxId},
  ledger::PageKey,
  procurement::{Award, CodedCategory, ContractKind, Modification, Opportunity, OpportunityKey},
  warning::FieldWarning,
};

/// The role an entity plays on an award. Lives on the edge, never on the
/// entity.
#[derive(
  Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "lowercase")]
pub enum PartyRole {
  Winner,
  Competitor,
}

impl PartyRole {
  pub fn as_str(self) -> &'static str {
    match self {
      Self::Winner => "winner",
      Self::Competitor => "competitor",
    }
  }
}

/// One edge of a many-to-many relation. Its identity is the key pair (plus
/// role for parties); inserting the same fragment twice is a no-op.
#[derive(
  Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(tag = "edge", rename_all = "snake_case")]
pub enum AssociationFragment {
  OpportunityCategory { opportunity: OpportunityKey, code: String },
  OpportunityKind { opportunity: OpportunityKey, kind: ContractKind },
  AwardCategory { award_id: String, code: String },
  AwardKind { award_id: String, kind: ContractKind },
  AwardParty { award_id: String, tax_id: TaxId, role: PartyRole },
}

/// The row a record is about.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RootEntity {
  Opportunity(Opportunity),
  Award(Award),
  Modification(Modification),
  Entity(ReferenceEntity),
}

/// Everything derived from one valid record. `root` is `None` for records
/// that had no usable primary key; their stubs and lookups are still loaded.
#[derive(Debug, Clone, Default, Serialize)]
pub struct Transformed {
  pub root:       Option<RootEntity>,
  pub categories: Vec<CodedCategory>,
  pub kinds:      Vec<ContractKind>,
  pub fragments:  Vec<AssociationFragment>,
  pub stubs:      Vec<EntityStub>,
  pub warnings:   Vec<FieldWarning>,
}

/// The unit of atomic commit. `page` is `None` for ad-hoc loads that do not
/// touch the ledger (e.g. single-entity enrichment).
#[derive(Debug, Clone, Default, Serialize)]
pub struct Batch {
  pub page:    Option<PageKey>,
  /// Hex SHA-256 of the raw page payload, recorded with the ledger mark.
  pub digest:  Option<String>,
  pub records: Vec<Transformed>,
}

impl Batch {
  pub fn for_page(page: PageKey, digest: Option<String>) -> Self {
    Self { page: Some(page), digest, records: Vec::new() }
  }

  pub fn len(&self) -> usize { self.records.len() }

  pub fn is_empty(&self) -> bool { self.records.is_empty() }
}
