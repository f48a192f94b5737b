//! Field-level warnings produced while normalizing and transforming records.

use serde::Serialize;
use strum::{AsRefStr, Display, EnumIter};

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
  EnumIter,
  AsRefStr,
  Serialize,
)]
#[strum(serialize_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum WarningKind {
  MissingKey,
  MissingIssuer,
  MissingYear,
  InvalidDate,
  InvalidTaxId,
  InvalidAmount,
  InvalidNumber,
  InvalidFlag,
  MalformedCategory,
  MalformedParty,
  UnknownContractKind,
  UnexpectedShape,
}

/// A single field that could not be used as-is. The record is still emitted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FieldWarning {
  pub field: &'static str,
  pub kind:  WarningKind,
  /// The offending raw value, when there was one.
  pub value: Option<String>,
}

impl FieldWarning {
  pub fn new(field: &'static str, kind: WarningKind) -> Self {
    Self { field, kind, value: None }
  }

  pub fn with_value(
    field: &'static str,
    kind: WarningKind,
    value: impl Into<String>,
  ) -> Self {
    Self { field, kind, value: Some(value.into()) }
  }
}
