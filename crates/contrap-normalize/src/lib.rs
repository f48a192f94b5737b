//! Normalizer and transformer for upstream procurement records.
//!
//! Converts raw JSON records into [`contrap_core`] domain types and then into
//! the root rows, lookup rows, association fragments and entity stubs the
//! loader writes. Pure synchronous; no HTTP or database dependencies.
//!
//! Neither stage can fail. Anything unusable in a record becomes a
//! [`FieldWarning`](contrap_core::warning::FieldWarning) and the rest of the
//! record goes through.
//!
//! # Quick start
//!
//! ```no_run
//! use contrap_core::ledger::Source;
//! use contrap_normalize::{NormalizeOptions, RawRecord, process};
//!
//! let json = serde_json::json!({ "nAnuncio": "1/2024", "nifEntidade": "512021155" });
//! let raw = RawRecord::decode(Source::Announcements, &json);
//! let out = process(&raw, &NormalizeOptions::default());
//! println!("{} stubs, {} warnings", out.stubs.len(), out.warnings.len());
//! ```

pub mod fields;
pub mod lists;
mod normalize;
pub mod raw;
mod transform;

pub use lists::Party;
pub use normalize::{
  NormalizeOptions, Normalized, UnkeyedRecord, ValidAward, ValidOpportunity,
  ValidRecord, normalize, normalize_with,
};
pub use raw::{RawRecord, RawValue};
pub use transform::{process, transform};
