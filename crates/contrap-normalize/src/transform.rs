//! Typed record → root row, lookup rows, association fragments and entity
//! stubs.
//!
//! Output is deterministic: lookups, fragments and stubs come out sorted and
//! de-duplicated, so the same record always yields the same batch contents.

use std::collections::{BTreeMap, BTreeSet};

use contrap_core::{
  entity::{EntityStub, TaxId},
  fragment::{AssociationFragment, PartyRole, RootEntity, Transformed},
  procurement::{CodedCategory, ContractKind},
  warning::{FieldWarning, WarningKind},
};

use crate::{
  lists::Party,
  normalize::{
    NormalizeOptions, UnkeyedRecord, ValidAward, ValidOpportunity, ValidRecord,
    normalize_with,
  },
  raw::RawRecord,
};

/// Normalize then transform, with the normalizer's warnings first.
pub fn process(raw: &RawRecord, opts: &NormalizeOptions) -> Transformed {
  let normalized = normalize_with(raw, opts);
  let mut out = transform(normalized.record);
  let mut warnings = normalized.warnings;
  warnings.append(&mut out.warnings);
  out.warnings = warnings;
  out
}

pub fn transform(record: ValidRecord) -> Transformed {
  match record {
    ValidRecord::Opportunity(o) => opportunity(o),
    ValidRecord::Award(a) => award(a),
    ValidRecord::Modification(m) => Transformed {
      root: Some(RootEntity::Modification(m)),
      ..Default::default()
    },
    ValidRecord::Entity(e) => Transformed {
      root: Some(RootEntity::Entity(e)),
      ..Default::default()
    },
    ValidRecord::Unkeyed(u) => unkeyed(u),
  }
}

// ─── Accumulators ────────────────────────────────────────────────────────────

#[derive(Default)]
struct Stubs(BTreeMap<TaxId, Option<String>>);

impl Stubs {
  /// The first non-empty name seen for an identifier wins.
  fn add(&mut self, tax_id: TaxId, name: Option<String>) {
    let slot = self.0.entry(tax_id).or_default();
    if slot.is_none() {
      *slot = name;
    }
  }

  fn add_party(&mut self, party: &Party) {
    self.add(party.tax_id.clone(), party.name.clone());
  }

  fn into_vec(self) -> Vec<EntityStub> {
    self
      .0
      .into_iter()
      .map(|(tax_id, name)| EntityStub { tax_id, name })
      .collect()
  }
}

/// Categories keyed by code. The first description seen wins.
fn dedup_categories(categories: Vec<CodedCategory>) -> Vec<CodedCategory> {
  let mut by_code: BTreeMap<String, CodedCategory> = BTreeMap::new();
  for category in categories {
    match by_code.get_mut(&category.code) {
      Some(existing) => {
        if existing.description.is_none() {
          existing.description = category.description;
        }
        if existing.check_digit.is_none() {
          existing.check_digit = category.check_digit;
        }
      }
      None => {
        by_code.insert(category.code.clone(), category);
      }
    }
  }
  by_code.into_values().collect()
}

fn resolve_kinds(
  labels: &[String],
  field: &'static str,
  warnings: &mut Vec<FieldWarning>,
) -> BTreeSet<ContractKind> {
  let mut kinds = BTreeSet::new();
  for label in labels {
    match ContractKind::resolve(label) {
      Some(kind) => {
        kinds.insert(kind);
      }
      None => warnings.push(FieldWarning::with_value(
        field,
        WarningKind::UnknownContractKind,
        label.clone(),
      )),
    }
  }
  kinds
}

// ─── Per record type ─────────────────────────────────────────────────────────

fn opportunity(o: ValidOpportunity) -> Transformed {
  let mut warnings = Vec::new();
  let categories = dedup_categories(o.categories);
  let kinds = resolve_kinds(&o.kind_labels, "tiposContrato", &mut warnings);
  let key = &o.opportunity.key;

  let mut fragments = BTreeSet::new();
  for category in &categories {
    fragments.insert(AssociationFragment::OpportunityCategory {
      opportunity: key.clone(),
      code:        category.code.clone(),
    });
  }
  for kind in &kinds {
    fragments.insert(AssociationFragment::OpportunityKind {
      opportunity: key.clone(),
      kind:        *kind,
    });
  }

  let mut stubs = Stubs::default();
  if let Some(issuer) = &o.opportunity.issuer {
    stubs.add(issuer.clone(), o.issuer_name);
  }

  Transformed {
    root: Some(RootEntity::Opportunity(o.opportunity)),
    categories,
    kinds: kinds.into_iter().collect(),
    fragments: fragments.into_iter().collect(),
    stubs: stubs.into_vec(),
    warnings,
  }
}

fn award(a: ValidAward) -> Transformed {
  let mut warnings = Vec::new();
  let categories = dedup_categories(a.categories);
  let kinds = resolve_kinds(&a.kind_labels, "tipoContrato", &mut warnings);
  let id = &a.award.id;

  let mut fragments = BTreeSet::new();
  for category in &categories {
    fragments.insert(AssociationFragment::AwardCategory {
      award_id: id.clone(),
      code:     category.code.clone(),
    });
  }
  for kind in &kinds {
    fragments.insert(AssociationFragment::AwardKind {
      award_id: id.clone(),
      kind:     *kind,
    });
  }

  let mut stubs = Stubs::default();
  if let Some(issuer) = &a.award.issuer {
    stubs.add(issuer.clone(), a.issuer_name);
  }
  let parties = a
    .winners
    .iter()
    .map(|p| (p, PartyRole::Winner))
    .chain(a.competitors.iter().map(|p| (p, PartyRole::Competitor)));
  for (party, role) in parties {
    stubs.add_party(party);
    fragments.insert(AssociationFragment::AwardParty {
      award_id: id.clone(),
      tax_id: party.tax_id.clone(),
      role,
    });
  }

  Transformed {
    root: Some(RootEntity::Award(a.award)),
    categories,
    kinds: kinds.into_iter().collect(),
    fragments: fragments.into_iter().collect(),
    stubs: stubs.into_vec(),
    warnings,
  }
}

fn unkeyed(u: UnkeyedRecord) -> Transformed {
  let mut stubs = Stubs::default();
  for party in &u.parties {
    stubs.add_party(party);
  }
  Transformed {
    root: None,
    categories: dedup_categories(u.categories),
    stubs: stubs.into_vec(),
    ..Default::default()
  }
}

#[cfg(test)]
mod tests {
  use contrap_core::ledger::Source;
  use serde_json::json;

  use super::*;

  fn run(source: Source, v: serde_json::Value) -> Transformed {
    process(&RawRecord::decode(source, &v), &NormalizeOptions::default())
  }

  #[test]
  fn opportunity_fragments_are_sorted_and_unique() {
    let t = run(Source::Announcements, json!({
      "nAnuncio": "3/2024",
      "nifEntidade": "500000000",
      "designacaoEntidade": "Município",
      "CPVs": [
        "71000000-8 - Serviços de arquitectura",
        "45000000-7 - Obras",
        "45000000-7",
      ],
      "tiposContrato": ["Empreitadas de Obras Públicas", "Aquisição de Serviços", "empreitada"],
    }));
    assert!(t.warnings.is_empty(), "{:?}", t.warnings);
    let codes: Vec<_> = t.categories.iter().map(|c| c.code.as_str()).collect();
    assert_eq!(codes, ["45000000", "71000000"]);
    assert_eq!(
      t.kinds,
      vec![ContractKind::ServicesAcquisition, ContractKind::PublicWorks]
    );
    assert_eq!(t.fragments.len(), 4);
    let mut sorted = t.fragments.clone();
    sorted.sort();
    assert_eq!(sorted, t.fragments);
    assert_eq!(t.stubs.len(), 1);
    assert_eq!(t.stubs[0].name.as_deref(), Some("Município"));
  }

  #[test]
  fn unknown_contract_kind_is_dropped_with_warning() {
    let t = run(Source::Announcements, json!({
      "nAnuncio": "3/2024",
      "nifEntidade": "500000000",
      "tiposContrato": ["Parceria estratégica"],
    }));
    assert!(t.kinds.is_empty());
    assert!(t.fragments.is_empty());
    assert_eq!(t.warnings.len(), 1);
    assert_eq!(t.warnings[0].kind, WarningKind::UnknownContractKind);
  }

  #[test]
  fn winner_and_competitor_keep_both_edges() {
    let t = run(Source::Contracts, json!({
      "idcontrato": "9",
      "nifEntidade": "500000000",
      "adjudicatarios": ["512021155 - Construtora"],
      "concorrentes": ["512021155-Construtora SA", "600000000 - Outra"],
    }));
    let roles: Vec<_> = t
      .fragments
      .iter()
      .filter_map(|f| match f {
        AssociationFragment::AwardParty { tax_id, role, .. } => {
          Some((tax_id.as_str(), *role))
        }
        _ => None,
      })
      .collect();
    assert_eq!(
      roles,
      vec![
        ("512021155", PartyRole::Winner),
        ("512021155", PartyRole::Competitor),
        ("600000000", PartyRole::Competitor),
      ]
    );
    // issuer + two distinct parties
    assert_eq!(t.stubs.len(), 3);
    let stub = t.stubs.iter().find(|s| s.tax_id.as_str() == "512021155").unwrap();
    assert_eq!(stub.name.as_deref(), Some("Construtora"));
  }

  #[test]
  fn every_reference_has_a_stub() {
    let t = run(Source::Contracts, json!({
      "idcontrato": "9",
      "adjudicante": ["500000000 - Câmara"],
      "adjudicatarios": ["512021155 - Construtora"],
    }));
    let stubbed: BTreeSet<_> = t.stubs.iter().map(|s| s.tax_id.clone()).collect();
    let Some(RootEntity::Award(a)) = &t.root else { panic!("no award") };
    assert!(stubbed.contains(a.issuer.as_ref().unwrap()));
    for f in &t.fragments {
      if let AssociationFragment::AwardParty { tax_id, .. } = f {
        assert!(stubbed.contains(tax_id));
      }
    }
  }

  #[test]
  fn unkeyed_record_keeps_lookups_and_stubs() {
    let t = run(Source::Contracts, json!({
      "nifEntidade": "500000000",
      "cpv": ["45000000-7 - Obras"],
    }));
    assert!(t.root.is_none());
    assert!(t.fragments.is_empty());
    assert_eq!(t.categories.len(), 1);
    assert_eq!(t.stubs.len(), 1);
    assert_eq!(t.warnings.len(), 1);
    assert_eq!(t.warnings[0].kind, WarningKind::MissingKey);
  }

  #[test]
  fn modification_is_a_bare_root() {
    let t = run(Source::Modifications, json!({
      "idContrato": "9",
      "dataModificacao": "2024-06-03",
      "valorNovo": "1500",
    }));
    let Some(RootEntity::Modification(m)) = &t.root else { panic!("no modification") };
    assert_eq!(m.award_id, "9");
    assert!(t.fragments.is_empty());
    assert!(t.stubs.is_empty());
    assert!(t.categories.is_empty());
  }

  #[test]
  fn same_input_same_output() {
    let v = json!({
      "idcontrato": "9",
      "nifEntidade": "500000000",
      "concorrentes": ["600000000 - B", "512021155 - A"],
      "cpv": ["71000000-8", "45000000-7"],
    });
    let a = run(Source::Contracts, v.clone());
    let b = run(Source::Contracts, v);
    assert_eq!(a.fragments, b.fragments);
    assert_eq!(a.stubs, b.stubs);
    assert_eq!(a.categories, b.categories);
  }
}
