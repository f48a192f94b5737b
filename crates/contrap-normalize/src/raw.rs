//! Raw records as they come off the wire.
//!
//! The upstream serves loosely-typed JSON whose field names drift between
//! endpoints and over time (`PrecoBase` vs `precoBase`, `idcontrato` vs
//! `idContrato`, …). Decoding resolves those variants once, here, into one
//! struct per source. Decoding never fails: unknown or missing fields simply
//! come out as [`RawValue::Absent`].

use std::collections::BTreeMap;

use chrono::NaiveDate;
use contrap_core::ledger::Source;
use serde_json::{Map, Number, Value};

use crate::fields::parse_date;

/// Strings the upstream uses to mean "no value".
pub const NULL_SENTINELS: &[&str] = &["NULL", "null", "N/A"];

// ─── Values ──────────────────────────────────────────────────────────────────

/// A JSON value after sentinel cleanup. Blank strings and sentinels become
/// `Absent`; lists drop absent items and collapse to `Absent` when empty.
#[derive(Debug, Clone, Default, PartialEq)]
pub enum RawValue {
  #[default]
  Absent,
  Text(String),
  Number(Number),
  Bool(bool),
  List(Vec<RawValue>),
  Object(BTreeMap<String, RawValue>),
}

impl RawValue {
  pub fn from_json(value: &Value) -> Self {
    match value {
      Value::Null => Self::Absent,
      Value::Bool(b) => Self::Bool(*b),
      Value::Number(n) => Self::Number(n.clone()),
      Value::String(s) => {
        let s = s.trim();
        if s.is_empty() || NULL_SENTINELS.contains(&s) {
          Self::Absent
        } else {
          Self::Text(s.to_owned())
        }
      }
      Value::Array(items) => {
        let items: Vec<_> = items
          .iter()
          .map(Self::from_json)
          .filter(|v| !v.is_absent())
          .collect();
        if items.is_empty() { Self::Absent } else { Self::List(items) }
      }
      Value::Object(map) => {
        let map: BTreeMap<_, _> = map
          .iter()
          .map(|(k, v)| (k.clone(), Self::from_json(v)))
          .filter(|(_, v)| !v.is_absent())
          .collect();
        if map.is_empty() { Self::Absent } else { Self::Object(map) }
      }
    }
  }

  pub fn is_absent(&self) -> bool { matches!(self, Self::Absent) }

  /// Scalars rendered as text. Lists and objects give `None`.
  pub fn scalar_text(&self) -> Option<String> {
    match self {
      Self::Text(s) => Some(s.clone()),
      Self::Number(n) => Some(n.to_string()),
      Self::Bool(b) => Some(b.to_string()),
      _ => None,
    }
  }

  /// The items of a list, or a lone scalar as a one-item list.
  pub fn items(&self) -> Vec<&RawValue> {
    match self {
      Self::Absent => Vec::new(),
      Self::List(items) => items.iter().collect(),
      other => vec![other],
    }
  }

  /// A short rendering for warning messages.
  pub fn describe(&self) -> String {
    match self {
      Self::Absent => String::new(),
      Self::List(items) => format!("[{} items]", items.len()),
      Self::Object(map) => format!("{{{} fields}}", map.len()),
      other => other.scalar_text().unwrap_or_default(),
    }
  }
}

/// The first of `names` that is present with a usable value.
fn pick(map: &Map<String, Value>, names: &[&str]) -> RawValue {
  names
    .iter()
    .filter_map(|n| map.get(*n))
    .map(RawValue::from_json)
    .find(|v| !v.is_absent())
    .unwrap_or_default()
}

// ─── Records ─────────────────────────────────────────────────────────────────

/// One record from the announcements endpoint.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RawAnnouncement {
  pub notice_number:          RawValue,
  pub incm_id:                RawValue,
  pub publication_date:       RawValue,
  pub issuer_tax_id:          RawValue,
  pub issuer_name:            RawValue,
  pub title:                  RawValue,
  pub description:            RawValue,
  pub url:                    RawValue,
  pub contract_kinds:         RawValue,
  pub base_price:             RawValue,
  pub categories:             RawValue,
  pub procedure_type:         RawValue,
  pub year:                   RawValue,
  pub environmental_criteria: RawValue,
  pub deadline_days:          RawValue,
  pub submission_deadline:    RawValue,
}

/// One record from the contracts endpoint.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RawContract {
  pub id:               RawValue,
  pub incm_id:          RawValue,
  pub opportunity_ref:  RawValue,
  pub title:            RawValue,
  pub description:      RawValue,
  pub issuer_tax_id:    RawValue,
  pub issuer_name:      RawValue,
  /// `["<tax-id> - <name>"]`
  pub issuer_parties:   RawValue,
  pub winner_tax_id:    RawValue,
  pub winner_name:      RawValue,
  pub winner_parties:   RawValue,
  pub competitors:      RawValue,
  pub publication_date: RawValue,
  pub signing_date:     RawValue,
  pub decision_date:    RawValue,
  pub closure_date:     RawValue,
  pub contract_price:   RawValue,
  pub base_price:       RawValue,
  pub categories:       RawValue,
  pub contract_kinds:   RawValue,
  pub execution_period: RawValue,
  pub location:         RawValue,
  pub legal_basis:      RawValue,
  pub procedure_type:   RawValue,
}

/// One record from the contract modifications endpoint.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RawModification {
  pub id:                RawValue,
  pub contract_id:       RawValue,
  pub publication_date:  RawValue,
  pub modified_on:       RawValue,
  pub kind:              RawValue,
  pub description:       RawValue,
  pub justification:     RawValue,
  pub original_value:    RawValue,
  pub new_value:         RawValue,
  pub original_deadline: RawValue,
  pub new_deadline:      RawValue,
}

/// One record from the entities endpoint.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RawEntity {
  pub tax_id:      RawValue,
  pub name:        RawValue,
  pub address:     RawValue,
  pub postal_code: RawValue,
  pub locality:    RawValue,
  pub country:     RawValue,
  pub entity_type: RawValue,
}

#[derive(Debug, Clone, PartialEq)]
pub enum RawRecord {
  Announcement(RawAnnouncement),
  Contract(RawContract),
  Modification(RawModification),
  Entity(RawEntity),
}

impl RawRecord {
  /// Decode one JSON value from `source`. Anything that is not an object
  /// decodes to a record with every field absent.
  pub fn decode(source: Source, value: &Value) -> Self {
    let empty = Map::new();
    let map = value.as_object().unwrap_or(&empty);
    match source {
      Source::Announcements => Self::Announcement(decode_announcement(map)),
      Source::Contracts => Self::Contract(decode_contract(map)),
      Source::Modifications => Self::Modification(decode_modification(map)),
      Source::Entities => Self::Entity(decode_entity(map)),
    }
  }

  pub fn source(&self) -> Source {
    match self {
      Self::Announcement(_) => Source::Announcements,
      Self::Contract(_) => Source::Contracts,
      Self::Modification(_) => Source::Modifications,
      Self::Entity(_) => Source::Entities,
    }
  }

  /// The record's publication date, if it has a parseable one. Used to place
  /// a record within a date range before it is normalized.
  pub fn publication_date(&self) -> Option<NaiveDate> {
    let value = match self {
      Self::Announcement(a) => &a.publication_date,
      Self::Contract(c) => &c.publication_date,
      Self::Modification(m) if m.publication_date.is_absent() => &m.modified_on,
      Self::Modification(m) => &m.publication_date,
      Self::Entity(_) => return None,
    };
    value.scalar_text().as_deref().and_then(parse_date)
  }
}

fn decode_announcement(m: &Map<String, Value>) -> RawAnnouncement {
  RawAnnouncement {
    notice_number:          pick(m, &["nAnuncio", "idAnuncio", "id_anuncio", "numeroAnuncio"]),
    incm_id:                pick(m, &["IdIncm", "idIncm", "id_incm"]),
    publication_date:       pick(m, &["dataPublicacao", "data_publicacao"]),
    issuer_tax_id:          pick(m, &["nifEntidade", "nif_entidade"]),
    issuer_name:            pick(m, &["designacaoEntidade"]),
    title:                  pick(m, &["descricaoAnuncio", "objetoContrato", "tipoActo"]),
    description:            pick(m, &["descricao", "descricaoAnuncio"]),
    url:                    pick(m, &["url"]),
    contract_kinds:         pick(m, &["tiposContrato", "tipoContrato"]),
    base_price:             pick(m, &["PrecoBase", "precoBase", "valorBase"]),
    categories:             pick(m, &["CPVs", "cpvs"]),
    procedure_type:         pick(m, &["tipoProcedimento", "tipoprocedimento", "modeloAnuncio"]),
    year:                   pick(m, &["Ano", "ano"]),
    environmental_criteria: pick(m, &["CriterAmbient", "criterAmbient"]),
    deadline_days:          pick(m, &["PrazoPropostas", "prazoPropostas"]),
    submission_deadline:    pick(m, &["dataFimProposta"]),
  }
}

fn decode_contract(m: &Map<String, Value>) -> RawContract {
  RawContract {
    id:               pick(m, &["idcontrato", "idContrato", "id_contrato", "nContrato", "numeroContrato"]),
    incm_id:          pick(m, &["idINCM", "id_incm"]),
    opportunity_ref:  pick(m, &["idAnuncio", "nAnuncio", "n_anuncio"]),
    title:            pick(m, &["objectoContrato", "objetoContrato", "objecto_contrato"]),
    description:      pick(m, &["descContrato", "descricao", "desc_contrato"]),
    issuer_tax_id:    pick(m, &["nifEntidade", "nif_entidade", "adjudicante_nif"]),
    issuer_name:      pick(m, &["designacaoEntidade"]),
    issuer_parties:   pick(m, &["adjudicante"]),
    winner_tax_id:    pick(m, &["nifAdjudicatario", "nif_adjudicatario"]),
    winner_name:      pick(m, &["designacaoAdjudicatario"]),
    winner_parties:   pick(m, &["adjudicatarios"]),
    competitors:      pick(m, &["concorrentes"]),
    publication_date: pick(m, &["dataPublicacao", "data_publicacao"]),
    signing_date:     pick(m, &["dataCelebracaoContrato", "data_celebracao"]),
    decision_date:    pick(m, &["dataDecisaoAdjudicacao"]),
    closure_date:     pick(m, &["dataFechoContrato", "dataFimExecucao", "data_fim_execucao"]),
    contract_price:   pick(m, &["precoContratual", "preco_contratual", "valorAdjudicacao"]),
    base_price:       pick(m, &["precoBaseProcedimento"]),
    categories:       pick(m, &["cpv", "cpvs", "CPVs"]),
    contract_kinds:   pick(m, &["tipoContrato", "tiposContrato", "tipo_contrato"]),
    execution_period: pick(m, &["prazoExecucao", "prazo_execucao"]),
    location:         pick(m, &["localExecucao", "local_execucao"]),
    legal_basis:      pick(m, &["fundamentacao"]),
    procedure_type:   pick(m, &["tipoprocedimento", "tipoProcedimento", "tipo_procedimento"]),
  }
}

fn decode_modification(m: &Map<String, Value>) -> RawModification {
  RawModification {
    id:                pick(m, &["idModificacao", "id_modificacao"]),
    contract_id:       pick(m, &["idContrato", "idcontrato", "id_contrato"]),
    publication_date:  pick(m, &["dataPublicacao", "data_publicacao"]),
    modified_on:       pick(m, &["dataModificacao", "data_modificacao"]),
    kind:              pick(m, &["tipoModificacao", "tipo_modificacao"]),
    description:       pick(m, &["descricao", "descricaoModificacao"]),
    justification:     pick(m, &["justificacao", "fundamentacao"]),
    original_value:    pick(m, &["valorOriginal", "valor_original"]),
    new_value:         pick(m, &["valorNovo", "valor_novo"]),
    original_deadline: pick(m, &["prazoOriginal", "prazo_original"]),
    new_deadline:      pick(m, &["prazoNovo", "prazo_novo"]),
  }
}

fn decode_entity(m: &Map<String, Value>) -> RawEntity {
  RawEntity {
    tax_id:      pick(m, &["nif", "NIF", "nifEntidade"]),
    name:        pick(m, &["designacao", "nome", "designacaoEntidade"]),
    address:     pick(m, &["morada", "endereco"]),
    postal_code: pick(m, &["codigoPostal", "codigo_postal"]),
    locality:    pick(m, &["localidade", "cidade"]),
    country:     pick(m, &["pais"]),
    entity_type: pick(m, &["tipoEntidade", "tipo_entidade"]),
  }
}

#[cfg(test)]
mod tests {
  use serde_json::json;

  use super::*;

  #[test]
  fn publication_date_is_read_before_normalizing() {
    let raw = RawRecord::decode(
      Source::Contracts,
      &json!({ "dataPublicacao": "25/02/2025" }),
    );
    assert_eq!(raw.publication_date(), NaiveDate::from_ymd_opt(2025, 2, 25));
    let undated = RawRecord::decode(Source::Announcements, &json!({ "dataPublicacao": "NULL" }));
    assert_eq!(undated.publication_date(), None);
  }

  #[test]
  fn sentinels_become_absent() {
    for v in [json!(null), json!("NULL"), json!("null"), json!("N/A"), json!("  ")]
    {
      assert!(RawValue::from_json(&v).is_absent(), "{v}");
    }
  }

  #[test]
  fn lists_are_cleaned_recursively() {
    let v = RawValue::from_json(&json!(["NULL", " a ", "", ["N/A"], 3]));
    assert_eq!(
      v,
      RawValue::List(vec![
        RawValue::Text("a".into()),
        RawValue::Number(Number::from(3u64))
      ])
    );
    assert!(RawValue::from_json(&json!(["null", ""])).is_absent());
  }

  #[test]
  fn field_name_variants_resolve() {
    let a = RawRecord::decode(
      Source::Announcements,
      &json!({ "precoBase": "10", "cpvs": ["45000000-7"] }),
    );
    let RawRecord::Announcement(a) = a else { panic!("wrong variant") };
    assert_eq!(a.base_price, RawValue::Text("10".into()));
    assert!(!a.categories.is_absent());

    let c = RawRecord::decode(Source::Contracts, &json!({ "idContrato": 7 }));
    let RawRecord::Contract(c) = c else { panic!("wrong variant") };
    assert_eq!(c.id, RawValue::Number(Number::from(7u64)));
  }

  #[test]
  fn first_usable_variant_wins() {
    let a = RawRecord::decode(
      Source::Announcements,
      &json!({ "PrecoBase": "NULL", "precoBase": "12,50" }),
    );
    let RawRecord::Announcement(a) = a else { panic!("wrong variant") };
    assert_eq!(a.base_price, RawValue::Text("12,50".into()));
  }

  #[test]
  fn modifications_fall_back_to_their_own_date() {
    let m = RawRecord::decode(
      Source::Modifications,
      &json!({ "idContrato": "77", "dataModificacao": "03/06/2024", "valorNovo": "1.200,00" }),
    );
    assert_eq!(m.source(), Source::Modifications);
    assert_eq!(m.publication_date(), NaiveDate::from_ymd_opt(2024, 6, 3));
    let RawRecord::Modification(m) = m else { panic!("wrong variant") };
    assert_eq!(m.contract_id, RawValue::Text("77".into()));
    assert_eq!(m.new_value, RawValue::Text("1.200,00".into()));

    let published = RawRecord::decode(
      Source::Modifications,
      &json!({ "dataPublicacao": "2024-07-01", "dataModificacao": "2024-06-03" }),
    );
    assert_eq!(published.publication_date(), NaiveDate::from_ymd_opt(2024, 7, 1));
  }

  #[test]
  fn non_object_decodes_empty() {
    let r = RawRecord::decode(Source::Entities, &json!("garbage"));
    assert_eq!(r, RawRecord::Entity(RawEntity::default()));
  }
}
