//! Raw record → typed record. Total: every input produces a [`ValidRecord`],
//! and every field that could not be used produces a [`FieldWarning`].

use chrono::{Datelike, Days, NaiveDate};
use contrap_core::{
  entity::{ReferenceEntity, TaxId},
  ledger::Source,
  procurement::{
    Award, CodedCategory, Modification, Opportunity, OpportunityKey, OpportunityRef,
  },
  warning::{FieldWarning, WarningKind},
};
use rust_decimal::{Decimal, prelude::FromPrimitive};

use crate::{
  fields,
  lists::{self, Party},
  raw::{RawAnnouncement, RawContract, RawEntity, RawModification, RawRecord, RawValue},
};

// ─── Public types ────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Default)]
pub struct NormalizeOptions {
  /// Year assigned to opportunities that carry no year of their own, usually
  /// the year of the range being fetched.
  pub fallback_year:   Option<i32>,
  /// Also require a valid mod-11 check digit on tax identifiers.
  pub strict_checksum: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ValidOpportunity {
  pub opportunity: Opportunity,
  pub issuer_name: Option<String>,
  pub categories:  Vec<CodedCategory>,
  /// Contract-kind labels as published; resolved by the transformer.
  pub kind_labels: Vec<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ValidAward {
  pub award:       Award,
  pub issuer_name: Option<String>,
  pub winners:     Vec<Party>,
  pub competitors: Vec<Party>,
  pub categories:  Vec<CodedCategory>,
  pub kind_labels: Vec<String>,
}

/// A record without a usable primary key. Whatever it references is still
/// worth keeping.
#[derive(Debug, Clone, PartialEq)]
pub struct UnkeyedRecord {
  pub source:     Source,
  pub parties:    Vec<Party>,
  pub categories: Vec<CodedCategory>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ValidRecord {
  Opportunity(ValidOpportunity),
  Award(ValidAward),
  Modification(Modification),
  Entity(ReferenceEntity),
  Unkeyed(UnkeyedRecord),
}

#[derive(Debug, Clone)]
pub struct Normalized {
  pub record:   ValidRecord,
  pub warnings: Vec<FieldWarning>,
}

pub fn normalize(raw: &RawRecord) -> Normalized {
  normalize_with(raw, &NormalizeOptions::default())
}

pub fn normalize_with(raw: &RawRecord, opts: &NormalizeOptions) -> Normalized {
  let mut cx = Cx { opts, warnings: Vec::new() };
  let record = match raw {
    RawRecord::Announcement(a) => cx.announcement(a),
    RawRecord::Contract(c) => cx.contract(c),
    RawRecord::Modification(m) => cx.modification(m),
    RawRecord::Entity(e) => cx.entity(e),
  };
  Normalized { record, warnings: cx.warnings }
}

// ─── Field helpers ───────────────────────────────────────────────────────────

struct Cx<'a> {
  opts:     &'a NormalizeOptions,
  warnings: Vec<FieldWarning>,
}

impl Cx<'_> {
  fn warn(&mut self, field: &'static str, kind: WarningKind, raw: &RawValue) {
    self.warnings.push(match raw {
      RawValue::Absent => FieldWarning::new(field, kind),
      other => FieldWarning::with_value(field, kind, other.describe()),
    });
  }

  /// A single scalar. Lists and objects are a shape error.
  fn scalar(&mut self, field: &'static str, raw: &RawValue) -> Option<String> {
    match raw {
      RawValue::Absent => None,
      RawValue::List(_) | RawValue::Object(_) => {
        self.warn(field, WarningKind::UnexpectedShape, raw);
        None
      }
      other => other.scalar_text(),
    }
  }

  /// Free text. A list of scalars is joined with `", "`.
  fn text(&mut self, field: &'static str, raw: &RawValue) -> Option<String> {
    match raw {
      RawValue::List(items) => {
        let parts: Option<Vec<String>> =
          items.iter().map(RawValue::scalar_text).collect();
        match parts {
          Some(parts) => Some(parts.join(", ")),
          None => {
            self.warn(field, WarningKind::UnexpectedShape, raw);
            None
          }
        }
      }
      other => self.scalar(field, other),
    }
  }

  fn parsed<T>(
    &mut self,
    field: &'static str,
    kind: WarningKind,
    raw: &RawValue,
    parse: impl FnOnce(&str) -> Option<T>,
  ) -> Option<T> {
    let text = self.scalar(field, raw)?;
    let value = parse(&text);
    if value.is_none() {
      self.warn(field, kind, raw);
    }
    value
  }

  fn date(&mut self, field: &'static str, raw: &RawValue) -> Option<NaiveDate> {
    self.parsed(field, WarningKind::InvalidDate, raw, fields::parse_date)
  }

  fn amount(&mut self, field: &'static str, raw: &RawValue) -> Option<Decimal> {
    if let RawValue::Number(n) = raw {
      let value = n
        .as_i64()
        .map(Decimal::from)
        .or_else(|| n.as_u64().map(Decimal::from))
        .or_else(|| n.as_f64().and_then(Decimal::from_f64));
      if value.is_none() {
        self.warn(field, WarningKind::InvalidAmount, raw);
      }
      return value;
    }
    self.parsed(field, WarningKind::InvalidAmount, raw, fields::parse_amount)
  }

  fn day_count(&mut self, field: &'static str, raw: &RawValue) -> Option<u32> {
    self.parsed(field, WarningKind::InvalidNumber, raw, fields::parse_day_count)
  }

  fn period(&mut self, field: &'static str, raw: &RawValue) -> Option<u32> {
    self.parsed(field, WarningKind::InvalidNumber, raw, fields::parse_period_days)
  }

  fn flag(&mut self, field: &'static str, raw: &RawValue) -> Option<bool> {
    if let RawValue::Bool(b) = raw {
      return Some(*b);
    }
    self.parsed(field, WarningKind::InvalidFlag, raw, fields::parse_flag)
  }

  fn year(&mut self, field: &'static str, raw: &RawValue) -> Option<i32> {
    self.parsed(field, WarningKind::InvalidNumber, raw, fields::parse_year)
  }

  fn tax_id(&mut self, field: &'static str, raw: &RawValue) -> Option<TaxId> {
    let strict = self.opts.strict_checksum;
    self.parsed(field, WarningKind::InvalidTaxId, raw, |s| {
      fields::parse_tax_id(s, strict)
    })
  }

  fn categories(
    &mut self,
    field: &'static str,
    raw: &RawValue,
  ) -> Vec<CodedCategory> {
    let mut out = Vec::new();
    for item in raw.items() {
      match item.scalar_text().as_deref().and_then(lists::parse_category) {
        Some(category) => out.push(category),
        None => self.warn(field, WarningKind::MalformedCategory, item),
      }
    }
    out
  }

  fn parties(&mut self, field: &'static str, raw: &RawValue) -> Vec<Party> {
    let strict = self.opts.strict_checksum;
    let mut out = Vec::new();
    for item in raw.items() {
      let party = match item {
        RawValue::Object(map) => object_party(map, strict),
        other => other
          .scalar_text()
          .and_then(|s| lists::parse_party(&s, strict)),
      };
      match party {
        Some(party) => out.push(party),
        None => self.warn(field, WarningKind::MalformedParty, item),
      }
    }
    out
  }

  fn labels(&mut self, field: &'static str, raw: &RawValue) -> Vec<String> {
    let mut out = Vec::new();
    for item in raw.items() {
      match item.scalar_text() {
        Some(label) => out.push(label),
        None => self.warn(field, WarningKind::UnexpectedShape, item),
      }
    }
    out
  }

  // ─── Records ───────────────────────────────────────────────────────────────

  fn announcement(&mut self, a: &RawAnnouncement) -> ValidRecord {
    let external_id = self.scalar("nAnuncio", &a.notice_number).or_else(|| {
      self
        .scalar("IdIncm", &a.incm_id)
        .map(|id| format!("incm_{id}"))
    });
    let publication_date = self.date("dataPublicacao", &a.publication_date);

    let issuer = if a.issuer_tax_id.is_absent() {
      self.warn("nifEntidade", WarningKind::MissingIssuer, &RawValue::Absent);
      None
    } else {
      self.tax_id("nifEntidade", &a.issuer_tax_id)
    };
    let issuer_name = self.scalar("designacaoEntidade", &a.issuer_name);

    let year = self
      .year("Ano", &a.year)
      .or_else(|| {
        external_id
          .as_deref()
          .and_then(OpportunityRef::parse)
          .and_then(|r| r.year)
      })
      .or_else(|| publication_date.map(|d| d.year()))
      .or(self.opts.fallback_year);

    let mut deadline_days = self.day_count("PrazoPropostas", &a.deadline_days);
    let absolute = self.date("dataFimProposta", &a.submission_deadline);
    let submission_deadline = match (deadline_days, publication_date) {
      (Some(days), Some(published)) => {
        published.checked_add_days(Days::new(u64::from(days)))
      }
      _ => absolute,
    };
    if deadline_days.is_none() {
      if let (Some(end), Some(published)) = (absolute, publication_date) {
        deadline_days = u32::try_from((end - published).num_days()).ok();
      }
    }

    let base_price = self.amount("PrecoBase", &a.base_price);
    let environmental_criteria =
      self.flag("CriterAmbient", &a.environmental_criteria).unwrap_or(false);
    let title = self.text("descricaoAnuncio", &a.title);
    let description = self.text("descricao", &a.description);
    let procedure_type = self.text("tipoProcedimento", &a.procedure_type);
    let url = self.scalar("url", &a.url);
    let categories = self.categories("CPVs", &a.categories);
    let kind_labels = self.labels("tiposContrato", &a.contract_kinds);

    let key = match (external_id, year) {
      (Some(external_id), Some(year)) => OpportunityKey { external_id, year },
      (id, _) => {
        let kind = if id.is_none() {
          WarningKind::MissingKey
        } else {
          WarningKind::MissingYear
        };
        self.warn("nAnuncio", kind, &RawValue::Absent);
        let parties = issuer
          .map(|tax_id| Party { tax_id, name: issuer_name })
          .into_iter()
          .collect();
        return ValidRecord::Unkeyed(UnkeyedRecord {
          source: Source::Announcements,
          parties,
          categories,
        });
      }
    };

    ValidRecord::Opportunity(ValidOpportunity {
      opportunity: Opportunity {
        key,
        publication_date,
        issuer,
        title,
        description,
        base_price,
        deadline_days,
        submission_deadline,
        environmental_criteria,
        procedure_type,
        url,
      },
      issuer_name,
      categories,
      kind_labels,
    })
  }

  fn contract(&mut self, c: &RawContract) -> ValidRecord {
    let id = self.scalar("idContrato", &c.id).or_else(|| {
      self
        .scalar("idINCM", &c.incm_id)
        .map(|id| format!("incm_{id}"))
    });
    let opportunity_ref = self
      .scalar("idAnuncio", &c.opportunity_ref)
      .as_deref()
      .and_then(OpportunityRef::parse);

    let issuer_parties = self.parties("adjudicante", &c.issuer_parties);
    let issuer = if !c.issuer_tax_id.is_absent() {
      self.tax_id("nifEntidade", &c.issuer_tax_id)
    } else {
      if c.issuer_parties.is_absent() {
        self.warn("nifEntidade", WarningKind::MissingIssuer, &RawValue::Absent);
      }
      issuer_parties.first().map(|p| p.tax_id.clone())
    };
    let issuer_name = issuer_parties
      .iter()
      .find(|p| Some(&p.tax_id) == issuer.as_ref())
      .and_then(|p| p.name.clone())
      .or_else(|| self.scalar("designacaoEntidade", &c.issuer_name));

    let mut winners = self.parties("adjudicatarios", &c.winner_parties);
    if let Some(tax_id) = self.tax_id("nifAdjudicatario", &c.winner_tax_id) {
      if !winners.iter().any(|w| w.tax_id == tax_id) {
        let name = self.scalar("designacaoAdjudicatario", &c.winner_name);
        winners.push(Party { tax_id, name });
      }
    }
    let competitors = self.parties("concorrentes", &c.competitors);

    let title = self.text("objectoContrato", &c.title);
    let details = self.text("descContrato", &c.description);
    let publication_date = self.date("dataPublicacao", &c.publication_date);
    let signing_date = self.date("dataCelebracaoContrato", &c.signing_date);
    let decision_date = self.date("dataDecisaoAdjudicacao", &c.decision_date);
    let closure_date = self.date("dataFechoContrato", &c.closure_date);
    let contract_price = self.amount("precoContratual", &c.contract_price);
    let base_price = self.amount("precoBaseProcedimento", &c.base_price);
    let execution_days = self.period("prazoExecucao", &c.execution_period);
    let location = self.text("localExecucao", &c.location);
    let legal_basis = self.text("fundamentacao", &c.legal_basis);
    let procedure_type = self.text("tipoprocedimento", &c.procedure_type);
    let categories = self.categories("cpv", &c.categories);
    let kind_labels = self.labels("tipoContrato", &c.contract_kinds);

    let Some(id) = id else {
      self.warn("idContrato", WarningKind::MissingKey, &RawValue::Absent);
      let issuer_party = issuer.map(|tax_id| Party { tax_id, name: issuer_name });
      let parties = issuer_party
        .into_iter()
        .chain(winners)
        .chain(competitors)
        .collect();
      return ValidRecord::Unkeyed(UnkeyedRecord {
        source: Source::Contracts,
        parties,
        categories,
      });
    };

    ValidRecord::Award(ValidAward {
      award: Award {
        id,
        opportunity_ref,
        issuer,
        description: title.or(details),
        procedure_type,
        location,
        legal_basis,
        contract_price,
        base_price,
        publication_date,
        signing_date,
        decision_date,
        closure_date,
        execution_days,
      },
      issuer_name,
      winners,
      competitors,
      categories,
      kind_labels,
    })
  }

  fn modification(&mut self, m: &RawModification) -> ValidRecord {
    let award_id = self.scalar("idContrato", &m.contract_id);
    let upstream_id = self.scalar("idModificacao", &m.id);
    let modified_on = self.date("dataModificacao", &m.modified_on);
    let kind = self.text("tipoModificacao", &m.kind);
    let description = self.text("descricao", &m.description);
    let justification = self.text("justificacao", &m.justification);
    let original_value = self.amount("valorOriginal", &m.original_value);
    let new_value = self.amount("valorNovo", &m.new_value);
    let original_deadline = self.date("prazoOriginal", &m.original_deadline);
    let new_deadline = self.date("prazoNovo", &m.new_deadline);

    let Some(award_id) = award_id else {
      self.warn("idContrato", WarningKind::MissingKey, &RawValue::Absent);
      return ValidRecord::Unkeyed(UnkeyedRecord {
        source:     Source::Modifications,
        parties:    Vec::new(),
        categories: Vec::new(),
      });
    };
    let id = upstream_id.unwrap_or_else(|| {
      Modification::derived_id(
        &award_id,
        modified_on,
        kind.as_deref(),
        new_value.as_ref(),
        new_deadline,
      )
    });

    ValidRecord::Modification(Modification {
      id,
      award_id,
      modified_on,
      kind,
      description,
      justification,
      original_value,
      new_value,
      original_deadline,
      new_deadline,
    })
  }

  fn entity(&mut self, e: &RawEntity) -> ValidRecord {
    let tax_id = if e.tax_id.is_absent() {
      self.warn("nif", WarningKind::MissingKey, &RawValue::Absent);
      None
    } else {
      self.tax_id("nif", &e.tax_id)
    };
    let name = self.scalar("designacao", &e.name);
    let address = self.text("morada", &e.address);
    let postal_code = self.scalar("codigoPostal", &e.postal_code);
    let locality = self.scalar("localidade", &e.locality);
    let country = self.scalar("pais", &e.country);
    let entity_type = self.scalar("tipoEntidade", &e.entity_type);

    let Some(tax_id) = tax_id else {
      return ValidRecord::Unkeyed(UnkeyedRecord {
        source:     Source::Entities,
        parties:    Vec::new(),
        categories: Vec::new(),
      });
    };

    ValidRecord::Entity(ReferenceEntity {
      address,
      postal_code,
      locality,
      country,
      entity_type,
      ..ReferenceEntity::enriched(tax_id, name)
    })
  }
}

/// `{ "nif": "...", "nome": "..." }` entries in party lists.
fn object_party(
  map: &std::collections::BTreeMap<String, RawValue>,
  strict: bool,
) -> Option<Party> {
  let tax_id = ["nif", "NIF", "nifEntidade"]
    .iter()
    .filter_map(|k| map.get(*k))
    .find_map(|v| v.scalar_text())
    .and_then(|s| fields::parse_tax_id(&s, strict))?;
  let name = ["nome", "designacao", "name"]
    .iter()
    .filter_map(|k| map.get(*k))
    .find_map(RawValue::scalar_text);
  Some(Party { tax_id, name })
}
