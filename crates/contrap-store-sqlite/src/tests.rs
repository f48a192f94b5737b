//! Integration tests for `SqliteStore` against an in-memory database.

use std::{str::FromStr, time::Duration};

use chrono::NaiveDate;
use contrap_core::{
  Classify, ErrorClass,
  entity::{EntityStub, Freshness, ReferenceEntity, TaxId},
  fragment::{AssociationFragment, Batch, PartyRole, RootEntity, Transformed},
  ledger::{DateRange, PageKey, Source},
  procurement::OpportunityKey,
  store::{LoadLimits, ProcurementStore},
};
use contrap_normalize::{NormalizeOptions, RawRecord, process};
use rust_decimal::Decimal;
use serde_json::{Value, json};
use tokio_util::sync::CancellationToken;

use crate::{Error, SqliteStore};

async fn store() -> SqliteStore {
  SqliteStore::open_in_memory()
    .await
    .expect("in-memory store")
}

fn record(source: Source, value: Value) -> Transformed {
  process(&RawRecord::decode(source, &value), &NormalizeOptions::default())
}

fn announcement(id: &str) -> Transformed {
  record(
    Source::Announcements,
    json!({
      "nAnuncio": id,
      "Ano": 2024,
      "nifEntidade": "512021155",
      "designacaoEntidade": "Município de Exemplo",
      "dataPublicacao": "25/02/2024",
      "PrecoBase": "85000.00",
      "CPVs": ["45000000-7 - Obras de construção"],
      "tiposContrato": ["Empreitadas de Obras Públicas"],
      "PrazoPropostas": "30 dias",
    }),
  )
}

fn contract(id: &str, notice: &str, price: &str) -> Transformed {
  record(
    Source::Contracts,
    json!({
      "idcontrato": id,
      "nAnuncio": notice,
      "nifEntidade": "512021155",
      "designacaoEntidade": "Município de Exemplo",
      "adjudicatarios": ["123456789 - Construtora, SA"],
      "concorrentes": ["123456789 - Construtora, SA", "999999990 - Outra, Lda"],
      "precoContratual": price,
      "dataPublicacao": "2024-03-10",
      "cpv": ["45000000-7 - Obras de construção"],
      "tipoContrato": "Empreitadas de Obras Públicas",
    }),
  )
}

fn modification(award_id: &str, on: Option<&str>, new_value: Option<&str>) -> Transformed {
  record(
    Source::Modifications,
    json!({
      "idContrato": award_id,
      "dataModificacao": on,
      "tipoModificacao": "Trabalhos complementares",
      "valorNovo": new_value,
    }),
  )
}

fn tax(s: &str) -> TaxId { TaxId::parse(s).unwrap() }

fn date(y: i32, m: u32, d: u32) -> NaiveDate { NaiveDate::from_ymd_opt(y, m, d).unwrap() }

fn page(index: u32) -> PageKey {
  PageKey {
    source: Source::Announcements,
    range: DateRange::new(date(2024, 1, 1), date(2024, 1, 31)).unwrap(),
    index,
  }
}

fn paged(index: u32, records: Vec<Transformed>) -> Batch {
  Batch { page: Some(page(index)), digest: Some("ab12".into()), records }
}

fn unpaged(records: Vec<Transformed>) -> Batch {
  Batch { page: None, digest: None, records }
}

fn limits() -> LoadLimits { LoadLimits::default() }

// ─── Loading ─────────────────────────────────────────────────────────────────

#[tokio::test]
async fn load_announcement_writes_root_lookups_and_stub() {
  let s = store().await;
  let report = s.load(paged(0, vec![announcement("1/2024")]), limits()).await.unwrap();

  assert_eq!(report.opportunities, 1);
  assert_eq!(report.stubs, 1);
  assert_eq!(report.fragments_inserted, 2);
  assert!(!report.already_committed);

  let key = OpportunityKey { external_id: "1/2024".into(), year: 2024 };
  let o = s.opportunity(&key).await.unwrap().expect("opportunity stored");
  assert_eq!(o.base_price, Decimal::from_str("85000").ok());
  assert_eq!(o.issuer, Some(tax("512021155")));
  assert_eq!(o.publication_date, Some(date(2024, 2, 25)));
  assert_eq!(o.deadline_days, Some(30));
  assert_eq!(o.submission_deadline, Some(date(2024, 3, 26)));

  let issuer = s.entity(&tax("512021155")).await.unwrap().unwrap();
  assert_eq!(issuer.freshness, Freshness::Stub);
  assert_eq!(issuer.name.as_deref(), Some("Município de Exemplo"));

  let counts = s.row_counts().await.unwrap();
  assert_eq!(counts.coded_categories, 1);
  assert_eq!(counts.contract_kinds, 8);
  assert_eq!(counts.opportunity_categories, 1);
  assert_eq!(counts.opportunity_kinds, 1);
}

#[tokio::test]
async fn reloading_a_committed_page_writes_nothing() {
  let s = store().await;
  s.load(paged(0, vec![announcement("1/2024")]), limits()).await.unwrap();
  let before = s.row_counts().await.unwrap();

  let again = s.load(paged(0, vec![announcement("1/2024")]), limits()).await.unwrap();
  assert!(again.already_committed);
  assert_eq!(again.rows_added, 0);
  assert_eq!(s.row_counts().await.unwrap(), before);
}

#[tokio::test]
async fn reloading_an_unpaged_batch_adds_zero_rows() {
  let s = store().await;
  let batch = || unpaged(vec![announcement("1/2024"), contract("77", "1/2024", "100.00")]);
  let first = s.load(batch(), limits()).await.unwrap();
  assert!(first.rows_added > 0);
  let before = s.row_counts().await.unwrap();

  let second = s.load(batch(), limits()).await.unwrap();
  assert_eq!(second.rows_added, 0);
  assert_eq!(second.fragments_inserted, 0);
  assert_eq!(s.row_counts().await.unwrap(), before);
}

#[tokio::test]
async fn dangling_fragment_rolls_back_the_whole_batch() {
  let s = store().await;
  let mut bad = contract("77", "1/2024", "100.00");
  bad.fragments.push(AssociationFragment::AwardCategory {
    award_id: "77".into(),
    code:     "99999999".into(),
  });

  let err = s
    .load(paged(0, vec![announcement("1/2024"), bad]), limits())
    .await
    .unwrap_err();
  assert!(matches!(err, Error::Integrity(_)), "{err:?}");
  assert_eq!(err.class(), ErrorClass::SchemaViolation);

  let counts = s.row_counts().await.unwrap();
  assert_eq!(counts.total(), counts.contract_kinds);
  assert!(!s.is_committed(page(0)).await.unwrap());
}

#[tokio::test]
async fn integrity_holds_after_loads() {
  let s = store().await;
  s.load(paged(0, vec![contract("77", "1/2024", "100.00")]), limits()).await.unwrap();
  s.load(paged(1, vec![announcement("1/2024")]), limits()).await.unwrap();
  let report = s.integrity_scan().await.unwrap();
  assert!(report.is_clean(), "{:?}", report.dangling);
}

#[tokio::test]
async fn cancelled_load_rolls_back() {
  let s = store().await;
  let cancel = CancellationToken::new();
  cancel.cancel();
  let err = s
    .load(
      paged(0, vec![announcement("1/2024")]),
      LoadLimits { cancel, ..limits() },
    )
    .await
    .unwrap_err();
  assert!(matches!(err, Error::Cancelled));
  assert!(err.is_fatal_for_run());
  assert_eq!(s.row_counts().await.unwrap().opportunities, 0);
}

#[tokio::test]
async fn commit_deadline_rolls_back() {
  let s = store().await;
  let err = s
    .load(
      paged(0, vec![announcement("1/2024")]),
      LoadLimits { commit_timeout: Duration::ZERO, ..limits() },
    )
    .await
    .unwrap_err();
  assert!(matches!(err, Error::CommitTimeout(_)));
  assert!(!s.is_committed(page(0)).await.unwrap());
}

#[tokio::test]
async fn large_batch_past_its_deadline_rolls_back() {
  let s = store().await;
  let records = (0..3_000).map(|n| announcement(&format!("{n}/2024"))).collect();
  let err = s
    .load(
      paged(0, records),
      LoadLimits { commit_timeout: Duration::from_millis(1), ..limits() },
    )
    .await
    .unwrap_err();
  assert!(matches!(err, Error::CommitTimeout(_)), "{err:?}");
  assert_eq!(err.class(), ErrorClass::Fatal);

  let counts = s.row_counts().await.unwrap();
  assert_eq!(counts.opportunities, 0);
  assert_eq!(counts.entities, 0);
  assert_eq!(counts.opportunity_categories, 0);
  assert!(!s.is_committed(page(0)).await.unwrap());

  // The connection is usable again once the guard is gone.
  s.load(paged(0, vec![announcement("1/2024")]), limits()).await.unwrap();
  assert_eq!(s.row_counts().await.unwrap().opportunities, 1);
}

// ─── Links & entities ────────────────────────────────────────────────────────

#[tokio::test]
async fn award_links_to_an_opportunity_that_arrives_later() {
  let s = store().await;
  let report = s
    .load(unpaged(vec![contract("77", "1/2024", "100.00")]), limits())
    .await
    .unwrap();
  assert_eq!(report.unlinked_awards, 1);
  let stored = s.award("77").await.unwrap().unwrap();
  assert_eq!(stored.opportunity, None);
  assert_eq!(
    stored.award.opportunity_ref.as_ref().map(|r| r.external_id.as_str()),
    Some("1/2024")
  );

  s.load(unpaged(vec![announcement("1/2024")]), limits()).await.unwrap();
  let stored = s.award("77").await.unwrap().unwrap();
  assert_eq!(
    stored.opportunity,
    Some(OpportunityKey { external_id: "1/2024".into(), year: 2024 })
  );
}

#[tokio::test]
async fn award_in_same_batch_as_its_opportunity_links_immediately() {
  let s = store().await;
  let report = s
    .load(
      unpaged(vec![contract("77", "1/2024", "100.00"), announcement("1/2024")]),
      limits(),
    )
    .await
    .unwrap();
  assert_eq!(report.unlinked_awards, 0);
  assert!(s.award("77").await.unwrap().unwrap().opportunity.is_some());
}

#[tokio::test]
async fn party_roles_live_on_the_edge() {
  let s = store().await;
  s.load(unpaged(vec![contract("77", "1/2024", "100.00")]), limits()).await.unwrap();
  let parties = s.award_parties("77").await.unwrap();
  assert_eq!(
    parties,
    vec![
      (tax("123456789"), PartyRole::Competitor),
      (tax("123456789"), PartyRole::Winner),
      (tax("999999990"), PartyRole::Competitor),
    ]
  );
}

#[tokio::test]
async fn counters_follow_award_edges() {
  let s = store().await;
  s.load(
    unpaged(vec![
      contract("77", "1/2024", "100.00"),
      contract("78", "2/2024", "50.50"),
    ]),
    limits(),
  )
  .await
  .unwrap();

  let winner = s.entity(&tax("123456789")).await.unwrap().unwrap();
  assert_eq!(winner.counters.contracts_won, 2);
  assert_eq!(winner.counters.total_won, Decimal::from_str("150.50").unwrap());
  assert_eq!(winner.counters.contracts_issued, 0);

  let issuer = s.entity(&tax("512021155")).await.unwrap().unwrap();
  assert_eq!(issuer.counters.contracts_issued, 2);
  assert_eq!(issuer.counters.total_issued, Decimal::from_str("150.5").unwrap());
}

#[tokio::test]
async fn stub_never_downgrades_an_enriched_entity() {
  let s = store().await;
  let mut enriched = ReferenceEntity::enriched(tax("512021155"), Some("Oficial".into()));
  enriched.country = Some("Portugal".into());
  let entity_batch = unpaged(vec![Transformed {
    root: Some(RootEntity::Entity(enriched)),
    ..Transformed::default()
  }]);
  s.load(entity_batch, limits()).await.unwrap();

  s.load(unpaged(vec![announcement("1/2024")]), limits()).await.unwrap();

  let e = s.entity(&tax("512021155")).await.unwrap().unwrap();
  assert_eq!(e.freshness, Freshness::Enriched);
  assert_eq!(e.name.as_deref(), Some("Oficial"));
  assert_eq!(e.country.as_deref(), Some("Portugal"));
}

#[tokio::test]
async fn stub_fills_in_a_missing_name() {
  let s = store().await;
  let nameless = Transformed {
    stubs: vec![EntityStub { tax_id: tax("512021155"), name: None }],
    ..Transformed::default()
  };
  s.load(unpaged(vec![nameless]), limits()).await.unwrap();

  let report = s.load(unpaged(vec![announcement("1/2024")]), limits()).await.unwrap();
  assert_eq!(report.stubs, 0);
  let e = s.entity(&tax("512021155")).await.unwrap().unwrap();
  assert_eq!(e.name.as_deref(), Some("Município de Exemplo"));
}

#[tokio::test]
async fn touching_a_stub_moves_it_to_the_back_of_the_queue() {
  let s = store().await;
  let stubs = Transformed {
    stubs: vec![
      EntityStub { tax_id: tax("123456789"), name: None },
      EntityStub { tax_id: tax("512021155"), name: None },
    ],
    ..Transformed::default()
  };
  s.load(unpaged(vec![stubs]), limits()).await.unwrap();
  tokio::time::sleep(Duration::from_millis(5)).await;

  let first = s.pending_stubs(1).await.unwrap().remove(0).tax_id;
  let touch = Transformed {
    root: Some(RootEntity::Entity(ReferenceEntity::stub(first.clone(), None))),
    ..Transformed::default()
  };
  s.load(unpaged(vec![touch]), limits()).await.unwrap();

  let e = s.entity(&first).await.unwrap().unwrap();
  assert_eq!(e.freshness, Freshness::Stub);
  let next = s.pending_stubs(1).await.unwrap().remove(0).tax_id;
  assert_ne!(next, first);
}

#[tokio::test]
async fn pending_stubs_excludes_enriched_entities() {
  let s = store().await;
  s.load(unpaged(vec![contract("77", "1/2024", "100.00")]), limits()).await.unwrap();
  let enriched = Transformed {
    root: Some(RootEntity::Entity(ReferenceEntity::enriched(tax("999999990"), None))),
    ..Transformed::default()
  };
  s.load(unpaged(vec![enriched]), limits()).await.unwrap();

  let mut pending: Vec<_> = s
    .pending_stubs(10)
    .await
    .unwrap()
    .into_iter()
    .map(|stub| stub.tax_id)
    .collect();
  pending.sort();
  assert_eq!(pending, vec![tax("123456789"), tax("512021155")]);
  assert_eq!(s.pending_stubs(1).await.unwrap().len(), 1);
}

// ─── Modifications ───────────────────────────────────────────────────────────

#[tokio::test]
async fn modification_updates_award_value_and_counters() {
  let s = store().await;
  s.load(unpaged(vec![contract("77", "1/2024", "100.00")]), limits()).await.unwrap();

  let report = s
    .load(unpaged(vec![modification("77", Some("2024-06-03"), Some("150.00"))]), limits())
    .await
    .unwrap();
  assert_eq!(report.modifications, 1);
  assert_eq!(report.unlinked_modifications, 0);

  let stored = s.award("77").await.unwrap().unwrap();
  assert_eq!(stored.award.contract_price, Decimal::from_str("150").ok());
  let winner = s.entity(&tax("123456789")).await.unwrap().unwrap();
  assert_eq!(winner.counters.total_won, Decimal::from_str("150").unwrap());
  let issuer = s.entity(&tax("512021155")).await.unwrap().unwrap();
  assert_eq!(issuer.counters.total_issued, Decimal::from_str("150").unwrap());

  let mods = s.modifications("77").await.unwrap();
  assert_eq!(mods.len(), 1);
  assert_eq!(mods[0].modified_on, Some(date(2024, 6, 3)));
  assert_eq!(mods[0].kind.as_deref(), Some("Trabalhos complementares"));
}

#[tokio::test]
async fn modification_without_value_keeps_the_price() {
  let s = store().await;
  s.load(
    unpaged(vec![
      contract("77", "1/2024", "100.00"),
      modification("77", Some("2024-06-03"), None),
    ]),
    limits(),
  )
  .await
  .unwrap();
  let stored = s.award("77").await.unwrap().unwrap();
  assert_eq!(stored.award.contract_price, Decimal::from_str("100").ok());
  assert_eq!(s.row_counts().await.unwrap().award_modifications, 1);
}

#[tokio::test]
async fn modification_before_its_award_applies_on_arrival() {
  let s = store().await;
  let report = s
    .load(unpaged(vec![modification("77", Some("2024-06-03"), Some("175.25"))]), limits())
    .await
    .unwrap();
  assert_eq!(report.unlinked_modifications, 1);
  assert!(s.award("77").await.unwrap().is_none());

  s.load(unpaged(vec![contract("77", "1/2024", "100.00")]), limits()).await.unwrap();
  let stored = s.award("77").await.unwrap().unwrap();
  assert_eq!(stored.award.contract_price, Decimal::from_str("175.25").ok());

  // Reloading the contract as published does not undo the amendment.
  s.load(unpaged(vec![contract("77", "1/2024", "100.00")]), limits()).await.unwrap();
  let stored = s.award("77").await.unwrap().unwrap();
  assert_eq!(stored.award.contract_price, Decimal::from_str("175.25").ok());
  let winner = s.entity(&tax("123456789")).await.unwrap().unwrap();
  assert_eq!(winner.counters.total_won, Decimal::from_str("175.25").unwrap());
}

#[tokio::test]
async fn latest_dated_modification_wins() {
  let s = store().await;
  s.load(
    unpaged(vec![
      contract("77", "1/2024", "100.00"),
      modification("77", Some("2024-07-01"), Some("130.00")),
      modification("77", None, Some("999.00")),
      modification("77", Some("2024-05-01"), Some("120.00")),
    ]),
    limits(),
  )
  .await
  .unwrap();
  let stored = s.award("77").await.unwrap().unwrap();
  assert_eq!(stored.award.contract_price, Decimal::from_str("130").ok());

  let dates: Vec<_> = s
    .modifications("77")
    .await
    .unwrap()
    .into_iter()
    .map(|m| m.modified_on)
    .collect();
  assert_eq!(dates, vec![Some(date(2024, 5, 1)), Some(date(2024, 7, 1)), None]);
}

#[tokio::test]
async fn reloading_a_modification_is_idempotent() {
  let s = store().await;
  let batch = || unpaged(vec![modification("77", Some("2024-06-03"), Some("150.00"))]);
  s.load(batch(), limits()).await.unwrap();
  let report = s.load(batch(), limits()).await.unwrap();
  assert_eq!(report.rows_added, 0);
  assert_eq!(s.row_counts().await.unwrap().award_modifications, 1);
}

// ─── Ledger ──────────────────────────────────────────────────────────────────

#[tokio::test]
async fn failures_are_listed_until_the_page_commits() {
  let s = store().await;
  s.record_failure(page(1), "upstream 503".into()).await.unwrap();
  s.record_failure(page(1), "upstream 504".into()).await.unwrap();

  let failed = s.failed_pages().await.unwrap();
  assert_eq!(failed.len(), 1);
  assert_eq!(failed[0].page, page(1));
  assert_eq!(failed[0].attempts, 2);
  assert_eq!(failed[0].last_error, "upstream 504");

  s.load(paged(1, vec![announcement("1/2024")]), limits()).await.unwrap();
  assert!(s.failed_pages().await.unwrap().is_empty());

  // A late failure report cannot un-commit a page.
  s.record_failure(page(1), "stale".into()).await.unwrap();
  assert!(s.is_committed(page(1)).await.unwrap());
  assert!(s.failed_pages().await.unwrap().is_empty());
}

#[tokio::test]
async fn range_completes_once_every_page_commits() {
  let s = store().await;
  let range = page(0).range;
  s.load(paged(0, vec![announcement("1/2024")]), limits()).await.unwrap();
  s.load(paged(2, vec![announcement("3/2024")]), limits()).await.unwrap();

  assert_eq!(
    s.committed_indices(Source::Announcements, range).await.unwrap(),
    vec![0, 2]
  );
  assert!(!s.complete_range(Source::Announcements, range, 3).await.unwrap());
  assert_eq!(s.watermark(Source::Announcements).await.unwrap(), None);

  s.load(paged(1, vec![announcement("2/2024")]), limits()).await.unwrap();
  assert!(s.complete_range(Source::Announcements, range, 3).await.unwrap());
  assert!(s.is_range_complete(Source::Announcements, range).await.unwrap());
  assert!(!s.is_range_complete(Source::Contracts, range).await.unwrap());
  assert_eq!(s.watermark(Source::Announcements).await.unwrap(), Some(date(2024, 1, 31)));
  assert_eq!(s.watermark(Source::Contracts).await.unwrap(), None);
}

#[tokio::test]
async fn empty_range_is_trivially_complete() {
  let s = store().await;
  let range = DateRange::new(date(2024, 2, 1), date(2024, 2, 29)).unwrap();
  assert!(s.complete_range(Source::Contracts, range, 0).await.unwrap());
  assert_eq!(s.watermark(Source::Contracts).await.unwrap(), Some(date(2024, 2, 29)));
}
