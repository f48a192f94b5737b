//! The pipeline orchestrator.
//!
//! A run plans `(source, year)` units, hands them to a fixed pool of
//! workers, and for each unit: fetches (or re-reads from the raw cache),
//! places records into chunks by publication date, cuts each chunk into
//! pages, and loads every page that is not committed yet. A chunk whose
//! pages all commit is marked complete and never fetched again.
//!
//! Page states move `Idle -> Fetching -> Transforming -> Loading ->
//! Committed -> Idle`, or end in `Failed`; pages committed by an earlier run
//! are `Skipped`.

use std::{
  collections::{BTreeSet, VecDeque},
  sync::Arc,
  time::Duration,
};

use chrono::{Datelike as _, NaiveDate, Utc};
use contrap_client::{
  AttemptOutcome, Client, FetchBudget, FetchEvent, FetchRequest, Transport, decode_body,
};
use contrap_core::{
  Classify, ErrorClass,
  entity::{Freshness, ReferenceEntity, TaxId},
  fragment::{Batch, RootEntity, Transformed},
  ledger::{DateRange, PageKey, Source},
  store::{LoadLimits, ProcurementStore},
};
use contrap_normalize::{NormalizeOptions, RawRecord, process};
use serde_json::Value;
use strum::Display;
use tokio::{
  sync::{Mutex, mpsc},
  task::JoinSet,
};
use tokio_util::sync::CancellationToken;
use tracing::{Instrument as _, debug, info, info_span, warn};
use uuid::Uuid;

use crate::{
  cache::{RawCache, digest},
  error::{Error, Result},
  plan::{self, Mode, WorkUnit},
  report,
  summary::{FetchStats, RunSummary, Tally, UncommittedPage},
};

// ─── Settings ────────────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct Settings {
  pub sources:                Vec<Source>,
  pub workers:                usize,
  pub batch_size:             usize,
  pub chunk_days:             u32,
  pub incremental_since:      Option<NaiveDate>,
  pub enrich_limit:           usize,
  pub commit_timeout:         Duration,
  pub strict_tax_id_checksum: bool,
  pub range_budget:           FetchBudget,
  pub entity_budget:          FetchBudget,
}

impl Default for Settings {
  fn default() -> Self {
    Self {
      sources:                vec![
        Source::Announcements,
        Source::Contracts,
        Source::Modifications,
      ],
      workers:                2,
      batch_size:             500,
      chunk_days:             0,
      incremental_since:      None,
      enrich_limit:           100,
      commit_timeout:         Duration::from_secs(60),
      strict_tax_id_checksum: false,
      range_budget:           FetchBudget::slow_upstream(),
      entity_budget:          FetchBudget::standard(),
    }
  }
}

#[derive(Debug, Clone, Copy, Display)]
#[strum(serialize_all = "snake_case")]
enum PageState {
  Idle,
  Fetching,
  Skipped,
  Transforming,
  Loading,
  Committed,
  Failed,
}

fn page_state(page: &PageKey, state: PageState) {
  debug!(%page, %state, "page state");
}

// ─── Pipeline ────────────────────────────────────────────────────────────────

pub struct Pipeline<S, T> {
  store:    Arc<S>,
  client:   Client<T>,
  settings: Settings,
  cache:    Option<RawCache>,
  cancel:   CancellationToken,
}

impl<S, T> Pipeline<S, T>
where
  S: ProcurementStore + 'static,
  T: Transport,
{
  pub fn new(store: Arc<S>, client: Client<T>, settings: Settings) -> Self {
    Self {
      store,
      client,
      settings,
      cache: None,
      cancel: CancellationToken::new(),
    }
  }

  pub fn with_cache(mut self, cache: RawCache) -> Self {
    self.cache = Some(cache);
    self
  }

  /// Cancelling `token` stops every fetch and rolls back in-flight loads.
  pub fn with_cancel(mut self, token: CancellationToken) -> Self {
    self.cancel = token;
    self
  }

  pub async fn run(&self, mode: Mode) -> RunSummary {
    self.run_at(mode, Utc::now().date_naive()).await
  }

  /// Run as if today were `today`; windows end the day before.
  pub async fn run_at(&self, mode: Mode, today: NaiveDate) -> RunSummary {
    let run_id = Uuid::new_v4();
    let started_at = Utc::now();
    let span = info_span!("run", %run_id, %mode);

    let (tally, fetches, error) = self.execute(&mode, today).instrument(span).await;

    let status = RunSummary::status_for(&tally, error.is_some());
    let summary = RunSummary {
      run_id,
      mode: mode.to_string(),
      status,
      started_at,
      finished_at: Utc::now(),
      tally,
      fetches,
      error: error.map(|e| e.to_string()),
    };
    info!(
      %run_id,
      status = ?summary.status,
      pages_committed = summary.tally.pages_committed,
      pages_skipped = summary.tally.pages_skipped,
      uncommitted = summary.tally.uncommitted.len(),
      "run finished"
    );
    if let Some(cache) = &self.cache {
      match report::write(&cache.dir().join(report::REPORT_DIR), &summary).await {
        Ok(path) => info!(path = %path.display(), "run report written"),
        Err(e) => warn!(error = %e, "could not write run report"),
      }
    }
    summary
  }

  async fn execute(&self, mode: &Mode, today: NaiveDate) -> (Tally, FetchStats, Option<Error>) {
    let (tx, rx) = mpsc::unbounded_channel();
    let collector = tokio::spawn(collect_events(rx));

    let run = Arc::new(Run {
      store:    Arc::clone(&self.store),
      client:   self.client.clone().with_events(tx),
      settings: self.settings.clone(),
      cache:    self.cache.clone(),
      cancel:   self.cancel.child_token(),
    });

    let mut tally = Tally::default();
    let result = run.drive(mode, today, &mut tally).await;
    drop(run);

    let fetches = collector.await.unwrap_or_default();
    if let Err(e) = &result {
      warn!(error = %e, class = ?e.class(), "run aborted");
    }
    (tally, fetches, result.err())
  }
}

async fn collect_events(mut rx: mpsc::UnboundedReceiver<FetchEvent>) -> FetchStats {
  let mut stats = FetchStats::default();
  while let Some(event) = rx.recv().await {
    stats.record(&event);
    let elapsed_ms = event.elapsed.as_millis() as u64;
    match &event.outcome {
      AttemptOutcome::Success { records } => debug!(
        source = %event.source, attempt = event.attempt, elapsed_ms, records,
        "fetch succeeded"
      ),
      AttemptOutcome::Retrying { error, delay } => warn!(
        source = %event.source, attempt = event.attempt, elapsed_ms,
        delay_ms = delay.as_millis() as u64, %error,
        "fetch attempt failed, retrying"
      ),
      AttemptOutcome::Failed { error } => warn!(
        source = %event.source, attempt = event.attempt, elapsed_ms, %error,
        "fetch gave up"
      ),
    }
  }
  stats
}

// ─── One run ─────────────────────────────────────────────────────────────────

/// State shared by the workers of one run.
struct Run<S, T> {
  store:    Arc<S>,
  client:   Client<T>,
  settings: Settings,
  cache:    Option<RawCache>,
  cancel:   CancellationToken,
}

type Queue = Arc<Mutex<VecDeque<WorkUnit>>>;

impl<S, T> Run<S, T>
where
  S: ProcurementStore + 'static,
  T: Transport,
{
  async fn drive(self: &Arc<Self>, mode: &Mode, today: NaiveDate, tally: &mut Tally) -> Result<()> {
    if let Mode::Entity(tax_id) = mode {
      return self.enrich(tax_id, tally).await;
    }

    let yesterday = today
      .pred_opt()
      .ok_or_else(|| Error::Config(format!("no day before {today}")))?;

    let mut units = VecDeque::new();
    for &source in &self.settings.sources {
      let watermark = self.store.watermark(source).await.map_err(Error::store)?;
      match plan::window(mode, yesterday, watermark, self.settings.incremental_since)? {
        Some(window) => {
          let planned = plan::split(source, window, self.settings.chunk_days);
          info!(%source, %window, units = planned.len(), "planned");
          units.extend(planned);
        }
        None => info!(%source, "nothing to fetch"),
      }
    }

    self.run_units(units, tally).await?;
    self.enrich_pending(tally).await
  }

  async fn run_units(self: &Arc<Self>, units: VecDeque<WorkUnit>, tally: &mut Tally) -> Result<()> {
    let queue: Queue = Arc::new(Mutex::new(units));
    let mut workers = JoinSet::new();
    for id in 0..self.settings.workers.max(1) {
      let run = Arc::clone(self);
      let queue = Arc::clone(&queue);
      workers.spawn(run.worker(queue).instrument(info_span!("worker", id)));
    }

    let mut first_error = None;
    while let Some(joined) = workers.join_next().await {
      match joined {
        Ok((worker_tally, error)) => {
          tally.merge(worker_tally);
          if let Some(e) = error {
            first_error.get_or_insert(e);
          }
        }
        Err(e) => {
          self.cancel.cancel();
          first_error.get_or_insert(Error::Join(e));
        }
      }
    }
    first_error.map_or(Ok(()), Err)
  }

  async fn worker(self: Arc<Self>, queue: Queue) -> (Tally, Option<Error>) {
    let mut tally = Tally::default();
    loop {
      if self.cancel.is_cancelled() {
        return (tally, Some(contrap_client::Error::Cancelled.into()));
      }
      let Some(unit) = queue.lock().await.pop_front() else {
        return (tally, None);
      };
      let span = info_span!("unit", source = %unit.source, year = unit.year);
      if let Err(e) = self.process_unit(&unit, &mut tally).instrument(span).await {
        self.cancel.cancel();
        return (tally, Some(e));
      }
    }
  }

  // ── Units ─────────────────────────────────────────────────────────────

  /// Errors returned from here abort the run; everything else is recorded
  /// against the pages it affected.
  async fn process_unit(&self, unit: &WorkUnit, tally: &mut Tally) -> Result<()> {
    let mut pending = Vec::new();
    for (i, chunk) in unit.chunks.iter().enumerate() {
      if self.store.is_range_complete(unit.source, *chunk).await.map_err(Error::store)? {
        debug!(range = %chunk, "range already complete");
        tally.ranges_skipped += 1;
      } else {
        pending.push(i);
      }
    }
    if pending.is_empty() {
      return Ok(());
    }

    for &i in &pending {
      let page = PageKey { source: unit.source, range: unit.chunks[i], index: 0 };
      page_state(&page, PageState::Fetching);
    }
    let request = FetchRequest::for_year(unit.source, unit.year);
    let records = match self.fetch_cached(&request, tally).await {
      Ok(records) => records,
      Err(e) if e.is_fatal_for_run() => return Err(e),
      Err(e) => {
        warn!(error = %e, "fetch failed; pending ranges recorded as failed");
        for &i in &pending {
          let page = PageKey { source: unit.source, range: unit.chunks[i], index: 0 };
          self.fail_page(page, &e, tally).await?;
        }
        return Ok(());
      }
    };

    let mut buckets: Vec<Vec<Value>> = vec![Vec::new(); unit.chunks.len()];
    for value in records {
      let date = RawRecord::decode(unit.source, &value).publication_date();
      match unit.place(date) {
        Some(i) if pending.contains(&i) => buckets[i].push(value),
        Some(_) => {}
        None => tally.out_of_window += 1,
      }
    }

    let mut complete = unit.chunks.len() - pending.len();
    for i in pending {
      let values = std::mem::take(&mut buckets[i]);
      if self.load_chunk(unit.source, unit.chunks[i], &values, tally).await? {
        complete += 1;
      }
    }

    if complete == unit.chunks.len() {
      if let Some(cache) = &self.cache {
        if let Err(e) = cache.remove(&request.cache_key()).await {
          warn!(error = %e, "could not drop cached response");
        }
      }
    }
    Ok(())
  }

  /// Returns whether the chunk is now complete.
  async fn load_chunk(
    &self,
    source: Source,
    range: DateRange,
    values: &[Value],
    tally: &mut Tally,
  ) -> Result<bool> {
    let committed: BTreeSet<u32> = self
      .store
      .committed_indices(source, range)
      .await
      .map_err(Error::store)?
      .into_iter()
      .collect();

    let pages: Vec<&[Value]> = values.chunks(self.settings.batch_size.max(1)).collect();
    let page_count = pages.len() as u32;
    let mut all_committed = true;

    for (index, records) in pages.into_iter().enumerate() {
      let page = PageKey { source, range, index: index as u32 };
      if committed.contains(&page.index) {
        page_state(&page, PageState::Skipped);
        tally.pages_skipped += 1;
        continue;
      }
      if !self.load_page(page, records, tally).await? {
        all_committed = false;
      }
    }

    page_state(&PageKey { source, range, index: page_count }, PageState::Idle);
    if !all_committed {
      return Ok(false);
    }
    let marked = self
      .store
      .complete_range(source, range, page_count)
      .await
      .map_err(Error::store)?;
    if marked {
      info!(%source, %range, pages = page_count, "range complete");
    }
    Ok(marked)
  }

  fn derive(&self, page: PageKey, digest: Option<String>, records: &[Value]) -> Batch {
    let opts = NormalizeOptions {
      fallback_year:   Some(page.range.start.year()),
      strict_checksum: self.settings.strict_tax_id_checksum,
    };
    Batch {
      page: Some(page),
      digest,
      records: records
        .iter()
        .map(|value| process(&RawRecord::decode(page.source, value), &opts))
        .collect(),
    }
  }

  fn limits(&self) -> LoadLimits {
    LoadLimits {
      commit_timeout: self.settings.commit_timeout,
      cancel:         self.cancel.clone(),
    }
  }

  /// Returns whether the page committed.
  async fn load_page(&self, page: PageKey, records: &[Value], tally: &mut Tally) -> Result<bool> {
    let digest = serde_json::to_vec(records).ok().map(|bytes| digest(&bytes));
    let mut rederived = false;

    loop {
      page_state(&page, PageState::Transforming);
      let batch = self.derive(page, digest.clone(), records);
      page_state(&page, PageState::Loading);

      match self.store.load(batch.clone(), self.limits()).await {
        Ok(report) => {
          if report.already_committed {
            page_state(&page, PageState::Skipped);
            tally.pages_skipped += 1;
          } else {
            page_state(&page, PageState::Committed);
            info!(
              %page,
              records = batch.len(),
              rows_added = report.rows_added,
              unlinked_awards = report.unlinked_awards,
              "page committed"
            );
            tally.pages_committed += 1;
            tally.add_commit(&batch, &report);
            tally.add_invalid(page, records, &batch);
          }
          return Ok(true);
        }
        Err(e) if e.class() == ErrorClass::SchemaViolation && !rederived => {
          warn!(%page, error = %e, "batch rejected; re-deriving once");
          rederived = true;
        }
        Err(e) if e.is_fatal_for_run() => return Err(Error::store(e)),
        Err(e) => {
          page_state(&page, PageState::Failed);
          self.fail_page(page, &Error::store(e), tally).await?;
          return Ok(false);
        }
      }
    }
  }

  async fn fail_page(&self, page: PageKey, error: &Error, tally: &mut Tally) -> Result<()> {
    let message = error.to_string();
    warn!(%page, error = %message, "page not committed");
    self
      .store
      .record_failure(page, message.clone())
      .await
      .map_err(Error::store)?;
    tally.uncommitted.push(UncommittedPage { page, error: message });
    Ok(())
  }

  // ── Fetching ──────────────────────────────────────────────────────────

  async fn fetch_cached(&self, request: &FetchRequest, tally: &mut Tally) -> Result<Vec<Value>> {
    let key = request.cache_key();
    if let Some(cache) = &self.cache {
      match cache.get(&key).await {
        Ok(Some(body)) => match decode_body(&body) {
          Ok(records) => {
            debug!(%key, records = records.len(), "using cached response");
            tally.cache_hits += 1;
            return Ok(records);
          }
          Err(e) => warn!(%key, error = %e, "ignoring unreadable cached response"),
        },
        Ok(None) => {}
        Err(e) => warn!(error = %e, "raw cache unavailable"),
      }
    }

    let page = self
      .client
      .fetch(request, &self.settings.range_budget, &self.cancel)
      .await?;
    info!(%key, records = page.records.len(), attempts = page.attempts, "fetched");

    if let Some(cache) = &self.cache {
      if let Err(e) = cache.put(&key, &page.body).await {
        warn!(error = %e, "could not cache response");
      }
    }
    Ok(page.records)
  }

  // ── Entities ──────────────────────────────────────────────────────────

  async fn enrich_pending(&self, tally: &mut Tally) -> Result<()> {
    if self.settings.enrich_limit == 0 || self.cancel.is_cancelled() {
      return Ok(());
    }
    let stubs = self
      .store
      .pending_stubs(self.settings.enrich_limit)
      .await
      .map_err(Error::store)?;
    if !stubs.is_empty() {
      info!(count = stubs.len(), "enriching stub entities");
    }
    for stub in stubs {
      if self.cancel.is_cancelled() {
        break;
      }
      self.enrich(&stub.tax_id, tally).await?;
    }
    Ok(())
  }

  /// Fetch one organization and load it. An empty answer still touches the
  /// row so the next pass moves on to other stubs.
  async fn enrich(&self, tax_id: &TaxId, tally: &mut Tally) -> Result<()> {
    let request = FetchRequest::for_entity(tax_id);
    let fetched = self
      .client
      .fetch(&request, &self.settings.entity_budget, &self.cancel)
      .await;
    let records = match fetched {
      Ok(page) => page.records,
      Err(e) if e.is_fatal_for_run() => return Err(e.into()),
      Err(e) => {
        warn!(%tax_id, error = %e, "entity fetch failed");
        tally.enrichment_failures += 1;
        return Ok(());
      }
    };

    let opts = NormalizeOptions {
      fallback_year:   None,
      strict_checksum: self.settings.strict_tax_id_checksum,
    };
    let mut transformed: Vec<Transformed> = records
      .iter()
      .map(|value| process(&RawRecord::decode(Source::Entities, value), &opts))
      .collect();
    let found = transformed.iter().any(|t| {
      matches!(&t.root, Some(RootEntity::Entity(e))
        if &e.tax_id == tax_id && e.freshness == Freshness::Enriched)
    });
    if !found {
      debug!(%tax_id, "upstream has no entity record");
      transformed.push(Transformed {
        root: Some(RootEntity::Entity(ReferenceEntity::stub(tax_id.clone(), None))),
        ..Transformed::default()
      });
    }

    let batch = Batch { page: None, digest: None, records: transformed };
    match self.store.load(batch.clone(), self.limits()).await {
      Ok(report) => {
        tally.add_commit(&batch, &report);
        if found {
          info!(%tax_id, "entity enriched");
          tally.entities_enriched += 1;
        }
        Ok(())
      }
      Err(e) if e.is_fatal_for_run() => Err(Error::store(e)),
      Err(e) => {
        warn!(%tax_id, error = %e, "entity load failed");
        tally.enrichment_failures += 1;
        Ok(())
      }
    }
  }
}

#[cfg(test)]
mod tests {
  use std::{
    collections::HashMap,
    future::Future,
    sync::{
      Mutex as StdMutex,
      atomic::{AtomicU32, Ordering},
    },
  };

  use contrap_client::{ClientConfig, TransportError, TransportRequest, TransportResponse};
  use contrap_store_sqlite::SqliteStore;
  use serde_json::json;

  use super::*;
  use crate::summary::RunStatus;

  // ── Fake upstream ─────────────────────────────────────────────────────

  #[derive(Clone)]
  enum Reply {
    Body(String),
    Status(u16, &'static str),
  }

  /// Answers by `(endpoint, first query value)`; unknown routes get `[]`.
  #[derive(Default)]
  struct FakeApi {
    routes: StdMutex<HashMap<(String, String), Reply>>,
    calls:  AtomicU32,
  }

  impl FakeApi {
    fn route(&self, endpoint: &str, key: &str, reply: Reply) {
      self
        .routes
        .lock()
        .unwrap()
        .insert((endpoint.to_owned(), key.to_owned()), reply);
    }

    fn calls(&self) -> u32 { self.calls.load(Ordering::SeqCst) }
  }

  /// Local handle so the foreign `Transport` trait can be implemented
  /// (orphan rule forbids `impl Transport for Arc<FakeApi>` here).
  #[derive(Clone)]
  struct FakeTransport(Arc<FakeApi>);

  impl std::ops::Deref for FakeTransport {
    type Target = FakeApi;

    fn deref(&self) -> &FakeApi { &self.0 }
  }

  impl Transport for FakeTransport {
    fn get(
      &self,
      request: TransportRequest,
    ) -> impl Future<Output = std::result::Result<TransportResponse, TransportError>>
    + Send
    + '_ {
      self.calls.fetch_add(1, Ordering::SeqCst);
      let endpoint = request.url.rsplit('/').next().unwrap_or_default().to_owned();
      let key = request.query.first().map(|(_, v)| v.clone()).unwrap_or_default();
      let reply = self.routes.lock().unwrap().get(&(endpoint, key)).cloned();
      async move {
        Ok(match reply {
          Some(Reply::Body(body)) => TransportResponse { status: 200, body },
          Some(Reply::Status(status, body)) => {
            TransportResponse { status, body: body.to_owned() }
          }
          None => TransportResponse { status: 200, body: "[]".into() },
        })
      }
    }
  }

  fn announcement(n: u32, date: &str) -> Value {
    json!({
      "nAnuncio": format!("{n}/2024"),
      "nifEntidade": "512021155",
      "designacaoEntidade": "Município de Exemplo",
      "dataPublicacao": date,
      "PrecoBase": "1000.00",
      "CPVs": ["45000000-7 - Obras de construção"],
    })
  }

  fn contract(id: u32, notice: u32) -> Value {
    json!({
      "idcontrato": id.to_string(),
      "nAnuncio": format!("{notice}/2024"),
      "nifEntidade": "512021155",
      "adjudicatarios": ["123456789 - Construtora, SA"],
      "precoContratual": "900.00",
      "dataPublicacao": "2024-05-02",
    })
  }

  fn modification(contract: u32, value: &str) -> Value {
    json!({
      "idContrato": contract.to_string(),
      "dataModificacao": "2024-06-01",
      "tipoModificacao": "Trabalhos complementares",
      "valorNovo": value,
    })
  }

  fn body(values: &[Value]) -> Reply {
    Reply::Body(Value::Array(values.to_vec()).to_string())
  }

  fn announcements() -> Vec<Value> {
    (1..=5).map(|n| announcement(n, &format!("2024-03-0{n}"))).collect()
  }

  fn fast_budget(attempts: u32) -> FetchBudget {
    FetchBudget {
      max_attempts:    attempts,
      attempt_timeout: Duration::from_secs(5),
      base_delay:      Duration::from_millis(1),
      max_delay:       Duration::from_millis(2),
      multiplier:      2.0,
      deadline:        Duration::from_secs(30),
    }
  }

  fn settings() -> Settings {
    Settings {
      workers: 2,
      batch_size: 2,
      enrich_limit: 0,
      range_budget: fast_budget(2),
      entity_budget: fast_budget(1),
      ..Settings::default()
    }
  }

  async fn pipeline(
    api: &Arc<FakeApi>,
    store: &Arc<SqliteStore>,
    settings: Settings,
  ) -> Pipeline<SqliteStore, FakeTransport> {
    let config = ClientConfig {
      access_token: "secret".into(),
      rate_limit_per_sec: 1000,
      ..ClientConfig::default()
    };
    let client = Client::new(config, FakeTransport(Arc::clone(api))).unwrap();
    Pipeline::new(Arc::clone(store), client, settings)
  }

  async fn store() -> Arc<SqliteStore> {
    Arc::new(SqliteStore::open_in_memory().await.unwrap())
  }

  fn today() -> NaiveDate { NaiveDate::from_ymd_opt(2025, 1, 15).unwrap() }

  fn year_2024() -> DateRange { DateRange::year(2024).unwrap() }

  // ── Runs ──────────────────────────────────────────────────────────────

  #[tokio::test]
  async fn year_run_commits_every_page() {
    let api = Arc::new(FakeApi::default());
    api.route("GetInfoAnuncio", "2024", body(&announcements()));
    api.route("GetInfoContrato", "2024", body(&[contract(10, 1), contract(11, 2)]));
    api.route("GetInfoModContrat", "2024", body(&[modification(10, "950.00")]));
    let store = store().await;

    let summary = pipeline(&api, &store, settings()).await.run_at(Mode::Year(2024), today()).await;

    assert_eq!(summary.status, RunStatus::Completed, "{summary}");
    assert_eq!(summary.exit_code(), 0);
    // 5 announcements in pages of 2, 2 contracts in one page, 1 modification.
    assert_eq!(summary.tally.pages_committed, 5);
    assert_eq!(summary.tally.records.opportunities, 5);
    assert_eq!(summary.tally.records.awards, 2);
    assert_eq!(summary.tally.records.modifications, 1);
    assert_eq!(summary.fetches.requests, 3);

    for source in [Source::Announcements, Source::Contracts, Source::Modifications] {
      assert!(store.is_range_complete(source, year_2024()).await.unwrap(), "{source}");
    }
    let counts = store.row_counts().await.unwrap();
    assert_eq!(counts.opportunities, 5);
    assert_eq!(counts.awards, 2);
    assert_eq!(counts.award_modifications, 1);
    // Applied whichever of the contract and its modification loaded first.
    let amended = store.award("10").await.unwrap().unwrap();
    assert_eq!(amended.award.contract_price, "950".parse().ok());
    assert!(store.integrity_scan().await.unwrap().is_clean());
  }

  #[tokio::test]
  async fn completed_ranges_are_not_fetched_again() {
    let api = Arc::new(FakeApi::default());
    api.route("GetInfoAnuncio", "2024", body(&announcements()));
    let store = store().await;
    let settings = Settings { sources: vec![Source::Announcements], ..settings() };

    pipeline(&api, &store, settings.clone()).await.run_at(Mode::Year(2024), today()).await;
    let calls = api.calls();

    let again = pipeline(&api, &store, settings).await.run_at(Mode::Year(2024), today()).await;
    assert_eq!(again.status, RunStatus::Completed);
    assert_eq!(again.tally.ranges_skipped, 1);
    assert_eq!(again.tally.pages_committed, 0);
    assert_eq!(api.calls(), calls);
  }

  #[tokio::test]
  async fn restart_commits_exactly_the_remaining_pages() {
    let api = Arc::new(FakeApi::default());
    let records = announcements();
    api.route("GetInfoAnuncio", "2024", body(&records));
    let store = store().await;
    let settings = Settings { sources: vec![Source::Announcements], ..settings() };

    // A previous run got as far as pages 0 and 1 before dying.
    let first = pipeline(&api, &store, settings.clone()).await;
    for index in 0..2u32 {
      let page = PageKey { source: Source::Announcements, range: year_2024(), index };
      let slice = &records[index as usize * 2..index as usize * 2 + 2];
      let run = Run {
        store:    Arc::clone(&store),
        client:   first.client.clone(),
        settings: settings.clone(),
        cache:    None,
        cancel:   CancellationToken::new(),
      };
      let batch = run.derive(page, None, slice);
      store.load(batch, LoadLimits::default()).await.unwrap();
    }

    let summary = pipeline(&api, &store, settings).await.run_at(Mode::Year(2024), today()).await;
    assert_eq!(summary.status, RunStatus::Completed, "{summary}");
    assert_eq!(summary.tally.pages_skipped, 2);
    assert_eq!(summary.tally.pages_committed, 1);
    assert_eq!(summary.tally.records.opportunities, 1);
    assert_eq!(
      store.committed_indices(Source::Announcements, year_2024()).await.unwrap(),
      vec![0, 1, 2]
    );
    assert_eq!(store.row_counts().await.unwrap().opportunities, 5);
  }

  #[tokio::test]
  async fn exhausted_retries_leave_a_partial_run() {
    let api = Arc::new(FakeApi::default());
    api.route("GetInfoAnuncio", "2024", body(&announcements()));
    api.route("GetInfoContrato", "2024", Reply::Status(503, "unavailable"));
    let store = store().await;

    let summary = pipeline(&api, &store, settings()).await.run_at(Mode::Year(2024), today()).await;

    assert_eq!(summary.status, RunStatus::Partial, "{summary}");
    assert_eq!(summary.exit_code(), 2);
    assert_eq!(summary.tally.uncommitted.len(), 1);
    assert_eq!(summary.tally.uncommitted[0].page.source, Source::Contracts);
    assert_eq!(summary.fetches.retries, 1);
    assert_eq!(summary.fetches.failures, 1);

    let failed = store.failed_pages().await.unwrap();
    assert_eq!(failed.len(), 1);
    assert!(failed[0].last_error.contains("503"), "{}", failed[0].last_error);
    assert!(store.is_range_complete(Source::Announcements, year_2024()).await.unwrap());
  }

  #[tokio::test]
  async fn rejected_token_fails_the_run() {
    let api = Arc::new(FakeApi::default());
    api.route("GetInfoAnuncio", "2024", Reply::Status(401, "Unauthorized"));
    api.route("GetInfoContrato", "2024", Reply::Status(401, "Unauthorized"));
    let store = store().await;

    let summary = pipeline(&api, &store, settings()).await.run_at(Mode::Year(2024), today()).await;

    assert_eq!(summary.status, RunStatus::Failed);
    assert_eq!(summary.exit_code(), 1);
    assert!(summary.error.is_some());
    assert_eq!(store.row_counts().await.unwrap().opportunities, 0);
  }

  #[tokio::test]
  async fn client_error_aborts_the_run() {
    let api = Arc::new(FakeApi::default());
    api.route("GetInfoAnuncio", "2024", Reply::Status(404, "Not Found"));
    let store = store().await;
    let settings = Settings { sources: vec![Source::Announcements], ..settings() };

    let summary = pipeline(&api, &store, settings).await.run_at(Mode::Year(2024), today()).await;

    assert_eq!(summary.status, RunStatus::Failed, "{summary}");
    assert_eq!(summary.exit_code(), 1);
    assert!(summary.error.as_deref().is_some_and(|e| e.contains("404")), "{summary}");
    assert!(summary.tally.uncommitted.is_empty());
    assert_eq!(summary.fetches.retries, 0);
    assert!(store.failed_pages().await.unwrap().is_empty());
  }

  #[tokio::test]
  async fn cancelled_run_fails_without_writing() {
    let api = Arc::new(FakeApi::default());
    api.route("GetInfoAnuncio", "2024", body(&announcements()));
    let store = store().await;
    let cancel = CancellationToken::new();
    cancel.cancel();

    let summary = pipeline(&api, &store, settings())
      .await
      .with_cancel(cancel)
      .run_at(Mode::Year(2024), today())
      .await;

    assert_eq!(summary.status, RunStatus::Failed);
    assert_eq!(store.row_counts().await.unwrap().opportunities, 0);
  }

  #[tokio::test]
  async fn records_outside_the_window_are_skipped() {
    let api = Arc::new(FakeApi::default());
    let records = vec![
      announcement(1, "2024-01-10"),
      announcement(2, "2024-03-10"),
      announcement(3, "NULL"),
    ];
    api.route("GetInfoAnuncio", "2024", body(&records));
    let store = store().await;
    let settings = Settings {
      sources: vec![Source::Announcements],
      incremental_since: NaiveDate::from_ymd_opt(2024, 3, 1),
      ..settings()
    };
    let today = NaiveDate::from_ymd_opt(2024, 4, 1).unwrap();

    let summary = pipeline(&api, &store, settings).await.run_at(Mode::Incremental, today).await;

    assert_eq!(summary.status, RunStatus::Completed, "{summary}");
    assert_eq!(summary.tally.out_of_window, 1);
    assert_eq!(summary.tally.records.opportunities, 2);
    assert_eq!(
      store.watermark(Source::Announcements).await.unwrap(),
      NaiveDate::from_ymd_opt(2024, 3, 31)
    );
  }

  // ── Cache ─────────────────────────────────────────────────────────────

  #[tokio::test]
  async fn interrupted_unit_reuses_the_cached_payload() {
    let dir = tempfile::tempdir().unwrap();
    let cache = RawCache::new(dir.path(), None);
    let api = Arc::new(FakeApi::default());
    let store = store().await;
    let settings = Settings { sources: vec![Source::Announcements], ..settings() };

    // Payload as it was when the interrupted run fetched it.
    let key = FetchRequest::for_year(Source::Announcements, 2024).cache_key();
    cache.put(&key, &Value::Array(announcements()).to_string()).await.unwrap();
    api.route("GetInfoAnuncio", "2024", body(&[announcement(9, "2024-03-09")]));

    let summary = pipeline(&api, &store, settings)
      .await
      .with_cache(cache.clone())
      .run_at(Mode::Year(2024), today())
      .await;

    assert_eq!(summary.tally.cache_hits, 1);
    assert_eq!(summary.tally.records.opportunities, 5);
    assert_eq!(api.calls(), 0);
    // The unit completed, so the next run fetches fresh data.
    assert_eq!(cache.get(&key).await.unwrap(), None);
  }

  #[tokio::test]
  async fn run_report_and_invalid_records_land_under_the_cache_dir() {
    let dir = tempfile::tempdir().unwrap();
    let api = Arc::new(FakeApi::default());
    let mut records = announcements();
    records.push(json!({
      "nAnuncio": "9/2024",
      "dataPublicacao": "2024-03-09",
      "PrecoBase": "muito",
    }));
    api.route("GetInfoAnuncio", "2024", body(&records));
    let store = store().await;
    let settings = Settings { sources: vec![Source::Announcements], ..settings() };

    let summary = pipeline(&api, &store, settings)
      .await
      .with_cache(RawCache::new(dir.path(), None))
      .run_at(Mode::Year(2024), today())
      .await;
    assert_eq!(summary.status, RunStatus::Completed, "{summary}");

    let reports = dir.path().join(report::REPORT_DIR);
    let written: Value = serde_json::from_str(
      &std::fs::read_to_string(report::summary_path(&reports, &summary)).unwrap(),
    )
    .unwrap();
    assert_eq!(written["pages_committed"], 3);

    let lines = std::fs::read_to_string(report::invalid_path(&reports, &summary)).unwrap();
    let rows: Vec<Value> = lines.lines().map(|l| serde_json::from_str(l).unwrap()).collect();
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0]["record"]["nAnuncio"], "9/2024");
    let kinds: Vec<_> = rows[0]["warnings"]
      .as_array()
      .unwrap()
      .iter()
      .map(|w| w["kind"].as_str().unwrap().to_owned())
      .collect();
    assert_eq!(kinds, vec!["missing_issuer", "invalid_amount"]);
  }

  // ── Entities ──────────────────────────────────────────────────────────

  #[tokio::test]
  async fn entity_mode_enriches_one_organization() {
    let api = Arc::new(FakeApi::default());
    api.route(
      "GetInfoEntidades",
      "512021155",
      body(&[json!({
        "nif": "512021155",
        "designacao": "Município de Exemplo",
        "pais": "Portugal",
        "localidade": "Exemplo",
      })]),
    );
    let store = store().await;
    let tax_id = TaxId::parse("512021155").unwrap();

    let summary = pipeline(&api, &store, settings())
      .await
      .run_at(Mode::Entity(tax_id.clone()), today())
      .await;

    assert_eq!(summary.status, RunStatus::Completed, "{summary}");
    assert_eq!(summary.tally.entities_enriched, 1);
    let entity = store.entity(&tax_id).await.unwrap().unwrap();
    assert_eq!(entity.freshness, Freshness::Enriched);
    assert_eq!(entity.country.as_deref(), Some("Portugal"));
  }

  #[tokio::test]
  async fn enrichment_pass_follows_a_range_run() {
    let api = Arc::new(FakeApi::default());
    api.route("GetInfoContrato", "2024", body(&[contract(10, 1)]));
    api.route(
      "GetInfoEntidades",
      "123456789",
      body(&[json!({ "nif": "123456789", "designacao": "Construtora, SA" })]),
    );
    let store = store().await;
    let settings = Settings {
      sources: vec![Source::Contracts],
      enrich_limit: 10,
      ..settings()
    };

    let summary = pipeline(&api, &store, settings).await.run_at(Mode::Year(2024), today()).await;

    assert_eq!(summary.status, RunStatus::Completed, "{summary}");
    // 512021155 has no upstream record; it is touched, not enriched.
    assert_eq!(summary.tally.entities_enriched, 1);
    let pending = store.pending_stubs(10).await.unwrap();
    assert_eq!(pending.len(), 1);
    assert_eq!(pending[0].tax_id.as_str(), "512021155");
  }
}
