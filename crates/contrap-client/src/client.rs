//! The retrying fetch loop.

use std::{num::NonZeroU32, sync::Arc};

use contrap_core::{entity::TaxId, ledger::Source};
use serde_json::Value;
use tokio::{
  sync::mpsc::UnboundedSender,
  time::{Duration, Instant},
};
use tokio_util::sync::CancellationToken;

use crate::{
  budget::FetchBudget,
  error::{Error, Result},
  event::{AttemptOutcome, FetchEvent},
  limiter::RateLimiter,
  transport::{Transport, TransportRequest, TransportResponse},
};

pub const DEFAULT_BASE_URL: &str = "https://www.base.gov.pt/APIBase2";

/// Header carrying the access token. The spelling is the upstream's.
pub const TOKEN_HEADER: &str = "_AcessToken";

const SNIPPET_LEN: usize = 200;

pub fn endpoint(source: Source) -> &'static str {
  match source {
    Source::Announcements => "GetInfoAnuncio",
    Source::Contracts => "GetInfoContrato",
    Source::Modifications => "GetInfoModContrat",
    Source::Entities => "GetInfoEntidades",
  }
}

// ─── Requests & pages ────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchRequest {
  pub source: Source,
  pub params: Vec<(&'static str, String)>,
}

impl FetchRequest {
  /// Every record of `source` for a calendar year. The upstream has no finer
  /// filter.
  pub fn for_year(source: Source, year: i32) -> Self {
    Self { source, params: vec![("Ano", year.to_string())] }
  }

  pub fn for_entity(tax_id: &TaxId) -> Self {
    Self {
      source: Source::Entities,
      params: vec![("nifEntidade", tax_id.to_string())],
    }
  }

  /// A filesystem-safe identifier for this request.
  pub fn cache_key(&self) -> String {
    let mut key = self.source.to_string();
    for (name, value) in &self.params {
      key.push('-');
      key.push_str(name);
      key.push('=');
      key.push_str(value);
    }
    key
  }
}

/// A successfully fetched and decoded response.
#[derive(Debug, Clone, PartialEq)]
pub struct RawPage {
  pub records:  Vec<Value>,
  /// The response body as received, for caching and digests.
  pub body:     String,
  pub attempts: u32,
}

/// The body is either a bare list of records or `{ "items": [...] }`. An
/// empty body is an empty list.
pub fn decode_body(body: &str) -> Result<Vec<Value>> {
  if body.trim().is_empty() {
    return Ok(Vec::new());
  }
  let value: Value =
    serde_json::from_str(body).map_err(|e| Error::Decode(e.to_string()))?;
  match value {
    Value::Array(items) => Ok(items),
    Value::Object(mut map) => match map.remove("items") {
      Some(Value::Array(items)) => Ok(items),
      _ => Err(Error::Decode(format!(
        "expected a list or an object with \"items\", got keys {:?}",
        map.keys().take(5).collect::<Vec<_>>()
      ))),
    },
    other => Err(Error::Decode(format!("unexpected top-level value: {other}"))),
  }
}

// ─── Client ──────────────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct ClientConfig {
  pub base_url:           String,
  pub access_token:       String,
  pub rate_limit_per_sec: u32,
}

impl Default for ClientConfig {
  fn default() -> Self {
    Self {
      base_url:           DEFAULT_BASE_URL.to_owned(),
      access_token:       String::new(),
      rate_limit_per_sec: 5,
    }
  }
}

/// Rate-limited, retrying client for the procurement API.
///
/// Cheap to clone; every clone shares one transport and one rate limiter.
pub struct Client<T> {
  transport: Arc<T>,
  limiter:   RateLimiter,
  base_url:  Arc<str>,
  token:     Arc<str>,
  events:    Option<UnboundedSender<FetchEvent>>,
}

impl<T> Clone for Client<T> {
  fn clone(&self) -> Self {
    Self {
      transport: Arc::clone(&self.transport),
      limiter:   self.limiter.clone(),
      base_url:  Arc::clone(&self.base_url),
      token:     Arc::clone(&self.token),
      events:    self.events.clone(),
    }
  }
}

impl<T: Transport> Client<T> {
  /// Must be called from within a tokio runtime; spawns the limiter task.
  pub fn new(config: ClientConfig, transport: T) -> Result<Self> {
    if config.base_url.trim().is_empty() {
      return Err(Error::Config("base_url is empty".into()));
    }
    if config.access_token.trim().is_empty() {
      return Err(Error::Config("access_token is empty".into()));
    }
    let rate = NonZeroU32::new(config.rate_limit_per_sec)
      .ok_or_else(|| Error::Config("rate_limit_per_sec must be > 0".into()))?;

    Ok(Self {
      transport: Arc::new(transport),
      limiter:   RateLimiter::spawn(rate),
      base_url:  config.base_url.trim_end_matches('/').into(),
      token:     config.access_token.into(),
      events:    None,
    })
  }

  /// Emit one [`FetchEvent`] per attempt on `tx`.
  pub fn with_events(mut self, tx: UnboundedSender<FetchEvent>) -> Self {
    self.events = Some(tx);
    self
  }

  fn emit(&self, source: Source, attempt: u32, started: Instant, outcome: AttemptOutcome) {
    if let Some(tx) = &self.events {
      let _ = tx.send(FetchEvent {
        source,
        attempt,
        elapsed: started.elapsed(),
        outcome,
      });
    }
  }

  fn transport_request(&self, request: &FetchRequest, timeout: Duration) -> TransportRequest {
    TransportRequest {
      url: format!("{}/{}", self.base_url, endpoint(request.source)),
      query: request
        .params
        .iter()
        .map(|(k, v)| ((*k).to_owned(), v.clone()))
        .collect(),
      headers: vec![(TOKEN_HEADER.to_owned(), self.token.to_string())],
      timeout,
    }
  }

  /// Fetch one request, retrying transient failures within `budget`.
  ///
  /// Returns `Error::Exhausted` once `max_attempts` transient failures have
  /// been seen, `Error::DeadlineExceeded` when the next attempt or sleep
  /// would overrun the total deadline, and `Error::Cancelled` as soon as
  /// `cancel` fires.
  pub async fn fetch(
    &self,
    request: &FetchRequest,
    budget: &FetchBudget,
    cancel: &CancellationToken,
  ) -> Result<RawPage> {
    let started = Instant::now();
    let deadline = started + budget.deadline;
    let mut delays = budget.delays();
    let max_attempts = budget.max_attempts.max(1);
    let mut attempt = 0;

    loop {
      attempt += 1;
      let result = self.attempt(request, budget, cancel, deadline, attempt).await;

      let error = match result {
        Ok(page) => {
          self.emit(
            request.source,
            attempt,
            started,
            AttemptOutcome::Success { records: page.records.len() },
          );
          return Ok(page);
        }
        Err(e) => e,
      };

      let retry_after = if error.is_transient() && attempt < max_attempts {
        delays.next()
      } else {
        None
      };

      let final_error = match retry_after {
        Some(delay) if Instant::now() + delay < deadline => {
          self.emit(
            request.source,
            attempt,
            started,
            AttemptOutcome::Retrying { error: error.to_string(), delay },
          );
          tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(Error::Cancelled),
            _ = tokio::time::sleep(delay) => continue,
          }
        }
        Some(_) => Error::DeadlineExceeded { attempts: attempt },
        None if error.is_transient() => {
          Error::Exhausted { attempts: attempt, last: Box::new(error) }
        }
        None => error,
      };

      self.emit(
        request.source,
        attempt,
        started,
        AttemptOutcome::Failed { error: final_error.to_string() },
      );
      return Err(final_error);
    }
  }

  /// One rate-limited attempt, bounded by the attempt timeout and the
  /// overall deadline.
  async fn attempt(
    &self,
    request: &FetchRequest,
    budget: &FetchBudget,
    cancel: &CancellationToken,
    deadline: Instant,
    attempt: u32,
  ) -> Result<RawPage> {
    tokio::select! {
      biased;
      _ = cancel.cancelled() => return Err(Error::Cancelled),
      _ = tokio::time::sleep_until(deadline) => {
        return Err(Error::DeadlineExceeded { attempts: attempt - 1 });
      }
      permit = self.limiter.acquire() => permit?,
    }

    let remaining = deadline.saturating_duration_since(Instant::now());
    if remaining.is_zero() {
      return Err(Error::DeadlineExceeded { attempts: attempt - 1 });
    }
    let timeout = budget.attempt_timeout.min(remaining);
    let req = self.transport_request(request, timeout);

    let response = tokio::select! {
      biased;
      _ = cancel.cancelled() => return Err(Error::Cancelled),
      r = tokio::time::timeout(timeout, self.transport.get(req)) => r,
    };

    let response = match response {
      Ok(r) => r?,
      Err(_elapsed) if Instant::now() >= deadline => {
        return Err(Error::DeadlineExceeded { attempts: attempt });
      }
      Err(_elapsed) => return Err(Error::Timeout),
    };

    let records = interpret(&response)?;
    Ok(RawPage { records, body: response.body, attempts: attempt })
  }
}

fn snippet(body: &str) -> String {
  body.chars().take(SNIPPET_LEN).collect()
}

fn interpret(response: &TransportResponse) -> Result<Vec<Value>> {
  match response.status {
    200..=299 => decode_body(&response.body),
    400 if response.body.contains("Token is required") => {
      Err(Error::Unauthorized(snippet(&response.body)))
    }
    400 if response.body.contains("no Params submited") => {
      Err(Error::BadRequest(snippet(&response.body)))
    }
    401 | 403 => Err(Error::Unauthorized(snippet(&response.body))),
    status => Err(Error::Status { status, snippet: snippet(&response.body) }),
  }
}
