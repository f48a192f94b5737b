//! The HTTP seam. The client only ever issues GETs, so that is all a
//! transport has to do.

use std::{future::Future, time::Duration};

use thiserror::Error;

use crate::error::{Error, Result};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransportRequest {
  pub url:     String,
  pub query:   Vec<(String, String)>,
  pub headers: Vec<(String, String)>,
  pub timeout: Duration,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransportResponse {
  pub status: u16,
  pub body:   String,
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum TransportError {
  #[error("timed out")]
  Timeout,
  #[error("{0}")]
  Connection(String),
}

pub trait Transport: Send + Sync + 'static {
  fn get(
    &self,
    request: TransportRequest,
  ) -> impl Future<Output = Result<TransportResponse, TransportError>> + Send + '_;
}

// ─── reqwest ─────────────────────────────────────────────────────────────────

/// Production transport. Cheap to clone; the inner [`reqwest::Client`] is
/// `Arc`-based.
#[derive(Debug, Clone)]
pub struct HttpTransport {
  client: reqwest::Client,
}

impl HttpTransport {
  pub fn new() -> Result<Self> {
    let client = reqwest::Client::builder()
      .connect_timeout(Duration::from_secs(30))
      .build()
      .map_err(|e| Error::Config(format!("failed to build HTTP client: {e}")))?;
    Ok(Self { client })
  }
}

fn transport_error(e: reqwest::Error) -> TransportError {
  if e.is_timeout() {
    TransportError::Timeout
  } else {
    TransportError::Connection(e.to_string())
  }
}

impl Transport for HttpTransport {
  fn get(
    &self,
    request: TransportRequest,
  ) -> impl Future<Output = Result<TransportResponse, TransportError>> + Send + '_
  {
    async move {
      let mut builder = self
        .client
        .get(&request.url)
        .query(&request.query)
        .timeout(request.timeout);
      for (name, value) in &request.headers {
        builder = builder.header(name.as_str(), value.as_str());
      }

      let resp = builder.send().await.map_err(transport_error)?;
      let status = resp.status().as_u16();
      // Served as text/plain even though the body is JSON.
      let body = resp.text().await.map_err(transport_error)?;
      Ok(TransportResponse { status, body })
    }
  }
}
