//! Error type for `contrap-client`.

use contrap_core::{Classify, ErrorClass};
use thiserror::Error;

use crate::transport::TransportError;

#[derive(Debug, Error)]
pub enum Error {
  #[error("request timed out")]
  Timeout,

  #[error("connection failed: {0}")]
  Connection(String),

  #[error("upstream returned HTTP {status}: {snippet}")]
  Status { status: u16, snippet: String },

  /// Missing or rejected access token.
  #[error("access token rejected: {0}")]
  Unauthorized(String),

  /// The upstream refused the request shape, e.g. missing parameters.
  #[error("request rejected: {0}")]
  BadRequest(String),

  #[error("could not decode response body: {0}")]
  Decode(String),

  #[error("gave up after {attempts} attempts: {last}")]
  Exhausted { attempts: u32, last: Box<Error> },

  #[error("deadline exceeded after {attempts} attempts")]
  DeadlineExceeded { attempts: u32 },

  #[error("fetch cancelled")]
  Cancelled,

  #[error("rate limiter task is gone")]
  LimiterClosed,

  #[error("invalid client configuration: {0}")]
  Config(String),
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

impl Error {
  /// Worth another attempt within the same fetch.
  pub fn is_transient(&self) -> bool {
    match self {
      Self::Timeout | Self::Connection(_) => true,
      Self::Status { status, .. } => *status == 429 || *status >= 500,
      _ => false,
    }
  }
}

impl From<TransportError> for Error {
  fn from(e: TransportError) -> Self {
    match e {
      TransportError::Timeout => Self::Timeout,
      TransportError::Connection(msg) => Self::Connection(msg),
    }
  }
}

impl Classify for Error {
  fn class(&self) -> ErrorClass {
    match self {
      Self::Exhausted { .. } | Self::DeadlineExceeded { .. } => {
        ErrorClass::TransientRemote
      }
      e if e.is_transient() => ErrorClass::TransientRemote,
      Self::Unauthorized(_) | Self::BadRequest(_) | Self::Config(_) => {
        ErrorClass::Configuration
      }
      // Any other 4xx is a caller bug; retrying or moving on will not help.
      Self::Status { status: 400..=499, .. } => ErrorClass::Configuration,
      Self::Cancelled => ErrorClass::Cancelled,
      _ => ErrorClass::Fatal,
    }
  }
}
