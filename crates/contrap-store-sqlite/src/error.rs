//! Error type for `contrap-store-sqlite`.

use std::time::Duration;

use contrap_core::{Classify, ErrorClass};
use rusqlite::ErrorCode;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
  #[error("core error: {0}")]
  Core(#[from] contrap_core::Error),

  #[error("database error: {0}")]
  Database(tokio_rusqlite::Error),

  /// A foreign key, uniqueness or check constraint rejected the batch. The
  /// transaction was rolled back.
  #[error("integrity violation: {0}")]
  Integrity(String),

  #[error("commit did not finish within {0:?}")]
  CommitTimeout(Duration),

  #[error("commit cancelled")]
  Cancelled,

  #[error("could not decode stored {column}: {value:?}")]
  Decode { column: &'static str, value: String },
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

fn constraint_message(e: &rusqlite::Error) -> Option<String> {
  match e {
    rusqlite::Error::SqliteFailure(failure, msg)
      if failure.code == ErrorCode::ConstraintViolation =>
    {
      Some(msg.clone().unwrap_or_else(|| failure.to_string()))
    }
    _ => None,
  }
}

impl From<tokio_rusqlite::Error> for Error {
  fn from(e: tokio_rusqlite::Error) -> Self {
    let integrity = match &e {
      tokio_rusqlite::Error::Rusqlite(inner) => constraint_message(inner),
      _ => None,
    };
    integrity.map_or(Self::Database(e), Self::Integrity)
  }
}

impl From<rusqlite::Error> for Error {
  fn from(e: rusqlite::Error) -> Self {
    tokio_rusqlite::Error::Rusqlite(e).into()
  }
}

impl Classify for Error {
  fn class(&self) -> ErrorClass {
    match self {
      Self::Integrity(_) => ErrorClass::SchemaViolation,
      Self::Cancelled => ErrorClass::Cancelled,
      _ => ErrorClass::Fatal,
    }
  }
}
