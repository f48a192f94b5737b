//! Error type for `contrap-etl`.

use std::path::PathBuf;

use contrap_core::{Classify, ErrorClass};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
  #[error("invalid configuration: {0}")]
  Config(String),

  #[error("could not read configuration: {0}")]
  ConfigSource(#[from] config::ConfigError),

  #[error(transparent)]
  Client(#[from] contrap_client::Error),

  /// A store error, boxed so the orchestrator stays generic over backends.
  /// The class is captured before boxing.
  #[error("store error: {source}")]
  Store {
    class:  ErrorClass,
    #[source]
    source: Box<dyn std::error::Error + Send + Sync>,
  },

  #[error("cache I/O at {path:?}: {source}")]
  Cache {
    path:   PathBuf,
    #[source]
    source: std::io::Error,
  },

  #[error("could not encode run report: {0}")]
  Encode(#[from] serde_json::Error),

  #[error(transparent)]
  Core(#[from] contrap_core::Error),

  #[error("worker task failed: {0}")]
  Join(#[from] tokio::task::JoinError),
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

impl Error {
  pub fn store<E>(e: E) -> Self
  where
    E: std::error::Error + Classify + Send + Sync + 'static,
  {
    Self::Store { class: e.class(), source: Box::new(e) }
  }
}

impl Classify for Error {
  fn class(&self) -> ErrorClass {
    match self {
      Self::Config(_) | Self::ConfigSource(_) | Self::Core(_) => {
        ErrorClass::Configuration
      }
      Self::Client(e) => e.class(),
      Self::Store { class, .. } => *class,
      Self::Cache { .. } | Self::Encode(_) | Self::Join(_) => ErrorClass::Fatal,
    }
  }
}
