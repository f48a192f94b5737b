//! On-disk cache of raw upstream responses.
//!
//! Pages are cut from the response in order, so a page index only means the
//! same thing across runs if the payload does. A run that dies halfway
//! re-reads the cached body on restart; once every chunk of a unit is
//! complete the entry is dropped so the next run sees fresh data.

use std::{
  io::ErrorKind,
  path::{Path, PathBuf},
  time::Duration,
};

use sha2::{Digest as _, Sha256};

use crate::error::{Error, Result};

/// Hex SHA-256 of `bytes`.
pub fn digest(bytes: &[u8]) -> String { hex::encode(Sha256::digest(bytes)) }

#[derive(Debug, Clone)]
pub struct RawCache {
  dir: PathBuf,
  ttl: Option<Duration>,
}

impl RawCache {
  /// `ttl = None` keeps entries until they are removed.
  pub fn new(dir: impl Into<PathBuf>, ttl: Option<Duration>) -> Self {
    Self { dir: dir.into(), ttl }
  }

  pub fn dir(&self) -> &Path { &self.dir }

  fn path(&self, key: &str) -> PathBuf {
    let name: String = key
      .chars()
      .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '=' { c } else { '_' })
      .collect();
    self.dir.join(format!("{name}.json"))
  }

  fn io_err(path: &Path, source: std::io::Error) -> Error {
    Error::Cache { path: path.to_path_buf(), source }
  }

  /// The cached body, or `None` when absent or expired.
  pub async fn get(&self, key: &str) -> Result<Option<String>> {
    let path = self.path(key);
    let meta = match tokio::fs::metadata(&path).await {
      Ok(meta) => meta,
      Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
      Err(e) => return Err(Self::io_err(&path, e)),
    };
    if let Some(ttl) = self.ttl {
      let age = meta.modified().ok().and_then(|m| m.elapsed().ok());
      if age.is_none_or(|age| age > ttl) {
        return Ok(None);
      }
    }
    match tokio::fs::read_to_string(&path).await {
      Ok(body) => Ok(Some(body)),
      Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
      Err(e) => Err(Self::io_err(&path, e)),
    }
  }

  /// Write through a temporary file so a crash never leaves half a body.
  pub async fn put(&self, key: &str, body: &str) -> Result<()> {
    tokio::fs::create_dir_all(&self.dir)
      .await
      .map_err(|e| Self::io_err(&self.dir, e))?;
    let path = self.path(key);
    let tmp = path.with_extension("json.tmp");
    tokio::fs::write(&tmp, body)
      .await
      .map_err(|e| Self::io_err(&tmp, e))?;
    tokio::fs::rename(&tmp, &path)
      .await
      .map_err(|e| Self::io_err(&path, e))
  }

  pub async fn remove(&self, key: &str) -> Result<()> {
    let path = self.path(key);
    match tokio::fs::remove_file(&path).await {
      Ok(()) => Ok(()),
      Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
      Err(e) => Err(Self::io_err(&path, e)),
    }
  }
}
