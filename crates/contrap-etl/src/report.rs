//! Files a run leaves behind under the cache directory: the summary as
//! pretty JSON, and the records that produced warnings as JSON lines.

use std::path::{Path, PathBuf};

use crate::{
  error::{Error, Result},
  summary::RunSummary,
};

/// Subdirectory of the cache directory that holds run reports.
pub const REPORT_DIR: &str = "reports";

fn io_err(path: &Path) -> impl FnOnce(std::io::Error) -> Error + '_ {
  move |source| Error::Cache { path: path.to_path_buf(), source }
}

pub fn summary_path(dir: &Path, summary: &RunSummary) -> PathBuf {
  dir.join(format!("run-{}.json", summary.run_id))
}

pub fn invalid_path(dir: &Path, summary: &RunSummary) -> PathBuf {
  dir.join(format!("invalid-{}.jsonl", summary.run_id))
}

/// Write both files into `dir`, creating it if needed. The invalid-records
/// file is only written when there is something in it. Returns the summary
/// path.
pub async fn write(dir: &Path, summary: &RunSummary) -> Result<PathBuf> {
  tokio::fs::create_dir_all(dir).await.map_err(io_err(dir))?;

  let path = summary_path(dir, summary);
  let body = serde_json::to_vec_pretty(summary)?;
  tokio::fs::write(&path, body).await.map_err(io_err(&path))?;

  if !summary.tally.invalid.is_empty() {
    let mut lines = String::new();
    for record in &summary.tally.invalid {
      lines.push_str(&serde_json::to_string(record)?);
      lines.push('\n');
    }
    let invalid = invalid_path(dir, summary);
    tokio::fs::write(&invalid, lines).await.map_err(io_err(&invalid))?;
  }
  Ok(path)
}
