//! Run modes and the work units a run is split into.
//!
//! The upstream filters by year only, so a unit is one `(source, year)`
//! fetch. Its window is cut into chunks, each of which is paged and
//! ledgered on its own.

use std::fmt;

use chrono::{Datelike as _, NaiveDate};
use contrap_core::{
  entity::TaxId,
  ledger::{DateRange, Source},
};

use crate::error::{Error, Result};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Mode {
  /// From the day after the last completed range to yesterday.
  Incremental,
  /// One calendar year, clamped to yesterday.
  Year(i32),
  /// Whole years, inclusive of both ends.
  Historical { start: i32, end: i32 },
  /// Fetch and enrich a single organization.
  Entity(TaxId),
}

impl fmt::Display for Mode {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    match self {
      Self::Incremental => f.write_str("incremental"),
      Self::Year(y) => write!(f, "year {y}"),
      Self::Historical { start, end } => write!(f, "historical {start}..{end}"),
      Self::Entity(tax_id) => write!(f, "entity {tax_id}"),
    }
  }
}

fn year_range(year: i32) -> Result<DateRange> {
  DateRange::year(year).ok_or_else(|| Error::Config(format!("year {year} is out of range")))
}

/// The dates one source should cover, or `None` when there is nothing to
/// fetch. `watermark` is the latest completed range end for the source.
pub fn window(
  mode: &Mode,
  yesterday: NaiveDate,
  watermark: Option<NaiveDate>,
  since: Option<NaiveDate>,
) -> Result<Option<DateRange>> {
  let range = match mode {
    Mode::Incremental => {
      let start = match (watermark, since) {
        (Some(w), _) => match w.succ_opt() {
          Some(next) => next,
          None => return Ok(None),
        },
        (None, Some(since)) => since,
        (None, None) => year_range(yesterday.year())?.start,
      };
      if start > yesterday {
        return Ok(None);
      }
      DateRange::new(start, yesterday)?
    }
    Mode::Year(year) => year_range(*year)?,
    Mode::Historical { start, end } => {
      if start > end {
        return Err(Error::Config(format!(
          "historical range starts after it ends: {start} > {end}"
        )));
      }
      DateRange::new(year_range(*start)?.start, year_range(*end)?.end)?
    }
    Mode::Entity(_) => return Ok(None),
  };
  Ok(range.clamp_end(yesterday))
}

// ─── Work units ──────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkUnit {
  pub source: Source,
  pub year:   i32,
  /// Never empty; consecutive and inside `year`.
  pub chunks: Vec<DateRange>,
}

impl WorkUnit {
  /// The chunk a record belongs to. Records dated inside the fetched year
  /// go to the chunk containing their date, or nowhere when the date lies
  /// outside the window. Undated records, and records dated in another
  /// year, go to the first chunk so they are not lost.
  pub fn place(&self, date: Option<NaiveDate>) -> Option<usize> {
    match date {
      Some(d) if d.year() == self.year => self.chunks.iter().position(|c| c.contains(d)),
      _ => Some(0),
    }
  }
}

/// One unit per calendar year in `window`, each cut into chunks of
/// `chunk_days` days (`0` keeps the year whole).
pub fn split(source: Source, window: DateRange, chunk_days: u32) -> Vec<WorkUnit> {
  window
    .chunks(0)
    .into_iter()
    .map(|year| WorkUnit {
      source,
      year: year.start.year(),
      chunks: year.chunks(chunk_days),
    })
    .collect()
}
