//! Units of work and the identifiers the resumability ledger is keyed by.

use std::fmt;

use chrono::{DateTime, Datelike, Days, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use strum::{AsRefStr, Display, EnumIter, EnumString};

use crate::{Error, Result};

/// An upstream endpoint the pipeline pulls from.
#[derive(
  Debug,
  Clone,
  Copy,
  PartialEq,
  Eq,
  PartialOrd,
  Ord,
  Hash,
  Display,
  EnumString,
  EnumIter,
  AsRefStr,
  Serialize,
  Deserialize,
)]
#[strum(serialize_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum Source {
  Announcements,
  Contracts,
  /// Amendments to concluded contracts.
  Modifications,
  Entities,
}

// ─── Date range ──────────────────────────────────────────────────────────────

/// An inclusive range of calendar days.
#[derive(
  Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct DateRange {
  pub start: NaiveDate,
  pub end:   NaiveDate,
}

impl DateRange {
  pub fn new(start: NaiveDate, end: NaiveDate) -> Result<Self> {
    if start > end {
      return Err(Error::InvalidRange { start, end });
    }
    Ok(Self { start, end })
  }

  /// The full calendar year. Returns `None` for years chrono cannot
  /// represent.
  pub fn year(year: i32) -> Option<Self> {
    let start = NaiveDate::from_ymd_opt(year, 1, 1)?;
    let end = NaiveDate::from_ymd_opt(year, 12, 31)?;
    Some(Self { start, end })
  }

  pub fn contains(&self, date: NaiveDate) -> bool {
    self.start <= date && date <= self.end
  }

  /// Number of days covered, inclusive of both ends.
  pub fn days(&self) -> u64 {
    (self.end - self.start).num_days() as u64 + 1
  }

  /// The same range with its end moved back to `limit` when it lies beyond.
  /// Returns `None` when the whole range lies after `limit`.
  pub fn clamp_end(self, limit: NaiveDate) -> Option<Self> {
    if self.start > limit {
      None
    } else {
      Some(Self { start: self.start, end: self.end.min(limit) })
    }
  }

  /// Split into consecutive chunks of at most `days` days. `0` splits on
  /// calendar-year boundaries instead.
  pub fn chunks(&self, days: u32) -> Vec<Self> {
    let mut out = Vec::new();
    let mut cursor = self.start;
    while cursor <= self.end {
      let chunk_end = if days == 0 {
        NaiveDate::from_ymd_opt(cursor.year(), 12, 31).unwrap_or(self.end)
      } else {
        cursor
          .checked_add_days(Days::new(u64::from(days) - 1))
          .unwrap_or(self.end)
      }
      .min(self.end);
      out.push(Self { start: cursor, end: chunk_end });
      match chunk_end.succ_opt() {
        Some(next) => cursor = next,
        None => break,
      }
    }
    out
  }
}

impl fmt::Display for DateRange {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(f, "{}..{}", self.start, self.end)
  }
}

// ─── Pages ───────────────────────────────────────────────────────────────────

/// Identifies one page of one fetched range. Stable across runs as long as
/// the upstream payload for the range is stable.
#[derive(
  Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct PageKey {
  pub source: Source,
  pub range:  DateRange,
  pub index:  u32,
}

impl fmt::Display for PageKey {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(f, "{}[{}]#{}", self.source, self.range, self.index)
  }
}

/// A page that was attempted and never committed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailedPage {
  pub page:       PageKey,
  pub attempts:   u32,
  pub last_error: String,
  pub updated_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
  use super::*;

  fn d(y: i32, m: u32, day: u32) -> NaiveDate {
    NaiveDate::from_ymd_opt(y, m, day).unwrap()
  }

  #[test]
  fn rejects_inverted_range() {
    assert!(DateRange::new(d(2024, 2, 1), d(2024, 1, 1)).is_err());
    assert!(DateRange::new(d(2024, 1, 1), d(2024, 1, 1)).is_ok());
  }

  #[test]
  fn chunks_by_days() {
    let r = DateRange::new(d(2024, 1, 1), d(2024, 1, 10)).unwrap();
    let chunks = r.chunks(4);
    assert_eq!(chunks.len(), 3);
    assert_eq!(chunks[0], DateRange::new(d(2024, 1, 1), d(2024, 1, 4)).unwrap());
    assert_eq!(chunks[2], DateRange::new(d(2024, 1, 9), d(2024, 1, 10)).unwrap());
    assert_eq!(chunks.iter().map(DateRange::days).sum::<u64>(), r.days());
  }

  #[test]
  fn chunks_by_year() {
    let r = DateRange::new(d(2022, 6, 1), d(2024, 3, 1)).unwrap();
    let chunks = r.chunks(0);
    assert_eq!(chunks.len(), 3);
    assert_eq!(chunks[0].end, d(2022, 12, 31));
    assert_eq!(chunks[1], DateRange::year(2023).unwrap());
    assert_eq!(chunks[2].start, d(2024, 1, 1));
  }

  #[test]
  fn clamp_end() {
    let y = DateRange::year(2026).unwrap();
    assert_eq!(y.clamp_end(d(2026, 3, 1)).unwrap().end, d(2026, 3, 1));
    assert!(y.clamp_end(d(2025, 12, 31)).is_none());
  }

  #[test]
  fn contains_is_inclusive() {
    let r = DateRange::new(d(2024, 2, 1), d(2024, 2, 29)).unwrap();
    assert!(r.contains(d(2024, 2, 1)));
    assert!(r.contains(d(2024, 2, 29)));
    assert!(!r.contains(d(2024, 3, 1)));
  }

  #[test]
  fn source_names() {
    assert_eq!(Source::Announcements.to_string(), "announcements");
    assert_eq!("contracts".parse::<Source>().unwrap(), Source::Contracts);
    assert_eq!("modifications".parse::<Source>().unwrap(), Source::Modifications);
  }
}
