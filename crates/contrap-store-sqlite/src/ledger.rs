//! Page and range bookkeeping for resumable runs.
//!
//! Plain functions over a `rusqlite::Connection` so the loader can write the
//! committed mark inside its own transaction.

use contrap_core::ledger::{DateRange, PageKey, Source};
use rusqlite::{Connection, OptionalExtension as _, params};

use crate::encode::{RawFailedPage, encode_date};

struct PageParams {
  source: String,
  start:  String,
  end:    String,
  index:  u32,
}

fn page_params(page: &PageKey) -> PageParams {
  PageParams {
    source: page.source.to_string(),
    start:  encode_date(page.range.start),
    end:    encode_date(page.range.end),
    index:  page.index,
  }
}

pub fn is_committed(conn: &Connection, page: &PageKey) -> rusqlite::Result<bool> {
  let p = page_params(page);
  Ok(
    conn
      .query_row(
        "SELECT 1 FROM page_ledger
         WHERE source = ?1 AND range_start = ?2 AND range_end = ?3
           AND page_index = ?4 AND status = 'committed'",
        params![p.source, p.start, p.end, p.index],
        |_| Ok(true),
      )
      .optional()?
      .unwrap_or(false),
  )
}

pub fn mark_committed(
  conn: &Connection,
  page: &PageKey,
  record_count: usize,
  digest: Option<&str>,
  now: &str,
) -> rusqlite::Result<()> {
  let p = page_params(page);
  conn.execute(
    "INSERT INTO page_ledger (
       source, range_start, range_end, page_index,
       status, record_count, digest, attempts, last_error, updated_at
     ) VALUES (?1, ?2, ?3, ?4, 'committed', ?5, ?6, 1, NULL, ?7)
     ON CONFLICT (source, range_start, range_end, page_index) DO UPDATE SET
       status       = 'committed',
       record_count = excluded.record_count,
       digest       = excluded.digest,
       attempts     = page_ledger.attempts + 1,
       last_error   = NULL,
       updated_at   = excluded.updated_at",
    params![p.source, p.start, p.end, p.index, record_count as i64, digest, now],
  )?;
  Ok(())
}

/// A committed page stays committed; failures after the fact are ignored.
pub fn record_failure(
  conn: &Connection,
  page: &PageKey,
  error: &str,
  now: &str,
) -> rusqlite::Result<()> {
  let p = page_params(page);
  conn.execute(
    "INSERT INTO page_ledger (
       source, range_start, range_end, page_index,
       status, attempts, last_error, updated_at
     ) VALUES (?1, ?2, ?3, ?4, 'failed', 1, ?5, ?6)
     ON CONFLICT (source, range_start, range_end, page_index) DO UPDATE SET
       attempts   = page_ledger.attempts + 1,
       last_error = excluded.last_error,
       updated_at = excluded.updated_at
     WHERE page_ledger.status <> 'committed'",
    params![p.source, p.start, p.end, p.index, error, now],
  )?;
  Ok(())
}

pub fn committed_indices(
  conn: &Connection,
  source: Source,
  range: DateRange,
) -> rusqlite::Result<Vec<u32>> {
  let mut stmt = conn.prepare(
    "SELECT page_index FROM page_ledger
     WHERE source = ?1 AND range_start = ?2 AND range_end = ?3
       AND status = 'committed'
     ORDER BY page_index",
  )?;
  stmt
    .query_map(
      params![source.to_string(), encode_date(range.start), encode_date(range.end)],
      |row| row.get(0),
    )?
    .collect()
}

pub fn is_range_complete(
  conn: &Connection,
  source: Source,
  range: DateRange,
) -> rusqlite::Result<bool> {
  Ok(
    conn
      .query_row(
        "SELECT 1 FROM range_ledger
         WHERE source = ?1 AND range_start = ?2 AND range_end = ?3",
        params![source.to_string(), encode_date(range.start), encode_date(range.end)],
        |_| Ok(true),
      )
      .optional()?
      .unwrap_or(false),
  )
}

pub fn complete_range(
  conn: &Connection,
  source: Source,
  range: DateRange,
  page_count: u32,
  now: &str,
) -> rusqlite::Result<bool> {
  let source = source.to_string();
  let start = encode_date(range.start);
  let end = encode_date(range.end);

  let committed: u32 = conn.query_row(
    "SELECT count(*) FROM page_ledger
     WHERE source = ?1 AND range_start = ?2 AND range_end = ?3
       AND status = 'committed' AND page_index < ?4",
    params![source, start, end, page_count],
    |row| row.get(0),
  )?;
  if committed < page_count {
    return Ok(false);
  }

  conn.execute(
    "INSERT INTO range_ledger (source, range_start, range_end, page_count, completed_at)
     VALUES (?1, ?2, ?3, ?4, ?5)
     ON CONFLICT (source, range_start, range_end) DO UPDATE SET
       page_count   = excluded.page_count,
       completed_at = excluded.completed_at",
    params![source, start, end, page_count, now],
  )?;
  Ok(true)
}

pub fn watermark(conn: &Connection, source: Source) -> rusqlite::Result<Option<String>> {
  conn.query_row(
    "SELECT max(range_end) FROM range_ledger WHERE source = ?1",
    params![source.to_string()],
    |row| row.get(0),
  )
}

pub fn failed_pages(conn: &Connection) -> rusqlite::Result<Vec<RawFailedPage>> {
  let mut stmt = conn.prepare(
    "SELECT source, range_start, range_end, page_index, attempts, last_error, updated_at
     FROM page_ledger
     WHERE status = 'failed'
     ORDER BY source, range_start, page_index",
  )?;
  stmt
    .query_map([], |row| {
      Ok(RawFailedPage {
        source:      row.get(0)?,
        range_start: row.get(1)?,
        range_end:   row.get(2)?,
        page_index:  row.get(3)?,
        attempts:    row.get(4)?,
        last_error:  row.get(5)?,
        updated_at:  row.get(6)?,
      })
    })?
    .collect()
}
