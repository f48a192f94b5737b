//! Per-attempt notifications. The client does not log; whoever holds the
//! receiving end decides what to do with these.

use std::time::Duration;

use contrap_core::ledger::Source;

#[derive(Debug, Clone, PartialEq)]
pub enum AttemptOutcome {
  Success { records: usize },
  /// Failed, another attempt follows after `delay`.
  Retrying { error: String, delay: Duration },
  /// Failed, no further attempts.
  Failed { error: String },
}

#[derive(Debug, Clone, PartialEq)]
pub struct FetchEvent {
  pub source:  Source,
  /// 1-based.
  pub attempt: u32,
  pub elapsed: Duration,
  pub outcome: AttemptOutcome,
}
