//! Retry budgets.

use std::time::Duration;

use backon::{BackoffBuilder, ExponentialBuilder};

/// How hard a single fetch tries before giving up.
#[derive(Debug, Clone, PartialEq)]
pub struct FetchBudget {
  pub max_attempts:    u32,
  /// Upper bound on one attempt. Further capped by the time left before
  /// `deadline`.
  pub attempt_timeout: Duration,
  pub base_delay:      Duration,
  pub max_delay:       Duration,
  pub multiplier:      f32,
  /// Total wall-clock budget across every attempt and sleep.
  pub deadline:        Duration,
}

impl FetchBudget {
  /// Three attempts, 2s doubling to at most 60s, 120s per attempt.
  pub fn standard() -> Self {
    Self {
      max_attempts:    3,
      attempt_timeout: Duration::from_secs(120),
      base_delay:      Duration::from_secs(2),
      max_delay:       Duration::from_secs(60),
      multiplier:      2.0,
      deadline:        Duration::from_secs(10 * 60),
    }
  }

  /// For year-sized payloads the upstream takes minutes to render: five
  /// attempts, 10s doubling to at most 300s, 600s per attempt, one hour in
  /// total.
  pub fn slow_upstream() -> Self {
    Self {
      max_attempts:    5,
      attempt_timeout: Duration::from_secs(600),
      base_delay:      Duration::from_secs(10),
      max_delay:       Duration::from_secs(300),
      multiplier:      2.0,
      deadline:        Duration::from_secs(60 * 60),
    }
  }

  /// Sleeps between consecutive attempts:
  /// `min(base_delay * multiplier^n, max_delay)` for `n = 0..max_attempts-1`.
  pub fn delays(&self) -> impl Iterator<Item = Duration> + use<> {
    ExponentialBuilder::default()
      .with_min_delay(self.base_delay)
      .with_max_delay(self.max_delay)
      .with_factor(self.multiplier)
      .with_max_times(self.max_attempts.saturating_sub(1) as usize)
      .build()
  }
}

impl Default for FetchBudget {
  fn default() -> Self { Self::standard() }
}
