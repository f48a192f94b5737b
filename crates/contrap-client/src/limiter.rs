//! Process-wide request rate limiting.
//!
//! A single task owns the token bucket. Everything else holds a cheap
//! [`RateLimiter`] handle and asks for permits over a channel, so every clone
//! of a client draws from the same budget without sharing the bucket itself.

use std::num::NonZeroU32;

use governor::Quota;
use tokio::sync::{mpsc, oneshot};

use crate::error::{Error, Result};

/// Outstanding permit requests the actor will buffer before `acquire`
/// starts waiting for queue space.
const QUEUE_DEPTH: usize = 256;

#[derive(Debug, Clone)]
pub struct RateLimiter {
  tx: mpsc::Sender<oneshot::Sender<()>>,
}

impl RateLimiter {
  /// Spawn the bucket task on the current runtime. It exits once every
  /// handle is dropped.
  pub fn spawn(per_second: NonZeroU32) -> Self {
    let (tx, mut rx) = mpsc::channel::<oneshot::Sender<()>>(QUEUE_DEPTH);
    tokio::spawn(async move {
      let bucket = governor::RateLimiter::direct(Quota::per_second(per_second));
      while let Some(waiter) = rx.recv().await {
        // The requester gave up (cancelled or timed out); keep the token.
        if waiter.is_closed() {
          continue;
        }
        bucket.until_ready().await;
        let _ = waiter.send(());
      }
    });
    Self { tx }
  }

  /// Wait for one request slot.
  pub async fn acquire(&self) -> Result<()> {
    let (tx, rx) = oneshot::channel();
    self.tx.send(tx).await.map_err(|_| Error::LimiterClosed)?;
    rx.await.map_err(|_| Error::LimiterClosed)
  }
}
