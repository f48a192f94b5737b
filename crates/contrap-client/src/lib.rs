//! HTTP client for the public procurement API.
//!
//! Every request passes through one shared token bucket
//! ([`limiter::RateLimiter`]) and is retried with exponential backoff on
//! timeouts, connection failures, HTTP 429 and 5xx, all within a
//! [`FetchBudget`]. The HTTP layer sits behind the [`Transport`] trait so the
//! retry logic can be exercised without a network.
//!
//! The client never logs. Callers that want per-attempt visibility pass a
//! channel to [`Client::with_events`].

#![allow(async_fn_in_trait)]

mod budget;
mod client;
mod event;
pub mod limiter;
mod transport;

pub mod error;

pub use budget::FetchBudget;
pub use client::{
  Client, ClientConfig, DEFAULT_BASE_URL, FetchRequest, RawPage, TOKEN_HEADER,
  decode_body, endpoint,
};
pub use error::{Error, Result};
pub use event::{AttemptOutcome, FetchEvent};
pub use transport::{
  HttpTransport, Transport, TransportError, TransportRequest, TransportResponse,
};
