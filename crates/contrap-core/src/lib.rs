//! Core types and trait definitions for the Contrap procurement pipeline.
//!
//! This crate is deliberately free of HTTP and database dependencies.
//! The normalizer, client, store and orchestrator crates all depend on it.

// We intentionally use native `async fn` in traits (stabilised in Rust 1.75).
#![allow(async_fn_in_trait)]

pub mod entity;
pub mod error;
pub mod fragment;
pub mod ledger;
pub mod procurement;
pub mod store;
pub mod warning;

pub use error::{Classify, Error, ErrorClass, Result};
