//! Pipeline orchestrator for the Contrap procurement ETL.
//!
//! Ties the [`contrap_client`] fetcher, the [`contrap_normalize`] stages and
//! a [`ProcurementStore`](contrap_core::store::ProcurementStore) together:
//! plans work from a [`Mode`], runs it on a bounded worker pool, and reports
//! a [`RunSummary`]. Resumable: pages and ranges already committed are
//! skipped on the next run.

pub mod cache;
pub mod config;
pub mod error;
pub mod orchestrator;
pub mod plan;
pub mod report;
pub mod summary;

pub use cache::RawCache;
pub use crate::config::EtlConfig;
pub use error::{Error, Result};
pub use orchestrator::{Pipeline, Settings};
pub use plan::Mode;
pub use summary::{RunStatus, RunSummary};
