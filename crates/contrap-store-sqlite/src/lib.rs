//! SQLite backend for the Contrap procurement store.
//!
//! Wraps [`tokio_rusqlite`] so all database access runs on a dedicated thread
//! without blocking the async runtime. Each batch is written in one
//! transaction together with its ledger mark.

mod encode;
mod ledger;
mod loader;
mod schema;
mod store;

pub mod error;

pub use encode::StoredAward;
pub use error::{Error, Result};
pub use store::SqliteStore;

#[cfg(test)]
mod tests;
