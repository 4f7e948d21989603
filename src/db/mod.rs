//! Database module: persisted import state, the import ledger, and SQL repositories.
//!
//! This module is split into two submodules:
//! - `model`: row-level entities returned by repositories.
//! - `repo`: SQL-only functions that map rows into entities.
//!
//! External modules should import from `csv_import::db`; it re-exports the
//! repository API and the ledger entry type for convenience.

pub mod model;
pub mod repo;

pub use repo::*;

pub use model::LedgerEntry;
